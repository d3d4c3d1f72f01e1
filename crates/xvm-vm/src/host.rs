//! Host-side view of a running instance.

use crate::error::TrapKind;
use crate::gas_metering::GasTracker;
use crate::vm_manager::VmCore;
use std::sync::Arc;

/// Bounds-checked view of guest linear memory.
pub struct GuestMemory<'a> {
    data: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, ptr: u32, len: u32) -> Result<std::ops::Range<usize>, TrapKind> {
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(TrapKind::MemoryOutOfBounds)?;
        if end > self.data.len() {
            return Err(TrapKind::MemoryOutOfBounds);
        }
        Ok(start..end)
    }

    pub fn read(&self, ptr: u32, len: u32) -> Result<&[u8], TrapKind> {
        let range = self.range(ptr, len)?;
        Ok(&self.data[range])
    }

    pub fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), TrapKind> {
        let len = u32::try_from(bytes.len()).map_err(|_| TrapKind::MemoryOutOfBounds)?;
        let range = self.range(ptr, len)?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, TrapKind> {
        let bytes = self.read(ptr, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), TrapKind> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn read_u64(&self, ptr: u32) -> Result<u64, TrapKind> {
        let bytes = self.read(ptr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), TrapKind> {
        self.write(ptr, &value.to_le_bytes())
    }

    /// Copy `len` bytes inside guest memory. The ranges may overlap.
    pub fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), TrapKind> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.data.copy_within(from, to.start);
        Ok(())
    }

    pub fn read_str(&self, ptr: u32, len: u32) -> Result<&str, TrapKind> {
        std::str::from_utf8(self.read(ptr, len)?)
            .map_err(|_| TrapKind::Host("invalid utf-8 string".to_string()))
    }
}

/// Response produced by the last `call_method`, waiting for
/// `fetch_response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResponse {
    pub ok: bool,
    pub body: Vec<u8>,
}

/// User data carried in every engine store.
pub struct HostState {
    /// Call-id of the context this instance serves
    pub ctxid: u64,
    pub core: Arc<VmCore>,
    pub gas: GasTracker,
    pending: Option<PendingResponse>,
    trap: Option<TrapKind>,
}

impl HostState {
    pub fn new(ctxid: u64, core: Arc<VmCore>, gas: GasTracker) -> Self {
        Self {
            ctxid,
            core,
            gas,
            pending: None,
            trap: None,
        }
    }

    pub fn set_pending(&mut self, ok: bool, body: Vec<u8>) -> usize {
        let len = body.len();
        self.pending = Some(PendingResponse { ok, body });
        len
    }

    pub fn take_pending(&mut self) -> Option<PendingResponse> {
        self.pending.take()
    }

    /// Remember why a host function aborted the guest. The engine error
    /// that follows carries only a message.
    pub fn record_trap(&mut self, trap: TrapKind) {
        if self.trap.is_none() {
            self.trap = Some(trap);
        }
    }

    pub fn take_trap(&mut self) -> Option<TrapKind> {
        self.trap.take()
    }
}

/// Arguments handed to a host function.
pub struct HostEnv<'a> {
    pub memory: GuestMemory<'a>,
    pub state: &'a mut HostState,
    /// Instruction fuel consumed so far by this instance
    pub fuel_used: u64,
}
