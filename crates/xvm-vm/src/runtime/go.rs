//! The `go` imports emitted by the Go WebAssembly port.
//!
//! Go passes every argument on its own stack: a single `sp` parameter
//! points at the frame, and arguments start at `sp + 8` in 8 byte slots.
//! Clocks read zero and random data is all zeros so every node sees the
//! same run.

use crate::error::TrapKind;
use crate::host::HostEnv;
use crate::resolver::{HostFunc, MapResolver};

/// Go releases before 1.21 import from `go`, later ones from `gojs`.
const MODULES: [&str; 2] = ["go", "gojs"];

pub fn resolver() -> MapResolver {
    MODULES.iter().fold(MapResolver::new(), |r, module| {
        r.with_func(module, "runtime.wasmExit", HostFunc::unit(1, wasm_exit))
            .with_func(module, "runtime.wasmWrite", HostFunc::unit(1, wasm_write))
            .with_func(module, "runtime.resetMemoryDataView", HostFunc::unit(1, nothing))
            .with_func(module, "runtime.nanotime", HostFunc::unit(1, nanotime))
            .with_func(module, "runtime.nanotime1", HostFunc::unit(1, nanotime))
            .with_func(module, "runtime.walltime", HostFunc::unit(1, walltime))
            .with_func(module, "runtime.walltime1", HostFunc::unit(1, walltime))
            .with_func(module, "runtime.scheduleTimeoutEvent", HostFunc::unit(1, timeout))
            .with_func(module, "runtime.clearTimeoutEvent", HostFunc::unit(1, nothing))
            .with_func(module, "runtime.getRandomData", HostFunc::unit(1, random_data))
            .with_func(module, "debug", HostFunc::unit(1, nothing))
    })
}

fn arg(sp: u32, slot: u32) -> u32 {
    sp.wrapping_add(8 + slot * 8)
}

fn pointer(value: u64) -> Result<u32, TrapKind> {
    u32::try_from(value).map_err(|_| TrapKind::MemoryOutOfBounds)
}

fn nothing(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Ok(0)
}

/// `wasmExit(code int32)`. A clean exit returns to the entry point.
fn wasm_exit(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let code = env.memory.read_u32(arg(args[0], 0))? as i32;
    if code != 0 {
        return Err(TrapKind::Host(format!("exit code {}", code)));
    }
    Ok(0)
}

/// `wasmWrite(fd uintptr, p unsafe.Pointer, n int32)`
fn wasm_write(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let sp = args[0];
    let fd = env.memory.read_u64(arg(sp, 0))?;
    let p = pointer(env.memory.read_u64(arg(sp, 1))?)?;
    let n = env.memory.read_u32(arg(sp, 2))?;
    let text = String::from_utf8_lossy(env.memory.read(p, n)?);
    tracing::debug!(target: "xvm::contract", ctxid = env.state.ctxid, fd, "{}", text);
    Ok(0)
}

/// `nanotime() int64`
fn nanotime(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    env.memory.write_u64(arg(args[0], 0), 0)?;
    Ok(0)
}

/// `walltime() (sec int64, nsec int32)`
fn walltime(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    env.memory.write_u64(arg(args[0], 0), 0)?;
    env.memory.write_u32(arg(args[0], 1), 0)?;
    Ok(0)
}

fn timeout(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
    Err(TrapKind::Host("timers are not supported".to_string()))
}

/// `getRandomData(r []byte)`
fn random_data(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let ptr = pointer(env.memory.read_u64(arg(args[0], 0))?)?;
    let len = pointer(env.memory.read_u64(arg(args[0], 1))?)?;
    env.memory.write(ptr, &vec![0u8; len as usize])?;
    Ok(0)
}
