//! Syscall catalogue and service.
//!
//! Guest code names a syscall by string and passes a Borsh-encoded request.
//! The name selects a [`SyscallRequest`] variant, the request is stamped
//! with the caller's call-id and handled against that call's context.

use crate::bridge::Context;
use crate::chain::{BlockInfo, TxInfo};
use crate::error::TrapKind;
use crate::gas_metering::GasTracker;
use crate::host::HostState;
use crate::vm_manager::VmCore;
use borsh::{BorshDeserialize, BorshSerialize};
use std::sync::Arc;
use xvm_types::Response;

pub const DEFAULT_ITERATOR_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub ctxid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct ArgPair {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct PingResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct PutObjectRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct PutObjectResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct GetObjectRequest {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct GetObjectResponse {
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct DeleteObjectRequest {
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct DeleteObjectResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct IteratorRequest {
    pub start: Vec<u8>,
    /// Exclusive upper bound, empty for open-ended
    pub limit: Vec<u8>,
    /// Maximum items, `<= 0` for the default
    pub cap: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct IteratorItem {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct IteratorResponse {
    pub items: Vec<IteratorItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct ContractCallRequest {
    pub module: String,
    pub contract: String,
    pub method: String,
    pub args: Vec<ArgPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct ContractCallResponse {
    pub response: Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct QueryBlockRequest {
    pub blockid: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct QueryBlockResponse {
    pub block: BlockInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct QueryTxRequest {
    pub txid: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct QueryTxResponse {
    pub tx: TxInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct GetCallArgsRequest {}

/// Method, arguments sorted by key, initiator and required authorizers.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct CallArgs {
    pub method: String,
    pub args: Vec<ArgPair>,
    pub initiator: String,
    pub auth_require: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct SetOutputRequest {
    pub response: Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct SetOutputResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct PostLogRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct PostLogResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct EmitEventRequest {
    pub name: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct EmitEventResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct GetAccountAddressesRequest {
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct GetAccountAddressesResponse {
    pub addresses: Vec<String>,
}

/// Every request the guest can make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallRequest {
    Ping(PingRequest),
    PutObject(PutObjectRequest),
    GetObject(GetObjectRequest),
    DeleteObject(DeleteObjectRequest),
    NewIterator(IteratorRequest),
    ContractCall(ContractCallRequest),
    QueryBlock(QueryBlockRequest),
    QueryTx(QueryTxRequest),
    GetCallArgs(GetCallArgsRequest),
    SetOutput(SetOutputRequest),
    PostLog(PostLogRequest),
    EmitEvent(EmitEventRequest),
    GetAccountAddresses(GetAccountAddressesRequest),
}

fn decode_body<T: BorshDeserialize>(method: &str, body: &[u8]) -> Result<T, String> {
    borsh::from_slice(body).map_err(|e| format!("bad {} request: {}", method, e))
}

impl SyscallRequest {
    /// Decode the request named by `method`.
    pub fn decode(method: &str, body: &[u8]) -> Result<Self, String> {
        let request = match method {
            "Ping" => SyscallRequest::Ping(decode_body(method, body)?),
            "PutObject" => SyscallRequest::PutObject(decode_body(method, body)?),
            "GetObject" => SyscallRequest::GetObject(decode_body(method, body)?),
            "DeleteObject" => SyscallRequest::DeleteObject(decode_body(method, body)?),
            "NewIterator" => SyscallRequest::NewIterator(decode_body(method, body)?),
            "ContractCall" => SyscallRequest::ContractCall(decode_body(method, body)?),
            "QueryBlock" => SyscallRequest::QueryBlock(decode_body(method, body)?),
            "QueryTx" => SyscallRequest::QueryTx(decode_body(method, body)?),
            "GetCallArgs" => SyscallRequest::GetCallArgs(decode_body(method, body)?),
            "SetOutput" => SyscallRequest::SetOutput(decode_body(method, body)?),
            "PostLog" => SyscallRequest::PostLog(decode_body(method, body)?),
            "EmitEvent" => SyscallRequest::EmitEvent(decode_body(method, body)?),
            "GetAccountAddresses" => {
                SyscallRequest::GetAccountAddresses(decode_body(method, body)?)
            }
            other => return Err(format!("method {} not found", other)),
        };
        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            SyscallRequest::Ping(_) => "Ping",
            SyscallRequest::PutObject(_) => "PutObject",
            SyscallRequest::GetObject(_) => "GetObject",
            SyscallRequest::DeleteObject(_) => "DeleteObject",
            SyscallRequest::NewIterator(_) => "NewIterator",
            SyscallRequest::ContractCall(_) => "ContractCall",
            SyscallRequest::QueryBlock(_) => "QueryBlock",
            SyscallRequest::QueryTx(_) => "QueryTx",
            SyscallRequest::GetCallArgs(_) => "GetCallArgs",
            SyscallRequest::SetOutput(_) => "SetOutput",
            SyscallRequest::PostLog(_) => "PostLog",
            SyscallRequest::EmitEvent(_) => "EmitEvent",
            SyscallRequest::GetAccountAddresses(_) => "GetAccountAddresses",
        }
    }
}

/// A request stamped with the caller's call-id.
#[derive(Debug, Clone)]
pub struct Syscall {
    pub header: RequestHeader,
    pub request: SyscallRequest,
}

/// Why a syscall did not produce a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    /// Reported to the guest as an error response
    Failed(String),
    /// Aborts the guest
    Trap(TrapKind),
}

impl From<TrapKind> for SyscallError {
    fn from(t: TrapKind) -> Self {
        SyscallError::Trap(t)
    }
}

fn encode<T: BorshSerialize>(resp: &T) -> Result<Vec<u8>, SyscallError> {
    borsh::to_vec(resp).map_err(|e| SyscallError::Failed(e.to_string()))
}

/// Entry point used by `call_method`.
pub fn call(
    state: &mut HostState,
    fuel_used: u64,
    method: &str,
    body: &[u8],
) -> Result<Vec<u8>, SyscallError> {
    state.gas.charge_syscall(fuel_used)?;

    let request = SyscallRequest::decode(method, body).map_err(SyscallError::Failed)?;
    let syscall = Syscall {
        header: RequestHeader { ctxid: state.ctxid },
        request,
    };

    let core = state.core.clone();
    let ctx = core
        .contexts()
        .lookup(syscall.header.ctxid)
        .ok_or_else(|| {
            SyscallError::Failed(format!("context {} not found", syscall.header.ctxid))
        })?;

    let mut service = SyscallService {
        core: &core,
        ctx: &ctx,
        gas: &mut state.gas,
        fuel_used,
    };
    service.handle(syscall.request)
}

/// Executes syscalls for one context.
pub struct SyscallService<'a> {
    core: &'a Arc<VmCore>,
    ctx: &'a Context,
    gas: &'a mut GasTracker,
    fuel_used: u64,
}

impl SyscallService<'_> {
    pub fn handle(&mut self, request: SyscallRequest) -> Result<Vec<u8>, SyscallError> {
        tracing::trace!(ctxid = self.ctx.id, method = request.method(), "syscall");
        match request {
            SyscallRequest::Ping(_) => encode(&PingResponse {}),
            SyscallRequest::PutObject(req) => self.put_object(req),
            SyscallRequest::GetObject(req) => self.get_object(req),
            SyscallRequest::DeleteObject(req) => self.delete_object(req),
            SyscallRequest::NewIterator(req) => self.new_iterator(req),
            SyscallRequest::ContractCall(req) => self.contract_call(req),
            SyscallRequest::QueryBlock(req) => self.query_block(req),
            SyscallRequest::QueryTx(req) => self.query_tx(req),
            SyscallRequest::GetCallArgs(_) => self.get_call_args(),
            SyscallRequest::SetOutput(req) => {
                self.ctx.set_output(req.response);
                encode(&SetOutputResponse {})
            }
            SyscallRequest::PostLog(req) => self.post_log(req),
            SyscallRequest::EmitEvent(req) => {
                self.gas.charge_log(req.body.len(), self.fuel_used)?;
                self.ctx.emit_event(req.name, req.body);
                encode(&EmitEventResponse {})
            }
            SyscallRequest::GetAccountAddresses(req) => encode(&GetAccountAddressesResponse {
                addresses: self.core.chain().account_addresses(&req.account),
            }),
        }
    }

    fn bucket(&self) -> &str {
        &self.ctx.contract_name
    }

    fn put_object(&mut self, req: PutObjectRequest) -> Result<Vec<u8>, SyscallError> {
        self.gas
            .charge_storage_write(req.key.len() + req.value.len(), self.fuel_used)?;
        if req.key.is_empty() {
            return Err(SyscallError::Failed("empty key".to_string()));
        }

        self.ctx.state.put(self.bucket(), &req.key, &req.value);

        let used = self.ctx.state.disk_usage();
        if used > self.ctx.limits.disk {
            return Err(SyscallError::Failed(format!(
                "disk limit exceeded: {} > {}",
                used, self.ctx.limits.disk
            )));
        }
        encode(&PutObjectResponse {})
    }

    fn get_object(&mut self, req: GetObjectRequest) -> Result<Vec<u8>, SyscallError> {
        let value = self
            .ctx
            .state
            .get(self.bucket(), &req.key)
            .map_err(|e| SyscallError::Failed(e.to_string()))?;
        self.gas.charge_storage_read(
            value.as_ref().map_or(0, Vec::len),
            self.fuel_used,
        )?;
        match value {
            Some(value) => encode(&GetObjectResponse { value }),
            None => Err(SyscallError::Failed("key not found".to_string())),
        }
    }

    fn delete_object(&mut self, req: DeleteObjectRequest) -> Result<Vec<u8>, SyscallError> {
        self.gas.charge_storage_write(req.key.len(), self.fuel_used)?;
        self.ctx.state.delete(self.bucket(), &req.key);
        encode(&DeleteObjectResponse {})
    }

    fn new_iterator(&mut self, req: IteratorRequest) -> Result<Vec<u8>, SyscallError> {
        let cap = if req.cap <= 0 {
            DEFAULT_ITERATOR_CAP
        } else {
            req.cap as usize
        };
        let entries = self
            .ctx
            .state
            .scan(self.bucket(), &req.start, &req.limit)
            .map_err(|e| SyscallError::Failed(e.to_string()))?;

        let items: Vec<IteratorItem> = entries
            .into_iter()
            .take(cap)
            .map(|(key, value)| IteratorItem { key, value })
            .collect();
        self.gas.charge_iterator(items.len(), self.fuel_used)?;
        encode(&IteratorResponse { items })
    }

    fn contract_call(&mut self, req: ContractCallRequest) -> Result<Vec<u8>, SyscallError> {
        self.gas.charge_contract_call(self.fuel_used)?;
        let budget = self.gas.remaining(self.fuel_used);

        let before = self.ctx.sub_usage().cpu;
        let result = self.core.contract_call(self.ctx, budget, req);
        let spent = self.ctx.sub_usage().cpu.saturating_sub(before);
        self.gas.charge_child(spent, self.fuel_used)?;

        let response = result.map_err(|e| SyscallError::Failed(e.to_string()))?;
        encode(&ContractCallResponse { response })
    }

    fn query_block(&mut self, req: QueryBlockRequest) -> Result<Vec<u8>, SyscallError> {
        match self.core.chain().query_block(&req.blockid) {
            Some(block) => encode(&QueryBlockResponse { block }),
            None => Err(SyscallError::Failed(format!(
                "block {} not found",
                hex::encode(&req.blockid)
            ))),
        }
    }

    fn query_tx(&mut self, req: QueryTxRequest) -> Result<Vec<u8>, SyscallError> {
        match self.core.chain().query_tx(&req.txid) {
            Some(tx) => encode(&QueryTxResponse { tx }),
            None => Err(SyscallError::Failed(format!(
                "tx {} not found",
                hex::encode(&req.txid)
            ))),
        }
    }

    fn get_call_args(&mut self) -> Result<Vec<u8>, SyscallError> {
        // BTreeMap iteration is already key-ordered
        let args = self
            .ctx
            .args
            .iter()
            .map(|(key, value)| ArgPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        encode(&CallArgs {
            method: self.ctx.method.clone(),
            args,
            initiator: self.ctx.initiator.clone(),
            auth_require: self.ctx.auth_require.clone(),
        })
    }

    fn post_log(&mut self, req: PostLogRequest) -> Result<Vec<u8>, SyscallError> {
        self.gas.charge_log(req.entry.len(), self.fuel_used)?;
        tracing::info!(
            target: "xvm::contract",
            contract = %self.ctx.contract_name,
            ctxid = self.ctx.id,
            "{}",
            req.entry
        );
        self.ctx.post_log(req.entry);
        encode(&PostLogResponse {})
    }
}
