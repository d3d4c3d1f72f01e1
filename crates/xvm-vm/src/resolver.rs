//! Import resolution.
//!
//! Every guest import is looked up by `(module, name)` when the code is
//! loaded. Host functions take `i32` parameters and return at most one
//! `i32`. The engine backends wrap them in their own calling convention.

use crate::error::TrapKind;
use crate::host::HostEnv;
use crate::runtime;
use crate::syscall::{self, SyscallError};
use sha2::Digest as _;
use std::collections::HashMap;
use std::sync::Arc;

pub type HostFn = fn(&mut HostEnv<'_>, &[u32]) -> Result<u32, TrapKind>;

/// What a host function hands back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    /// Exactly one i32
    Value,
    /// One i32 the import may declare away
    Discardable,
    Nothing,
}

impl Returns {
    /// Whether an import declaring `results` results can bind to it.
    pub fn accepts(self, results: usize) -> bool {
        match self {
            Returns::Value => results == 1,
            Returns::Discardable => results <= 1,
            Returns::Nothing => results == 0,
        }
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            Returns::Value => "one i32 result",
            Returns::Discardable => "at most one i32 result",
            Returns::Nothing => "no result",
        }
    }
}

/// A host function with `arity` i32 parameters.
#[derive(Clone, Copy)]
pub struct HostFunc {
    pub arity: usize,
    pub returns: Returns,
    pub call: HostFn,
}

impl HostFunc {
    pub const fn new(arity: usize, call: HostFn) -> Self {
        Self {
            arity,
            returns: Returns::Value,
            call,
        }
    }

    pub const fn discardable(arity: usize, call: HostFn) -> Self {
        Self {
            arity,
            returns: Returns::Discardable,
            call,
        }
    }

    /// The value `call` returns is dropped.
    pub const fn unit(arity: usize, call: HostFn) -> Self {
        Self {
            arity,
            returns: Returns::Nothing,
            call,
        }
    }
}

impl std::fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunc")
            .field("arity", &self.arity)
            .field("returns", &self.returns)
            .finish()
    }
}

pub trait Resolver: Send + Sync {
    fn resolve_func(&self, module: &str, name: &str) -> Option<HostFunc>;

    /// Raw global value. Float globals carry their IEEE bits.
    fn resolve_global(&self, module: &str, name: &str) -> Option<i64>;
}

/// Tries each resolver in order, first match wins.
#[derive(Clone, Default)]
pub struct MultiResolver {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl MultiResolver {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self { resolvers }
    }

    pub fn push(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolvers.push(resolver);
    }
}

impl Resolver for MultiResolver {
    fn resolve_func(&self, module: &str, name: &str) -> Option<HostFunc> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve_func(module, name))
    }

    fn resolve_global(&self, module: &str, name: &str) -> Option<i64> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve_global(module, name))
    }
}

/// Static table of functions and globals.
#[derive(Clone, Default)]
pub struct MapResolver {
    funcs: HashMap<(String, String), HostFunc>,
    globals: HashMap<(String, String), i64>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_func(mut self, module: &str, name: &str, func: HostFunc) -> Self {
        self.funcs
            .insert((module.to_string(), name.to_string()), func);
        self
    }

    pub fn with_global(mut self, module: &str, name: &str, value: i64) -> Self {
        self.globals
            .insert((module.to_string(), name.to_string()), value);
        self
    }

    pub fn with_f64_global(self, module: &str, name: &str, value: f64) -> Self {
        self.with_global(module, name, value.to_bits() as i64)
    }
}

impl Resolver for MapResolver {
    fn resolve_func(&self, module: &str, name: &str) -> Option<HostFunc> {
        self.funcs
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    fn resolve_global(&self, module: &str, name: &str) -> Option<i64> {
        self.globals
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }
}

/// `env.call_method` and `env.fetch_response`.
pub fn syscall_resolver() -> MapResolver {
    MapResolver::new()
        .with_func("env", "call_method", HostFunc::new(4, call_method))
        .with_func("env", "fetch_response", HostFunc::new(2, fetch_response))
}

/// Host helpers that need no context.
pub fn builtin_resolver() -> MapResolver {
    MapResolver::new()
        .with_func("env", "xvm_hash", HostFunc::new(6, xvm_hash))
        .with_func("env", "xvm_encode", HostFunc::new(4, xvm_encode))
        .with_func("env", "xvm_decode", HostFunc::new(4, xvm_decode))
}

/// Resolver chain installed by the engine. Toolchain support comes first
/// so Go and emscripten output links without extra configuration.
pub fn default_resolver() -> MultiResolver {
    MultiResolver::new(vec![
        Arc::new(runtime::go::resolver()),
        Arc::new(runtime::emscripten::resolver()),
        Arc::new(syscall_resolver()),
        Arc::new(builtin_resolver()),
    ])
}

/// `call_method(method_ptr, method_len, req_ptr, req_len) -> resp_len`
fn call_method(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let method = env.memory.read_str(args[0], args[1])?.to_string();
    let request = env.memory.read(args[2], args[3])?.to_vec();

    let (ok, body) = match syscall::call(env.state, env.fuel_used, &method, &request) {
        Ok(body) => (true, body),
        Err(SyscallError::Failed(msg)) => {
            tracing::debug!(ctxid = env.state.ctxid, %method, error = %msg, "syscall failed");
            (false, msg.into_bytes())
        }
        Err(SyscallError::Trap(trap)) => return Err(trap),
    };

    pending_len(env, ok, body)
}

/// `fetch_response(buf_ptr, buf_len) -> 1 on success, 0 on error response`
fn fetch_response(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let pending = env
        .state
        .take_pending()
        .ok_or_else(|| TrapKind::Host("no pending response".to_string()))?;
    if pending.body.len() != args[1] as usize {
        return Err(TrapKind::Host(format!(
            "response length mismatch: {} != {}",
            args[1],
            pending.body.len()
        )));
    }
    env.memory.write(args[0], &pending.body)?;
    Ok(u32::from(pending.ok))
}

/// `xvm_hash(name_ptr, name_len, in_ptr, in_len, out_ptr, out_len) -> 0`
fn xvm_hash(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let name = env.memory.read_str(args[0], args[1])?.to_string();
    let input = env.memory.read(args[2], args[3])?.to_vec();
    env.state.gas.charge_hash(input.len(), env.fuel_used)?;

    let digest: [u8; 32] = match name.as_str() {
        "blake3" => *blake3::hash(&input).as_bytes(),
        "sha256" => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&sha2::Sha256::digest(&input));
            out
        }
        other => return Err(TrapKind::Host(format!("unknown hash {}", other))),
    };
    if args[5] as usize != digest.len() {
        return Err(TrapKind::Host(format!(
            "hash output must be {} bytes, got {}",
            digest.len(),
            args[5]
        )));
    }
    env.memory.write(args[4], &digest)?;
    Ok(0)
}

/// `xvm_encode(name_ptr, name_len, in_ptr, in_len) -> out_len`
///
/// The encoded bytes become the pending response, read back with
/// `fetch_response`.
fn xvm_encode(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let codec = env.memory.read_str(args[0], args[1])?.to_string();
    let input = env.memory.read(args[2], args[3])?.to_vec();
    env.state.gas.charge_hash(input.len(), env.fuel_used)?;

    let body = match codec.as_str() {
        "hex" => hex::encode(&input).into_bytes(),
        other => return Err(TrapKind::Host(format!("unknown codec {}", other))),
    };
    pending_len(env, true, body)
}

/// `xvm_decode(name_ptr, name_len, in_ptr, in_len) -> out_len`
///
/// Malformed input leaves an error response, `fetch_response` returns 0.
fn xvm_decode(env: &mut HostEnv<'_>, args: &[u32]) -> Result<u32, TrapKind> {
    let codec = env.memory.read_str(args[0], args[1])?.to_string();
    let input = env.memory.read(args[2], args[3])?.to_vec();
    env.state.gas.charge_hash(input.len(), env.fuel_used)?;

    let (ok, body) = match codec.as_str() {
        "hex" => match hex::decode(&input) {
            Ok(bytes) => (true, bytes),
            Err(e) => (false, e.to_string().into_bytes()),
        },
        other => return Err(TrapKind::Host(format!("unknown codec {}", other))),
    };
    pending_len(env, ok, body)
}

fn pending_len(env: &mut HostEnv<'_>, ok: bool, body: Vec<u8>) -> Result<u32, TrapKind> {
    let len = env.state.set_pending(ok, body);
    u32::try_from(len).map_err(|_| TrapKind::Host("response too large".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_env: &mut HostEnv<'_>, _args: &[u32]) -> Result<u32, TrapKind> {
        Ok(7)
    }

    #[test]
    fn test_default_resolver_surface() {
        let r = default_resolver();
        assert_eq!(r.resolve_func("env", "call_method").unwrap().arity, 4);
        assert_eq!(r.resolve_func("env", "fetch_response").unwrap().arity, 2);
        assert_eq!(r.resolve_func("env", "xvm_hash").unwrap().arity, 6);
        assert_eq!(r.resolve_func("env", "xvm_encode").unwrap().arity, 4);
        assert_eq!(r.resolve_func("env", "xvm_decode").unwrap().arity, 4);
        assert_eq!(
            r.resolve_func("env", "abortStackOverflow").unwrap().returns,
            Returns::Discardable
        );
        assert_eq!(
            r.resolve_func("go", "runtime.wasmWrite").unwrap().returns,
            Returns::Nothing
        );
        assert_eq!(r.resolve_global("env", "DYNAMICTOP_PTR"), Some(924));
        assert!(r.resolve_func("env", "missing").is_none());
        assert!(r.resolve_func("wasi", "call_method").is_none());
    }

    #[test]
    fn test_multi_resolver_first_match_wins() {
        let first = MapResolver::new()
            .with_func("env", "f", HostFunc::new(1, nop))
            .with_global("env", "g", 1);
        let second = MapResolver::new()
            .with_func("env", "f", HostFunc::new(3, nop))
            .with_global("env", "g", 2)
            .with_global("env", "h", 3);
        let multi = MultiResolver::new(vec![Arc::new(first), Arc::new(second)]);

        assert_eq!(multi.resolve_func("env", "f").unwrap().arity, 1);
        assert_eq!(multi.resolve_global("env", "g"), Some(1));
        assert_eq!(multi.resolve_global("env", "h"), Some(3));
        assert_eq!(multi.resolve_global("env", "nope"), None);
    }

    #[test]
    fn test_returns_accepts() {
        assert!(Returns::Value.accepts(1));
        assert!(!Returns::Value.accepts(0));
        assert!(Returns::Discardable.accepts(0));
        assert!(Returns::Discardable.accepts(1));
        assert!(!Returns::Discardable.accepts(2));
        assert!(Returns::Nothing.accepts(0));
        assert!(!Returns::Nothing.accepts(1));
    }

    #[test]
    fn test_f64_global_bits() {
        let r = MapResolver::new().with_f64_global("global", "NaN", f64::NAN);
        let bits = r.resolve_global("global", "NaN").unwrap();
        assert!(f64::from_bits(bits as u64).is_nan());
    }

    #[test]
    fn test_push_resolver() {
        let mut multi = MultiResolver::default();
        assert!(multi.resolve_func("env", "f").is_none());
        multi.push(Arc::new(MapResolver::new().with_func("env", "f", HostFunc::new(0, nop))));
        assert!(multi.resolve_func("env", "f").is_some());
    }
}
