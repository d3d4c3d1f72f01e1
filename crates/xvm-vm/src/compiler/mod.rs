//! Compiler pipeline.
//!
//! Both strategies follow the same contract: `compile` turns bytecode into
//! an artifact, `load` turns an artifact into [`Code`], `Code` binds a fresh
//! [`Instance`] to one call, and `Instance::exec` runs an entry point.

pub mod aot;
pub mod interp;

use crate::error::{TrapKind, VmError};
use crate::host::HostState;
use crate::resolver::{HostFunc, Resolver};
use std::path::Path;
use std::sync::Arc;
use xvm_types::Limits;

pub use aot::AotCompiler;
pub use interp::InterpCompiler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    Aot,
    Interp,
}

/// Where [`Compiler::load`] reads from.
pub enum LoadSource<'a> {
    Bytecode(&'a [u8]),
    /// A compiled artifact on disk
    File(&'a Path),
}

pub trait Compiler: Send + Sync {
    fn kind(&self) -> CompilerKind;

    /// Changes whenever artifacts produced earlier can no longer be
    /// loaded.
    fn version(&self) -> &str;

    /// File extension of disk artifacts, `None` when the strategy keeps
    /// nothing on disk.
    fn artifact_extension(&self) -> Option<&'static str>;

    fn compile(&self, bytecode: &[u8]) -> Result<Vec<u8>, VmError>;

    fn load(&self, source: LoadSource<'_>, resolver: &dyn Resolver)
        -> Result<Arc<dyn Code>, VmError>;
}

/// Loaded code, shared by every call to the same contract.
pub trait Code: Send + Sync {
    fn instantiate(&self, host: HostState, limits: &Limits) -> Result<Box<dyn Instance>, VmError>;
}

/// Code bound to one call.
pub trait Instance {
    /// Run an exported `() -> ()` function.
    fn exec(&mut self, entry: &str) -> Result<(), VmError>;

    /// Fuel consumed, host gas and nested calls included.
    fn gas_used(&self) -> u64;

    /// Current linear memory size in bytes.
    fn memory_size(&self) -> u64;

    /// Call an exported `(i32) -> i32` helper, `None` when the guest does
    /// not export it.
    fn call_i32(&mut self, name: &str, arg: i32) -> Result<Option<i32>, VmError>;

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), VmError>;
}

fn helper_mismatch(name: &str) -> VmError {
    VmError::Trap(TrapKind::SignatureMismatch(format!(
        "{} must be (i32) -> i32",
        name
    )))
}

fn no_memory() -> VmError {
    VmError::Trap(TrapKind::Host("guest does not export memory".to_string()))
}

/// How a resolved import is provided to the guest.
#[derive(Debug, Clone)]
pub enum ResolvedImport {
    Func {
        module: String,
        name: String,
        func: HostFunc,
        /// Result count the guest declared, 0 or 1
        results: usize,
    },
    Global {
        module: String,
        name: String,
        /// Raw value, IEEE bits for `F64`
        value: i64,
        kind: GlobalKind,
    },
}

/// Value type of an immutable global import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalKind {
    I32,
    I64,
    F64,
}

/// Engine-neutral description of one import.
pub enum ImportShape {
    /// Function with its parameter and result counts, `all_i32` when every
    /// value is an i32
    Func {
        params: usize,
        results: usize,
        all_i32: bool,
    },
    Global { kind: GlobalKind },
    MutableGlobal,
    Other(&'static str),
}

/// Resolve one import, checking it matches the host signature.
pub fn resolve_import(
    resolver: &dyn Resolver,
    module: &str,
    name: &str,
    shape: ImportShape,
) -> Result<ResolvedImport, VmError> {
    let unresolved = || {
        VmError::Trap(TrapKind::UnresolvedImport {
            module: module.to_string(),
            name: name.to_string(),
        })
    };

    match shape {
        ImportShape::Func {
            params,
            results,
            all_i32,
        } => {
            let func = resolver.resolve_func(module, name).ok_or_else(unresolved)?;
            if !all_i32 || params != func.arity || !func.returns.accepts(results) {
                return Err(VmError::Trap(TrapKind::SignatureMismatch(format!(
                    "{}.{} expects {} i32 params and {}",
                    module,
                    name,
                    func.arity,
                    func.returns.describe()
                ))));
            }
            Ok(ResolvedImport::Func {
                module: module.to_string(),
                name: name.to_string(),
                func,
                results,
            })
        }
        ImportShape::Global { kind } => {
            let value = resolver.resolve_global(module, name).ok_or_else(unresolved)?;
            Ok(ResolvedImport::Global {
                module: module.to_string(),
                name: name.to_string(),
                value,
                kind,
            })
        }
        ImportShape::MutableGlobal => Err(VmError::Trap(TrapKind::SignatureMismatch(
            format!("{}.{}: mutable global imports are not supported", module, name),
        ))),
        ImportShape::Other(what) => Err(VmError::Trap(TrapKind::SignatureMismatch(format!(
            "{}.{}: {} imports are not supported",
            module, name, what
        )))),
    }
}

/// Map an optimisation level 0..=3 onto the three levels the native
/// backend offers.
pub(crate) fn opt_tier(level: u8) -> u8 {
    match level {
        0 => 0,
        1 | 2 => 1,
        _ => 2,
    }
}
