//! Support for the toolchains contracts are built with.
//!
//! Each toolchain expects some glue from its usual host environment. The
//! resolvers here supply it, and [`prepare`] runs whatever setup the
//! toolchain needs before the first entry point.

pub mod emscripten;
pub mod go;

use crate::compiler::Instance;
use crate::error::VmError;
use xvm_types::RuntimeTag;

/// Runtime setup for a freshly instantiated contract.
pub fn prepare(runtime: RuntimeTag, instance: &mut dyn Instance) -> Result<(), VmError> {
    match runtime {
        RuntimeTag::C => emscripten::init(instance),
        _ => Ok(()),
    }
}
