//! XVM - WebAssembly engine for smart contract execution.
//!
//! This crate provides:
//! - Two-tier code cache (memory and on-disk native artifacts)
//! - AOT compilation on wasmtime and an interpreter on wasmi
//! - Fuel-based gas metering with host-call costs
//! - Import resolution and the syscall bridge
//! - Call contexts, nested calls and reentrancy protection

pub mod bridge;
pub mod chain;
pub mod code_manager;
pub mod compiler;
pub mod config;
pub mod error;
pub mod gas_metering;
pub mod host;
pub mod reentrancy;
pub mod resolver;
pub mod runtime;
pub mod syscall;
pub mod vm_manager;

pub use bridge::{Context, ContextManager, ContextParams};
pub use chain::{BlockInfo, ChainReader, NullChain, StaticChain, TxInfo};
pub use code_manager::{CacheStats, CodeManager, CodeProvider, CompiledArtifact};
pub use compiler::{AotCompiler, Compiler, CompilerKind, InterpCompiler};
pub use config::{Driver, VmConfig};
pub use error::{ErrorKind, TrapKind, VmError};
pub use gas_metering::{GasSchedule, GasTracker};
pub use reentrancy::ReentrancyGuard;
pub use resolver::{HostFunc, MapResolver, MultiResolver, Resolver};
pub use vm_manager::{
    DeployRequest, Execution, InvokeRequest, StateProvider, UpgradeRequest, VmCore, VmManager,
    CONTRACT_BUCKET,
};

/// VM version constant
pub const VM_VERSION: u32 = 1;

/// Maximum linear memory per contract (64 MB)
pub const MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Maximum call depth
pub const MAX_CALL_DEPTH: usize = 64;

/// Maximum contract code size (4 MB)
pub const MAX_CODE_SIZE: usize = 4 * 1024 * 1024;
