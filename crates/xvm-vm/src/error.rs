use thiserror::Error;
use xvm_storage::StorageError;
use xvm_types::TypesError;

/// Fatal conditions that abort a running call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrapKind {
    #[error("Out of gas: used {used}, limit {limit}")]
    OutOfGas { used: u64, limit: u64 },

    #[error("Memory access out of bounds")]
    MemoryOutOfBounds,

    #[error("Integer overflow")]
    IntegerOverflow,

    #[error("Divide by zero")]
    DivideByZero,

    #[error("Unreachable code reached")]
    Unreachable,

    #[error("Stack overflow")]
    StackOverflow,

    #[error("Unresolved import: {module}.{name}")]
    UnresolvedImport { module: String, name: String },

    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("Memory limit exceeded: {size} > {limit}")]
    MemoryLimitExceeded { size: u64, limit: u64 },

    #[error("Disk limit exceeded: {size} > {limit}")]
    DiskLimitExceeded { size: u64, limit: u64 },

    #[error("Host abort: {0}")]
    Host(String),

    #[error("Runtime trap: {0}")]
    Runtime(String),
}

/// How a [`VmError`] should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The contract reported a failure status. Gas is charged and the
    /// compiled artifact stays valid.
    Contract,
    /// The call was aborted by a trap or the code could not be built.
    Fatal,
    /// Disk, storage or engine failure outside the contract's control.
    Infrastructure,
    /// The request was refused before any guest code ran.
    Rejected,
}

/// Errors that can occur during VM execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("Contract error {status}: {message}")]
    Contract { status: i32, message: String },

    #[error("Trap: {0}")]
    Trap(TrapKind),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Instantiation error: {0}")]
    Instantiation(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt cache manifest: {0}")]
    ManifestCorrupt(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Contract already exists: {0}")]
    ContractExists(String),

    #[error("Invalid contract name: {0}")]
    InvalidName(String),

    #[error("Code size exceeded: {size} > {limit}")]
    CodeSizeExceeded { size: usize, limit: usize },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Method initialize can only be called during deploy")]
    InitializeForbidden,

    #[error("Contract upgrade is disabled")]
    UpgradeDisabled,

    #[error("Call depth exceeded: {depth}")]
    CallDepthExceeded { depth: usize },

    #[error("Reentrancy violation: {0}")]
    ReentrancyViolation(String),
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Contract { .. } => ErrorKind::Contract,
            VmError::Trap(_) | VmError::Compilation(_) | VmError::Instantiation(_) => {
                ErrorKind::Fatal
            }
            VmError::Io(_)
            | VmError::Storage(_)
            | VmError::ManifestCorrupt(_)
            | VmError::Engine(_)
            | VmError::Config(_) => ErrorKind::Infrastructure,
            VmError::ContractNotFound(_)
            | VmError::ContractExists(_)
            | VmError::InvalidName(_)
            | VmError::MethodNotFound(_)
            | VmError::CodeSizeExceeded { .. }
            | VmError::InitializeForbidden
            | VmError::UpgradeDisabled
            | VmError::CallDepthExceeded { .. }
            | VmError::ReentrancyViolation(_) => ErrorKind::Rejected,
        }
    }

    pub fn is_out_of_gas(&self) -> bool {
        matches!(self, VmError::Trap(TrapKind::OutOfGas { .. }))
    }

    /// True when the failure says nothing about the compiled artifact, so
    /// the cache entry can be kept.
    pub fn keeps_artifact(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contract | ErrorKind::Rejected)
    }
}

impl From<TrapKind> for VmError {
    fn from(t: TrapKind) -> Self {
        VmError::Trap(t)
    }
}

impl From<StorageError> for VmError {
    fn from(e: StorageError) -> Self {
        VmError::Storage(e.to_string())
    }
}

impl From<TypesError> for VmError {
    fn from(e: TypesError) -> Self {
        match e {
            TypesError::InvalidContractName(name) => VmError::InvalidName(name),
            other => VmError::Storage(other.to_string()),
        }
    }
}

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        VmError::Io(e.to_string())
    }
}
