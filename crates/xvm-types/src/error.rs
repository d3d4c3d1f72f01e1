use thiserror::Error;

/// Errors that can occur in type operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypesError {
    #[error("Invalid digest length: expected 32, got {0}")]
    InvalidDigestLength(usize),

    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Unknown runtime tag: {0}")]
    UnknownRuntime(String),

    #[error("Invalid contract name: {0}")]
    InvalidContractName(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<hex::FromHexError> for TypesError {
    fn from(e: hex::FromHexError) -> Self {
        TypesError::InvalidHex(e.to_string())
    }
}

impl From<serde_json::Error> for TypesError {
    fn from(e: serde_json::Error) -> Self {
        TypesError::Serialization(e.to_string())
    }
}
