use crate::digest::Digest;
use crate::error::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MIN_CONTRACT_NAME_LEN: usize = 4;
pub const MAX_CONTRACT_NAME_LEN: usize = 16;

/// Language family a contract was built from. Decides the entry-point
/// naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeTag {
    C,
    Go,
    Rust,
}

impl RuntimeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeTag::C => "c",
            RuntimeTag::Go => "go",
            RuntimeTag::Rust => "rust",
        }
    }

    /// Exported symbol to call for `method`.
    pub fn entry_point(&self, method: &str) -> String {
        match self {
            RuntimeTag::C => format!("_{}", method),
            // The Go runtime exports one dispatcher and reads the method
            // through GetCallArgs.
            RuntimeTag::Go => "run".to_string(),
            RuntimeTag::Rust => method.to_string(),
        }
    }
}

impl fmt::Display for RuntimeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeTag {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(RuntimeTag::C),
            "go" => Ok(RuntimeTag::Go),
            "rust" => Ok(RuntimeTag::Rust),
            other => Err(TypesError::UnknownRuntime(other.to_string())),
        }
    }
}

/// Durable metadata stored next to a contract's bytecode.
///
/// Identity is the digest: two descriptors with equal digests describe the
/// same compiled artifact whatever their names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDescriptor {
    pub contract_name: String,
    pub runtime: RuntimeTag,
    #[serde(default)]
    pub compiler_version: String,
    #[serde(default)]
    pub digest: Digest,
}

impl ContractDescriptor {
    pub fn new(contract_name: impl Into<String>, runtime: RuntimeTag) -> Self {
        Self {
            contract_name: contract_name.into(),
            runtime,
            compiler_version: String::new(),
            digest: Digest::ZERO,
        }
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_compiler_version(mut self, version: impl Into<String>) -> Self {
        self.compiler_version = version.into();
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Check a contract name: 4 to 16 characters, starting with a letter or
/// underscore, then letters, digits, `_` or `.`, not ending in `.`.
pub fn validate_contract_name(name: &str) -> Result<(), TypesError> {
    let invalid = || TypesError::InvalidContractName(name.to_string());

    if name.len() < MIN_CONTRACT_NAME_LEN || name.len() > MAX_CONTRACT_NAME_LEN {
        return Err(invalid());
    }

    let bytes = name.as_bytes();
    let first = bytes[0];
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return Err(invalid());
    }
    if bytes[bytes.len() - 1] == b'.' {
        return Err(invalid());
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.')
    {
        return Err(invalid());
    }
    Ok(())
}
