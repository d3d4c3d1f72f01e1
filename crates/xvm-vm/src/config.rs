//! Engine configuration.

use crate::error::VmError;
use crate::gas_metering::GasSchedule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Compilation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Native code compiled ahead of time and cached on disk
    Aot,
    /// Bytecode interpreter, no disk tier
    Interp,
}

impl std::str::FromStr for Driver {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aot" => Ok(Driver::Aot),
            "interp" | "ixvm" => Ok(Driver::Interp),
            other => Err(VmError::Config(format!("unknown driver: {}", other))),
        }
    }
}

/// VM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub driver: Driver,
    /// Root of the compiled-artifact cache
    pub basedir: PathBuf,
    /// Native code optimisation level, 0 to 3
    pub opt_level: u8,
    pub max_call_depth: usize,
    pub enable_upgrade: bool,
    /// Largest accepted bytecode blob (bytes)
    pub max_code_size: usize,
    /// Native stack available to guest code (bytes)
    pub max_wasm_stack: usize,
    /// Use the interpreter when the native engine cannot be created
    pub fallback_to_interp: bool,
    pub gas: GasSchedule,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            driver: Driver::Aot,
            basedir: PathBuf::from("./data/xvm"),
            opt_level: 0,
            max_call_depth: crate::MAX_CALL_DEPTH,
            enable_upgrade: false,
            max_code_size: crate::MAX_CODE_SIZE,
            max_wasm_stack: 1024 * 1024,
            fallback_to_interp: true,
            gas: GasSchedule::default(),
        }
    }
}

impl VmConfig {
    pub fn new(driver: Driver, basedir: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            basedir: basedir.into(),
            ..Default::default()
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.opt_level > 3 {
            return Err(VmError::Config(format!(
                "opt_level must be between 0 and 3, got {}",
                self.opt_level
            )));
        }
        if self.max_call_depth == 0 {
            return Err(VmError::Config("max_call_depth cannot be 0".to_string()));
        }
        if self.max_code_size == 0 {
            return Err(VmError::Config("max_code_size cannot be 0".to_string()));
        }
        if self.max_wasm_stack == 0 {
            return Err(VmError::Config("max_wasm_stack cannot be 0".to_string()));
        }
        Ok(())
    }

    /// Private copies of loaded native artifacts live here.
    pub fn run_dir(&self) -> PathBuf {
        self.basedir.join("var").join("run")
    }
}
