//! Reentrancy protection for nested contract calls.
//!
//! One guard is shared by every context of a top-level call. Entering a
//! contract that is already on the chain, or going deeper than the
//! configured depth, is refused.

use crate::error::VmError;
use crate::MAX_CALL_DEPTH;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks the chain of contracts in the current call tree.
#[derive(Debug, Clone)]
pub struct ReentrancyGuard {
    stack: Vec<CallFrame>,
    in_stack: HashSet<String>,
    max_depth: usize,
}

/// A single frame in the call chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    pub contract: String,
    pub method: String,
    /// Call depth (0 for top-level)
    pub depth: usize,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::with_max_depth(MAX_CALL_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            stack: Vec::new(),
            in_stack: HashSet::new(),
            max_depth,
        }
    }

    /// Push a frame for `contract`.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Call depth is exceeded
    /// - `contract` is already on the chain
    pub fn enter(&mut self, contract: &str, method: &str) -> Result<usize, VmError> {
        let depth = self.stack.len();

        if depth >= self.max_depth {
            return Err(VmError::CallDepthExceeded { depth });
        }

        if self.in_stack.contains(contract) {
            return Err(VmError::ReentrancyViolation(format!(
                "contract {} is already in call chain",
                contract
            )));
        }

        self.in_stack.insert(contract.to_string());
        self.stack.push(CallFrame {
            contract: contract.to_string(),
            method: method.to_string(),
            depth,
        });

        Ok(depth)
    }

    /// Pop the innermost frame.
    pub fn exit(&mut self) -> Result<CallFrame, VmError> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| VmError::ReentrancyViolation("call chain is empty".to_string()))?;

        self.in_stack.remove(&frame.contract);
        Ok(frame)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

}

impl Default for ReentrancyGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Call chain handle shared between a parent context and its children.
pub type SharedCallChain = Arc<Mutex<ReentrancyGuard>>;

/// A scoped frame that exits on drop.
///
/// The lock is only held while entering and exiting, never while the
/// nested call runs.
pub struct CallScope {
    chain: SharedCallChain,
    exited: bool,
}

impl CallScope {
    pub fn enter(chain: &SharedCallChain, contract: &str, method: &str) -> Result<Self, VmError> {
        chain.lock().enter(contract, method)?;
        Ok(Self {
            chain: chain.clone(),
            exited: false,
        })
    }

    pub fn exit(mut self) -> Result<CallFrame, VmError> {
        self.exited = true;
        self.chain.lock().exit()
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if !self.exited {
            let _ = self.chain.lock().exit();
        }
    }
}
