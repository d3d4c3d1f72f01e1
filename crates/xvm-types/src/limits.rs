use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource triple used both as a ceiling and as accumulated usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Instruction fuel plus host-call gas.
    pub cpu: u64,
    /// Linear memory in bytes.
    pub memory: u64,
    /// Bytes written to contract state.
    pub disk: u64,
}

impl Limits {
    pub const fn new(cpu: u64, memory: u64, disk: u64) -> Self {
        Self { cpu, memory, disk }
    }

    /// Ceilings used when the caller does not pass any.
    pub const fn max() -> Self {
        Self {
            cpu: 100_000_000,
            memory: 64 * 1024 * 1024,
            disk: 1024 * 1024,
        }
    }

    /// First resource in `self` that is above `limit`, if any.
    pub fn exceeds(&self, limit: &Limits) -> Option<Resource> {
        if self.cpu > limit.cpu {
            Some(Resource::Cpu)
        } else if self.memory > limit.memory {
            Some(Resource::Memory)
        } else if self.disk > limit.disk {
            Some(Resource::Disk)
        } else {
            None
        }
    }

    pub fn saturating_add(&self, other: &Limits) -> Limits {
        Limits {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
        }
    }

    pub fn saturating_sub(&self, other: &Limits) -> Limits {
        Limits {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} memory={} disk={}", self.cpu, self.memory, self.disk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}
