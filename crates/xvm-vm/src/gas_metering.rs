use crate::error::TrapKind;
use serde::{Deserialize, Serialize};

/// Host-side gas costs charged per syscall, on top of instruction fuel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasSchedule {
    // Every call through call_method
    pub syscall_base: u64,           // 100

    // Storage
    pub storage_read: u64,           // 200
    pub storage_write: u64,          // 500
    pub storage_per_byte: u64,       // 10
    pub iterator_per_item: u64,      // 50

    // Calls
    pub contract_call: u64,          // 700

    // Logs & events
    pub log_base: u64,               // 375
    pub log_per_byte: u64,           // 8

    // Builtin hashing
    pub hash_base: u64,              // 20
    pub hash_per_word: u64,          // 4
}

impl Default for GasSchedule {
    fn default() -> Self {
        Self {
            syscall_base: 100,

            storage_read: 200,
            storage_write: 500,
            storage_per_byte: 10,
            iterator_per_item: 50,

            contract_call: 700,

            log_base: 375,
            log_per_byte: 8,

            hash_base: 20,
            hash_per_word: 4,
        }
    }
}

impl GasSchedule {
    /// A schedule that charges nothing, leaving only instruction fuel.
    pub fn free() -> Self {
        Self {
            syscall_base: 0,
            storage_read: 0,
            storage_write: 0,
            storage_per_byte: 0,
            iterator_per_item: 0,
            contract_call: 0,
            log_base: 0,
            log_per_byte: 0,
            hash_base: 0,
            hash_per_word: 0,
        }
    }
}

/// Host gas accounting for one call.
///
/// The cpu ceiling is shared with instruction fuel. Charges made while a
/// host function runs stay pending until the engine takes them out of its
/// fuel counter on return, so `fuel_used` already covers every earlier
/// host call.
#[derive(Debug, Clone)]
pub struct GasTracker {
    limit: u64,
    used: u64,
    pending: u64,
    schedule: GasSchedule,
}

impl GasTracker {
    pub fn new(limit: u64, schedule: GasSchedule) -> Self {
        Self {
            limit,
            used: 0,
            pending: 0,
            schedule,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Host gas charged so far, drained or not.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Charges not yet taken out of the engine's fuel.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Hand the pending charges to the engine.
    pub fn take_pending(&mut self) -> u64 {
        std::mem::take(&mut self.pending)
    }

    /// Budget left once `fuel_used` fuel is gone.
    pub fn remaining(&self, fuel_used: u64) -> u64 {
        self.limit
            .saturating_sub(fuel_used)
            .saturating_sub(self.pending)
    }

    pub fn schedule(&self) -> &GasSchedule {
        &self.schedule
    }

    /// Charge `amount` of host gas.
    pub fn charge(&mut self, amount: u64, fuel_used: u64) -> Result<(), TrapKind> {
        // Record the charge even when it overflows so usage reflects it
        self.used = self.used.saturating_add(amount);
        self.pending = self.pending.saturating_add(amount);

        let total = fuel_used.saturating_add(self.pending);
        if total > self.limit {
            Err(TrapKind::OutOfGas {
                used: total,
                limit: self.limit,
            })
        } else {
            Ok(())
        }
    }

    pub fn charge_syscall(&mut self, fuel_used: u64) -> Result<(), TrapKind> {
        self.charge(self.schedule.syscall_base, fuel_used)
    }

    pub fn charge_storage_read(&mut self, bytes: usize, fuel_used: u64) -> Result<(), TrapKind> {
        let cost =
            self.schedule.storage_read + self.per_byte(bytes, self.schedule.storage_per_byte);
        self.charge(cost, fuel_used)
    }

    pub fn charge_storage_write(&mut self, bytes: usize, fuel_used: u64) -> Result<(), TrapKind> {
        let cost =
            self.schedule.storage_write + self.per_byte(bytes, self.schedule.storage_per_byte);
        self.charge(cost, fuel_used)
    }

    pub fn charge_iterator(&mut self, items: usize, fuel_used: u64) -> Result<(), TrapKind> {
        let cost = self.per_byte(items, self.schedule.iterator_per_item);
        self.charge(cost, fuel_used)
    }

    pub fn charge_log(&mut self, bytes: usize, fuel_used: u64) -> Result<(), TrapKind> {
        let cost = self.schedule.log_base + self.per_byte(bytes, self.schedule.log_per_byte);
        self.charge(cost, fuel_used)
    }

    pub fn charge_hash(&mut self, bytes: usize, fuel_used: u64) -> Result<(), TrapKind> {
        let words = bytes.div_ceil(32);
        let cost = self.schedule.hash_base + self.per_byte(words, self.schedule.hash_per_word);
        self.charge(cost, fuel_used)
    }

    pub fn charge_contract_call(&mut self, fuel_used: u64) -> Result<(), TrapKind> {
        self.charge(self.schedule.contract_call, fuel_used)
    }

    /// Bill the cpu a nested call consumed to its caller.
    pub fn charge_child(&mut self, cpu: u64, fuel_used: u64) -> Result<(), TrapKind> {
        self.charge(cpu, fuel_used)
    }

    fn per_byte(&self, count: usize, cost: u64) -> u64 {
        (count as u64).saturating_mul(cost)
    }
}
