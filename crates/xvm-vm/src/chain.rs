//! Read-only view of the ledger for the block, transaction and account
//! syscalls.

use borsh::{BorshDeserialize, BorshSerialize};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct BlockInfo {
    pub blockid: Vec<u8>,
    pub pre_hash: Vec<u8>,
    pub proposer: Vec<u8>,
    pub height: i64,
    pub timestamp: i64,
    pub tx_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct TxInfo {
    pub txid: Vec<u8>,
    pub blockid: Vec<u8>,
    pub initiator: String,
    pub desc: Vec<u8>,
}

pub trait ChainReader: Send + Sync {
    fn query_block(&self, blockid: &[u8]) -> Option<BlockInfo>;

    fn query_tx(&self, txid: &[u8]) -> Option<TxInfo>;

    /// Addresses bound to an account, empty when the account is unknown.
    fn account_addresses(&self, account: &str) -> Vec<String>;
}

/// Chain with nothing on it.
pub struct NullChain;

impl ChainReader for NullChain {
    fn query_block(&self, _blockid: &[u8]) -> Option<BlockInfo> {
        None
    }

    fn query_tx(&self, _txid: &[u8]) -> Option<TxInfo> {
        None
    }

    fn account_addresses(&self, _account: &str) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory chain fixture.
#[derive(Default)]
pub struct StaticChain {
    blocks: RwLock<HashMap<Vec<u8>, BlockInfo>>,
    txs: RwLock<HashMap<Vec<u8>, TxInfo>>,
    accounts: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, block: BlockInfo) {
        self.blocks.write().insert(block.blockid.clone(), block);
    }

    pub fn add_tx(&self, tx: TxInfo) {
        self.txs.write().insert(tx.txid.clone(), tx);
    }

    pub fn add_account(&self, account: &str, addresses: Vec<String>) {
        self.accounts.write().insert(account.to_string(), addresses);
    }
}

impl ChainReader for StaticChain {
    fn query_block(&self, blockid: &[u8]) -> Option<BlockInfo> {
        self.blocks.read().get(blockid).cloned()
    }

    fn query_tx(&self, txid: &[u8]) -> Option<TxInfo> {
        self.txs.read().get(txid).cloned()
    }

    fn account_addresses(&self, account: &str) -> Vec<String> {
        self.accounts.read().get(account).cloned().unwrap_or_default()
    }
}
