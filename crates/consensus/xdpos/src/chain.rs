//! Narrow views of the host node the engine depends on.

use crate::errors::XDPoSResult;
use alloc::vec::Vec;
use alloy_primitives::{Address, B256, Bytes, U256};
use core::fmt::Debug;
use xdc_primitives::XdcBlockHeader;

/// Read-only access to the canonical chain.
pub trait ChainReader: Send + Sync {
    /// Head of the canonical chain.
    fn current_header(&self) -> XdcBlockHeader;

    /// Canonical header at `number`.
    fn header_by_number(&self, number: u64) -> Option<XdcBlockHeader>;

    /// Header with the given hash, canonical or not.
    fn header_by_hash(&self, hash: B256) -> Option<XdcBlockHeader>;

    /// Header with the given hash, if it is at height `number`.
    fn header(&self, hash: B256, number: u64) -> Option<XdcBlockHeader> {
        self.header_by_hash(hash).filter(|header| header.number == number)
    }

    /// Transactions of the block with the given hash.
    fn block_transactions(&self, _hash: B256) -> Option<Vec<BlockTransaction>> {
        None
    }
}

/// The parts of a transaction the engine inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    /// Recovered sender
    pub from: Address,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Call data
    pub input: Bytes,
}

/// A masternode candidate and its total stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Candidate address
    pub address: Address,
    /// Total stake
    pub stake: U256,
}

/// Validator contract view used for snapshots and rewards.
pub trait CandidateSource: Send + Sync + Debug {
    /// Candidates registered in the state at `header`.
    fn candidates(&self, header: &XdcBlockHeader) -> XDPoSResult<Vec<Candidate>>;

    /// Owner of `candidate`, who receives the candidate's reward share.
    fn candidate_owner(&self, candidate: Address) -> Option<Address>;
}

/// Mutable balances touched by epoch rewards.
pub trait RewardState {
    /// Credit `amount` wei to `address`.
    fn add_balance(&mut self, address: Address, amount: U256);
}

impl RewardState for alloc::collections::BTreeMap<Address, U256> {
    fn add_balance(&mut self, address: Address, amount: U256) {
        *self.entry(address).or_default() += amount;
    }
}
