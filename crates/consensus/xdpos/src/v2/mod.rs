//! XDPoS V2 BFT Consensus
//!
//! This module implements the XDPoS V2 BFT consensus including:
//! - Round-based consensus with round numbers
//! - Quorum Certificates (QC) and Timeout Certificates (TC)
//! - Vote and timeout pools
//! - Epoch switch detection and validator snapshots
//! - Fork and equivocation forensics
//! - The v2 extra field envelope

pub mod countdown;
mod engine;
mod epoch;
pub mod forensics;
mod handlers;
pub mod pool;
pub mod proposer;
pub mod snapshot;
pub mod types;
pub mod verification;
mod verify;

pub(crate) use engine::unix_now;
pub use engine::{RoundStateView, XDPoSV2Engine};
pub use verify::VerifyHeadersHandle;

use alloc::{format, string::String, vec::Vec};
use alloy_primitives::{Address, B256, Bytes};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// Round number type for V2 consensus
pub type Round = u64;

/// Signature type for BFT messages (65 bytes)
pub type Signature = Bytes;

/// BlockInfo identifies a block in BFT messages
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    RlpEncodable,
    RlpDecodable,
)]
pub struct BlockInfo {
    /// Block hash
    pub hash: B256,
    /// Consensus round
    pub round: Round,
    /// Block number
    pub number: u64,
}

impl BlockInfo {
    /// Create a new BlockInfo
    pub const fn new(hash: B256, round: Round, number: u64) -> Self {
        Self { hash, round, number }
    }
}

/// Quorum Certificate (QC): votes from a threshold of masternodes on one block
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
#[serde(rename_all = "camelCase")]
pub struct QuorumCert {
    /// Information about the proposed block
    pub proposed_block_info: BlockInfo,
    /// Signatures from validators
    pub signatures: Vec<Signature>,
    /// Gap block number of the epoch the votes belong to
    pub gap_number: u64,
}

impl QuorumCert {
    /// Create a QC without signatures
    pub const fn new(proposed_block_info: BlockInfo, gap_number: u64) -> Self {
        Self { proposed_block_info, signatures: Vec::new(), gap_number }
    }

    /// Round of the certified block
    pub const fn round(&self) -> Round {
        self.proposed_block_info.round
    }
}

/// Timeout Certificate (TC): timeouts from a threshold of masternodes for one round
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutCert {
    /// Round that timed out
    pub round: Round,
    /// Signatures from validators that timed out
    pub signatures: Vec<Signature>,
    /// Gap block number of the epoch the timeouts belong to
    pub gap_number: u64,
}

/// SyncInfo carries the highest certificates a node knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Highest known quorum certificate
    pub highest_quorum_cert: QuorumCert,
    /// Highest known timeout certificate (if any)
    pub highest_timeout_cert: Option<TimeoutCert>,
}

/// Consensus fields stored in a v2 header's extra data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
#[serde(rename_all = "camelCase")]
pub struct ExtraFieldsV2 {
    /// Round the block was proposed in
    pub round: Round,
    /// QC of the parent block
    pub quorum_cert: QuorumCert,
}

/// Vote message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    /// Proposed block information
    pub proposed_block_info: BlockInfo,
    /// Signature over [`VoteForSign`]
    pub signature: Signature,
    /// Gap number
    pub gap_number: u64,
}

impl Vote {
    /// Key grouping votes for the same block of the same epoch
    pub fn pool_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.proposed_block_info.round,
            self.gap_number,
            self.proposed_block_info.number,
            self.proposed_block_info.hash
        )
    }

    /// Payload the signature covers
    pub const fn for_sign(&self) -> VoteForSign {
        VoteForSign { proposed_block_info: self.proposed_block_info, gap_number: self.gap_number }
    }
}

/// Timeout message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
#[serde(rename_all = "camelCase")]
pub struct Timeout {
    /// Round that timed out
    pub round: Round,
    /// Signature over [`TimeoutForSign`]
    pub signature: Signature,
    /// Gap number
    pub gap_number: u64,
}

impl Timeout {
    /// Key grouping timeouts of the same round and epoch
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.round, self.gap_number)
    }

    /// Payload the signature covers
    pub const fn for_sign(&self) -> TimeoutForSign {
        TimeoutForSign { round: self.round, gap_number: self.gap_number }
    }
}

/// Signed payload of a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct VoteForSign {
    /// Proposed block information
    pub proposed_block_info: BlockInfo,
    /// Gap number
    pub gap_number: u64,
}

/// Signed payload of a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TimeoutForSign {
    /// Round
    pub round: Round,
    /// Gap number
    pub gap_number: u64,
}

/// Masternodes and boundaries of an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochSwitchInfo {
    /// Masternodes of the epoch
    pub masternodes: Vec<Address>,
    /// Addresses penalized at the epoch switch
    pub penalties: Vec<Address>,
    /// The epoch switch block
    pub epoch_switch_block_info: BlockInfo,
    /// Block certified by the epoch switch block's QC, `None` at the v2 switch block
    pub epoch_switch_parent_block_info: Option<BlockInfo>,
}

/// Messages the engine emits for gossip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BftMessage {
    /// A vote for a proposed block
    Vote(Vote),
    /// A timeout for the current round
    Timeout(Timeout),
    /// Highest certificates, sent to help peers catch up
    SyncInfo(SyncInfo),
}
