//! XDC Network XDPoS Consensus Implementation
//!
//! This crate implements the XDPoS v2 BFT consensus engine used by the XDC
//! Network, together with the v1 header checks needed to follow the chain up
//! to the v2 switch block.
//!
//! ## Architecture
//!
//! - [`XDPoS`] - Dispatches block-level calls to the v1 or v2 engine by block number
//! - [`XDPoSV2Engine`] - Round state machine, QC/TC aggregation, epoch and snapshot logic
//! - [`XDPoSConfig`] - Configuration, with v2 parameters versioned by round
//! - [`hooks`] - Penalty and reward hooks run at epoch switches
//! - [`XDPoSApi`] - Read API for the RPC namespace
//! - [`v2::forensics`] - Fork and equivocation reports
//!
//! The host node supplies a [`ChainReader`], a [`KeyValueStore`] and a
//! [`Signer`], spawns [`v2::countdown::run_countdown`] on its runtime and
//! forwards gossip into the engine's handlers.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

mod adaptor;
mod api;
mod chain;
mod config;
mod db;
mod errors;
mod extra_data;
pub mod hooks;
mod signer;
pub mod signing_tx;
mod v1;
pub mod v2;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

pub use adaptor::{ConsensusEngine, Engine, NOT_SUPPORTED_IN_V1, XDPoS};
pub use api::{EpochNumInfo, MAX_BLOCK_DISTANCE, MissedRoundInfo, MissedRoundsMetadata, XDPoSApi};
pub use chain::{BlockTransaction, Candidate, CandidateSource, ChainReader, RewardState};
pub use config::{V2Config, V2RoundConfig, XDPoSConfig, xdc_apothem_config, xdc_mainnet_config};
pub use db::{KeyValueStore, MemoryStore};
pub use errors::{XDPoSError, XDPoSResult};
pub use extra_data::{
    ExtraData, V1ExtraData, decode_masternodes_from_v1_extra, hash_without_seal,
    recover_v1_author,
};
pub use signer::{LocalSigner, Signer, public_key_to_address, recover_signer};
pub use v1::XDPoSV1Engine;

pub use v2::{
    BftMessage, BlockInfo, EpochSwitchInfo, ExtraFieldsV2, QuorumCert, Round, RoundStateView,
    Signature, SyncInfo, Timeout, TimeoutCert, VerifyHeadersHandle, Vote, XDPoSV2Engine,
};

/// Extra field constants for XDPoS
pub mod constants {
    pub use xdc_primitives::SIGNATURE_LENGTH;

    /// Fixed number of extra-data prefix bytes reserved for signer vanity
    pub const EXTRA_VANITY: usize = 32;

    /// Fixed number of extra-data suffix bytes reserved for signer seal
    pub const EXTRA_SEAL: usize = 65;

    /// Default epoch length (900 blocks)
    pub const DEFAULT_EPOCH: u64 = 900;

    /// Default gap before epoch switch (450 blocks)
    pub const DEFAULT_GAP: u64 = 450;

    /// Number of recent v2 snapshots to keep in memory
    pub const INMEMORY_SNAPSHOTS: usize = 128;

    /// Number of recent epoch switch infos to keep in memory
    pub const INMEMORY_EPOCH_SWITCHES: usize = 5 * 900;

    /// Number of verified header hashes to keep in memory
    pub const INMEMORY_VERIFIED_HEADERS: usize = 128;

    /// Number of recent block authors to keep in memory
    pub const INMEMORY_SIGNATURES: usize = 4096;

    /// Number of blocks whose signing transactions are cached
    pub const BLOCK_SIGNERS_CACHE_LIMIT: usize = 9000;

    /// Capacity of the outgoing consensus message channel
    pub const MESSAGE_CHANNEL_SIZE: usize = 256;

    /// XDC Mainnet V2 Switch Block
    pub const XDC_MAINNET_V2_SWITCH: u64 = 80_370_000;

    /// XDC Mainnet Chain ID
    pub const XDC_MAINNET_CHAIN_ID: u64 = 50;

    /// XDC Apothem Testnet Chain ID
    pub const XDC_APOTHEM_CHAIN_ID: u64 = 51;
}
