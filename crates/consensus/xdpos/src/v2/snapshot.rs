//! XDPoS V2 Masternode Snapshots
//!
//! A snapshot is taken at every gap block (`number % epoch == epoch - gap`)
//! and holds the masternodes of the next epoch. Snapshots are keyed by the
//! gap block's hash, so competing forks never overwrite each other.

use super::XDPoSV2Engine;
use crate::{
    chain::{Candidate, ChainReader},
    db::KeyValueStore,
    errors::{XDPoSError, XDPoSResult},
};
use alloc::{format, string::ToString, vec::Vec};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};
use xdc_primitives::XdcBlockHeader;

/// Key prefix of persisted snapshots
const SNAPSHOT_KEY_PREFIX: &[u8] = b"XDPoS-V2-";

/// Masternodes elected at a gap block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotV2 {
    /// Gap block number
    pub number: u64,
    /// Gap block hash
    pub hash: B256,
    /// Masternodes of the next epoch
    pub next_epoch_masternodes: Vec<Address>,
    /// Every candidate at the gap block, ordered by stake
    #[serde(default)]
    pub next_epoch_candidates: Vec<Address>,
}

impl SnapshotV2 {
    /// Create a snapshot without standby candidates
    pub const fn new(number: u64, hash: B256, masternodes: Vec<Address>) -> Self {
        Self { number, hash, next_epoch_masternodes: masternodes, next_epoch_candidates: Vec::new() }
    }

    /// Attach the full candidate list
    pub fn with_candidates(mut self, candidates: Vec<Address>) -> Self {
        self.next_epoch_candidates = candidates;
        self
    }

    /// Whether `address` is a masternode of the next epoch
    pub fn is_masternode(&self, address: &Address) -> bool {
        self.next_epoch_masternodes.contains(address)
    }

    /// Store key of the snapshot taken at `hash`
    pub fn store_key(hash: &B256) -> Vec<u8> {
        let mut key = Vec::with_capacity(SNAPSHOT_KEY_PREFIX.len() + 32);
        key.extend_from_slice(SNAPSHOT_KEY_PREFIX);
        key.extend_from_slice(hash.as_slice());
        key
    }

    /// Load the snapshot taken at `hash`
    pub fn load(store: &dyn KeyValueStore, hash: &B256) -> XDPoSResult<Option<Self>> {
        let Some(blob) = store.get(&Self::store_key(hash))? else { return Ok(None) };
        serde_json::from_slice(&blob)
            .map(Some)
            .map_err(|err| XDPoSError::Storage(format!("corrupt snapshot {hash}: {err}")))
    }

    /// Persist the snapshot under its gap block hash
    pub fn store(&self, store: &dyn KeyValueStore) -> XDPoSResult<()> {
        let blob = serde_json::to_vec(self).map_err(|err| XDPoSError::Storage(err.to_string()))?;
        store.put(&Self::store_key(&self.hash), &blob)
    }
}

/// Gap block of the epoch `number` belongs to.
pub const fn gap_block_number(number: u64, epoch: u64, gap: u64) -> u64 {
    (number - number % epoch).saturating_sub(gap)
}

impl XDPoSV2Engine {
    /// Snapshot for the epoch of `number`
    ///
    /// # Arguments
    /// * `number` - A block number, or the gap block number itself when `is_gap_number`
    /// * `is_gap_number` - Whether `number` already is a gap block number
    pub fn get_snapshot(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        is_gap_number: bool,
    ) -> XDPoSResult<SnapshotV2> {
        let gap_number = if is_gap_number {
            number
        } else {
            gap_block_number(number, self.config.epoch, self.config.gap)
        };

        let header = chain.header_by_number(gap_number).ok_or_else(|| {
            XDPoSError::SnapshotNotFound(format!("no gap block header at {gap_number}"))
        })?;
        let hash = header.hash_slow();

        if let Some(snapshot) = self.snapshots.lock().get(&hash) {
            trace!(target: "consensus::xdpos", number = gap_number, %hash, "Snapshot cache hit");
            return Ok(snapshot.clone());
        }

        let snapshot = SnapshotV2::load(self.store.as_ref(), &hash)?.ok_or_else(|| {
            XDPoSError::SnapshotNotFound(format!("gap block {gap_number} hash {hash}"))
        })?;
        debug!(target: "consensus::xdpos", number = gap_number, %hash, "Loaded snapshot from store");
        self.snapshots.lock().put(hash, snapshot.clone());
        Ok(snapshot)
    }

    /// Persist `snapshot` and keep it in memory.
    pub fn store_snapshot(&self, snapshot: SnapshotV2) -> XDPoSResult<()> {
        snapshot.store(self.store.as_ref())?;
        self.snapshots.lock().put(snapshot.hash, snapshot);
        Ok(())
    }

    /// Elect the next epoch's masternodes at gap block `header`.
    ///
    /// Candidates are ranked by stake; the top `max_masternodes` become
    /// masternodes and the full ranking is kept for standby tiers.
    pub fn update_masternodes(
        &self,
        header: &XdcBlockHeader,
        candidates: &[Candidate],
    ) -> XDPoSResult<SnapshotV2> {
        let ranked = rank_candidates(candidates);
        let max = self.params().max_masternodes;
        let masternodes: Vec<_> = ranked.iter().take(max).copied().collect();

        let snapshot = SnapshotV2::new(header.number, header.hash_slow(), masternodes)
            .with_candidates(ranked);
        info!(
            target: "consensus::xdpos",
            number = header.number,
            hash = %snapshot.hash,
            masternodes = snapshot.next_epoch_masternodes.len(),
            "New masternodes snapshot"
        );
        self.store_snapshot(snapshot.clone())?;
        Ok(snapshot)
    }

    /// Block insertion hook: takes a snapshot on gap blocks and refreshes the
    /// active round parameters.
    pub fn on_block_inserted(
        &self,
        header: &XdcBlockHeader,
        candidates: &[Candidate],
    ) -> XDPoSResult<Option<SnapshotV2>> {
        self.update_params(header);
        if !self.config.is_gap_block(header.number) {
            return Ok(None);
        }
        self.update_masternodes(header, candidates).map(Some)
    }
}

/// Candidate addresses by descending stake. Equal stakes keep their input order.
pub fn rank_candidates(candidates: &[Candidate]) -> Vec<Address> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| b.stake.cmp(&a.stake));
    sorted.into_iter().map(|candidate| candidate.address).collect()
}
