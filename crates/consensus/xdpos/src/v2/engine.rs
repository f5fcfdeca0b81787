//! XDPoS V2 Engine Implementation
//!
//! The engine is a per-validator state machine. All round state and both
//! message pools live behind one mutex; every public handler takes it once
//! and works through the `*_locked` internals.
//!
//! This module holds construction, the round transitions (QC/TC processing,
//! the commit and voting rules) and block production. Message handling,
//! verification, epochs and snapshots live in sibling modules.

use super::{
    BftMessage, BlockInfo, EpochSwitchInfo, QuorumCert, Round, SyncInfo, TimeoutCert,
    countdown::CountdownTimer,
    forensics::{Forensics, ForensicsEvent},
    pool::{TimeoutPool, VotePool},
    snapshot::SnapshotV2,
    ExtraFieldsV2,
};
use crate::{
    chain::{ChainReader, RewardState},
    config::{V2Config, V2RoundConfig, XDPoSConfig},
    constants::{
        BLOCK_SIGNERS_CACHE_LIMIT, INMEMORY_EPOCH_SWITCHES, INMEMORY_SIGNATURES,
        INMEMORY_SNAPSHOTS, INMEMORY_VERIFIED_HEADERS, MESSAGE_CHANNEL_SIZE,
    },
    db::KeyValueStore,
    errors::{XDPoSError, XDPoSResult},
    hooks::{PenaltyHook, RewardDistribution, RewardHook},
    signer::{Signer, recover_signer},
    signing_tx::SigningTx,
};
use alloc::{format, string::ToString, sync::Arc, vec::Vec};
use alloy_primitives::{Address, B64, B256, U256};
use core::{hash::Hash, num::NonZeroUsize};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use xdc_primitives::{EMPTY_OMMER_ROOT_HASH, XdcBlockHeader, addresses_to_bytes};

/// Mutable consensus state of the local validator
#[derive(Debug, Default)]
pub(crate) struct RoundState {
    pub(crate) current_round: Round,
    pub(crate) lock_quorum_cert: Option<QuorumCert>,
    pub(crate) highest_quorum_cert: QuorumCert,
    pub(crate) highest_timeout_cert: TimeoutCert,
    pub(crate) highest_voted_round: Round,
    pub(crate) highest_commit_block: Option<BlockInfo>,
    pub(crate) timeout_count: u64,
    /// Highest round of any pooled message, drives pool hygiene
    pub(crate) highest_seen_round: Round,
    pub(crate) vote_pool: VotePool,
    pub(crate) timeout_pool: TimeoutPool,
}

impl RoundState {
    pub(crate) fn view(&self) -> RoundStateView {
        RoundStateView {
            current_round: self.current_round,
            highest_voted_round: self.highest_voted_round,
            lock_quorum_cert: self.lock_quorum_cert.clone(),
            highest_quorum_cert: self.highest_quorum_cert.clone(),
            highest_timeout_cert: self.highest_timeout_cert.clone(),
            highest_commit_block: self.highest_commit_block,
            timeout_count: self.timeout_count,
        }
    }

    pub(crate) fn sync_info(&self) -> SyncInfo {
        SyncInfo {
            highest_quorum_cert: self.highest_quorum_cert.clone(),
            highest_timeout_cert: (self.highest_timeout_cert.round > 0)
                .then(|| self.highest_timeout_cert.clone()),
        }
    }

    pub(crate) fn note_round(&mut self, round: Round) {
        self.highest_seen_round = self.highest_seen_round.max(round);
    }
}

/// Point-in-time copy of the round state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStateView {
    /// Round the validator is in
    pub current_round: Round,
    /// Last round the validator voted in
    pub highest_voted_round: Round,
    /// QC the validator is locked on
    pub lock_quorum_cert: Option<QuorumCert>,
    /// Highest QC seen
    pub highest_quorum_cert: QuorumCert,
    /// Highest TC seen
    pub highest_timeout_cert: TimeoutCert,
    /// Last committed block
    pub highest_commit_block: Option<BlockInfo>,
    /// Consecutive countdown expiries in the current round
    pub timeout_count: u64,
}

/// XDPoS V2 Engine
pub struct XDPoSV2Engine {
    pub(crate) config: XDPoSConfig,
    pub(crate) v2_config: V2Config,
    /// Parameter set of the latest inserted block's round
    pub(crate) params: RwLock<V2RoundConfig>,
    pub(crate) signer: RwLock<Option<Arc<dyn Signer>>>,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) round_state: Mutex<RoundState>,
    pub(crate) snapshots: Mutex<LruCache<B256, SnapshotV2>>,
    pub(crate) epoch_switches: Mutex<LruCache<B256, EpochSwitchInfo>>,
    pub(crate) verified_headers: Mutex<LruCache<B256, ()>>,
    pub(crate) signatures: Mutex<LruCache<B256, Address>>,
    pub(crate) signing_txs: Mutex<LruCache<B256, Vec<SigningTx>>>,
    pub(crate) countdown: CountdownTimer,
    pub(crate) messages: broadcast::Sender<BftMessage>,
    pub(crate) forensics: Forensics,
    pub(crate) penalty_hook: Option<Arc<dyn PenaltyHook>>,
    pub(crate) reward_hook: Option<Arc<dyn RewardHook>>,
}

impl core::fmt::Debug for XDPoSV2Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XDPoSV2Engine")
            .field("switch_block", &self.v2_config.switch_block)
            .field("round", &self.round_state.lock().current_round)
            .finish_non_exhaustive()
    }
}

fn lru<K: Hash + Eq, V>(capacity: usize) -> Mutex<LruCache<K, V>> {
    Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)))
}

/// Seconds since the unix epoch
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

impl XDPoSV2Engine {
    /// Create a new V2 engine
    ///
    /// Fails when the config has no v2 section or does not validate.
    pub fn new(config: XDPoSConfig, store: Arc<dyn KeyValueStore>) -> XDPoSResult<Self> {
        config.validate()?;
        let v2_config = config
            .v2
            .clone()
            .ok_or_else(|| XDPoSError::Initialization("missing v2 config".to_string()))?;
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_SIZE);

        info!(
            target: "consensus::xdpos",
            epoch = config.epoch,
            gap = config.gap,
            switch_block = v2_config.switch_block,
            "Initialized XDPoS v2 consensus engine"
        );

        Ok(Self {
            params: RwLock::new(v2_config.config_at(0)),
            v2_config,
            config,
            signer: RwLock::new(None),
            store,
            round_state: Mutex::new(RoundState::default()),
            snapshots: lru(INMEMORY_SNAPSHOTS),
            epoch_switches: lru(INMEMORY_EPOCH_SWITCHES),
            verified_headers: lru(INMEMORY_VERIFIED_HEADERS),
            signatures: lru(INMEMORY_SIGNATURES),
            signing_txs: lru(BLOCK_SIGNERS_CACHE_LIMIT),
            countdown: CountdownTimer::new(),
            messages,
            forensics: Forensics::new(),
            penalty_hook: None,
            reward_hook: None,
        })
    }

    /// Install the penalty hook used when computing epoch masternodes
    pub fn with_penalty_hook(mut self, hook: Arc<dyn PenaltyHook>) -> Self {
        self.penalty_hook = Some(hook);
        self
    }

    /// Install the reward hook run when finalizing epoch switch blocks
    pub fn with_reward_hook(mut self, hook: Arc<dyn RewardHook>) -> Self {
        self.reward_hook = Some(hook);
        self
    }

    /// Set the key used for votes, timeouts and seals
    pub fn authorize(&self, signer: Arc<dyn Signer>) {
        info!(target: "consensus::xdpos", address = %signer.address(), "Authorized signer");
        *self.signer.write() = Some(signer);
    }

    /// Address of the authorized signer
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.read().as_ref().map(|signer| signer.address())
    }

    pub(crate) fn signer(&self) -> XDPoSResult<Arc<dyn Signer>> {
        self.signer.read().clone().ok_or(XDPoSError::NoSigner)
    }

    /// Subscribe to outgoing consensus messages
    pub fn subscribe(&self) -> broadcast::Receiver<BftMessage> {
        self.messages.subscribe()
    }

    /// Subscribe to forensics reports
    pub fn subscribe_forensics(&self) -> broadcast::Receiver<ForensicsEvent> {
        self.forensics.subscribe()
    }

    pub(crate) fn broadcast(&self, message: BftMessage) {
        if self.messages.send(message).is_err() {
            trace!(target: "consensus::xdpos", "No subscriber for consensus message");
        }
    }

    /// XDPoS config
    pub const fn config(&self) -> &XDPoSConfig {
        &self.config
    }

    /// Last v1 block
    pub const fn switch_block(&self) -> u64 {
        self.v2_config.switch_block
    }

    /// Parameter set currently in force
    pub fn params(&self) -> V2RoundConfig {
        self.params.read().clone()
    }

    /// Parameter set in force at `round`
    pub fn params_at(&self, round: Round) -> V2RoundConfig {
        self.v2_config.config_at(round)
    }

    /// Persistent store backing snapshots
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Current round
    pub fn current_round(&self) -> Round {
        self.round_state.lock().current_round
    }

    /// Copy of the current round state
    pub fn round_state(&self) -> RoundStateView {
        self.round_state.lock().view()
    }

    /// Highest certificates known locally
    pub fn sync_info(&self) -> SyncInfo {
        self.round_state.lock().sync_info()
    }

    /// Select the parameter set for the round of `header`.
    pub fn update_params(&self, header: &XdcBlockHeader) {
        let round = if header.number <= self.switch_block() {
            0
        } else {
            match self.decode_v2_extra(header) {
                Ok(fields) => fields.round,
                Err(err) => {
                    warn!(target: "consensus::xdpos", number = header.number, %err, "Cannot read round for params");
                    return;
                }
            }
        };

        let next = self.v2_config.config_at(round);
        let mut params = self.params.write();
        if params.switch_round != next.switch_round {
            info!(
                target: "consensus::xdpos",
                round,
                switch_round = next.switch_round,
                "Switching v2 parameters"
            );
        }
        *params = next;
    }

    /// Bring the engine up from `header`, the head the node starts from.
    ///
    /// No-op once initialized.
    pub fn initial(&self, chain: &dyn ChainReader, header: &XdcBlockHeader) -> XDPoSResult<()> {
        let mut state = self.round_state.lock();
        self.initial_locked(chain, &mut state, header)
    }

    pub(crate) fn initial_locked(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<()> {
        if state.highest_quorum_cert.proposed_block_info.hash != B256::ZERO {
            return Ok(());
        }
        info!(target: "consensus::xdpos", number = header.number, "Initializing v2 engine");

        let switch_block = self.switch_block();
        if header.number == switch_block {
            let block_info = BlockInfo::new(header.hash_slow(), 0, header.number);
            state.highest_quorum_cert =
                QuorumCert::new(block_info, self.epoch_gap_number(header.number));
            state.current_round = 1;
        } else {
            let fields = self
                .decode_v2_extra(header)
                .map_err(|err| XDPoSError::Initialization(err.to_string()))?;
            self.process_qc_locked(chain, state, &fields.quorum_cert)?;
        }

        if header.number < switch_block + self.config.gap {
            let checkpoint = header.number - header.number % self.config.epoch;
            let checkpoint_header = chain.header_by_number(checkpoint).ok_or_else(|| {
                XDPoSError::Initialization(format!("missing checkpoint header {checkpoint}"))
            })?;
            let gap_number = checkpoint.saturating_sub(self.config.gap);
            let gap_header = chain.header_by_number(gap_number).ok_or_else(|| {
                XDPoSError::Initialization(format!("missing gap header {gap_number}"))
            })?;
            let (_, _, masternodes) = self
                .extra_fields(&checkpoint_header)
                .map_err(|err| XDPoSError::Initialization(err.to_string()))?;

            info!(
                target: "consensus::xdpos",
                gap_number,
                masternodes = masternodes.len(),
                "Storing first v2 snapshot"
            );
            self.store_snapshot(SnapshotV2::new(gap_number, gap_header.hash_slow(), masternodes))?;
        }

        self.update_params(header);
        self.countdown.reset(state.current_round);
        Ok(())
    }

    /// Record `qc` and advance rounds, locks and commits accordingly.
    pub fn process_qc(&self, chain: &dyn ChainReader, qc: &QuorumCert) -> XDPoSResult<()> {
        let mut state = self.round_state.lock();
        self.process_qc_locked(chain, &mut state, qc)
    }

    pub(crate) fn process_qc_locked(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        qc: &QuorumCert,
    ) -> XDPoSResult<()> {
        trace!(target: "consensus::xdpos", round = qc.round(), number = qc.proposed_block_info.number, "Processing QC");
        if qc.round() > state.highest_quorum_cert.round() {
            state.highest_quorum_cert = qc.clone();
        }

        let header = chain.header_by_hash(qc.proposed_block_info.hash).ok_or_else(|| {
            warn!(target: "consensus::xdpos", hash = %qc.proposed_block_info.hash, "QC block not found");
            XDPoSError::UnknownBlock
        })?;

        if header.number > self.switch_block() {
            let fields = self.decode_v2_extra(&header)?;
            let parent_qc = fields.quorum_cert;
            if state.lock_quorum_cert.as_ref().is_none_or(|lock| parent_qc.round() > lock.round()) {
                state.lock_quorum_cert = Some(parent_qc);
            }
            self.commit_blocks(chain, state, &header, fields.round, qc)?;
        }

        if qc.round() >= state.current_round {
            self.set_new_round(state, qc.round() + 1);
        }
        Ok(())
    }

    /// Record `tc` and move past its round.
    pub fn process_tc(&self, tc: &TimeoutCert) {
        let mut state = self.round_state.lock();
        self.process_tc_locked(&mut state, tc);
    }

    pub(crate) fn process_tc_locked(&self, state: &mut RoundState, tc: &TimeoutCert) {
        if tc.round > state.highest_timeout_cert.round {
            state.highest_timeout_cert = tc.clone();
        }
        if tc.round >= state.current_round {
            self.set_new_round(state, tc.round + 1);
        }
    }

    pub(crate) fn set_new_round(&self, state: &mut RoundState, round: Round) {
        debug!(target: "consensus::xdpos", from = state.current_round, to = round, "New round");
        state.current_round = round;
        state.timeout_count = 0;
        state.timeout_pool.clear();
        state.note_round(round);
        self.countdown.reset(round);
    }

    /// Commit the grandparent of `header` when the three blocks have
    /// consecutive rounds. Returns whether a block was committed.
    fn commit_blocks(
        &self,
        chain: &dyn ChainReader,
        state: &mut RoundState,
        header: &XdcBlockHeader,
        round: Round,
        incoming_qc: &QuorumCert,
    ) -> XDPoSResult<bool> {
        if header.number.saturating_sub(2) <= self.switch_block() {
            return Ok(false);
        }

        let parent = chain.header_by_hash(header.parent_hash).ok_or(XDPoSError::UnknownAncestor)?;
        let parent_round = self.decode_v2_extra(&parent)?.round;
        if round.checked_sub(1) != Some(parent_round) {
            return Ok(false);
        }

        let grandparent =
            chain.header_by_hash(parent.parent_hash).ok_or(XDPoSError::UnknownAncestor)?;
        let grandparent_round = self.decode_v2_extra(&grandparent)?.round;
        if round.checked_sub(2) != Some(grandparent_round) {
            return Ok(false);
        }

        let should_commit = state.highest_commit_block.is_none_or(|committed| {
            committed.round < grandparent_round && committed.number < grandparent.number
        });
        if !should_commit {
            return Ok(false);
        }

        let committed = BlockInfo::new(parent.parent_hash, grandparent_round, grandparent.number);
        state.highest_commit_block = Some(committed);
        info!(
            target: "consensus::xdpos",
            number = committed.number,
            round = committed.round,
            hash = %committed.hash,
            "Committed block"
        );

        if let Err(err) =
            self.forensics.forensics_monitoring(chain, self, &[parent, header.clone()], incoming_qc)
        {
            warn!(target: "consensus::xdpos", %err, "Forensics monitoring failed");
        }
        Ok(true)
    }

    /// Whether the validator may vote for `block_info`, whose header carries `qc`.
    pub(crate) fn verify_voting_rule(
        &self,
        chain: &dyn ChainReader,
        state: &RoundState,
        block_info: &BlockInfo,
        qc: &QuorumCert,
    ) -> XDPoSResult<bool> {
        if state.current_round <= state.highest_voted_round {
            return Ok(false);
        }
        if block_info.round != state.current_round {
            return Ok(false);
        }
        let Some(lock) = &state.lock_quorum_cert else { return Ok(true) };
        if qc.round() > lock.round() {
            return Ok(true);
        }
        is_extending_from_ancestor(chain, block_info, &lock.proposed_block_info)
    }

    /// Fill consensus fields of a block to be proposed on the highest QC.
    pub fn prepare(&self, chain: &dyn ChainReader, header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        let (current_round, highest_qc) = {
            let state = self.round_state.lock();
            (state.current_round, state.highest_quorum_cert.clone())
        };
        if header.parent_hash != highest_qc.proposed_block_info.hash {
            return Err(XDPoSError::NotReadyToPropose {
                parent: header.parent_hash,
                highest_qc: highest_qc.proposed_block_info.hash,
            });
        }

        header.extra_data = ExtraFieldsV2::new(current_round, highest_qc).encode_to_vec().into();
        header.nonce = B64::ZERO;

        let parent = header
            .number
            .checked_sub(1)
            .and_then(|number| chain.header(header.parent_hash, number))
            .ok_or(XDPoSError::UnknownAncestor)?;
        header.difficulty = U256::from(1);

        let (is_switch, _) = self.is_epoch_switch(header)?;
        if is_switch {
            let (masternodes, penalties) =
                self.calc_masternodes(chain, header.number, header.parent_hash)?;
            debug!(
                target: "consensus::xdpos",
                number = header.number,
                masternodes = masternodes.len(),
                penalties = penalties.len(),
                "Preparing epoch switch block"
            );
            header.validators = addresses_to_bytes(&masternodes);
            header.penalties = addresses_to_bytes(&penalties);
        } else {
            header.validators = Default::default();
            header.penalties = Default::default();
        }

        header.mix_hash = B256::ZERO;
        header.timestamp = (parent.timestamp + self.config.period).max(unix_now());
        Ok(())
    }

    /// Sign `header` with the authorized key.
    pub fn seal(&self, header: &mut XdcBlockHeader) -> XDPoSResult<()> {
        if header.number == 0 {
            return Err(XDPoSError::UnknownBlock);
        }
        let signer = self.signer()?;
        header.validator = signer.sign_hash(header.seal_hash())?;
        Ok(())
    }

    /// Address that sealed `header`
    pub fn author(&self, header: &XdcBlockHeader) -> XDPoSResult<Address> {
        let hash = header.hash_slow();
        if let Some(author) = self.signatures.lock().get(&hash) {
            return Ok(*author);
        }
        if header.validator.is_empty() {
            return Err(XDPoSError::MissingSignature);
        }
        let author = recover_signer(&header.seal_hash(), &header.validator)?;
        self.signatures.lock().put(hash, author);
        Ok(author)
    }

    /// Apply epoch rewards and clear the uncle hash.
    ///
    /// Rewards are only paid on epoch switch blocks and only when a reward
    /// hook is installed.
    pub fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut XdcBlockHeader,
        state: &mut dyn RewardState,
    ) -> XDPoSResult<Option<RewardDistribution>> {
        let (is_switch, _) = self.is_epoch_switch(header)?;
        let mut rewards = None;

        if is_switch && let Some(hook) = &self.reward_hook {
            let distribution = hook.hook_reward(chain, self, header)?;
            distribution.apply(state);
            if let Some(folder) = &self.config.store_reward_folder {
                let path = folder.join(format!("{}.{}", header.number, header.hash_slow()));
                let written = serde_json::to_vec_pretty(&distribution)
                    .map_err(|err| err.to_string())
                    .and_then(|json| std::fs::write(&path, json).map_err(|err| err.to_string()));
                if let Err(err) = written {
                    warn!(target: "consensus::xdpos", path = %path.display(), %err, "Failed to store rewards");
                }
            }
            rewards = Some(distribution);
        }

        header.ommers_hash = EMPTY_OMMER_ROOT_HASH;
        Ok(rewards)
    }

    /// Whether `signer` should propose the block after `parent` in the current round.
    pub fn your_turn(
        &self,
        chain: &dyn ChainReader,
        parent: &XdcBlockHeader,
        signer: Address,
    ) -> XDPoSResult<bool> {
        let mut state = self.round_state.lock();
        self.initial_locked(chain, &mut state, parent)?;

        let params = self.params();
        if unix_now().saturating_sub(parent.timestamp) < params.mine_period {
            trace!(target: "consensus::xdpos", number = parent.number, "Waiting for mine period");
            return Ok(false);
        }

        let round = state.current_round;
        let (is_switch, _) = self.is_epoch_switch_at_round(round, parent)?;
        let masternodes = if is_switch {
            if parent.number == self.switch_block() {
                self.extra_fields(parent)?.2
            } else {
                self.calc_masternodes(chain, parent.number + 1, parent.hash_slow())?.0
            }
        } else {
            self.masternodes(chain, parent)
        };
        drop(state);

        if masternodes.is_empty() {
            return Err(XDPoSError::SnapshotNotFound("masternodes not found".to_string()));
        }
        if !masternodes.contains(&signer) {
            return Ok(false);
        }
        let leader = super::proposer::select_proposer(round, self.config.epoch, &masternodes)?;
        debug!(target: "consensus::xdpos", round, %leader, %signer, "Checked turn");
        Ok(leader == signer)
    }

    /// Signing transactions included in the block `hash`, cached per block.
    pub fn signing_txs(&self, chain: &dyn ChainReader, hash: B256) -> Vec<SigningTx> {
        if let Some(txs) = self.signing_txs.lock().get(&hash) {
            return txs.clone();
        }
        let Some(transactions) = chain.block_transactions(hash) else { return Vec::new() };
        let txs: Vec<_> =
            transactions.iter().filter_map(crate::signing_tx::parse_signing_tx).collect();
        self.signing_txs.lock().put(hash, txs.clone());
        txs
    }
}

/// Whether `current` descends from `ancestor`, following parent hashes.
pub(crate) fn is_extending_from_ancestor(
    chain: &dyn ChainReader,
    current: &BlockInfo,
    ancestor: &BlockInfo,
) -> XDPoSResult<bool> {
    let Some(distance) = current.number.checked_sub(ancestor.number) else { return Ok(false) };
    let mut hash = current.hash;
    for _ in 0..distance {
        let header = chain.header_by_hash(hash).ok_or_else(|| {
            XDPoSError::BlockInfo(format!("missing ancestor header at hash: {hash}"))
        })?;
        hash = header.parent_hash;
    }
    Ok(hash == ancestor.hash)
}
