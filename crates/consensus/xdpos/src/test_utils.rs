//! Test fixtures.
//!
//! [`MockChain`] is an in-memory [`ChainReader`]. [`TestEnv`] seeds it with a
//! v1 chain up to the switch block, starts a v2 engine on it and builds
//! correctly signed v2 blocks on demand. The `*_faker` methods poke the
//! engine's round state directly and are only compiled for tests.

use crate::{
    chain::{BlockTransaction, Candidate, CandidateSource, ChainReader},
    config::{V2Config, V2RoundConfig, XDPoSConfig},
    constants::EXTRA_SEAL,
    db::MemoryStore,
    errors::XDPoSResult,
    extra_data::{V1ExtraData, hash_without_seal},
    signer::{LocalSigner, Signer},
    signing_tx::{BLOCK_SIGNERS, encode_sign_call},
    v2::{
        BlockInfo, ExtraFieldsV2, QuorumCert, Round, Timeout, TimeoutCert, TimeoutForSign, Vote,
        VoteForSign, XDPoSV2Engine,
        proposer::select_proposer,
        types::{timeout_sig_hash, vote_sig_hash},
        verification::cert_threshold_count,
    },
};
use alloc::{sync::Arc, vec::Vec};
use alloy_primitives::{Address, B256, Bytes, U256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use xdc_primitives::{NONCE_DROP_VOTE, XdcBlockHeader, addresses_to_bytes};

/// Switch block of [`test_config`]
pub const TEST_SWITCH_BLOCK: u64 = 10;

/// Timestamp of the genesis block built by [`TestEnv`]
pub const TEST_GENESIS_TIME: u64 = 1_000;

#[derive(Debug, Default)]
struct MockChainInner {
    headers: HashMap<B256, XdcBlockHeader>,
    canonical: BTreeMap<u64, B256>,
    transactions: HashMap<B256, Vec<BlockTransaction>>,
}

/// In-memory chain with a canonical index and side forks.
#[derive(Debug, Default)]
pub struct MockChain {
    inner: RwLock<MockChainInner>,
}

impl MockChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `header` as the canonical block at its height, dropping any
    /// canonical blocks above it.
    pub fn insert(&self, header: XdcBlockHeader) {
        let mut inner = self.inner.write();
        let hash = header.hash_slow();
        inner.canonical.retain(|&number, _| number < header.number);
        inner.canonical.insert(header.number, hash);
        inner.headers.insert(hash, header);
    }

    /// Insert `header` reachable by hash only
    pub fn insert_fork(&self, header: XdcBlockHeader) {
        self.inner.write().headers.insert(header.hash_slow(), header);
    }

    /// Attach transactions to the block `hash`
    pub fn set_transactions(&self, hash: B256, transactions: Vec<BlockTransaction>) {
        self.inner.write().transactions.insert(hash, transactions);
    }

    /// Canonical head number
    pub fn head_number(&self) -> u64 {
        self.inner.read().canonical.keys().next_back().copied().unwrap_or_default()
    }
}

impl ChainReader for MockChain {
    fn current_header(&self) -> XdcBlockHeader {
        let inner = self.inner.read();
        inner
            .canonical
            .values()
            .next_back()
            .and_then(|hash| inner.headers.get(hash))
            .cloned()
            .unwrap_or_default()
    }

    fn header_by_number(&self, number: u64) -> Option<XdcBlockHeader> {
        let inner = self.inner.read();
        inner.canonical.get(&number).and_then(|hash| inner.headers.get(hash)).cloned()
    }

    fn header_by_hash(&self, hash: B256) -> Option<XdcBlockHeader> {
        self.inner.read().headers.get(&hash).cloned()
    }

    fn block_transactions(&self, hash: B256) -> Option<Vec<BlockTransaction>> {
        self.inner.read().transactions.get(&hash).cloned()
    }
}

/// Fixed candidate list with optional owners
#[derive(Debug, Clone, Default)]
pub struct MockCandidates {
    /// Candidates returned for every header
    pub candidates: Vec<Candidate>,
    /// Owner of each candidate, the candidate itself when missing
    pub owners: HashMap<Address, Address>,
}

impl CandidateSource for MockCandidates {
    fn candidates(&self, _header: &XdcBlockHeader) -> XDPoSResult<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }

    fn candidate_owner(&self, candidate: Address) -> Option<Address> {
        self.owners.get(&candidate).copied()
    }
}

/// `n` deterministic keys
pub fn test_signers(n: usize) -> Vec<LocalSigner> {
    (0..n)
        .map(|i| LocalSigner::from_slice(&[i as u8 + 1; 32]).expect("valid secret key"))
        .collect()
}

/// Candidates for `signers` with strictly decreasing stakes, so ranking keeps their order
pub fn test_candidates(signers: &[LocalSigner]) -> Vec<Candidate> {
    let n = signers.len() as u64;
    signers
        .iter()
        .enumerate()
        .map(|(i, signer)| Candidate {
            address: signer.address(),
            stake: U256::from((n - i as u64) * 1_000),
        })
        .collect()
}

/// Epoch 10, gap 5, v2 from block 11, 60% certificates over at most five masternodes
pub fn test_config() -> XDPoSConfig {
    let params = V2RoundConfig::default()
        .with_cert_threshold(60)
        .with_max_masternodes(5)
        .with_mine_period(2)
        .with_timeout_period(4);
    XDPoSConfig::default()
        .with_epoch(10)
        .with_gap(5)
        .with_period(2)
        .with_reward(3_000)
        .with_foundation_wallet(Address::with_last_byte(0xf0))
        .with_v2(V2Config::new(TEST_SWITCH_BLOCK).with_round_config(params))
}

/// Signing transaction of `signer` attesting the block `number`/`hash`
pub fn signing_tx(signer: Address, number: u64, hash: B256) -> BlockTransaction {
    BlockTransaction { from: signer, to: Some(BLOCK_SIGNERS), input: encode_sign_call(number, hash) }
}

/// A started v2 engine on a seeded mock chain
#[derive(Debug)]
pub struct TestEnv {
    /// Chain holding blocks `0..=TEST_SWITCH_BLOCK` plus whatever was inserted
    pub chain: Arc<MockChain>,
    /// Engine initialized at the switch block
    pub engine: Arc<XDPoSV2Engine>,
    /// Masternode keys, in masternode order
    pub signers: Vec<LocalSigner>,
    /// Candidates fed to the snapshot hook
    pub candidates: Vec<Candidate>,
}

impl TestEnv {
    /// `n` masternodes on [`test_config`]
    pub fn new(n: usize) -> Self {
        Self::with_engine(test_config(), n, |engine| engine)
    }

    /// `n` masternodes on `config`, with `customize` applied to the engine
    /// before it starts, e.g. to install hooks.
    pub fn with_engine(
        config: XDPoSConfig,
        n: usize,
        customize: impl FnOnce(XDPoSV2Engine) -> XDPoSV2Engine,
    ) -> Self {
        let engine = XDPoSV2Engine::new(config, Arc::new(MemoryStore::new())).expect("valid config");
        let signers = test_signers(n);
        let env = Self {
            chain: Arc::new(MockChain::new()),
            engine: Arc::new(customize(engine)),
            candidates: test_candidates(&signers),
            signers,
        };

        let masternodes = env.addresses();
        let mut parent = B256::ZERO;
        for number in 0..=TEST_SWITCH_BLOCK {
            let header = env.v1_block(number, parent, &masternodes);
            parent = header.hash_slow();
            env.insert(header);
        }
        let switch = env.header(TEST_SWITCH_BLOCK);
        env.engine.initial(env.chain.as_ref(), &switch).expect("engine starts at the switch block");
        env
    }

    /// Masternode addresses
    pub fn addresses(&self) -> Vec<Address> {
        self.signers.iter().map(Signer::address).collect()
    }

    /// Certificate threshold for the configured masternode count
    pub fn threshold(&self) -> usize {
        cert_threshold_count(self.signers.len(), self.engine.params().cert_threshold)
    }

    /// Canonical header at `number`
    pub fn header(&self, number: u64) -> XdcBlockHeader {
        self.chain.header_by_number(number).expect("canonical header")
    }

    /// Signer holding `address`
    pub fn signer_of(&self, address: Address) -> &LocalSigner {
        self.signers.iter().find(|signer| signer.address() == address).expect("known signer")
    }

    fn v1_block(&self, number: u64, parent_hash: B256, masternodes: &[Address]) -> XdcBlockHeader {
        let checkpoint = number % self.engine.config().epoch == 0;
        let validators = if checkpoint { masternodes.to_vec() } else { Vec::new() };
        let mut header = XdcBlockHeader {
            number,
            parent_hash,
            timestamp: TEST_GENESIS_TIME + 2 * number,
            beneficiary: self.signers[0].address(),
            difficulty: U256::from(2),
            nonce: NONCE_DROP_VOTE,
            extra_data: V1ExtraData { vanity: [0; 32], validators, seal: [0; 65] }.encode().into(),
            ..Default::default()
        };
        let seal = self.signers[0].sign_hash(hash_without_seal(&header)).expect("sign v1 seal");
        let mut extra = header.extra_data.to_vec();
        let len = extra.len();
        extra[len - EXTRA_SEAL..].copy_from_slice(&seal);
        header.extra_data = extra.into();
        header
    }

    /// Round of a block, 0 for v1 blocks
    pub fn round_of(&self, header: &XdcBlockHeader) -> Round {
        self.engine.extra_fields(header).expect("readable extra").1
    }

    /// Block info of `header`
    pub fn block_info(&self, header: &XdcBlockHeader) -> BlockInfo {
        BlockInfo::new(header.hash_slow(), self.round_of(header), header.number)
    }

    /// Gap number used by votes and QCs for the block `header`
    pub fn gap_number_of(&self, header: &XdcBlockHeader) -> u64 {
        let info = self
            .engine
            .epoch_switch_info(self.chain.as_ref(), Some(header), header.hash_slow())
            .expect("epoch switch info");
        self.engine.epoch_gap_number(info.epoch_switch_block_info.number)
    }

    /// Vote of signer `index`
    pub fn vote(&self, index: usize, info: BlockInfo, gap_number: u64) -> Vote {
        let hash = vote_sig_hash(&VoteForSign { proposed_block_info: info, gap_number });
        let signature = self.signers[index].sign_hash(hash).expect("sign vote");
        Vote { proposed_block_info: info, signature, gap_number }
    }

    /// Timeout of signer `index`
    pub fn timeout(&self, index: usize, round: Round, gap_number: u64) -> Timeout {
        let hash = timeout_sig_hash(&TimeoutForSign { round, gap_number });
        let signature = self.signers[index].sign_hash(hash).expect("sign timeout");
        Timeout { round, signature, gap_number }
    }

    /// QC over `info` signed by the first `count` signers
    pub fn sign_qc(&self, info: BlockInfo, gap_number: u64, count: usize) -> QuorumCert {
        let mut signatures: Vec<Bytes> =
            (0..count).map(|index| self.vote(index, info, gap_number).signature).collect();
        signatures.sort();
        QuorumCert { proposed_block_info: info, signatures, gap_number }
    }

    /// TC for `round` signed by the first `count` signers
    pub fn sign_tc(&self, round: Round, gap_number: u64, count: usize) -> TimeoutCert {
        let mut signatures: Vec<Bytes> =
            (0..count).map(|index| self.timeout(index, round, gap_number).signature).collect();
        signatures.sort();
        TimeoutCert { round, signatures, gap_number }
    }

    /// Threshold QC certifying `header`, sized for the parameters of its round
    pub fn qc_for(&self, header: &XdcBlockHeader) -> QuorumCert {
        let info = self.block_info(header);
        let threshold =
            cert_threshold_count(self.signers.len(), self.engine.params_at(info.round).cert_threshold);
        self.sign_qc(info, self.gap_number_of(header), threshold)
    }

    /// Block in `round` on top of `parent`, carrying a threshold QC for the parent
    pub fn build_block(&self, parent: &XdcBlockHeader, round: Round) -> XdcBlockHeader {
        self.build_block_with_qc(parent, round, self.qc_for(parent))
    }

    /// Block in `round` on top of `parent` carrying `qc`, sealed by the round leader
    pub fn build_block_with_qc(
        &self,
        parent: &XdcBlockHeader,
        round: Round,
        qc: QuorumCert,
    ) -> XdcBlockHeader {
        let chain = self.chain.as_ref();
        let mut header = XdcBlockHeader {
            parent_hash: parent.hash_slow(),
            number: parent.number + 1,
            timestamp: parent.timestamp + 2,
            difficulty: U256::from(1),
            nonce: NONCE_DROP_VOTE,
            extra_data: ExtraFieldsV2::new(round, qc).encode_to_vec().into(),
            ..Default::default()
        };

        let (is_switch, _) = self.engine.is_epoch_switch(&header).expect("v2 header");
        let masternodes = if is_switch {
            let (masternodes, penalties) = self
                .engine
                .calc_masternodes(chain, header.number, header.parent_hash)
                .expect("epoch masternodes");
            header.validators = addresses_to_bytes(&masternodes);
            header.penalties = addresses_to_bytes(&penalties);
            masternodes
        } else {
            self.engine.masternodes(chain, parent)
        };

        let leader = select_proposer(round, self.engine.config().epoch, &masternodes).expect("leader");
        header.beneficiary = leader;
        self.seal(&mut header, leader);
        header
    }

    /// Re-seal `header` with the key of `author`
    pub fn seal(&self, header: &mut XdcBlockHeader, author: Address) {
        header.validator = self.signer_of(author).sign_hash(header.seal_hash()).expect("sign seal");
    }

    /// Insert a canonical block and run the engine's insertion hook on it
    pub fn insert(&self, header: XdcBlockHeader) {
        self.chain.insert(header.clone());
        self.engine.on_block_inserted(&header, &self.candidates).expect("block insertion hook");
    }

    /// Extend the canonical head with `count` blocks in consecutive rounds
    pub fn extend(&self, count: usize) -> Vec<XdcBlockHeader> {
        let mut parent = self.chain.current_header();
        let mut built = Vec::with_capacity(count);
        for _ in 0..count {
            let round = self.round_of(&parent) + 1;
            let header = self.build_block(&parent, round);
            self.insert(header.clone());
            parent = header.clone();
            built.push(header);
        }
        built
    }

    /// Extend the canonical head with one block per round in `rounds`
    pub fn extend_with_rounds(&self, rounds: &[Round]) -> Vec<XdcBlockHeader> {
        let mut parent = self.chain.current_header();
        let mut built = Vec::with_capacity(rounds.len());
        for &round in rounds {
            let header = self.build_block(&parent, round);
            self.insert(header.clone());
            parent = header.clone();
            built.push(header);
        }
        built
    }
}

#[cfg(test)]
impl XDPoSV2Engine {
    pub(crate) fn set_new_round_faker(&self, round: Round) {
        let mut state = self.round_state.lock();
        self.set_new_round(&mut state, round);
    }

    pub(crate) fn set_highest_voted_round_faker(&self, round: Round) {
        self.round_state.lock().highest_voted_round = round;
    }

    pub(crate) fn set_lock_qc_faker(&self, qc: Option<QuorumCert>) {
        self.round_state.lock().lock_quorum_cert = qc;
    }

    pub(crate) fn vote_pool_size_faker(&self, vote: &Vote) -> usize {
        self.round_state.lock().vote_pool.size(&vote.pool_key())
    }

    pub(crate) fn timeout_pool_size_faker(&self, timeout: &Timeout) -> usize {
        self.round_state.lock().timeout_pool.size(&timeout.pool_key())
    }
}
