//! Fork and equivocation forensics.
//!
//! After every commit the engine records the three QCs of the committed
//! chain. Later QCs and votes are compared with them:
//! - a QC on a chain that does not extend the committed one proves that some
//!   masternodes signed conflicting QCs (`QC` proof)
//! - a masternode voting for two blocks of one round, or voting against a QC
//!   it already signed, is reported (`Vote` proof)
//!
//! Proofs are published on a broadcast channel. Nothing here feeds back into
//! consensus.

use super::{
    BlockInfo, QuorumCert, Round, Vote, XDPoSV2Engine, engine::is_extending_from_ancestor,
    pool::VotePool, types::vote_sig_hash,
};
use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    signer::recover_signer,
};
use alloc::{format, string::String, vec::Vec};
use alloy_primitives::{Address, B256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use xdc_primitives::XdcBlockHeader;

/// Number of committed QCs kept for comparison
pub const NUM_OF_FORENSICS_QC: usize = 3;

const FORENSICS_CHANNEL_SIZE: usize = 64;

/// One side of a QC fork
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForensicsInfo {
    /// Block hashes from the diverging block to the certified block
    pub hash_path: Vec<B256>,
    /// The conflicting QC
    pub quorum_cert: QuorumCert,
    /// Masternodes that signed it
    pub signer_addresses: Vec<Address>,
}

/// Evidence of two QCs on diverging chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForensicsContent {
    /// Last common ancestor of both chains
    pub diverging_block_hash: B256,
    /// Whether the two QCs belong to different epochs
    pub across_epoch: bool,
    /// Number of the last common ancestor
    pub diverging_block_number: u64,
    /// QC with the smaller round
    pub smaller_round_info: ForensicsInfo,
    /// QC with the larger round
    pub larger_round_info: ForensicsInfo,
}

/// Evidence of one masternode signing two conflicting votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteEquivocationContent {
    /// Vote with the smaller round
    pub smaller_round_vote: Vote,
    /// Vote with the larger round
    pub larger_round_vote: Vote,
    /// Masternode that signed both
    pub signer: Address,
}

/// Forensics proof payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "forensicsType", content = "content")]
pub enum ForensicsProof {
    /// Conflicting QCs
    #[serde(rename = "QC")]
    Qc(ForensicsContent),
    /// Conflicting votes
    #[serde(rename = "Vote")]
    Vote(VoteEquivocationContent),
}

/// A forensics report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForensicsEvent {
    /// Stable identifier, equal for repeated reports of the same evidence
    pub id: String,
    /// Evidence
    #[serde(flatten)]
    pub proof: ForensicsProof,
}

impl ForensicsEvent {
    /// `"QC"` or `"Vote"`
    pub const fn kind(&self) -> &'static str {
        match self.proof {
            ForensicsProof::Qc(_) => "QC",
            ForensicsProof::Vote(_) => "Vote",
        }
    }
}

/// Forensics monitor state
#[derive(Debug)]
pub struct Forensics {
    highest_committed_qcs: Mutex<Option<[QuorumCert; NUM_OF_FORENSICS_QC]>>,
    events: broadcast::Sender<ForensicsEvent>,
}

impl Default for Forensics {
    fn default() -> Self {
        Self::new()
    }
}

impl Forensics {
    /// Create a monitor with no committed QCs
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FORENSICS_CHANNEL_SIZE);
        Self { highest_committed_qcs: Mutex::new(None), events }
    }

    /// Subscribe to reports
    pub fn subscribe(&self) -> broadcast::Receiver<ForensicsEvent> {
        self.events.subscribe()
    }

    /// The QCs of the latest committed chain, oldest first
    pub fn highest_committed_qcs(&self) -> Option<[QuorumCert; NUM_OF_FORENSICS_QC]> {
        self.highest_committed_qcs.lock().clone()
    }

    /// Compare `incoming_qc` with the committed chain, then record the new
    /// committed chain `headers` (parent, block) certified by `incoming_qc`.
    pub fn forensics_monitoring(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        headers: &[XdcBlockHeader; 2],
        incoming_qc: &QuorumCert,
    ) -> XDPoSResult<()> {
        if let Err(err) = self.process_forensics(chain, engine, incoming_qc) {
            debug!(target: "consensus::xdpos::forensics", %err, "Forensics skipped");
        }
        self.set_committed_qcs(engine, headers, incoming_qc)
    }

    /// Record the committed chain: the QCs carried by `headers` plus `incoming_qc`.
    pub fn set_committed_qcs(
        &self,
        engine: &XDPoSV2Engine,
        headers: &[XdcBlockHeader; 2],
        incoming_qc: &QuorumCert,
    ) -> XDPoSResult<()> {
        let [parent, block] = headers;
        let first = engine.decode_v2_extra(parent)?.quorum_cert;
        let second = engine.decode_v2_extra(block)?.quorum_cert;

        if second.proposed_block_info.hash != parent.hash_slow() {
            return Err(XDPoSError::Forensics(
                "headers shall be on the same chain and in the right order".into(),
            ));
        }
        if incoming_qc.proposed_block_info.hash != block.hash_slow() {
            return Err(XDPoSError::Forensics(
                "incomingQc is not pointing at the last header received".into(),
            ));
        }

        *self.highest_committed_qcs.lock() = Some([first, second, incoming_qc.clone()]);
        Ok(())
    }

    /// Look for a QC fork between `incoming_qc` and the committed chain.
    pub fn process_forensics(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        incoming_qc: &QuorumCert,
    ) -> XDPoSResult<()> {
        let committed = self
            .highest_committed_qcs()
            .ok_or_else(|| XDPoSError::Forensics("highest committed QCs value not set".into()))?;
        let incoming = self.find_ancestor_qcs(engine, chain, incoming_qc, NUM_OF_FORENSICS_QC - 1)?;

        if self.check_qcs_on_the_same_chain(chain, &committed, &incoming)? {
            trace!(target: "consensus::xdpos::forensics", round = incoming_qc.round(), "QCs on the same chain");
            return Ok(());
        }

        let (lower_round_qcs, higher_round_qcs) = if incoming[0].round() < committed[0].round() {
            (&incoming[..], &committed[..])
        } else {
            (&committed[..], &incoming[..])
        };

        if let Some((first, second)) = find_qcs_in_same_round(&committed, &incoming) {
            self.send_forensic_proof(chain, engine, first, second)
        } else {
            let target = &lower_round_qcs[NUM_OF_FORENSICS_QC - 1];
            let ancestor =
                self.find_ancestor_qc_through_round(engine, chain, &higher_round_qcs[0], target.round())?;
            self.send_forensic_proof(chain, engine, &ancestor, target)
        }
    }

    /// `qc` and its `distance` ancestor QCs, oldest first.
    fn find_ancestor_qcs(
        &self,
        engine: &XDPoSV2Engine,
        chain: &dyn ChainReader,
        qc: &QuorumCert,
        distance: usize,
    ) -> XDPoSResult<Vec<QuorumCert>> {
        let mut qcs = Vec::with_capacity(distance + 1);
        qcs.push(qc.clone());
        let mut current = qc.clone();
        for _ in 0..distance {
            current = self.parent_qc(engine, chain, &current)?;
            qcs.push(current.clone());
        }
        qcs.reverse();
        Ok(qcs)
    }

    /// The QC carried by the block `qc` certifies.
    fn parent_qc(
        &self,
        engine: &XDPoSV2Engine,
        chain: &dyn ChainReader,
        qc: &QuorumCert,
    ) -> XDPoSResult<QuorumCert> {
        let header = chain.header_by_hash(qc.proposed_block_info.hash).ok_or_else(|| {
            XDPoSError::Forensics(format!(
                "unable to find block header in forensics, hash: {}",
                qc.proposed_block_info.hash
            ))
        })?;
        Ok(engine.decode_v2_extra(&header)?.quorum_cert)
    }

    fn check_qcs_on_the_same_chain(
        &self,
        chain: &dyn ChainReader,
        first: &[QuorumCert],
        second: &[QuorumCert],
    ) -> XDPoSResult<bool> {
        let (lower, higher) = if first[0].proposed_block_info.number <= second[0].proposed_block_info.number {
            (&first[0], &second[0])
        } else {
            (&second[0], &first[0])
        };
        is_extending_from_ancestor(chain, &higher.proposed_block_info, &lower.proposed_block_info)
    }

    /// Walk back from `qc` to the first ancestor QC whose round is at most `target_round`.
    fn find_ancestor_qc_through_round(
        &self,
        engine: &XDPoSV2Engine,
        chain: &dyn ChainReader,
        qc: &QuorumCert,
        target_round: Round,
    ) -> XDPoSResult<QuorumCert> {
        let mut ancestor = qc.clone();
        while ancestor.round() > target_round {
            ancestor = self.parent_qc(engine, chain, &ancestor)?;
        }
        Ok(ancestor)
    }

    /// Publish a proof that `first` and `second` certify diverging chains.
    pub fn send_forensic_proof(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        first: &QuorumCert,
        second: &QuorumCert,
    ) -> XDPoSResult<()> {
        let (lower, higher) = if first.round() < second.round() { (first, second) } else { (second, first) };

        let (ancestor_hash, lower_path, higher_path) =
            find_ancestor_block_hash(chain, &lower.proposed_block_info, &higher.proposed_block_info)?;
        let ancestor = chain.header_by_hash(ancestor_hash).ok_or_else(|| {
            XDPoSError::Forensics(format!("can't find ancestor block via hash {ancestor_hash}"))
        })?;

        let lower_epoch = engine.epoch_switch_info(chain, None, lower.proposed_block_info.hash)?;
        let higher_epoch = engine.epoch_switch_info(chain, None, higher.proposed_block_info.hash)?;
        let across_epoch = lower_epoch.epoch_switch_block_info.hash != higher_epoch.epoch_switch_block_info.hash;

        let content = ForensicsContent {
            diverging_block_hash: ancestor_hash,
            across_epoch,
            diverging_block_number: ancestor.number,
            smaller_round_info: ForensicsInfo {
                hash_path: lower_path,
                quorum_cert: lower.clone(),
                signer_addresses: qc_signers(lower),
            },
            larger_round_info: ForensicsInfo {
                hash_path: higher_path,
                quorum_cert: higher.clone(),
                signer_addresses: qc_signers(higher),
            },
        };
        let id = format!(
            "{ancestor_hash}:{}:{}",
            lower.proposed_block_info.hash, higher.proposed_block_info.hash
        );
        self.publish(ForensicsEvent { id, proof: ForensicsProof::Qc(content) });
        Ok(())
    }

    /// Check a vote signed by `signer` against the committed chain.
    pub fn process_vote_equivocation(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        vote: &Vote,
        signer: Address,
    ) -> XDPoSResult<()> {
        let committed = self
            .highest_committed_qcs()
            .ok_or_else(|| XDPoSError::Forensics("highest committed QCs value not set".into()))?;
        let highest = &committed[NUM_OF_FORENSICS_QC - 1];
        if vote.proposed_block_info.round < highest.round() {
            return Ok(());
        }
        if is_extending_from_ancestor(chain, &vote.proposed_block_info, &committed[0].proposed_block_info)? {
            return Ok(());
        }

        let vote_block = chain.header_by_hash(vote.proposed_block_info.hash).ok_or_else(|| {
            XDPoSError::Forensics(format!(
                "unable to find voted block, hash: {}",
                vote.proposed_block_info.hash
            ))
        })?;
        let vote_parent_qc = engine.decode_v2_extra(&vote_block)?.quorum_cert;

        // the vote skips over the committed QC
        if vote_parent_qc.round() < highest.round() {
            let hash = vote_sig_hash(&highest_vote_for_sign(highest));
            for signature in &highest.signatures {
                if recover_signer(&hash, signature).is_ok_and(|committed_signer| committed_signer == signer) {
                    let committed_vote = Vote {
                        proposed_block_info: highest.proposed_block_info,
                        signature: signature.clone(),
                        gap_number: highest.gap_number,
                    };
                    self.send_vote_equivocation_proof(vote, &committed_vote, signer);
                    break;
                }
            }
            Ok(())
        } else {
            self.process_forensics(chain, engine, &vote_parent_qc)
        }
    }

    /// Report a signer with two votes for different blocks in one round.
    pub fn detect_equivocation_in_vote_pool(&self, vote: &Vote, signer: Address, pool: &VotePool) {
        let key = vote.pool_key();
        let round = vote.proposed_block_info.round;
        for (pooled_key, pooled_signer, pooled) in pool.iter() {
            if pooled_key != key && pooled.proposed_block_info.round == round && *pooled_signer == signer {
                self.send_vote_equivocation_proof(vote, pooled, signer);
            }
        }
    }

    fn send_vote_equivocation_proof(&self, first: &Vote, second: &Vote, signer: Address) {
        let (smaller, larger) = if first.proposed_block_info.round < second.proposed_block_info.round {
            (first, second)
        } else {
            (second, first)
        };
        let id = format!(
            "{signer}:{}:{}",
            smaller.proposed_block_info.round, larger.proposed_block_info.round
        );
        let content = VoteEquivocationContent {
            smaller_round_vote: smaller.clone(),
            larger_round_vote: larger.clone(),
            signer,
        };
        self.publish(ForensicsEvent { id, proof: ForensicsProof::Vote(content) });
    }

    fn publish(&self, event: ForensicsEvent) {
        warn!(target: "consensus::xdpos::forensics", id = %event.id, kind = event.kind(), "Forensics proof");
        if self.events.send(event).is_err() {
            trace!(target: "consensus::xdpos::forensics", "No forensics subscriber");
        }
    }
}

fn highest_vote_for_sign(qc: &QuorumCert) -> super::VoteForSign {
    super::VoteForSign { proposed_block_info: qc.proposed_block_info, gap_number: qc.gap_number }
}

/// Recovered signers of a QC. Unrecoverable signatures are skipped.
fn qc_signers(qc: &QuorumCert) -> Vec<Address> {
    let hash = vote_sig_hash(&highest_vote_for_sign(qc));
    qc.signatures.iter().filter_map(|signature| recover_signer(&hash, signature).ok()).collect()
}

/// Pair of QCs with the same round, one from each set.
pub fn find_qcs_in_same_round<'a>(
    first: &'a [QuorumCert],
    second: &'a [QuorumCert],
) -> Option<(&'a QuorumCert, &'a QuorumCert)> {
    first.iter().find_map(|a| second.iter().find(|b| a.round() == b.round()).map(|b| (a, b)))
}

/// Last common ancestor of two blocks and the hash paths from it to each block.
///
/// Both paths start with the ancestor and end with the respective block.
pub fn find_ancestor_block_hash(
    chain: &dyn ChainReader,
    first: &BlockInfo,
    second: &BlockInfo,
) -> XDPoSResult<(B256, Vec<B256>, Vec<B256>)> {
    let parent_of = |hash: B256| {
        chain.header_by_hash(hash).map(|header| header.parent_hash).ok_or_else(|| {
            XDPoSError::Forensics(format!("unable to find block header in forensics, hash: {hash}"))
        })
    };

    let mut first_hash = first.hash;
    let mut second_hash = second.hash;
    let mut first_path = Vec::new();
    let mut second_path = Vec::new();

    for _ in second.number..first.number {
        first_path.push(first_hash);
        first_hash = parent_of(first_hash)?;
    }
    for _ in first.number..second.number {
        second_path.push(second_hash);
        second_hash = parent_of(second_hash)?;
    }
    while first_hash != second_hash {
        first_path.push(first_hash);
        second_path.push(second_hash);
        first_hash = parent_of(first_hash)?;
        second_hash = parent_of(second_hash)?;
    }

    first_path.push(first_hash);
    second_path.push(second_hash);
    first_path.reverse();
    second_path.reverse();
    Ok((first_hash, first_path, second_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qc(round: Round, hash: u8) -> QuorumCert {
        QuorumCert::new(BlockInfo::new(B256::with_last_byte(hash), round, round + 10), 5)
    }

    #[test]
    fn test_find_qcs_in_same_round() {
        let committed = [qc(4, 1), qc(5, 2), qc(6, 3)];
        let incoming = [qc(6, 9), qc(7, 10), qc(8, 11)];
        let (a, b) = find_qcs_in_same_round(&committed, &incoming).unwrap();
        assert_eq!((a.round(), b.round()), (6, 6));
        assert_ne!(a.proposed_block_info.hash, b.proposed_block_info.hash);

        assert!(find_qcs_in_same_round(&committed[..2], &incoming).is_none());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let vote = Vote {
            proposed_block_info: BlockInfo::new(B256::with_last_byte(1), 3, 13),
            signature: Default::default(),
            gap_number: 5,
        };
        let event = ForensicsEvent {
            id: "x".into(),
            proof: ForensicsProof::Vote(VoteEquivocationContent {
                smaller_round_vote: vote.clone(),
                larger_round_vote: vote,
                signer: Address::ZERO,
            }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["forensicsType"], "Vote");
        assert_eq!(json["id"], "x");
        assert!(json["content"]["smallerRoundVote"].is_object());
        assert_eq!(event.kind(), "Vote");
    }
}
