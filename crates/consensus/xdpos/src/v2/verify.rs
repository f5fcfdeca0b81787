//! Certificate, message and header verification.

use super::{
    BlockInfo, QuorumCert, SyncInfo, Timeout, TimeoutCert, TimeoutForSign, Vote, VoteForSign,
    XDPoSV2Engine,
    engine::unix_now,
    types::{timeout_sig_hash, vote_sig_hash},
    verification::{cert_threshold_count, unique_signatures, verify_msg_signature, verify_signers},
};
use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
};
use alloc::{format, string::ToString, sync::Arc, vec::Vec};
use alloy_primitives::{Address, B256};
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use xdc_primitives::{EMPTY_OMMER_ROOT_HASH, NONCE_AUTH_VOTE, NONCE_DROP_VOTE, XdcBlockHeader};

impl XDPoSV2Engine {
    /// Check that `info` describes a block of the chain.
    ///
    /// `header` short-cuts the lookup when the caller holds the block already.
    pub fn verify_block_info(
        &self,
        chain: &dyn ChainReader,
        info: &BlockInfo,
        header: Option<&XdcBlockHeader>,
    ) -> XDPoSResult<()> {
        let header = match header.filter(|header| header.hash_slow() == info.hash) {
            Some(header) => header.clone(),
            None => chain.header_by_hash(info.hash).ok_or_else(|| {
                XDPoSError::BlockInfo(format!(
                    "[VerifyBlockInfo] header doesn't exist for the received blockInfo at hash: {}",
                    info.hash
                ))
            })?,
        };

        if header.number != info.number {
            return Err(XDPoSError::BlockInfo(format!(
                "[VerifyBlockInfo] chain header number does not match for the received blockInfo at hash: {}",
                info.hash
            )));
        }

        if info.number == self.switch_block() {
            if info.round != 0 {
                return Err(XDPoSError::BlockInfo(
                    "[VerifyBlockInfo] switch block round have to be 0".to_string(),
                ));
            }
            return Ok(());
        }

        let round = self.decode_v2_extra(&header)?.round;
        if round != info.round {
            return Err(XDPoSError::BlockInfo(format!(
                "[VerifyBlockInfo] chain block's round does not match from blockInfo at hash: {} and block round: {}, blockInfo Round: {}",
                info.hash, round, info.round
            )));
        }
        Ok(())
    }

    /// Verify a quorum certificate against the masternodes of its block's epoch.
    ///
    /// `parent` is the certified block when it may not be persisted yet.
    pub fn verify_qc(
        &self,
        chain: &dyn ChainReader,
        qc: &QuorumCert,
        parent: Option<&XdcBlockHeader>,
    ) -> XDPoSResult<()> {
        let info = &qc.proposed_block_info;
        let parent = parent.filter(|header| header.number == info.number && header.hash_slow() == info.hash);
        let epoch_info = self
            .epoch_switch_info(chain, parent, info.hash)
            .map_err(|err| XDPoSError::InvalidQC(format!("fail to get epoch switch info: {err}")))?;

        let (unique, duplicates) = unique_signatures(&qc.signatures);
        if !duplicates.is_empty() {
            warn!(
                target: "consensus::xdpos",
                round = info.round,
                duplicates = duplicates.len(),
                "QC carries duplicated signatures"
            );
        }

        if info.number > self.switch_block() {
            let threshold = cert_threshold_count(
                epoch_info.masternodes.len(),
                self.params_at(info.round).cert_threshold,
            );
            if unique.len() < threshold {
                return Err(XDPoSError::InvalidQC(format!(
                    "{} signatures below threshold {threshold} at round {}",
                    unique.len(),
                    info.round
                )));
            }

            let gap_number = self.epoch_gap_number(epoch_info.epoch_switch_block_info.number);
            if gap_number != qc.gap_number {
                return Err(XDPoSError::InvalidQC(format!(
                    "gap number mismatch, expected {gap_number} got {}",
                    qc.gap_number
                )));
            }
        }

        let hash = vote_sig_hash(&VoteForSign { proposed_block_info: *info, gap_number: qc.gap_number });
        verify_signers(&hash, &unique, &epoch_info.masternodes).map_err(XDPoSError::InvalidQCSignatures)?;

        self.verify_block_info(chain, info, parent)
    }

    /// Verify a timeout certificate against the snapshot at its gap block.
    pub fn verify_tc(&self, chain: &dyn ChainReader, tc: &TimeoutCert) -> XDPoSResult<()> {
        let snapshot = self.get_snapshot(chain, tc.gap_number, true)?;
        if snapshot.next_epoch_masternodes.is_empty() {
            return Err(XDPoSError::SnapshotNotFound(format!(
                "empty master node list from snapshot at gap {}",
                tc.gap_number
            )));
        }

        let (unique, _) = unique_signatures(&tc.signatures);
        let threshold = cert_threshold_count(
            snapshot.next_epoch_masternodes.len(),
            self.params_at(tc.round).cert_threshold,
        );
        if unique.len() < threshold {
            return Err(XDPoSError::InvalidTC(format!(
                "{} signatures below threshold {threshold} at round {}",
                unique.len(),
                tc.round
            )));
        }

        let hash = timeout_sig_hash(&TimeoutForSign { round: tc.round, gap_number: tc.gap_number });
        verify_signers(&hash, &unique, &snapshot.next_epoch_masternodes)
            .map_err(XDPoSError::InvalidTCSignatures)?;
        Ok(())
    }

    /// Whether a gossiped vote should be processed and relayed.
    pub fn verify_vote_message(&self, chain: &dyn ChainReader, vote: &Vote) -> XDPoSResult<bool> {
        let current_round = self.current_round();
        if vote.proposed_block_info.round < current_round {
            debug!(
                target: "consensus::xdpos",
                round = vote.proposed_block_info.round,
                current_round,
                "Disqualified stale vote"
            );
            if let Ok(signer) = crate::signer::recover_signer(&vote_sig_hash(&vote.for_sign()), &vote.signature)
                && let Err(err) = self.forensics.process_vote_equivocation(chain, self, vote, signer)
            {
                debug!(target: "consensus::xdpos", %err, "Vote equivocation check failed");
            }
            return Ok(false);
        }
        if let Some(header) = chain.header_by_hash(vote.proposed_block_info.hash) {
            self.verify_block_info(chain, &vote.proposed_block_info, Some(&header))?;
        }

        let snapshot = self.get_snapshot(chain, vote.gap_number, true)?;
        if snapshot.next_epoch_masternodes.is_empty() {
            return Err(XDPoSError::SnapshotNotFound(format!(
                "empty master node list from snapshot at gap {}",
                vote.gap_number
            )));
        }
        let (valid, signer) = verify_msg_signature(
            &vote_sig_hash(&vote.for_sign()),
            &vote.signature,
            &snapshot.next_epoch_masternodes,
        )?;
        if !valid {
            warn!(target: "consensus::xdpos", %signer, round = vote.proposed_block_info.round, "Vote from non-masternode");
        }
        Ok(valid)
    }

    /// Whether a gossiped timeout should be processed and relayed.
    pub fn verify_timeout_message(&self, chain: &dyn ChainReader, timeout: &Timeout) -> XDPoSResult<bool> {
        let current_round = self.current_round();
        if timeout.round < current_round {
            debug!(target: "consensus::xdpos", round = timeout.round, current_round, "Disqualified stale timeout");
            return Ok(false);
        }

        let snapshot = self.get_snapshot(chain, timeout.gap_number, true)?;
        if snapshot.next_epoch_masternodes.is_empty() {
            return Err(XDPoSError::SnapshotNotFound(format!(
                "empty master node list from snapshot at gap {}",
                timeout.gap_number
            )));
        }
        let (valid, signer) = verify_msg_signature(
            &timeout_sig_hash(&timeout.for_sign()),
            &timeout.signature,
            &snapshot.next_epoch_masternodes,
        )?;
        if !valid {
            warn!(target: "consensus::xdpos", %signer, round = timeout.round, "Timeout from non-masternode");
        }
        Ok(valid)
    }

    /// Whether a gossiped sync info carries anything new and valid.
    pub fn verify_sync_info_message(&self, chain: &dyn ChainReader, sync_info: &SyncInfo) -> XDPoSResult<bool> {
        let (highest_qc_round, highest_tc_round) = {
            let state = self.round_state.lock();
            (state.highest_quorum_cert.round(), state.highest_timeout_cert.round)
        };
        let qc_round = sync_info.highest_quorum_cert.round();
        let tc_round = sync_info.highest_timeout_cert.as_ref().map_or(0, |tc| tc.round);
        if qc_round <= highest_qc_round && tc_round <= highest_tc_round {
            trace!(target: "consensus::xdpos", qc_round, tc_round, "Sync info carries nothing new");
            return Ok(false);
        }

        self.verify_qc(chain, &sync_info.highest_quorum_cert, None)?;
        if let Some(tc) = &sync_info.highest_timeout_cert {
            self.verify_tc(chain, tc)?;
        }
        Ok(true)
    }

    /// Verify a v2 header.
    ///
    /// `full_verify` additionally checks the seal, the author and the timestamp
    /// against the local clock.
    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        self.verify_header_with_parents(chain, header, &[], full_verify)
    }

    /// Verify `header` whose ancestors may be the not yet persisted `parents`.
    pub(crate) fn verify_header_with_parents(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
        parents: &[XdcBlockHeader],
        full_verify: bool,
    ) -> XDPoSResult<()> {
        if self.v2_config.skip_v2_validation {
            return Ok(());
        }
        let hash = header.hash_slow();
        if self.verified_headers.lock().contains(&hash) {
            trace!(target: "consensus::xdpos", number = header.number, "Header already verified");
            return Ok(());
        }

        if full_verify {
            if header.validator.is_empty() {
                return Err(XDPoSError::NoValidatorSignature);
            }
            if header.timestamp > unix_now() {
                return Err(XDPoSError::FutureBlock);
            }
        }

        let parent_number = header.number.checked_sub(1).ok_or(XDPoSError::UnknownBlock)?;
        let parent = match parents.last() {
            Some(parent) => Some(parent.clone()),
            None => chain.header(header.parent_hash, parent_number),
        };

        let fields = self.decode_v2_extra(header)?;
        self.verify_qc(chain, &fields.quorum_cert, parent.as_ref())?;

        if header.nonce != NONCE_AUTH_VOTE && header.nonce != NONCE_DROP_VOTE {
            return Err(XDPoSError::InvalidVote);
        }
        if header.mix_hash != B256::ZERO {
            return Err(XDPoSError::InvalidMixDigest);
        }
        if header.ommers_hash != EMPTY_OMMER_ROOT_HASH {
            return Err(XDPoSError::InvalidUncleHash);
        }

        let (is_switch, _) = self.is_epoch_switch(header)?;
        if is_switch {
            if header.nonce != NONCE_DROP_VOTE {
                return Err(XDPoSError::InvalidCheckpointVote);
            }
            if header.validators.is_empty() {
                return Err(XDPoSError::EmptyEpochSwitchValidators);
            }
            if header.validators.len() % Address::len_bytes() != 0 {
                return Err(XDPoSError::InvalidCheckpointSigners);
            }
        } else if !header.validators.is_empty() || !header.penalties.is_empty() {
            return Err(XDPoSError::InvalidFieldInNonEpochSwitch);
        }

        let parent = parent
            .filter(|parent| parent.number == parent_number && parent.hash_slow() == header.parent_hash)
            .ok_or(XDPoSError::UnknownAncestor)?;
        if parent.timestamp + self.params_at(fields.round).mine_period > header.timestamp {
            return Err(XDPoSError::InvalidTimestamp);
        }

        if is_switch {
            self.check_epoch_switch_masternodes(chain, header)?;
        }

        if full_verify {
            let author = self.author(header)?;
            if !self.masternodes(chain, header).contains(&author) {
                return Err(XDPoSError::ValidatorNotWithinMasternodes);
            }
            if author != header.beneficiary {
                return Err(XDPoSError::CoinbaseAndValidatorMismatch);
            }
        }

        self.verified_headers.lock().put(hash, ());
        Ok(())
    }

    /// Compare the validators and penalties of an epoch switch header with the
    /// locally computed sets.
    fn check_epoch_switch_masternodes(
        &self,
        chain: &dyn ChainReader,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<()> {
        let (masternodes, penalties) =
            self.calc_masternodes(chain, header.number, header.parent_hash)?;

        let as_set = |addresses: Vec<Address>| addresses.into_iter().collect::<BTreeSet<_>>();
        if as_set(masternodes) != as_set(header.validator_addresses()) {
            return Err(XDPoSError::ValidatorsNotLegit(format!("epoch switch block {}", header.number)));
        }
        if as_set(penalties) != as_set(header.penalty_addresses()) {
            return Err(XDPoSError::PenaltiesNotLegit(format!("epoch switch block {}", header.number)));
        }
        Ok(())
    }

    /// Verify a batch of consecutive headers on a worker thread.
    ///
    /// Results arrive in order on the returned handle; each header may use the
    /// headers before it in the batch as ancestors.
    pub fn verify_headers(
        self: &Arc<Self>,
        chain: Arc<dyn ChainReader>,
        headers: Vec<XdcBlockHeader>,
        full_verifies: Vec<bool>,
    ) -> VerifyHeadersHandle {
        let (abort_tx, mut abort_rx) = oneshot::channel();
        let (results_tx, results) = mpsc::channel(headers.len().max(1));
        let engine = Arc::clone(self);

        std::thread::spawn(move || {
            for (index, header) in headers.iter().enumerate() {
                if abort_rx.try_recv().is_ok() {
                    debug!(target: "consensus::xdpos", index, "Header verification aborted");
                    return;
                }
                let full_verify = full_verifies.get(index).copied().unwrap_or(true);
                let result =
                    engine.verify_header_with_parents(chain.as_ref(), header, &headers[..index], full_verify);
                if results_tx.blocking_send(result).is_err() {
                    return;
                }
            }
        });

        VerifyHeadersHandle { abort: Some(abort_tx), results }
    }
}

/// Handle on a running batch header verification
#[derive(Debug)]
pub struct VerifyHeadersHandle {
    abort: Option<oneshot::Sender<()>>,
    results: mpsc::Receiver<XDPoSResult<()>>,
}

impl VerifyHeadersHandle {
    /// Stop verifying the remaining headers
    pub fn abort(&mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
    }

    /// Next verification result, `None` once the batch is done or aborted
    pub async fn recv(&mut self) -> Option<XDPoSResult<()>> {
        self.results.recv().await
    }

    /// Blocking variant of [`Self::recv`] for use outside an async context
    pub fn blocking_recv(&mut self) -> Option<XDPoSResult<()>> {
        self.results.blocking_recv()
    }

    /// Collect every remaining result
    pub fn blocking_collect(mut self) -> Vec<XDPoSResult<()>> {
        let mut results = Vec::new();
        while let Some(result) = self.blocking_recv() {
            results.push(result);
        }
        results
    }
}
