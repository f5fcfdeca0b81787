//! Epoch switch detection and masternode lookup.
//!
//! An epoch switch block is the first v2 block whose round crosses an epoch
//! boundary (`round - round % epoch`) relative to its parent's round. The
//! v2 switch block itself is treated as an epoch switch and carries its
//! masternodes in the v1 extra layout.

use super::{
    BlockInfo, EpochSwitchInfo, ExtraFieldsV2, QuorumCert, Round, XDPoSV2Engine,
    snapshot::gap_block_number,
};
use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    extra_data::decode_masternodes_from_v1_extra,
};
use alloc::{format, vec::Vec};
use alloy_primitives::{Address, B256};
use tracing::{trace, warn};
use xdc_primitives::XdcBlockHeader;

impl XDPoSV2Engine {
    /// Decode the v2 extra fields of `header`, rejecting v1 blocks.
    pub(crate) fn decode_v2_extra(&self, header: &XdcBlockHeader) -> XDPoSResult<ExtraFieldsV2> {
        if header.number <= self.switch_block() {
            return Err(XDPoSError::InvalidV2Extra(format!(
                "block {} is not a v2 block",
                header.number
            )));
        }
        ExtraFieldsV2::decode_from_slice(&header.extra_data)
    }

    /// Consensus fields of `header`: parent QC, round and the masternodes it carries.
    ///
    /// Blocks up to the v2 switch block have no QC, round 0, and carry their
    /// masternodes in the v1 extra layout.
    pub fn extra_fields(
        &self,
        header: &XdcBlockHeader,
    ) -> XDPoSResult<(Option<QuorumCert>, Round, Vec<Address>)> {
        if header.number <= self.switch_block() {
            return Ok((None, 0, decode_masternodes_from_v1_extra(header)?));
        }
        let fields = ExtraFieldsV2::decode_from_slice(&header.extra_data)?;
        Ok((Some(fields.quorum_cert), fields.round, header.validator_addresses()))
    }

    /// Whether `header` starts an epoch, and the epoch number it belongs to.
    pub fn is_epoch_switch(&self, header: &XdcBlockHeader) -> XDPoSResult<(bool, u64)> {
        let switch_block = self.switch_block();
        let epoch = self.config.epoch;
        if header.number == switch_block {
            return Ok((true, header.number / epoch));
        }

        let fields = self.decode_v2_extra(header)?;
        let epoch_start_round = fields.round - fields.round % epoch;
        let epoch_num = switch_block / epoch + fields.round / epoch;
        // the first v2 block always opens an epoch
        if fields.quorum_cert.proposed_block_info.number == switch_block {
            return Ok((true, epoch_num));
        }
        Ok((fields.quorum_cert.round() < epoch_start_round, epoch_num))
    }

    /// Whether a block proposed in `round` on top of `parent` would start an epoch.
    pub fn is_epoch_switch_at_round(
        &self,
        round: Round,
        parent: &XdcBlockHeader,
    ) -> XDPoSResult<(bool, u64)> {
        let epoch = self.config.epoch;
        let epoch_num = self.switch_block() / epoch + round / epoch;
        if parent.number == self.switch_block() {
            return Ok((true, epoch_num));
        }

        let parent_round = self.decode_v2_extra(parent)?.round;
        if round <= parent_round {
            return Ok((false, epoch_num));
        }
        let epoch_start_round = round - round % epoch;
        Ok((parent_round < epoch_start_round, epoch_num))
    }

    /// Epoch switch info of the epoch the block `hash` belongs to.
    ///
    /// Walks parents back to the epoch switch block and caches the result for
    /// every block visited. `header` may be passed when the caller already holds
    /// the block, e.g. one that is not persisted yet.
    pub fn epoch_switch_info(
        &self,
        chain: &dyn ChainReader,
        header: Option<&XdcBlockHeader>,
        hash: B256,
    ) -> XDPoSResult<EpochSwitchInfo> {
        let mut visited = Vec::new();
        let mut hash = hash;
        let mut next = header.cloned();

        let info = loop {
            if let Some(info) = self.epoch_switches.lock().get(&hash) {
                trace!(target: "consensus::xdpos", %hash, "Epoch switch cache hit");
                break info.clone();
            }
            let header = match next.take() {
                Some(header) => header,
                None => chain.header_by_hash(hash).ok_or(XDPoSError::EpochSwitchInfoNotFound(hash))?,
            };

            let (is_switch, _) = self.is_epoch_switch(&header)?;
            if is_switch {
                let (qc, round, masternodes) = self.extra_fields(&header)?;
                break EpochSwitchInfo {
                    masternodes,
                    penalties: header.penalty_addresses(),
                    epoch_switch_block_info: BlockInfo::new(hash, round, header.number),
                    epoch_switch_parent_block_info: qc.map(|qc| qc.proposed_block_info),
                };
            }
            visited.push(hash);
            hash = header.parent_hash;
        };

        let mut cache = self.epoch_switches.lock();
        cache.put(info.epoch_switch_block_info.hash, info.clone());
        for hash in visited {
            cache.put(hash, info.clone());
        }
        Ok(info)
    }

    /// Masternodes of the epoch `header` belongs to, empty when unknown.
    pub fn masternodes(&self, chain: &dyn ChainReader, header: &XdcBlockHeader) -> Vec<Address> {
        match self.epoch_switch_info(chain, Some(header), header.hash_slow()) {
            Ok(info) => info.masternodes,
            Err(err) => {
                warn!(target: "consensus::xdpos", number = header.number, %err, "Failed to get masternodes");
                Vec::new()
            }
        }
    }

    /// Masternodes of the epoch the block `hash` belongs to.
    pub fn masternodes_by_hash(&self, chain: &dyn ChainReader, hash: B256) -> XDPoSResult<Vec<Address>> {
        self.epoch_switch_info(chain, None, hash).map(|info| info.masternodes)
    }

    /// Epoch switch info `limit` epochs before the epoch of `hash`.
    ///
    /// Stops at the v2 switch block when fewer epochs exist.
    pub fn previous_epoch_switch_info_by_hash(
        &self,
        chain: &dyn ChainReader,
        hash: B256,
        limit: u64,
    ) -> XDPoSResult<EpochSwitchInfo> {
        let mut info = self.epoch_switch_info(chain, None, hash)?;
        for _ in 0..limit {
            let Some(parent) = info.epoch_switch_parent_block_info else { break };
            info = self.epoch_switch_info(chain, None, parent.hash)?;
        }
        Ok(info)
    }

    /// Penalties recorded at the epoch switch `limit` epochs before `hash`.
    pub fn previous_penalties_by_hash(
        &self,
        chain: &dyn ChainReader,
        hash: B256,
        limit: u64,
    ) -> XDPoSResult<Vec<Address>> {
        self.previous_epoch_switch_info_by_hash(chain, hash, limit).map(|info| info.penalties)
    }

    /// Epoch switch block number and epoch number of the canonical block `number`.
    pub fn current_epoch_switch_block(
        &self,
        chain: &dyn ChainReader,
        number: u64,
    ) -> XDPoSResult<(u64, u64)> {
        let header = chain.header_by_number(number).ok_or(XDPoSError::UnknownBlock)?;
        let info = self.epoch_switch_info(chain, Some(&header), header.hash_slow())?;
        let epoch_num =
            self.switch_block() / self.config.epoch + info.epoch_switch_block_info.round / self.config.epoch;
        Ok((info.epoch_switch_block_info.number, epoch_num))
    }

    /// Masternodes and penalties for the epoch switch block `number` built on `parent_hash`.
    ///
    /// Starts from the snapshot of the epoch's gap block and removes whatever
    /// the penalty hook reports.
    pub fn calc_masternodes(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        parent_hash: B256,
    ) -> XDPoSResult<(Vec<Address>, Vec<Address>)> {
        let snapshot = self.get_snapshot(chain, number, false)?;
        let candidates = snapshot.next_epoch_masternodes;

        if number == self.switch_block() + 1 {
            return Ok((candidates, Vec::new()));
        }
        let Some(hook) = &self.penalty_hook else { return Ok((candidates, Vec::new())) };

        let penalties = hook.hook_penalty(chain, self, number, parent_hash, &candidates)?;
        let max = self.params().max_masternodes;
        let masternodes = candidates
            .into_iter()
            .filter(|candidate| !penalties.contains(candidate))
            .take(max)
            .collect();
        Ok((masternodes, penalties))
    }

    /// Gap block number of the epoch whose switch block is `epoch_switch_number`.
    pub(crate) const fn epoch_gap_number(&self, epoch_switch_number: u64) -> u64 {
        gap_block_number(epoch_switch_number, self.config.epoch, self.config.gap)
    }
}
