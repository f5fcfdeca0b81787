use super::PenaltyHook;
use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    v2::XDPoSV2Engine,
};
use alloc::vec::Vec;
use alloy_primitives::{Address, B256};
use std::collections::HashSet;
use tracing::debug;

/// Penalizes masternodes that stopped sending signing transactions.
///
/// The trailing `range_return_signer` blocks before the epoch switch are
/// scanned. A masternode is alive when one of those blocks carries its
/// signing transaction for a sampled block (`number % merge_sign_range == 0`)
/// of the window. Masternodes of the ending epoch that are not alive are
/// penalized. Once the chain is past the comeback window (see
/// [`SigningPenaltyHook::comeback_start`]), addresses penalized
/// `limit_penalty_epoch` epochs back stay penalized while they are
/// candidates and not alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigningPenaltyHook;

impl SigningPenaltyHook {
    /// Blocks above this number also carry over earlier penalties.
    pub fn comeback_start(engine: &XDPoSV2Engine) -> u64 {
        let config = engine.config();
        engine.switch_block() + (config.limit_penalty_epoch + 1) * config.epoch
    }

    /// Signers of sampled blocks within the window before `number`.
    fn alive_signers(
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        number: u64,
        parent_hash: B256,
    ) -> XDPoSResult<HashSet<Address>> {
        let config = engine.config();
        let first = number.saturating_sub(config.range_return_signer).max(1);

        let mut window = Vec::new();
        let mut hash = parent_hash;
        for block in (first..number).rev() {
            let header = chain.header(hash, block).ok_or(XDPoSError::UnknownAncestor)?;
            window.push((block, hash));
            hash = header.parent_hash;
        }

        let sampled: HashSet<B256> = window
            .iter()
            .filter(|(block, _)| block % config.merge_sign_range == 0)
            .map(|(_, hash)| *hash)
            .collect();

        let mut alive = HashSet::new();
        for (_, hash) in &window {
            for tx in engine.signing_txs(chain, *hash) {
                if sampled.contains(&tx.block_hash) {
                    alive.insert(tx.signer);
                }
            }
        }
        Ok(alive)
    }
}

impl PenaltyHook for SigningPenaltyHook {
    fn hook_penalty(
        &self,
        chain: &dyn ChainReader,
        engine: &XDPoSV2Engine,
        number: u64,
        parent_hash: B256,
        candidates: &[Address],
    ) -> XDPoSResult<Vec<Address>> {
        let config = engine.config();
        let alive = Self::alive_signers(chain, engine, number, parent_hash)?;

        let mut penalties: Vec<Address> = engine
            .masternodes_by_hash(chain, parent_hash)?
            .into_iter()
            .filter(|masternode| !alive.contains(masternode))
            .collect();

        if number > Self::comeback_start(engine) {
            let previous =
                engine.previous_penalties_by_hash(chain, parent_hash, config.limit_penalty_epoch)?;
            for address in previous {
                if candidates.contains(&address)
                    && !alive.contains(&address)
                    && !penalties.contains(&address)
                {
                    penalties.push(address);
                }
            }
        }

        debug!(
            target: "consensus::xdpos::hooks",
            number,
            alive = alive.len(),
            penalties = penalties.len(),
            "Computed penalties"
        );
        Ok(penalties)
    }
}
