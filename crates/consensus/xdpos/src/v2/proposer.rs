//! XDPoS V2 Block Proposer Selection
//!
//! The leader of a round is `masternodes[round % epoch % len(masternodes)]`,
//! where `masternodes` is the list of the epoch the proposed block belongs to.

use super::Round;
use crate::errors::{XDPoSError, XDPoSResult};
use alloy_primitives::Address;

/// Index of the leader of `round` in a list of `count` masternodes
pub const fn leader_index(round: Round, epoch: u64, count: usize) -> usize {
    (round % epoch % count as u64) as usize
}

/// Select the block proposer for a given round
///
/// # Arguments
/// * `round` - The consensus round number
/// * `epoch` - Epoch length in blocks
/// * `masternodes` - Masternodes of the epoch
///
/// # Returns
/// The address of the selected proposer
pub fn select_proposer(round: Round, epoch: u64, masternodes: &[Address]) -> XDPoSResult<Address> {
    if masternodes.is_empty() {
        return Err(XDPoSError::SnapshotNotFound("masternodes not found".into()));
    }
    Ok(masternodes[leader_index(round, epoch, masternodes.len())])
}

/// The first round `>= current_round` in which `masternodes[index]` leads.
///
/// Rounds wrap at epoch boundaries, so the search is bounded by one epoch.
pub fn next_proposer_round(
    index: usize,
    current_round: Round,
    epoch: u64,
    masternodes: &[Address],
) -> XDPoSResult<Option<Round>> {
    if index >= masternodes.len() {
        return Err(XDPoSError::NotInMasternodeList("propose"));
    }
    for round in current_round..current_round.saturating_add(epoch) {
        if leader_index(round, epoch, masternodes.len()) == index {
            return Ok(Some(round));
        }
    }
    tracing::debug!(
        target: "consensus::xdpos",
        index,
        current_round,
        masternode = %masternodes[index],
        "No turn within one epoch"
    );
    Ok(None)
}
