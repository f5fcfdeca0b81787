//! Block signing transactions
//!
//! Masternodes attest to blocks by calling `sign(uint256,bytes32)` on the
//! BlockSigners contract (0x89). Penalties and rewards are derived from these
//! attestations.

use crate::chain::BlockTransaction;
use alloy_primitives::{Address, B256, U256, address};

/// BlockSigners contract address (0x89) - receives signing transactions
pub const BLOCK_SIGNERS: Address = address!("0000000000000000000000000000000000000089");

/// Selector of `sign(uint256,bytes32)`
pub const SIGN_METHOD: [u8; 4] = [0xe3, 0x41, 0xea, 0xa4];

/// Selector plus two 32-byte arguments
const SIGN_CALL_LEN: usize = 4 + 32 + 32;

/// A decoded signing transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningTx {
    /// Masternode that sent the attestation
    pub signer: Address,
    /// Number of the attested block
    pub block_number: u64,
    /// Hash of the attested block
    pub block_hash: B256,
}

/// Whether `tx` is a call to the BlockSigners contract's `sign` method
pub fn is_signing_tx(tx: &BlockTransaction) -> bool {
    tx.to == Some(BLOCK_SIGNERS) && tx.input.len() >= SIGN_CALL_LEN && tx.input[..4] == SIGN_METHOD
}

/// Decode a signing transaction, `None` for any other transaction
pub fn parse_signing_tx(tx: &BlockTransaction) -> Option<SigningTx> {
    if !is_signing_tx(tx) {
        return None;
    }
    let data = &tx.input;
    let block_number = U256::from_be_slice(&data[4..36]).saturating_to::<u64>();
    let block_hash = B256::from_slice(&data[data.len() - 32..]);
    Some(SigningTx { signer: tx.from, block_number, block_hash })
}

/// Call data of `sign(block_number, block_hash)`
pub fn encode_sign_call(block_number: u64, block_hash: B256) -> alloy_primitives::Bytes {
    let mut data = alloc::vec::Vec::with_capacity(SIGN_CALL_LEN);
    data.extend_from_slice(&SIGN_METHOD);
    data.extend_from_slice(&U256::from(block_number).to_be_bytes::<32>());
    data.extend_from_slice(block_hash.as_slice());
    data.into()
}
