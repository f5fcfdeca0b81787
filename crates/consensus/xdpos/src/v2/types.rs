//! XDPoS V2 wire encoding
//!
//! Signature hashes of votes and timeouts, and the versioned extra field
//! envelope `0x02 || rlp([round, qc])` carried in v2 headers.

use super::{ExtraFieldsV2, QuorumCert, Round, TimeoutForSign, VoteForSign};
use crate::errors::{XDPoSError, XDPoSResult};
use alloc::{format, string::ToString, vec::Vec};
use alloy_primitives::{B256, keccak256};
use alloy_rlp::Decodable;

/// Version byte of the v2 extra field envelope
pub const EXTRA_FIELDS_V2_VERSION: u8 = 2;

/// Compute the signature hash for a Vote
pub fn vote_sig_hash(vote: &VoteForSign) -> B256 {
    keccak256(alloy_rlp::encode(vote))
}

/// Compute the signature hash for a Timeout
pub fn timeout_sig_hash(timeout: &TimeoutForSign) -> B256 {
    keccak256(alloy_rlp::encode(timeout))
}

impl ExtraFieldsV2 {
    /// Create new extra fields
    pub const fn new(round: Round, quorum_cert: QuorumCert) -> Self {
        Self { round, quorum_cert }
    }

    /// Encode with the version prefix
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let encoded = alloy_rlp::encode(self);
        let mut result = Vec::with_capacity(1 + encoded.len());
        result.push(EXTRA_FIELDS_V2_VERSION);
        result.extend_from_slice(&encoded);
        result
    }

    /// Decode from bytes carrying the version prefix
    pub fn decode_from_slice(bytes: &[u8]) -> XDPoSResult<Self> {
        let Some((&version, mut payload)) = bytes.split_first() else {
            return Err(XDPoSError::InvalidV2Extra("extra field is empty".to_string()));
        };
        if version < EXTRA_FIELDS_V2_VERSION {
            return Err(XDPoSError::InvalidV2Extra(format!("not a v2 block, version: {version}")));
        }

        let fields = Self::decode(&mut payload)
            .map_err(|err| XDPoSError::InvalidV2Extra(format!("failed to decode extra fields: {err}")))?;
        if !payload.is_empty() {
            return Err(XDPoSError::InvalidV2Extra("trailing bytes after extra fields".to_string()));
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v2::BlockInfo;
    use alloy_primitives::Bytes;

    #[test]
    fn test_vote_sig_hash_covers_gap() {
        let block_info = BlockInfo::new(B256::with_last_byte(42), 100, 1000);
        let vote = VoteForSign { proposed_block_info: block_info, gap_number: 500 };

        assert_eq!(vote_sig_hash(&vote), vote_sig_hash(&vote));
        assert_ne!(vote_sig_hash(&vote), vote_sig_hash(&VoteForSign { gap_number: 501, ..vote }));
    }

    #[test]
    fn test_timeout_sig_hash_differs_from_vote() {
        let timeout = TimeoutForSign { round: 200, gap_number: 500 };
        let hash = timeout_sig_hash(&timeout);
        assert_ne!(hash, B256::ZERO);
        assert_ne!(hash, timeout_sig_hash(&TimeoutForSign { round: 201, gap_number: 500 }));
    }

    #[test]
    fn test_extra_fields_v2_encode_decode() {
        let block_info = BlockInfo::new(B256::with_last_byte(1), 100, 1000);
        let mut qc = QuorumCert::new(block_info, 450);
        qc.signatures.push(Bytes::from(vec![7u8; 65]));

        let encoded = ExtraFieldsV2::new(101, qc.clone()).encode_to_vec();
        assert_eq!(encoded[0], EXTRA_FIELDS_V2_VERSION);

        let decoded = ExtraFieldsV2::decode_from_slice(&encoded).unwrap();
        assert_eq!(decoded.round, 101);
        assert_eq!(decoded.quorum_cert, qc);
    }

    #[test]
    fn test_empty_signatures_decode_to_empty_vec() {
        let qc = QuorumCert::new(BlockInfo::new(B256::with_last_byte(9), 0, 900), 450);
        let encoded = ExtraFieldsV2::new(1, qc).encode_to_vec();
        let decoded = ExtraFieldsV2::decode_from_slice(&encoded).unwrap();
        assert!(decoded.quorum_cert.signatures.is_empty());
    }

    #[test]
    fn test_decode_invalid_version() {
        let err = ExtraFieldsV2::decode_from_slice(&[1, 0xc0]).unwrap_err();
        assert!(matches!(err, XDPoSError::InvalidV2Extra(_)));
    }

    #[test]
    fn test_decode_empty_and_garbage() {
        assert!(ExtraFieldsV2::decode_from_slice(&[]).is_err());
        assert!(ExtraFieldsV2::decode_from_slice(&[2, 0xff, 0x00]).is_err());
    }
}
