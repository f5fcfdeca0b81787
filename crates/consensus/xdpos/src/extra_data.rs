//! Header Extra Data
//!
//! Two layouts share the `extra_data` field:
//! - V1: vanity prefix (32 bytes) | validator list (20 bytes * N) | ECDSA seal (65 bytes)
//! - V2: version byte (`>= 2`) followed by `rlp([round, quorum_cert])`
//!
//! [`ExtraData`] tags the two so callers cannot mix them up.

use crate::{
    constants::{EXTRA_SEAL, EXTRA_VANITY},
    errors::{XDPoSError, XDPoSResult},
    signer,
    v2::{ExtraFieldsV2, types::EXTRA_FIELDS_V2_VERSION},
};
use alloc::vec::Vec;
use alloy_primitives::{Address, B256};
use xdc_primitives::{XdcBlockHeader, addresses_from_bytes};

/// Parsed V1 extra data structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1ExtraData {
    /// 32 byte vanity prefix
    pub vanity: [u8; 32],
    /// Validator addresses (only present at checkpoint blocks)
    pub validators: Vec<Address>,
    /// 65 byte ECDSA seal signature (R, S, V)
    pub seal: [u8; 65],
}

impl V1ExtraData {
    /// Parse V1 extra data from bytes
    pub fn parse(data: &[u8]) -> XDPoSResult<Self> {
        if data.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(XDPoSError::ExtraDataTooShort);
        }

        let mut vanity = [0u8; 32];
        vanity.copy_from_slice(&data[..EXTRA_VANITY]);

        let mut seal = [0u8; 65];
        seal.copy_from_slice(&data[data.len() - EXTRA_SEAL..]);

        let validators_data = &data[EXTRA_VANITY..data.len() - EXTRA_SEAL];
        if validators_data.len() % Address::len_bytes() != 0 {
            return Err(XDPoSError::InvalidCheckpointSigners);
        }

        Ok(Self { vanity, validators: addresses_from_bytes(validators_data), seal })
    }

    /// Encode extra data back to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(EXTRA_VANITY + self.validators.len() * 20 + EXTRA_SEAL);
        data.extend_from_slice(&self.vanity);
        for validator in &self.validators {
            data.extend_from_slice(validator.as_slice());
        }
        data.extend_from_slice(&self.seal);
        data
    }
}

/// Versioned header extra data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraData {
    /// Fixed v1 layout
    V1(V1ExtraData),
    /// v2 round and QC envelope
    V2(ExtraFieldsV2),
}

impl ExtraData {
    /// Decode either layout. A first byte of 2 or more selects the v2 envelope.
    ///
    /// The engine itself knows the version from the block number and calls the
    /// layout-specific decoders; this is for callers holding bare bytes.
    pub fn decode(bytes: &[u8]) -> XDPoSResult<Self> {
        match bytes.first() {
            Some(&version) if version >= EXTRA_FIELDS_V2_VERSION => {
                ExtraFieldsV2::decode_from_slice(bytes).map(Self::V2)
            }
            _ => V1ExtraData::parse(bytes).map(Self::V1),
        }
    }

    /// Encode back to header bytes
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::V1(extra) => extra.encode(),
            Self::V2(fields) => fields.encode_to_vec(),
        }
    }

    /// Consensus version of the layout
    pub const fn version(&self) -> u8 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => EXTRA_FIELDS_V2_VERSION,
        }
    }
}

/// Masternodes carried by a v1 checkpoint header's extra data.
pub fn decode_masternodes_from_v1_extra(header: &XdcBlockHeader) -> XDPoSResult<Vec<Address>> {
    V1ExtraData::parse(&header.extra_data).map(|extra| extra.validators)
}

/// Hash a v1 author signs: the header with the seal stripped from `extra_data`.
pub fn hash_without_seal(header: &XdcBlockHeader) -> B256 {
    let mut unsealed = header.clone();
    let extra = &header.extra_data;
    if extra.len() >= EXTRA_SEAL {
        unsealed.extra_data = extra[..extra.len() - EXTRA_SEAL].to_vec().into();
    }
    unsealed.seal_hash()
}

/// Recover the author of a v1 header from the seal at the end of `extra_data`.
pub fn recover_v1_author(header: &XdcBlockHeader) -> XDPoSResult<Address> {
    let extra = &header.extra_data;
    if extra.len() < EXTRA_SEAL {
        return Err(XDPoSError::MissingSignature);
    }
    signer::recover_signer(&hash_without_seal(header), &extra[extra.len() - EXTRA_SEAL..])
}
