//! ECDSA signing and signer recovery.
//!
//! Signatures are 65 bytes `r || s || v`. `v` is produced as 0/1 and
//! accepted as 0/1 or 27/28 on recovery.

use crate::{
    constants::SIGNATURE_LENGTH,
    errors::{XDPoSError, XDPoSResult},
};
use alloc::{format, string::ToString};
use alloy_primitives::{Address, B256, Bytes, keccak256};
use core::fmt::Debug;
use secp256k1::{
    Message, PublicKey, SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};

/// Signs consensus payloads on behalf of the local validator.
pub trait Signer: Send + Sync + Debug {
    /// Address of the signing key
    fn address(&self) -> Address;

    /// Sign a 32-byte digest, returning the 65-byte `r || s || v` signature
    fn sign_hash(&self, hash: B256) -> XDPoSResult<Bytes>;
}

/// [`Signer`] over an in-memory secp256k1 key.
#[derive(Clone)]
pub struct LocalSigner {
    secret: SecretKey,
    address: Address,
}

impl Debug for LocalSigner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalSigner").field("address", &self.address).finish_non_exhaustive()
    }
}

impl LocalSigner {
    /// Create a signer from a raw 32-byte secret key
    pub fn from_slice(secret: &[u8]) -> XDPoSResult<Self> {
        let secret =
            SecretKey::from_slice(secret).map_err(|err| XDPoSError::Signer(err.to_string()))?;
        Ok(Self::new(secret))
    }

    /// Create a signer from a secret key
    pub fn new(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Self { secret, address: public_key_to_address(&public) }
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign_hash(&self, hash: B256) -> XDPoSResult<Bytes> {
        let message = Message::from_digest(hash.0);
        let (recovery_id, compact) =
            SECP256K1.sign_ecdsa_recoverable(&message, &self.secret).serialize_compact();

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[..64].copy_from_slice(&compact);
        signature[64] = recovery_id.to_i32() as u8;
        Ok(Bytes::copy_from_slice(&signature))
    }
}

/// Ethereum address of an uncompressed public key
pub fn public_key_to_address(public: &PublicKey) -> Address {
    let uncompressed = public.serialize_uncompressed();
    Address::from_slice(&keccak256(&uncompressed[1..])[12..])
}

/// Recover the signer address from a signature over `hash`
///
/// # Arguments
/// * `hash` - The message hash that was signed
/// * `signature` - The signature bytes (65 bytes: r, s, v)
pub fn recover_signer(hash: &B256, signature: &[u8]) -> XDPoSResult<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(XDPoSError::InvalidSignature(format!(
            "signature length {} != {SIGNATURE_LENGTH}",
            signature.len()
        )));
    }

    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        v => return Err(XDPoSError::InvalidSignature(format!("invalid recovery id {v}"))),
    };
    let recovery_id = RecoveryId::from_i32(v as i32)
        .map_err(|err| XDPoSError::InvalidSignature(err.to_string()))?;
    let signature = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|err| XDPoSError::InvalidSignature(err.to_string()))?;

    let message = Message::from_digest(hash.0);
    let public = SECP256K1
        .recover_ecdsa(&message, &signature)
        .map_err(|err| XDPoSError::InvalidSignature(err.to_string()))?;

    Ok(public_key_to_address(&public))
}
