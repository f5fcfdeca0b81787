//! XDPoS V2 Signature Verification
//!
//! Stateless helpers shared by QC/TC verification and the message handlers:
//! - signer recovery against a masternode list
//! - signature de-duplication
//! - certificate threshold arithmetic

use crate::{
    errors::{XDPoSError, XDPoSResult},
    signer::recover_signer,
};
use alloc::{string::ToString, vec::Vec};
use alloy_primitives::{Address, B256, Bytes, keccak256};
use rayon::prelude::*;
use std::collections::HashSet;

/// Number of signatures needed out of `masternodes` at `percent`, rounded up.
pub const fn cert_threshold_count(masternodes: usize, percent: u64) -> usize {
    (masternodes as u64 * percent).div_ceil(100) as usize
}

/// Verify a signature against a list of masternodes
///
/// # Arguments
/// * `hash` - The message hash
/// * `signature` - The signature to verify
/// * `masternodes` - List of valid masternode addresses
///
/// # Returns
/// (is_valid, signer_address)
pub fn verify_msg_signature(
    hash: &B256,
    signature: &[u8],
    masternodes: &[Address],
) -> XDPoSResult<(bool, Address)> {
    if masternodes.is_empty() {
        return Err(XDPoSError::InvalidSignature("empty masternode list".into()));
    }

    let signer = recover_signer(hash, signature)?;
    Ok((masternodes.contains(&signer), signer))
}

/// Remove duplicate signatures and return unique ones + duplicates
pub fn unique_signatures(signatures: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = Vec::new();

    for sig in signatures {
        if seen.insert(keccak256(sig)) {
            unique.push(sig.clone());
        } else {
            duplicates.push(sig.clone());
        }
    }

    (unique, duplicates)
}

/// Recover the signer of every signature in parallel, preserving order.
pub fn recover_signers(hash: &B256, signatures: &[Bytes]) -> XDPoSResult<Vec<Address>> {
    signatures.par_iter().map(|sig| recover_signer(hash, sig)).collect()
}

/// Check that every signature comes from a distinct masternode.
///
/// Returns the recovered signers; the error string names the first offender.
pub fn verify_signers(
    hash: &B256,
    signatures: &[Bytes],
    masternodes: &[Address],
) -> Result<Vec<Address>, alloc::string::String> {
    let signers = recover_signers(hash, signatures).map_err(|err| err.to_string())?;

    let mut seen = HashSet::with_capacity(signers.len());
    for signer in &signers {
        if !masternodes.contains(signer) {
            return Err(alloc::format!("signer {signer} is not a masternode"));
        }
        if !seen.insert(*signer) {
            return Err(alloc::format!("duplicated signer {signer}"));
        }
    }
    Ok(signers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{LocalSigner, Signer};

    fn signers(n: u8) -> Vec<LocalSigner> {
        (1..=n).map(|i| LocalSigner::from_slice(&[i; 32]).unwrap()).collect()
    }

    #[test]
    fn test_cert_threshold() {
        assert_eq!(cert_threshold_count(18, 67), 13);
        assert_eq!(cert_threshold_count(5, 60), 3);
        assert_eq!(cert_threshold_count(5, 67), 4);
        assert_eq!(cert_threshold_count(3, 67), 3);
        assert_eq!(cert_threshold_count(0, 67), 0);
    }

    #[test]
    fn test_unique_signatures() {
        let sig1 = Bytes::from(vec![1, 2, 3]);
        let sig2 = Bytes::from(vec![4, 5, 6]);
        let signatures = vec![sig1.clone(), sig2.clone(), sig1.clone()];

        let (unique, duplicates) = unique_signatures(&signatures);
        assert_eq!(unique, vec![sig1.clone(), sig2]);
        assert_eq!(duplicates, vec![sig1]);
    }

    #[test]
    fn test_verify_msg_signature() {
        let keys = signers(3);
        let masternodes: Vec<_> = keys.iter().take(2).map(Signer::address).collect();
        let hash = keccak256(b"vote");

        let sig = keys[0].sign_hash(hash).unwrap();
        assert_eq!(verify_msg_signature(&hash, &sig, &masternodes).unwrap(), (true, keys[0].address()));

        let outsider = keys[2].sign_hash(hash).unwrap();
        assert_eq!(
            verify_msg_signature(&hash, &outsider, &masternodes).unwrap(),
            (false, keys[2].address())
        );

        assert!(verify_msg_signature(&hash, &sig, &[]).is_err());
    }

    #[test]
    fn test_verify_signers_rejects_outsiders_and_repeats() {
        let keys = signers(3);
        let masternodes: Vec<_> = keys.iter().take(2).map(Signer::address).collect();
        let hash = keccak256(b"qc");
        let sigs: Vec<_> = keys.iter().map(|k| k.sign_hash(hash).unwrap()).collect();

        assert_eq!(verify_signers(&hash, &sigs[..2], &masternodes).unwrap(), masternodes);
        assert!(verify_signers(&hash, &sigs, &masternodes).is_err());
        assert!(verify_signers(&hash, &[sigs[0].clone(), sigs[0].clone()], &masternodes).is_err());
    }
}
