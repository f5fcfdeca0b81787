//! Vote and timeout pools.
//!
//! Messages are grouped by their pool key and de-duplicated per signer, so a
//! signer counts at most once toward any certificate.

use super::{Round, Timeout, Vote};
use alloc::{string::String, vec::Vec};
use alloy_primitives::Address;
use std::collections::{HashMap, hash_map::Entry};

/// Rounds behind the highest seen round after which pooled messages are purged.
pub const POOL_HYGIENE_ROUND: Round = 10;

/// A message that can be pooled.
pub trait PoolObj: Clone {
    /// Grouping key
    fn pool_key(&self) -> String;
    /// Round the message belongs to
    fn round(&self) -> Round;
}

impl PoolObj for Vote {
    fn pool_key(&self) -> String {
        Self::pool_key(self)
    }

    fn round(&self) -> Round {
        self.proposed_block_info.round
    }
}

impl PoolObj for Timeout {
    fn pool_key(&self) -> String {
        Self::pool_key(self)
    }

    fn round(&self) -> Round {
        self.round
    }
}

/// Messages grouped by pool key, one per signer.
#[derive(Debug, Clone)]
pub struct Pool<T> {
    objs: HashMap<String, PoolEntry<T>>,
}

#[derive(Debug, Clone)]
struct PoolEntry<T> {
    round: Round,
    by_signer: HashMap<Address, T>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self { objs: HashMap::new() }
    }
}

impl<T: PoolObj> Pool<T> {
    /// Add `obj` signed by `signer` and return the number of distinct signers
    /// for its key. A repeated signer keeps its first message.
    pub fn add(&mut self, signer: Address, obj: T) -> usize {
        let round = obj.round();
        let entry = self
            .objs
            .entry(obj.pool_key())
            .or_insert_with(|| PoolEntry { round, by_signer: HashMap::new() });
        if let Entry::Vacant(slot) = entry.by_signer.entry(signer) {
            slot.insert(obj);
        }
        entry.by_signer.len()
    }

    /// Pooled messages under `key` with their signers
    pub fn get(&self, key: &str) -> Vec<(Address, T)> {
        self.objs
            .get(key)
            .map(|entry| entry.by_signer.iter().map(|(a, o)| (*a, o.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of distinct signers under `key`
    pub fn size(&self, key: &str) -> usize {
        self.objs.get(key).map_or(0, |entry| entry.by_signer.len())
    }

    /// Drop everything under `key`
    pub fn clear_key(&mut self, key: &str) {
        self.objs.remove(key);
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.objs.clear();
    }

    /// Drop keys whose round is below `round`, returning how many were dropped
    pub fn purge_below(&mut self, round: Round) -> usize {
        let before = self.objs.len();
        self.objs.retain(|_, entry| entry.round >= round);
        before - self.objs.len()
    }

    /// All pool keys
    pub fn keys(&self) -> Vec<String> {
        self.objs.keys().cloned().collect()
    }

    /// Iterate over `(key, signer, message)` triples
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Address, &T)> {
        self.objs.iter().flat_map(|(key, entry)| {
            entry.by_signer.iter().map(move |(signer, obj)| (key.as_str(), signer, obj))
        })
    }

    /// Whether the pool holds no messages
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }
}

/// Pool of votes keyed by `round:gap:number:hash`
pub type VotePool = Pool<Vote>;

/// Pool of timeouts keyed by `round:gap`
pub type TimeoutPool = Pool<Timeout>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v2::BlockInfo;
    use alloy_primitives::{B256, Bytes};

    fn vote(round: Round, hash: u8, sig: u8) -> Vote {
        Vote {
            proposed_block_info: BlockInfo::new(B256::with_last_byte(hash), round, round + 10),
            signature: Bytes::from(vec![sig; 65]),
            gap_number: 450,
        }
    }

    #[test]
    fn duplicate_signer_counts_once() {
        let mut pool = VotePool::default();
        let signer = Address::with_last_byte(1);

        assert_eq!(pool.add(signer, vote(5, 1, 1)), 1);
        assert_eq!(pool.add(signer, vote(5, 1, 2)), 1);
        assert_eq!(pool.add(Address::with_last_byte(2), vote(5, 1, 3)), 2);

        let key = vote(5, 1, 0).pool_key();
        let entries = pool.get(&key);
        assert_eq!(entries.len(), 2);
        let (_, first) = entries.iter().find(|(a, _)| *a == signer).unwrap();
        assert_eq!(first.signature[0], 1);
    }

    #[test]
    fn different_blocks_use_different_keys() {
        let mut pool = VotePool::default();
        pool.add(Address::with_last_byte(1), vote(5, 1, 1));
        pool.add(Address::with_last_byte(1), vote(5, 2, 1));
        assert_eq!(pool.keys().len(), 2);
        assert_eq!(pool.iter().count(), 2);

        pool.clear_key(&vote(5, 1, 0).pool_key());
        assert_eq!(pool.keys().len(), 1);
    }

    #[test]
    fn purge_below_keeps_recent_rounds() {
        let mut pool = VotePool::default();
        for round in 1..=20 {
            pool.add(Address::with_last_byte(1), vote(round, 1, 1));
        }
        assert_eq!(pool.purge_below(11), 10);
        assert_eq!(pool.keys().len(), 10);
        assert_eq!(pool.size(&vote(10, 1, 0).pool_key()), 0);
        assert_eq!(pool.size(&vote(11, 1, 0).pool_key()), 1);
    }

    #[test]
    fn timeout_pool_groups_by_round_and_gap() {
        let mut pool = TimeoutPool::default();
        let timeout = |gap| Timeout { round: 3, signature: Bytes::new(), gap_number: gap };
        pool.add(Address::with_last_byte(1), timeout(450));
        pool.add(Address::with_last_byte(2), timeout(450));
        pool.add(Address::with_last_byte(3), timeout(1350));
        assert_eq!(pool.size("3:450"), 2);
        assert_eq!(pool.size("3:1350"), 1);
        pool.clear();
        assert!(pool.is_empty());
    }
}
