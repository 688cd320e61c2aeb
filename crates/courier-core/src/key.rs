// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record keys and partition routing.
//!
//! Every key carries the id of the partition that generated it in its upper
//! bits, so the partition owning a workflow instance can always be recovered
//! from the instance key alone:
//!
//! ```text
//!  63      51 50                                   0
//! +----------+--------------------------------------+
//! | partition|              counter                 |
//! +----------+--------------------------------------+
//! ```

use sha2::{Digest, Sha256};

/// Record key.
pub type Key = i64;

/// Partition identifier.
pub type PartitionId = u16;

/// Marker for "no key".
pub const NO_KEY: Key = -1;

/// Partitions are numbered from this id.
pub const START_PARTITION_ID: PartitionId = 1;

/// Bits reserved for the counter part of a key.
pub const KEY_BITS: u32 = 51;

/// Highest partition id that still fits into a positive key.
pub const MAX_PARTITION_ID: PartitionId = (1 << (63 - KEY_BITS)) - 1;

/// Build a key from a partition id and a per-partition counter.
pub const fn encode_partition_id(partition_id: PartitionId, counter: i64) -> Key {
    ((partition_id as i64) << KEY_BITS) + counter
}

/// Recover the partition id that generated `key`.
pub const fn decode_partition_id(key: Key) -> PartitionId {
    (key >> KEY_BITS) as PartitionId
}

/// Partition that owns messages and message subscriptions for a correlation key.
///
/// The mapping only depends on the correlation key bytes and the partition
/// count, so every partition computes the same target.
pub fn subscription_partition_id(correlation_key: &str, partition_count: u32) -> PartitionId {
    let count = partition_count.max(1);
    let digest = Sha256::digest(correlation_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);
    START_PARTITION_ID + (hash % u64::from(count)) as PartitionId
}

/// Monotonic key source of one partition.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    partition_id: PartitionId,
    next_counter: i64,
}

impl KeyGenerator {
    /// Create a generator whose first key has counter 1.
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            next_counter: 1,
        }
    }

    /// Hand out the next key.
    pub fn next_key(&mut self) -> Key {
        let key = encode_partition_id(self.partition_id, self.next_counter);
        self.next_counter += 1;
        key
    }

    /// Partition this generator belongs to.
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_partition_id() {
        for partition_id in [START_PARTITION_ID, 2, 17, MAX_PARTITION_ID] {
            let key = encode_partition_id(partition_id, 42);
            assert!(key > 0);
            assert_eq!(decode_partition_id(key), partition_id);
        }
    }

    #[test]
    fn test_key_generator_is_monotonic() {
        let mut generator = KeyGenerator::new(2);
        let first = generator.next_key();
        let second = generator.next_key();

        assert_eq!(first, encode_partition_id(2, 1));
        assert_eq!(second, first + 1);
        assert_eq!(decode_partition_id(second), 2);
        assert_eq!(generator.partition_id(), 2);
    }

    #[test]
    fn test_subscription_partition_id_is_stable() {
        let first = subscription_partition_id("order-123", 3);
        let second = subscription_partition_id("order-123", 3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_subscription_partition_id_within_range() {
        for i in 0..200 {
            let partition = subscription_partition_id(&format!("key-{i}"), 5);
            assert!((START_PARTITION_ID..START_PARTITION_ID + 5).contains(&partition));
        }
    }

    #[test]
    fn test_subscription_partition_id_single_partition() {
        assert_eq!(subscription_partition_id("anything", 1), START_PARTITION_ID);
        assert_eq!(subscription_partition_id("", 1), START_PARTITION_ID);
    }

    #[test]
    fn test_subscription_partition_id_spreads_keys() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            seen.insert(subscription_partition_id(&format!("order-{i}"), 3));
        }
        assert_eq!(seen.len(), 3);
    }
}
