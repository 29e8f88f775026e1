//! Key-to-partition routing.
//!
//! Keyed records use Kafka's murmur2 scheme so the in-process log and a
//! real cluster agree on placement. Keyless records pick a random partition.

use murmur2::{murmur2, KAFKA_SEED};
use rand::Rng;

pub fn compute_partition(key: Option<&[u8]>, partition_count: u32) -> u32 {
    if partition_count <= 1 {
        return 0;
    }
    match key {
        Some(k) => (murmur2(k, KAFKA_SEED) & 0x7fff_ffff) % partition_count,
        None => rand::rng().random_range(0..partition_count),
    }
}
