//! Key to partition mapping

use crate::view::PartitionId;
use std::fmt;

/// Maps a routing key onto one of `partition_count` partitions
pub trait Partitioner: Send + Sync + fmt::Debug {
    /// `partition_count` is always > 0
    fn partition(&self, key: &[u8], partition_count: u32) -> PartitionId;
}

/// murmur2 partitioner (seed `0x9747b28c`, sign bit masked before modulo)
#[derive(Debug, Default, Clone, Copy)]
pub struct Murmur2Partitioner;

impl Partitioner for Murmur2Partitioner {
    fn partition(&self, key: &[u8], partition_count: u32) -> PartitionId {
        (murmur2(key) & 0x7fff_ffff) % partition_count
    }
}

/// 32-bit murmur2 hash
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h: u32 = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur2_known_vectors() {
        assert_eq!(murmur2(b""), 275646681);
        assert_eq!(murmur2(b"hello"), 1682149141);
        assert_eq!(murmur2(b"kafka"), 1762226537);
    }

    #[test]
    fn test_partition_is_stable_and_in_range() {
        let p = Murmur2Partitioner;
        for i in 0..500u32 {
            let key = format!("user-{i}");
            let a = p.partition(key.as_bytes(), 12);
            assert_eq!(a, p.partition(key.as_bytes(), 12));
            assert!(a < 12);
        }
    }

    #[test]
    fn test_partition_spreads_keys() {
        let p = Murmur2Partitioner;
        let mut counts = [0u32; 8];
        for i in 0..1000u32 {
            counts[p.partition(&i.to_be_bytes(), 8) as usize] += 1;
        }
        assert!(counts.iter().all(|c| *c > 0));
    }
}
