//! Hashing utilities for txgrid
//!
//! - BLAKE3 for key hashing (partition assignment and canonical lock order)
//! - HRW (Highest Random Weight) for partition-to-node placement

/// First eight bytes of BLAKE3(data) as a little-endian integer
fn blake3_u64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(buf)
}

/// Stable 64-bit hash of a key
pub fn key_hash(key: &str) -> u64 {
    blake3_u64(key.as_bytes())
}

/// Compute the partition of a key.
///
/// Pure function of the key and the partition count; it does not depend on
/// the node set.
pub fn partition_of(key: &str, partitions: u32) -> u32 {
    (key_hash(key) % partitions as u64) as u32
}

/// HRW weight of a node for a partition
fn hrw_weight(partition: u32, node: &str) -> u64 {
    let mut data = Vec::with_capacity(4 + node.len());
    data.extend_from_slice(&partition.to_le_bytes());
    data.extend_from_slice(node.as_bytes());
    blake3_u64(&data)
}

/// HRW (Highest Random Weight) hashing for partition placement
///
/// Returns nodes sorted by their weight for the partition, heaviest first.
/// Removing a node only moves the partitions where it ranked among the
/// owners; the relative order of the remaining nodes is unchanged.
pub fn hrw_rank(partition: u32, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(u64, &String)> = nodes
        .iter()
        .map(|node| (hrw_weight(partition, node), node))
        .collect();

    // Sort by weight (descending), node id breaks ties
    weights.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    weights.into_iter().map(|(_, node)| node.clone()).collect()
}

/// Select up to `n` owners for a partition using HRW hashing
pub fn select_owners(partition: u32, nodes: &[String], n: usize) -> Vec<String> {
    let mut ranked = hrw_rank(partition, nodes);
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{}", i)).collect()
    }

    #[test]
    fn test_partition_of_deterministic() {
        let p1 = partition_of("test-key", 1024);
        let p2 = partition_of("test-key", 1024);
        assert_eq!(p1, p2);
        assert!(p1 < 1024);
    }

    #[test]
    fn test_hrw_rank_consistent() {
        let nodes = nodes(3);
        let sorted1 = hrw_rank(5, &nodes);
        let sorted2 = hrw_rank(5, &nodes);
        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_select_owners_distinct() {
        let nodes = nodes(4);
        let owners = select_owners(17, &nodes, 2);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
    }

    #[test]
    fn test_select_owners_caps_at_node_count() {
        let nodes = nodes(2);
        assert_eq!(select_owners(3, &nodes, 5).len(), 2);
        assert!(select_owners(3, &[], 2).is_empty());
    }

    #[test]
    fn test_minimal_movement_on_node_loss() {
        let all = nodes(5);
        let remaining: Vec<String> = all.iter().filter(|n| *n != "node-2").cloned().collect();

        for partition in 0..256 {
            let before = hrw_rank(partition, &all);
            let after = hrw_rank(partition, &remaining);
            let expected: Vec<String> = before.into_iter().filter(|n| n != "node-2").collect();
            assert_eq!(after, expected);
        }
    }

    #[test]
    fn test_even_distribution() {
        let nodes = nodes(4);
        let mut primaries = std::collections::HashMap::new();
        for partition in 0..1024 {
            let owners = select_owners(partition, &nodes, 1);
            *primaries.entry(owners[0].clone()).or_insert(0usize) += 1;
        }
        assert_eq!(primaries.len(), 4);
        for count in primaries.values() {
            assert!(*count > 150, "unbalanced placement: {:?}", primaries);
        }
    }
}
