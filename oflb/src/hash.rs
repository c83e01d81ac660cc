use oflb_common::FiveTuple;

pub trait ConsistentHasher {
    /// Builds a lookup ring where each slot holds a bucket index and every
    /// bucket owns a contiguous run of slots proportional to its weight.
    fn generate_hash_ring(&self, weights: &[u16]) -> Vec<u32>;
}

pub struct SimpleConsistentHasher {
    ring_size: u32,
}

impl SimpleConsistentHasher {
    pub fn new(ring_size: u32) -> Self {
        SimpleConsistentHasher { ring_size }
    }
}

impl ConsistentHasher for SimpleConsistentHasher {
    fn generate_hash_ring(&self, weights: &[u16]) -> Vec<u32> {
        let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
        let mut ring = Vec::with_capacity(self.ring_size as usize);
        if total == 0 {
            return ring;
        }
        let size = u64::from(self.ring_size);

        // Bucket b owns slots [cum_b * size / total, cum_{b+1} * size / total).
        // A bucket is never empty while size >= total.
        let mut cumulative = 0u64;
        for (bucket, weight) in weights.iter().enumerate() {
            cumulative += u64::from(*weight);
            let end = cumulative * size / total;
            while (ring.len() as u64) < end {
                ring.push(bucket as u32);
            }
        }

        ring
    }
}

/// Maps a forward-direction flow to a bucket index.
///
/// Pure and stateless: the result depends only on the connection's 5-tuple,
/// the seed and the bucket weights, so a flow stays on one backend for the
/// life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSelector {
    seed: u32,
    ring: Vec<u32>,
}

impl FlowSelector {
    pub fn new(hasher: &impl ConsistentHasher, weights: &[u16], seed: u32) -> Self {
        FlowSelector {
            seed,
            ring: hasher.generate_hash_ring(weights),
        }
    }

    pub fn hash(&self, tuple: &FiveTuple) -> u32 {
        mur3::murmurhash3_x86_32(&tuple.key(), self.seed)
    }

    /// Returns `None` only when built from an empty weight list.
    pub fn select(&self, tuple: &FiveTuple) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let slot = self.hash(tuple) as usize % self.ring.len();
        Some(self.ring[slot] as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    use network_types::ip::IpProto;

    use super::*;

    fn tuple(src: Ipv4Addr, sport: u16, proto: IpProto) -> FiveTuple {
        FiveTuple {
            source_addr: src,
            source_port: sport,
            dst_addr: Ipv4Addr::new(10, 0, 0, 100),
            dst_port: 80,
            proto,
        }
    }

    fn selector(weights: &[u16]) -> FlowSelector {
        FlowSelector::new(&SimpleConsistentHasher::new(65537), weights, 0)
    }

    #[test]
    fn ring_slots_are_split_by_weight() {
        let ring = SimpleConsistentHasher::new(10).generate_hash_ring(&[1, 1]);
        assert_eq!(ring, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]);

        let ring = SimpleConsistentHasher::new(12).generate_hash_ring(&[1, 2, 1]);
        assert_eq!(ring, vec![0, 0, 0, 1, 1, 1, 1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn ring_never_starves_a_bucket() {
        let ring = SimpleConsistentHasher::new(7).generate_hash_ring(&[1; 7]);
        assert_eq!(ring, vec![0, 1, 2, 3, 4, 5, 6]);

        let ring = SimpleConsistentHasher::new(65537).generate_hash_ring(&[1, 1, 1]);
        assert_eq!(ring.len(), 65537);
        let owned: HashSet<_> = ring.iter().collect();
        assert_eq!(owned.len(), 3);
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let s = selector(&[]);
        assert_eq!(s.select(&tuple(Ipv4Addr::new(10, 0, 0, 1), 1, IpProto::Tcp)), None);
    }

    #[test]
    fn selection_is_deterministic() {
        let a = selector(&[1, 1, 1]);
        let b = selector(&[1, 1, 1]);
        for port in 30000..30100 {
            let t = tuple(Ipv4Addr::new(10, 0, 0, 1), port, IpProto::Tcp);
            assert_eq!(a.select(&t), a.select(&t));
            assert_eq!(a.select(&t), b.select(&t));
        }
    }

    #[test]
    fn seed_changes_the_hash() {
        let t = tuple(Ipv4Addr::new(10, 0, 0, 1), 40000, IpProto::Tcp);
        let a = FlowSelector::new(&SimpleConsistentHasher::new(65537), &[1, 1], 0);
        let b = FlowSelector::new(&SimpleConsistentHasher::new(65537), &[1, 1], 7);
        assert_ne!(a.hash(&t), b.hash(&t));
    }

    #[test]
    fn protocol_is_part_of_the_key() {
        let s = selector(&[1, 1, 1]);
        let tcp = tuple(Ipv4Addr::new(10, 0, 0, 2), 5353, IpProto::Tcp);
        let udp = tuple(Ipv4Addr::new(10, 0, 0, 2), 5353, IpProto::Udp);
        assert_ne!(s.hash(&tcp), s.hash(&udp));
    }

    #[test]
    fn every_bucket_is_reachable() {
        for n in 1..=8usize {
            let s = selector(&vec![1; n]);
            let mut seen = HashSet::new();
            for port in 1024..3024 {
                let t = tuple(Ipv4Addr::new(10, 0, 1, (port % 250) as u8), port, IpProto::Tcp);
                seen.insert(s.select(&t).unwrap());
            }
            assert_eq!(seen.len(), n, "pool of {n}");
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let s = selector(&[1, 1, 1, 1]);
        let mut counts = [0usize; 4];
        for port in 10000..14000 {
            let t = tuple(Ipv4Addr::new(192, 168, 1, 7), port, IpProto::Tcp);
            counts[s.select(&t).unwrap()] += 1;
        }
        for count in counts {
            assert!((700..=1300).contains(&count), "{counts:?}");
        }
    }

    #[test]
    fn heavier_buckets_get_more_flows() {
        let s = selector(&[1, 3]);
        let mut counts = [0usize; 2];
        for port in 10000..14000 {
            let t = tuple(Ipv4Addr::new(172, 16, 0, 9), port, IpProto::Udp);
            counts[s.select(&t).unwrap()] += 1;
        }
        assert!(counts[1] > counts[0] * 2, "{counts:?}");
    }
}
