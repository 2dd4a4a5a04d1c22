use std::cmp::min;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::Hash;
use crate::packet::Packet;

struct PacketTrack {
    time: Instant,
    min_hops: u8,
}

/// Time-bounded duplicate filter keyed by the hop-invariant packet hash.
pub struct PacketCache {
    map: HashMap<Hash, PacketTrack>,
}

impl PacketCache {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Records the packet and reports whether it was previously unseen.
    pub fn update(&mut self, packet: &Packet) -> bool {
        let hash = packet.dedup_hash();

        if let Some(track) = self.map.get_mut(&hash) {
            track.time = Instant::now();
            track.min_hops = min(packet.header.hops, track.min_hops);
            return false;
        }

        self.map.insert(hash, PacketTrack { time: Instant::now(), min_hops: packet.header.hops });
        true
    }

    pub fn release(&mut self, max_age: Duration) {
        self.map.retain(|_, track| track.time.elapsed() <= max_age);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for PacketCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;

    use super::PacketCache;
    use crate::hash::AddressHash;
    use crate::packet::{Packet, PacketDataBuffer};

    #[test]
    fn duplicate_detection_ignores_hops() {
        let mut cache = PacketCache::new();
        let mut packet = Packet {
            destination: AddressHash::new_from_rand(OsRng),
            data: PacketDataBuffer::new_from_slice(b"dedup"),
            ..Default::default()
        };

        assert!(cache.update(&packet));
        packet.header.hops = 3;
        assert!(!cache.update(&packet));
    }

    #[test]
    fn release_evicts_old_entries() {
        let mut cache = PacketCache::new();
        let packet = Packet {
            destination: AddressHash::new_from_rand(OsRng),
            ..Default::default()
        };

        cache.update(&packet);
        std::thread::sleep(Duration::from_millis(5));
        cache.release(Duration::from_millis(0));
        assert!(cache.is_empty());
    }
}
