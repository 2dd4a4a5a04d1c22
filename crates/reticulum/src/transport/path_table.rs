use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::{AddressHash, Hash};
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketType, PropagationType,
};

pub struct PathEntry {
    pub learned_at: Instant,
    /// Emission time parsed from the announce random hash; breaks ties
    /// between equal-hop paths.
    pub announce_timestamp: u64,
    pub received_from: AddressHash,
    pub hops: u8,
    pub iface: AddressHash,
    pub packet_hash: Hash,
}

/// Destination-to-next-hop cache fed by validated announces.
///
/// Preference order between competing paths: strictly fewer hops wins; on
/// equal hops the newer announce wins; otherwise the existing entry stays.
/// Entries expire lazily after the configured TTL.
pub struct PathTable {
    map: HashMap<AddressHash, PathEntry>,
    ttl: Duration,
}

pub const DEFAULT_PATH_TTL_SECS: u64 = 7 * 24 * 60 * 60;

impl PathTable {
    pub fn new(ttl: Duration) -> Self {
        Self { map: HashMap::new(), ttl }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    fn fresh(&self, entry: &PathEntry) -> bool {
        entry.learned_at.elapsed() <= self.ttl
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.map.get(destination).filter(|entry| self.fresh(entry))
    }

    pub fn has_path(&self, destination: &AddressHash) -> bool {
        self.get(destination).is_some()
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.get(destination).map(|entry| entry.hops)
    }

    pub fn next_hop_iface(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.get(destination).map(|entry| entry.iface)
    }

    pub fn remove(&mut self, destination: &AddressHash) {
        self.map.remove(destination);
    }

    /// Records or improves a path from a validated announce. `hops` is the
    /// cost of reaching the destination through `iface`: the announce's own
    /// hop count plus the hop to us.
    pub fn handle_announce(
        &mut self,
        announce: &Packet,
        announce_timestamp: u64,
        iface: AddressHash,
    ) {
        let hops = announce.header.hops.saturating_add(1);

        if let Some(existing) = self.map.get(&announce.destination) {
            if self.fresh(existing) {
                if hops > existing.hops {
                    return;
                }
                if hops == existing.hops && announce_timestamp <= existing.announce_timestamp {
                    return;
                }
            }
        }

        let received_from = announce.transport.unwrap_or(announce.destination);
        self.map.insert(
            announce.destination,
            PathEntry {
                learned_at: Instant::now(),
                announce_timestamp,
                received_from,
                hops,
                iface,
                packet_hash: announce.packet_hash(),
            },
        );

        log::info!(
            "path: {} reachable over {} hops via {} on {}",
            announce.destination,
            hops,
            received_from,
            iface,
        );
    }

    /// Routes an outbound or forwarded packet. Multi-hop paths are rewritten
    /// to HEADER_2/TRANSPORT towards the next hop; single-hop paths keep the
    /// original header. Returns the packet to send and the interface, when
    /// one is known.
    pub fn handle_packet(&self, original: &Packet) -> (Packet, Option<AddressHash>) {
        if original.header.header_type == HeaderType::Type2 {
            return (*original, None);
        }

        if original.header.packet_type == PacketType::Announce {
            return (*original, None);
        }

        if original.header.destination_type == DestinationType::Plain
            || original.header.destination_type == DestinationType::Group
        {
            return (*original, None);
        }

        let entry = match self.get(&original.destination) {
            Some(entry) => entry,
            None => return (*original, None),
        };

        if entry.hops <= 1 {
            return (*original, Some(entry.iface));
        }

        (
            Packet {
                header: Header {
                    ifac_flag: original.header.ifac_flag,
                    header_type: HeaderType::Type2,
                    context_flag: original.header.context_flag,
                    propagation_type: PropagationType::Transport,
                    destination_type: original.header.destination_type,
                    packet_type: original.header.packet_type,
                    hops: original.header.hops,
                },
                destination: original.destination,
                transport: Some(entry.received_from),
                context: original.context,
                data: original.data,
            },
            Some(entry.iface),
        )
    }

    /// Lazy expiry sweep, run from the maintenance job.
    pub fn drop_expired(&mut self) {
        let ttl = self.ttl;
        self.map.retain(|_, entry| entry.learned_at.elapsed() <= ttl);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;

    use super::PathTable;
    use crate::hash::AddressHash;
    use crate::packet::{
        Header, HeaderType, Packet, PacketDataBuffer, PacketType, PropagationType,
    };

    fn announce_packet(destination: AddressHash, hops: u8, transport: Option<AddressHash>) -> Packet {
        Packet {
            header: Header {
                packet_type: PacketType::Announce,
                header_type: if transport.is_some() { HeaderType::Type2 } else { HeaderType::Type1 },
                hops,
                ..Default::default()
            },
            destination,
            transport,
            context: crate::packet::PacketContext::None,
            data: PacketDataBuffer::new_from_slice(b"announce"),
        }
    }

    #[test]
    fn fewer_hops_wins_regardless_of_order() {
        let destination = AddressHash::new_from_rand(OsRng);
        let iface_near = AddressHash::new_from_rand(OsRng);
        let iface_far = AddressHash::new_from_rand(OsRng);

        // Far path first.
        let mut table = PathTable::new(Duration::from_secs(60));
        table.handle_announce(&announce_packet(destination, 4, None), 100, iface_far);
        table.handle_announce(&announce_packet(destination, 1, None), 50, iface_near);
        assert_eq!(table.next_hop_iface(&destination), Some(iface_near));

        // Near path first.
        let mut table = PathTable::new(Duration::from_secs(60));
        table.handle_announce(&announce_packet(destination, 1, None), 50, iface_near);
        table.handle_announce(&announce_packet(destination, 4, None), 100, iface_far);
        assert_eq!(table.next_hop_iface(&destination), Some(iface_near));
    }

    #[test]
    fn equal_hops_prefers_newer_timestamp() {
        let destination = AddressHash::new_from_rand(OsRng);
        let iface_old = AddressHash::new_from_rand(OsRng);
        let iface_new = AddressHash::new_from_rand(OsRng);

        let mut table = PathTable::new(Duration::from_secs(60));
        table.handle_announce(&announce_packet(destination, 2, None), 100, iface_old);
        table.handle_announce(&announce_packet(destination, 2, None), 200, iface_new);
        assert_eq!(table.next_hop_iface(&destination), Some(iface_new));

        // Older timestamp does not displace the entry.
        table.handle_announce(&announce_packet(destination, 2, None), 150, iface_old);
        assert_eq!(table.next_hop_iface(&destination), Some(iface_new));
    }

    #[test]
    fn single_hop_keeps_original_header() {
        let destination = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);

        let mut table = PathTable::new(Duration::from_secs(60));
        table.handle_announce(&announce_packet(destination, 0, None), 1, iface);

        let packet = Packet { destination, ..Default::default() };
        let (routed, via) = table.handle_packet(&packet);
        assert_eq!(via, Some(iface));
        assert_eq!(routed.header.header_type, HeaderType::Type1);
        assert_eq!(routed.transport, None);
    }

    #[test]
    fn multi_hop_rewrites_to_transport() {
        let destination = AddressHash::new_from_rand(OsRng);
        let next_hop = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);

        let mut table = PathTable::new(Duration::from_secs(60));
        table.handle_announce(&announce_packet(destination, 1, Some(next_hop)), 1, iface);

        let packet = Packet { destination, ..Default::default() };
        let (routed, via) = table.handle_packet(&packet);
        assert_eq!(via, Some(iface));
        assert_eq!(routed.header.header_type, HeaderType::Type2);
        assert_eq!(routed.header.propagation_type, PropagationType::Transport);
        assert_eq!(routed.transport, Some(next_hop));
    }

    #[test]
    fn expired_entries_are_invisible() {
        let destination = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);

        let mut table = PathTable::new(Duration::from_millis(0));
        table.handle_announce(&announce_packet(destination, 0, None), 1, iface);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!table.has_path(&destination));
    }
}
