use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::hash::AddressHash;
use crate::iface::{TxMessage, TxMessageType};
use crate::packet::{
    DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketType,
    PropagationType,
};

pub const ANNOUNCE_QUEUE_CAPACITY: usize = 16_384;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AnnounceEntry {
    pub packet: Packet,
    pub timestamp: Instant,
    pub timeout: Instant,
    pub received_from: AddressHash,
    pub retries: u8,
    pub hops: u8,
    /// Set when the entry answers a path request; the retransmission goes
    /// out on exactly this interface and only once.
    pub response_to_iface: Option<AddressHash>,
    /// Locally originated announces are never dropped on queue overflow.
    pub local: bool,
}

impl AnnounceEntry {
    /// Builds the retransmission: HEADER_2/TRANSPORT with this node as the
    /// transport id and the hop count fixed at admission time.
    pub fn retransmit(&mut self, transport_id: &AddressHash) -> Option<TxMessage> {
        if self.retries == 0 || Instant::now() >= self.timeout {
            return None;
        }

        self.retries = self.retries.saturating_sub(1);

        let context = if self.response_to_iface.is_some() {
            PacketContext::PathResponse
        } else {
            PacketContext::None
        };

        let packet = Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type2,
                context_flag: self.packet.header.context_flag,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: self.hops,
            },
            destination: self.packet.destination,
            transport: Some(*transport_id),
            context,
            data: self.packet.data,
        };

        let tx_type = match self.response_to_iface {
            Some(iface) => TxMessageType::Direct(iface),
            None => TxMessageType::Broadcast(Some(self.received_from)),
        };

        Some(TxMessage { tx_type, packet })
    }
}

/// Retransmission queue for transport nodes. Bounded: when full, the
/// oldest non-local entry is dropped first.
pub struct AnnounceTable {
    map: BTreeMap<AddressHash, AnnounceEntry>,
    order: VecDeque<AddressHash>,
    responses: BTreeMap<AddressHash, AnnounceEntry>,
    capacity: usize,
    retry_limit: u8,
}

impl AnnounceTable {
    pub fn new(capacity: usize, retry_limit: u8) -> Self {
        Self {
            map: BTreeMap::new(),
            order: VecDeque::new(),
            responses: BTreeMap::new(),
            capacity,
            retry_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.responses.is_empty()
    }

    pub fn contains(&self, destination: &AddressHash) -> bool {
        self.map.contains_key(destination)
    }

    pub fn add(
        &mut self,
        announce: &Packet,
        destination: AddressHash,
        received_from: AddressHash,
        local: bool,
    ) {
        if self.map.contains_key(&destination) {
            return;
        }

        if self.map.len() >= self.capacity {
            self.drop_one();
        }

        let now = Instant::now();
        let entry = AnnounceEntry {
            packet: *announce,
            timestamp: now,
            timeout: now + ANNOUNCE_TIMEOUT,
            received_from,
            retries: self.retry_limit,
            hops: announce.header.hops.saturating_add(1),
            response_to_iface: None,
            local,
        };

        self.map.insert(destination, entry);
        self.order.push_back(destination);
    }

    fn drop_one(&mut self) {
        // Oldest non-local first; a queue of only local announces drops
        // its oldest member instead.
        let victim = self
            .order
            .iter()
            .find(|destination| {
                self.map.get(destination).map(|entry| !entry.local).unwrap_or(false)
            })
            .copied()
            .or_else(|| self.order.front().copied());

        if let Some(destination) = victim {
            self.map.remove(&destination);
            self.order.retain(|entry| *entry != destination);
        }
    }

    /// Queues a cached announce as a path response towards `to_iface`.
    pub fn add_response(
        &mut self,
        destination: AddressHash,
        to_iface: AddressHash,
    ) -> bool {
        if let Some(entry) = self.map.get(&destination) {
            let mut response = entry.clone();
            response.retries = 1;
            response.timeout = Instant::now() + ANNOUNCE_TIMEOUT;
            response.response_to_iface = Some(to_iface);
            self.responses.insert(destination, response);
            return true;
        }

        false
    }

    /// Immediate single retransmission of a freshly admitted announce.
    pub fn new_packet(
        &mut self,
        destination: &AddressHash,
        transport_id: &AddressHash,
    ) -> Option<TxMessage> {
        self.map.get_mut(destination).and_then(|entry| entry.retransmit(transport_id))
    }

    /// Periodic retransmission pass. Exhausted entries are dropped; path
    /// responses always go out exactly once.
    pub fn to_retransmit(&mut self, transport_id: &AddressHash) -> Vec<TxMessage> {
        let mut messages = Vec::new();
        let mut completed = Vec::new();

        for (destination, entry) in &mut self.map {
            if self.responses.contains_key(destination) {
                continue;
            }

            if let Some(message) = entry.retransmit(transport_id) {
                messages.push(message);
            } else {
                completed.push(*destination);
            }
        }

        for entry in self.responses.values_mut() {
            if let Some(message) = entry.retransmit(transport_id) {
                messages.push(message);
            }
        }
        self.responses.clear();

        for destination in completed {
            self.map.remove(&destination);
            self.order.retain(|entry| *entry != destination);
        }

        messages
    }
}

impl Default for AnnounceTable {
    fn default() -> Self {
        Self::new(ANNOUNCE_QUEUE_CAPACITY, 2)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::AnnounceTable;
    use crate::hash::AddressHash;
    use crate::packet::{Header, Packet, PacketDataBuffer, PacketType};

    fn announce(destination: AddressHash) -> Packet {
        Packet {
            header: Header { packet_type: PacketType::Announce, ..Default::default() },
            destination,
            transport: None,
            context: crate::packet::PacketContext::None,
            data: PacketDataBuffer::new_from_slice(b"announce data"),
        }
    }

    #[test]
    fn retransmit_promotes_to_header2_with_incremented_hops() {
        let destination = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);
        let transport_id = AddressHash::new_from_rand(OsRng);

        let mut table = AnnounceTable::new(16, 2);
        table.add(&announce(destination), destination, iface, false);

        let message = table.new_packet(&destination, &transport_id).expect("retransmission");
        assert_eq!(message.packet.header.header_type, crate::packet::HeaderType::Type2);
        assert_eq!(message.packet.transport, Some(transport_id));
        assert_eq!(message.packet.header.hops, 1);
    }

    #[test]
    fn overflow_drops_oldest_remote_first() {
        let iface = AddressHash::new_from_rand(OsRng);
        let mut table = AnnounceTable::new(2, 2);

        let local_dest = AddressHash::new_from_rand(OsRng);
        let remote_a = AddressHash::new_from_rand(OsRng);
        let remote_b = AddressHash::new_from_rand(OsRng);

        table.add(&announce(local_dest), local_dest, iface, true);
        table.add(&announce(remote_a), remote_a, iface, false);
        table.add(&announce(remote_b), remote_b, iface, false);

        assert!(table.contains(&local_dest), "local announce evicted");
        assert!(!table.contains(&remote_a), "oldest remote should be evicted");
        assert!(table.contains(&remote_b));
    }

    #[test]
    fn retries_exhaust_and_entry_is_dropped() {
        let destination = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);
        let transport_id = AddressHash::new_from_rand(OsRng);

        let mut table = AnnounceTable::new(16, 1);
        table.add(&announce(destination), destination, iface, false);

        assert_eq!(table.to_retransmit(&transport_id).len(), 1);
        assert_eq!(table.to_retransmit(&transport_id).len(), 0);
        assert!(!table.contains(&destination));
    }
}
