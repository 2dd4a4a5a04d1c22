use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::AddressHash;

struct LinkEntry {
    initiator_iface: AddressHash,
    destination_iface: AddressHash,
    last_activity: Instant,
}

/// Link routes through this transport node. Recorded when a LINKREQUEST is
/// forwarded, so the proof and all later link traffic can travel between
/// the two interfaces without any path entry for the link id.
pub struct TransportLinkTable {
    map: HashMap<AddressHash, LinkEntry>,
    timeout: Duration,
}

impl TransportLinkTable {
    pub fn new(timeout: Duration) -> Self {
        Self { map: HashMap::new(), timeout }
    }

    pub fn record(
        &mut self,
        link_id: AddressHash,
        initiator_iface: AddressHash,
        destination_iface: AddressHash,
    ) {
        self.map.insert(
            link_id,
            LinkEntry { initiator_iface, destination_iface, last_activity: Instant::now() },
        );
    }

    /// Looks up the egress interface for a packet that arrived on
    /// `arrival`: traffic from the initiator side goes towards the
    /// destination and vice versa.
    pub fn route(&mut self, link_id: &AddressHash, arrival: AddressHash) -> Option<AddressHash> {
        let entry = self.map.get_mut(link_id)?;
        entry.last_activity = Instant::now();

        if arrival == entry.initiator_iface {
            Some(entry.destination_iface)
        } else if arrival == entry.destination_iface {
            Some(entry.initiator_iface)
        } else {
            None
        }
    }

    pub fn contains(&self, link_id: &AddressHash) -> bool {
        self.map.contains_key(link_id)
    }

    pub fn remove_stale(&mut self) {
        let timeout = self.timeout;
        self.map.retain(|_, entry| entry.last_activity.elapsed() <= timeout);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;

    use super::TransportLinkTable;
    use crate::hash::AddressHash;

    #[test]
    fn routes_between_both_interfaces() {
        let mut table = TransportLinkTable::new(Duration::from_secs(60));
        let link_id = AddressHash::new_from_rand(OsRng);
        let iface_a = AddressHash::new_from_rand(OsRng);
        let iface_b = AddressHash::new_from_rand(OsRng);

        table.record(link_id, iface_a, iface_b);
        assert_eq!(table.route(&link_id, iface_a), Some(iface_b));
        assert_eq!(table.route(&link_id, iface_b), Some(iface_a));

        let iface_c = AddressHash::new_from_rand(OsRng);
        assert_eq!(table.route(&link_id, iface_c), None);
    }

    #[test]
    fn stale_entries_are_swept() {
        let mut table = TransportLinkTable::new(Duration::from_millis(0));
        let link_id = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);

        table.record(link_id, iface, iface);
        std::thread::sleep(Duration::from_millis(5));
        table.remove_stale();
        assert!(table.is_empty());
    }
}
