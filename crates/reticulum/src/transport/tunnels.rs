use std::collections::HashMap;
use std::time::Instant;

use crate::hash::{AddressHash, Hash};

struct TunnelPath {
    destination: AddressHash,
    hops: u8,
    announce_timestamp: u64,
}

struct Tunnel {
    iface: AddressHash,
    established: Instant,
    paths: Vec<TunnelPath>,
}

/// Paths learned over `wants_tunnel` interfaces, keyed by the remote
/// transport identity. When such an interface reconnects under a new
/// address, the stored paths are re-adopted instead of waiting for the
/// whole network to re-announce.
pub struct TunnelTable {
    map: HashMap<AddressHash, Tunnel>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Synthesizes the tunnel id for a remote transport identity.
    pub fn tunnel_id(remote_identity: &AddressHash) -> AddressHash {
        AddressHash::new_from_hash(&Hash::new_from_slice(remote_identity.as_slice()))
    }

    pub fn record_path(
        &mut self,
        remote_identity: &AddressHash,
        iface: AddressHash,
        destination: AddressHash,
        hops: u8,
        announce_timestamp: u64,
    ) {
        let tunnel = self.map.entry(Self::tunnel_id(remote_identity)).or_insert(Tunnel {
            iface,
            established: Instant::now(),
            paths: Vec::new(),
        });
        tunnel.iface = iface;

        if let Some(existing) =
            tunnel.paths.iter_mut().find(|path| path.destination == destination)
        {
            if hops < existing.hops || announce_timestamp > existing.announce_timestamp {
                existing.hops = hops;
                existing.announce_timestamp = announce_timestamp;
            }
            return;
        }

        tunnel.paths.push(TunnelPath { destination, hops, announce_timestamp });
    }

    /// Rebinds a reconnected tunnel to its new interface address and
    /// returns the paths to restore: `(destination, hops, timestamp)`.
    pub fn adopt(
        &mut self,
        remote_identity: &AddressHash,
        new_iface: AddressHash,
    ) -> Vec<(AddressHash, u8, u64)> {
        let Some(tunnel) = self.map.get_mut(&Self::tunnel_id(remote_identity)) else {
            return Vec::new();
        };

        tunnel.iface = new_iface;
        tunnel.established = Instant::now();
        tunnel
            .paths
            .iter()
            .map(|path| (path.destination, path.hops, path.announce_timestamp))
            .collect()
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::TunnelTable;
    use crate::hash::AddressHash;

    #[test]
    fn adopt_restores_recorded_paths() {
        let mut tunnels = TunnelTable::new();
        let remote = AddressHash::new_from_rand(OsRng);
        let old_iface = AddressHash::new_from_rand(OsRng);
        let new_iface = AddressHash::new_from_rand(OsRng);
        let destination = AddressHash::new_from_rand(OsRng);

        tunnels.record_path(&remote, old_iface, destination, 2, 100);
        let restored = tunnels.adopt(&remote, new_iface);
        assert_eq!(restored, vec![(destination, 2, 100)]);
    }

    #[test]
    fn better_paths_update_in_place() {
        let mut tunnels = TunnelTable::new();
        let remote = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);
        let destination = AddressHash::new_from_rand(OsRng);

        tunnels.record_path(&remote, iface, destination, 4, 100);
        tunnels.record_path(&remote, iface, destination, 2, 150);

        let restored = tunnels.adopt(&remote, iface);
        assert_eq!(restored, vec![(destination, 2, 150)]);
    }
}
