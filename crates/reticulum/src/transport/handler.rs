use std::sync::Arc;
use std::time::Instant;

use rand_core::OsRng;
use tokio::sync::Mutex;

use crate::destination::link::{Link, LinkHandleResult, LinkId};
use crate::destination::{validate_announce, SingleInputDestination};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use crate::identity::SIGNATURE_LENGTH;
use crate::iface::{TxMessage, TxMessageType};
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketContext, PacketDataBuffer, PacketType,
    PropagationType,
};
use crate::resource::build_resource_request_packet;

use super::{DeliveryProof, PendingProof, ReceivedData, TransportHandler};

impl TransportHandler {
    pub(crate) async fn send(&mut self, message: TxMessage) -> usize {
        self.packet_cache.update(&message.packet);
        self.iface_manager.lock().await.send(message).await
    }

    /// Outbound routing: link traffic follows the interface the link lives
    /// on, everything else consults the path table and falls back to a
    /// broadcast on every sending interface.
    pub(crate) async fn send_packet(&mut self, packet: Packet) {
        if let Some(iface) = self.link_ifaces.get(&packet.destination).copied() {
            self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet }).await;
            return;
        }

        let (routed, maybe_iface) = self.path_table.handle_packet(&packet);
        let tx_type = match maybe_iface {
            Some(iface) => TxMessageType::Direct(iface),
            None => TxMessageType::Broadcast(None),
        };
        self.send(TxMessage { tx_type, packet: routed }).await;
    }

    pub(crate) fn find_link(&self, link_id: &AddressHash) -> Option<Arc<Mutex<Link>>> {
        self.in_links.get(link_id).or_else(|| self.out_links.get(link_id)).cloned()
    }

    pub(crate) async fn open_link(
        &mut self,
        destination_hash: &AddressHash,
    ) -> Result<Arc<Mutex<Link>>, RnsError> {
        let destination = self
            .single_out_destinations
            .get(destination_hash)
            .cloned()
            .ok_or(RnsError::UnknownIdentity)?;
        let desc = destination.lock().await.desc;

        let mut link = Link::new(desc, self.link_event_tx.clone());
        let request = link.request();
        let link_id = *link.id();

        let link = Arc::new(Mutex::new(link));
        self.out_links.insert(link_id, link.clone());
        self.send_packet(request).await;

        Ok(link)
    }

    pub(crate) async fn send_to_single(
        &mut self,
        destination_hash: &AddressHash,
        plaintext: &[u8],
    ) -> Result<Hash, RnsError> {
        let destination = self
            .single_out_destinations
            .get(destination_hash)
            .cloned()
            .ok_or(RnsError::UnknownIdentity)?;

        let ratchet = self.ratchet_store.as_mut().and_then(|store| store.get(destination_hash));
        let ciphertext = { destination.lock().await.encrypt(plaintext, ratchet, OsRng)? };

        let mut data = PacketDataBuffer::new();
        data.write(&ciphertext)?;

        let packet = Packet {
            header: Header { packet_type: PacketType::Data, ..Default::default() },
            destination: *destination_hash,
            transport: None,
            context: PacketContext::None,
            data,
        };

        let packet_hash = packet.packet_hash();
        self.pending_proofs.insert(
            AddressHash::new_from_hash(&packet_hash),
            PendingProof {
                packet_hash,
                destination: *destination_hash,
                registered: Instant::now(),
            },
        );

        self.send_packet(packet).await;
        Ok(packet_hash)
    }

    /// Inbound pipeline entry: every packet from every interface lands
    /// here, already stripped of framing and access codes.
    pub(crate) async fn handle_inbound(&mut self, packet: Packet, iface: AddressHash) {
        if packet.header.packet_type == PacketType::Data
            && packet.destination == self.path_requests.destination_hash()
        {
            let data = packet.data.as_slice().to_vec();
            self.handle_path_request(&data, iface).await;
            return;
        }

        if !self.filter_duplicate(&packet).await {
            log::trace!(
                "tp({}): dropping duplicate dst={} type={:?}",
                self.config.name,
                packet.destination,
                packet.header.packet_type
            );
            return;
        }

        match packet.header.packet_type {
            PacketType::Announce => self.handle_announce(packet, iface).await,
            PacketType::LinkRequest => self.handle_link_request(packet, iface).await,
            PacketType::Proof => self.handle_proof(packet, iface).await,
            PacketType::Data => self.handle_data(packet, iface).await,
        }
    }

    /// Dedup with the protocol's re-entry exceptions: keepalives repeat by
    /// design, link requests may be retried verbatim, and a pending link
    /// accepts its proof again after a lost first copy.
    async fn filter_duplicate(&mut self, packet: &Packet) -> bool {
        let mut allow_duplicate = false;

        match packet.header.packet_type {
            PacketType::LinkRequest => {
                allow_duplicate = true;
            }
            PacketType::Data => {
                allow_duplicate = packet.context == PacketContext::KeepAlive;
            }
            PacketType::Proof => {
                if packet.context == PacketContext::LinkRequestProof {
                    if let Some(link) = self.out_links.get(&packet.destination) {
                        if link.lock().await.status().not_yet_active() {
                            allow_duplicate = true;
                        }
                    }
                }
            }
            PacketType::Announce => {}
        }

        let is_new = self.packet_cache.update(packet);
        is_new || allow_duplicate
    }

    async fn handle_announce(&mut self, packet: Packet, iface: AddressHash) {
        if let Some(blocked) = self.announce_limits.check(&packet.destination) {
            log::info!(
                "tp({}): announce rate limit on {}, blocked {}s",
                self.config.name,
                packet.destination,
                blocked.as_secs()
            );
            return;
        }

        let own_destination = self.single_in_destinations.contains_key(&packet.destination);

        let (destination, app_data, ratchet, timestamp) = match validate_announce(&packet) {
            Ok(info) => {
                (info.destination, info.app_data.to_vec(), info.ratchet, info.timestamp)
            }
            Err(_) => return,
        };

        self.identity_store.remember(destination.identity);
        self.identity_store.remember_for(packet.destination, destination.identity);

        if let Some(ratchet_bytes) = ratchet {
            if let Some(store) = self.ratchet_store.as_mut() {
                if let Err(err) = store.remember(&packet.destination, ratchet_bytes) {
                    log::warn!(
                        "tp({}): failed to remember ratchet for {}: {}",
                        self.config.name,
                        packet.destination,
                        err
                    );
                }
            }
        }

        let destination_hash = packet.destination;
        let destination = Arc::new(Mutex::new(destination));

        if !own_destination {
            self.single_out_destinations
                .entry(destination_hash)
                .or_insert_with(|| destination.clone());

            self.path_table.handle_announce(&packet, timestamp, iface);

            let wants_tunnel = self.iface_manager.lock().await.wants_tunnel(&iface);
            if wants_tunnel {
                if let Some(transport_id) = packet.transport {
                    self.tunnels.record_path(
                        &transport_id,
                        iface,
                        destination_hash,
                        packet.header.hops.saturating_add(1),
                        timestamp,
                    );
                }
            }

            if self.config.retransmit {
                self.announce_table.add(&packet, destination_hash, iface, false);
                let transport_id = *self.config.identity.address_hash();
                if let Some(message) =
                    self.announce_table.new_packet(&destination_hash, &transport_id)
                {
                    self.send(message).await;
                }
            }
        }

        let _ = self.announce_tx.send(super::AnnounceEvent {
            destination,
            destination_hash,
            app_data,
            ratchet,
            hops: packet.header.hops,
            iface,
            timestamp,
            is_path_response: packet.context == PacketContext::PathResponse,
        });
    }

    async fn handle_link_request(&mut self, packet: Packet, iface: AddressHash) {
        if let Some(destination) = self.single_in_destinations.get(&packet.destination).cloned() {
            let (sign_key, desc) = {
                let guard = destination.lock().await;
                (guard.sign_key().clone(), guard.desc)
            };

            match Link::new_from_request(&packet, sign_key, desc, self.link_event_tx.clone()) {
                Ok(mut link) => {
                    let proof = link.prove();
                    let link_id = *link.id();
                    self.in_links.insert(link_id, Arc::new(Mutex::new(link)));
                    self.link_ifaces.insert(link_id, iface);
                    self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: proof })
                        .await;
                }
                Err(_) => {
                    log::warn!("tp({}): malformed link request", self.config.name);
                }
            }
            return;
        }

        // Forwarded link requests are remembered so the proof and the
        // link's traffic can route back without a path entry.
        if self.config.retransmit {
            if let Some((routed, out_iface)) = self.forward(&packet, iface) {
                let link_id = LinkId::from(&packet);
                self.link_table.record(link_id, iface, out_iface);
                self.send(TxMessage { tx_type: TxMessageType::Direct(out_iface), packet: routed })
                    .await;
            }
        }
    }

    async fn handle_proof(&mut self, packet: Packet, iface: AddressHash) {
        match packet.context {
            PacketContext::LinkRequestProof => {
                if let Some(link) = self.out_links.get(&packet.destination).cloned() {
                    self.link_ifaces.insert(packet.destination, iface);
                    let rtt_packet = {
                        let mut guard = link.lock().await;
                        match guard.handle_packet(&packet) {
                            LinkHandleResult::Activated => guard.rtt_packet().ok(),
                            _ => None,
                        }
                    };
                    if let Some(rtt_packet) = rtt_packet {
                        self.send_packet(rtt_packet).await;
                    }
                    return;
                }
            }
            PacketContext::ResourceProof => {
                if let Some(link) = self.find_link(&packet.destination) {
                    let responses = {
                        let guard = link.lock().await;
                        self.resources.handle_proof(packet.data.as_slice(), &guard)
                    };
                    for response in responses {
                        self.send_packet(response).await;
                    }
                    self.flush_resource_events();
                    return;
                }
            }
            PacketContext::LinkProof => {
                if let Some(link) = self.find_link(&packet.destination) {
                    let proved = {
                        let mut guard = link.lock().await;
                        match validate_link_proof(&guard, packet.data.as_slice()) {
                            Some(hash) => {
                                guard.touch();
                                Some(hash)
                            }
                            None => None,
                        }
                    };
                    if let Some(packet_hash) = proved {
                        let _ = self.proof_tx.send(DeliveryProof {
                            packet_hash,
                            destination: packet.destination,
                        });
                    }
                    return;
                }
            }
            _ => {
                // Explicit proof for an addressed single-destination packet.
                if self.settle_pending_proof(&packet) {
                    return;
                }
            }
        }

        if self.config.retransmit {
            self.forward_and_send(&packet, iface).await;
        }
    }

    /// Validates `full_hash(32) || signature(64)` against the identity the
    /// proved packet was addressed to.
    fn settle_pending_proof(&mut self, packet: &Packet) -> bool {
        let Some(pending) = self.pending_proofs.get(&packet.destination) else {
            return false;
        };

        let data = packet.data.as_slice();
        if data.len() < ADDRESS_HASH_SIZE * 2 + SIGNATURE_LENGTH {
            return false;
        }

        let Ok(full_hash) = Hash::try_from_slice(&data[..32]) else {
            return false;
        };
        if full_hash != pending.packet_hash {
            return false;
        }

        let Some(identity) = self.identity_store.recall(&pending.destination) else {
            return false;
        };
        let Ok(signature) =
            ed25519_dalek::Signature::from_slice(&data[32..32 + SIGNATURE_LENGTH])
        else {
            return false;
        };
        if identity.verify(full_hash.as_slice(), &signature).is_err() {
            return false;
        }

        let destination = pending.destination;
        self.pending_proofs.remove(&packet.destination);
        let _ = self.proof_tx.send(DeliveryProof { packet_hash: full_hash, destination });
        true
    }

    async fn handle_data(&mut self, packet: Packet, iface: AddressHash) {
        if let Some(link) = self.find_link(&packet.destination) {
            self.link_ifaces.insert(packet.destination, iface);

            let mut closed = false;
            let responses = {
                let mut guard = link.lock().await;
                match packet.context {
                    PacketContext::Resource => {
                        self.resources.handle_part(packet.data.as_slice(), &guard)
                    }
                    PacketContext::ResourceAdvertisement
                    | PacketContext::ResourceRequest
                    | PacketContext::ResourceHashUpdate
                    | PacketContext::ResourceInitiatorCancel
                    | PacketContext::ResourceReceiverCancel => {
                        let mut buffer = [0u8; crate::packet::PACKET_MDU];
                        match guard.decrypt(packet.data.as_slice(), &mut buffer) {
                            Ok(plain) => {
                                let plain = plain.to_vec();
                                guard.touch();
                                self.resources.handle_control(packet.context, &plain, &guard)
                            }
                            Err(_) => Vec::new(),
                        }
                    }
                    _ => match guard.handle_packet(&packet) {
                        LinkHandleResult::Proof(proof) => vec![proof],
                        LinkHandleResult::KeepAlive => vec![guard.keep_alive_packet(false)],
                        LinkHandleResult::Closed => {
                            closed = true;
                            Vec::new()
                        }
                        _ => Vec::new(),
                    },
                }
            };

            for response in responses {
                self.send_packet(response).await;
            }
            if closed {
                self.in_links.remove(&packet.destination);
                self.out_links.remove(&packet.destination);
                self.link_ifaces.remove(&packet.destination);
            }
            self.flush_resource_events();
            return;
        }

        if let Some(destination) = self.single_in_destinations.get(&packet.destination).cloned() {
            let decrypted = { destination.lock().await.decrypt(packet.data.as_slice()) };
            match decrypted {
                Ok((plaintext, via_ratchet)) => {
                    let packet_hash = packet.packet_hash();
                    let proof = {
                        let guard = destination.lock().await;
                        build_data_proof(&guard, &packet_hash)
                    };

                    let _ = self.received_tx.send(ReceivedData {
                        destination: packet.destination,
                        data: plaintext,
                        context: packet.context,
                        packet_hash,
                        via_ratchet,
                    });

                    if let Ok(proof) = proof {
                        self.send_packet(proof).await;
                    }
                }
                Err(_) => {
                    log::trace!(
                        "tp({}): undecryptable packet for {}",
                        self.config.name,
                        packet.destination
                    );
                }
            }
            return;
        }

        if self.config.retransmit {
            self.forward_and_send(&packet, iface).await;
        }
    }

    async fn handle_path_request(&mut self, data: &[u8], iface: AddressHash) {
        let Some(request) = self.path_requests.decode(data) else {
            return;
        };

        if let Some(destination) = self.single_in_destinations.get(&request.destination).cloned() {
            let response = { destination.lock().await.path_response(OsRng, None) };
            if let Ok(packet) = response {
                log::debug!(
                    "tp({}): answering path request for {}",
                    self.config.name,
                    request.destination
                );
                self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet }).await;
            }
            return;
        }

        if self.config.retransmit && self.announce_table.add_response(request.destination, iface) {
            log::debug!(
                "tp({}): queueing cached announce as path response for {}",
                self.config.name,
                request.destination
            );
        }
    }

    /// Transport forwarding for packets not addressed to this node.
    /// Returns the rewritten packet and egress interface, or None to drop.
    fn forward(&mut self, packet: &Packet, arrival: AddressHash) -> Option<(Packet, AddressHash)> {
        // Traffic for links routed through this node.
        if let Some(out_iface) = self.link_table.route(&packet.destination, arrival) {
            let mut forwarded = *packet;
            forwarded.header.hops = packet.header.hops.saturating_add(1);
            return Some((forwarded, out_iface));
        }

        // Proofs travel the reverse path of the packet they prove.
        if packet.header.packet_type == PacketType::Proof {
            if let Some((iface, _)) = self.reverse_table.get(&packet.destination).copied() {
                if iface != arrival {
                    let mut forwarded = *packet;
                    forwarded.header.hops = packet.header.hops.saturating_add(1);
                    return Some((forwarded, iface));
                }
            }
        }

        if packet.header.packet_type == PacketType::Data {
            self.reverse_table.insert(
                AddressHash::new_from_hash(&packet.packet_hash()),
                (arrival, Instant::now()),
            );
        }

        match packet.header.header_type {
            HeaderType::Type2 => {
                // Only the addressed transport node moves the packet on.
                if packet.transport != Some(*self.config.identity.address_hash()) {
                    return None;
                }

                let entry = self.path_table.get(&packet.destination)?;
                let mut forwarded = *packet;
                forwarded.header.hops = packet.header.hops.saturating_add(1);
                if entry.hops <= 1 {
                    forwarded.header.header_type = HeaderType::Type1;
                    forwarded.header.propagation_type = PropagationType::Broadcast;
                    forwarded.transport = None;
                } else {
                    forwarded.transport = Some(entry.received_from);
                }
                Some((forwarded, entry.iface))
            }
            HeaderType::Type1 => {
                if packet.header.destination_type == DestinationType::Plain
                    || packet.header.destination_type == DestinationType::Group
                {
                    return None;
                }

                let entry = self.path_table.get(&packet.destination)?;
                if entry.iface == arrival {
                    return None;
                }

                let mut forwarded = *packet;
                forwarded.header.hops = packet.header.hops.saturating_add(1);
                if entry.hops > 1 {
                    forwarded.header.header_type = HeaderType::Type2;
                    forwarded.header.propagation_type = PropagationType::Transport;
                    forwarded.transport = Some(entry.received_from);
                }
                Some((forwarded, entry.iface))
            }
        }
    }

    async fn forward_and_send(&mut self, packet: &Packet, arrival: AddressHash) {
        if let Some((routed, out_iface)) = self.forward(packet, arrival) {
            self.send(TxMessage { tx_type: TxMessageType::Direct(out_iface), packet: routed })
                .await;
        }
    }

    pub(crate) fn flush_resource_events(&mut self) {
        for event in self.resources.drain_events() {
            let _ = self.resource_tx.send(event);
        }
    }

    /// Re-requests and failure sweeps for in-flight resources.
    pub(crate) async fn resource_watchdog(&mut self) {
        let requests = self.resources.watchdog(Instant::now());
        for (link_id, request) in requests {
            if let Some(link) = self.find_link(&link_id) {
                let packet = {
                    let guard = link.lock().await;
                    build_resource_request_packet(&guard, &request)
                };
                if let Ok(packet) = packet {
                    self.send_packet(packet).await;
                }
            }
        }
        self.flush_resource_events();
    }
}

/// Explicit proof for a packet delivered to an IN destination:
/// `full_hash(32) || Ed25519(full_hash)`, addressed to the truncated
/// packet hash.
fn build_data_proof(
    destination: &SingleInputDestination,
    packet_hash: &Hash,
) -> Result<Packet, RnsError> {
    let signature = destination.identity.sign(packet_hash.as_slice());

    let mut data = PacketDataBuffer::new();
    data.chain_write(packet_hash.as_slice())?.chain_write(&signature.to_bytes())?;

    Ok(Packet {
        header: Header {
            packet_type: PacketType::Proof,
            destination_type: DestinationType::Single,
            ..Default::default()
        },
        destination: AddressHash::new_from_hash(packet_hash),
        transport: None,
        context: PacketContext::None,
        data,
    })
}

/// Validates a link packet proof (`hash(32) || signature(64)`) against the
/// link peer's verifying key.
fn validate_link_proof(link: &Link, data: &[u8]) -> Option<Hash> {
    if data.len() < 32 + SIGNATURE_LENGTH {
        return None;
    }
    let hash = Hash::try_from_slice(&data[..32]).ok()?;
    let signature = ed25519_dalek::Signature::from_slice(&data[32..32 + SIGNATURE_LENGTH]).ok()?;
    link.peer_identity().verify(hash.as_slice(), &signature).ok()?;
    Some(hash)
}
