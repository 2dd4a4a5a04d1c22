pub mod announce_limits;
pub mod announce_table;
pub mod link_table;
pub mod packet_cache;
pub mod path_requests;
pub mod path_table;
pub mod tunnels;

mod handler;
mod jobs;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::destination::link::{Link, LinkEventData};
use crate::destination::{SingleInputDestination, SingleOutputDestination};
use crate::error::RnsError;
use crate::hash::{AddressHash, Hash};
use crate::identity::{IdentityStore, PrivateIdentity};
use crate::iface::{InterfaceManager, TxMessage, TxMessageType};
use crate::packet::{Packet, PacketContext};
use crate::ratchets::{RatchetStore, RATCHET_LENGTH};
use crate::resource::{ResourceConfig, ResourceEvent, ResourceManager};

use announce_limits::AnnounceLimits;
use announce_table::{AnnounceTable, ANNOUNCE_QUEUE_CAPACITY};
use jobs::manage_transport;
use link_table::TransportLinkTable;
use packet_cache::PacketCache;
use path_requests::PathRequests;
use path_table::{PathTable, DEFAULT_PATH_TTL_SECS};
use tunnels::TunnelTable;

const EVENT_CHANNEL_CAPACITY: usize = 256;
pub(crate) const PACKET_CACHE_KEEP: Duration = Duration::from_secs(300);
pub(crate) const PENDING_PROOF_KEEP: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct TransportConfig {
    pub name: String,
    pub identity: PrivateIdentity,
    /// Forward announces and route packets for other nodes.
    pub retransmit: bool,
    pub announce_queue_capacity: usize,
    pub announce_retry_limit: u8,
    pub path_ttl_secs: u64,
    pub link_keepalive_secs: u64,
    pub link_stale_secs: u64,
    pub link_retry_secs: u64,
    pub resources: ResourceConfig,
    pub ratchet_store_path: Option<PathBuf>,
}

impl TransportConfig {
    pub fn new(name: impl Into<String>, identity: &PrivateIdentity, retransmit: bool) -> Self {
        Self {
            name: name.into(),
            identity: identity.clone(),
            retransmit,
            announce_queue_capacity: ANNOUNCE_QUEUE_CAPACITY,
            announce_retry_limit: 2,
            path_ttl_secs: DEFAULT_PATH_TTL_SECS,
            link_keepalive_secs: 360,
            link_stale_secs: 720,
            link_retry_secs: 6,
            resources: ResourceConfig::default(),
            ratchet_store_path: None,
        }
    }
}

/// A validated announce, as seen by application-level handlers.
#[derive(Clone)]
pub struct AnnounceEvent {
    pub destination: Arc<Mutex<SingleOutputDestination>>,
    pub destination_hash: AddressHash,
    pub app_data: Vec<u8>,
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
    pub hops: u8,
    pub iface: AddressHash,
    pub timestamp: u64,
    pub is_path_response: bool,
}

/// Decrypted payload delivered to a registered IN destination or up from
/// a link.
#[derive(Clone)]
pub struct ReceivedData {
    pub destination: AddressHash,
    pub data: Vec<u8>,
    pub context: PacketContext,
    pub packet_hash: Hash,
    pub via_ratchet: bool,
}

/// A validated proof of delivery for a packet this node sent.
#[derive(Clone, Copy)]
pub struct DeliveryProof {
    pub packet_hash: Hash,
    pub destination: AddressHash,
}

pub(crate) struct PendingProof {
    pub packet_hash: Hash,
    pub destination: AddressHash,
    pub registered: Instant,
}

pub(crate) struct TransportHandler {
    pub(crate) config: TransportConfig,
    pub(crate) iface_manager: Arc<Mutex<InterfaceManager>>,
    pub(crate) announce_table: AnnounceTable,
    pub(crate) path_table: PathTable,
    pub(crate) packet_cache: PacketCache,
    pub(crate) announce_limits: AnnounceLimits,
    pub(crate) path_requests: PathRequests,
    pub(crate) tunnels: TunnelTable,
    pub(crate) link_table: TransportLinkTable,
    pub(crate) single_in_destinations: HashMap<AddressHash, Arc<Mutex<SingleInputDestination>>>,
    pub(crate) single_out_destinations: HashMap<AddressHash, Arc<Mutex<SingleOutputDestination>>>,
    pub(crate) in_links: HashMap<AddressHash, Arc<Mutex<Link>>>,
    pub(crate) out_links: HashMap<AddressHash, Arc<Mutex<Link>>>,
    /// Interface each known link id was last heard on.
    pub(crate) link_ifaces: HashMap<AddressHash, AddressHash>,
    /// Arrival interface of recently forwarded data packets, keyed by the
    /// truncated packet hash, so their proofs can route back.
    pub(crate) reverse_table: HashMap<AddressHash, (AddressHash, Instant)>,
    pub(crate) pending_proofs: HashMap<AddressHash, PendingProof>,
    pub(crate) resources: ResourceManager,
    pub(crate) ratchet_store: Option<RatchetStore>,
    pub(crate) identity_store: Arc<IdentityStore>,
    pub(crate) announce_tx: broadcast::Sender<AnnounceEvent>,
    pub(crate) received_tx: broadcast::Sender<ReceivedData>,
    pub(crate) link_event_tx: broadcast::Sender<LinkEventData>,
    pub(crate) resource_tx: broadcast::Sender<ResourceEvent>,
    pub(crate) proof_tx: broadcast::Sender<DeliveryProof>,
    pub(crate) cancel: CancellationToken,
}

/// The dispatcher. Owns the path table, dedup cache, announce queue and
/// all link and resource state behind one lock domain; interface reader
/// tasks feed it through an in-process queue.
pub struct Transport {
    name: String,
    iface_manager: Arc<Mutex<InterfaceManager>>,
    handler: Arc<Mutex<TransportHandler>>,
    announce_tx: broadcast::Sender<AnnounceEvent>,
    received_tx: broadcast::Sender<ReceivedData>,
    link_event_tx: broadcast::Sender<LinkEventData>,
    resource_tx: broadcast::Sender<ResourceEvent>,
    proof_tx: broadcast::Sender<DeliveryProof>,
    identity_store: Arc<IdentityStore>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (announce_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (received_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link_event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (resource_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (proof_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let iface_manager = InterfaceManager::new(128);
        let rx_receiver = iface_manager.receiver();
        let iface_manager = Arc::new(Mutex::new(iface_manager));

        let identity_store = Arc::new(IdentityStore::new());
        let cancel = CancellationToken::new();

        let ratchet_store = config.ratchet_store_path.as_ref().map(|path| {
            let mut store = RatchetStore::new(path.clone());
            store.clean_expired(crate::ratchets::now_secs());
            store
        });

        let transport_id =
            if config.retransmit { Some(*config.identity.address_hash()) } else { None };
        let path_requests = PathRequests::new(config.name.as_str(), transport_id);

        let name = config.name.clone();
        let handler = Arc::new(Mutex::new(TransportHandler {
            announce_table: AnnounceTable::new(
                config.announce_queue_capacity,
                config.announce_retry_limit,
            ),
            path_table: PathTable::new(Duration::from_secs(config.path_ttl_secs)),
            packet_cache: PacketCache::new(),
            announce_limits: AnnounceLimits::new(),
            path_requests,
            tunnels: TunnelTable::new(),
            link_table: TransportLinkTable::new(Duration::from_secs(config.link_stale_secs)),
            single_in_destinations: HashMap::new(),
            single_out_destinations: HashMap::new(),
            in_links: HashMap::new(),
            out_links: HashMap::new(),
            link_ifaces: HashMap::new(),
            reverse_table: HashMap::new(),
            pending_proofs: HashMap::new(),
            resources: ResourceManager::new(config.resources),
            ratchet_store,
            identity_store: identity_store.clone(),
            iface_manager: iface_manager.clone(),
            announce_tx: announce_tx.clone(),
            received_tx: received_tx.clone(),
            link_event_tx: link_event_tx.clone(),
            resource_tx: resource_tx.clone(),
            proof_tx: proof_tx.clone(),
            cancel: cancel.clone(),
            config,
        }));

        tokio::spawn(manage_transport(handler.clone(), rx_receiver));

        Self {
            name,
            iface_manager,
            handler,
            announce_tx,
            received_tx,
            link_event_tx,
            resource_tx,
            proof_tx,
            identity_store,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iface_manager(&self) -> Arc<Mutex<InterfaceManager>> {
        self.iface_manager.clone()
    }

    pub fn identity_store(&self) -> Arc<IdentityStore> {
        self.identity_store.clone()
    }

    pub fn announce_events(&self) -> broadcast::Receiver<AnnounceEvent> {
        self.announce_tx.subscribe()
    }

    pub fn received_data_events(&self) -> broadcast::Receiver<ReceivedData> {
        self.received_tx.subscribe()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEventData> {
        self.link_event_tx.subscribe()
    }

    pub fn resource_events(&self) -> broadcast::Receiver<ResourceEvent> {
        self.resource_tx.subscribe()
    }

    pub fn proof_events(&self) -> broadcast::Receiver<DeliveryProof> {
        self.proof_tx.subscribe()
    }

    /// Registers an IN destination so inbound packets addressed to it are
    /// decrypted and delivered.
    pub async fn register_in_destination(
        &self,
        destination: SingleInputDestination,
    ) -> Arc<Mutex<SingleInputDestination>> {
        let address_hash = *destination.address_hash();
        let destination = Arc::new(Mutex::new(destination));
        self.handler
            .lock()
            .await
            .single_in_destinations
            .insert(address_hash, destination.clone());
        destination
    }

    /// Remote destination handle learned from an earlier announce.
    pub async fn recall_out_destination(
        &self,
        destination_hash: &AddressHash,
    ) -> Option<Arc<Mutex<SingleOutputDestination>>> {
        self.handler.lock().await.single_out_destinations.get(destination_hash).cloned()
    }

    pub async fn send_packet(&self, packet: Packet) {
        self.handler.lock().await.send_packet(packet).await;
    }

    pub async fn send_broadcast(&self, packet: Packet) {
        self.handler
            .lock()
            .await
            .send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet })
            .await;
    }

    pub async fn send_announce(
        &self,
        destination: &Arc<Mutex<SingleInputDestination>>,
        app_data: Option<&[u8]>,
    ) -> Result<(), RnsError> {
        let packet = destination.lock().await.announce(rand_core::OsRng, app_data)?;
        let mut handler = self.handler.lock().await;
        handler.send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet }).await;
        Ok(())
    }

    /// Encrypts and sends a single-packet payload to a known destination.
    /// Returns the packet hash a later delivery proof will reference.
    pub async fn send_to_single(
        &self,
        destination_hash: &AddressHash,
        plaintext: &[u8],
    ) -> Result<Hash, RnsError> {
        self.handler.lock().await.send_to_single(destination_hash, plaintext).await
    }

    pub async fn has_path(&self, destination_hash: &AddressHash) -> bool {
        self.handler.lock().await.path_table.has_path(destination_hash)
    }

    pub async fn hops_to(&self, destination_hash: &AddressHash) -> Option<u8> {
        self.handler.lock().await.path_table.hops_to(destination_hash)
    }

    pub async fn request_path(&self, destination_hash: &AddressHash) {
        let mut handler = self.handler.lock().await;
        let packet = handler.path_requests.generate(destination_hash, None);
        handler.send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet }).await;
    }

    /// Opens a link towards an announced destination and sends the link
    /// request. The link activates asynchronously; watch `link_events`.
    pub async fn open_link(
        &self,
        destination_hash: &AddressHash,
    ) -> Result<Arc<Mutex<Link>>, RnsError> {
        self.handler.lock().await.open_link(destination_hash).await
    }

    pub async fn find_link(&self, link_id: &AddressHash) -> Option<Arc<Mutex<Link>>> {
        self.handler.lock().await.find_link(link_id)
    }

    /// Sends an encrypted data packet over an active link. Returns the
    /// packet hash the peer's proof will reference.
    pub async fn send_on_link(
        &self,
        link_id: &AddressHash,
        data: &[u8],
    ) -> Result<Hash, RnsError> {
        let mut handler = self.handler.lock().await;
        let link = handler.find_link(link_id).ok_or(RnsError::LinkClosed)?;
        let packet = { link.lock().await.data_packet(data)? };
        let packet_hash = packet.packet_hash();
        handler.send_packet(packet).await;
        Ok(packet_hash)
    }

    /// Starts a resource transfer over an active link. Completion and
    /// failure arrive via `resource_events`.
    pub async fn send_resource(
        &self,
        link_id: &AddressHash,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<Hash, RnsError> {
        let mut handler = self.handler.lock().await;
        let link = handler.find_link(link_id).ok_or(RnsError::LinkClosed)?;
        let (hash, packet) = {
            let guard = link.lock().await;
            handler.resources.start_send(&guard, data, metadata, None)?
        };
        handler.send_packet(packet).await;
        Ok(hash)
    }

    pub async fn close_link(&self, link_id: &AddressHash) {
        let mut handler = self.handler.lock().await;
        if let Some(link) = handler.find_link(link_id) {
            let packet = {
                let mut guard = link.lock().await;
                let packet = guard.close_packet();
                guard.close();
                packet
            };
            handler.send_packet(packet).await;
            handler.in_links.remove(link_id);
            handler.out_links.remove(link_id);
            handler.link_ifaces.remove(link_id);
        }
    }

    /// Stops every background task, tears down links best-effort and fails
    /// outstanding resource transfers.
    pub async fn stop(&self) {
        {
            let mut handler = self.handler.lock().await;

            let links: Vec<_> =
                handler.out_links.values().chain(handler.in_links.values()).cloned().collect();
            for link in links {
                let packet = {
                    let mut guard = link.lock().await;
                    let packet = guard.close_packet();
                    guard.close();
                    packet
                };
                handler.send_packet(packet).await;
            }
            handler.in_links.clear();
            handler.out_links.clear();

            handler.resources.fail_all();
            handler.flush_resource_events();

            handler.iface_manager.lock().await.stop_all();
        }

        self.cancel.cancel();
        log::debug!("tp({}): stopped", self.name);
    }
}
