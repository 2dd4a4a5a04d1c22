use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use reticulum::destination::link::{LinkEvent, LinkEventData};
use reticulum::destination::{single_in, SingleInputDestination};
use reticulum::hash::{AddressHash, Hash};
use reticulum::identity::PrivateIdentity;
use reticulum::packet::PacketContext;
use reticulum::resource::{ResourceEvent, ResourceEventKind};
use reticulum::transport::{AnnounceEvent, DeliveryProof, ReceivedData, Transport};

use crate::constants::{
    APP_NAME, DELIVERY_ASPECT, DELIVERY_RETRY_BASE_SECS, DELIVERY_RETRY_JITTER_MS,
    MAX_DELIVERY_ATTEMPTS,
};
use crate::error::LxmfError;
use crate::message::{
    decide_delivery, DeliveryMethod, LxmMessage, MessageState, Representation,
};
use crate::propagation::{
    encode_sync_request, parse_node_announce, parse_sync_response, PropagationNode,
    PropagationTransferState,
};

pub type MessageId = [u8; 32];

const DEFAULT_SYNC_LIMIT: u32 = 256;

#[derive(Clone)]
pub struct LxmRouterConfig {
    pub display_name: Option<String>,
    /// Directory for the persistent outbound spool; in-memory only when
    /// unset.
    pub spool_dir: Option<PathBuf>,
    pub max_delivery_attempts: u32,
    pub retry_base: Duration,
    pub process_interval: Duration,
}

impl Default for LxmRouterConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            spool_dir: None,
            max_delivery_attempts: MAX_DELIVERY_ATTEMPTS,
            retry_base: Duration::from_secs(DELIVERY_RETRY_BASE_SECS),
            process_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub enum LxmfEvent {
    InboundMessage { message: Arc<LxmMessage>, verified: bool },
    MessageStateChanged { message_id: MessageId, state: MessageState },
    PropagationNodeDiscovered { destination_hash: AddressHash },
    PropagationTransfer { state: PropagationTransferState, progress: f32 },
}

type DeliveryCallback = Box<dyn FnMut(&LxmMessage, bool) + Send>;
type FailedCallback = Box<dyn FnMut(&LxmMessage) + Send>;

struct OutboundEntry {
    message: LxmMessage,
    message_id: MessageId,
    attempts: u32,
    next_attempt: Instant,
    /// Packet hashes of every send attempt; a proof for any of them
    /// settles the message.
    packet_hashes: Vec<Hash>,
    resource_hash: Option<Hash>,
}

struct LinkRef {
    link_id: AddressHash,
    established: bool,
}

struct RouterInner {
    delivery_destination: Option<Arc<Mutex<SingleInputDestination>>>,
    delivery_hash: Option<AddressHash>,
    outbound: Vec<OutboundEntry>,
    states: HashMap<MessageId, MessageState>,
    links: HashMap<AddressHash, LinkRef>,
    propagation_nodes: HashMap<AddressHash, PropagationNode>,
    active_propagation_node: Option<AddressHash>,
    sync_link: Option<AddressHash>,
    transfer_state: PropagationTransferState,
    transfer_progress: f32,
    delivery_callbacks: Vec<DeliveryCallback>,
    failed_callbacks: Vec<FailedCallback>,
    seen_inbound: HashSet<MessageId>,
}

impl RouterInner {
    fn new() -> Self {
        Self {
            delivery_destination: None,
            delivery_hash: None,
            outbound: Vec::new(),
            states: HashMap::new(),
            links: HashMap::new(),
            propagation_nodes: HashMap::new(),
            active_propagation_node: None,
            sync_link: None,
            transfer_state: PropagationTransferState::Idle,
            transfer_progress: 0.0,
            delivery_callbacks: Vec::new(),
            failed_callbacks: Vec::new(),
            seen_inbound: HashSet::new(),
        }
    }
}

/// The LXMF delivery router: composes, spools, delivers and receives
/// messages over a running transport.
///
/// Clones share all state; the background task runs on one of them.
#[derive(Clone)]
pub struct LxmRouter {
    identity: PrivateIdentity,
    transport: Arc<Transport>,
    config: LxmRouterConfig,
    inner: Arc<Mutex<RouterInner>>,
    event_tx: broadcast::Sender<LxmfEvent>,
    cancel: CancellationToken,
}

impl LxmRouter {
    pub fn new(
        identity: PrivateIdentity,
        transport: Arc<Transport>,
        config: LxmRouterConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            identity,
            transport,
            config,
            inner: Arc::new(Mutex::new(RouterInner::new())),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<LxmfEvent> {
        self.event_tx.subscribe()
    }

    pub fn identity(&self) -> &PrivateIdentity {
        &self.identity
    }

    /// Creates and registers the `lxmf.delivery` destination for this
    /// router's identity and reloads the outbound spool.
    pub async fn register_delivery_identity(&self) -> Result<AddressHash, LxmfError> {
        let mut destination = single_in(self.identity.clone(), APP_NAME, &[DELIVERY_ASPECT])
            .map_err(|e| LxmfError::Encode(e.to_string()))?;

        if let Some(name) = self.config.display_name.as_ref() {
            destination.set_default_app_data(Some(name.as_bytes()));
        }

        let delivery_hash = *destination.address_hash();
        let destination = self.transport.register_in_destination(destination).await;

        let mut inner = self.inner.lock().await;
        inner.delivery_destination = Some(destination);
        inner.delivery_hash = Some(delivery_hash);
        drop(inner);

        self.reload_spool().await?;
        Ok(delivery_hash)
    }

    pub async fn delivery_destination_hash(&self) -> Option<AddressHash> {
        self.inner.lock().await.delivery_hash
    }

    pub async fn register_delivery_callback<F>(&self, callback: F)
    where
        F: FnMut(&LxmMessage, bool) + Send + 'static,
    {
        self.inner.lock().await.delivery_callbacks.push(Box::new(callback));
    }

    pub async fn register_failed_callback<F>(&self, callback: F)
    where
        F: FnMut(&LxmMessage) + Send + 'static,
    {
        self.inner.lock().await.failed_callbacks.push(Box::new(callback));
    }

    /// Announces the delivery destination (with the configured display
    /// name as app data).
    pub async fn announce(&self) -> Result<(), LxmfError> {
        let destination = {
            self.inner
                .lock()
                .await
                .delivery_destination
                .clone()
                .ok_or_else(|| LxmfError::Encode("no delivery identity registered".into()))?
        };
        self.transport.send_announce(&destination, None).await?;
        Ok(())
    }

    /// Signs (if needed), spools and enqueues a message for delivery.
    pub async fn handle_outbound(&self, mut message: LxmMessage) -> Result<MessageId, LxmfError> {
        if message.signature.is_none() {
            message.sign(&self.identity)?;
        }
        message.set_state(MessageState::Outbound);
        let message_id = message.message_id()?;

        self.write_spool(&message, &message_id)?;

        let mut inner = self.inner.lock().await;
        inner.states.insert(message_id, MessageState::Outbound);
        inner.outbound.push(OutboundEntry {
            message,
            message_id,
            attempts: 0,
            next_attempt: Instant::now(),
            packet_hashes: Vec::new(),
            resource_hash: None,
        });
        drop(inner);

        let _ = self.event_tx.send(LxmfEvent::MessageStateChanged {
            message_id,
            state: MessageState::Outbound,
        });
        Ok(message_id)
    }

    pub async fn message_state(&self, message_id: &MessageId) -> Option<MessageState> {
        self.inner.lock().await.states.get(message_id).copied()
    }

    pub async fn outbound_len(&self) -> usize {
        self.inner.lock().await.outbound.len()
    }

    pub async fn propagation_nodes(&self) -> Vec<PropagationNode> {
        self.inner.lock().await.propagation_nodes.values().cloned().collect()
    }

    pub async fn set_propagation_node(&self, destination_hash: AddressHash) {
        self.inner.lock().await.active_propagation_node = Some(destination_hash);
    }

    pub async fn propagation_transfer_state(&self) -> (PropagationTransferState, f32) {
        let inner = self.inner.lock().await;
        (inner.transfer_state, inner.transfer_progress)
    }

    /// Starts a sync with the selected propagation node: link up, send the
    /// request, then receive messages as a resource.
    pub async fn request_messages_from_propagation_node(&self) -> Result<(), LxmfError> {
        let node = {
            let inner = self.inner.lock().await;
            inner.active_propagation_node.ok_or(LxmfError::NoPropagationNode)?
        };

        let link = self.transport.open_link(&node).await?;
        let link_id = *link.lock().await.id();

        let mut inner = self.inner.lock().await;
        inner.links.insert(node, LinkRef { link_id, established: false });
        inner.sync_link = Some(link_id);
        inner.transfer_state = PropagationTransferState::Requesting;
        inner.transfer_progress = 0.0;
        drop(inner);

        let _ = self.event_tx.send(LxmfEvent::PropagationTransfer {
            state: PropagationTransferState::Requesting,
            progress: 0.0,
        });
        Ok(())
    }

    /// Spawns the router's background task: inbound demultiplexing, the
    /// outbound retry loop and propagation-sync bookkeeping. Callbacks run
    /// on this task, never inside the transport dispatcher.
    pub fn start(&self) {
        let router = self.clone();
        let cancel = self.cancel.clone();

        let mut announce_rx = self.transport.announce_events();
        let mut received_rx = self.transport.received_data_events();
        let mut link_rx = self.transport.link_events();
        let mut resource_rx = self.transport.resource_events();
        let mut proof_rx = self.transport.proof_events();
        let process_interval = self.config.process_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(process_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = announce_rx.recv() => {
                        if let Ok(event) = event {
                            router.handle_announce_event(event).await;
                        }
                    }
                    event = received_rx.recv() => {
                        if let Ok(event) = event {
                            router.handle_received_data(event).await;
                        }
                    }
                    event = link_rx.recv() => {
                        if let Ok(event) = event {
                            router.handle_link_event(event).await;
                        }
                    }
                    event = resource_rx.recv() => {
                        if let Ok(event) = event {
                            router.handle_resource_event(event).await;
                        }
                    }
                    event = proof_rx.recv() => {
                        if let Ok(event) = event {
                            router.handle_delivery_proof(event).await;
                        }
                    }
                    _ = ticker.tick() => {
                        router.process_outbound().await;
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
    }

    async fn handle_announce_event(&self, event: AnnounceEvent) {
        if let Some(timebase) = parse_node_announce(&event.app_data) {
            let mut inner = self.inner.lock().await;
            inner.propagation_nodes.insert(
                event.destination_hash,
                PropagationNode {
                    destination_hash: event.destination_hash,
                    timebase,
                    last_heard: crate::message::now_timestamp(),
                },
            );
            if inner.active_propagation_node.is_none() {
                inner.active_propagation_node = Some(event.destination_hash);
            }
            drop(inner);

            let _ = self.event_tx.send(LxmfEvent::PropagationNodeDiscovered {
                destination_hash: event.destination_hash,
            });
        }
    }

    async fn handle_received_data(&self, event: ReceivedData) {
        let delivery_hash = { self.inner.lock().await.delivery_hash };
        if Some(event.destination) != delivery_hash {
            return;
        }
        if event.context != PacketContext::None {
            return;
        }
        self.ingest_delivery_payload(&event.data).await;
    }

    async fn handle_link_event(&self, event: LinkEventData) {
        match event.event {
            LinkEvent::Activated => {
                let mut inner = self.inner.lock().await;
                for link_ref in inner.links.values_mut() {
                    if link_ref.link_id == event.id {
                        link_ref.established = true;
                    }
                }
                let is_sync_link = inner.sync_link == Some(event.id);
                drop(inner);

                if is_sync_link {
                    self.send_sync_request(event.id).await;
                }
            }
            LinkEvent::Data(payload) => {
                let delivery_hash = { self.inner.lock().await.delivery_hash };
                if Some(event.address_hash) == delivery_hash
                    && payload.context() == PacketContext::None
                {
                    self.ingest_delivery_payload(payload.as_slice()).await;
                }
            }
            LinkEvent::Closed => {
                let mut inner = self.inner.lock().await;
                inner.links.retain(|_, link_ref| link_ref.link_id != event.id);
                if inner.sync_link == Some(event.id)
                    && inner.transfer_state != PropagationTransferState::Complete
                {
                    inner.sync_link = None;
                    inner.transfer_state = PropagationTransferState::Failed;
                }
            }
        }
    }

    async fn send_sync_request(&self, link_id: AddressHash) {
        let Ok(request) = encode_sync_request(DEFAULT_SYNC_LIMIT) else {
            return;
        };
        if self.transport.send_on_link(&link_id, &request).await.is_ok() {
            let mut inner = self.inner.lock().await;
            inner.transfer_state = PropagationTransferState::Transferring;
            drop(inner);
            let _ = self.event_tx.send(LxmfEvent::PropagationTransfer {
                state: PropagationTransferState::Transferring,
                progress: 0.0,
            });
        }
    }

    async fn handle_resource_event(&self, event: ResourceEvent) {
        match event.kind {
            ResourceEventKind::Complete(complete) => {
                let is_sync = { self.inner.lock().await.sync_link == Some(event.link_id) };
                if is_sync {
                    self.ingest_sync_response(&complete.data).await;
                } else {
                    self.ingest_delivery_payload(&complete.data).await;
                }
            }
            ResourceEventKind::OutboundComplete => {
                self.settle_outbound(|entry| entry.resource_hash == Some(event.hash)).await;
            }
            ResourceEventKind::Progress(progress) => {
                let mut inner = self.inner.lock().await;
                if inner.sync_link == Some(event.link_id) {
                    inner.transfer_progress = progress.fraction();
                    let fraction = inner.transfer_progress;
                    drop(inner);
                    let _ = self.event_tx.send(LxmfEvent::PropagationTransfer {
                        state: PropagationTransferState::Transferring,
                        progress: fraction,
                    });
                }
            }
            ResourceEventKind::Failed(_) => {
                let mut inner = self.inner.lock().await;

                // A failed outbound resource re-enters the retry loop.
                for entry in inner.outbound.iter_mut() {
                    if entry.resource_hash == Some(event.hash) {
                        entry.resource_hash = None;
                    }
                }

                if inner.sync_link == Some(event.link_id) {
                    inner.sync_link = None;
                    inner.transfer_state = PropagationTransferState::Failed;
                    drop(inner);
                    let _ = self.event_tx.send(LxmfEvent::PropagationTransfer {
                        state: PropagationTransferState::Failed,
                        progress: 0.0,
                    });
                }
            }
        }
    }

    async fn handle_delivery_proof(&self, proof: DeliveryProof) {
        self.settle_outbound(|entry| entry.packet_hashes.contains(&proof.packet_hash)).await;
    }

    /// Marks matching in-flight messages delivered.
    async fn settle_outbound<F: Fn(&OutboundEntry) -> bool>(&self, matches: F) {
        let mut delivered = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.outbound.retain(|entry| {
                if matches(entry) {
                    delivered.push(entry.message_id);
                    false
                } else {
                    true
                }
            });
            for message_id in &delivered {
                inner.states.insert(*message_id, MessageState::Delivered);
            }
        }

        for message_id in delivered {
            self.remove_spool(&message_id);
            let _ = self.event_tx.send(LxmfEvent::MessageStateChanged {
                message_id,
                state: MessageState::Delivered,
            });
        }
    }

    /// Parses, deduplicates, verifies and delivers one inbound payload.
    async fn ingest_delivery_payload(&self, payload: &[u8]) {
        let delivery_hash = { self.inner.lock().await.delivery_hash };
        let Some(delivery_hash) = delivery_hash else {
            return;
        };

        let Ok(message) = LxmMessage::from_delivery_payload(delivery_hash, payload) else {
            log::debug!("lxmf: dropping unparseable inbound payload ({}B)", payload.len());
            return;
        };

        let Ok(message_id) = message.message_id() else {
            return;
        };

        let verified = self
            .transport
            .identity_store()
            .recall(&message.source)
            .map(|identity| message.validate(&identity).unwrap_or(false))
            .unwrap_or(false);

        // Callbacks run outside the router lock so they may call back in.
        let mut callbacks = {
            let mut inner = self.inner.lock().await;
            if !inner.seen_inbound.insert(message_id) {
                return;
            }
            std::mem::take(&mut inner.delivery_callbacks)
        };

        let message = Arc::new(message);
        for callback in callbacks.iter_mut() {
            callback(&message, verified);
        }

        {
            let mut inner = self.inner.lock().await;
            callbacks.extend(inner.delivery_callbacks.drain(..));
            inner.delivery_callbacks = callbacks;
        }

        let _ = self.event_tx.send(LxmfEvent::InboundMessage { message, verified });
    }

    async fn ingest_sync_response(&self, payload: &[u8]) {
        let entries = match parse_sync_response(payload) {
            Ok(entries) => entries,
            Err(_) => {
                let mut inner = self.inner.lock().await;
                inner.transfer_state = PropagationTransferState::Failed;
                inner.sync_link = None;
                return;
            }
        };

        let (delivery_hash, destination) = {
            let inner = self.inner.lock().await;
            (inner.delivery_hash, inner.delivery_destination.clone())
        };
        let (Some(delivery_hash), Some(destination)) = (delivery_hash, destination) else {
            return;
        };

        for entry in &entries {
            if entry.len() <= 16 {
                continue;
            }
            let Ok(entry_destination) = AddressHash::try_from_slice(&entry[..16]) else {
                continue;
            };
            if entry_destination != delivery_hash {
                continue;
            }
            let decrypted = { destination.lock().await.decrypt(&entry[16..]) };
            if let Ok((payload, _)) = decrypted {
                self.ingest_delivery_payload(&payload).await;
            }
        }

        let mut inner = self.inner.lock().await;
        inner.transfer_state = PropagationTransferState::Complete;
        inner.transfer_progress = 1.0;
        inner.sync_link = None;
        drop(inner);

        let _ = self.event_tx.send(LxmfEvent::PropagationTransfer {
            state: PropagationTransferState::Complete,
            progress: 1.0,
        });
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = self.config.retry_base * 2u32.saturating_pow(attempts.min(8));
        let jitter = Duration::from_millis(OsRng.next_u64() % DELIVERY_RETRY_JITTER_MS.max(1));
        exp + jitter
    }

    /// One pass over the outbound queue: sends what is ready, retries what
    /// timed out, fails what ran out of attempts.
    async fn process_outbound(&self) {
        let now = Instant::now();
        let max_attempts = self.config.max_delivery_attempts;

        // Pull due entries out, work on them, then put survivors back.
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut index = 0;
            while index < inner.outbound.len() {
                if inner.outbound[index].next_attempt <= now {
                    due.push(inner.outbound.swap_remove(index));
                } else {
                    index += 1;
                }
            }
        }

        let mut surviving = Vec::new();
        let mut failed = Vec::new();

        for mut entry in due {
            // A resource already in flight settles (or fails) on its own;
            // retrying here would start a duplicate transfer.
            if entry.resource_hash.is_some() {
                entry.next_attempt = now + self.config.retry_base;
                surviving.push(entry);
                continue;
            }

            if entry.attempts >= max_attempts {
                failed.push(entry);
                continue;
            }
            entry.attempts += 1;
            entry.next_attempt = now + self.backoff(entry.attempts);

            match self.attempt_delivery(&mut entry).await {
                Ok(state) => {
                    let mut inner = self.inner.lock().await;
                    inner.states.insert(entry.message_id, state);
                    drop(inner);
                    let _ = self.event_tx.send(LxmfEvent::MessageStateChanged {
                        message_id: entry.message_id,
                        state,
                    });
                }
                Err(_) => {}
            }
            surviving.push(entry);
        }

        if !surviving.is_empty() {
            let mut inner = self.inner.lock().await;
            inner.outbound.extend(surviving);
        }

        for entry in failed {
            let mut callbacks = {
                let mut inner = self.inner.lock().await;
                inner.states.insert(entry.message_id, MessageState::Failed);
                std::mem::take(&mut inner.failed_callbacks)
            };
            for callback in callbacks.iter_mut() {
                callback(&entry.message);
            }
            {
                let mut inner = self.inner.lock().await;
                callbacks.extend(inner.failed_callbacks.drain(..));
                inner.failed_callbacks = callbacks;
            }
            self.remove_spool(&entry.message_id);
            let _ = self.event_tx.send(LxmfEvent::MessageStateChanged {
                message_id: entry.message_id,
                state: MessageState::Failed,
            });
            log::info!(
                "lxmf: delivery failed for {} after retries",
                hex::encode(entry.message_id)
            );
        }
    }

    async fn attempt_delivery(
        &self,
        entry: &mut OutboundEntry,
    ) -> Result<MessageState, LxmfError> {
        entry.message.set_state(MessageState::Sending);
        let payload = entry.message.delivery_payload()?;
        let (method, representation) = decide_delivery(entry.message.method, payload.len());

        match method {
            DeliveryMethod::Opportunistic => {
                let destination = entry.message.destination;
                if !self.transport.has_path(&destination).await {
                    self.transport.request_path(&destination).await;
                    return Ok(MessageState::Outbound);
                }
                let packet_hash = self.transport.send_to_single(&destination, &payload).await?;
                entry.packet_hashes.push(packet_hash);
                entry.message.set_state(MessageState::Sent);
                Ok(MessageState::Sent)
            }
            DeliveryMethod::Direct => {
                let destination = entry.message.destination;
                self.deliver_over_link(entry, destination, payload, representation).await
            }
            DeliveryMethod::Propagated => {
                let node = {
                    self.inner
                        .lock()
                        .await
                        .active_propagation_node
                        .ok_or(LxmfError::NoPropagationNode)?
                };
                let recipient = self
                    .transport
                    .identity_store()
                    .recall(&entry.message.destination)
                    .ok_or(LxmfError::NoPath)?;
                let envelope = entry.message.pack_propagation(&recipient, OsRng)?;
                self.deliver_over_link(entry, node, envelope, representation).await
            }
        }
    }

    /// Sends a payload over a link to `target`, opening the link first
    /// when necessary.
    async fn deliver_over_link(
        &self,
        entry: &mut OutboundEntry,
        target: AddressHash,
        payload: Vec<u8>,
        representation: Representation,
    ) -> Result<MessageState, LxmfError> {
        let link_state = {
            let inner = self.inner.lock().await;
            inner.links.get(&target).map(|link_ref| (link_ref.link_id, link_ref.established))
        };

        match link_state {
            None => {
                if self.transport.recall_out_destination(&target).await.is_none() {
                    self.transport.request_path(&target).await;
                    return Ok(MessageState::Outbound);
                }
                let link = self.transport.open_link(&target).await?;
                let link_id = *link.lock().await.id();
                self.inner
                    .lock()
                    .await
                    .links
                    .insert(target, LinkRef { link_id, established: false });
                entry.message.set_state(MessageState::SendingViaLink);
                Ok(MessageState::SendingViaLink)
            }
            Some((_, false)) => Ok(MessageState::SendingViaLink),
            Some((link_id, true)) => match representation {
                Representation::Packet => {
                    let packet_hash = self.transport.send_on_link(&link_id, &payload).await?;
                    entry.packet_hashes.push(packet_hash);
                    entry.message.set_state(MessageState::Sent);
                    Ok(MessageState::Sent)
                }
                Representation::Resource => {
                    let resource_hash =
                        self.transport.send_resource(&link_id, payload, None).await?;
                    entry.resource_hash = Some(resource_hash);
                    entry.message.set_state(MessageState::SendingViaLink);
                    Ok(MessageState::SendingViaLink)
                }
            },
        }
    }

    fn spool_path(&self, message_id: &MessageId) -> Option<PathBuf> {
        self.config.spool_dir.as_ref().map(|dir| dir.join(hex::encode(message_id)))
    }

    fn write_spool(&self, message: &LxmMessage, message_id: &MessageId) -> Result<(), LxmfError> {
        let Some(path) = self.spool_path(message_id) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LxmfError::Io(e.to_string()))?;
        }
        std::fs::write(&path, message.pack_spool()?).map_err(|e| LxmfError::Io(e.to_string()))
    }

    fn remove_spool(&self, message_id: &MessageId) {
        if let Some(path) = self.spool_path(message_id) {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Re-enqueues spooled messages from a previous run.
    async fn reload_spool(&self) -> Result<(), LxmfError> {
        let Some(dir) = self.config.spool_dir.as_ref() else {
            return Ok(());
        };
        if !dir.exists() {
            return Ok(());
        }

        let entries = std::fs::read_dir(dir).map_err(|e| LxmfError::Io(e.to_string()))?;
        let mut inner = self.inner.lock().await;
        for entry in entries.flatten() {
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            let Ok(message) = LxmMessage::unpack_spool(&bytes) else {
                log::warn!("lxmf: skipping corrupt spool file {:?}", entry.path());
                continue;
            };
            let Ok(message_id) = message.message_id() else {
                continue;
            };
            if inner.outbound.iter().any(|existing| existing.message_id == message_id) {
                continue;
            }

            log::debug!("lxmf: restored spooled message {}", hex::encode(message_id));
            inner.states.insert(message_id, MessageState::Outbound);
            inner.outbound.push(OutboundEntry {
                message,
                message_id,
                attempts: 0,
                next_attempt: Instant::now(),
                packet_hashes: Vec::new(),
                resource_hash: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand_core::OsRng;

    use reticulum::identity::PrivateIdentity;
    use reticulum::transport::{Transport, TransportConfig};

    use super::{LxmRouter, LxmRouterConfig};
    use crate::message::{DeliveryMethod, LxmMessage, MessageState};

    async fn test_router(spool: Option<std::path::PathBuf>) -> Arc<LxmRouter> {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let transport =
            Arc::new(Transport::new(TransportConfig::new("test", &identity, false)));
        let router = Arc::new(LxmRouter::new(
            identity,
            transport,
            LxmRouterConfig { spool_dir: spool, ..Default::default() },
        ));
        router.register_delivery_identity().await.expect("delivery identity");
        router
    }

    #[tokio::test]
    async fn outbound_messages_are_signed_and_tracked() {
        let router = test_router(None).await;
        let peer = PrivateIdentity::new_from_rand(OsRng);

        let message = LxmMessage::new(
            *peer.address_hash(),
            router.delivery_destination_hash().await.expect("hash"),
            b"tracked".as_slice(),
            b"".as_slice(),
            DeliveryMethod::Opportunistic,
        );

        let message_id = router.handle_outbound(message).await.expect("enqueue");
        assert_eq!(router.message_state(&message_id).await, Some(MessageState::Outbound));
        assert_eq!(router.outbound_len().await, 1);
    }

    #[tokio::test]
    async fn spool_survives_router_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = dir.path().to_path_buf();

        let identity = PrivateIdentity::new_from_rand(OsRng);
        let peer = PrivateIdentity::new_from_rand(OsRng);

        let message_id = {
            let transport =
                Arc::new(Transport::new(TransportConfig::new("first", &identity, false)));
            let router = Arc::new(LxmRouter::new(
                identity.clone(),
                transport,
                LxmRouterConfig { spool_dir: Some(spool.clone()), ..Default::default() },
            ));
            let our_hash = router.register_delivery_identity().await.expect("identity");

            let message = LxmMessage::new(
                *peer.address_hash(),
                our_hash,
                b"persistent".as_slice(),
                b"".as_slice(),
                DeliveryMethod::Direct,
            );
            router.handle_outbound(message).await.expect("enqueue")
        };

        // A new router over the same spool directory restores the message.
        let transport =
            Arc::new(Transport::new(TransportConfig::new("second", &identity, false)));
        let router = Arc::new(LxmRouter::new(
            identity,
            transport,
            LxmRouterConfig { spool_dir: Some(spool), ..Default::default() },
        ));
        router.register_delivery_identity().await.expect("identity");

        assert_eq!(router.outbound_len().await, 1);
        assert_eq!(router.message_state(&message_id).await, Some(MessageState::Outbound));
    }
}
