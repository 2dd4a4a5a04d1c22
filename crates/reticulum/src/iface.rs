pub mod hdlc;
pub mod ifac;
pub mod pair;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::hash::AddressHash;
use crate::hash::Hash;
use crate::packet::Packet;

pub use ifac::IfacContext;

pub type InterfaceTxSender = mpsc::Sender<TxMessage>;
pub type InterfaceTxReceiver = mpsc::Receiver<TxMessage>;

pub type InterfaceRxSender = mpsc::Sender<RxMessage>;
pub type InterfaceRxReceiver = mpsc::Receiver<RxMessage>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TxMessageType {
    /// Send on every interface that can send, optionally excluding the one
    /// the packet arrived on.
    Broadcast(Option<AddressHash>),
    /// Send on exactly one interface.
    Direct(AddressHash),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct TxMessage {
    pub tx_type: TxMessageType,
    pub packet: Packet,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct RxMessage {
    /// Address of the receiving interface.
    pub address: AddressHash,
    pub packet: Packet,
}

/// Static capabilities an interface declares when it registers.
#[derive(Debug, Clone)]
pub struct InterfaceProperties {
    pub name: String,
    pub bitrate: u64,
    pub hw_mtu: usize,
    pub can_send: bool,
    pub can_receive: bool,
    pub wants_tunnel: bool,
}

impl Default for InterfaceProperties {
    fn default() -> Self {
        Self {
            name: String::new(),
            bitrate: 0,
            hw_mtu: crate::packet::RETICULUM_MTU,
            can_send: true,
            can_receive: true,
            wants_tunnel: false,
        }
    }
}

impl InterfaceProperties {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

/// Everything a driver needs to run: where to push received packets, where
/// outbound packets arrive, and the per-interface access-code context.
pub struct InterfaceChannel {
    pub address: AddressHash,
    pub rx_channel: InterfaceRxSender,
    pub tx_channel: InterfaceTxReceiver,
    pub stop: CancellationToken,
    pub ifac: Option<Arc<IfacContext>>,
}

impl InterfaceChannel {
    pub fn split(self) -> (InterfaceRxSender, InterfaceTxReceiver, Option<Arc<IfacContext>>) {
        (self.rx_channel, self.tx_channel, self.ifac)
    }

    pub fn address(&self) -> &AddressHash {
        &self.address
    }
}

pub trait Interface {
    fn mtu() -> usize;
}

struct LocalInterface {
    address: AddressHash,
    tx_send: InterfaceTxSender,
    stop: CancellationToken,
    properties: InterfaceProperties,
}

pub struct InterfaceContext<T: Interface> {
    pub inner: Arc<Mutex<T>>,
    pub channel: InterfaceChannel,
    pub cancel: CancellationToken,
}

pub struct InterfaceManager {
    counter: usize,
    rx_recv: Arc<tokio::sync::Mutex<InterfaceRxReceiver>>,
    rx_send: InterfaceRxSender,
    cancel: CancellationToken,
    ifaces: Vec<LocalInterface>,
}

const DEFAULT_IFACE_TX_QUEUE_CAPACITY: usize = 128;
const IFACE_TX_ENQUEUE_TIMEOUT_MS: u64 = 200;

impl InterfaceManager {
    pub fn new(rx_cap: usize) -> Self {
        let (rx_send, rx_recv) = mpsc::channel(rx_cap);
        let rx_recv = Arc::new(tokio::sync::Mutex::new(rx_recv));

        Self { counter: 0, rx_recv, rx_send, cancel: CancellationToken::new(), ifaces: Vec::new() }
    }

    pub fn new_channel(
        &mut self,
        properties: InterfaceProperties,
        ifac: Option<Arc<IfacContext>>,
    ) -> InterfaceChannel {
        self.counter += 1;

        let counter_bytes = self.counter.to_le_bytes();
        let address = AddressHash::new_from_hash(&Hash::new_from_slice(&counter_bytes[..]));

        let (tx_send, tx_recv) = mpsc::channel(DEFAULT_IFACE_TX_QUEUE_CAPACITY);

        log::debug!("iface: create channel {} ({})", address, properties.name);

        let stop = CancellationToken::new();
        self.ifaces.push(LocalInterface { address, tx_send, stop: stop.clone(), properties });

        InterfaceChannel {
            rx_channel: self.rx_send.clone(),
            tx_channel: tx_recv,
            address,
            stop,
            ifac,
        }
    }

    pub fn new_context<T: Interface>(
        &mut self,
        inner: T,
        properties: InterfaceProperties,
        ifac: Option<Arc<IfacContext>>,
    ) -> InterfaceContext<T> {
        let channel = self.new_channel(properties, ifac);
        InterfaceContext::<T> {
            inner: Arc::new(Mutex::new(inner)),
            channel,
            cancel: self.cancel.clone(),
        }
    }

    pub fn spawn<T: Interface, F, R>(&mut self, inner: T, worker: F) -> AddressHash
    where
        F: FnOnce(InterfaceContext<T>) -> R,
        R: std::future::Future<Output = ()> + Send + 'static,
    {
        self.spawn_with(inner, InterfaceProperties::default(), None, worker)
    }

    pub fn spawn_with<T: Interface, F, R>(
        &mut self,
        inner: T,
        properties: InterfaceProperties,
        ifac: Option<Arc<IfacContext>>,
        worker: F,
    ) -> AddressHash
    where
        F: FnOnce(InterfaceContext<T>) -> R,
        R: std::future::Future<Output = ()> + Send + 'static,
    {
        let context = self.new_context(inner, properties, ifac);
        let address = *context.channel.address();

        task::spawn(worker(context));

        address
    }

    pub fn receiver(&self) -> Arc<tokio::sync::Mutex<InterfaceRxReceiver>> {
        self.rx_recv.clone()
    }

    pub fn properties(&self, address: &AddressHash) -> Option<&InterfaceProperties> {
        self.ifaces
            .iter()
            .find(|iface| iface.address == *address)
            .map(|iface| &iface.properties)
    }

    pub fn wants_tunnel(&self, address: &AddressHash) -> bool {
        self.properties(address).map(|props| props.wants_tunnel).unwrap_or(false)
    }

    pub fn cleanup(&mut self) {
        self.ifaces.retain(|iface| !iface.stop.is_cancelled());
    }

    pub fn stop_all(&mut self) {
        for iface in &self.ifaces {
            iface.stop.cancel();
        }
        self.cancel.cancel();
    }

    pub async fn send(&self, message: TxMessage) -> usize {
        let mut sent = 0usize;

        for iface in &self.ifaces {
            let should_send = match message.tx_type {
                TxMessageType::Broadcast(exclude) => {
                    exclude.map(|address| address != iface.address).unwrap_or(true)
                }
                TxMessageType::Direct(address) => address == iface.address,
            };

            if !should_send || !iface.properties.can_send || iface.stop.is_cancelled() {
                continue;
            }

            match iface.tx_send.try_send(message) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Short async wait before dropping, so bursts do not cost
                    // critical packets like link proofs.
                    match tokio::time::timeout(
                        Duration::from_millis(IFACE_TX_ENQUEUE_TIMEOUT_MS),
                        iface.tx_send.send(message),
                    )
                    .await
                    {
                        Ok(Ok(())) => sent += 1,
                        Ok(Err(_)) | Err(_) => {
                            log::warn!(
                                "iface: tx queue unavailable on {} for {:?}",
                                iface.address,
                                message.tx_type
                            );
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::warn!("iface: tx queue closed on {}", iface.address);
                }
            }
        }

        sent
    }
}

impl Drop for InterfaceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
