use tokio::sync::mpsc;

use crate::iface::ifac::{decode_packet, encode_packet};
use crate::iface::RxMessage;

use super::{Interface, InterfaceContext};

/// In-process interface joined to a peer by a pair of byte channels. Frames
/// cross the "wire" as serialized packets, so access-code masking behaves
/// exactly as it does on a physical interface. Used by node-level tests.
pub struct PairInterface {
    to_peer: mpsc::Sender<Vec<u8>>,
    from_peer: Option<mpsc::Receiver<Vec<u8>>>,
}

impl PairInterface {
    /// Creates both ends of a virtual wire.
    pub fn new_pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);

        (
            Self { to_peer: a_tx, from_peer: Some(b_rx) },
            Self { to_peer: b_tx, from_peer: Some(a_rx) },
        )
    }

    pub async fn spawn(context: InterfaceContext<PairInterface>) {
        let iface_address = context.channel.address;
        let (to_peer, from_peer) = {
            let mut inner = match context.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            (inner.to_peer.clone(), inner.from_peer.take())
        };
        let Some(mut from_peer) = from_peer else {
            return;
        };

        let (rx_channel, mut tx_channel, ifac) = context.channel.split();
        let cancel = context.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = tx_channel.recv() => {
                    let Some(message) = message else { break };
                    if let Ok(raw) = encode_packet(&message.packet, ifac.as_deref()) {
                        let _ = to_peer.send(raw).await;
                    }
                }
                frame = from_peer.recv() => {
                    let Some(frame) = frame else { break };
                    if let Ok(packet) = decode_packet(&frame, ifac.as_deref()) {
                        let _ = rx_channel
                            .send(RxMessage { address: iface_address, packet })
                            .await;
                    }
                }
            }
        }
    }
}

impl Interface for PairInterface {
    fn mtu() -> usize {
        crate::packet::RETICULUM_MTU
    }
}
