use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::iface::ifac::{decode_packet, encode_packet};
use crate::iface::RxMessage;
use crate::packet::RETICULUM_MTU;

use super::{Interface, InterfaceContext};

const BUFFER_SIZE: usize = RETICULUM_MTU * 3;

/// Datagram interface: one packet per datagram, no framing.
pub struct UdpInterface {
    bind_addr: String,
    forward_addr: Option<String>,
}

impl UdpInterface {
    pub fn new<T: Into<String>>(bind_addr: T, forward_addr: Option<T>) -> Self {
        Self { bind_addr: bind_addr.into(), forward_addr: forward_addr.map(Into::into) }
    }

    pub async fn spawn(context: InterfaceContext<Self>) {
        let (bind_addr, forward_addr) = {
            let inner = match context.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            (inner.bind_addr.clone(), inner.forward_addr.clone())
        };
        let iface_address = context.channel.address;

        let (rx_channel, tx_channel, ifac) = context.channel.split();
        let tx_channel = Arc::new(tokio::sync::Mutex::new(tx_channel));

        loop {
            if context.cancel.is_cancelled() {
                break;
            }

            let socket = match UdpSocket::bind(bind_addr.clone()).await {
                Ok(socket) => socket,
                Err(_) => {
                    log::info!("udp: couldn't bind to <{}>", bind_addr);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            log::info!("udp: bound to <{}>", bind_addr);

            let cancel = context.cancel.clone();
            let stop = CancellationToken::new();
            let read_socket = Arc::new(socket);
            let write_socket = read_socket.clone();

            let rx_task = {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let rx_channel = rx_channel.clone();
                let ifac = ifac.clone();

                tokio::spawn(async move {
                    let mut rx_buffer = [0u8; BUFFER_SIZE];
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            result = read_socket.recv_from(&mut rx_buffer) => {
                                match result {
                                    Ok((n, _)) if n > 0 => {
                                        if let Ok(packet) =
                                            decode_packet(&rx_buffer[..n], ifac.as_deref())
                                        {
                                            let _ = rx_channel
                                                .send(RxMessage { address: iface_address, packet })
                                                .await;
                                        }
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        log::warn!("udp: socket error {}", e);
                                        stop.cancel();
                                        break;
                                    }
                                }
                            },
                        };
                    }
                })
            };

            if let Some(forward_addr) = forward_addr.clone() {
                let tx_task = {
                    let cancel = cancel.clone();
                    let stop = stop.clone();
                    let tx_channel = tx_channel.clone();
                    let ifac = ifac.clone();

                    tokio::spawn(async move {
                        loop {
                            if stop.is_cancelled() {
                                break;
                            }

                            let mut tx_channel = tx_channel.lock().await;

                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = stop.cancelled() => break,
                                Some(message) = tx_channel.recv() => {
                                    if let Ok(raw) =
                                        encode_packet(&message.packet, ifac.as_deref())
                                    {
                                        let _ = write_socket.send_to(&raw, &forward_addr).await;
                                    }
                                }
                            };
                        }
                    })
                };
                let _ = tx_task.await;
            }

            let _ = rx_task.await;

            log::info!("udp: <{}> closed", bind_addr);
        }
    }
}

impl Interface for UdpInterface {
    fn mtu() -> usize {
        RETICULUM_MTU
    }
}
