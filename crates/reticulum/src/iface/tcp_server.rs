use std::sync::Arc;

use tokio::net::TcpListener;

use super::tcp_client::TcpClient;
use super::{Interface, InterfaceContext, InterfaceManager, InterfaceProperties};

/// Listening side of the TCP interface. Each accepted connection becomes
/// its own interface, inheriting this listener's access-code context.
pub struct TcpServer {
    addr: String,
    iface_manager: Arc<tokio::sync::Mutex<InterfaceManager>>,
}

impl TcpServer {
    pub fn new<T: Into<String>>(
        addr: T,
        iface_manager: Arc<tokio::sync::Mutex<InterfaceManager>>,
    ) -> Self {
        Self { addr: addr.into(), iface_manager }
    }

    pub async fn spawn(context: InterfaceContext<Self>) {
        let (addr, iface_manager) = {
            let inner = match context.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            (inner.addr.clone(), inner.iface_manager.clone())
        };

        let (_, mut tx_channel, ifac) = context.channel.split();

        loop {
            if context.cancel.is_cancelled() {
                break;
            }

            let listener = match TcpListener::bind(addr.clone()).await {
                Ok(listener) => listener,
                Err(_) => {
                    log::warn!("tcp_server: couldn't bind to <{}>", addr);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            log::info!("tcp_server: listening on <{}>", addr);

            let cancel = context.cancel.clone();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return;
                    }
                    // The listener itself never transmits; drain and drop.
                    _ = tx_channel.recv() => {}
                    client = listener.accept() => {
                        if let Ok((stream, peer)) = client {
                            log::info!("tcp_server: client <{}> connected to <{}>", peer, addr);

                            let mut iface_manager = iface_manager.lock().await;
                            iface_manager.spawn_with(
                                TcpClient::new_from_stream(peer.to_string(), stream),
                                InterfaceProperties::named(format!("tcp:{}", peer)),
                                ifac.clone(),
                                TcpClient::spawn,
                            );
                        }
                    }
                }
            }
        }
    }
}

impl Interface for TcpServer {
    fn mtu() -> usize {
        TcpClient::mtu()
    }
}
