use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::buffer::OutputBuffer;
use crate::iface::ifac::{decode_packet, encode_packet};
use crate::iface::RxMessage;

use super::hdlc::Hdlc;
use super::{Interface, InterfaceContext};

const BUFFER_SIZE: usize = 2048;
const RECONNECT_DELAY_SECS: u64 = 5;

/// HDLC-framed TCP interface. Reconnects forever unless it was created
/// around an accepted server-side stream.
pub struct TcpClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpClient {
    pub fn new<T: Into<String>>(addr: T) -> Self {
        Self { addr: addr.into(), stream: None }
    }

    pub fn new_from_stream<T: Into<String>>(addr: T, stream: TcpStream) -> Self {
        Self { addr: addr.into(), stream: Some(stream) }
    }

    pub async fn spawn(context: InterfaceContext<TcpClient>) {
        let iface_stop = context.channel.stop.clone();
        let iface_address = context.channel.address;
        let (addr, mut stream) = {
            let mut inner = match context.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            (inner.addr.clone(), inner.stream.take())
        };

        let (rx_channel, tx_channel, ifac) = context.channel.split();
        let tx_channel = Arc::new(tokio::sync::Mutex::new(tx_channel));

        let mut accepted = false;
        loop {
            if accepted || context.cancel.is_cancelled() {
                break;
            }

            let connection = match stream.take() {
                Some(stream) => {
                    accepted = true;
                    Ok(stream)
                }
                None => TcpStream::connect(addr.clone()).await,
            };

            let connection = match connection {
                Ok(connection) => connection,
                Err(_) => {
                    log::info!("tcp_client: couldn't connect to <{}>", addr);
                    tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                    continue;
                }
            };

            log::info!("tcp_client: connected to <{}>", addr);

            let cancel = context.cancel.clone();
            let stop = CancellationToken::new();
            let (mut read_stream, mut write_stream) = connection.into_split();

            let rx_task = {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let rx_channel = rx_channel.clone();
                let ifac = ifac.clone();

                tokio::spawn(async move {
                    let mut frame_buffer: Vec<u8> = Vec::with_capacity(BUFFER_SIZE * 4);
                    let mut tcp_buffer = [0u8; BUFFER_SIZE * 16];
                    let mut hdlc_buffer = [0u8; BUFFER_SIZE];

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            result = read_stream.read(&mut tcp_buffer[..]) => {
                                match result {
                                    Ok(0) => {
                                        log::warn!("tcp_client: connection closed");
                                        stop.cancel();
                                        break;
                                    }
                                    Ok(n) => {
                                        // TCP delivers partial or multiple HDLC
                                        // frames per read.
                                        frame_buffer.extend_from_slice(&tcp_buffer[..n]);

                                        while let Some((start, end)) = Hdlc::find(&frame_buffer) {
                                            let mut output = OutputBuffer::new(&mut hdlc_buffer[..]);
                                            if Hdlc::decode(&frame_buffer[start..=end], &mut output).is_ok() {
                                                if let Ok(packet) =
                                                    decode_packet(output.as_slice(), ifac.as_deref())
                                                {
                                                    let _ = rx_channel
                                                        .send(RxMessage { address: iface_address, packet })
                                                        .await;
                                                }
                                            }
                                            frame_buffer.drain(..=end);
                                        }

                                        // Guard against unbounded growth when no
                                        // valid frame ever closes.
                                        if frame_buffer.len() > BUFFER_SIZE * 64 {
                                            frame_buffer.clear();
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("tcp_client: connection error {}", e);
                                        stop.cancel();
                                        break;
                                    }
                                }
                            },
                        };
                    }
                })
            };

            let tx_task = {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let tx_channel = tx_channel.clone();
                let ifac = ifac.clone();

                tokio::spawn(async move {
                    let mut hdlc_buffer = [0u8; BUFFER_SIZE];

                    loop {
                        if stop.is_cancelled() {
                            break;
                        }

                        let mut tx_channel = tx_channel.lock().await;

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            Some(message) = tx_channel.recv() => {
                                let Ok(raw) = encode_packet(&message.packet, ifac.as_deref()) else {
                                    continue;
                                };

                                let mut output = OutputBuffer::new(&mut hdlc_buffer[..]);
                                if Hdlc::encode(&raw, &mut output).is_err() {
                                    log::warn!("tcp_client: frame too large ({}B)", raw.len());
                                    continue;
                                }

                                if write_stream.write_all(output.as_slice()).await.is_err()
                                    || write_stream.flush().await.is_err()
                                {
                                    log::warn!("tcp_client: write failed on {}", iface_address);
                                    stop.cancel();
                                    break;
                                }
                            }
                        };
                    }
                })
            };

            let _ = tokio::join!(tx_task, rx_task);

            log::info!("tcp_client: disconnected from <{}>", addr);
        }

        iface_stop.cancel();
    }
}

impl Interface for TcpClient {
    fn mtu() -> usize {
        BUFFER_SIZE
    }
}
