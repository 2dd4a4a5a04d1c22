use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time;

use crate::destination::link::LinkStatus;
use crate::hash::AddressHash;
use crate::iface::InterfaceRxReceiver;
use crate::packet::Packet;

use super::{TransportHandler, PACKET_CACHE_KEEP, PENDING_PROOF_KEEP};

const INTERVAL_LINK_MAINTENANCE: Duration = Duration::from_secs(1);
const INTERVAL_RESOURCE_WATCHDOG: Duration = Duration::from_secs(1);
const INTERVAL_ANNOUNCE_RETRANSMIT: Duration = Duration::from_secs(2);
const INTERVAL_CACHE_CLEANUP: Duration = Duration::from_secs(30);

/// Walks every link against the keepalive and stale deadlines, retries
/// pending outbound requests and reaps closed links.
pub(super) async fn maintain_links(mut handler: MutexGuard<'_, TransportHandler>) {
    let keepalive = Duration::from_secs(handler.config.link_keepalive_secs);
    let stale = Duration::from_secs(handler.config.link_stale_secs);
    let retry = Duration::from_secs(handler.config.link_retry_secs);

    let mut to_send: Vec<Packet> = Vec::new();
    let mut to_remove: Vec<AddressHash> = Vec::new();
    let mut to_rekey: Vec<(AddressHash, AddressHash)> = Vec::new();

    let links: Vec<(AddressHash, Arc<Mutex<crate::destination::link::Link>>, bool)> = handler
        .out_links
        .iter()
        .map(|(id, link)| (*id, link.clone(), true))
        .chain(handler.in_links.iter().map(|(id, link)| (*id, link.clone(), false)))
        .collect();

    for (link_id, link, outbound) in links {
        let mut guard = link.lock().await;

        match guard.status() {
            LinkStatus::Active => {
                if guard.inactive_for() > keepalive {
                    to_send.push(guard.keep_alive_packet(true));
                    guard.mark_stale();
                }
            }
            LinkStatus::Stale => {
                if guard.inactive_for() > stale {
                    to_send.push(guard.close_packet());
                    guard.close();
                    to_remove.push(link_id);
                }
            }
            LinkStatus::Pending if outbound => {
                if guard.elapsed() > retry {
                    log::debug!("tp: repeating link request {}", link_id);
                    let request = guard.request();
                    let new_id = *guard.id();
                    if new_id != link_id {
                        to_rekey.push((link_id, new_id));
                    }
                    to_send.push(request);
                }
            }
            LinkStatus::Closed => {
                to_remove.push(link_id);
            }
            _ => {}
        }
    }

    for (old_id, new_id) in to_rekey {
        if let Some(link) = handler.out_links.remove(&old_id) {
            handler.out_links.insert(new_id, link);
        }
        handler.link_ifaces.remove(&old_id);
    }

    for link_id in to_remove {
        handler.in_links.remove(&link_id);
        handler.out_links.remove(&link_id);
        handler.link_ifaces.remove(&link_id);
    }

    for packet in to_send {
        handler.send_packet(packet).await;
    }
}

pub(super) async fn cleanup_caches(mut handler: MutexGuard<'_, TransportHandler>) {
    handler.packet_cache.release(PACKET_CACHE_KEEP);
    handler.path_table.drop_expired();
    handler.announce_limits.cleanup();
    handler.link_table.remove_stale();
    handler
        .pending_proofs
        .retain(|_, pending| pending.registered.elapsed() <= PENDING_PROOF_KEEP);
    handler
        .reverse_table
        .retain(|_, (_, recorded)| recorded.elapsed() <= PENDING_PROOF_KEEP);
    if let Some(store) = handler.ratchet_store.as_mut() {
        store.clean_expired(crate::ratchets::now_secs());
    }
    handler.iface_manager.lock().await.cleanup();
}

pub(super) async fn retransmit_announces(mut handler: MutexGuard<'_, TransportHandler>) {
    let transport_id = *handler.config.identity.address_hash();
    let messages = handler.announce_table.to_retransmit(&transport_id);
    for message in messages {
        handler.send(message).await;
    }
}

/// Spawns the dispatcher's background tasks: the packet pump and the
/// periodic maintenance loops, all reaped by the shared cancel token.
pub(super) async fn manage_transport(
    handler_arc: Arc<Mutex<TransportHandler>>,
    rx_receiver: Arc<Mutex<InterfaceRxReceiver>>,
) {
    let (cancel, retransmit) = {
        let handler = handler_arc.lock().await;
        (handler.cancel.clone(), handler.config.retransmit)
    };

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let mut rx_receiver = rx_receiver.lock().await;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx_receiver.recv() => {
                        let Some(message) = message else { break };
                        drop(rx_receiver);

                        let mut handler = handler_arc.lock().await;
                        handler.handle_inbound(message.packet, message.address).await;
                    }
                };
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_LINK_MAINTENANCE) => {
                        maintain_links(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_RESOURCE_WATCHDOG) => {
                        handler_arc.lock().await.resource_watchdog().await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_CACHE_CLEANUP) => {
                        cleanup_caches(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    if retransmit {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_ANNOUNCE_RETRANSMIT) => {
                        retransmit_announces(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }
}
