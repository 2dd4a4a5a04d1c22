use serde_bytes::ByteBuf;

use reticulum::hash::AddressHash;

use crate::error::LxmfError;

/// Client-side view of a propagation-node transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationTransferState {
    Idle,
    Requesting,
    Transferring,
    Complete,
    Failed,
}

/// A propagation node learned from its announce.
#[derive(Debug, Clone)]
pub struct PropagationNode {
    pub destination_hash: AddressHash,
    pub timebase: u64,
    pub last_heard: f64,
}

/// Propagation-node announces tag their app data as
/// `msgpack((true, timebase))`; ordinary delivery announces carry a raw
/// display name instead and fail this parse.
pub fn parse_node_announce(app_data: &[u8]) -> Option<u64> {
    let (is_node, timebase): (bool, u64) = rmp_serde::from_slice(app_data).ok()?;
    is_node.then_some(timebase)
}

pub fn encode_node_announce(timebase: u64) -> Result<Vec<u8>, LxmfError> {
    rmp_serde::to_vec(&(true, timebase)).map_err(|e| LxmfError::Encode(e.to_string()))
}

/// Request sent to a propagation node over an established link:
/// `msgpack((tag, max_messages))`.
const SYNC_REQUEST_TAG: u8 = 0x01;

pub fn encode_sync_request(limit: u32) -> Result<Vec<u8>, LxmfError> {
    rmp_serde::to_vec(&(SYNC_REQUEST_TAG, limit)).map_err(|e| LxmfError::Encode(e.to_string()))
}

pub fn parse_sync_request(payload: &[u8]) -> Option<u32> {
    let (tag, limit): (u8, u32) = rmp_serde::from_slice(payload).ok()?;
    (tag == SYNC_REQUEST_TAG).then_some(limit)
}

/// The node's response resource: `msgpack([transient, ...])` where each
/// transient is `destination(16) || encrypted_delivery_payload`.
pub fn encode_sync_response(transients: &[Vec<u8>]) -> Result<Vec<u8>, LxmfError> {
    let list: Vec<ByteBuf> = transients.iter().map(|bytes| ByteBuf::from(bytes.clone())).collect();
    rmp_serde::to_vec(&list).map_err(|e| LxmfError::Encode(e.to_string()))
}

pub fn parse_sync_response(payload: &[u8]) -> Result<Vec<Vec<u8>>, LxmfError> {
    let list: Vec<ByteBuf> =
        rmp_serde::from_slice(payload).map_err(|e| LxmfError::Decode(e.to_string()))?;
    Ok(list.into_iter().map(ByteBuf::into_vec).collect())
}
