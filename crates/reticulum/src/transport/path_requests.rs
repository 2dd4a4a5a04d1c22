use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand_core::OsRng;

use crate::destination::{DestinationName, PlainInputDestination};
use crate::hash::{AddressHash, ADDRESS_HASH_SIZE};
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext,
    PacketDataBuffer, PacketType, PropagationType,
};

/// Seconds an answered `(destination, tag)` pair suppresses duplicates.
const RESPONSE_CACHE_SECS: u64 = 30;

pub fn create_path_request_destination() -> PlainInputDestination {
    let name = DestinationName::new("rnstransport", &["path", "request"])
        .expect("static destination name");
    PlainInputDestination::new(name)
}

pub type TagBytes = Vec<u8>;

pub fn create_random_tag() -> TagBytes {
    AddressHash::new_from_rand(OsRng).as_slice().into()
}

/// Wire form: `destination(16) [requesting_transport(16)] tag(<=16)`.
pub struct PathRequest {
    pub destination: AddressHash,
    pub requesting_transport: Option<AddressHash>,
    pub tag_bytes: TagBytes,
}

impl PathRequest {
    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() <= ADDRESS_HASH_SIZE {
            return None;
        }

        let destination = AddressHash::try_from_slice(&data[..ADDRESS_HASH_SIZE]).ok()?;

        let mut requesting_transport = None;
        let mut tag_start = ADDRESS_HASH_SIZE;
        let mut tag_end = data.len();

        if data.len() > ADDRESS_HASH_SIZE * 2 {
            requesting_transport =
                AddressHash::try_from_slice(&data[ADDRESS_HASH_SIZE..2 * ADDRESS_HASH_SIZE]).ok();
            tag_start = ADDRESS_HASH_SIZE * 2;
        }

        if tag_end - tag_start > ADDRESS_HASH_SIZE {
            tag_end = tag_start + ADDRESS_HASH_SIZE;
        }

        let tag_bytes = data[tag_start..tag_end].into();

        Some(Self { destination, requesting_transport, tag_bytes })
    }
}

/// Generates outbound path requests and deduplicates inbound ones.
pub struct PathRequests {
    answered: HashMap<(AddressHash, TagBytes), Instant>,
    name: String,
    transport_id: Option<AddressHash>,
    controlled_destination: PlainInputDestination,
}

impl PathRequests {
    pub fn new(name: &str, transport_id: Option<AddressHash>) -> Self {
        Self {
            answered: HashMap::new(),
            name: name.into(),
            transport_id,
            controlled_destination: create_path_request_destination(),
        }
    }

    pub fn destination_hash(&self) -> AddressHash {
        self.controlled_destination.desc.address_hash
    }

    /// Decodes an inbound request, suppressing tags answered within the
    /// cache window.
    pub fn decode(&mut self, data: &[u8]) -> Option<PathRequest> {
        let request = PathRequest::decode(data)?;

        let now = Instant::now();
        self.answered
            .retain(|_, answered_at| now.duration_since(*answered_at).as_secs() < RESPONSE_CACHE_SECS);

        let key = (request.destination, request.tag_bytes.clone());
        if self.answered.contains_key(&key) {
            log::debug!(
                "tp({}): ignoring duplicate path request for {}",
                self.name,
                request.destination
            );
            return None;
        }
        self.answered.insert(key, now);

        Some(request)
    }

    pub fn generate(&mut self, destination: &AddressHash, tag: Option<TagBytes>) -> Packet {
        let mut data = PacketDataBuffer::new_from_slice(destination.as_slice());

        if let Some(transport_id) = self.transport_id {
            data.safe_write(transport_id.as_slice());
        }
        data.safe_write(tag.unwrap_or_else(create_random_tag).as_slice());

        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: ContextFlag::Unset,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Plain,
                packet_type: PacketType::Data,
                hops: 0,
            },
            destination: self.destination_hash(),
            transport: None,
            context: PacketContext::None,
            data,
        }
    }

    pub fn cache_window(&self) -> Duration {
        Duration::from_secs(RESPONSE_CACHE_SECS)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::PathRequests;
    use crate::hash::AddressHash;

    #[test]
    fn request_roundtrip() {
        let mut requests = PathRequests::new("test", None);
        let destination = AddressHash::new_from_rand(OsRng);

        let packet = requests.generate(&destination, None);
        let decoded = requests.decode(packet.data.as_slice()).expect("request");
        assert_eq!(decoded.destination, destination);
        assert!(decoded.requesting_transport.is_none());
    }

    #[test]
    fn transport_id_is_carried() {
        let transport_id = AddressHash::new_from_rand(OsRng);
        let mut requests = PathRequests::new("test", Some(transport_id));
        let destination = AddressHash::new_from_rand(OsRng);

        let packet = requests.generate(&destination, None);
        let decoded = requests.decode(packet.data.as_slice()).expect("request");
        assert_eq!(decoded.requesting_transport, Some(transport_id));
    }

    #[test]
    fn duplicate_tags_are_suppressed() {
        let mut requests = PathRequests::new("test", None);
        let destination = AddressHash::new_from_rand(OsRng);
        let tag = super::create_random_tag();

        let packet = requests.generate(&destination, Some(tag));
        assert!(requests.decode(packet.data.as_slice()).is_some());
        assert!(requests.decode(packet.data.as_slice()).is_none());
    }
}
