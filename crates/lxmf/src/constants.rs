//! Wire arithmetic and field identifiers shared across the crate.

pub const APP_NAME: &str = "lxmf";
pub const DELIVERY_ASPECT: &str = "delivery";
pub const PROPAGATION_ASPECT: &str = "propagation";

pub const DESTINATION_LENGTH: usize = 16;
pub const SIGNATURE_LENGTH: usize = 64;
pub const TIMESTAMP_SIZE: usize = 8;
pub const STRUCT_OVERHEAD: usize = 8;
pub const LXMF_OVERHEAD: usize =
    (2 * DESTINATION_LENGTH) + SIGNATURE_LENGTH + TIMESTAMP_SIZE + STRUCT_OVERHEAD;

pub const RETICULUM_MTU: usize = 500;
pub const RETICULUM_HEADER_MINSIZE: usize = 2 + 1 + DESTINATION_LENGTH;
pub const RETICULUM_HEADER_MAXSIZE: usize = 2 + 1 + (DESTINATION_LENGTH * 2);
pub const RETICULUM_IFAC_MIN_SIZE: usize = 1;
pub const RETICULUM_MDU: usize = RETICULUM_MTU - RETICULUM_HEADER_MAXSIZE - RETICULUM_IFAC_MIN_SIZE;
pub const RETICULUM_TOKEN_OVERHEAD: usize = 48;
pub const RETICULUM_AES_BLOCKSIZE: usize = 16;
pub const RETICULUM_EPHEMERAL_KEY: usize = 32;

/// Plaintext capacity of one opportunistic (identity-encrypted) packet.
pub const ENCRYPTED_MDU: usize = ((RETICULUM_MDU - RETICULUM_TOKEN_OVERHEAD - RETICULUM_EPHEMERAL_KEY)
    / RETICULUM_AES_BLOCKSIZE)
    * RETICULUM_AES_BLOCKSIZE
    - 1;

/// Plaintext capacity of one in-link packet.
pub const LINK_PACKET_MDU: usize = ((RETICULUM_MTU
    - RETICULUM_IFAC_MIN_SIZE
    - RETICULUM_HEADER_MINSIZE
    - RETICULUM_TOKEN_OVERHEAD)
    / RETICULUM_AES_BLOCKSIZE)
    * RETICULUM_AES_BLOCKSIZE
    - 1;

pub const ENCRYPTED_PACKET_MAX_CONTENT: usize =
    ENCRYPTED_MDU + TIMESTAMP_SIZE - LXMF_OVERHEAD + DESTINATION_LENGTH;
pub const LINK_PACKET_MAX_CONTENT: usize = LINK_PACKET_MDU - LXMF_OVERHEAD;

pub const FIELD_EMBEDDED_LXMS: u8 = 0x01;
pub const FIELD_TELEMETRY: u8 = 0x02;
pub const FIELD_TELEMETRY_STREAM: u8 = 0x03;
pub const FIELD_ICON_APPEARANCE: u8 = 0x04;
pub const FIELD_FILE_ATTACHMENTS: u8 = 0x05;
pub const FIELD_IMAGE: u8 = 0x06;
pub const FIELD_AUDIO: u8 = 0x07;
pub const FIELD_THREAD: u8 = 0x08;
pub const FIELD_COMMANDS: u8 = 0x09;
pub const FIELD_RESULTS: u8 = 0x0A;
pub const FIELD_GROUP: u8 = 0x0B;
pub const FIELD_TICKET: u8 = 0x0C;
pub const FIELD_EVENT: u8 = 0x0D;
pub const FIELD_RNR_REFS: u8 = 0x0E;
pub const FIELD_RENDERER: u8 = 0x0F;
pub const FIELD_CUSTOM_TYPE: u8 = 0xFB;
pub const FIELD_CUSTOM_DATA: u8 = 0xFC;
pub const FIELD_CUSTOM_META: u8 = 0xFD;
pub const FIELD_NON_SPECIFIC: u8 = 0xFE;
pub const FIELD_DEBUG: u8 = 0xFF;

pub const PN_META_VERSION: u8 = 0x00;
pub const PN_META_NAME: u8 = 0x01;
pub const PN_META_SYNC_STRATUM: u8 = 0x02;
pub const PN_META_SYNC_THROTTLE: u8 = 0x03;

/// Delivery retry policy.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const DELIVERY_RETRY_BASE_SECS: u64 = 2;
pub const DELIVERY_RETRY_JITTER_MS: u64 = 500;

#[cfg(test)]
mod tests {
    use super::{ENCRYPTED_MDU, LINK_PACKET_MAX_CONTENT, LINK_PACKET_MDU};

    #[test]
    fn mdu_arithmetic_matches_packet_layer() {
        assert_eq!(ENCRYPTED_MDU, 383);
        assert_eq!(LINK_PACKET_MDU, reticulum::packet::LINK_MDU);
        assert_eq!(LINK_PACKET_MAX_CONTENT, 319);
    }
}
