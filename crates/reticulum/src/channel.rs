use std::collections::BTreeMap;
use std::io::Read;

use crate::error::RnsError;

/// Initial number of unacknowledged envelopes in flight.
pub const WINDOW: usize = 2;
pub const WINDOW_MAX: usize = 48;

/// Message types at or above this value are reserved for the protocol.
pub const SYSTEM_MESSAGE_MIN: u16 = 0xF000;

pub const STREAM_DATA_MSGTYPE: u16 = 0xFF00;

const ENVELOPE_OVERHEAD: usize = 4;

/// How far ahead of the expected sequence an envelope may arrive before it
/// is discarded instead of buffered.
const RX_LOOKAHEAD: u16 = (WINDOW_MAX as u16) * 2;

/// One sequenced message on a channel:
/// `msg_type(2, BE) || sequence(2, BE) || payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + self.payload.len());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < ENVELOPE_OVERHEAD {
            return Err(RnsError::InvalidPacket);
        }
        Ok(Self {
            msg_type: u16::from_be_bytes([raw[0], raw[1]]),
            sequence: u16::from_be_bytes([raw[2], raw[3]]),
            payload: raw[ENVELOPE_OVERHEAD..].to_vec(),
        })
    }

    pub fn is_system(&self) -> bool {
        self.msg_type >= SYSTEM_MESSAGE_MIN
    }
}

/// Sequenced, reliable message stream multiplexed on one link.
///
/// Outbound envelopes are window-limited until acknowledged (the link's
/// packet proofs drive `ack`). Inbound envelopes are delivered strictly in
/// sequence order, with duplicates suppressed and out-of-order arrivals
/// buffered up to a bounded lookahead.
pub struct Channel {
    mdu: usize,
    window: usize,
    next_sequence: u16,
    unacked: BTreeMap<u16, Envelope>,
    next_rx_sequence: u16,
    rx_pending: BTreeMap<u16, Envelope>,
}

impl Channel {
    pub fn new(mdu: usize) -> Self {
        Self {
            mdu,
            window: WINDOW,
            next_sequence: 0,
            unacked: BTreeMap::new(),
            next_rx_sequence: 0,
            rx_pending: BTreeMap::new(),
        }
    }

    pub fn set_window(&mut self, window: usize) {
        self.window = window.clamp(1, WINDOW_MAX);
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_ready_to_send(&self) -> bool {
        self.unacked.len() < self.window
    }

    /// Sequences a message. Returns the assigned sequence number and the
    /// packed envelope ready to send over the link.
    pub fn send(&mut self, msg_type: u16, payload: Vec<u8>) -> Result<(u16, Vec<u8>), RnsError> {
        if payload.len() + ENVELOPE_OVERHEAD > self.mdu {
            return Err(RnsError::MtuExceeded);
        }
        if !self.is_ready_to_send() {
            return Err(RnsError::OutOfMemory);
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let envelope = Envelope { msg_type, sequence, payload };
        let raw = envelope.pack();
        self.unacked.insert(sequence, envelope);
        Ok((sequence, raw))
    }

    /// Packed form of an unacknowledged envelope, for retransmission.
    pub fn repack(&self, sequence: u16) -> Option<Vec<u8>> {
        self.unacked.get(&sequence).map(Envelope::pack)
    }

    pub fn ack(&mut self, sequence: u16) {
        self.unacked.remove(&sequence);
    }

    /// Ingests one raw envelope and returns every envelope now deliverable
    /// in order. Duplicates and stale arrivals return an empty batch.
    pub fn receive(&mut self, raw: &[u8]) -> Result<Vec<Envelope>, RnsError> {
        let envelope = Envelope::unpack(raw)?;

        let ahead = envelope.sequence.wrapping_sub(self.next_rx_sequence);
        if ahead >= RX_LOOKAHEAD {
            // Behind the window or absurdly far ahead: a duplicate or noise.
            return Ok(Vec::new());
        }

        self.rx_pending.entry(envelope.sequence).or_insert(envelope);

        let mut deliverable = Vec::new();
        while let Some(envelope) = self.rx_pending.remove(&self.next_rx_sequence) {
            self.next_rx_sequence = self.next_rx_sequence.wrapping_add(1);
            deliverable.push(envelope);
        }
        Ok(deliverable)
    }

    pub fn mdu(&self) -> usize {
        self.mdu
    }
}

const STREAM_FLAG_EOF: u8 = 0x01;
const STREAM_FLAG_COMPRESSED: u8 = 0x02;
const STREAM_OVERHEAD: usize = 3;

/// One chunk of a byte stream carried over a channel:
/// `stream_id(2, BE) || flags(1) || data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDataMessage {
    pub stream_id: u16,
    pub eof: bool,
    pub compressed: bool,
    pub data: Vec<u8>,
}

impl StreamDataMessage {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STREAM_OVERHEAD + self.data.len());
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        let mut flags = 0u8;
        if self.eof {
            flags |= STREAM_FLAG_EOF;
        }
        if self.compressed {
            flags |= STREAM_FLAG_COMPRESSED;
        }
        out.push(flags);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < STREAM_OVERHEAD {
            return Err(RnsError::InvalidPacket);
        }
        Ok(Self {
            stream_id: u16::from_be_bytes([raw[0], raw[1]]),
            eof: raw[2] & STREAM_FLAG_EOF != 0,
            compressed: raw[2] & STREAM_FLAG_COMPRESSED != 0,
            data: raw[STREAM_OVERHEAD..].to_vec(),
        })
    }
}

/// Splits outbound bytes into stream messages sized for the channel,
/// compressing chunks when that actually shrinks them.
pub struct BufferWriter {
    stream_id: u16,
    chunk_size: usize,
}

impl BufferWriter {
    pub fn new(stream_id: u16, channel: &Channel) -> Self {
        let chunk_size = channel.mdu().saturating_sub(ENVELOPE_OVERHEAD + STREAM_OVERHEAD).max(1);
        Self { stream_id, chunk_size }
    }

    pub fn chunk(&self, data: &[u8], eof: bool) -> Vec<StreamDataMessage> {
        let mut messages = Vec::new();

        if data.is_empty() {
            if eof {
                messages.push(StreamDataMessage {
                    stream_id: self.stream_id,
                    eof: true,
                    compressed: false,
                    data: Vec::new(),
                });
            }
            return messages;
        }

        let chunks: Vec<&[u8]> = data.chunks(self.chunk_size).collect();
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let compressed = compress_chunk(chunk);
            let (data, is_compressed) = match compressed {
                Some(compressed) if compressed.len() < chunk.len() => (compressed, true),
                _ => (chunk.to_vec(), false),
            };
            messages.push(StreamDataMessage {
                stream_id: self.stream_id,
                eof: eof && index == last,
                compressed: is_compressed,
                data,
            });
        }

        messages
    }
}

/// Reassembles an ordered byte stream from channel-delivered messages.
/// Ordering is the channel's concern; the reader only concatenates.
pub struct BufferReader {
    stream_id: u16,
    buffer: Vec<u8>,
    eof: bool,
}

impl BufferReader {
    pub fn new(stream_id: u16) -> Self {
        Self { stream_id, buffer: Vec::new(), eof: false }
    }

    /// Accepts one stream message. Messages for other streams are ignored
    /// and reported as such.
    pub fn handle(&mut self, message: &StreamDataMessage) -> Result<bool, RnsError> {
        if message.stream_id != self.stream_id {
            return Ok(false);
        }
        if self.eof {
            return Ok(false);
        }

        if message.compressed {
            let mut decoder = bzip2::read::BzDecoder::new(message.data.as_slice());
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|_| RnsError::InvalidPacket)?;
            self.buffer.extend_from_slice(&decompressed);
        } else {
            self.buffer.extend_from_slice(&message.data);
        }

        if message.eof {
            self.eof = true;
        }
        Ok(true)
    }

    pub fn read(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }
}

fn compress_chunk(chunk: &[u8]) -> Option<Vec<u8>> {
    let mut encoder =
        bzip2::read::BzEncoder::new(chunk, bzip2::Compression::best());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::{
        BufferReader, BufferWriter, Channel, Envelope, StreamDataMessage, STREAM_DATA_MSGTYPE,
        SYSTEM_MESSAGE_MIN, WINDOW,
    };

    #[test]
    fn envelope_roundtrip() {
        let envelope =
            Envelope { msg_type: 0x0101, sequence: 0xBEEF, payload: b"payload".to_vec() };
        let decoded = Envelope::unpack(&envelope.pack()).expect("envelope");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn system_type_partition() {
        let user = Envelope { msg_type: SYSTEM_MESSAGE_MIN - 1, sequence: 0, payload: vec![] };
        let system = Envelope { msg_type: STREAM_DATA_MSGTYPE, sequence: 0, payload: vec![] };
        assert!(!user.is_system());
        assert!(system.is_system());
    }

    #[test]
    fn window_limits_outstanding_envelopes() {
        let mut channel = Channel::new(400);

        for _ in 0..WINDOW {
            channel.send(0x01, b"msg".to_vec()).expect("send");
        }
        assert!(channel.send(0x01, b"blocked".to_vec()).is_err());

        channel.ack(0);
        assert!(channel.send(0x01, b"unblocked".to_vec()).is_ok());
    }

    #[test]
    fn out_of_order_arrivals_deliver_in_sequence() {
        let mut sender = Channel::new(400);
        let mut receiver = Channel::new(400);
        sender.set_window(8);

        let mut packed = Vec::new();
        for index in 0..4u8 {
            let (_, raw) = sender.send(0x01, vec![index]).expect("send");
            packed.push(raw);
        }

        // Deliver 2, 0, 1, 3.
        assert!(receiver.receive(&packed[2]).expect("receive").is_empty());
        let first = receiver.receive(&packed[0]).expect("receive");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, vec![0]);

        let rest = receiver.receive(&packed[1]).expect("receive");
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].payload, vec![1]);
        assert_eq!(rest[1].payload, vec![2]);

        let last = receiver.receive(&packed[3]).expect("receive");
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].payload, vec![3]);
    }

    #[test]
    fn duplicates_are_suppressed() {
        let mut sender = Channel::new(400);
        let mut receiver = Channel::new(400);

        let (_, raw) = sender.send(0x01, b"once".to_vec()).expect("send");
        assert_eq!(receiver.receive(&raw).expect("receive").len(), 1);
        assert!(receiver.receive(&raw).expect("receive").is_empty());
    }

    #[test]
    fn stream_message_roundtrip() {
        let message = StreamDataMessage {
            stream_id: 7,
            eof: true,
            compressed: false,
            data: b"stream chunk".to_vec(),
        };
        let decoded = StreamDataMessage::unpack(&message.pack()).expect("message");
        assert_eq!(decoded, message);
    }

    #[test]
    fn buffer_stream_reassembles_across_chunks() {
        let mut sender = Channel::new(400);
        let mut receiver = Channel::new(400);
        sender.set_window(super::WINDOW_MAX);

        let writer = BufferWriter::new(1, &sender);
        let mut reader = BufferReader::new(1);

        let payload: Vec<u8> = (0..2000usize).map(|i| (i % 256) as u8).collect();
        for message in writer.chunk(&payload, true) {
            let (sequence, raw) = sender.send(STREAM_DATA_MSGTYPE, message.pack()).expect("send");
            for envelope in receiver.receive(&raw).expect("receive") {
                let message = StreamDataMessage::unpack(&envelope.payload).expect("stream");
                reader.handle(&message).expect("handle");
            }
            sender.ack(sequence);
        }

        assert!(reader.at_eof());
        assert_eq!(reader.read(), payload);
    }
}
