use crate::buffer::OutputBuffer;
use crate::error::RnsError;

const HDLC_FRAME_FLAG: u8 = 0x7e;
const HDLC_ESCAPE_BYTE: u8 = 0x7d;
const HDLC_ESCAPE_MASK: u8 = 0b0010_0000;

/// Byte-stuffed framing for stream interfaces (TCP, serial).
pub struct Hdlc {}

impl Hdlc {
    pub fn encode(data: &[u8], buffer: &mut OutputBuffer) -> Result<usize, RnsError> {
        buffer.write_byte(HDLC_FRAME_FLAG)?;

        for &byte in data {
            match byte {
                HDLC_FRAME_FLAG | HDLC_ESCAPE_BYTE => {
                    buffer.write(&[HDLC_ESCAPE_BYTE, byte ^ HDLC_ESCAPE_MASK])?;
                }
                _ => {
                    buffer.write_byte(byte)?;
                }
            }
        }

        buffer.write_byte(HDLC_FRAME_FLAG)?;

        Ok(buffer.offset())
    }

    /// Returns the start and end index of the first complete frame.
    pub fn find(data: &[u8]) -> Option<(usize, usize)> {
        let mut start_index = None;

        for (i, &byte) in data.iter().enumerate() {
            if byte != HDLC_FRAME_FLAG {
                continue;
            }

            match start_index {
                None => start_index = Some(i),
                // Adjacent flags delimit an empty frame; keep scanning from
                // the second flag.
                Some(start) if i == start + 1 => start_index = Some(i),
                Some(start) => return Some((start, i)),
            }
        }

        None
    }

    pub fn decode(data: &[u8], output: &mut OutputBuffer) -> Result<usize, RnsError> {
        let mut started = false;
        let mut finished = false;
        let mut escape = false;

        for &byte in data {
            if escape {
                escape = false;
                output.write_byte(byte ^ HDLC_ESCAPE_MASK)?;
                continue;
            }

            match byte {
                HDLC_FRAME_FLAG => {
                    if started {
                        finished = true;
                        break;
                    }
                    started = true;
                }
                HDLC_ESCAPE_BYTE => {
                    escape = true;
                }
                _ => {
                    output.write_byte(byte)?;
                }
            }
        }

        if !finished {
            return Err(RnsError::InvalidPacket);
        }

        Ok(output.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::Hdlc;
    use crate::buffer::OutputBuffer;

    #[test]
    fn frame_roundtrip_with_escapes() {
        let payload = [0x01, 0x7e, 0x02, 0x7d, 0x03];

        let mut encoded_backing = [0u8; 32];
        let mut encoded = OutputBuffer::new(&mut encoded_backing);
        Hdlc::encode(&payload, &mut encoded).expect("encode");

        let (start, end) = Hdlc::find(encoded.as_slice()).expect("frame");
        let mut decoded_backing = [0u8; 32];
        let mut decoded = OutputBuffer::new(&mut decoded_backing);
        Hdlc::decode(&encoded.as_slice()[start..=end], &mut decoded).expect("decode");

        assert_eq!(decoded.as_slice(), &payload);
    }

    #[test]
    fn unterminated_frame_is_rejected() {
        let mut backing = [0u8; 8];
        let mut output = OutputBuffer::new(&mut backing);
        assert!(Hdlc::decode(&[0x7e, 0x01, 0x02], &mut output).is_err());
    }
}
