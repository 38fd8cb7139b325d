//! UDP header codec.

use bytes::BufMut;

use crate::error::HeaderError;

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    /// Header plus payload, in bytes.
    pub length: u16,
    /// Zero means the sender did not compute one.
    pub checksum: u16,
}

impl UdpHeader {
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, HeaderError> {
        let data = buf.get(offset..).unwrap_or_default();
        if data.len() < UDP_HEADER_LEN {
            return Err(HeaderError::TooShort {
                layer: "UDP",
                expected: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u16(self.length);
        buf.put_u16(self.checksum);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UDP_HEADER_LEN);
        self.encode_into(&mut out);
        out
    }

    /// Payload length implied by the length field.
    pub fn payload_len(&self) -> usize {
        usize::from(self.length).saturating_sub(UDP_HEADER_LEN)
    }

    pub fn reversed(&self) -> Self {
        Self {
            source_port: self.destination_port,
            destination_port: self.source_port,
            length: 0,
            checksum: 0,
        }
    }
}
