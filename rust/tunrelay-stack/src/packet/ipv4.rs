//! IPv4 header codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |  DSCP     |ECN|          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options                    |    Padding    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::net::Ipv4Addr;

use bytes::BufMut;

use crate::error::HeaderError;

pub const IPV4_MIN_HEADER_LEN: usize = 20;

const FLAG_DONT_FRAGMENT: u8 = 0x40;
const FLAG_MORE_FRAGMENTS: u8 = 0x20;

/// Decoded IPv4 header. Options are kept verbatim; the IHL field is derived
/// from their length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    /// Flag bit 0x40 ("may fragment" is cleared when set).
    pub dont_fragment: bool,
    /// Flag bit 0x20 (cleared on the last fragment).
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Minimal header for a packet travelling `source` -> `destination`.
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8) -> Self {
        Self {
            dscp: 0,
            ecn: 0,
            total_length: IPV4_MIN_HEADER_LEN as u16,
            identification: 0,
            dont_fragment: true,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            source,
            destination,
            options: Vec::new(),
        }
    }

    /// Decode the header at `offset`.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, HeaderError> {
        let data = buf.get(offset..).unwrap_or_default();
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(HeaderError::TooShort {
                layer: "IPv4",
                expected: IPV4_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(HeaderError::InvalidIpVersion(version));
        }

        let ihl = data[0] & 0x0F;
        if ihl < 5 {
            return Err(HeaderError::InvalidHeaderLength(ihl));
        }
        let header_len = usize::from(ihl) * 4;
        if data.len() < header_len {
            return Err(HeaderError::TooShort {
                layer: "IPv4",
                expected: header_len,
                actual: data.len(),
            });
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if usize::from(total_length) < header_len {
            return Err(HeaderError::InvalidTotalLength {
                total: total_length,
                header: header_len,
            });
        }

        let flags = data[6];
        Ok(Self {
            dscp: data[1] >> 2,
            ecn: data[1] & 0x03,
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            dont_fragment: flags & FLAG_DONT_FRAGMENT != 0,
            more_fragments: flags & FLAG_MORE_FRAGMENTS != 0,
            fragment_offset: u16::from_be_bytes([data[6] & 0x1F, data[7]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            options: data[IPV4_MIN_HEADER_LEN..header_len].to_vec(),
        })
    }

    /// Header length in bytes, options included and padded to a word.
    pub fn header_len(&self) -> usize {
        IPV4_MIN_HEADER_LEN + self.options.len().div_ceil(4) * 4
    }

    /// Internet header length in 32-bit words.
    pub fn ihl(&self) -> u8 {
        (self.header_len() / 4) as u8
    }

    /// Payload length implied by the total length field.
    pub fn payload_len(&self) -> usize {
        usize::from(self.total_length).saturating_sub(self.header_len())
    }

    /// Write the header, checksum field included as stored.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        let mut flags = (self.fragment_offset >> 8) as u8 & 0x1F;
        if self.dont_fragment {
            flags |= FLAG_DONT_FRAGMENT;
        }
        if self.more_fragments {
            flags |= FLAG_MORE_FRAGMENTS;
        }

        buf.put_u8(0x40 | self.ihl());
        buf.put_u8((self.dscp << 2) | (self.ecn & 0x03));
        buf.put_u16(self.total_length);
        buf.put_u16(self.identification);
        buf.put_u8(flags);
        buf.put_u8(self.fragment_offset as u8);
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u16(self.checksum);
        buf.put_slice(&self.source.octets());
        buf.put_slice(&self.destination.octets());
        buf.put_slice(&self.options);
        for _ in self.options.len()..self.header_len() - IPV4_MIN_HEADER_LEN {
            buf.put_u8(0);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        self.encode_into(&mut out);
        out
    }

    /// Copy of this header for a reply: addresses swapped, options dropped.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            options: Vec::new(),
            checksum: 0,
            ..self.clone()
        }
    }
}
