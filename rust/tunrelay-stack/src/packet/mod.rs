//! Wire formats: IPv4, TCP and UDP headers and the immutable [`Packet`]
//! bundle that carries them with the raw bytes.

pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use ipv4::{Ipv4Header, IPV4_MIN_HEADER_LEN};
pub use tcp::{TcpFlags, TcpHeader, TcpOptions, TcpTimestamp, TCP_MIN_HEADER_LEN};
pub use udp::{UdpHeader, UDP_HEADER_LEN};

use bytes::Bytes;

use crate::error::HeaderError;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Transport layer header of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl TransportHeader {
    /// Decode the transport header for `protocol` at `offset`, returning it
    /// with its length on the wire.
    pub fn decode(protocol: u8, buf: &[u8], offset: usize) -> Result<(Self, usize), HeaderError> {
        match protocol {
            PROTO_TCP => {
                let tcp = TcpHeader::decode(buf, offset)?;
                let wire_len = usize::from(buf[offset + 12] >> 4) * 4;
                Ok((TransportHeader::Tcp(tcp), wire_len))
            }
            PROTO_UDP => Ok((TransportHeader::Udp(UdpHeader::decode(buf, offset)?), UDP_HEADER_LEN)),
            other => Err(HeaderError::UnsupportedProtocol(other)),
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            TransportHeader::Tcp(_) => PROTO_TCP,
            TransportHeader::Udp(_) => PROTO_UDP,
        }
    }

    pub fn source_port(&self) -> u16 {
        match self {
            TransportHeader::Tcp(h) => h.source_port,
            TransportHeader::Udp(h) => h.source_port,
        }
    }

    pub fn destination_port(&self) -> u16 {
        match self {
            TransportHeader::Tcp(h) => h.destination_port,
            TransportHeader::Udp(h) => h.destination_port,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            TransportHeader::Tcp(h) => h.header_len(),
            TransportHeader::Udp(_) => UDP_HEADER_LEN,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpHeader> {
        match self {
            TransportHeader::Tcp(h) => Some(h),
            TransportHeader::Udp(_) => None,
        }
    }

    pub fn as_udp(&self) -> Option<&UdpHeader> {
        match self {
            TransportHeader::Udp(h) => Some(h),
            TransportHeader::Tcp(_) => None,
        }
    }
}

/// A decoded packet together with its wire bytes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Packet {
    ip: Ipv4Header,
    transport: TransportHeader,
    buffer: Bytes,
    payload_offset: usize,
    payload_end: usize,
}

impl Packet {
    /// Bundle headers with a buffer laid out exactly as they encode.
    pub fn new(ip: Ipv4Header, transport: TransportHeader, buffer: Bytes) -> Self {
        let payload_offset = (ip.header_len() + transport.header_len()).min(buffer.len());
        let payload_end = buffer.len();
        Self { ip, transport, buffer, payload_offset, payload_end }
    }

    /// Decode a raw IPv4 packet. The payload is bounded by the IP total
    /// length, never by trailing bytes in the buffer.
    pub fn parse(raw: &[u8]) -> Result<Self, HeaderError> {
        Self::from_ip(Ipv4Header::decode(raw, 0)?, raw)
    }

    /// Finish decoding `raw` whose IP header has already been decoded.
    pub fn from_ip(ip: Ipv4Header, raw: &[u8]) -> Result<Self, HeaderError> {
        let ip_len = ip.header_len();
        let (transport, transport_len) = TransportHeader::decode(ip.protocol, raw, ip_len)?;
        let payload_end = usize::from(ip.total_length).min(raw.len());
        let payload_offset = (ip_len + transport_len).min(payload_end);
        Ok(Self {
            ip,
            transport,
            buffer: Bytes::copy_from_slice(raw),
            payload_offset,
            payload_end,
        })
    }

    pub fn ip(&self) -> &Ipv4Header {
        &self.ip
    }

    pub fn transport(&self) -> &TransportHeader {
        &self.transport
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        self.transport.as_tcp()
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        self.transport.as_udp()
    }

    /// Full wire bytes.
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_offset..self.payload_end]
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(payload: &[u8], trailing: usize) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut raw = vec![
            0x45, 0x00, (total >> 8) as u8, total as u8, 0, 1, 0, 0, 64, 17, 0, 0, 10, 0, 0, 2, 8,
            8, 8, 8,
        ];
        let udp_len = 8 + payload.len();
        raw.extend_from_slice(&[0x9c, 0x40, 0x00, 0x35, (udp_len >> 8) as u8, udp_len as u8, 0, 0]);
        raw.extend_from_slice(payload);
        raw.extend(std::iter::repeat(0xEE).take(trailing));
        raw
    }

    #[test]
    fn parse_udp_payload() {
        let raw = udp_packet(b"hello", 0);
        let packet = Packet::parse(&raw).unwrap();
        assert_eq!(packet.ip().protocol, PROTO_UDP);
        assert_eq!(packet.transport().destination_port(), 53);
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(packet.len(), raw.len());
    }

    #[test]
    fn trailing_bytes_are_not_payload() {
        let raw = udp_packet(b"abc", 6);
        let packet = Packet::parse(&raw).unwrap();
        assert_eq!(packet.payload(), b"abc");
    }

    #[test]
    fn unknown_protocol_is_rejected_after_ip_decode() {
        let mut raw = udp_packet(b"", 0);
        raw[9] = 47;
        assert!(Ipv4Header::decode(&raw, 0).is_ok());
        assert_eq!(Packet::parse(&raw).unwrap_err(), HeaderError::UnsupportedProtocol(47));
    }
}
