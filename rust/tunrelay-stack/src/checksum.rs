//! RFC 1071 internet checksum and the IPv4 pseudo-header variants used by
//! TCP and UDP.

use std::net::Ipv4Addr;

use crate::packet::{PROTO_TCP, PROTO_UDP};

/// Adds `data` to a running 32-bit ones' complement accumulator, treating a
/// trailing odd byte as the high half of a zero-padded word.
fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over `len` bytes of `data` starting at `start`.
///
/// A range extending past the buffer is clipped to the buffer end.
pub fn internet_checksum(data: &[u8], start: usize, len: usize) -> u16 {
    let start = start.min(data.len());
    let end = start.saturating_add(len).min(data.len());
    fold(accumulate(0, &data[start..end]))
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: usize) -> u32 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = sum.wrapping_add(u32::from(protocol));
    sum.wrapping_add(length as u32)
}

/// TCP checksum of `segment` (header with zeroed checksum field plus payload).
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, PROTO_TCP, segment.len());
    fold(accumulate(sum, segment))
}

/// UDP checksum of `datagram`. A computed value of zero is transmitted as
/// `0xFFFF`, since zero on the wire means "no checksum".
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, PROTO_UDP, datagram.len());
    match fold(accumulate(sum, datagram)) {
        0 => 0xFFFF,
        ck => ck,
    }
}
