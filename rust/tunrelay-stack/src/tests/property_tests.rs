//! Property-based tests for the wire codec and reply synthesis.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::BytesMut;
use proptest::prelude::*;

use crate::builder::PacketBuilder;
use crate::checksum::{internet_checksum, tcp_checksum, udp_checksum};
use crate::packet::{Ipv4Header, Packet, TcpFlags, TcpHeader, TcpTimestamp, UdpHeader, PROTO_TCP, PROTO_UDP};
use crate::publish::NullPublisher;
use crate::session::{seq_after, seq_before};

fn ipv4_header_strategy() -> impl Strategy<Value = Ipv4Header> {
    (
        (0u8..64, 0u8..4, any::<u16>(), any::<bool>(), any::<bool>(), 0u16..0x2000),
        (any::<u8>(), any::<u8>(), any::<u16>(), any::<[u8; 4]>(), any::<[u8; 4]>()),
        (0usize..=10).prop_flat_map(|words| prop::collection::vec(any::<u8>(), words * 4)),
        any::<u16>(),
    )
        .prop_map(|((dscp, ecn, id, df, mf, frag), (ttl, proto, ck, src, dst), options, extra)| {
            let mut header = Ipv4Header::new(Ipv4Addr::from(src), Ipv4Addr::from(dst), proto);
            header.dscp = dscp;
            header.ecn = ecn;
            header.identification = id;
            header.dont_fragment = df;
            header.more_fragments = mf;
            header.fragment_offset = frag;
            header.ttl = ttl;
            header.checksum = ck;
            header.options = options;
            header.total_length = (header.header_len() as u16).saturating_add(extra % 1400);
            header
        })
}

fn client_headers(sport: u16, dport: u16) -> (Ipv4Header, TcpHeader) {
    let mut ip = Ipv4Header::new(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(93, 184, 216, 34), PROTO_TCP);
    ip.total_length = 40;
    let tcp = TcpHeader {
        source_port: sport,
        destination_port: dport,
        flags: TcpFlags::ack_only(),
        ..Default::default()
    };
    (ip, tcp)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every IPv4 header survives encoding, options and all.
    #[test]
    fn ipv4_header_round_trips(header in ipv4_header_strategy()) {
        let encoded = header.encode();
        prop_assert_eq!(encoded.len(), header.header_len());
        let decoded = Ipv4Header::decode(&encoded, 0).unwrap();
        prop_assert_eq!(decoded, header);
    }

    /// Arbitrary bytes never panic the parser, and a parsed payload never
    /// runs past the IP total length.
    #[test]
    fn parse_is_total(raw in prop::collection::vec(any::<u8>(), 0..128)) {
        if let Ok(packet) = Packet::parse(&raw) {
            let header_bytes = packet.ip().header_len() + packet.transport().header_len();
            prop_assert!(packet.payload().len() + header_bytes <= usize::from(packet.ip().total_length).max(header_bytes));
        }
    }

    /// Sequence ordering is antisymmetric across the wrap point.
    #[test]
    fn sequence_order_wraps(a in any::<u32>(), delta in 1u32..0x8000_0000) {
        let b = a.wrapping_add(delta);
        prop_assert!(seq_after(b, a));
        prop_assert!(seq_before(a, b));
        prop_assert!(!seq_after(a, b));
        prop_assert!(!seq_before(a, a) && !seq_after(a, a));
    }

    /// Data segments built for the client carry valid IP and TCP checksums.
    #[test]
    fn data_segments_verify(
        payload in prop::collection::vec(any::<u8>(), 0..1500),
        seq in any::<u32>(),
        ack in any::<u32>(),
        sport in 1u16..=u16::MAX,
        dport in 1u16..=u16::MAX,
        timestamp in proptest::option::of((any::<u32>(), any::<u32>())),
        push in any::<bool>(),
    ) {
        let builder = PacketBuilder::new(Arc::new(NullPublisher), 65535);
        let (ip, tcp) = client_headers(sport, dport);
        let ts = timestamp.map(|(sender, reply_to)| TcpTimestamp { sender, reply_to });
        let packet = builder.data(&ip, &tcp, seq, ack, &payload, push, ts);

        let raw = packet.buffer();
        let ip_len = packet.ip().header_len();
        prop_assert_eq!(internet_checksum(raw, 0, ip_len), 0);
        prop_assert_eq!(tcp_checksum(packet.ip().source, packet.ip().destination, &raw[ip_len..]), 0);

        let reparsed = Packet::parse(raw).unwrap();
        let reply = reparsed.tcp().unwrap();
        prop_assert_eq!(reply.sequence_number, seq);
        prop_assert_eq!(reply.ack_number, ack);
        prop_assert_eq!(reply.flags.psh, push);
        prop_assert_eq!(reply.source_port, dport);
        prop_assert_eq!(reply.options.timestamp, ts);
        prop_assert_eq!(reparsed.payload(), &payload[..]);
    }

    /// UDP replies verify and keep the datagram intact.
    #[test]
    fn udp_replies_verify(payload in prop::collection::vec(any::<u8>(), 0..1400), sport in 1u16..=u16::MAX, dport in 1u16..=u16::MAX) {
        let builder = PacketBuilder::new(Arc::new(NullPublisher), 65535);
        let mut ip = Ipv4Header::new(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(8, 8, 8, 8), PROTO_UDP);
        ip.total_length = 28;
        let udp = UdpHeader { source_port: sport, destination_port: dport, length: 8, checksum: 0 };
        let packet = builder.udp_reply(&ip, &udp, &payload);

        let raw = packet.buffer();
        prop_assert_eq!(internet_checksum(raw, 0, 20), 0);
        let mut datagram = BytesMut::from(&raw[20..]);
        let carried = u16::from_be_bytes([datagram[6], datagram[7]]);
        datagram[6] = 0;
        datagram[7] = 0;
        prop_assert_eq!(udp_checksum(packet.ip().source, packet.ip().destination, &datagram), carried);
        prop_assert_eq!(packet.payload(), &payload[..]);
        prop_assert_eq!(packet.udp().unwrap().destination_port, sport);
    }
}
