//! Reply synthesis.
//!
//! Every packet the relay writes into the tunnel is assembled here: headers
//! are derived from the client's last header (addresses and ports swapped),
//! both checksums are computed over the final buffer, and the result is
//! published before being handed back.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::checksum::{internet_checksum, tcp_checksum, udp_checksum};
use crate::packet::{
    Ipv4Header, Packet, TcpFlags, TcpHeader, TcpOptions, TcpTimestamp, TransportHeader, UdpHeader, PROTO_TCP,
    PROTO_UDP, UDP_HEADER_LEN,
};
use crate::publish::PacketPublisher;

/// Source of the IP identification field for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpId {
    /// Take the next value of the shared counter.
    Next,
    /// Segments prepared from scratch (RST, remote FIN) carry zero.
    Zero,
}

/// Everything that varies between TCP replies.
#[derive(Debug, Clone)]
pub struct TcpReply<'a> {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub options: TcpOptions,
    pub payload: &'a [u8],
    pub ip_id: IpId,
}

/// Current wall clock in milliseconds, truncated to the 32-bit TSval space.
pub fn timestamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Random non-negative initial sequence number.
pub fn initial_sequence() -> u32 {
    rand::random::<u32>() >> 1
}

/// Builds and publishes packets destined for the tunnel.
pub struct PacketBuilder {
    ip_id: AtomicU16,
    publisher: Arc<dyn PacketPublisher>,
    recv_window: u16,
}

impl PacketBuilder {
    pub fn new(publisher: Arc<dyn PacketPublisher>, recv_window: u16) -> Self {
        Self {
            ip_id: AtomicU16::new(1),
            publisher,
            recv_window,
        }
    }

    pub fn recv_window(&self) -> u16 {
        self.recv_window
    }

    /// Next IP identification. Wraps at 65535.
    pub fn next_ip_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a TCP segment answering `client_ip`/`client_tcp`.
    pub fn tcp_reply(&self, client_ip: &Ipv4Header, client_tcp: &TcpHeader, reply: TcpReply<'_>) -> Packet {
        let mut ip = client_ip.reversed();
        ip.identification = match reply.ip_id {
            IpId::Next => self.next_ip_id(),
            IpId::Zero => 0,
        };
        let mut tcp = client_tcp.reversed();
        tcp.sequence_number = reply.seq;
        tcp.ack_number = reply.ack;
        tcp.flags = reply.flags;
        tcp.window_size = reply.window;
        tcp.options = reply.options;
        self.assemble_tcp(ip, tcp, reply.payload)
    }

    /// SYN-ACK for a client SYN. Echoes window scaling (with our shift of
    /// zero) and timestamps when the client offered them.
    pub fn syn_ack(&self, client_ip: &Ipv4Header, syn: &TcpHeader, isn: u32, mss: u16) -> Packet {
        let options = TcpOptions {
            mss: Some(mss),
            window_scale: syn.options.window_scale.map(|_| 0),
            sack_permitted: false,
            timestamp: syn.options.timestamp.map(|ts| TcpTimestamp {
                sender: timestamp_now(),
                reply_to: ts.sender,
            }),
        };
        self.tcp_reply(
            client_ip,
            syn,
            TcpReply {
                seq: isn,
                ack: syn.sequence_number.wrapping_add(1),
                flags: TcpFlags::syn_ack(),
                window: self.recv_window,
                options,
                payload: &[],
                ip_id: IpId::Next,
            },
        )
    }

    /// Pure acknowledgement.
    pub fn ack(
        &self,
        client_ip: &Ipv4Header,
        client_tcp: &TcpHeader,
        seq: u32,
        ack: u32,
        timestamp: Option<TcpTimestamp>,
    ) -> Packet {
        self.control(client_ip, client_tcp, seq, ack, TcpFlags::ack_only(), timestamp)
    }

    /// FIN|ACK acknowledging a client FIN or closing our side.
    pub fn fin_ack(
        &self,
        client_ip: &Ipv4Header,
        client_tcp: &TcpHeader,
        seq: u32,
        ack: u32,
        timestamp: Option<TcpTimestamp>,
    ) -> Packet {
        self.control(client_ip, client_tcp, seq, ack, TcpFlags::fin_ack(), timestamp)
    }

    /// FIN|ACK signalling end of stream from the remote side.
    pub fn remote_fin(&self, client_ip: &Ipv4Header, client_tcp: &TcpHeader, seq: u32, ack: u32) -> Packet {
        self.tcp_reply(
            client_ip,
            client_tcp,
            TcpReply {
                seq,
                ack,
                flags: TcpFlags::fin_ack(),
                window: self.recv_window,
                options: TcpOptions::default(),
                payload: &[],
                ip_id: IpId::Zero,
            },
        )
    }

    fn control(
        &self,
        client_ip: &Ipv4Header,
        client_tcp: &TcpHeader,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        timestamp: Option<TcpTimestamp>,
    ) -> Packet {
        self.tcp_reply(
            client_ip,
            client_tcp,
            TcpReply {
                seq,
                ack,
                flags,
                window: self.recv_window,
                options: TcpOptions { timestamp, ..Default::default() },
                payload: &[],
                ip_id: IpId::Next,
            },
        )
    }

    /// Segment carrying remote data to the client.
    #[allow(clippy::too_many_arguments)]
    pub fn data(
        &self,
        client_ip: &Ipv4Header,
        client_tcp: &TcpHeader,
        seq: u32,
        ack: u32,
        payload: &[u8],
        push: bool,
        timestamp: Option<TcpTimestamp>,
    ) -> Packet {
        let flags = if push { TcpFlags::psh_ack() } else { TcpFlags::ack_only() };
        self.tcp_reply(
            client_ip,
            client_tcp,
            TcpReply {
                seq,
                ack,
                flags,
                window: self.recv_window,
                options: TcpOptions { timestamp, ..Default::default() },
                payload,
                ip_id: IpId::Next,
            },
        )
    }

    /// RST answering `client_tcp`, which carried `data_len` payload bytes.
    ///
    /// With an acknowledgement number the reset takes its sequence from it;
    /// otherwise it acknowledges everything the segment occupied.
    pub fn rst(&self, client_ip: &Ipv4Header, client_tcp: &TcpHeader, data_len: usize) -> Packet {
        let (seq, ack, flags) = if client_tcp.flags.ack {
            (client_tcp.ack_number, 0, TcpFlags::rst_only())
        } else {
            let mut occupied = data_len as u32;
            if client_tcp.flags.syn {
                occupied += 1;
            }
            if client_tcp.flags.fin {
                occupied += 1;
            }
            let flags = TcpFlags { rst: true, ack: true, ..Default::default() };
            (0, client_tcp.sequence_number.wrapping_add(occupied), flags)
        };
        self.tcp_reply(
            client_ip,
            client_tcp,
            TcpReply {
                seq,
                ack,
                flags,
                window: 0,
                options: TcpOptions::default(),
                payload: &[],
                ip_id: IpId::Zero,
            },
        )
    }

    /// RST|ACK tearing down a flow the client still believes is open.
    ///
    /// `seq` must be the client's next expected sequence number or the
    /// reset falls outside its receive window and is ignored.
    pub fn abort(&self, client_ip: &Ipv4Header, client_tcp: &TcpHeader, seq: u32, ack: u32) -> Packet {
        self.tcp_reply(
            client_ip,
            client_tcp,
            TcpReply {
                seq,
                ack,
                flags: TcpFlags { rst: true, ack: true, ..Default::default() },
                window: 0,
                options: TcpOptions::default(),
                payload: &[],
                ip_id: IpId::Zero,
            },
        )
    }

    /// Datagram carrying a remote UDP payload back to the client.
    pub fn udp_reply(&self, client_ip: &Ipv4Header, client_udp: &UdpHeader, payload: &[u8]) -> Packet {
        let mut ip = client_ip.reversed();
        ip.identification = self.next_ip_id();
        ip.dont_fragment = false;
        ip.more_fragments = false;
        ip.fragment_offset = 0;
        let mut udp = client_udp.reversed();
        udp.length = (UDP_HEADER_LEN + payload.len()) as u16;
        self.assemble_udp(ip, udp, payload)
    }

    fn assemble_tcp(&self, mut ip: Ipv4Header, mut tcp: TcpHeader, payload: &[u8]) -> Packet {
        let ip_len = ip.header_len();
        let total = ip_len + tcp.header_len() + payload.len();
        ip.protocol = PROTO_TCP;
        ip.total_length = total as u16;
        ip.checksum = 0;
        tcp.checksum = 0;

        let mut buf = BytesMut::with_capacity(total);
        ip.encode_into(&mut buf);
        tcp.encode_into(&mut buf);
        buf.put_slice(payload);

        ip.checksum = internet_checksum(&buf, 0, ip_len);
        buf[10..12].copy_from_slice(&ip.checksum.to_be_bytes());
        tcp.checksum = tcp_checksum(ip.source, ip.destination, &buf[ip_len..]);
        buf[ip_len + 16..ip_len + 18].copy_from_slice(&tcp.checksum.to_be_bytes());

        self.finish(ip, TransportHeader::Tcp(tcp), buf)
    }

    fn assemble_udp(&self, mut ip: Ipv4Header, mut udp: UdpHeader, payload: &[u8]) -> Packet {
        let ip_len = ip.header_len();
        let total = ip_len + UDP_HEADER_LEN + payload.len();
        ip.protocol = PROTO_UDP;
        ip.total_length = total as u16;
        ip.checksum = 0;
        udp.checksum = 0;

        let mut buf = BytesMut::with_capacity(total);
        ip.encode_into(&mut buf);
        udp.encode_into(&mut buf);
        buf.put_slice(payload);

        ip.checksum = internet_checksum(&buf, 0, ip_len);
        buf[10..12].copy_from_slice(&ip.checksum.to_be_bytes());
        udp.checksum = udp_checksum(ip.source, ip.destination, &buf[ip_len..]);
        buf[ip_len + 6..ip_len + 8].copy_from_slice(&udp.checksum.to_be_bytes());

        self.finish(ip, TransportHeader::Udp(udp), buf)
    }

    fn finish(&self, ip: Ipv4Header, transport: TransportHeader, buf: BytesMut) -> Packet {
        let packet = Packet::new(ip, transport, buf.freeze());
        self.publisher.publish(packet.clone());
        packet
    }
}
