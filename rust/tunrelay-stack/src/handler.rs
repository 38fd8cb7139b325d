//! Inbound packet handling: the per-flag TCP state machine and UDP relay
//! entry point.
//!
//! Every packet read from the tunnel is decoded, published, and dispatched
//! here on the ingest thread. Replies that do not depend on the remote
//! socket (SYN-ACK, ACK, FIN-ACK, RST) are written straight back to the
//! tunnel; everything else is queued on the session for the socket I/O
//! engine.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::builder::{initial_sequence, PacketBuilder};
use crate::error::{HeaderError, RelayError, Result};
use crate::io::{write_to_client, IoNotifier};
use crate::packet::tcp::MAX_WINDOW_SCALE;
use crate::packet::{Ipv4Header, Packet, TcpHeader, TransportHeader, UdpHeader};
use crate::platform::ClientPacketWriter;
use crate::publish::PacketPublisher;
use crate::session::{seq_after, seq_before, Session, SessionState};
use crate::stats::StackStats;
use crate::table::{SessionKey, SessionTable};

/// MSS assumed when a SYN carries no MSS option (RFC 879).
pub const DEFAULT_CLIENT_MSS: u16 = 536;

/// Dispatches tunnel packets to sessions.
pub struct SessionHandler {
    table: Arc<SessionTable>,
    builder: Arc<PacketBuilder>,
    writer: Arc<dyn ClientPacketWriter>,
    publisher: Arc<dyn PacketPublisher>,
    notifier: IoNotifier,
    stats: Arc<StackStats>,
    mss: u16,
}

impl SessionHandler {
    pub fn new(
        table: Arc<SessionTable>,
        builder: Arc<PacketBuilder>,
        writer: Arc<dyn ClientPacketWriter>,
        publisher: Arc<dyn PacketPublisher>,
        notifier: IoNotifier,
        stats: Arc<StackStats>,
        mss: u16,
    ) -> Self {
        Self { table, builder, writer, publisher, notifier, stats, mss }
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Process one raw packet read from the tunnel.
    ///
    /// Malformed packets are returned as errors for the caller to log.
    /// Non-IPv4-TCP/UDP traffic and IP fragments are dropped silently.
    pub fn handle_inbound_packet(&self, raw: &[u8]) -> Result<()> {
        self.stats.record_received(raw.len());

        let ip = Ipv4Header::decode(raw, 0).inspect_err(|_| self.stats.record_invalid())?;
        if ip.more_fragments || ip.fragment_offset != 0 {
            debug!("dropping IP fragment from {} (id {})", ip.source, ip.identification);
            self.stats.record_dropped();
            return Ok(());
        }

        let packet = match Packet::from_ip(ip, raw) {
            Ok(packet) => packet,
            Err(HeaderError::UnsupportedProtocol(protocol)) => {
                trace!("dropping protocol {} packet", protocol);
                self.stats.record_other();
                self.stats.record_dropped();
                return Ok(());
            }
            Err(e) => {
                self.stats.record_invalid();
                return Err(e.into());
            }
        };

        self.publisher.publish(packet.clone());

        match packet.transport() {
            TransportHeader::Tcp(tcp) => {
                self.stats.record_tcp();
                self.handle_tcp(packet.ip(), tcp, packet.payload())
            }
            TransportHeader::Udp(udp) => {
                self.stats.record_udp();
                self.handle_udp(packet.ip(), udp, packet.payload())
            }
        }
    }

    fn handle_tcp(&self, ip: &Ipv4Header, tcp: &TcpHeader, payload: &[u8]) -> Result<()> {
        let key = SessionKey::from_parts(ip.destination, tcp.destination_port, ip.source, tcp.source_port);
        trace!("{} [{}] seq={} ack={} len={}", key, tcp.flags, tcp.sequence_number, tcp.ack_number, payload.len());

        if tcp.flags.syn {
            return self.reply_syn_ack(ip, tcp, key);
        }

        if tcp.flags.ack {
            return self.handle_ack(ip, tcp, payload, key);
        }

        if tcp.flags.fin {
            match self.table.get_by_key(&key) {
                Some(session) => self.table.touch(&session),
                None => self.ack_fin_ack(ip, tcp, payload.len(), None),
            }
            return Ok(());
        }

        if tcp.flags.rst {
            if let Some(session) = self.table.get_by_key(&key) {
                debug!("{}: reset by client", key);
                self.reset_connection(&session);
            }
            return Ok(());
        }

        debug!("{}: dropping segment with flags {}", key, tcp.flags);
        self.stats.record_dropped();
        Ok(())
    }

    /// Answer a SYN, creating the session. A retransmitted SYN for a flow
    /// still waiting on its handshake gets the same SYN-ACK again; any other
    /// existing session under the key is torn down first.
    fn reply_syn_ack(&self, ip: &Ipv4Header, syn: &TcpHeader, key: SessionKey) -> Result<()> {
        if let Some(existing) = self.table.get_by_key(&key) {
            let expected = syn.sequence_number.wrapping_add(1);
            if existing.state() == SessionState::SynReceived && existing.rec_sequence() == expected {
                debug!("{}: retransmitted SYN, repeating SYN-ACK", key);
                let reply = self.builder.syn_ack(ip, syn, existing.send_unacked(), existing.mss());
                write_to_client(self.writer.as_ref(), &self.stats, &reply);
                return Ok(());
            }
            debug!("{}: new SYN replaces existing {:?} session", key, existing.state());
            self.table.close_session(&existing);
        }

        let session = match self.table.create_tcp(key) {
            Ok(session) => session,
            Err(RelayError::SessionExists(_)) => {
                debug!("{}: SYN raced with another session create", key);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let isn = initial_sequence();
        let mss = syn.options.mss.unwrap_or(DEFAULT_CLIENT_MSS).min(self.mss);
        session.set_send_window(syn.window_size, 1);
        session.set_window_scale(syn.options.window_scale.map_or(1, |shift| 1u32 << shift.min(MAX_WINDOW_SCALE)));
        session.set_mss(mss);
        session.set_send_unacked(isn);
        session.set_send_next(isn.wrapping_add(1));
        session.set_rec_sequence(syn.sequence_number.wrapping_add(1));
        if let Some(ts) = syn.options.timestamp {
            session.enable_timestamps(ts);
        }

        let reply = self.builder.syn_ack(ip, syn, isn, mss);
        write_to_client(self.writer.as_ref(), &self.stats, &reply);

        // headers last: an engine RST must not overtake the SYN-ACK
        session.set_last_headers(ip.clone(), TransportHeader::Tcp(syn.clone()));
        if session.is_aborting() {
            debug!("{}: connect failed during handshake", key);
            self.reset_aborted(&session, ip, syn);
            self.notifier.notify(session.token());
        }
        Ok(())
    }

    /// RST for a flow whose remote side already failed.
    fn reset_aborted(&self, session: &Session, ip: &Ipv4Header, tcp: &TcpHeader) {
        if !session.claim_reset() {
            return;
        }
        let rst = self.builder.abort(ip, tcp, session.send_next(), session.rec_sequence());
        if write_to_client(self.writer.as_ref(), &self.stats, &rst) {
            self.stats.record_reset();
        }
    }

    fn handle_ack(&self, ip: &Ipv4Header, tcp: &TcpHeader, payload: &[u8], key: SessionKey) -> Result<()> {
        let Some(session) = self.table.get_by_key(&key) else {
            if !tcp.flags.rst && !tcp.flags.fin {
                debug!("{}: segment for unknown session, sending RST", key);
                let rst = self.builder.rst(ip, tcp, payload.len());
                if write_to_client(self.writer.as_ref(), &self.stats, &rst) {
                    self.stats.record_reset();
                }
            }
            return Ok(());
        };

        if tcp.flags.rst {
            debug!("{}: reset by client", key);
            self.reset_connection(&session);
            return Ok(());
        }

        if payload.is_empty() {
            self.accept_ack(&session, tcp);
            if !seq_before(tcp.sequence_number, session.rec_sequence()) {
                session.set_rec_sequence(tcp.sequence_number);
            }
            if session.take_closing_connection() {
                self.send_fin_ack(&session, ip, tcp);
            } else if session.is_acked_to_fin() && !tcp.flags.fin && tcp.ack_number == session.send_next() {
                debug!("{}: final ACK received, closing", key);
                self.table.close_session(&session);
                return Ok(());
            }
        } else {
            self.accept_ack(&session, tcp);
            self.add_client_data(&session, ip, tcp, payload);
            if session.take_closing_connection() {
                self.send_fin_ack(&session, ip, tcp);
            }
        }

        if tcp.flags.psh {
            self.push_data_to_destination(&session, ip, tcp);
        }

        if tcp.flags.fin {
            self.ack_fin_ack(ip, tcp, payload.len(), Some(&session));
            return Ok(());
        }

        if !session.is_client_window_full() && !session.is_aborting() {
            self.table.touch(&session);
        }
        Ok(())
    }

    /// Take the in-order part of `payload` and acknowledge it. Segments
    /// entirely below `rec_sequence` or beyond it are answered with a
    /// duplicate ACK so the client resynchronises.
    fn add_client_data(&self, session: &Arc<Session>, ip: &Ipv4Header, tcp: &TcpHeader, payload: &[u8]) {
        let rec = session.rec_sequence();
        let seq = tcp.sequence_number;

        let accepted = if seq == rec {
            session.enqueue_outgoing(payload)
        } else if seq_before(seq, rec) {
            let overlap = rec.wrapping_sub(seq) as usize;
            if overlap < payload.len() {
                session.enqueue_outgoing(&payload[overlap..])
            } else {
                0
            }
        } else {
            debug!("{}: gap at seq {} (expected {}), dropping {} bytes", session.key(), seq, rec, payload.len());
            0
        };

        let ack = rec.wrapping_add(accepted as u32);
        if accepted > 0 {
            session.set_rec_sequence(ack);
        }
        session.update_timestamps(tcp.options.timestamp);
        let reply = self.builder.ack(ip, tcp, session.send_next(), ack, session.reply_timestamp());
        write_to_client(self.writer.as_ref(), &self.stats, &reply);
    }

    /// Process the acknowledgement number of a client segment.
    fn accept_ack(&self, session: &Arc<Session>, tcp: &TcpHeader) -> bool {
        let ack = tcp.ack_number;
        let unacked = session.send_unacked();
        let next = session.send_next();

        let corrupted = seq_after(ack, next);
        session.set_packet_corrupted(corrupted);
        if corrupted {
            debug!("{}: ack {} beyond send_next {}", session.key(), ack, next);
        }

        let accepted = !corrupted && (seq_after(ack, unacked) || ack == next);
        session.set_acked(accepted);
        if !accepted {
            return false;
        }

        session.set_established(true);
        session.update_send_window(tcp.window_size);
        if seq_after(ack, unacked) {
            session.set_send_unacked(ack);
        }
        session.update_timestamps(tcp.options.timestamp);

        // reads parked on a full window or an unfinished handshake
        if session.is_read_pending() && !session.is_client_window_full() {
            trace!("{}: resuming remote reads", session.key());
            self.notifier.notify(session.token());
        }
        true
    }

    /// PSH: hand queued client data to the write worker.
    fn push_data_to_destination(&self, session: &Arc<Session>, ip: &Ipv4Header, tcp: &TcpHeader) {
        session.set_data_ready(true);
        session.set_last_headers(ip.clone(), TransportHeader::Tcp(tcp.clone()));
        session.update_timestamps(tcp.options.timestamp);
        self.notifier.notify(session.token());
    }

    /// Our FIN, deferred until the client caught up with the data in flight.
    /// The caller has already claimed it.
    fn send_fin_ack(&self, session: &Arc<Session>, ip: &Ipv4Header, tcp: &TcpHeader) {
        let seq = session.send_next();
        let ack = session.rec_sequence();
        let reply = self.builder.fin_ack(ip, tcp, seq, ack, session.reply_timestamp());
        session.set_send_next(seq.wrapping_add(1));
        session.set_acked_to_fin(true);
        write_to_client(self.writer.as_ref(), &self.stats, &reply);
    }

    /// Acknowledge a client FIN. Without a session this only answers the
    /// segment; with one the session closes, once any queued client data
    /// has been flushed to the remote.
    fn ack_fin_ack(&self, ip: &Ipv4Header, tcp: &TcpHeader, payload_len: usize, session: Option<&Arc<Session>>) {
        let ack = tcp.sequence_number.wrapping_add(payload_len as u32).wrapping_add(1);
        let seq = session.map_or(tcp.ack_number, |s| s.send_next());
        let timestamp = session.and_then(|s| s.reply_timestamp());
        let reply = self.builder.fin_ack(ip, tcp, seq, ack, timestamp);
        write_to_client(self.writer.as_ref(), &self.stats, &reply);

        let Some(session) = session else { return };
        session.set_rec_sequence(ack);
        session.set_send_next(seq.wrapping_add(1));
        session.set_client_fin();
        if session.has_outgoing() {
            debug!("{}: client FIN with {} bytes unflushed", session.key(), session.outgoing_len());
            session.set_data_ready(true);
            self.notifier.notify(session.token());
        } else {
            debug!("{}: client FIN, closing", session.key());
            self.table.close_session(session);
        }
    }

    fn reset_connection(&self, session: &Arc<Session>) {
        session.set_aborting(true);
        self.notifier.notify(session.token());
    }

    fn handle_udp(&self, ip: &Ipv4Header, udp: &UdpHeader, payload: &[u8]) -> Result<()> {
        let key = SessionKey::from_parts(ip.destination, udp.destination_port, ip.source, udp.source_port);
        let session = match self.table.get_by_key(&key) {
            Some(session) => session,
            None => match self.table.create_udp(key) {
                Ok(session) => session,
                Err(RelayError::SessionExists(_)) => match self.table.get_by_key(&key) {
                    Some(session) => session,
                    None => return Ok(()),
                },
                Err(e) => {
                    warn!("{}: cannot create UDP session: {}", key, e);
                    return Err(e);
                }
            },
        };

        session.set_last_headers(ip.clone(), TransportHeader::Udp(*udp));
        session.enqueue_outgoing(payload);
        session.set_data_ready(true);
        self.table.touch(&session);
        self.notifier.notify(session.token());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::packet::{TcpFlags, TcpOptions, TcpTimestamp, PROTO_TCP, PROTO_UDP};
    use crate::platform::NoProtection;
    use crate::publish::NullPublisher;
    use bytes::{BufMut, BytesMut};
    use mio::Poll;
    use parking_lot::Mutex;
    use std::io;
    use std::net::{Ipv4Addr, TcpListener};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Packet>>);

    impl ClientPacketWriter for Recorder {
        fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
            self.0.lock().push(Packet::parse(packet).unwrap());
            Ok(())
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<Packet> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    struct Fixture {
        _poll: Poll,
        handler: SessionHandler,
        written: Arc<Recorder>,
        table: Arc<SessionTable>,
    }

    fn fixture() -> Fixture {
        let poll = Poll::new().unwrap();
        let config = StackConfig::default();
        let stats = Arc::new(StackStats::new());
        let table = Arc::new(SessionTable::new(
            poll.registry().try_clone().unwrap(),
            Arc::new(NoProtection),
            stats.clone(),
            &config,
        ));
        let notifier = IoNotifier::new(poll.registry()).unwrap();
        let builder = Arc::new(PacketBuilder::new(Arc::new(NullPublisher), config.tcp.recv_window));
        let written = Arc::new(Recorder::default());
        let handler = SessionHandler::new(
            table.clone(),
            builder,
            written.clone(),
            Arc::new(NullPublisher),
            notifier,
            stats,
            config.tcp.mss,
        );
        Fixture { _poll: poll, handler, written, table }
    }

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn tcp_packet(dest: Ipv4Addr, dport: u16, sport: u16, tcp: TcpHeader, payload: &[u8]) -> Vec<u8> {
        let tcp = TcpHeader { source_port: sport, destination_port: dport, ..tcp };
        let mut ip = Ipv4Header::new(CLIENT, dest, PROTO_TCP);
        ip.total_length = (ip.header_len() + tcp.header_len() + payload.len()) as u16;
        let mut buf = BytesMut::new();
        ip.encode_into(&mut buf);
        tcp.encode_into(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    fn syn(seq: u32) -> TcpHeader {
        TcpHeader {
            sequence_number: seq,
            flags: TcpFlags { syn: true, ..Default::default() },
            window_size: 65535,
            options: TcpOptions { mss: Some(1460), ..Default::default() },
            ..Default::default()
        }
    }

    fn segment(flags: TcpFlags, seq: u32, ack: u32) -> TcpHeader {
        TcpHeader { sequence_number: seq, ack_number: ack, flags, window_size: 65535, ..Default::default() }
    }

    fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Completes a handshake against a loopback listener and returns the
    /// session with the server's ISN.
    fn established(f: &Fixture, port: u16) -> (Arc<Session>, u32) {
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, syn(1000), b"")).unwrap();
        let isn = f.written.take()[0].tcp().unwrap().sequence_number;
        let ack = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, ack, b"")).unwrap();
        assert!(f.written.take().is_empty());
        let session = f.table.get(Ipv4Addr::LOCALHOST, port, CLIENT, 50000).unwrap();
        (session, isn)
    }

    #[test]
    fn handshake_creates_session_and_replies_syn_ack() {
        let f = fixture();
        let dest = Ipv4Addr::new(93, 184, 216, 34);
        f.handler.handle_inbound_packet(&tcp_packet(dest, 443, 50000, syn(1000), b"")).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 1);
        let reply = replies[0].tcp().unwrap();
        assert!(reply.flags.syn && reply.flags.ack);
        assert_eq!(reply.ack_number, 1001);
        assert_eq!(replies[0].ip().source, dest);
        assert_eq!(replies[0].ip().destination, CLIENT);

        let session = f.table.get(dest, 443, CLIENT, 50000).unwrap();
        assert_eq!(session.rec_sequence(), 1001);
        assert_eq!(session.send_next(), reply.sequence_number.wrapping_add(1));
        assert_eq!(session.send_unacked(), reply.sequence_number);
        assert_eq!(session.mss(), 1360);
    }

    #[test]
    fn retransmitted_syn_repeats_isn() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let raw = tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, syn(1000), b"");
        f.handler.handle_inbound_packet(&raw).unwrap();
        f.handler.handle_inbound_packet(&raw).unwrap();
        let replies = f.written.take();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tcp().unwrap().sequence_number, replies[1].tcp().unwrap().sequence_number);
        assert_eq!(f.table.len(), 1);
    }

    #[test]
    fn new_syn_replaces_established_session() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (old, _) = established(&f, port);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, syn(5000), b"")).unwrap();
        assert!(old.is_closed());
        let new = f.table.get(Ipv4Addr::LOCALHOST, port, CLIENT, 50000).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.rec_sequence(), 5001);
    }

    #[test]
    fn data_is_queued_and_acknowledged() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        assert_eq!(session.state(), SessionState::Established);

        let data = [0x42u8; 100];
        let seg = segment(TcpFlags::psh_ack(), 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, &data)).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 1);
        let ack = replies[0].tcp().unwrap();
        assert!(ack.flags.ack && !ack.flags.psh && !ack.flags.syn);
        assert_eq!(ack.ack_number, 1101);
        assert_eq!(session.outgoing_len(), 100);
        assert!(session.is_data_ready());
        assert_eq!(session.rec_sequence(), 1101);
    }

    #[test]
    fn duplicate_data_is_not_requeued() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        let seg = segment(TcpFlags::psh_ack(), 1001, isn.wrapping_add(1));
        let raw = tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"abcdef");
        f.handler.handle_inbound_packet(&raw).unwrap();
        f.handler.handle_inbound_packet(&raw).unwrap();
        let replies = f.written.take();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].tcp().unwrap().ack_number, 1007);
        assert_eq!(session.outgoing_len(), 6);
    }

    #[test]
    fn partial_overlap_keeps_new_bytes() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        let first = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, first, b"abcd")).unwrap();
        let overlap = segment(TcpFlags::ack_only(), 1003, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, overlap, b"cdef")).unwrap();
        let queued: Vec<u8> = session.drain_send_queue().concat();
        assert_eq!(queued, b"abcdef");
        assert_eq!(session.rec_sequence(), 1007);
    }

    #[test]
    fn unknown_session_gets_reset() {
        let f = fixture();
        let seg = segment(TcpFlags::ack_only(), 77, 9000);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::new(1, 1, 1, 1), 80, 40000, seg, b"")).unwrap();
        let replies = f.written.take();
        assert_eq!(replies.len(), 1);
        let rst = replies[0].tcp().unwrap();
        assert!(rst.flags.rst);
        assert_eq!(rst.sequence_number, 9000);
    }

    #[test]
    fn unknown_session_fin_ack_is_not_reset() {
        let f = fixture();
        let seg = segment(TcpFlags::fin_ack(), 77, 9000);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::new(1, 1, 1, 1), 80, 40000, seg, b"")).unwrap();
        assert!(f.written.take().is_empty());
    }

    #[test]
    fn local_close_sends_fin_ack_on_next_ack() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        session.set_closing_connection(true);
        let next_before = session.send_next();

        let seg = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 1);
        let fin = replies[0].tcp().unwrap();
        assert!(fin.flags.fin && fin.flags.ack);
        assert_eq!(fin.sequence_number, next_before);
        assert_eq!(session.send_next(), next_before.wrapping_add(1));
        assert!(!session.is_closing_connection());
        assert!(session.is_acked_to_fin());

        // the client's ACK of our FIN ends the session
        let last = segment(TcpFlags::ack_only(), 1001, next_before.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, last, b"")).unwrap();
        assert!(session.is_closed());
        assert!(f.table.is_empty());
    }

    #[test]
    fn deferred_fin_follows_data_carrying_ack() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        session.set_send_next(isn.wrapping_add(6));
        assert!(!session.defer_fin_while_in_flight());

        let seg = segment(TcpFlags::psh_ack(), 1001, isn.wrapping_add(6));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"hi")).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tcp().unwrap().ack_number, 1003);
        let fin = replies[1].tcp().unwrap();
        assert!(fin.flags.fin && fin.flags.ack);
        assert_eq!(fin.sequence_number, isn.wrapping_add(6));
        assert_eq!(fin.ack_number, 1003);
        assert!(!session.is_closing_connection());
        assert!(session.is_acked_to_fin());
    }

    #[test]
    fn remote_eof_after_final_ack_is_not_deferred() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        session.set_send_next(isn.wrapping_add(6));

        // the client's ACK lands before the remote end of stream is seen
        let seg = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(6));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();
        assert!(f.written.take().is_empty());

        assert!(session.defer_fin_while_in_flight());
        assert!(!session.is_closing_connection());
    }

    #[test]
    fn bare_fin_without_session_is_answered() {
        let f = fixture();
        let seg = segment(TcpFlags { fin: true, ..Default::default() }, 300, 0);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::new(1, 1, 1, 1), 80, 40000, seg, b"")).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 1);
        let reply = replies[0].tcp().unwrap();
        assert!(reply.flags.fin && reply.flags.ack);
        assert_eq!(reply.ack_number, 301);
        assert_eq!(reply.sequence_number, 0);
        assert_eq!(reply.destination_port, 40000);
        assert!(f.table.is_empty());
    }

    #[test]
    fn bare_fin_with_session_only_touches() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, _) = established(&f, port);
        let before = session.last_access();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let seg = segment(TcpFlags { fin: true, ..Default::default() }, 1001, 0);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();

        assert!(f.written.take().is_empty());
        assert!(session.last_access() > before);
        assert!(!session.is_closed());
        assert!(!session.has_client_fin());
        assert_eq!(f.table.len(), 1);
    }

    #[test]
    fn bare_rst_without_session_is_ignored() {
        let f = fixture();
        let seg = segment(TcpFlags::rst_only(), 300, 0);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::new(1, 1, 1, 1), 80, 40000, seg, b"")).unwrap();
        assert!(f.written.take().is_empty());
        assert!(f.table.is_empty());
    }

    #[test]
    fn zero_window_closes_client_window() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        assert!(!session.is_client_window_full());

        let mut seg = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(1));
        seg.window_size = 0;
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();
        assert!(session.is_client_window_full());

        let reopen = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, reopen, b"")).unwrap();
        assert!(!session.is_client_window_full());
    }

    #[test]
    fn client_fin_is_acknowledged_and_closes() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        let seg = segment(TcpFlags::fin_ack(), 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 1);
        let reply = replies[0].tcp().unwrap();
        assert!(reply.flags.fin && reply.flags.ack);
        assert_eq!(reply.ack_number, 1002);
        assert!(session.is_closed());
    }

    #[test]
    fn client_fin_with_data_waits_for_flush() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        let flags = TcpFlags { fin: true, psh: true, ack: true, ..Default::default() };
        let seg = segment(flags, 1001, isn.wrapping_add(1));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"bye")).unwrap();

        let replies = f.written.take();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tcp().unwrap().ack_number, 1004);
        assert_eq!(replies[1].tcp().unwrap().ack_number, 1005);
        assert!(!session.is_closed());
        assert!(session.has_client_fin());
        assert_eq!(session.outgoing_len(), 3);
    }

    #[test]
    fn rst_marks_session_aborting() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, _) = established(&f, port);
        let seg = segment(TcpFlags::rst_only(), 1001, 0);
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();
        assert!(session.is_aborting());
        assert!(f.written.take().is_empty());
    }

    #[test]
    fn ack_beyond_send_next_is_flagged() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        let seg = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(500));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();
        assert!(session.is_packet_corrupted());
        assert!(!session.is_acked());
        assert!(!session.is_aborting());
        assert_eq!(session.send_unacked(), isn.wrapping_add(1));
    }

    #[test]
    fn ack_opens_window_and_advances_unacked() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let (session, isn) = established(&f, port);
        session.set_send_next(isn.wrapping_add(1 + 70_000));
        assert!(session.is_client_window_full());

        let seg = segment(TcpFlags::ack_only(), 1001, isn.wrapping_add(1 + 70_000));
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, seg, b"")).unwrap();
        assert!(session.is_acked());
        assert_eq!(session.send_unacked(), isn.wrapping_add(1 + 70_000));
        assert!(!session.is_client_window_full());
    }

    #[test]
    fn timestamps_are_echoed() {
        let f = fixture();
        let (_listener, port) = local_listener();
        let mut header = syn(1000);
        header.options.timestamp = Some(TcpTimestamp { sender: 4242, reply_to: 0 });
        f.handler.handle_inbound_packet(&tcp_packet(Ipv4Addr::LOCALHOST, port, 50000, header, b"")).unwrap();
        let replies = f.written.take();
        let ts = replies[0].tcp().unwrap().options.timestamp.unwrap();
        assert_eq!(ts.reply_to, 4242);
    }

    #[test]
    fn udp_datagram_creates_session_and_queues_payload() {
        let f = fixture();
        let mut ip = Ipv4Header::new(CLIENT, Ipv4Addr::LOCALHOST, PROTO_UDP);
        let udp = UdpHeader { source_port: 40000, destination_port: 9, length: 13, checksum: 0 };
        ip.total_length = 33;
        let mut raw = ip.encode();
        raw.extend_from_slice(&udp.encode());
        raw.extend_from_slice(b"query");

        f.handler.handle_inbound_packet(&raw).unwrap();
        f.handler.handle_inbound_packet(&raw).unwrap();
        let session = f.table.get(Ipv4Addr::LOCALHOST, 9, CLIENT, 40000).unwrap();
        let queued = session.drain_send_queue();
        assert_eq!(queued.len(), 2);
        assert_eq!(&queued[0][..], b"query");
        assert!(session.is_data_ready());
        assert!(f.written.take().is_empty());
    }

    #[test]
    fn gre_is_dropped_without_session() {
        let f = fixture();
        let mut ip = Ipv4Header::new(CLIENT, Ipv4Addr::new(1, 2, 3, 4), 47);
        ip.total_length = 24;
        let mut raw = ip.encode();
        raw.extend_from_slice(&[0u8; 4]);
        f.handler.handle_inbound_packet(&raw).unwrap();
        assert!(f.table.is_empty());
        assert!(f.written.take().is_empty());
    }

    #[test]
    fn malformed_packets_are_errors() {
        let f = fixture();
        let err = f.handler.handle_inbound_packet(&[0x45, 0x00, 0x00]).unwrap_err();
        assert!(err.is_malformed());
        let mut raw = tcp_packet(Ipv4Addr::LOCALHOST, 80, 1, syn(1), b"");
        raw.truncate(30);
        raw[2] = 0;
        raw[3] = 30;
        assert!(f.handler.handle_inbound_packet(&raw).unwrap_err().is_malformed());
        assert!(f.table.is_empty());
    }
}
