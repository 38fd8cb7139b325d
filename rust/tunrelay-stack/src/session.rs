//! Per-flow relay state.
//!
//! A [`Session`] is shared between the ingest thread (handler), the
//! multiplexer and the socket workers. Sequence and window bookkeeping
//! lives behind one mutex; lifecycle and scheduling flags are atomics so
//! the multiplexer can test them without blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mio::Token;
use parking_lot::Mutex;

use crate::builder::timestamp_now;
use crate::io::channel::Channel;
use crate::packet::{Ipv4Header, TcpHeader, TcpTimestamp, TransportHeader, UdpHeader};
use crate::table::SessionKey;

/// `a` comes after `b` in sequence space.
pub fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` comes before `b` in sequence space.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Transport protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Lifecycle view derived from the session flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// SYN-ACK sent, waiting for the client's ACK.
    SynReceived,
    Established,
    /// Our FIN is out or about to be.
    FinWait,
    /// The client closed its side.
    CloseWait,
    /// UDP flows have no handshake.
    Open,
    /// Marked for forced close on the next engine sweep.
    Aborting,
    Closed,
}

#[derive(Debug)]
struct Tcb {
    send_unacked: u32,
    send_next: u32,
    send_window: u32,
    send_window_scale: u32,
    mss: u16,
    rec_sequence: u32,
    timestamps: bool,
    timestamp_sender: u32,
    timestamp_reply_to: u32,
    unacked_data: Bytes,
    closing_connection: bool,
    last_ip: Option<Ipv4Header>,
    last_transport: Option<TransportHeader>,
    last_access: Instant,
}

/// One client flow and its remote socket.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    protocol: Protocol,
    token: Token,
    created_at: Instant,

    tcb: Mutex<Tcb>,
    outgoing: Mutex<VecDeque<Bytes>>,
    incoming: Mutex<BytesMut>,
    channel: Mutex<Option<Arc<Channel>>>,

    connected: AtomicBool,
    established: AtomicBool,
    acked: AtomicBool,
    packet_corrupted: AtomicBool,
    acked_to_fin: AtomicBool,
    aborting: AtomicBool,
    reset_sent: AtomicBool,
    data_ready: AtomicBool,
    remote_eof: AtomicBool,
    client_fin: AtomicBool,
    last_segment: AtomicBool,
    closed: AtomicBool,

    busy_read: AtomicBool,
    busy_write: AtomicBool,
    read_pending: AtomicBool,
    writable_events: AtomicU64,
    write_blocked_at: AtomicU64,
}

impl Session {
    pub fn new(key: SessionKey, protocol: Protocol, token: Token) -> Self {
        let now = Instant::now();
        Self {
            key,
            protocol,
            token,
            created_at: now,
            tcb: Mutex::new(Tcb {
                send_unacked: 0,
                send_next: 0,
                send_window: 0,
                send_window_scale: 1,
                mss: 536,
                rec_sequence: 0,
                timestamps: false,
                timestamp_sender: 0,
                timestamp_reply_to: 0,
                unacked_data: Bytes::new(),
                closing_connection: false,
                last_ip: None,
                last_transport: None,
                last_access: now,
            }),
            outgoing: Mutex::new(VecDeque::new()),
            incoming: Mutex::new(BytesMut::new()),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
            established: AtomicBool::new(false),
            acked: AtomicBool::new(false),
            packet_corrupted: AtomicBool::new(false),
            acked_to_fin: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            reset_sent: AtomicBool::new(false),
            data_ready: AtomicBool::new(false),
            remote_eof: AtomicBool::new(false),
            client_fin: AtomicBool::new(false),
            last_segment: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            busy_read: AtomicBool::new(false),
            busy_write: AtomicBool::new(false),
            read_pending: AtomicBool::new(false),
            writable_events: AtomicU64::new(0),
            write_blocked_at: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if self.is_aborting() {
            SessionState::Aborting
        } else if self.protocol == Protocol::Udp {
            SessionState::Open
        } else if self.is_acked_to_fin() || self.is_closing_connection() {
            SessionState::FinWait
        } else if self.has_client_fin() {
            SessionState::CloseWait
        } else if self.is_established() {
            SessionState::Established
        } else {
            SessionState::SynReceived
        }
    }

    // ---- access time ----

    pub fn touch(&self) {
        self.tcb.lock().last_access = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        self.tcb.lock().last_access
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    // ---- transport handle ----

    pub fn attach_channel(&self, channel: Arc<Channel>) {
        *self.channel.lock() = Some(channel);
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().clone()
    }

    pub(crate) fn take_channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().take()
    }

    // ---- sequence bookkeeping ----

    pub fn send_unacked(&self) -> u32 {
        self.tcb.lock().send_unacked
    }

    pub fn set_send_unacked(&self, seq: u32) {
        self.tcb.lock().send_unacked = seq;
    }

    pub fn send_next(&self) -> u32 {
        self.tcb.lock().send_next
    }

    pub fn set_send_next(&self, seq: u32) {
        self.tcb.lock().send_next = seq;
    }

    /// Advance `send_next` by `len` and return the sequence number the
    /// advanced range starts at.
    pub fn advance_send_next(&self, len: u32) -> u32 {
        let mut tcb = self.tcb.lock();
        let start = tcb.send_next;
        tcb.send_next = start.wrapping_add(len);
        start
    }

    pub fn rec_sequence(&self) -> u32 {
        self.tcb.lock().rec_sequence
    }

    pub fn set_rec_sequence(&self, seq: u32) {
        self.tcb.lock().rec_sequence = seq;
    }

    /// Client's advertised window and the multiplier its scale option
    /// negotiated.
    pub fn set_send_window(&self, window: u16, scale: u32) {
        let mut tcb = self.tcb.lock();
        tcb.send_window_scale = scale.max(1);
        tcb.send_window = u32::from(window).saturating_mul(tcb.send_window_scale);
    }

    /// Multiplier for window values advertised from now on. The window
    /// already stored is left as is (the SYN's own window is never scaled).
    pub fn set_window_scale(&self, scale: u32) {
        self.tcb.lock().send_window_scale = scale.max(1);
    }

    /// New advertised window, keeping the negotiated scale.
    pub fn update_send_window(&self, window: u16) {
        let mut tcb = self.tcb.lock();
        tcb.send_window = u32::from(window).saturating_mul(tcb.send_window_scale);
    }

    /// Effective client window in bytes.
    pub fn send_window(&self) -> u32 {
        self.tcb.lock().send_window
    }

    pub fn send_window_scale(&self) -> u32 {
        self.tcb.lock().send_window_scale
    }

    pub fn mss(&self) -> u16 {
        self.tcb.lock().mss
    }

    pub fn set_mss(&self, mss: u16) {
        self.tcb.lock().mss = mss;
    }

    /// Bytes sent to the client and not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u32 {
        let tcb = self.tcb.lock();
        tcb.send_next.wrapping_sub(tcb.send_unacked)
    }

    /// True once the client's window is used up. UDP flows never block.
    pub fn is_client_window_full(&self) -> bool {
        if self.protocol == Protocol::Udp {
            return false;
        }
        let tcb = self.tcb.lock();
        tcb.send_next.wrapping_sub(tcb.send_unacked) >= tcb.send_window
    }

    // ---- timestamps ----

    /// Start echoing timestamps using the client's first TSval.
    pub fn enable_timestamps(&self, client: TcpTimestamp) {
        let mut tcb = self.tcb.lock();
        tcb.timestamps = true;
        tcb.timestamp_reply_to = client.sender;
        tcb.timestamp_sender = timestamp_now();
    }

    /// Record the latest client TSval and refresh our own.
    pub fn update_timestamps(&self, client: Option<TcpTimestamp>) {
        let mut tcb = self.tcb.lock();
        if !tcb.timestamps {
            return;
        }
        if let Some(ts) = client {
            tcb.timestamp_reply_to = ts.sender;
        }
        tcb.timestamp_sender = timestamp_now();
    }

    /// Timestamp option for the next reply, if the client uses them.
    pub fn reply_timestamp(&self) -> Option<TcpTimestamp> {
        let tcb = self.tcb.lock();
        tcb.timestamps.then(|| TcpTimestamp {
            sender: timestamp_now(),
            reply_to: tcb.timestamp_reply_to,
        })
    }

    pub fn timestamp_reply_to(&self) -> u32 {
        self.tcb.lock().timestamp_reply_to
    }

    // ---- reply templates ----

    pub fn set_last_headers(&self, ip: Ipv4Header, transport: TransportHeader) {
        let mut tcb = self.tcb.lock();
        tcb.last_ip = Some(ip);
        tcb.last_transport = Some(transport);
    }

    pub fn last_ip_header(&self) -> Option<Ipv4Header> {
        self.tcb.lock().last_ip.clone()
    }

    /// Last client IP and TCP headers, used as templates for replies.
    pub fn last_tcp_headers(&self) -> Option<(Ipv4Header, TcpHeader)> {
        let tcb = self.tcb.lock();
        match (&tcb.last_ip, &tcb.last_transport) {
            (Some(ip), Some(TransportHeader::Tcp(tcp))) => Some((ip.clone(), tcp.clone())),
            _ => None,
        }
    }

    pub fn last_udp_headers(&self) -> Option<(Ipv4Header, UdpHeader)> {
        let tcb = self.tcb.lock();
        match (&tcb.last_ip, &tcb.last_transport) {
            (Some(ip), Some(TransportHeader::Udp(udp))) => Some((ip.clone(), *udp)),
            _ => None,
        }
    }

    /// Last data segment sent to the client.
    pub fn set_unacked_data(&self, data: Bytes) {
        self.tcb.lock().unacked_data = data;
    }

    pub fn unacked_data(&self) -> Bytes {
        self.tcb.lock().unacked_data.clone()
    }

    // ---- client -> remote queue ----

    /// Queue client payload for the remote socket; returns the bytes taken.
    pub fn enqueue_outgoing(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        self.outgoing.lock().push_back(Bytes::copy_from_slice(data));
        data.len()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.lock().is_empty()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.lock().iter().map(Bytes::len).sum()
    }

    /// Take every queued chunk, oldest first. UDP chunks are datagrams.
    pub fn drain_send_queue(&self) -> Vec<Bytes> {
        self.outgoing.lock().drain(..).collect()
    }

    /// Put back data a write could not finish, ahead of anything queued
    /// since.
    pub fn requeue_outgoing(&self, chunks: impl IntoIterator<Item = Bytes>) {
        let mut queue = self.outgoing.lock();
        let chunks: Vec<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        for chunk in chunks.into_iter().rev() {
            queue.push_front(chunk);
        }
    }

    // ---- remote -> client buffer ----

    pub fn append_incoming(&self, data: &[u8]) {
        self.incoming.lock().extend_from_slice(data);
    }

    pub fn has_incoming(&self) -> bool {
        !self.incoming.lock().is_empty()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.lock().len()
    }

    /// Remove up to `max` bytes from the front of the incoming buffer.
    pub fn take_incoming(&self, max: usize) -> Bytes {
        let mut buf = self.incoming.lock();
        let n = max.min(buf.len());
        buf.split_to(n).freeze()
    }

    // ---- flags ----

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn set_established(&self, value: bool) {
        self.established.store(value, Ordering::Release);
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    pub fn set_acked(&self, value: bool) {
        self.acked.store(value, Ordering::Release);
    }

    pub fn is_packet_corrupted(&self) -> bool {
        self.packet_corrupted.load(Ordering::Acquire)
    }

    pub fn set_packet_corrupted(&self, value: bool) {
        self.packet_corrupted.store(value, Ordering::Release);
    }

    /// A remote FIN is waiting for the client to catch up.
    pub fn is_closing_connection(&self) -> bool {
        self.tcb.lock().closing_connection
    }

    pub fn set_closing_connection(&self, value: bool) {
        self.tcb.lock().closing_connection = value;
    }

    /// Remote end of stream. Returns `true` when nothing is in flight and
    /// the caller sends the FIN now; otherwise the FIN is deferred until
    /// [`take_closing_connection`](Self::take_closing_connection) claims it.
    pub fn defer_fin_while_in_flight(&self) -> bool {
        let mut tcb = self.tcb.lock();
        if tcb.send_next == tcb.send_unacked {
            return true;
        }
        tcb.closing_connection = true;
        false
    }

    /// Claim a deferred FIN. Only one caller wins.
    pub fn take_closing_connection(&self) -> bool {
        std::mem::take(&mut self.tcb.lock().closing_connection)
    }

    pub fn is_acked_to_fin(&self) -> bool {
        self.acked_to_fin.load(Ordering::Acquire)
    }

    pub fn set_acked_to_fin(&self, value: bool) {
        self.acked_to_fin.store(value, Ordering::Release);
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    pub fn set_aborting(&self, value: bool) {
        self.aborting.store(value, Ordering::Release);
    }

    /// Claim the one RST this flow sends to the client.
    pub(crate) fn claim_reset(&self) -> bool {
        !self.reset_sent.swap(true, Ordering::AcqRel)
    }

    pub fn is_data_ready(&self) -> bool {
        self.data_ready.load(Ordering::Acquire)
    }

    pub fn set_data_ready(&self, value: bool) {
        self.data_ready.store(value, Ordering::Release);
    }

    pub fn is_remote_eof(&self) -> bool {
        self.remote_eof.load(Ordering::Acquire)
    }

    pub fn set_remote_eof(&self) {
        self.remote_eof.store(true, Ordering::Release);
    }

    pub fn has_client_fin(&self) -> bool {
        self.client_fin.load(Ordering::Acquire)
    }

    pub fn set_client_fin(&self) {
        self.client_fin.store(true, Ordering::Release);
    }

    /// Whether the latest remote read drained the socket (short read).
    pub fn has_received_last_segment(&self) -> bool {
        self.last_segment.load(Ordering::Acquire)
    }

    pub fn set_received_last_segment(&self, value: bool) {
        self.last_segment.store(value, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` for the caller that performed the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    // ---- worker scheduling ----

    pub fn is_busy_read(&self) -> bool {
        self.busy_read.load(Ordering::Acquire)
    }

    pub fn is_busy_write(&self) -> bool {
        self.busy_write.load(Ordering::Acquire)
    }

    /// Claim the read side; fails if a read worker is already running.
    pub fn try_begin_read(&self) -> bool {
        self.busy_read
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_read(&self) {
        self.busy_read.store(false, Ordering::Release);
    }

    pub fn try_begin_write(&self) -> bool {
        self.busy_write
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_write(&self) {
        self.busy_write.store(false, Ordering::Release);
    }

    /// Readiness edge: the socket may have data.
    pub fn mark_readable(&self) {
        self.read_pending.store(true, Ordering::Release);
    }

    pub fn is_read_pending(&self) -> bool {
        self.read_pending.load(Ordering::Acquire)
    }

    /// Consume the pending-read marker before reading, so an edge that
    /// arrives mid-read is not lost.
    pub fn take_read_pending(&self) -> bool {
        self.read_pending.swap(false, Ordering::AcqRel)
    }

    /// Readiness edge: the socket accepts writes again.
    pub fn mark_writable(&self) {
        self.writable_events.fetch_add(1, Ordering::AcqRel);
    }

    /// Writable edges seen so far.
    pub fn writable_generation(&self) -> u64 {
        self.writable_events.load(Ordering::Acquire)
    }

    /// The socket refused a write that began at `generation`.
    pub fn block_writes(&self, generation: u64) {
        self.write_blocked_at.store(generation + 1, Ordering::Release);
    }

    pub fn clear_write_block(&self) {
        self.write_blocked_at.store(0, Ordering::Release);
    }

    /// False while the last write hit a full socket buffer and no writable
    /// edge has arrived since.
    pub fn can_write(&self) -> bool {
        let blocked = self.write_blocked_at.load(Ordering::Acquire);
        blocked == 0 || self.writable_events.load(Ordering::Acquire) >= blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn tcp_session() -> Session {
        let key = SessionKey::new(
            SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50000),
        );
        Session::new(key, Protocol::Tcp, Token(7))
    }

    #[test]
    fn window_full_when_in_flight_reaches_window() {
        let s = tcp_session();
        s.set_send_window(100, 4);
        s.set_send_unacked(1000);
        s.set_send_next(1000 + 399);
        assert!(!s.is_client_window_full());
        s.set_send_next(1000 + 401);
        assert!(s.is_client_window_full());
        assert_eq!(s.bytes_in_flight(), 401);
    }

    #[test]
    fn window_full_handles_wraparound() {
        let s = tcp_session();
        s.set_send_window(10, 1);
        s.set_send_unacked(u32::MAX - 2);
        s.set_send_next(3);
        assert_eq!(s.bytes_in_flight(), 6);
        assert!(!s.is_client_window_full());
    }

    #[test]
    fn syn_window_is_not_scaled() {
        let s = tcp_session();
        s.set_send_window(64240, 1);
        s.set_window_scale(128);
        assert_eq!(s.send_window(), 64240);
        s.update_send_window(502);
        assert_eq!(s.send_window(), 502 * 128);
    }

    #[test]
    fn update_window_keeps_scale() {
        let s = tcp_session();
        s.set_send_window(100, 128);
        s.update_send_window(200);
        assert_eq!(s.send_window(), 200 * 128);
    }

    #[test]
    fn udp_never_reports_full_window() {
        let key = SessionKey::new(
            SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
        );
        let s = Session::new(key, Protocol::Udp, Token(1));
        assert!(!s.is_client_window_full());
        assert_eq!(s.state(), SessionState::Open);
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_after(5, u32::MAX - 5));
        assert!(seq_before(u32::MAX - 5, 5));
        assert!(!seq_after(7, 7));
        assert!(!seq_before(7, 7));
    }

    #[test]
    fn take_incoming_chunks_in_order() {
        let s = tcp_session();
        s.append_incoming(b"hello ");
        s.append_incoming(b"world");
        assert_eq!(&s.take_incoming(4)[..], b"hell");
        assert_eq!(&s.take_incoming(100)[..], b"o world");
        assert!(!s.has_incoming());
        assert!(s.take_incoming(10).is_empty());
    }

    #[test]
    fn outgoing_preserves_chunks_and_requeue_order() {
        let s = tcp_session();
        assert_eq!(s.enqueue_outgoing(b"one"), 3);
        assert_eq!(s.enqueue_outgoing(b""), 0);
        s.enqueue_outgoing(b"two");
        assert_eq!(s.outgoing_len(), 6);

        let drained = s.drain_send_queue();
        assert_eq!(drained.len(), 2);
        s.enqueue_outgoing(b"three");
        s.requeue_outgoing(vec![Bytes::from_static(b"ne"), drained[1].clone()]);
        let again: Vec<Bytes> = s.drain_send_queue();
        assert_eq!(again, vec![Bytes::from_static(b"ne"), Bytes::from_static(b"two"), Bytes::from_static(b"three")]);
    }

    #[test]
    fn busy_flags_are_exclusive() {
        let s = tcp_session();
        assert!(s.try_begin_read());
        assert!(!s.try_begin_read());
        assert!(s.try_begin_write());
        s.end_read();
        assert!(s.try_begin_read());
        assert!(s.is_busy_write());
    }

    #[test]
    fn write_block_lifts_on_new_edge() {
        let s = tcp_session();
        assert!(s.can_write());
        let gen = s.writable_generation();
        s.block_writes(gen);
        assert!(!s.can_write());
        s.mark_writable();
        assert!(s.can_write());
        s.clear_write_block();
        assert!(s.can_write());
    }

    #[test]
    fn read_pending_is_consumed_once() {
        let s = tcp_session();
        s.mark_readable();
        assert!(s.take_read_pending());
        assert!(!s.take_read_pending());
    }

    #[test]
    fn state_follows_flags() {
        let s = tcp_session();
        assert_eq!(s.state(), SessionState::SynReceived);
        s.set_established(true);
        assert_eq!(s.state(), SessionState::Established);
        s.set_client_fin();
        assert_eq!(s.state(), SessionState::CloseWait);
        s.set_acked_to_fin(true);
        assert_eq!(s.state(), SessionState::FinWait);
        s.set_aborting(true);
        assert_eq!(s.state(), SessionState::Aborting);
        assert!(s.mark_closed());
        assert!(!s.mark_closed());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn deferred_fin_is_claimed_once() {
        let s = tcp_session();
        s.set_send_unacked(100);
        s.set_send_next(105);
        assert!(!s.defer_fin_while_in_flight());
        assert!(s.is_closing_connection());
        assert_eq!(s.state(), SessionState::FinWait);
        assert!(s.take_closing_connection());
        assert!(!s.take_closing_connection());

        s.set_send_unacked(105);
        assert!(s.defer_fin_while_in_flight());
        assert!(!s.is_closing_connection());
    }

    #[test]
    fn reset_is_claimed_once() {
        let s = tcp_session();
        assert!(s.claim_reset());
        assert!(!s.claim_reset());
    }

    #[test]
    fn timestamps_only_when_enabled() {
        let s = tcp_session();
        assert_eq!(s.reply_timestamp(), None);
        s.update_timestamps(Some(TcpTimestamp { sender: 5, reply_to: 0 }));
        assert_eq!(s.reply_timestamp(), None);
        s.enable_timestamps(TcpTimestamp { sender: 10, reply_to: 0 });
        s.update_timestamps(Some(TcpTimestamp { sender: 11, reply_to: 0 }));
        assert_eq!(s.reply_timestamp().map(|t| t.reply_to), Some(11));
    }

    #[test]
    fn unacked_data_keeps_last_segment() {
        let s = tcp_session();
        s.set_unacked_data(Bytes::from_static(b"first"));
        s.set_unacked_data(Bytes::from_static(b"seg"));
        assert_eq!(&s.unacked_data()[..], b"seg");
    }
}
