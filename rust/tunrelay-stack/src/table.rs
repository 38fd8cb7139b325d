//! Session table
//!
//! Flows are keyed by their 4-tuple. A second index maps the multiplexer
//! token of each session's socket back to its key, so readiness events
//! resolve to sessions without scanning.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mio::{Registry, Token};
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::error::{RelayError, Result};
use crate::io::channel::Channel;
use crate::platform::SocketProtector;
use crate::session::{Protocol, Session};
use crate::stats::StackStats;

/// First token handed to sessions; lower values are reserved for the
/// engine's own sources.
pub const FIRST_SESSION_TOKEN: usize = 16;

/// Flow identity: remote endpoint plus client endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub dest: SocketAddrV4,
    pub src: SocketAddrV4,
}

impl SessionKey {
    pub fn new(dest: SocketAddrV4, src: SocketAddrV4) -> Self {
        Self { dest, src }
    }

    pub fn from_parts(dest_ip: Ipv4Addr, dest_port: u16, src_ip: Ipv4Addr, src_port: u16) -> Self {
        Self::new(SocketAddrV4::new(dest_ip, dest_port), SocketAddrV4::new(src_ip, src_port))
    }
}

/// Rendered as `src-dest`, e.g. `10.0.0.2:50000-93.184.216.34:443`.
impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.src, self.dest)
    }
}

/// Concurrent map of live sessions
pub struct SessionTable {
    sessions: DashMap<SessionKey, Arc<Session>>,
    tokens: DashMap<Token, SessionKey>,
    registry: Registry,
    protector: Arc<dyn SocketProtector>,
    stats: Arc<StackStats>,
    next_token: AtomicUsize,
    tcp_idle: Duration,
    udp_idle: Duration,
}

impl SessionTable {
    pub fn new(
        registry: Registry,
        protector: Arc<dyn SocketProtector>,
        stats: Arc<StackStats>,
        config: &StackConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            registry,
            protector,
            stats,
            next_token: AtomicUsize::new(FIRST_SESSION_TOKEN),
            tcp_idle: config.tcp.idle_timeout(),
            udp_idle: config.udp.idle_timeout(),
        }
    }

    pub fn get(&self, dest_ip: Ipv4Addr, dest_port: u16, src_ip: Ipv4Addr, src_port: u16) -> Option<Arc<Session>> {
        self.get_by_key(&SessionKey::from_parts(dest_ip, dest_port, src_ip, src_port))
    }

    pub fn get_by_key(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Session owning the socket registered under `token`.
    pub fn get_by_token(&self, token: Token) -> Option<Arc<Session>> {
        let key = *self.tokens.get(&token)?.value();
        self.get_by_key(&key)
    }

    /// Create a TCP session and start connecting its socket.
    pub fn create_tcp(&self, key: SessionKey) -> Result<Arc<Session>> {
        self.create(key, Protocol::Tcp)
    }

    /// Create a UDP session with a connected socket.
    pub fn create_udp(&self, key: SessionKey) -> Result<Arc<Session>> {
        self.create(key, Protocol::Udp)
    }

    fn create(&self, key: SessionKey, protocol: Protocol) -> Result<Arc<Session>> {
        let vacant = match self.sessions.entry(key) {
            Entry::Occupied(_) => return Err(RelayError::SessionExists(key)),
            Entry::Vacant(v) => v,
        };

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(key, protocol, token));

        let opened = match protocol {
            Protocol::Tcp => Channel::open_tcp(key.dest, self.protector.as_ref()),
            Protocol::Udp => Channel::open_udp(key.dest, self.protector.as_ref()),
        }
        .and_then(|channel| {
            channel.register(&self.registry, token)?;
            Ok(channel)
        });

        match opened {
            Ok(channel) => {
                if protocol == Protocol::Udp {
                    session.set_connected(true);
                }
                session.attach_channel(Arc::new(channel));
            }
            Err(e) => {
                warn!("{} {}: cannot open socket to {}: {}", protocol, key, key.dest, e);
                self.stats.record_connect_failure();
                session.set_aborting(true);
            }
        }

        self.tokens.insert(token, key);
        vacant.insert(Arc::clone(&session));
        self.stats.record_session_opened(protocol);
        info!("{} session created: {} ({:?})", protocol, key, token);
        Ok(session)
    }

    /// Close the session stored under `key`. Returns `false` if there was
    /// none or it was already closed.
    pub fn close_by_key(&self, key: &SessionKey) -> bool {
        match self.get_by_key(key) {
            Some(session) => self.close_session(&session),
            None => false,
        }
    }

    /// Remove `session`, deregister and close its socket. Idempotent; a
    /// newer session stored under the same key is left alone.
    pub fn close_session(&self, session: &Arc<Session>) -> bool {
        if !session.mark_closed() {
            return false;
        }
        self.sessions.remove_if(session.key(), |_, current| Arc::ptr_eq(current, session));
        self.tokens.remove(&session.token());
        if let Some(channel) = session.take_channel() {
            if let Err(e) = channel.deregister(&self.registry) {
                debug!("deregister {} failed: {}", session.key(), e);
            }
            channel.shutdown();
        }
        self.stats.record_session_closed(session.protocol());
        debug!("{} session closed: {}", session.protocol(), session.key());
        true
    }

    /// Refresh the session's last-access time.
    pub fn touch(&self, session: &Session) {
        session.touch();
    }

    /// Close aborting sessions and sessions idle past their protocol's
    /// timeout. Returns how many were closed.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                let limit = match session.protocol() {
                    Protocol::Tcp => self.tcp_idle,
                    Protocol::Udp => self.udp_idle,
                };
                session.is_aborting() || session.idle_for(now) > limit
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut closed = 0;
        for session in expired {
            if self.close_session(&session) {
                self.stats.record_reaped();
                closed += 1;
            }
        }
        if closed > 0 {
            debug!("reaped {} sessions, {} remain", closed, self.len());
        }
        closed
    }

    /// Close every session.
    pub fn close_all(&self) {
        for session in self.sessions() {
            self.close_session(&session);
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NoProtection;
    use mio::Poll;
    use std::net::TcpListener;

    fn table_with(config: &StackConfig) -> (Poll, SessionTable) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let table = SessionTable::new(registry, Arc::new(NoProtection), Arc::new(StackStats::new()), config);
        (poll, table)
    }

    fn udp_key(src_port: u16) -> SessionKey {
        SessionKey::from_parts(Ipv4Addr::LOCALHOST, 9, Ipv4Addr::new(10, 0, 0, 2), src_port)
    }

    #[test]
    fn key_renders_source_first() {
        let key = SessionKey::from_parts(Ipv4Addr::new(0, 0, 0, 1), 2, Ipv4Addr::new(0, 0, 0, 3), 4);
        assert_eq!(key.to_string(), "0.0.0.3:4-0.0.0.1:2");
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (_poll, table) = table_with(&StackConfig::default());
        let first = table.create_udp(udp_key(1000)).unwrap();
        assert!(first.is_connected());
        let err = table.create_udp(udp_key(1000)).unwrap_err();
        assert!(matches!(err, RelayError::SessionExists(k) if k == udp_key(1000)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lookups_agree() {
        let (_poll, table) = table_with(&StackConfig::default());
        let session = table.create_udp(udp_key(1001)).unwrap();
        let by_parts = table.get(Ipv4Addr::LOCALHOST, 9, Ipv4Addr::new(10, 0, 0, 2), 1001).unwrap();
        let by_token = table.get_by_token(session.token()).unwrap();
        assert!(Arc::ptr_eq(&session, &by_parts));
        assert!(Arc::ptr_eq(&session, &by_token));
        assert!(table.get_by_token(Token(1)).is_none());
    }

    #[test]
    fn tcp_session_starts_unconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (_poll, table) = table_with(&StackConfig::default());
        let key = SessionKey::from_parts(Ipv4Addr::LOCALHOST, port, Ipv4Addr::new(10, 0, 0, 2), 50000);
        let session = table.create_tcp(key).unwrap();
        assert!(!session.is_connected());
        assert!(session.channel().is_some());
        assert!(!session.is_aborting());
    }

    #[test]
    fn close_is_idempotent() {
        let (_poll, table) = table_with(&StackConfig::default());
        let session = table.create_udp(udp_key(1002)).unwrap();
        assert!(table.close_session(&session));
        assert!(!table.close_session(&session));
        assert!(!table.close_by_key(&udp_key(1002)));
        assert!(table.is_empty());
        assert!(table.get_by_token(session.token()).is_none());
        assert!(session.channel().is_none());
    }

    #[test]
    fn closing_stale_session_keeps_replacement() {
        let (_poll, table) = table_with(&StackConfig::default());
        let old = table.create_udp(udp_key(1003)).unwrap();
        assert!(table.close_session(&old));
        let new = table.create_udp(udp_key(1003)).unwrap();
        assert!(!table.close_session(&old));
        assert!(Arc::ptr_eq(&table.get_by_key(&udp_key(1003)).unwrap(), &new));
    }

    #[test]
    fn reap_closes_aborting_and_idle() {
        let mut config = StackConfig::default();
        config.udp.idle_timeout_secs = 0;
        let (_poll, table) = table_with(&config);
        let aborting = table.create_udp(udp_key(1004)).unwrap();
        aborting.set_aborting(true);
        table.create_udp(udp_key(1005)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(table.reap(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn reap_keeps_fresh_sessions() {
        let (_poll, table) = table_with(&StackConfig::default());
        let session = table.create_udp(udp_key(1006)).unwrap();
        table.touch(&session);
        assert_eq!(table.reap(), 0);
        assert_eq!(table.len(), 1);
    }
}
