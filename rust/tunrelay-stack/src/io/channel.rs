//! Outbound sockets backing sessions.
//!
//! Sockets are created through `socket2` so the platform can protect the
//! descriptor before any packet leaves, then handed to mio in non-blocking
//! mode. Registration goes through the raw descriptor, which lets a shared
//! `Arc<Channel>` be registered and deregistered without exclusive access.

use std::io;
use std::net::{Shutdown, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpStream, UdpSocket};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::platform::SocketProtector;

/// Non-blocking socket connected (or connecting) to a session's remote end.
#[derive(Debug)]
pub enum Channel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

fn protect(socket: &Socket, protector: &dyn SocketProtector) {
    let fd = socket.as_raw_fd();
    if !protector.protect(fd) {
        warn!("Failed to protect socket fd={}, traffic may loop into the tunnel", fd);
    }
}

fn start_connect(socket: &Socket, dest: SocketAddrV4) -> io::Result<()> {
    match socket.connect(&SocketAddr::V4(dest).into()) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

impl Channel {
    /// Protected, non-blocking TCP socket with its connect in progress.
    pub fn open_tcp(dest: SocketAddrV4, protector: &dyn SocketProtector) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        protect(&socket, protector);
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        start_connect(&socket, dest)?;
        let std_stream: std::net::TcpStream = socket.into();
        Ok(Channel::Tcp(TcpStream::from_std(std_stream)))
    }

    /// Protected, non-blocking UDP socket connected to `dest`.
    pub fn open_udp(dest: SocketAddrV4, protector: &dyn SocketProtector) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        protect(&socket, protector);
        socket.set_nonblocking(true)?;
        socket.connect(&SocketAddr::V4(dest).into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Channel::Udp(UdpSocket::from_std(std_socket)))
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Channel::Tcp(_))
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        let fd = self.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    /// Poll a pending connect: `Ok(true)` once connected, `Ok(false)` while
    /// still in progress.
    pub fn finish_connect(&self) -> io::Result<bool> {
        match self {
            Channel::Udp(_) => Ok(true),
            Channel::Tcp(stream) => {
                if let Some(e) = stream.take_error()? {
                    return Err(e);
                }
                match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Best-effort close of both directions.
    pub fn shutdown(&self) {
        if let Channel::Tcp(stream) = self {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Channel::Tcp(s) => s.as_raw_fd(),
            Channel::Udp(s) => s.as_raw_fd(),
        }
    }
}
