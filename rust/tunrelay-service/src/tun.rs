//! The VPN tunnel descriptor handed over by the platform.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use parking_lot::Mutex;
use tracing::info;
use tunrelay_stack::ClientPacketWriter;

use crate::error::{Result, ServiceError};

/// Owned duplicate of the platform's tunnel descriptor, in non-blocking
/// mode so the ingest loop can notice shutdown.
#[derive(Debug)]
pub struct TunDevice {
    file: File,
}

impl TunDevice {
    /// Duplicate `fd`; the original stays owned by the platform.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(ServiceError::tunnel(format!(
                "Failed to duplicate VPN fd {}: {}",
                fd,
                io::Error::last_os_error()
            )));
        }
        // SAFETY: dup_fd is a freshly duplicated descriptor that we own
        let file = unsafe { File::from_raw_fd(dup_fd) };
        set_nonblocking(&file)?;
        info!("Duplicated VPN fd: {} -> {}", fd, dup_fd);
        Ok(Self { file })
    }

    /// Reader for the ingest loop and writer for the relay.
    pub fn split(self) -> Result<(File, TunWriter)> {
        let reader = self.file.try_clone()?;
        Ok((reader, TunWriter { file: Mutex::new(self.file) }))
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Serialises packet writes into the tunnel. Each write is one packet.
#[derive(Debug)]
pub struct TunWriter {
    file: Mutex<File>,
}

impl ClientPacketWriter for TunWriter {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        let written = file.write(packet)?;
        if written != packet.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short tunnel write: {} of {} bytes", written, packet.len()),
            ));
        }
        Ok(())
    }
}
