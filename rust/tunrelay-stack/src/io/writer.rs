//! Client-to-remote worker.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use mio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use super::engine::EngineShared;
use super::Channel;
use crate::session::Session;

pub(crate) fn write_to_remote(shared: &EngineShared, session: &Arc<Session>) {
    let Some(channel) = session.channel() else { return };
    let generation = session.writable_generation();
    session.set_data_ready(false);
    let chunks: VecDeque<Bytes> = session.drain_send_queue().into();
    if chunks.is_empty() {
        return;
    }

    let flushed = match channel.as_ref() {
        Channel::Tcp(stream) => write_tcp(shared, session, stream, chunks, generation),
        Channel::Udp(socket) => write_udp(shared, session, socket, chunks, generation),
    };
    if !flushed {
        return;
    }

    session.clear_write_block();
    session.touch();
    if session.has_client_fin() && !session.has_outgoing() {
        debug!("{}: flushed after client FIN, closing", session.key());
        session.set_aborting(true);
    }
}

/// Put the unwritten remainder back and wait for the next writable edge.
fn park(session: &Session, rest: VecDeque<Bytes>, generation: u64) {
    trace!("{}: remote socket full, {} chunks parked", session.key(), rest.len());
    session.requeue_outgoing(rest);
    session.block_writes(generation);
    session.set_data_ready(true);
}

fn write_tcp(
    shared: &EngineShared,
    session: &Arc<Session>,
    stream: &TcpStream,
    mut chunks: VecDeque<Bytes>,
    generation: u64,
) -> bool {
    let mut writer = stream;
    while let Some(mut chunk) = chunks.pop_front() {
        while chunk.has_remaining() {
            match writer.write(chunk.chunk()) {
                Ok(0) => {
                    debug!("{}: remote accepted no bytes", session.key());
                    shared.reset_client(session);
                    session.set_aborting(true);
                    return false;
                }
                Ok(n) => {
                    chunk.advance(n);
                    shared.stats.record_to_remote(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    chunks.push_front(chunk);
                    park(session, chunks, generation);
                    return false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{}: remote write failed: {}", session.key(), e);
                    shared.reset_client(session);
                    session.set_aborting(true);
                    return false;
                }
            }
        }
    }
    true
}

fn write_udp(
    shared: &EngineShared,
    session: &Arc<Session>,
    socket: &UdpSocket,
    mut chunks: VecDeque<Bytes>,
    generation: u64,
) -> bool {
    while let Some(datagram) = chunks.pop_front() {
        match socket.send(&datagram) {
            Ok(n) => shared.stats.record_to_remote(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                chunks.push_front(datagram);
                park(session, chunks, generation);
                return false;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => chunks.push_front(datagram),
            Err(e) => {
                debug!("{}: datagram send failed: {}", session.key(), e);
                session.set_aborting(true);
                return false;
            }
        }
    }
    true
}
