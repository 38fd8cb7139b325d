//! Remote-to-client worker.

use std::io::{self, Read};
use std::sync::Arc;

use mio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace, warn};

use super::engine::EngineShared;
use super::{write_to_client, Channel};
use crate::handler::DEFAULT_CLIENT_MSS;
use crate::packet::tcp::TIMESTAMP_OPTION_LEN;
use crate::session::Session;

pub(crate) fn read_from_remote(shared: &EngineShared, session: &Arc<Session>) {
    let Some(channel) = session.channel() else { return };
    match channel.as_ref() {
        Channel::Tcp(stream) => read_tcp(shared, session, stream),
        Channel::Udp(socket) => read_udp(shared, session, socket),
    }
}

fn read_tcp(shared: &EngineShared, session: &Arc<Session>, stream: &TcpStream) {
    session.take_read_pending();
    let mut buf = vec![0u8; shared.read_chunk];

    loop {
        let room = session.send_window().saturating_sub(session.bytes_in_flight()) as usize;
        if room == 0 {
            // resumed by the ACK that opens the window
            session.mark_readable();
            shared.stats.record_window_full();
            trace!("{}: client window full", session.key());
            return;
        }
        let want = room.min(buf.len());

        let mut reader = stream;
        match reader.read(&mut buf[..want]) {
            Ok(0) => {
                on_remote_eof(shared, session);
                return;
            }
            Ok(n) => {
                shared.stats.record_from_remote(n);
                session.set_received_last_segment(n < want);
                session.append_incoming(&buf[..n]);
                push_to_client(shared, session);
                session.touch();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("{}: remote read failed: {}", session.key(), e);
                shared.reset_client(session);
                session.set_aborting(true);
                return;
            }
        }
    }
}

/// Segment the incoming buffer into data packets for the client.
fn push_to_client(shared: &EngineShared, session: &Arc<Session>) {
    let Some((ip, tcp)) = session.last_tcp_headers() else {
        warn!("{}: no client header to answer, dropping remote data", session.key());
        session.take_incoming(usize::MAX);
        return;
    };

    let mut max_segment = usize::from(session.mss());
    if session.reply_timestamp().is_some() {
        max_segment = max_segment.saturating_sub(TIMESTAMP_OPTION_LEN);
    }
    if max_segment == 0 {
        max_segment = usize::from(DEFAULT_CLIENT_MSS);
    }

    while session.has_incoming() {
        let chunk = session.take_incoming(max_segment);
        let push = !session.has_incoming() && session.has_received_last_segment();
        let seq = session.advance_send_next(chunk.len() as u32);
        let packet = shared.builder.data(
            &ip,
            &tcp,
            seq,
            session.rec_sequence(),
            &chunk,
            push,
            session.reply_timestamp(),
        );
        session.set_unacked_data(chunk);
        write_to_client(shared.writer.as_ref(), &shared.stats, &packet);
    }
}

/// The remote closed its side. The FIN goes out now if the client has
/// acknowledged everything, otherwise on its next ACK.
fn on_remote_eof(shared: &EngineShared, session: &Arc<Session>) {
    session.set_remote_eof();
    if !session.defer_fin_while_in_flight() {
        debug!("{}: remote closed, FIN deferred behind unacknowledged data", session.key());
        return;
    }
    let Some((ip, tcp)) = session.last_tcp_headers() else {
        session.set_aborting(true);
        return;
    };
    debug!("{}: remote closed, sending FIN", session.key());
    let seq = session.advance_send_next(1);
    let fin = shared.builder.remote_fin(&ip, &tcp, seq, session.rec_sequence());
    session.set_acked_to_fin(true);
    write_to_client(shared.writer.as_ref(), &shared.stats, &fin);
}

fn read_udp(shared: &EngineShared, session: &Arc<Session>, socket: &UdpSocket) {
    session.take_read_pending();
    let mut buf = vec![0u8; shared.max_datagram];

    loop {
        match socket.recv(&mut buf) {
            Ok(n) => {
                let Some((ip, udp)) = session.last_udp_headers() else { return };
                shared.stats.record_from_remote(n);
                let reply = shared.builder.udp_reply(&ip, &udp, &buf[..n]);
                write_to_client(shared.writer.as_ref(), &shared.stats, &reply);
                session.touch();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("{}: datagram receive failed: {}", session.key(), e);
                session.set_aborting(true);
                return;
            }
        }
    }
}
