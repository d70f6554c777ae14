//! Per-client session state
//!
//! A session is created on accept and destroyed on peer close, I/O error,
//! exclusive takeover, or a self-issued terminate command. The read side
//! runs as a background task feeding the multiplexer's event channel; the
//! write side stays with the multiplexer for direct best-effort fan-out.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::READ_CHUNK;
use crate::escape::EscapeFilter;

/// Opaque session handle, unique for the life of the server
pub type ClientId = u64;

/// What a client's reader task reports to the multiplexer
#[derive(Debug)]
pub enum ClientEvent {
    /// A chunk of inbound bytes
    Data(Bytes),
    /// Peer EOF or read error
    Closed,
}

pub struct ClientSession {
    pub id: ClientId,
    /// Escape interpreter state, private to this client
    pub filter: EscapeFilter,
    /// Inherited from server config at accept time
    pub raw: bool,
    /// Captured once, for status reports
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl ClientSession {
    /// Take ownership of an accepted stream: capture addresses, spawn the
    /// reader task, keep the write half for fan-out.
    pub fn spawn(
        id: ClientId,
        stream: TcpStream,
        esc: u8,
        raw: bool,
        events: mpsc::Sender<(ClientId, ClientEvent)>,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(id, read_half, events));

        Self {
            id,
            filter: EscapeFilter::new(esc),
            raw,
            peer_addr,
            local_addr,
            writer,
            reader,
        }
    }

    /// Best-effort write: a slow or dead peer loses bytes rather than
    /// stalling the loop. The reader task surfaces the eventual EOF.
    pub fn send(&self, mut buf: &[u8]) {
        while !buf.is_empty() {
            match self.writer.try_write(buf) {
                Ok(0) => return,
                Ok(n) => buf = &buf[n..],
                Err(_) => return,
            }
        }
    }

    /// Tear the session down, stopping the reader task.
    pub fn shutdown(self) {
        self.reader.abort();
    }
}

async fn read_loop(
    id: ClientId,
    mut half: OwnedReadHalf,
    events: mpsc::Sender<(ClientId, ClientEvent)>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send((id, ClientEvent::Closed)).await;
                return;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if events.send((id, ClientEvent::Data(chunk))).await.is_err() {
                    return;
                }
            }
        }
    }
}
