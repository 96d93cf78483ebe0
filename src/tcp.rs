//! # TCP Transport
//!
//! [`Transport`] over tokio TCP sockets.
//!
//! ## Framing
//!
//! ```text
//! ┌────────────────┬─────────────────────┐
//! │ len: u32 (BE)  │ body: len bytes     │
//! └────────────────┴─────────────────────┘
//! ```
//!
//! Frames larger than `MAX_ENVELOPE_SIZE` are rejected on read and the
//! connection is closed with an error event.
//!
//! ## Tasks
//!
//! - one accept task per listener, ending when the [`Listener`] is dropped
//! - one I/O task per connection end, running reader and writer halves until
//!   either side fails or the remote closes

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messages::MAX_ENVELOPE_SIZE;
use crate::transport::{
    ACCEPT_BACKLOG, Connection, ConnectionEvent, ConnectionId, ConnectionIds, Link, LinkState, LinkStatus,
    Listener, Transport,
};

#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    ids: Arc<ConnectionIds>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: SocketAddr) -> Result<Listener> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let local_addr = listener.local_addr().context("failed to get local address")?;

        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let ids = self.ids.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = incoming_tx.closed() => {
                        debug!(%local_addr, "listener dropped, accept loop exiting");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                let (connection, outbound_rx) = Connection::new(ids.next(), peer, LinkState::Open);
                                let (event_tx, event_rx) = mpsc::unbounded_channel();
                                tokio::spawn(run_stream(
                                    connection.id(),
                                    connection.status(),
                                    stream,
                                    outbound_rx,
                                    event_tx,
                                ));
                                if incoming_tx.send(Link { connection, events: event_rx }).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(%local_addr, error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(Listener::new(local_addr, incoming_rx))
    }

    fn connect(&self, addr: SocketAddr) -> Link {
        let (connection, outbound_rx) = Connection::new(self.ids.next(), addr, LinkState::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let id = connection.id();
        let status = connection.status();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    status.mark_open();
                    let _ = event_tx.send(ConnectionEvent::Open);
                    run_stream(id, status, stream, outbound_rx, event_tx).await;
                }
                Err(e) => {
                    status.mark_closed();
                    let _ = event_tx.send(ConnectionEvent::Error(e.to_string()));
                }
            }
        });

        Link { connection, events: event_rx }
    }
}

async fn run_stream(
    id: ConnectionId,
    status: LinkStatus,
    stream: TcpStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let write_loop = async {
        while let Some(frame) = outbound_rx.recv().await {
            write_frame(&mut writer, &frame).await?;
        }
        Ok::<(), io::Error>(())
    };

    let read_loop = async {
        while let Some(frame) = read_frame(&mut reader).await? {
            trace!(connection = id, len = frame.len(), "frame received");
            if event_tx.send(ConnectionEvent::Message(frame)).is_err() {
                break;
            }
        }
        Ok::<(), io::Error>(())
    };

    let result = tokio::select! {
        res = write_loop => res,
        res = read_loop => res,
    };

    status.mark_closed();
    if let Err(e) = result {
        let _ = event_tx.send(ConnectionEvent::Error(e.to_string()));
    }
    let _ = event_tx.send(ConnectionEvent::Closed);
    debug!(connection = id, "connection finished");
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    if frame.len() > MAX_ENVELOPE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds maximum {}", frame.len(), MAX_ENVELOPE_SIZE),
        ));
    }
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await
}

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary.
async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_ENVELOPE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds maximum {}", len, MAX_ENVELOPE_SIZE),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}
