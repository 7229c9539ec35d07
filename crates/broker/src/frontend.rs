//! Frontend listener: client connections
//!
//! Every accepted client gets a fresh identity, a `Welcome` frame, and a
//! task that forwards its requests to the broker loop. The channel to the
//! loop is bounded, so a saturated broker stops reading from clients.

use crate::connection::{accept_loop, write_loop};
use crate::identity::ClientId;
use relayq_common::error::{RelayError, Result};
use relayq_proto::{read_frame, ClientFrame, FrontendFrame, Payload};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A client request as held by the broker
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Connection the reply must go back to
    pub client_identity: ClientId,

    /// Request body
    pub payload: Payload,

    /// Position in the global arrival order
    pub arrival_order: u64,

    /// Ingestion time
    pub arrived_at: Instant,
}

/// Assigns strictly increasing arrival numbers at ingestion
#[derive(Debug, Default)]
pub struct ArrivalSequencer {
    next: u64,
}

impl ArrivalSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn a raw request into a [`ClientRequest`] with the next arrival number
    pub fn ingest(&mut self, client_identity: ClientId, payload: Payload) -> ClientRequest {
        let arrival_order = self.next;
        self.next += 1;

        ClientRequest {
            client_identity,
            payload,
            arrival_order,
            arrived_at: Instant::now(),
        }
    }
}

/// Events emitted by client connections
#[derive(Debug)]
pub enum FrontendEvent {
    /// A client connected; frames sent on `outbound` reach it in order
    Connected {
        client: ClientId,
        outbound: mpsc::UnboundedSender<FrontendFrame>,
    },

    /// A client sent a request
    Request { client: ClientId, payload: Payload },

    /// A client connection ended
    Disconnected { client: ClientId },
}

/// Listener accepting client connections
pub struct FrontendListener {
    listener: TcpListener,
}

impl FrontendListener {
    /// Bind the frontend address
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| {
                RelayError::connection(format!("Failed to bind frontend {}: {}", address, e))
            })?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the future is dropped
    pub async fn run(self, events: mpsc::Sender<FrontendEvent>) {
        accept_loop(self.listener, "Frontend", ClientId::new, move |stream, client| {
            serve_client(stream, client, events.clone())
        })
        .await
    }
}

/// Drive one client connection until either side closes it
async fn serve_client(
    mut stream: TcpStream,
    client: ClientId,
    events: mpsc::Sender<FrontendEvent>,
) -> Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    outbound_tx
        .send(FrontendFrame::Welcome {
            identity: client.to_string(),
        })
        .map_err(|_| RelayError::channel_closed("client outbound"))?;

    events
        .send(FrontendEvent::Connected {
            client,
            outbound: outbound_tx,
        })
        .await
        .map_err(|_| RelayError::channel_closed("frontend events"))?;

    let (mut reader, mut writer) = stream.split();
    let result = tokio::select! {
        read = forward_requests(&mut reader, client, &events) => read,
        written = write_loop(&mut writer, &mut outbound_rx) => written.map_err(RelayError::from),
    };

    let _ = events.send(FrontendEvent::Disconnected { client }).await;
    result
}

async fn forward_requests<R>(
    reader: &mut R,
    client: ClientId,
    events: &mpsc::Sender<FrontendEvent>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = read_frame::<_, ClientFrame>(reader).await? {
        match frame {
            ClientFrame::Request { payload } => {
                events
                    .send(FrontendEvent::Request { client, payload })
                    .await
                    .map_err(|_| RelayError::channel_closed("frontend events"))?;
            }
        }
    }
    Ok(())
}
