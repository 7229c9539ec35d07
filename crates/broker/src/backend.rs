//! Backend listener: worker connections
//!
//! Workers connect, receive a `Welcome`, and announce themselves with
//! `Ready`. From then on the broker pushes requests and the worker pushes
//! exactly one reply per request.

use crate::connection::{accept_loop, write_loop};
use crate::identity::WorkerId;
use relayq_common::error::{RelayError, Result};
use relayq_proto::{read_frame, BackendFrame, Payload, WorkerFrame};
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Events emitted by worker connections
#[derive(Debug)]
pub enum BackendEvent {
    /// A worker connected; frames sent on `outbound` reach it in order
    Connected {
        worker: WorkerId,
        outbound: mpsc::UnboundedSender<BackendFrame>,
    },

    /// A worker announced it is available
    Ready { worker: WorkerId, name: Option<String> },

    /// A worker answered a request
    Reply { worker: WorkerId, payload: Payload },

    /// A worker connection ended
    Disconnected { worker: WorkerId },
}

/// Listener accepting worker connections
pub struct BackendListener {
    listener: TcpListener,
}

impl BackendListener {
    /// Bind the backend address
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| {
                RelayError::connection(format!("Failed to bind backend {}: {}", address, e))
            })?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept workers until the future is dropped
    pub async fn run(self, events: mpsc::Sender<BackendEvent>) {
        accept_loop(self.listener, "Backend", WorkerId::new, move |stream, worker| {
            serve_worker(stream, worker, events.clone())
        })
        .await
    }
}

/// Drive one worker connection until either side closes it
async fn serve_worker(
    mut stream: TcpStream,
    worker: WorkerId,
    events: mpsc::Sender<BackendEvent>,
) -> Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    outbound_tx
        .send(BackendFrame::Welcome {
            identity: worker.to_string(),
        })
        .map_err(|_| RelayError::channel_closed("worker outbound"))?;

    events
        .send(BackendEvent::Connected {
            worker,
            outbound: outbound_tx,
        })
        .await
        .map_err(|_| RelayError::channel_closed("backend events"))?;

    let (mut reader, mut writer) = stream.split();
    let result = tokio::select! {
        read = forward_worker_frames(&mut reader, worker, &events) => read,
        written = write_loop(&mut writer, &mut outbound_rx) => written.map_err(RelayError::from),
    };

    let _ = events.send(BackendEvent::Disconnected { worker }).await;
    result
}

async fn forward_worker_frames<R>(
    reader: &mut R,
    worker: WorkerId,
    events: &mpsc::Sender<BackendEvent>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = read_frame::<_, WorkerFrame>(reader).await? {
        let event = match frame {
            WorkerFrame::Ready { name } => BackendEvent::Ready { worker, name },
            WorkerFrame::Reply { payload } => BackendEvent::Reply { worker, payload },
        };

        events
            .send(event)
            .await
            .map_err(|_| RelayError::channel_closed("backend events"))?;
    }
    Ok(())
}
