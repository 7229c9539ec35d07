//! Worker connection to the broker backend
//!
//! A session performs the `Welcome`/`Ready` handshake, then answers every
//! request the broker pushes with exactly one reply.

use crate::handler::RequestHandler;
use relayq_common::config::WorkerConfig;
use relayq_common::error::{RelayError, Result};
use relayq_common::metrics::LatencyTimer;
use relayq_common::METRICS;
use relayq_proto::{read_frame, write_frame, BackendFrame, WorkerFrame};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Why a session stopped serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The configured reply budget was used up
    ReplyLimit,

    /// The broker closed the connection
    BrokerClosed,
}

/// Summary of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub replies: u64,
    pub end: SessionEnd,
}

/// A connected, registered worker
pub struct WorkerSession {
    stream: TcpStream,
    identity: String,
    name: Option<String>,
}

impl WorkerSession {
    /// Connect to the backend and announce readiness
    pub async fn connect(address: &str, name: Option<String>) -> Result<Self> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| {
                RelayError::connection(format!("Failed to connect to backend {}: {}", address, e))
            })?;

        let identity = match read_frame::<_, BackendFrame>(&mut stream).await? {
            Some(BackendFrame::Welcome { identity }) => identity,
            Some(other) => {
                return Err(RelayError::connection(format!(
                    "Expected welcome from broker, got {:?}",
                    other
                )))
            }
            None => {
                return Err(RelayError::connection(
                    "Broker closed the connection during handshake",
                ))
            }
        };

        write_frame(&mut stream, &WorkerFrame::Ready { name: name.clone() }).await?;
        info!("Worker {} registered with broker at {}", identity, address);

        Ok(Self { stream, identity, name })
    }

    /// Identity assigned by the broker
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Name used in logs: the configured name, else the identity
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.identity)
    }

    /// Answer requests until the broker closes or `max_replies` is reached
    ///
    /// The connection is closed on return, which removes the worker from the
    /// broker's pool.
    pub async fn serve<H: RequestHandler>(
        mut self,
        mut handler: H,
        max_replies: Option<u64>,
    ) -> Result<SessionSummary> {
        let mut replies = 0u64;

        while max_replies.map_or(true, |max| replies < max) {
            let frame = match read_frame::<_, BackendFrame>(&mut self.stream).await? {
                Some(frame) => frame,
                None => {
                    info!("{}: broker closed the connection", self.display_name());
                    return Ok(SessionSummary {
                        replies,
                        end: SessionEnd::BrokerClosed,
                    });
                }
            };

            match frame {
                BackendFrame::Request { payload } => {
                    let reply = METRICS.worker.handle_duration.time(|| handler.handle(&payload));
                    write_frame(&mut self.stream, &WorkerFrame::Reply { payload: reply }).await?;

                    replies += 1;
                    METRICS.worker.replies_sent.inc();
                    debug!("{}: sent reply {}", self.display_name(), replies);
                }
                BackendFrame::Welcome { .. } => {
                    warn!("{}: ignoring repeated welcome", self.display_name());
                }
            }
        }

        info!(
            "{}: reply limit of {} reached, leaving the pool",
            self.display_name(),
            replies
        );
        Ok(SessionSummary {
            replies,
            end: SessionEnd::ReplyLimit,
        })
    }
}

/// Connect with `config` and serve until the session ends
pub async fn run_worker<H: RequestHandler>(
    config: &WorkerConfig,
    handler: H,
) -> Result<SessionSummary> {
    let session = WorkerSession::connect(&config.backend_address, config.name.clone()).await?;
    session.serve(handler, config.max_replies).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayq_proto::Payload;
    use tokio::net::TcpListener;

    /// Minimal stand-in for the broker backend
    async fn fake_backend() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_handshake_then_reply_limit() {
        let (listener, addr) = fake_backend().await;

        let backend = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, &BackendFrame::Welcome { identity: "worker-1".into() })
                .await
                .unwrap();

            let ready: Option<WorkerFrame> = read_frame(&mut stream).await.unwrap();
            assert_eq!(ready, Some(WorkerFrame::Ready { name: Some("rep".into()) }));

            let mut replies = Vec::new();
            for body in [&b"one"[..], &b"two"[..]] {
                write_frame(&mut stream, &BackendFrame::Request { payload: body.to_vec() })
                    .await
                    .unwrap();
                match read_frame::<_, WorkerFrame>(&mut stream).await.unwrap() {
                    Some(WorkerFrame::Reply { payload }) => replies.push(payload),
                    other => panic!("expected reply, got {:?}", other),
                }
            }

            // The worker leaves after two replies
            let end: Option<WorkerFrame> = read_frame(&mut stream).await.unwrap();
            assert!(end.is_none());
            replies
        });

        let session = WorkerSession::connect(&addr, Some("rep".into())).await.unwrap();
        assert_eq!(session.identity(), "worker-1");
        assert_eq!(session.display_name(), "rep");

        let summary = session
            .serve(|payload: &[u8]| -> Payload { payload.to_ascii_uppercase() }, Some(2))
            .await
            .unwrap();

        assert_eq!(
            summary,
            SessionSummary {
                replies: 2,
                end: SessionEnd::ReplyLimit
            }
        );
        assert_eq!(backend.await.unwrap(), vec![b"ONE".to_vec(), b"TWO".to_vec()]);
    }

    #[tokio::test]
    async fn test_broker_close_ends_session() {
        let (listener, addr) = fake_backend().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, &BackendFrame::Welcome { identity: "worker-2".into() })
                .await
                .unwrap();
            let _ready: Option<WorkerFrame> = read_frame(&mut stream).await.unwrap();
        });

        let session = WorkerSession::connect(&addr, None).await.unwrap();
        assert_eq!(session.display_name(), "worker-2");

        let summary = session.serve(|p: &[u8]| p.to_vec(), None).await.unwrap();
        assert_eq!(summary.end, SessionEnd::BrokerClosed);
        assert_eq!(summary.replies, 0);
    }

    #[tokio::test]
    async fn test_handshake_requires_welcome() {
        let (listener, addr) = fake_backend().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, &BackendFrame::Request { payload: vec![] })
                .await
                .unwrap();
        });

        let result = WorkerSession::connect(&addr, None).await;
        assert!(matches!(result, Err(RelayError::Connection(_))));
    }
}
