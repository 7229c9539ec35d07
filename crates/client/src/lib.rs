//! relayq client
//!
//! Frontend peer for the relayq broker. Requests are issued in lockstep:
//! `request` sends one payload and waits for its reply before returning, so
//! a connection never has more than one request outstanding.

use relayq_common::config::ClientConfig;
use relayq_common::error::{RelayError, Result};
use relayq_proto::{read_frame, write_frame, ClientFrame, FrontendFrame, Payload};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// A connection to the broker frontend
pub struct Client {
    stream: TcpStream,
    identity: String,
}

impl Client {
    /// Connect to the frontend and wait for the broker's welcome
    pub async fn connect(address: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| {
                RelayError::connection(format!("Failed to connect to frontend {}: {}", address, e))
            })?;

        let identity = match read_frame::<_, FrontendFrame>(&mut stream).await? {
            Some(FrontendFrame::Welcome { identity }) => identity,
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

        info!("Client {} connected to broker at {}", identity, address);
        Ok(Self { stream, identity })
    }

    /// Identity assigned by the broker
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send a request and wait for its reply
    ///
    /// There is no timeout: if the worker handling the request dies, this
    /// waits until the broker closes the connection.
    pub async fn request(&mut self, payload: impl Into<Payload>) -> Result<Payload> {
        write_frame(&mut self.stream, &ClientFrame::Request { payload: payload.into() }).await?;

        loop {
            match read_frame::<_, FrontendFrame>(&mut self.stream).await? {
                Some(FrontendFrame::Reply { payload }) => return Ok(payload),
                Some(FrontendFrame::Welcome { .. }) => {
                    debug!("{}: ignoring repeated welcome", self.identity)
                }
                None => {
                    return Err(RelayError::connection(
                        "Broker closed the connection before replying",
                    ))
                }
            }
        }
    }
}

/// Send `config.requests` greetings, pausing `config.interval()` between them
///
/// Returns the replies in the order they arrived.
pub async fn run_client(config: &ClientConfig) -> Result<Vec<Payload>> {
    let mut client = Client::connect(&config.frontend_address).await?;
    let greeting = format!("{} says: Hi!", client.identity());
    let mut replies = Vec::with_capacity(config.requests as usize);

    for n in 0..config.requests {
        if n > 0 {
            tokio::time::sleep(config.interval()).await;
        }
        let reply = client.request(greeting.clone().into_bytes()).await?;
        info!("{} received: {}", client.identity(), String::from_utf8_lossy(&reply));
        replies.push(reply);
    }

    Ok(replies)
}
