//! The broker loop
//!
//! A single task owns all routing state and multiplexes two event sources:
//! client connections on the frontend and worker connections on the backend.
//! Connection tasks talk to it only through channels, so no lock guards the
//! registry, the request queue or the pending assignments.

use crate::backend::{BackendEvent, BackendListener};
use crate::frontend::{FrontendEvent, FrontendListener};
use crate::identity::{ClientId, WorkerId};
use crate::routing::{BrokerCore, BrokerStats, Effect, ShutdownReport};
use relayq_common::config::BrokerConfig;
use relayq_common::error::{RelayError, Result};
use relayq_common::METRICS;
use relayq_proto::{BackendFrame, FrontendFrame};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A bound broker, ready to run
pub struct Broker {
    frontend: FrontendListener,
    backend: BackendListener,
    queue_capacity: usize,
    stats: watch::Sender<BrokerStats>,
}

impl Broker {
    /// Bind the frontend and backend addresses
    pub async fn bind(config: &BrokerConfig) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(RelayError::config("Broker queue capacity must be positive"));
        }

        let frontend = FrontendListener::bind(&config.frontend_address).await?;
        let backend = BackendListener::bind(&config.backend_address).await?;
        let (stats, _) = watch::channel(BrokerStats::default());

        Ok(Self {
            frontend,
            backend,
            queue_capacity: config.queue_capacity,
            stats,
        })
    }

    /// Address clients connect to
    pub fn frontend_addr(&self) -> Result<SocketAddr> {
        self.frontend.local_addr()
    }

    /// Address workers connect to
    pub fn backend_addr(&self) -> Result<SocketAddr> {
        self.backend.local_addr()
    }

    /// Watch occupancy; a new value is published after every handled event
    pub fn subscribe(&self) -> watch::Receiver<BrokerStats> {
        self.stats.subscribe()
    }

    /// Route until `shutdown` resolves
    ///
    /// Queued requests and in-flight assignments are dropped on shutdown;
    /// the returned report says how many.
    pub async fn run<S>(self, shutdown: S) -> Result<ShutdownReport>
    where
        S: Future<Output = ()>,
    {
        let (frontend_tx, mut frontend_rx) = mpsc::channel(self.queue_capacity);
        let (backend_tx, mut backend_rx) = mpsc::channel(self.queue_capacity);

        let mut listeners = JoinSet::new();
        listeners.spawn(self.frontend.run(frontend_tx));
        listeners.spawn(self.backend.run(backend_tx));

        let mut state = BrokerLoop::new(self.stats);
        state.core.start();
        info!("Broker routing");

        tokio::pin!(shutdown);

        // After an event from one source, one ready event from the other is
        // serviced as well, so neither side starves the other.
        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                event = frontend_rx.recv() => match event {
                    Some(event) => {
                        state.on_frontend(event);
                        if let Ok(event) = backend_rx.try_recv() {
                            state.on_backend(event);
                        }
                    }
                    None => break Err(RelayError::channel_closed("frontend events")),
                },
                event = backend_rx.recv() => match event {
                    Some(event) => {
                        state.on_backend(event);
                        if let Ok(event) = frontend_rx.try_recv() {
                            state.on_frontend(event);
                        }
                    }
                    None => break Err(RelayError::channel_closed("backend events")),
                },
                Some(finished) = listeners.join_next() => {
                    break Err(RelayError::Internal(format!("Listener stopped: {:?}", finished)));
                }
            }
        };

        let report = state.core.shutdown();
        state.publish();
        listeners.shutdown().await;

        if report.abandoned_assignments > 0 || report.discarded_requests > 0 {
            warn!(
                "Broker stopped with {} in-flight and {} queued requests unanswered",
                report.abandoned_assignments, report.discarded_requests
            );
        }
        info!("Broker terminated");

        outcome.map(|()| report)
    }
}

/// State owned by the running loop
struct BrokerLoop {
    core: BrokerCore,
    clients: HashMap<ClientId, mpsc::UnboundedSender<FrontendFrame>>,
    workers: HashMap<WorkerId, mpsc::UnboundedSender<BackendFrame>>,
    stats: watch::Sender<BrokerStats>,
}

impl BrokerLoop {
    fn new(stats: watch::Sender<BrokerStats>) -> Self {
        Self {
            core: BrokerCore::new(),
            clients: HashMap::new(),
            workers: HashMap::new(),
            stats,
        }
    }

    fn on_frontend(&mut self, event: FrontendEvent) {
        match event {
            FrontendEvent::Connected { client, outbound } => {
                debug!("{} connected", client);
                self.clients.insert(client, outbound);
            }
            FrontendEvent::Request { client, payload } => {
                let effects = self.core.on_client_request(client, payload);
                self.apply(effects);
            }
            FrontendEvent::Disconnected { client } => {
                debug!("{} disconnected", client);
                self.clients.remove(&client);
                self.core.on_client_gone(client);
            }
        }
        METRICS.broker.connected_clients.set(self.clients.len() as i64);
        self.publish();
    }

    fn on_backend(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Connected { worker, outbound } => {
                debug!("{} connected", worker);
                self.workers.insert(worker, outbound);
            }
            BackendEvent::Ready { worker, name } => {
                if let Some(name) = name {
                    debug!("{} is ready as {}", worker, name);
                }
                let effects = self.core.on_worker_ready(worker);
                self.apply(effects);
            }
            BackendEvent::Reply { worker, payload } => {
                let effects = self.core.on_worker_reply(worker, payload);
                self.apply(effects);
            }
            BackendEvent::Disconnected { worker } => {
                debug!("{} disconnected", worker);
                self.workers.remove(&worker);
                self.core.on_worker_gone(worker);
            }
        }
        self.publish();
    }

    /// Deliver effects; a dead worker link puts its request back in the queue
    fn apply(&mut self, effects: Vec<Effect>) {
        let mut effects = VecDeque::from(effects);

        while let Some(effect) = effects.pop_front() {
            match effect {
                Effect::ToWorker { worker, payload } => {
                    let delivered = self
                        .workers
                        .get(&worker)
                        .is_some_and(|link| link.send(BackendFrame::Request { payload }).is_ok());

                    if !delivered {
                        self.workers.remove(&worker);
                        effects.extend(self.core.on_forward_failed(worker));
                    }
                }
                Effect::ToClient { client, payload } => {
                    let delivered = self
                        .clients
                        .get(&client)
                        .is_some_and(|link| link.send(FrontendFrame::Reply { payload }).is_ok());

                    if delivered {
                        METRICS.broker.replies_delivered.inc();
                    } else {
                        debug!("Reply for {} dropped: client is gone", client);
                        METRICS.broker.replies_undeliverable.inc();
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let next = BrokerStats {
            connected_clients: self.clients.len(),
            ..self.core.stats()
        };
        self.stats.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
