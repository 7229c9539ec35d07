//! Backend dispatching and reply correlation
//!
//! The dispatcher hands requests to idle workers and remembers, per worker,
//! which client request it is working on, so that the worker's reply can be
//! routed back to the right client.

use crate::frontend::ClientRequest;
use crate::identity::{ClientId, WorkerId};
use crate::registry::WorkerRegistry;
use relayq_common::error::{RelayError, Result};
use relayq_proto::Payload;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A request currently being processed by a worker
#[derive(Debug)]
pub struct PendingAssignment {
    /// The request the worker received
    pub request: ClientRequest,

    /// The worker processing it
    pub worker: WorkerId,

    /// When the request was handed to the worker
    pub dispatched_at: Instant,
}

/// Outcome of a dispatch attempt
#[derive(Debug)]
pub enum DispatchResult {
    /// The request was assigned; `payload` must be forwarded to `worker`
    Dispatched { worker: WorkerId, payload: Payload },

    /// No worker is idle; the request is handed back to the caller
    Queued(ClientRequest),
}

/// A worker reply matched with the request it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedReply {
    pub client: ClientId,
    pub payload: Payload,
    pub arrival_order: u64,
    pub round_trip: Duration,
}

/// Correlates in-flight requests with the workers processing them
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: HashMap<WorkerId, PendingAssignment>,
}

impl Dispatcher {
    /// Create a dispatcher with no assignments
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `request` to the least recently assigned idle worker
    pub fn dispatch(
        &mut self,
        request: ClientRequest,
        registry: &mut WorkerRegistry,
    ) -> DispatchResult {
        let Some(worker) = registry.select_idle_worker().map(|w| w.identity) else {
            return DispatchResult::Queued(request);
        };

        debug_assert!(!self.pending.contains_key(&worker), "idle worker holds an assignment");
        registry.mark_busy(worker);

        debug!(
            "Dispatching request #{} from {} to {}",
            request.arrival_order, request.client_identity, worker
        );

        let payload = request.payload.clone();
        self.pending.insert(
            worker,
            PendingAssignment {
                request,
                worker,
                dispatched_at: Instant::now(),
            },
        );

        DispatchResult::Dispatched { worker, payload }
    }

    /// Match a worker reply with its pending assignment and free the worker
    ///
    /// Fails with [`RelayError::UnknownWorkerReply`] when the worker holds no
    /// assignment; the worker's state is left untouched in that case.
    pub fn on_worker_reply(
        &mut self,
        worker: WorkerId,
        payload: Payload,
        registry: &mut WorkerRegistry,
    ) -> Result<CompletedReply> {
        let assignment = self
            .pending
            .remove(&worker)
            .ok_or_else(|| RelayError::unknown_worker_reply(worker))?;

        registry.mark_idle(worker);

        Ok(CompletedReply {
            client: assignment.request.client_identity,
            payload,
            arrival_order: assignment.request.arrival_order,
            round_trip: assignment.dispatched_at.elapsed(),
        })
    }

    /// Drop the assignment held by `worker`, returning it
    pub fn abandon(&mut self, worker: WorkerId) -> Option<PendingAssignment> {
        self.pending.remove(&worker)
    }

    /// Take back the request handed to a worker that never received it
    ///
    /// The worker is removed from `registry`; its request is returned so the
    /// caller can queue it again.
    pub fn reclaim(
        &mut self,
        worker: WorkerId,
        registry: &mut WorkerRegistry,
    ) -> Option<ClientRequest> {
        registry.remove(worker);
        self.pending.remove(&worker).map(|assignment| assignment.request)
    }

    /// Drop every in-flight assignment, returning how many were dropped
    pub fn abandon_all(&mut self) -> usize {
        let abandoned = self.pending.len();
        self.pending.clear();
        abandoned
    }

    /// Whether `worker` currently holds an assignment
    pub fn is_pending(&self, worker: WorkerId) -> bool {
        self.pending.contains_key(&worker)
    }

    /// Number of in-flight assignments
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
