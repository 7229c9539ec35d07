//! Broker routing state machine
//!
//! `BrokerCore` owns the worker registry, the FIFO of requests waiting for a
//! worker, and the pending assignments. It performs no I/O: each event
//! returns the frames the caller must deliver, which keeps every routing
//! decision synchronous and testable.
//!
//! A client has at most one request queued or in flight. Requests it sends
//! before that one is answered are held back, so replies on a connection
//! always come back in request order.

use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::frontend::{ArrivalSequencer, ClientRequest};
use crate::identity::{ClientId, WorkerId};
use crate::registry::WorkerRegistry;
use relayq_common::METRICS;
use relayq_proto::Payload;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Lifecycle of the broker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, not yet routing
    Idle,

    /// Multiplexing frontend and backend events
    Routing,

    /// Shut down; queued and in-flight work was dropped
    Terminated,
}

/// A frame the broker loop must deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Forward a request payload to a worker
    ToWorker { worker: WorkerId, payload: Payload },

    /// Deliver a reply payload to a client
    ToClient { client: ClientId, payload: Payload },
}

/// Point-in-time view of broker occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub queued: usize,
    /// Requests waiting behind an earlier request from the same client
    pub held: usize,
    pub pending: usize,
    pub registered_workers: usize,
    pub idle_workers: usize,
    pub connected_clients: usize,
}

/// Work dropped when the broker shut down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Requests a worker was processing; their clients get no reply
    pub abandoned_assignments: usize,

    /// Requests that never reached a worker, held ones included
    pub discarded_requests: usize,
}

/// Routing state owned by the broker loop
#[derive(Debug)]
pub struct BrokerCore {
    state: LoopState,
    registry: WorkerRegistry,
    dispatcher: Dispatcher,
    queue: VecDeque<ClientRequest>,
    sequencer: ArrivalSequencer,
    /// Clients with a request queued or in flight
    busy_clients: HashSet<ClientId>,
    /// Later requests of busy clients, oldest first
    held: HashMap<ClientId, VecDeque<ClientRequest>>,
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerCore {
    pub fn new() -> Self {
        Self {
            state: LoopState::Idle,
            registry: WorkerRegistry::new(),
            dispatcher: Dispatcher::new(),
            queue: VecDeque::new(),
            sequencer: ArrivalSequencer::new(),
            busy_clients: HashSet::new(),
            held: HashMap::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Enter the routing state
    pub fn start(&mut self) {
        if self.state == LoopState::Idle {
            self.state = LoopState::Routing;
        }
    }

    /// A client request arrived at the frontend
    pub fn on_client_request(&mut self, client: ClientId, payload: Payload) -> Vec<Effect> {
        let request = self.sequencer.ingest(client, payload);
        METRICS.broker.requests_received.inc();

        if !self.busy_clients.insert(client) {
            debug!(
                "Request #{} from {} held until its previous request is answered",
                request.arrival_order, client
            );
            self.held.entry(client).or_default().push_back(request);
            self.update_gauges();
            return Vec::new();
        }

        debug!("Request #{} from {} queued", request.arrival_order, client);
        self.queue.push_back(request);
        self.pump()
    }

    /// A client connection closed
    ///
    /// Its held requests are dropped. A request already queued or in flight
    /// still runs; its reply is discarded by the caller.
    pub fn on_client_gone(&mut self, client: ClientId) {
        self.busy_clients.remove(&client);
        if let Some(held) = self.held.remove(&client) {
            if !held.is_empty() {
                debug!("Dropping {} held requests from {}", held.len(), client);
            }
        }
        self.update_gauges();
    }

    /// A worker announced it is available
    ///
    /// A worker re-announcing while it holds an assignment has given up on
    /// that request; the assignment is abandoned rather than overwritten.
    pub fn on_worker_ready(&mut self, worker: WorkerId) -> Vec<Effect> {
        if let Some(assignment) = self.dispatcher.abandon(worker) {
            warn!(
                "{} announced readiness while processing request #{} from {}; assignment abandoned",
                worker, assignment.request.arrival_order, assignment.request.client_identity
            );
            METRICS.broker.assignments_abandoned.inc();
        }

        if self.registry.register_or_touch(worker) {
            info!("{} joined the pool ({} workers)", worker, self.registry.len());
        }
        self.pump()
    }

    /// A worker sent a reply
    ///
    /// Replies without a matching assignment are logged and dropped.
    pub fn on_worker_reply(&mut self, worker: WorkerId, payload: Payload) -> Vec<Effect> {
        if !self.registry.contains(worker) {
            self.registry.register_or_touch(worker);
            info!("{} joined the pool ({} workers)", worker, self.registry.len());
        }

        let outcome = self.dispatcher.on_worker_reply(worker, payload, &mut self.registry);
        let mut effects = match outcome {
            Ok(reply) => {
                debug!(
                    "{} answered request #{} in {:?}",
                    worker, reply.arrival_order, reply.round_trip
                );
                METRICS.broker.worker_round_trip.observe(reply.round_trip.as_secs_f64());
                self.release_next(reply.client);
                vec![Effect::ToClient {
                    client: reply.client,
                    payload: reply.payload,
                }]
            }
            Err(e) => {
                warn!("Dropping reply: {}", e);
                METRICS.broker.unknown_worker_replies.inc();
                Vec::new()
            }
        };

        effects.extend(self.pump());
        effects
    }

    /// A worker connection closed
    ///
    /// The request it was processing, if any, is never answered, and the
    /// client's held requests stay held until the client disconnects.
    pub fn on_worker_gone(&mut self, worker: WorkerId) {
        if self.registry.remove(worker).is_some() {
            info!("{} left the pool ({} workers)", worker, self.registry.len());
        }

        if let Some(assignment) = self.dispatcher.abandon(worker) {
            warn!(
                "{} left while processing request #{} from {}; the client will not be answered",
                worker, assignment.request.arrival_order, assignment.request.client_identity
            );
            METRICS.broker.assignments_abandoned.inc();
        }
        self.update_gauges();
    }

    /// Forwarding to `worker` failed because its connection already closed
    ///
    /// The request never reached the worker, so it goes back into the queue
    /// at its arrival position.
    pub fn on_forward_failed(&mut self, worker: WorkerId) -> Vec<Effect> {
        if let Some(request) = self.dispatcher.reclaim(worker, &mut self.registry) {
            debug!("Requeueing request #{} after {} went away", request.arrival_order, worker);
            self.requeue(request);
        }
        self.pump()
    }

    /// The client's outstanding request was answered; queue its next one
    fn release_next(&mut self, client: ClientId) {
        match self.held.get_mut(&client).and_then(VecDeque::pop_front) {
            Some(next) => self.requeue(next),
            None => {
                self.held.remove(&client);
                self.busy_clients.remove(&client);
            }
        }
    }

    fn held_count(&self) -> usize {
        self.held.values().map(VecDeque::len).sum()
    }

    fn requeue(&mut self, request: ClientRequest) {
        let position = self
            .queue
            .iter()
            .position(|queued| queued.arrival_order > request.arrival_order)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, request);
    }

    /// Dispatch queued requests, oldest first, while idle workers remain
    fn pump(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        while let Some(request) = self.queue.pop_front() {
            let waited = request.arrived_at.elapsed();
            match self.dispatcher.dispatch(request, &mut self.registry) {
                DispatchResult::Dispatched { worker, payload } => {
                    METRICS.broker.requests_dispatched.inc();
                    METRICS.broker.queue_wait.observe(waited.as_secs_f64());
                    effects.push(Effect::ToWorker { worker, payload });
                }
                DispatchResult::Queued(request) => {
                    self.queue.push_front(request);
                    break;
                }
            }
        }

        self.update_gauges();
        effects
    }

    fn update_gauges(&self) {
        METRICS.broker.queue_depth.set((self.queue.len() + self.held_count()) as i64);
        METRICS.broker.registered_workers.set(self.registry.len() as i64);
        METRICS.broker.idle_workers.set(self.registry.idle_count() as i64);
    }

    /// Current occupancy; `connected_clients` is filled in by the loop
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            queued: self.queue.len(),
            held: self.held_count(),
            pending: self.dispatcher.len(),
            registered_workers: self.registry.len(),
            idle_workers: self.registry.idle_count(),
            connected_clients: 0,
        }
    }

    /// Stop routing, dropping queued and in-flight work
    pub fn shutdown(&mut self) -> ShutdownReport {
        self.state = LoopState::Terminated;

        let report = ShutdownReport {
            abandoned_assignments: self.dispatcher.abandon_all(),
            discarded_requests: self.queue.len() + self.held_count(),
        };
        self.queue.clear();
        self.held.clear();
        self.busy_clients.clear();
        self.update_gauges();

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_worker(worker: WorkerId, payload: &[u8]) -> Effect {
        Effect::ToWorker {
            worker,
            payload: payload.to_vec(),
        }
    }

    fn to_client(client: ClientId, payload: &[u8]) -> Effect {
        Effect::ToClient {
            client,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut core = BrokerCore::new();
        assert_eq!(core.state(), LoopState::Idle);

        core.start();
        assert_eq!(core.state(), LoopState::Routing);

        core.shutdown();
        assert_eq!(core.state(), LoopState::Terminated);

        core.start();
        assert_eq!(core.state(), LoopState::Terminated);
    }

    #[test]
    fn test_two_clients_one_worker_served_in_arrival_order() {
        let mut core = BrokerCore::new();
        let (c1, c2, w1) = (ClientId::new(), ClientId::new(), WorkerId::new());
        core.start();

        assert!(core.on_worker_ready(w1).is_empty());
        assert_eq!(core.on_client_request(c1, b"A".to_vec()), vec![to_worker(w1, b"A")]);
        assert!(core.on_client_request(c2, b"B".to_vec()).is_empty());
        assert_eq!(core.stats().queued, 1);

        assert_eq!(
            core.on_worker_reply(w1, b"A-done".to_vec()),
            vec![to_client(c1, b"A-done"), to_worker(w1, b"B")]
        );
        assert_eq!(
            core.on_worker_reply(w1, b"B-done".to_vec()),
            vec![to_client(c2, b"B-done")]
        );
        assert_eq!(core.stats().pending, 0);
    }

    #[test]
    fn test_each_client_gets_its_own_reply_when_workers_suffice() {
        let mut core = BrokerCore::new();
        let workers: Vec<WorkerId> = (0..3).map(|_| WorkerId::new()).collect();
        let clients: Vec<ClientId> = (0..3).map(|_| ClientId::new()).collect();
        for worker in &workers {
            core.on_worker_ready(*worker);
        }

        let mut assigned = Vec::new();
        for (i, client) in clients.iter().enumerate() {
            let effects = core.on_client_request(*client, vec![i as u8]);
            match effects.as_slice() {
                [Effect::ToWorker { worker, payload }] => assigned.push((*worker, payload.clone())),
                other => panic!("expected one dispatch, got {:?}", other),
            }
        }

        // Reply in reverse order; correlation must not depend on timing
        for (worker, payload) in assigned.iter().rev() {
            let index = payload[0] as usize;
            assert_eq!(
                core.on_worker_reply(*worker, payload.clone()),
                vec![Effect::ToClient {
                    client: clients[index],
                    payload: payload.clone()
                }]
            );
        }
    }

    #[test]
    fn test_queued_requests_are_fifo() {
        let mut core = BrokerCore::new();
        let w1 = WorkerId::new();
        core.on_worker_ready(w1);

        for i in 0..5u8 {
            core.on_client_request(ClientId::new(), vec![i]);
        }

        let mut served = Vec::new();
        for _ in 0..5 {
            let effects = core.on_worker_reply(w1, b"ok".to_vec());
            served.extend(effects.into_iter().filter_map(|e| match e {
                Effect::ToWorker { payload, .. } => Some(payload[0]),
                Effect::ToClient { .. } => None,
            }));
        }

        assert_eq!(served, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_stray_reply_is_dropped_and_worker_stays_idle() {
        let mut core = BrokerCore::new();
        let (w1, client) = (WorkerId::new(), ClientId::new());
        core.on_worker_ready(w1);

        assert!(core.on_worker_reply(w1, b"duplicate".to_vec()).is_empty());
        assert_eq!(core.stats().idle_workers, 1);

        assert_eq!(core.on_client_request(client, b"A".to_vec()), vec![to_worker(w1, b"A")]);
    }

    #[test]
    fn test_reply_from_unseen_worker_registers_it() {
        let mut core = BrokerCore::new();
        let (w1, client) = (WorkerId::new(), ClientId::new());

        assert!(core.on_worker_reply(w1, b"hello".to_vec()).is_empty());
        assert_eq!(core.stats().registered_workers, 1);
        assert_eq!(core.on_client_request(client, b"A".to_vec()), vec![to_worker(w1, b"A")]);
    }

    #[test]
    fn test_reregistering_idle_worker_does_not_double_count() {
        let mut core = BrokerCore::new();
        let w1 = WorkerId::new();
        core.on_worker_ready(w1);
        core.on_worker_ready(w1);

        assert_eq!(core.stats().registered_workers, 1);
        assert_eq!(
            core.on_client_request(ClientId::new(), b"A".to_vec()),
            vec![to_worker(w1, b"A")]
        );
        assert!(core.on_client_request(ClientId::new(), b"B".to_vec()).is_empty());
    }

    #[test]
    fn test_late_joiner_takes_oldest_queued_request() {
        let mut core = BrokerCore::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        let (c1, c2, c3) = (ClientId::new(), ClientId::new(), ClientId::new());
        core.on_worker_ready(w1);

        assert_eq!(core.on_client_request(c1, b"1".to_vec()), vec![to_worker(w1, b"1")]);
        assert!(core.on_client_request(c2, b"2".to_vec()).is_empty());
        assert!(core.on_client_request(c3, b"3".to_vec()).is_empty());

        assert_eq!(core.on_worker_ready(w2), vec![to_worker(w2, b"2")]);
        assert_eq!(
            core.on_worker_reply(w1, b"1-done".to_vec()),
            vec![to_client(c1, b"1-done"), to_worker(w1, b"3")]
        );
    }

    #[test]
    fn test_worker_leaving_mid_request_abandons_it() {
        let mut core = BrokerCore::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        let client = ClientId::new();
        core.on_worker_ready(w1);
        core.on_client_request(client, b"A".to_vec());

        core.on_worker_gone(w1);
        assert_eq!(core.stats(), BrokerStats::default());

        // The abandoned request is not retried on the next worker
        assert!(core.on_worker_ready(w2).is_empty());
    }

    #[test]
    fn test_ready_while_busy_abandons_assignment() {
        let mut core = BrokerCore::new();
        let w1 = WorkerId::new();
        core.on_worker_ready(w1);
        core.on_client_request(ClientId::new(), b"A".to_vec());
        core.on_client_request(ClientId::new(), b"B".to_vec());

        assert_eq!(core.on_worker_ready(w1), vec![to_worker(w1, b"B")]);
        assert_eq!(core.stats().pending, 1);
        assert_eq!(core.stats().queued, 0);
    }

    #[test]
    fn test_failed_forward_requeues_at_arrival_position() {
        let mut core = BrokerCore::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        let (c1, c2, c3) = (ClientId::new(), ClientId::new(), ClientId::new());
        core.on_worker_ready(w1);
        core.on_worker_ready(w2);

        assert_eq!(core.on_client_request(c1, b"1".to_vec()), vec![to_worker(w1, b"1")]);
        assert_eq!(core.on_client_request(c2, b"2".to_vec()), vec![to_worker(w2, b"2")]);
        assert!(core.on_client_request(c3, b"3".to_vec()).is_empty());

        // w1 vanished before "1" was written; it must run before "3"
        assert!(core.on_forward_failed(w1).is_empty());
        assert_eq!(core.stats().queued, 2);
        assert_eq!(
            core.on_worker_reply(w2, b"2-done".to_vec()),
            vec![to_client(c2, b"2-done"), to_worker(w2, b"1")]
        );
    }

    #[test]
    fn test_shutdown_reports_dropped_work() {
        let mut core = BrokerCore::new();
        let w1 = WorkerId::new();
        let (c1, c2) = (ClientId::new(), ClientId::new());
        core.start();
        core.on_worker_ready(w1);
        core.on_client_request(c1, b"A".to_vec());
        core.on_client_request(c1, b"B".to_vec());
        core.on_client_request(c2, b"C".to_vec());

        let report = core.shutdown();

        assert_eq!(
            report,
            ShutdownReport {
                abandoned_assignments: 1,
                discarded_requests: 2,
            }
        );
        assert_eq!(core.stats().queued, 0);
        assert_eq!(core.stats().held, 0);
        assert_eq!(core.stats().pending, 0);
    }

    #[test]
    fn test_pipelined_requests_wait_for_previous_reply() {
        let mut core = BrokerCore::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        let client = ClientId::new();
        core.on_worker_ready(w1);
        core.on_worker_ready(w2);

        assert_eq!(core.on_client_request(client, b"A".to_vec()), vec![to_worker(w1, b"A")]);

        // w2 is idle, but B must not run alongside A
        assert!(core.on_client_request(client, b"B".to_vec()).is_empty());
        assert_eq!(core.stats().held, 1);
        assert_eq!(core.stats().idle_workers, 1);

        assert_eq!(
            core.on_worker_reply(w1, b"A-done".to_vec()),
            vec![to_client(client, b"A-done"), to_worker(w2, b"B")]
        );
        assert_eq!(
            core.on_worker_reply(w2, b"B-done".to_vec()),
            vec![to_client(client, b"B-done")]
        );
        assert_eq!(core.stats().held, 0);

        // The client is free again
        assert_eq!(core.on_client_request(client, b"C".to_vec()), vec![to_worker(w1, b"C")]);
    }

    #[test]
    fn test_released_request_keeps_its_arrival_position() {
        let mut core = BrokerCore::new();
        let w1 = WorkerId::new();
        let (c1, c2) = (ClientId::new(), ClientId::new());
        core.on_worker_ready(w1);

        assert_eq!(core.on_client_request(c1, b"A".to_vec()), vec![to_worker(w1, b"A")]);
        assert!(core.on_client_request(c1, b"B".to_vec()).is_empty());
        assert!(core.on_client_request(c2, b"C".to_vec()).is_empty());

        // B arrived before C, so it runs first once A is answered
        assert_eq!(
            core.on_worker_reply(w1, b"A-done".to_vec()),
            vec![to_client(c1, b"A-done"), to_worker(w1, b"B")]
        );
        assert_eq!(
            core.on_worker_reply(w1, b"B-done".to_vec()),
            vec![to_client(c1, b"B-done"), to_worker(w1, b"C")]
        );
    }

    #[test]
    fn test_departed_client_drops_held_requests() {
        let mut core = BrokerCore::new();
        let w1 = WorkerId::new();
        let client = ClientId::new();
        core.on_worker_ready(w1);
        core.on_client_request(client, b"A".to_vec());
        core.on_client_request(client, b"B".to_vec());
        core.on_client_request(client, b"C".to_vec());
        assert_eq!(core.stats().held, 2);

        core.on_client_gone(client);
        assert_eq!(core.stats().held, 0);

        // A still completes; the loop drops the reply for the gone client
        assert_eq!(
            core.on_worker_reply(w1, b"A-done".to_vec()),
            vec![to_client(client, b"A-done")]
        );
        assert_eq!(core.stats().idle_workers, 1);
        assert_eq!(core.stats().pending, 0);
    }
}
