//! relayq broker
//!
//! Dynamic request/reply broker: clients connect to the frontend, workers to
//! the backend, and each request is handed to the least recently assigned
//! idle worker. Workers may join and leave at any time.

pub mod backend;
pub mod broker;
mod connection;
pub mod dispatcher;
pub mod frontend;
pub mod identity;
pub mod registry;
pub mod routing;

pub use broker::Broker;
pub use dispatcher::{DispatchResult, Dispatcher, PendingAssignment};
pub use frontend::{ArrivalSequencer, ClientRequest};
pub use identity::{ClientId, WorkerId};
pub use registry::{Availability, WorkerHandle, WorkerRegistry};
pub use routing::{BrokerCore, BrokerStats, Effect, LoopState, ShutdownReport};
