//! relayq worker
//!
//! Backend peer for the relayq broker. A worker connects, announces itself
//! and answers requests until the broker goes away or its reply budget runs
//! out, at which point it leaves the pool.

pub mod handler;
pub mod session;

pub use handler::{Greeter, RequestHandler};
pub use session::{run_worker, SessionEnd, SessionSummary, WorkerSession};
