//! relayq common library
//!
//! This crate contains shared code used across relayq components.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
