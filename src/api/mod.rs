//! HTTP API Module
//!
//! Health, status and metrics for every chain's relay, plus the block
//! submission endpoint used by the consensus engine.

mod routes;
mod metrics;

pub use routes::{router, run_api_server, ApiState};
pub use metrics::Metrics;
