//! Sharepool Relay
//!
//! Redundant block propagation for a decentralized mining-pool node. Besides
//! handing a found block to its local full node, the pool pushes it straight
//! to a maintained set of well-connected peers of the same network, and to
//! any configured RPC daemons, so one slow or failing path cannot cost the
//! block.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SHAREPOOL RELAY                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Peer Store (JSON snapshot)  ←── scored peers per chain     │
//! │  Connection Manager          ←── protected + ranked links   │
//! │  Discovery                   ←── local node list + gossip   │
//! │  Broadcaster                 ←── parallel fan-out + RPC     │
//! │  Health/Status               ←── advisory, read-only        │
//! │  HTTP API (9080)             ←── status, metrics, blocks    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{ChainConfig, RelayNodeConfig, RelaySettings};
pub use error::{ErrorClass, RelayError};
pub use relay::{RelayHandle, RelayIo, RelayParams};
