//! Transport seam
//!
//! The relay never touches sockets directly. It dials through a
//! [`PeerTransport`], talks to a live [`PeerLink`], and is told about inbound
//! traffic through a [`PeerEventSink`] registered at connect time.
//!
//! The local full node is reached through two more traits: [`LocalNode`] for
//! its peer list and [`BlockSubmitter`] for RPC block submission.

pub mod protocol;
pub mod tcp;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::RelayError;
use crate::types::{BlockHash, GossipAddr, LocalPeerInfo, PeerEndpoint};

pub use tcp::TcpTransport;

/// Inbound events from one live link.
///
/// Called from the link's reader task; implementations must not block.
pub trait PeerEventSink: Send + Sync {
    /// Peer relayed a peer-address message
    fn on_gossip(&self, addrs: Vec<GossipAddr>);

    /// Peer announced a block
    fn on_block_inv(&self, hash: BlockHash);

    /// Peer announced a transaction
    fn on_tx_inv(&self);

    fn on_ping(&self);

    /// Link went down; no further events follow
    fn on_disconnect(&self, reason: &str);
}

/// A live outbound connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn endpoint(&self) -> &PeerEndpoint;

    /// Send an opaque block payload. Resolves once the frame is written.
    async fn send_block(&self, payload: &[u8]) -> Result<(), RelayError>;

    /// Ask the peer for its address book
    async fn request_addrs(&self) -> Result<(), RelayError>;

    fn is_alive(&self) -> bool;

    /// Close the link. Idempotent.
    fn close(&self);
}

/// Opens links. Connect timeouts are applied by the caller.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        sink: Arc<dyn PeerEventSink>,
    ) -> Result<Arc<dyn PeerLink>, RelayError>;
}

/// Request/response access to the local full node's peer list
#[async_trait]
pub trait LocalNode: Send + Sync {
    async fn peer_info(&self) -> Result<Vec<LocalPeerInfo>, RelayError>;
}

/// An upstream daemon accepting blocks over RPC
#[async_trait]
pub trait BlockSubmitter: Send + Sync {
    /// Endpoint label used in reports and logs
    fn name(&self) -> &str;

    async fn submit_block(&self, payload: &[u8]) -> Result<(), RelayError>;
}
