//! Framed TCP transport
//!
//! Each link runs two tasks: a writer draining an outbound queue, and a
//! reader dispatching inbound frames to the link's event sink. Pings are
//! answered by the reader directly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::protocol::{read_frame, write_frame, InvItem, WireMessage, PROTOCOL_VERSION};
use super::{PeerEventSink, PeerLink, PeerTransport};
use crate::error::RelayError;
use crate::types::PeerEndpoint;

/// Outbound queue depth per link
const OUTBOUND_QUEUE: usize = 64;

/// Dials peers over plain TCP using one network's magic
pub struct TcpTransport {
    magic: [u8; 4],
    user_agent: String,
}

impl TcpTransport {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            user_agent: format!("/sharepool-relay:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn connect(
        &self,
        endpoint: &PeerEndpoint,
        sink: Arc<dyn PeerEventSink>,
    ) -> Result<Arc<dyn PeerLink>, RelayError> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| RelayError::from_connect(endpoint, e))?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let link = TcpLink::start(endpoint.clone(), self.magic, reader, writer, sink);

        link.send(WireMessage::Hello {
            version: PROTOCOL_VERSION,
            user_agent: self.user_agent.clone(),
        })
        .await?;

        Ok(link)
    }
}

struct Outgoing {
    message: WireMessage,
    ack: Option<oneshot::Sender<Result<(), RelayError>>>,
}

/// One live TCP link
pub struct TcpLink {
    endpoint: PeerEndpoint,
    outbound: mpsc::Sender<Outgoing>,
    alive: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpLink {
    fn start(
        endpoint: PeerEndpoint,
        magic: [u8; 4],
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        sink: Arc<dyn PeerEventSink>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));

        let writer_task = tokio::spawn(run_writer(
            endpoint.clone(),
            magic,
            writer,
            rx,
            alive.clone(),
        ));
        let reader_task = tokio::spawn(run_reader(
            endpoint.clone(),
            magic,
            reader,
            tx.clone(),
            sink,
            alive.clone(),
        ));

        Arc::new(Self {
            endpoint,
            outbound: tx,
            alive,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        })
    }

    /// Queue a message and wait until it has been written
    async fn send(&self, message: WireMessage) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::LinkClosed(self.endpoint.clone()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outgoing {
                message,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| RelayError::LinkClosed(self.endpoint.clone()))?;

        ack_rx
            .await
            .map_err(|_| RelayError::LinkClosed(self.endpoint.clone()))?
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    async fn send_block(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.send(WireMessage::Block {
            payload: payload.to_vec(),
        })
        .await
    }

    async fn request_addrs(&self) -> Result<(), RelayError> {
        self.send(WireMessage::GetAddr).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.abort_tasks();
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn run_writer(
    endpoint: PeerEndpoint,
    magic: [u8; 4],
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outgoing>,
    alive: Arc<AtomicBool>,
) {
    while let Some(outgoing) = rx.recv().await {
        let result = write_frame(&mut writer, magic, &outgoing.message).await;
        let failed = result.is_err();

        if let Err(e) = &result {
            debug!("Write to {} failed: {}", endpoint, e);
        }
        if let Some(ack) = outgoing.ack {
            let _ = ack.send(result);
        }
        if failed {
            break;
        }
    }
    alive.store(false, Ordering::SeqCst);
}

async fn run_reader(
    endpoint: PeerEndpoint,
    magic: [u8; 4],
    mut reader: OwnedReadHalf,
    outbound: mpsc::Sender<Outgoing>,
    sink: Arc<dyn PeerEventSink>,
    alive: Arc<AtomicBool>,
) {
    let reason = loop {
        let message = match read_frame(&mut reader, magic).await {
            Ok(message) => message,
            Err(e) => break e.to_string(),
        };
        trace!("{} -> {}", endpoint, message.name());

        match message {
            WireMessage::Addr { addrs } => sink.on_gossip(addrs),
            WireMessage::Inv { items } => {
                for item in items {
                    match item {
                        InvItem::Block(hash) => sink.on_block_inv(hash),
                        InvItem::Tx(_) => sink.on_tx_inv(),
                    }
                }
            }
            WireMessage::Ping { nonce } => {
                sink.on_ping();
                let pong = Outgoing {
                    message: WireMessage::Pong { nonce },
                    ack: None,
                };
                if outbound.try_send(pong).is_err() {
                    debug!("Dropping pong to {}: outbound queue full", endpoint);
                }
            }
            WireMessage::Hello { version, user_agent } => {
                debug!("{} speaks v{} ({})", endpoint, version, user_agent);
            }
            // We only push blocks and never serve an address book
            WireMessage::Block { .. } | WireMessage::GetAddr | WireMessage::Pong { .. } => {}
        }
    };

    alive.store(false, Ordering::SeqCst);
    debug!("Link to {} closed: {}", endpoint, reason);
    sink.on_disconnect(&reason);
}
