//! Message transports between the bridge and the remote host.
//!
//! A transport accepts one remote peer, hands every inbound message to a
//! [`MessageHandler`] on its own delivery loop, and queues outbound messages
//! for that peer. Nothing is queued while no peer is attached.
//!
//! # Architecture
//!
//! - **tcp**: length-prefixed JSON frames over a plain TCP connection
//! - **websocket**: JSON text frames over an axum WebSocket route
//!
//! Both run on a tokio runtime owned by the transport, so callers of
//! [`Transport`] stay synchronous. Do not call `start`/`stop` from inside
//! another tokio runtime.

pub mod tcp;
pub mod websocket;

pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

use crate::config::ProtocolConfig;
use crate::{BridgeError, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};

/// Callback invoked by a transport for inbound traffic.
///
/// Runs on the transport's delivery loop and must not block for long.
pub trait MessageHandler: Send + Sync {
    /// One decoded-to-text inbound message.
    fn on_message(&self, raw: &str);

    /// The remote peer went away.
    fn on_disconnect(&self) {}
}

/// Connection primitives used by the environment.
pub trait Transport: Send + Sync {
    /// Start listening on `addr`. Returns the bound address.
    fn start(&self, handler: Arc<dyn MessageHandler>, addr: SocketAddr) -> Result<SocketAddr>;

    /// Stop listening and drop any connected peer.
    fn stop(&self) -> Result<()>;

    /// Queue one message for the connected peer.
    ///
    /// Fails with [`BridgeError::RemoteEvaluation`] when no peer is attached.
    fn send(&self, message: String) -> Result<()>;
}

/// Outbound queue shared by the connections of one listener.
pub(crate) type OutboxReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>;

/// Peer attachment and the outbound queue of one listener.
///
/// Messages are accepted only while a peer is attached. Attaching, detaching
/// and queueing all happen under the same lock, so a message queued for a
/// peer that then goes away is discarded on detach and never reaches the
/// next peer.
pub(crate) struct PeerLink {
    peers: Mutex<usize>,
    tx: mpsc::UnboundedSender<String>,
    rx: OutboxReceiver,
}

impl PeerLink {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peers: Mutex::new(0),
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        })
    }

    /// Claim a peer slot. Returns false when `MAX_PEERS` are attached.
    pub fn attach(&self) -> bool {
        let Ok(mut peers) = self.peers.lock() else {
            return false;
        };
        if *peers >= ProtocolConfig::MAX_PEERS {
            return false;
        }
        *peers += 1;
        true
    }

    /// Release a peer slot. Once no peer is left, queued messages are
    /// dropped; returns how many.
    ///
    /// The connection's writer must have stopped before this is called.
    pub fn detach(&self) -> usize {
        let Ok(mut peers) = self.peers.lock() else {
            return 0;
        };
        *peers = peers.saturating_sub(1);
        if *peers > 0 {
            return 0;
        }
        let mut dropped = 0;
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        dropped
    }

    pub fn is_connected(&self) -> bool {
        self.peers.lock().map(|p| *p > 0).unwrap_or(false)
    }

    /// Queue `message` for the attached peer.
    pub fn send(&self, message: String) -> Result<()> {
        let peers = self
            .peers
            .lock()
            .map_err(|_| BridgeError::poisoned("peer link"))?;
        if *peers == 0 {
            return Err(BridgeError::not_connected());
        }
        self.tx.send(message).map_err(|_| BridgeError::Transport {
            message: "outbound queue closed".to_string(),
        })
    }

    pub fn outbox(&self) -> OutboxReceiver {
        self.rx.clone()
    }
}

/// Handle to a running listener. Dropping shuts it down.
pub(crate) struct ListenerHandle {
    pub addr: SocketAddr,
    pub link: Arc<PeerLink>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn new(
        addr: SocketAddr,
        link: Arc<PeerLink>,
        shutdown_tx: oneshot::Sender<()>,
        conn_shutdown_tx: watch::Sender<bool>,
        task_handle: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            addr,
            link,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    /// Stop accepting peers and close the active connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Build the runtime a transport delivers messages on.
pub(crate) fn delivery_runtime(name: &str) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(name)
        .enable_all()
        .build()
        .map_err(|e| BridgeError::Transport {
            message: format!("Failed to build {} runtime: {}", name, e),
        })
}

pub(crate) fn not_started() -> BridgeError {
    BridgeError::Transport {
        message: "transport is not started".to_string(),
    }
}

pub(crate) fn already_started(addr: SocketAddr) -> BridgeError {
    BridgeError::Transport {
        message: format!("transport already listening on {}", addr),
    }
}
