//! TCP transport.
//!
//! Listens on the configured address, accepts one remote host at a time, and
//! exchanges length-prefixed JSON frames with it (see [`crate::protocol`]).
//!
//! # Thread Safety
//!
//! The accept loop and every connection run on the transport's own runtime.
//! Inbound frames are read on the connection task and handed to the
//! [`MessageHandler`]; outbound frames are written by a sibling task that
//! drains the shared outbox, so reads are never cancelled mid-frame. A
//! second connection while a peer is attached is closed on accept.

use super::{
    already_started, delivery_runtime, not_started, ListenerHandle, MessageHandler, PeerLink,
    Transport,
};
use crate::config::ProtocolConfig;
use crate::protocol::{read_frame, write_frame};
use crate::{BridgeError, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Length-prefixed JSON over TCP.
pub struct TcpTransport {
    runtime: Runtime,
    listener: Mutex<Option<ListenerHandle>>,
}

impl TcpTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            runtime: delivery_runtime("evalbridge-tcp")?,
            listener: Mutex::new(None),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn MessageHandler>,
        link: Arc<PeerLink>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("TCP transport shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !link.attach() {
                                warn!(
                                    "Rejecting remote host {}: already serving {} peer(s)",
                                    peer_addr,
                                    ProtocolConfig::MAX_PEERS
                                );
                                continue;
                            }

                            let handler = handler.clone();
                            let link = link.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                info!("Remote host connected from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, &*handler, &link, &mut conn_shutdown).await
                                {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                let dropped = link.detach();
                                if dropped > 0 {
                                    warn!("Discarded {} undelivered message(s)", dropped);
                                }
                                info!("Remote host {} disconnected", peer_addr);
                                handler.on_disconnect();
                            });
                        }
                        Err(e) => {
                            error!("TCP accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        handler: &dyn MessageHandler,
        link: &PeerLink,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let outbox = link.outbox();
        let writer_task = tokio::spawn(async move {
            let mut outbox = outbox.lock_owned().await;
            while let Some(message) = outbox.recv().await {
                if let Err(e) = write_frame(&mut writer, message.as_bytes()).await {
                    debug!("Dropping outbound message after write failure: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            // Wait for either a frame or a shutdown signal
            let frame = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = shutdown_rx.changed() => Ok(None),
            };

            let frame = match frame {
                Ok(Some(f)) => f,
                Ok(None) => break Ok(()), // Clean disconnect
                Err(e) => break Err(e),
            };

            match String::from_utf8(frame) {
                Ok(text) => handler.on_message(&text),
                Err(_) => {
                    break Err(BridgeError::Protocol {
                        message: "Invalid UTF-8 in frame".to_string(),
                    });
                }
            }
        };

        // The outbox lock must be free before the link detaches.
        writer_task.abort();
        let _ = writer_task.await;
        result
    }
}

impl Transport for TcpTransport {
    fn start(&self, handler: Arc<dyn MessageHandler>, addr: SocketAddr) -> Result<SocketAddr> {
        let mut slot = self
            .listener
            .lock()
            .map_err(|_| BridgeError::poisoned("tcp listener"))?;
        if let Some(running) = slot.as_ref() {
            return Err(already_started(running.addr));
        }

        let listener = self.runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;
        info!("TCP transport listening on {}", local_addr);

        let link = PeerLink::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = self.runtime.spawn(Self::accept_loop(
            listener,
            handler,
            link.clone(),
            shutdown_rx,
            conn_shutdown_rx,
        ));

        *slot = Some(ListenerHandle::new(
            local_addr,
            link,
            shutdown_tx,
            conn_shutdown_tx,
            task_handle,
        ));
        Ok(local_addr)
    }

    fn stop(&self) -> Result<()> {
        let running = self
            .listener
            .lock()
            .map_err(|_| BridgeError::poisoned("tcp listener"))?
            .take();
        match running {
            Some(mut handle) => {
                handle.shutdown();
                Ok(())
            }
            None => Err(not_started()),
        }
    }

    fn send(&self, message: String) -> Result<()> {
        let slot = self
            .listener
            .lock()
            .map_err(|_| BridgeError::poisoned("tcp listener"))?;
        let running = slot.as_ref().ok_or_else(not_started)?;
        debug!("Queueing {} byte message", message.len());
        running.link.send(message)
    }
}
