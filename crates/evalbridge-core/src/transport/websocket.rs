//! WebSocket transport using Axum.
//!
//! Browser hosts connect to `ws://ADDR/repl`; each text frame is one JSON
//! message. `GET /health` reports whether a remote host is attached. A second
//! upgrade while a peer is attached gets `409 Conflict`.

use super::{
    already_started, delivery_runtime, not_started, ListenerHandle, MessageHandler, PeerLink,
    Transport,
};
use crate::config::ProtocolConfig;
use crate::{BridgeError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// State shared across route handlers.
struct WsState {
    handler: Arc<dyn MessageHandler>,
    link: Arc<PeerLink>,
    conn_shutdown: watch::Receiver<bool>,
}

/// JSON text frames over a WebSocket.
pub struct WebSocketTransport {
    runtime: Runtime,
    listener: Mutex<Option<ListenerHandle>>,
}

impl WebSocketTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            runtime: delivery_runtime("evalbridge-ws")?,
            listener: Mutex::new(None),
        })
    }
}

async fn handle_health(State(state): State<Arc<WsState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connected": state.link.is_connected(),
    }))
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> Response {
    // Claimed before the upgrade; released by on_failed_upgrade or serve_socket.
    if !state.link.attach() {
        warn!(
            "Rejecting remote host: already serving {} peer(s)",
            ProtocolConfig::MAX_PEERS
        );
        return (StatusCode::CONFLICT, "a remote host is already connected").into_response();
    }

    let link = state.link.clone();
    ws.max_message_size(ProtocolConfig::MAX_MESSAGE_SIZE)
        .on_failed_upgrade(move |e: axum::Error| {
            warn!("WebSocket upgrade failed: {}", e);
            link.detach();
        })
        .on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<WsState>) {
    info!("Remote host connected over WebSocket");

    let (mut sink, mut stream) = socket.split();
    let outbox = state.link.outbox();
    let writer_task = tokio::spawn(async move {
        let mut outbox = outbox.lock_owned().await;
        while let Some(message) = outbox.recv().await {
            if let Err(e) = sink.send(Message::Text(message)).await {
                debug!("Dropping outbound message after send failure: {}", e);
                break;
            }
        }
    });

    let mut shutdown = state.conn_shutdown.clone();
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shutdown.changed() => None,
        };
        match next {
            Some(Ok(Message::Text(text))) => state.handler.on_message(&text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => state.handler.on_message(&text),
                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong are answered by axum
            Some(Err(e)) => {
                debug!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    writer_task.abort();
    let _ = writer_task.await;
    let dropped = state.link.detach();
    if dropped > 0 {
        warn!("Discarded {} undelivered message(s)", dropped);
    }
    info!("Remote host disconnected");
    state.handler.on_disconnect();
}

impl Transport for WebSocketTransport {
    fn start(&self, handler: Arc<dyn MessageHandler>, addr: SocketAddr) -> Result<SocketAddr> {
        let mut slot = self
            .listener
            .lock()
            .map_err(|_| BridgeError::poisoned("websocket listener"))?;
        if let Some(running) = slot.as_ref() {
            return Err(already_started(running.addr));
        }

        let listener = self.runtime.block_on(tokio::net::TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;

        let link = PeerLink::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let state = Arc::new(WsState {
            handler,
            link: link.clone(),
            conn_shutdown: conn_shutdown_rx,
        });

        let app = Router::new()
            .route(ProtocolConfig::HEALTH_ROUTE, get(handle_health))
            .route(ProtocolConfig::WS_ROUTE, get(handle_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        info!(
            "WebSocket transport listening on ws://{}{}",
            local_addr,
            ProtocolConfig::WS_ROUTE
        );

        let task_handle = self.runtime.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("WebSocket server error: {}", e);
            }
            info!("WebSocket transport shutting down");
        });

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
            .map_err(|_| BridgeError::poisoned("websocket listener"))?
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
            .map_err(|_| BridgeError::poisoned("websocket listener"))?;
        let running = slot.as_ref().ok_or_else(not_started)?;
        debug!("Queueing {} byte message", message.len());
        running.link.send(message)
    }
}
