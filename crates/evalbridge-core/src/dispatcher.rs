//! Inbound message dispatch.
//!
//! Decodes each message from the transport and routes it by `op`:
//!
//! | op       | handling                                              |
//! |----------|-------------------------------------------------------|
//! | `result` | fulfill the armed reply slot, or drop a stray reply   |
//! | `print`  | write the decoded text to the session's output sink   |
//! | `ready`  | reset loaded units, send the namespace init directive |
//!
//! Unknown ops and undecodable messages are logged and ignored.

use crate::protocol::{self, InboundMessage};
use crate::session::Session;
use crate::transport::MessageHandler;
use crate::BridgeError;
use std::io::Write;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// [`MessageHandler`] feeding a [`Session`].
///
/// Holds the session weakly so a transport task outliving the environment
/// does not keep the session (and the transport itself) alive.
pub struct MessageDispatcher {
    session: Weak<Session>,
}

impl MessageDispatcher {
    pub fn new(session: &Arc<Session>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }

    fn handle_result(session: &Session, value: String) {
        if !session.correlator.fulfill(value) {
            warn!("Dropping result with no evaluation outstanding");
        }
    }

    fn handle_print(session: &Session, value: &str) {
        let text = protocol::decode_printable(value);
        let written = match session.output_sink() {
            Some(sink) => sink.write_str(&text),
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(text.as_bytes())
                    .and_then(|_| stdout.flush())
                    .map_err(BridgeError::from)
            }
        };
        if let Err(e) = written {
            error!("Failed to write remote output: {}", e);
        }
    }

    fn handle_ready(session: &Session) {
        info!("Remote host ready");
        if let Err(e) = session.loaded.reset_to(&session.preloaded) {
            error!("Failed to reset loaded units: {}", e);
        }

        // Fire-and-forget: this runs on the delivery loop, which is also the
        // only thing that could fulfill a reply slot.
        let sent = session
            .encoder
            .encode_request(&session.init_directive)
            .and_then(|request| protocol::encode(&request))
            .and_then(|payload| session.transport().send(payload));
        if let Err(e) = sent {
            error!("Failed to send namespace initialization: {}", e);
        }
        session.note_ready();
    }
}

impl MessageHandler for MessageDispatcher {
    fn on_message(&self, raw: &str) {
        let Some(session) = self.session.upgrade() else {
            debug!("Session gone, dropping message");
            return;
        };

        let message = match protocol::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        match message {
            InboundMessage::Result { value } => Self::handle_result(&session, value),
            InboundMessage::Print { value } => Self::handle_print(&session, &value),
            InboundMessage::Ready => Self::handle_ready(&session),
            InboundMessage::Unknown => debug!("Ignoring message with unknown op"),
        }
    }

    fn on_disconnect(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.correlator.fail(BridgeError::disconnected()) {
            warn!("Remote host disconnected with an evaluation outstanding");
        }
    }
}
