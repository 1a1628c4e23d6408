//! Request/reply correlation.
//!
//! The [`Correlator`] pairs one outbound evaluation with the next inbound
//! result through a single-slot handoff. The caller blocks on its own thread;
//! the reply is delivered from the transport's delivery loop.

use crate::protocol::{self, OutboundMessage};
use crate::transport::Transport;
use crate::{BridgeError, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Reply = Result<String>;

/// The armed slot: a generation number plus the write-once sender.
struct PendingReply {
    generation: u64,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Slot {
    pending: Option<PendingReply>,
    next_generation: u64,
}

/// Single-flight request/reply pairing over a [`Transport`].
pub struct Correlator {
    transport: Arc<dyn Transport>,
    slot: Mutex<Slot>,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            slot: Mutex::new(Slot::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| BridgeError::poisoned("pending reply"))
    }

    /// Send `request` and block until its reply arrives.
    ///
    /// Fails with [`BridgeError::EvaluationInFlight`] if another request is
    /// still waiting, and with [`BridgeError::RemoteEvaluation`] if no remote
    /// host is attached or the connection drops first. Must not be called from a tokio worker thread.
    pub fn issue(&self, request: &OutboundMessage) -> Result<String> {
        let payload = protocol::encode(request)?;
        let (generation, rx) = self.arm()?;

        if let Err(e) = self.transport.send(payload) {
            self.disarm(generation);
            return Err(e);
        }

        let outcome = rx.blocking_recv();
        self.disarm(generation);

        match outcome {
            Ok(reply) => reply,
            Err(_) => Err(BridgeError::disconnected()),
        }
    }

    fn arm(&self) -> Result<(u64, oneshot::Receiver<Reply>)> {
        let mut slot = self.lock()?;
        if slot.pending.is_some() {
            return Err(BridgeError::EvaluationInFlight);
        }
        let generation = slot.next_generation;
        slot.next_generation += 1;
        let (tx, rx) = oneshot::channel();
        slot.pending = Some(PendingReply { generation, tx });
        debug!("Armed reply slot #{}", generation);
        Ok((generation, rx))
    }

    fn disarm(&self, generation: u64) {
        if let Ok(mut slot) = self.lock() {
            if slot
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == generation)
            {
                slot.pending = None;
            }
        }
    }

    fn take(&self) -> Option<PendingReply> {
        match self.lock() {
            Ok(mut slot) => slot.pending.take(),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Hand `value` to the waiting caller. Returns false if nobody waits.
    pub fn fulfill(&self, value: String) -> bool {
        match self.take() {
            Some(pending) => {
                debug!("Fulfilling reply slot #{}", pending.generation);
                pending.tx.send(Ok(value)).is_ok()
            }
            None => false,
        }
    }

    /// Fail the waiting caller with `err`. Returns false if nobody waits.
    pub fn fail(&self, err: BridgeError) -> bool {
        match self.take() {
            Some(pending) => pending.tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().map(|s| s.pending.is_some()).unwrap_or(false)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
