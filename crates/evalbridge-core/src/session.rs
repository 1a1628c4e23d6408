//! Per-session state shared by the environment and the dispatcher.

use crate::correlator::Correlator;
use crate::output::OutputSink;
use crate::payload::PayloadEncoder;
use crate::tracker::LibraryLoadTracker;
use crate::transport::Transport;
use crate::{BridgeError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// State owned by one running environment.
///
/// The dispatcher mutates it from the transport's delivery loop while a
/// caller may be blocked in [`Correlator::issue`], so every field guards
/// itself.
pub struct Session {
    pub(crate) output: Mutex<Option<OutputSink>>,
    pub(crate) correlator: Correlator,
    pub(crate) loaded: LibraryLoadTracker,
    pub(crate) preloaded: BTreeSet<String>,
    pub(crate) encoder: Box<dyn PayloadEncoder>,
    /// Code sent after every ready handshake.
    pub(crate) init_directive: String,
    ready_count: Mutex<u64>,
    ready_signal: Condvar,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        encoder: Box<dyn PayloadEncoder>,
        preloaded: BTreeSet<String>,
        init_directive: String,
    ) -> Self {
        Self {
            output: Mutex::new(None),
            correlator: Correlator::new(transport),
            loaded: LibraryLoadTracker::new(),
            preloaded,
            encoder,
            init_directive,
            ready_count: Mutex::new(0),
            ready_signal: Condvar::new(),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        self.correlator.transport()
    }

    pub(crate) fn output_sink(&self) -> Option<OutputSink> {
        self.output.lock().ok().and_then(|sink| sink.clone())
    }

    pub(crate) fn set_output_sink(&self, sink: Option<OutputSink>) -> Result<()> {
        *self
            .output
            .lock()
            .map_err(|_| BridgeError::poisoned("output sink"))? = sink;
        Ok(())
    }

    /// Record a ready handshake and wake anyone waiting for one.
    pub(crate) fn note_ready(&self) {
        if let Ok(mut count) = self.ready_count.lock() {
            *count += 1;
            self.ready_signal.notify_all();
        }
    }

    pub(crate) fn ready_count(&self) -> u64 {
        self.ready_count.lock().map(|c| *c).unwrap_or(0)
    }

    /// Block until at least one ready handshake has been seen.
    pub(crate) fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let count = self
            .ready_count
            .lock()
            .map_err(|_| BridgeError::poisoned("ready count"))?;
        let (count, result) = self
            .ready_signal
            .wait_timeout_while(count, timeout, |count| *count == 0)
            .map_err(|_| BridgeError::poisoned("ready count"))?;
        if result.timed_out() && *count == 0 {
            return Err(BridgeError::Timeout(timeout));
        }
        Ok(())
    }
}
