//! The environment bridge: setup / evaluate / load unit / tear down.

use crate::config::{BridgeConfig, ProtocolConfig, TransportKind};
use crate::dispatcher::MessageDispatcher;
use crate::output::OutputSink;
use crate::payload::{self, namespace_init_directive};
use crate::resolver::{BuildOptions, DependencyResolver, SourceTreeResolver};
use crate::session::Session;
use crate::transport::{TcpTransport, Transport, WebSocketTransport};
use crate::{BridgeError, Result};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of an [`EnvironmentBridge`]. `TornDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Uninitialized,
    SetUp,
    TornDown,
}

impl EnvState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvState::Uninitialized => "uninitialized",
            EnvState::SetUp => "set up",
            EnvState::TornDown => "torn down",
        }
    }
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Synchronous evaluation against a remote host.
///
/// One request is in flight at a time: [`evaluate`](Self::evaluate) blocks
/// the calling thread until the remote host replies or disconnects. Call it
/// from a plain thread, never from inside a tokio runtime.
///
/// # Example
///
/// ```rust,ignore
/// use evalbridge::{BridgeConfig, EnvironmentBridge};
///
/// let env = EnvironmentBridge::from_config(BridgeConfig::default().with_port(0))?;
/// env.setup()?;
/// env.wait_for_ready(std::time::Duration::from_secs(30))?;
/// let value = env.evaluate("1 + 1")?;
/// env.tear_down()?;
/// ```
pub struct EnvironmentBridge {
    config: BridgeConfig,
    session: Arc<Session>,
    resolver: Arc<dyn DependencyResolver>,
    ambient_output: OutputSink,
    state: Mutex<EnvState>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl EnvironmentBridge {
    /// Build an environment over explicit collaborators.
    ///
    /// Analyzes `config.source_root` (when set) and computes the preloaded
    /// unit set (runtime support plus `config.preloaded_units`, transitively)
    /// once, here. The closure is only as complete as the resolver's graph.
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> Result<Self> {
        if let Some(root) = &config.source_root {
            resolver.analyze(root)?;
        }

        let roots: BTreeSet<String> = ProtocolConfig::RUNTIME_SUPPORT_UNITS
            .iter()
            .map(|s| s.to_string())
            .chain(config.preloaded_units.iter().cloned())
            .collect();
        let preloaded = resolver.resolve_transitive_deps(&roots, &BuildOptions::with_scripts())?;
        debug!("Preloaded units: {:?}", preloaded);

        let session = Arc::new(Session::new(
            transport,
            payload::encoder_for(&config),
            preloaded,
            namespace_init_directive(&config.init_namespace),
        ));

        Ok(Self {
            config,
            session,
            resolver,
            ambient_output: OutputSink::stdout(),
            state: Mutex::new(EnvState::Uninitialized),
            local_addr: Mutex::new(None),
        })
    }

    /// Build an environment with the transport named in `config` and a
    /// [`SourceTreeResolver`].
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Tcp => Arc::new(TcpTransport::new()?),
            TransportKind::WebSocket => Arc::new(WebSocketTransport::new()?),
        };
        Self::new(config, transport, Arc::new(SourceTreeResolver::new()))
    }

    /// Use `sink` as the ambient output stream captured at setup.
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.ambient_output = sink;
        self
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EnvState>> {
        self.state
            .lock()
            .map_err(|_| BridgeError::poisoned("environment state"))
    }

    fn require_state(&self, expected: EnvState) -> Result<()> {
        let actual = *self.lock_state()?;
        if actual != expected {
            return Err(BridgeError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    pub fn state(&self) -> EnvState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(EnvState::TornDown)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Capture the output stream and start listening for the remote host.
    /// Returns the bound address.
    ///
    /// Static analysis of the source root already ran in [`new`](Self::new).
    pub fn setup(&self) -> Result<SocketAddr> {
        let mut state = self.lock_state()?;
        if *state != EnvState::Uninitialized {
            return Err(BridgeError::InvalidState {
                expected: EnvState::Uninitialized.to_string(),
                actual: state.to_string(),
            });
        }

        self.session
            .set_output_sink(Some(self.ambient_output.clone()))?;

        let handler = Arc::new(MessageDispatcher::new(&self.session));
        let addr = self
            .session
            .transport()
            .start(handler, self.config.socket_addr()?)?;

        *self
            .local_addr
            .lock()
            .map_err(|_| BridgeError::poisoned("local address"))? = Some(addr);
        *state = EnvState::SetUp;

        info!(
            "Environment set up on {} ({} delivery)",
            addr, self.config.delivery_strategy
        );
        self.ambient_output
            .write_line(&format!("<< started evalbridge server on {} >>", addr))?;
        Ok(addr)
    }

    /// Evaluate `code` remotely and return the rendered result.
    pub fn evaluate(&self, code: &str) -> Result<String> {
        self.require_state(EnvState::SetUp)?;
        let request = self.session.encoder.encode_request(code)?;
        self.session.correlator.issue(&request)
    }

    /// Make sure the remote host holds `names`, sending the text at
    /// `source_url` if any of them is missing.
    pub fn load_unit<I, S>(&self, names: I, source_url: &str) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require_state(EnvState::SetUp)?;
        let required: BTreeSet<String> = names.into_iter().map(Into::into).collect();

        let missing = self.session.loaded.missing(&required)?;
        if missing.is_empty() {
            debug!("Units already loaded: {:?}", required);
            return Ok(());
        }

        info!("Loading {:?} from {}", missing, source_url);
        let source = self.resolver.read_units_source(source_url)?;
        self.evaluate(&source)?;
        self.session.loaded.mark_loaded(required)
    }

    /// Block until the remote host has sent at least one ready handshake.
    ///
    /// Returns once the namespace init directive for that handshake has been
    /// queued, not answered. The init directive does not go through the reply
    /// slot, so a remote host that answers it after the caller's next
    /// [`evaluate`](Self::evaluate) has been sent pairs that answer with the
    /// caller's request. Hosts should leave init unanswered or finish it before
    /// reading the next request.
    pub fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        self.require_state(EnvState::SetUp)?;
        self.session.wait_for_ready(timeout)
    }

    /// Release the output stream, forget loaded units, stop the transport.
    pub fn tear_down(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if *state != EnvState::SetUp {
            return Err(BridgeError::InvalidState {
                expected: EnvState::SetUp.to_string(),
                actual: state.to_string(),
            });
        }
        *state = EnvState::TornDown;

        self.session.set_output_sink(None)?;
        self.session.loaded.clear()?;
        if let Err(e) = self.session.encoder.cleanup() {
            warn!("Failed to clean up staged payloads: {}", e);
        }
        self.session.transport().stop()?;

        info!("Environment torn down");
        self.ambient_output
            .write_line("<< stopped evalbridge server >>")?;
        Ok(())
    }

    /// Address the transport is bound to, once set up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    pub fn loaded_units(&self) -> Result<BTreeSet<String>> {
        self.session.loaded.snapshot()
    }

    pub fn preloaded_units(&self) -> &BTreeSet<String> {
        &self.session.preloaded
    }

    /// Number of ready handshakes seen this session.
    pub fn ready_count(&self) -> u64 {
        self.session.ready_count()
    }
}

impl Drop for EnvironmentBridge {
    fn drop(&mut self) {
        if self.state() == EnvState::SetUp {
            if let Err(e) = self.tear_down() {
                warn!("Failed to tear down environment on drop: {}", e);
            }
        }
    }
}
