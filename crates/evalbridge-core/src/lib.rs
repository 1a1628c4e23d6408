//! evalbridge - synchronous evaluation against a remote execution host.
//!
//! A caller issues one evaluation at a time and blocks until the remote host
//! answers. Underneath, messages travel over an asynchronous connection
//! (TCP frames or a WebSocket) that the remote host opens to us.
//!
//! # Architecture
//!
//! - **transport**: listener and connection plumbing, one remote peer at a time
//! - **dispatcher**: routes `result` / `print` / `ready` messages
//! - **correlator**: single-slot handoff between the caller and the delivery loop
//! - **tracker**: units already on the remote host, so code is sent once
//! - **payload**: inline vs. staged-file delivery of executable text
//! - **env**: the public setup / evaluate / load unit / tear down contract
//!
//! # Example
//!
//! ```rust,ignore
//! use evalbridge::{BridgeConfig, DeliveryStrategy, EnvironmentBridge};
//! use std::time::Duration;
//!
//! fn main() -> evalbridge::Result<()> {
//!     let config = BridgeConfig::default()
//!         .with_port(9001)
//!         .with_delivery_strategy(DeliveryStrategy::StagedFile);
//!     let env = EnvironmentBridge::from_config(config)?;
//!
//!     env.setup()?;
//!     env.wait_for_ready(Duration::from_secs(60))?;
//!     println!("{}", env.evaluate("evalbridge.runtime.render(1 + 1)")?);
//!     env.load_unit(["app.core"], "out/app/core.js")?;
//!     env.tear_down()
//! }
//! ```

pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod output;
pub mod payload;
pub mod protocol;
pub mod resolver;
pub mod session;
pub mod tracker;
pub mod transport;

// Re-export commonly used types
pub use config::{BridgeConfig, DeliveryStrategy, ProtocolConfig, TransportKind};
pub use correlator::Correlator;
pub use dispatcher::MessageDispatcher;
pub use env::{EnvState, EnvironmentBridge};
pub use error::{BridgeError, Result};
pub use output::{OutputSink, SharedBuffer};
pub use payload::{InlineEncoder, PayloadEncoder, StagedFileEncoder};
pub use protocol::{InboundMessage, OutboundMessage};
pub use resolver::{BuildOptions, DependencyResolver, SourceTreeResolver, UnitInfo};
pub use session::Session;
pub use tracker::LibraryLoadTracker;
pub use transport::{MessageHandler, TcpTransport, Transport, WebSocketTransport};
