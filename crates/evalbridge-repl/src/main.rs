//! evalbridge REPL - read code from stdin, evaluate it on a remote host.
//!
//! Starts a bridge server, waits for the remote host to connect and report
//! ready, then evaluates one line at a time.

use anyhow::{Context, Result};
use clap::Parser;
use evalbridge::{
    BridgeConfig, BridgeError, DeliveryStrategy, EnvState, EnvironmentBridge, TransportKind,
};
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "evalbridge-repl")]
#[command(about = "Evaluate code on a remote host over evalbridge")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listener type: tcp or websocket
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// Payload delivery: inline or staged-file
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<DeliveryStrategy>,

    /// Directory for staged payload files
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Source tree to analyze for unit declarations
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Unit already present on the remote host (repeatable)
    #[arg(long = "preload")]
    preload: Vec<String>,

    /// Seconds to wait for the remote host to become ready
    #[arg(long, default_value = "300")]
    ready_timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_transport(s: &str) -> std::result::Result<TransportKind, String> {
    TransportKind::from_str(s).ok_or_else(|| format!("unknown transport: {}", s))
}

fn parse_strategy(s: &str) -> std::result::Result<DeliveryStrategy, String> {
    DeliveryStrategy::from_str(s).ok_or_else(|| format!("unknown delivery strategy: {}", s))
}

impl Args {
    fn into_config(self) -> Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(host) = self.host {
            config.address = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(strategy) = self.strategy {
            config.delivery_strategy = strategy;
        }
        if self.staging_dir.is_some() {
            config.staging_dir = self.staging_dir;
        }
        if self.source_root.is_some() {
            config.source_root = self.source_root;
        }
        config.preloaded_units.extend(self.preload);
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging (stderr, so stdout stays the REPL channel)
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let ready_timeout = Duration::from_secs(args.ready_timeout);
    let config = args.into_config()?;
    info!(
        "Starting evalbridge REPL ({} transport, {} delivery)",
        config.transport, config.delivery_strategy
    );

    let env = Arc::new(EnvironmentBridge::from_config(config)?);
    env.setup()?;
    install_interrupt_handler(env.clone())?;

    println!("<< waiting for remote host to connect >>");
    env.wait_for_ready(ready_timeout)
        .context("remote host never reported ready")?;
    println!("<< connected >>");

    let outcome = repl_loop(&env);
    if env.state() == EnvState::SetUp {
        env.tear_down()?;
    }
    outcome
}

/// Tear the environment down once `signal` resolves.
///
/// Returns true if this call performed the teardown.
async fn tear_down_on<F>(env: &EnvironmentBridge, signal: F) -> bool
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        return false;
    }
    info!("Shutdown signal received, tearing down");
    if env.state() != EnvState::SetUp {
        return false;
    }
    match env.tear_down() {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to tear down environment: {}", e);
            false
        }
    }
}

/// Watch for Ctrl-C on a dedicated thread; tear down and exit when it comes.
fn install_interrupt_handler(env: Arc<EnvironmentBridge>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    std::thread::Builder::new()
        .name("evalbridge-signal".to_string())
        .spawn(move || {
            if runtime.block_on(tear_down_on(&env, tokio::signal::ctrl_c())) {
                std::process::exit(130);
            }
        })
        .context("spawning signal thread")?;
    Ok(())
}

fn repl_loop(env: &EnvironmentBridge) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("=> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            println!();
            return Ok(()); // EOF
        };
        let line = line?;
        let code = line.trim();
        if code.is_empty() {
            continue;
        }
        if code == ":quit" {
            return Ok(());
        }

        match env.evaluate(code) {
            Ok(value) => println!("{}", value),
            Err(e @ BridgeError::RemoteEvaluation { .. }) => {
                warn!("Remote host went away");
                return Err(e.into());
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }
}
