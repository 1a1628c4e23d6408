//! Integration tests for the EnvironmentBridge public interface.
//!
//! These drive the bridge through an in-process loopback transport so each
//! request, reply, and handshake can be scripted and observed exactly.

use evalbridge::{
    BridgeConfig, BridgeError, DeliveryStrategy, EnvState, EnvironmentBridge, MessageHandler,
    OutboundMessage, OutputSink, ProtocolConfig, SharedBuffer, SourceTreeResolver, Transport,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Transport that plays the remote host in-process.
///
/// Every sent message is recorded; if a responder is set, its answer is
/// delivered back as a `result` before `send` returns.
struct LoopbackTransport {
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    sent: Mutex<Vec<OutboundMessage>>,
    responder: Option<Responder>,
}

impl LoopbackTransport {
    fn silent() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            responder: None,
        })
    }

    fn replying(responder: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            responder: Some(Box::new(responder)),
        })
    }

    fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("transport not started")
    }

    fn deliver(&self, raw: &str) {
        self.handler().on_message(raw);
    }

    fn disconnect(&self) {
        self.handler().on_disconnect();
    }

    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for LoopbackTransport {
    fn start(&self, handler: Arc<dyn MessageHandler>, addr: SocketAddr) -> evalbridge::Result<SocketAddr> {
        *self.handler.lock().unwrap() = Some(handler);
        Ok(addr)
    }

    fn stop(&self) -> evalbridge::Result<()> {
        *self.handler.lock().unwrap() = None;
        Ok(())
    }

    fn send(&self, message: String) -> evalbridge::Result<()> {
        let request: OutboundMessage = serde_json::from_str(&message).unwrap();
        self.sent.lock().unwrap().push(request.clone());

        let code = match &request {
            OutboundMessage::Eval { code } => code.clone(),
            OutboundMessage::EvalFile { file } => std::fs::read_to_string(file).unwrap(),
        };
        if let Some(value) = self.responder.as_ref().and_then(|r| r(&code)) {
            self.deliver(&json!({"op": "result", "value": value}).to_string());
        }
        Ok(())
    }
}

/// Answers simple arithmetic the way a remote host would.
fn arithmetic(code: &str) -> Option<String> {
    if code.contains("1 + 1") {
        Some("2".into())
    } else if code.contains("2 + 2") {
        Some("4".into())
    } else {
        Some("nil".into())
    }
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn start_env(config: BridgeConfig, transport: Arc<LoopbackTransport>) -> (EnvironmentBridge, SharedBuffer) {
    let buffer = SharedBuffer::new();
    let env = EnvironmentBridge::new(config, transport, Arc::new(SourceTreeResolver::new()))
        .unwrap()
        .with_output(OutputSink::from_writer(buffer.clone()));
    env.setup().unwrap();
    (env, buffer)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition never held");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn count_eval_containing(sent: &[OutboundMessage], needle: &str) -> usize {
    sent.iter()
        .filter(|m| matches!(m, OutboundMessage::Eval { code } if code.contains(needle)))
        .count()
}

#[test]
fn test_sequential_evaluations_return_their_own_results() {
    let transport = LoopbackTransport::replying(arithmetic);
    let (env, _) = start_env(BridgeConfig::default(), transport.clone());

    assert_eq!(env.evaluate("1 + 1").unwrap(), "2");
    assert_eq!(env.evaluate("2 + 2").unwrap(), "4");
    assert_eq!(transport.sent().len(), 2);
}

#[test]
fn test_load_unit_transfers_once() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("app.js");
    std::fs::write(&source, "goog.provide('app'); var APP_LOADED = true;").unwrap();
    let url = source.to_str().unwrap();

    let transport = LoopbackTransport::replying(arithmetic);
    let (env, _) = start_env(
        BridgeConfig::default().with_preloaded_units(["core"]),
        transport.clone(),
    );

    env.load_unit(["core", "app"], url).unwrap();
    assert_eq!(count_eval_containing(&transport.sent(), "APP_LOADED"), 1);
    assert_eq!(env.loaded_units().unwrap(), set(&["core", "app"]));

    env.load_unit(["core", "app"], url).unwrap();
    assert_eq!(count_eval_containing(&transport.sent(), "APP_LOADED"), 1);
}

#[test]
fn test_load_unit_failure_leaves_units_unloaded() {
    let transport = LoopbackTransport::replying(arithmetic);
    let (env, _) = start_env(BridgeConfig::default(), transport.clone());

    let result = env.load_unit(["app"], "/nonexistent/app.js");
    assert!(matches!(result, Err(BridgeError::UnitNotFound(_))));
    assert!(env.loaded_units().unwrap().is_empty());
    assert!(transport.sent().is_empty());
}

#[test]
fn test_ready_resets_loaded_units_to_preloaded() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("extra.js");
    std::fs::write(&source, "var EXTRA = 1;").unwrap();

    let transport = LoopbackTransport::replying(arithmetic);
    let (env, _) = start_env(
        BridgeConfig::default().with_preloaded_units(["core"]),
        transport.clone(),
    );
    env.load_unit(["extra", "more"], source.to_str().unwrap())
        .unwrap();
    assert!(env.loaded_units().unwrap().contains("extra"));

    transport.deliver(r#"{"op":"ready"}"#);

    assert_eq!(&env.loaded_units().unwrap(), env.preloaded_units());
    assert!(env.preloaded_units().contains("core"));
    assert!(env
        .preloaded_units()
        .contains(ProtocolConfig::RUNTIME_SUPPORT_UNITS[0]));
}

#[test]
fn test_ready_with_nothing_outstanding_sends_init_eval() {
    let transport = LoopbackTransport::silent();
    let (env, _) = start_env(BridgeConfig::default(), transport.clone());

    transport.deliver(r#"{"op":"ready"}"#);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(count_eval_containing(&sent, "initNamespace(\"repl.user\")"), 1);
    assert_eq!(env.ready_count(), 1);
    env.wait_for_ready(Duration::from_millis(10)).unwrap();
}

#[test]
fn test_stray_result_does_not_disturb_correlation() {
    let transport = LoopbackTransport::replying(arithmetic);
    let (env, _) = start_env(BridgeConfig::default(), transport.clone());

    transport.deliver(r#"{"op":"result","value":"stale"}"#);
    transport.deliver(r#"{"op":"result","value":"duplicate"}"#);

    assert_eq!(env.evaluate("1 + 1").unwrap(), "2");
}

#[test]
fn test_disconnect_while_waiting_surfaces_error() {
    let transport = LoopbackTransport::silent();
    let (env, _) = start_env(BridgeConfig::default(), transport.clone());
    let env = Arc::new(env);

    let waiter = {
        let env = env.clone();
        std::thread::spawn(move || env.evaluate("while (true) {}"))
    };
    wait_until(|| !transport.sent().is_empty());
    transport.disconnect();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.is_disconnect(), "unexpected error: {:?}", err);

    // The slot is free again for the next evaluation.
    let waiter = {
        let env = env.clone();
        std::thread::spawn(move || env.evaluate("1 + 1"))
    };
    wait_until(|| transport.sent().len() == 2);
    transport.deliver(r#"{"op":"result","value":"2"}"#);
    assert_eq!(waiter.join().unwrap().unwrap(), "2");
}

#[test]
fn test_concurrent_evaluate_fails_fast() {
    let transport = LoopbackTransport::silent();
    let (env, _) = start_env(BridgeConfig::default(), transport.clone());
    let env = Arc::new(env);

    let waiter = {
        let env = env.clone();
        std::thread::spawn(move || env.evaluate("slow()"))
    };
    wait_until(|| !transport.sent().is_empty());

    assert!(matches!(
        env.evaluate("fast()"),
        Err(BridgeError::EvaluationInFlight)
    ));
    assert_eq!(transport.sent().len(), 1);

    transport.deliver(r#"{"op":"result","value":"slow-done"}"#);
    assert_eq!(waiter.join().unwrap().unwrap(), "slow-done");
}

#[test]
fn test_print_reaches_output_sink_and_is_cleared_on_teardown() {
    let transport = LoopbackTransport::silent();
    let (env, buffer) = start_env(BridgeConfig::default(), transport.clone());

    transport.deliver(r#"{"op":"print","value":"\"from remote\\n\""}"#);
    assert!(buffer.contents().contains("from remote\n"));

    env.tear_down().unwrap();
    assert_eq!(env.state(), EnvState::TornDown);
    assert!(env.loaded_units().unwrap().is_empty());
}

#[test]
fn test_staged_file_strategy_sends_paths_and_cleans_up() {
    let staging = TempDir::new().unwrap();
    let transport = LoopbackTransport::replying(arithmetic);
    let (env, _) = start_env(
        BridgeConfig::default()
            .with_delivery_strategy(DeliveryStrategy::StagedFile)
            .with_staging_dir(staging.path()),
        transport.clone(),
    );

    assert_eq!(env.evaluate("1 + 1").unwrap(), "2");

    let sent = transport.sent();
    let OutboundMessage::EvalFile { file } = &sent[0] else {
        panic!("Expected EvalFile, got: {:?}", sent[0]);
    };
    assert!(std::path::Path::new(file).starts_with(staging.path()));
    assert!(std::path::Path::new(file).exists());

    env.tear_down().unwrap();
    assert!(!std::path::Path::new(file).exists());
}

#[test]
fn test_ready_under_staged_strategy_uses_same_send_path() {
    let staging = TempDir::new().unwrap();
    let transport = LoopbackTransport::silent();
    let (_env, _) = start_env(
        BridgeConfig::default()
            .with_delivery_strategy(DeliveryStrategy::StagedFile)
            .with_staging_dir(staging.path()),
        transport.clone(),
    );

    transport.deliver(r#"{"op":"ready"}"#);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let OutboundMessage::EvalFile { file } = &sent[0] else {
        panic!("Expected EvalFile, got: {:?}", sent[0]);
    };
    assert!(std::fs::read_to_string(file)
        .unwrap()
        .contains("initNamespace"));
}
