//! End-to-end tests over a real TCP transport.
//!
//! A scripted remote host runs on a plain thread, speaking the
//! length-prefixed JSON protocol over a blocking socket.

use evalbridge::{
    BridgeConfig, EnvironmentBridge, OutboundMessage, OutputSink, SharedBuffer, TransportKind,
};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

fn write_frame(stream: &mut TcpStream, payload: &str) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(payload.as_bytes()).unwrap();
    stream.flush().unwrap();
}

fn read_request(stream: &mut TcpStream) -> Option<OutboundMessage> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).ok()?;
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload).ok()?;
    Some(serde_json::from_slice(&payload).unwrap())
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn start_env() -> (EnvironmentBridge, SharedBuffer, SocketAddr) {
    let buffer = SharedBuffer::new();
    let config = BridgeConfig::default()
        .with_port(0)
        .with_transport(TransportKind::Tcp);
    let env = EnvironmentBridge::from_config(config)
        .unwrap()
        .with_output(OutputSink::from_writer(buffer.clone()));
    let addr = env.setup().unwrap();
    (env, buffer, addr)
}

#[test]
fn test_session_over_tcp() {
    let (env, buffer, addr) = start_env();

    let remote = std::thread::spawn(move || {
        let mut stream = connect(addr);
        write_frame(&mut stream, r#"{"op":"ready"}"#);

        let mut answered = 0;
        while answered < 2 {
            let Some(OutboundMessage::Eval { code }) = read_request(&mut stream) else {
                panic!("expected an eval request");
            };
            if code.contains("initNamespace") {
                continue;
            }
            let value = if code.contains("1 + 1") { "2" } else { "4" };
            write_frame(
                &mut stream,
                &json!({"op": "print", "value": format!("\"evaluating {}\\n\"", answered)})
                    .to_string(),
            );
            write_frame(
                &mut stream,
                &json!({"op": "result", "value": value}).to_string(),
            );
            answered += 1;
        }
    });

    env.wait_for_ready(Duration::from_secs(10)).unwrap();
    assert_eq!(env.evaluate("1 + 1").unwrap(), "2");
    assert_eq!(env.evaluate("2 + 2").unwrap(), "4");
    remote.join().unwrap();

    let output = buffer.contents();
    assert!(output.contains("evaluating 0\n"));
    assert!(output.contains("evaluating 1\n"));

    env.tear_down().unwrap();
}

#[test]
fn test_remote_disconnect_fails_pending_evaluation() {
    let (env, _buffer, addr) = start_env();

    let remote = std::thread::spawn(move || {
        let mut stream = connect(addr);
        write_frame(&mut stream, r#"{"op":"ready"}"#);
        loop {
            match read_request(&mut stream) {
                Some(OutboundMessage::Eval { code }) if code.contains("initNamespace") => continue,
                // Hang up instead of answering.
                _ => break,
            }
        }
    });

    env.wait_for_ready(Duration::from_secs(10)).unwrap();
    let err = env.evaluate("never()").unwrap_err();
    assert!(err.is_disconnect(), "unexpected error: {:?}", err);
    remote.join().unwrap();

    env.tear_down().unwrap();
}

#[test]
fn test_evaluate_after_remote_left_fails_and_is_not_replayed() {
    let (env, _buffer, addr) = start_env();
    let env = std::sync::Arc::new(env);

    let mut first = connect(addr);
    write_frame(&mut first, r#"{"op":"ready"}"#);
    env.wait_for_ready(Duration::from_secs(10)).unwrap();
    drop(first);
    std::thread::sleep(Duration::from_millis(300));

    let (tx, rx) = std::sync::mpsc::channel();
    {
        let env = env.clone();
        std::thread::spawn(move || {
            let _ = tx.send(env.evaluate("1 + 1"));
        });
    }
    let err = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("evaluate blocked with no remote host attached")
        .unwrap_err();
    assert!(err.is_disconnect(), "unexpected error: {:?}", err);

    // A new remote host sees its own init directive first, never the lost request.
    let remote = std::thread::spawn(move || {
        let mut stream = connect(addr);
        write_frame(&mut stream, r#"{"op":"ready"}"#);
        let Some(OutboundMessage::Eval { code }) = read_request(&mut stream) else {
            panic!("expected an eval request");
        };
        assert!(code.contains("initNamespace"), "replayed request: {}", code);

        let Some(OutboundMessage::Eval { code }) = read_request(&mut stream) else {
            panic!("expected an eval request");
        };
        assert!(code.contains("2 + 2"));
        write_frame(&mut stream, r#"{"op":"result","value":"4"}"#);
    });

    let start = std::time::Instant::now();
    while env.ready_count() < 2 {
        assert!(start.elapsed() < Duration::from_secs(10), "second ready never arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(env.evaluate("2 + 2").unwrap(), "4");
    remote.join().unwrap();

    env.tear_down().unwrap();
}
