use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use skyrelay_rpc::envelope::ValueStream;
use skyrelay_rpc::{RpcClient, RpcError, SimConnector, SimSession, TcpConnector, Value};

fn encode(v: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, v).unwrap();
    out
}

/// Tiny msgpack-rpc server: answers `ping` with "pong", `fail` with an error,
/// `image` with a large binary blob, and hangs up on `quit`.
fn serve_one(mut sock: TcpStream) {
    let mut decoder = ValueStream::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match sock.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.feed(&buf[..n]);
        while let Some(req) = decoder.next_value().unwrap() {
            let items = req.as_array().unwrap();
            let id = items[1].clone();
            let (error, result) = match items[2].as_str().unwrap() {
                "ping" => (Value::Nil, Value::from("pong")),
                "fail" => (Value::from("boom"), Value::Nil),
                "image" => (Value::Nil, Value::Binary(vec![0xAB; 200_000])),
                _ => return,
            };
            let reply = Value::Array(vec![Value::from(1), id, error, result]);
            sock.write_all(&encode(&reply)).unwrap();
        }
    }
}

fn spawn_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for sock in listener.incoming().flatten() {
            thread::spawn(move || serve_one(sock));
        }
    });
    port
}

#[test]
fn call_round_trips_over_tcp() {
    let port = spawn_server();
    let mut client = RpcClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();

    assert_eq!(client.call("ping", vec![]).unwrap().as_str(), Some("pong"));

    match client.call("fail", vec![]) {
        Err(RpcError::Remote(v)) => assert_eq!(v.as_str(), Some("boom")),
        other => panic!("expected remote error, got {:?}", other),
    }

    let image = client.call("image", vec![Value::from("0"), Value::from(0)]).unwrap();
    match image {
        Value::Binary(b) => assert_eq!(b.len(), 200_000),
        other => panic!("expected binary, got {:?}", other),
    }
    assert!(client.is_open());
}

#[test]
fn server_hangup_fails_call_and_closes_handle() {
    let port = spawn_server();
    let mut client = RpcClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();

    let err = client.call("quit", vec![]).unwrap_err();
    assert!(err.is_connection(), "unexpected error: {:?}", err);
    assert!(!client.is_open());
    assert!(client.call("ping", vec![]).unwrap_err().is_connection());
}

#[test]
fn connector_opens_fresh_sessions() {
    let port = spawn_server();
    let connector = TcpConnector { host: "127.0.0.1".into(), port, timeout: Duration::from_secs(2) };

    let mut a = connector.connect().unwrap();
    let mut b = connector.connect().unwrap();
    assert_eq!(SimSession::call(&mut a, "ping", vec![]).unwrap().as_str(), Some("pong"));
    assert_eq!(SimSession::call(&mut b, "ping", vec![]).unwrap().as_str(), Some("pong"));
}

#[test]
fn unreachable_endpoint_is_a_connection_error() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let err = RpcClient::connect("127.0.0.1", port, Duration::from_millis(500)).err().unwrap();
    assert!(err.is_connection());
}
