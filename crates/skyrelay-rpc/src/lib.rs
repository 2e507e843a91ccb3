//! Minimal blocking msgpack-rpc client for the simulator's RPC endpoint.
//!
//! One request in flight per connection: `call` takes `&mut self`, writes the
//! whole request envelope and reads until the matching reply arrives. Any
//! transport failure closes the socket; reconnecting is the caller's job.
//!
//! All calls block. Async callers must run them on a blocking worker
//! (`tokio::task::spawn_blocking`).

pub mod envelope;
pub mod error;

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub use error::RpcError;
pub use rmpv::Value;
use tracing::debug;

use crate::envelope::ValueStream;

/// Simulator replies carry whole compressed images, so read in large chunks.
const READ_CHUNK: usize = 64 * 1024;

pub struct RpcClient<S = TcpStream> {
    stream: Option<S>,
    last_id: u64,
    decoder: ValueStream,
    read_buf: Box<[u8]>,
}

impl RpcClient<TcpStream> {
    /// `timeout` bounds the connect and every subsequent read/write.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, RpcError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}:{}", host, port)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        debug!("rpc: connected to {}", addr);
        Ok(Self::from_stream(stream))
    }
}

impl<S: Read + Write> RpcClient<S> {
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: Some(stream),
            last_id: 0,
            decoder: ValueStream::new(),
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[cfg(test)]
    fn last_id(&self) -> u64 {
        self.last_id
    }

    pub fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if self.stream.is_none() {
            return Err(RpcError::not_connected());
        }
        self.last_id += 1;
        let id = self.last_id;

        match self.round_trip(id, method, args) {
            Ok(outcome) => outcome.map_err(RpcError::Remote),
            Err(e) => {
                // The byte stream can no longer be trusted to line up with
                // our ids, so the handle is finished.
                self.close();
                Err(e)
            }
        }
    }

    /// Releases the socket. Safe to call any number of times.
    pub fn close(&mut self) {
        self.stream = None;
        self.decoder.clear();
    }

    fn round_trip(&mut self, id: u64, method: &str, args: Vec<Value>) -> Result<Result<Value, Value>, RpcError> {
        let frame = envelope::encode_request(id, method, args)?;
        {
            let stream = self.stream.as_mut().ok_or_else(RpcError::not_connected)?;
            stream.write_all(&frame)?;
            stream.flush()?;
        }
        self.read_reply(id)
    }

    fn read_reply(&mut self, id: u64) -> Result<Result<Value, Value>, RpcError> {
        loop {
            while let Some(value) = self.decoder.next_value()? {
                match envelope::parse_reply(value) {
                    Some(reply) if reply.id == id => return Ok(reply.outcome),
                    Some(reply) => debug!("rpc: discarding reply for id {} (waiting on {})", reply.id, id),
                    None => debug!("rpc: ignoring non-reply message"),
                }
            }

            let stream = self.stream.as_mut().ok_or_else(RpcError::not_connected)?;
            let n = match stream.read(&mut self.read_buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(RpcError::closed());
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }
}

/// One open simulator session. Implementations block.
pub trait SimSession: Send + 'static {
    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;
}

/// Opens simulator sessions. Implementations block.
pub trait SimConnector: Send + Sync + 'static {
    type Session: SimSession;

    fn connect(&self) -> Result<Self::Session, RpcError>;
}

impl<S: Read + Write + Send + 'static> SimSession for RpcClient<S> {
    fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        RpcClient::call(self, method, args)
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl SimConnector for TcpConnector {
    type Session = RpcClient<TcpStream>;

    fn connect(&self) -> Result<Self::Session, RpcError> {
        RpcClient::connect(&self.host, self.port, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn encode(v: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, v).unwrap();
        out
    }

    /// In-memory peer. Every request written to it is answered by `respond`,
    /// and the encoded answer is handed back in small chunks.
    struct FakePeer {
        requests: ValueStream,
        seen_ids: Vec<u64>,
        pending: VecDeque<Vec<u8>>,
        respond: fn(u64, &str) -> Vec<Value>,
        chunk: usize,
    }

    impl FakePeer {
        fn new(respond: fn(u64, &str) -> Vec<Value>) -> Self {
            Self { requests: ValueStream::new(), seen_ids: Vec::new(), pending: VecDeque::new(), respond, chunk: 3 }
        }
    }

    impl Write for FakePeer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.requests.feed(buf);
            while let Some(req) = self.requests.next_value().unwrap() {
                let items = req.as_array().unwrap().clone();
                assert_eq!(items.len(), 4);
                assert_eq!(items[0].as_u64(), Some(0));
                let id = items[1].as_u64().unwrap();
                self.seen_ids.push(id);
                let mut out = Vec::new();
                for v in (self.respond)(id, items[2].as_str().unwrap()) {
                    out.extend(encode(&v));
                }
                for c in out.chunks(self.chunk) {
                    self.pending.push_back(c.to_vec());
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakePeer {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.pending.pop_front() else { return Ok(0); };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    fn reply(id: u64, error: Value, result: Value) -> Value {
        Value::Array(vec![Value::from(1), Value::from(id), error, result])
    }

    #[test]
    fn ids_strictly_increase_across_calls() {
        let mut client = RpcClient::from_stream(FakePeer::new(|id, _| vec![reply(id, Value::Nil, Value::from(id))]));

        for expected in 1..=5u64 {
            let out = client.call("ping", vec![]).unwrap();
            assert_eq!(out.as_u64(), Some(expected));
            assert_eq!(client.last_id(), expected);
        }
        let peer = client.stream.as_ref().unwrap();
        assert_eq!(peer.seen_ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn malformed_and_foreign_envelopes_are_not_matched() {
        let mut client = RpcClient::from_stream(FakePeer::new(|id, _| {
            vec![
                // 3 elements
                Value::Array(vec![Value::from(1), Value::from(id), Value::Nil]),
                // wrong message type
                Value::Array(vec![Value::from(0), Value::from(id), Value::Nil, Value::from("bogus")]),
                // stale id
                reply(id + 100, Value::Nil, Value::from("stale")),
                reply(id, Value::Nil, Value::from("real")),
            ]
        }));

        let out = client.call("simGetImage", vec![Value::from("0"), Value::from(0)]).unwrap();
        assert_eq!(out.as_str(), Some("real"));
        assert!(client.is_open());
    }

    #[test]
    fn remote_error_is_surfaced_and_connection_survives() {
        let mut client = RpcClient::from_stream(FakePeer::new(|id, method| {
            if method == "bad" {
                vec![reply(id, Value::from("unknown method"), Value::Nil)]
            } else {
                vec![reply(id, Value::Nil, Value::Boolean(true))]
            }
        }));

        match client.call("bad", vec![]) {
            Err(RpcError::Remote(v)) => assert_eq!(v.as_str(), Some("unknown method")),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert!(client.is_open());
        assert_eq!(client.call("good", vec![]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn peer_close_invalidates_handle() {
        let mut client = RpcClient::from_stream(FakePeer::new(|_, _| vec![]));

        let err = client.call("ping", vec![]).unwrap_err();
        assert!(err.is_connection());
        assert!(!client.is_open());

        let err = client.call("ping", vec![]).unwrap_err();
        assert!(err.is_connection());

        client.close();
        client.close();
    }
}
