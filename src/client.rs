//! Blocking convenience client for talking to a CoreMQ broker from
//! synchronous code (scripts, tests, simple producers/consumers).
//!
//! Grounded on `coremq_client.py`'s `MessageQueue`: connect, learn your own
//! identifier from the welcome frame's queue name, then `subscribe`/
//! `unsubscribe`/`set_options`/`get_history` are all "send a control frame on
//! your own queue, then wait for the ack frame" round trips. Deliberately
//! does NOT reproduce `coremq_common.get_message`'s `recv(10)` header read,
//! which truncates the length header whenever a frame's JSON payload pushes
//! the decimal length past 9 digits — read the header byte-at-a-time instead.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::wire::{encode_frame, keys, parse_payload};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A single synchronous connection to a CoreMQ broker.
pub struct SyncClient {
    stream: TcpStream,
    /// This connection's server-assigned identifier — also its private
    /// reply queue — learned from the first (welcome) frame.
    connection_id: String,
}

impl SyncClient {
    /// Connect to `addr` (`host:port`) and read the welcome frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection fails, or if the welcome frame
    /// cannot be read within [`DEFAULT_TIMEOUT`].
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let mut client = Self {
            stream,
            connection_id: String::new(),
        };
        match client.recv_with_timeout(DEFAULT_TIMEOUT)? {
            Some((queue, _welcome)) => client.connection_id = queue,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no welcome frame received",
                ))
            }
        }
        Ok(client)
    }

    /// This connection's server-assigned identifier.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn send_and_ack(&mut self, body: Map<String, Value>) -> io::Result<Option<(String, Value)>> {
        let id = self.connection_id.clone();
        self.send(&id, &Value::Object(body))?;
        self.recv_with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn subscribe(&mut self, queues: &[&str]) -> io::Result<Option<(String, Value)>> {
        let mut body = Map::new();
        body.insert(keys::SUBSCRIBE.to_string(), serde_json::json!(queues));
        self.send_and_ack(body)
    }

    pub fn unsubscribe(&mut self, queues: &[&str]) -> io::Result<Option<(String, Value)>> {
        let mut body = Map::new();
        body.insert(keys::UNSUBSCRIBE.to_string(), serde_json::json!(queues));
        self.send_and_ack(body)
    }

    pub fn set_options(&mut self, options: Map<String, Value>) -> io::Result<Option<(String, Value)>> {
        let mut body = Map::new();
        body.insert(keys::OPTIONS.to_string(), Value::Object(options));
        self.send_and_ack(body)
    }

    pub fn get_history(&mut self, queues: &[&str]) -> io::Result<Option<(String, Value)>> {
        let mut body = Map::new();
        body.insert(keys::GETHISTORY.to_string(), serde_json::json!(queues));
        self.send_and_ack(body)
    }

    /// Publish `message` to `queue` and wait for the broker's ack.
    pub fn publish(&mut self, queue: &str, message: &Value) -> io::Result<Option<(String, Value)>> {
        self.send(queue, message)?;
        self.recv_with_timeout(DEFAULT_TIMEOUT)
    }

    fn send(&mut self, queue: &str, message: &Value) -> io::Result<()> {
        let frame = encode_frame(queue, message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.stream.write_all(&frame)
    }

    /// Block for up to `timeout` for the next frame. Returns `None` on
    /// timeout, `Some((queue, message))` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or a malformed frame is
    /// received.
    pub fn recv_with_timeout(&mut self, timeout: Duration) -> io::Result<Option<(String, Value)>> {
        self.stream.set_read_timeout(Some(timeout))?;

        let mut header = Vec::with_capacity(9);
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
                }
                Ok(_) if byte[0] == b' ' => break,
                Ok(_) => {
                    header.push(byte[0]);
                    if header.len() > 16 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing space after length",
                        ));
                    }
                }
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }

        if header.first() != Some(&b'+') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing beginning +"));
        }
        let length: usize = std::str::from_utf8(&header[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "length integer must be between + and space")
            })?;

        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;

        let parsed = parse_payload(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Some((parsed.queue, Value::Object(parsed.message))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_connect_learns_id_from_welcome_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let welcome = encode_frame(
                "conn-42",
                &serde_json::json!({"response": "OK: Welcome to CoreMQ server", "server": "broker1"}),
            )
            .unwrap();
            stream.write_all(&welcome).unwrap();
        });

        let client = SyncClient::connect(&addr.to_string()).unwrap();
        assert_eq!(client.connection_id(), "conn-42");
        handle.join().unwrap();
    }

    #[test]
    fn test_recv_with_timeout_returns_none_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let welcome = encode_frame("conn-1", &serde_json::json!({"response": "OK"})).unwrap();
            stream.write_all(&welcome).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut client = SyncClient::connect(&addr.to_string()).unwrap();
        let result = client.recv_with_timeout(Duration::from_millis(50)).unwrap();
        assert!(result.is_none());
        handle.join().unwrap();
    }

    #[test]
    fn test_subscribe_round_trips_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let welcome = encode_frame("conn-7", &serde_json::json!({"response": "OK"})).unwrap();
            stream.write_all(&welcome).unwrap();

            let mut header = [0u8; 32];
            let n = stream.read(&mut header).unwrap();
            assert!(String::from_utf8_lossy(&header[..n]).contains("coremq_subscribe"));

            let ack = encode_frame("conn-7", &serde_json::json!({"response": "OK: Subscribe successful"})).unwrap();
            stream.write_all(&ack).unwrap();
        });

        let mut client = SyncClient::connect(&addr.to_string()).unwrap();
        let (queue, ack) = client.subscribe(&["orders"]).unwrap().unwrap();
        assert_eq!(queue, "conn-7");
        assert_eq!(ack["response"], "OK: Subscribe successful");
        handle.join().unwrap();
    }
}
