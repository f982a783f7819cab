//! Per-connection state: identifier, peer info, subscriptions, options.
//!
//! Grounded on the teacher's `socket::client_conn::SocketClientConn` split
//! (an outbound `mpsc` channel feeding a dedicated write task) generalized
//! from a PTY-frame `Vec<u8>` channel to pre-encoded wire frames here.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use indexmap::IndexSet;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::wire::encode_frame;

/// Server-minted connection identifier; also the connection's private reply
/// queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh, globally-unique identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutable, lock-guarded connection state: subscriptions, options, and the
/// replicant flag. Held only for the duration of a single dispatch call,
/// never across an `.await`.
#[derive(Debug, Default)]
struct ConnectionState {
    subscriptions: IndexSet<String>,
    options: Map<String, Value>,
    is_replicant: bool,
}

/// One accepted TCP client.
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    /// Best-effort reverse-DNS result. Resolved asynchronously after the
    /// connection is accepted (see `server::resolve_hostname`), so it starts
    /// unset; a `OnceLock` lets readers see it without locking once set.
    hostname: std::sync::OnceLock<String>,
    state: Mutex<ConnectionState>,
    outbound: UnboundedSender<bytes::Bytes>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("hostname", &self.hostname.get())
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, addr: SocketAddr, outbound: UnboundedSender<bytes::Bytes>) -> Self {
        Self {
            id,
            addr,
            hostname: std::sync::OnceLock::new(),
            state: Mutex::new(ConnectionState::default()),
            outbound,
        }
    }

    /// Record the reverse-DNS result for this connection. A no-op if it's
    /// already been set (resolution only ever completes once).
    pub fn set_hostname(&self, hostname: String) {
        let _ = self.hostname.set(hostname);
    }

    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.get().map(String::as_str)
    }

    /// Encode `(queue, message)` and queue it on this connection's outbound
    /// channel. Returns `false` if the write task has gone away (the
    /// connection is dead) or the frame failed to encode.
    pub fn send_frame(&self, queue: &str, message: &Value) -> bool {
        match encode_frame(queue, message) {
            Ok(bytes) => self.outbound.send(bytes).is_ok(),
            Err(e) => {
                log::warn!("failed to encode outbound frame for {}: {e}", self.id);
                false
            }
        }
    }

    /// Queue a reply on this connection's private queue (its own identifier).
    pub fn reply(&self, message: &Value) -> bool {
        self.send_frame(self.id.as_ref(), message)
    }

    pub fn subscribe<I: IntoIterator<Item = String>>(&self, queues: I) {
        let mut state = self.state.lock().unwrap();
        for q in queues {
            state.subscriptions.insert(q);
        }
    }

    pub fn unsubscribe<I: IntoIterator<Item = String>>(&self, queues: I) {
        let mut state = self.state.lock().unwrap();
        for q in queues {
            state.subscriptions.shift_remove(&q);
        }
    }

    pub fn is_subscribed(&self, queue: &str) -> bool {
        self.state.lock().unwrap().subscriptions.contains(queue)
    }

    /// Merge `updates` into this connection's options. A null value removes
    /// the corresponding key.
    pub fn set_options(&self, updates: Map<String, Value>) {
        let mut state = self.state.lock().unwrap();
        for (key, value) in updates {
            if value.is_null() {
                state.options.remove(&key);
            } else {
                state.options.insert(key, value);
            }
        }
    }

    pub fn is_replicant(&self) -> bool {
        self.state.lock().unwrap().is_replicant
    }

    pub fn set_replicant(&self, value: bool) {
        self.state.lock().unwrap().is_replicant = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_connection() -> (Connection, mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            ConnectionId::new(),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn test_subscribe_is_ordered_and_unique() {
        let (conn, _rx) = test_connection();
        conn.subscribe(["a".to_string(), "b".to_string(), "a".to_string()]);
        assert!(conn.is_subscribed("a"));
        assert!(conn.is_subscribed("b"));
        assert!(!conn.is_subscribed("c"));
    }

    #[test]
    fn test_unsubscribe_removes_only_named() {
        let (conn, _rx) = test_connection();
        conn.subscribe(["a".to_string(), "b".to_string()]);
        conn.unsubscribe(["a".to_string()]);
        assert!(!conn.is_subscribed("a"));
        assert!(conn.is_subscribed("b"));
    }

    #[test]
    fn test_set_options_merges_and_removes_null() {
        let (conn, _rx) = test_connection();
        let mut opts = Map::new();
        opts.insert("k1".to_string(), json!("v1"));
        opts.insert("k2".to_string(), json!(2));
        conn.set_options(opts);

        let mut remove = Map::new();
        remove.insert("k1".to_string(), Value::Null);
        conn.set_options(remove);

        let state = conn.state.lock().unwrap();
        assert!(!state.options.contains_key("k1"));
        assert_eq!(state.options["k2"], json!(2));
    }

    #[test]
    fn test_reply_sends_on_own_id_as_queue() {
        let (conn, mut rx) = test_connection();
        assert!(conn.reply(&json!({"response": "OK: test"})));
        let bytes = rx.try_recv().unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(conn.id.as_ref()));
    }

    #[test]
    fn test_send_frame_fails_after_receiver_dropped() {
        let (conn, rx) = test_connection();
        drop(rx);
        assert!(!conn.send_frame("q", &json!({})));
    }
}
