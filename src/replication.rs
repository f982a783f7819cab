//! Outbound replication client: connects this broker to a master as a
//! replicant, mirroring traffic both directions.
//!
//! Grounded on `aio_client.py`'s `CoreMqClientFactory`/`ReplicationClientProtocol`
//! for the connect/retry/handshake semantics, and on the teacher's
//! `socket::client_conn::SocketClientConn` split of a dedicated write task
//! fed by an `mpsc` channel behind the reader loop, for the Rust shape.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::broker::{short_label, Broker, MasterHandle};
use crate::error::CoreMqError;
use crate::wire::{encode_frame, keys, parse_payload, FrameCodec, ParsedMessage};

/// Single-try-per-peer, matching `aio_client.py`'s default `attempts=1`.
const ATTEMPTS_PER_PEER: usize = 1;
const RETRY_DELAY: Duration = Duration::from_secs(1);

fn split_host_port(node: &str, default_port: u16) -> (String, u16) {
    match node.split_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (node.to_string(), default_port),
        },
        None => (node.to_string(), default_port),
    }
}

fn is_self(name: &str, listen_port: u16, host: &str, port: u16) -> bool {
    short_label(name) == short_label(host) && listen_port == port
}

/// Drives the outbound side of a replicated cluster: connects to the first
/// reachable peer in `cluster_nodes`, completes the replicant handshake, and
/// mirrors inbound master traffic into local dispatch via [`Broker::inject`].
///
/// If `cluster_nodes` names no peer other than this broker itself, `run`
/// returns immediately and the broker remains (implicitly) a standalone
/// master — there is no separate "master" state to set, a `Broker` with no
/// `MasterHandle` already behaves as one.
pub struct ReplicationClient {
    broker: std::sync::Arc<Broker>,
    peers: Vec<(String, u16)>,
}

impl ReplicationClient {
    #[must_use]
    pub fn new(broker: std::sync::Arc<Broker>, cluster_nodes: &[String]) -> Self {
        let listen_port = broker.listen_port;
        let name = broker.name.clone();
        let peers = cluster_nodes
            .iter()
            .map(|n| split_host_port(n, listen_port))
            .filter(|(host, port)| !is_self(&name, listen_port, host, *port))
            .collect();
        Self { broker, peers }
    }

    /// Run until `shutdown` is cancelled, reconnecting and re-electing a
    /// master for as long as the process is up.
    pub async fn run(self, shutdown: CancellationToken) {
        if self.peers.is_empty() {
            log::info!(
                "This server is the only one listed in cluster_nodes, assuming role of master MQ"
            );
            return;
        }

        let mut connected_once = false;

        loop {
            if shutdown.is_cancelled() || self.broker.is_shutting_down() {
                return;
            }

            match self.run_session(&shutdown).await {
                Some(()) => {
                    connected_once = true;
                }
                None => {
                    self.broker.clear_master();
                    if connected_once {
                        log::warn!(
                            "Lost connection to master and no others are available. Assuming role of master MQ"
                        );
                    } else {
                        log::info!("No other CoreMQ servers found. Assuming role of master MQ");
                    }
                }
            }

            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// One full pass over the peer list, returning `Some(())` if a session
    /// was established (even if it has since disconnected) or `None` if
    /// every peer in the list refused the connection.
    async fn run_session(&self, shutdown: &CancellationToken) -> Option<()> {
        for (host, port) in &self.peers {
            for _ in 0..ATTEMPTS_PER_PEER {
                match self.try_peer(host, *port).await {
                    Ok(()) => return Some(()),
                    Err(e) => {
                        log::warn!(
                            "Failed to connect to CoreMQ {host}:{port}: {e}. Retrying in 1 second..."
                        );
                        tokio::select! {
                            () = shutdown.cancelled() => return None,
                            () = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
        None
    }

    /// Connect to one peer, complete the handshake, and drive the session
    /// until disconnect. Returns `Ok(())` once TCP connects, regardless of
    /// how the session subsequently ends — a connect that succeeds but
    /// whose handshake then fails still counts as "we found a master".
    async fn try_peer(&self, host: &str, port: u16) -> io::Result<()> {
        let stream = TcpStream::connect((host, port)).await?;
        let peer_label = format!("{host}:{port}");
        let (mut writer, mut reader) = Framed::new(stream, FrameCodec::new()).split();

        let first_frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::warn!("frame error from {peer_label} before handshake: {e}");
                return Ok(());
            }
            None => {
                log::warn!("{peer_label} closed the connection before sending a welcome frame");
                return Ok(());
            }
        };
        let first_parsed = match parse_payload(&first_frame.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("malformed welcome frame from {peer_label}: {e}");
                return Ok(());
            }
        };
        let own_id = first_parsed.queue.clone();

        log::info!("Connected to CoreMQ {peer_label}, assigned {own_id}");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let write_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(e) = writer.send(bytes).await {
                    log::warn!("write error to replication master: {e}");
                    break;
                }
            }
        });

        self.broker
            .set_master(MasterHandle::new(outbound_tx.clone(), peer_label.clone()));

        let mut handshake = Map::new();
        handshake.insert(
            keys::REPLICANT.to_string(),
            Value::String(self.broker.server_identity()),
        );
        match encode_frame(&own_id, &Value::Object(handshake)) {
            Ok(bytes) => {
                let _ = outbound_tx.send(bytes);
            }
            Err(e) => log::error!("failed to encode replication handshake: {e}"),
        }

        if self.handle_inbound(&own_id, first_parsed) {
            loop {
                match reader.next().await {
                    Some(Ok(frame)) => match parse_payload(&frame.payload) {
                        Ok(parsed) => {
                            if !self.handle_inbound(&own_id, parsed) {
                                break;
                            }
                        }
                        Err(e) => log::warn!("malformed frame from master: {e}"),
                    },
                    Some(Err(e)) => {
                        if !matches!(e, CoreMqError::ConnectionClosed) {
                            log::warn!("frame decode error from master: {e}");
                        }
                        break;
                    }
                    None => break,
                }
            }
        }

        self.broker.clear_master();
        write_task.abort();
        log::info!("disconnected from CoreMQ master {peer_label}");
        Ok(())
    }

    /// Mirrors `ReplicationClientProtocol::new_message`: a reply addressed
    /// to our own identifier carrying a `Replication` response is the
    /// handshake ack, absorbed silently if `OK:`-prefixed; anything else is
    /// treated as a fatal handshake rejection. Every other frame — including
    /// the welcome frame itself, matching the original's behavior — is
    /// injected into local dispatch. Returns `false` if the session should
    /// stop reading (handshake rejected).
    fn handle_inbound(&self, own_id: &str, parsed: ParsedMessage) -> bool {
        let is_ack = parsed.queue == own_id
            && parsed
                .message
                .get("response")
                .and_then(Value::as_str)
                .is_some_and(|r| r.contains("Replication"));

        if is_ack {
            let response = parsed.message["response"].as_str().unwrap_or_default();
            if response.starts_with("OK:") {
                return true;
            }
            log::error!("replication handshake rejected by master: {response}");
            return false;
        }

        self.broker.inject(&parsed.queue, parsed.message);
        true
    }
}
