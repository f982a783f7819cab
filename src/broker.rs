//! Process-wide broker state: connection registry, history, replication.
//!
//! Grounded on `socket::server`/`socket::client_conn`'s split of "accept
//! loop owns sockets, a shared state struct owns everything else" — but
//! unlike the teacher's single `Hub` event channel, there is no central
//! actor here: spec.md §5 models a single-threaded event loop where
//! dispatch runs to completion between I/O events, so each connection's
//! read task calls into `Broker` directly, synchronously, guarded by
//! ordinary mutexes rather than routed through a channel.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::{Connection, ConnectionId};
use crate::history::HistoryStore;
use crate::message::{Command, MessageExt};
use crate::wire::normalize_queue_list;

/// Outcome of a single dispatch call, telling the connection's read task
/// whether to keep the socket open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Close,
}

/// Handle to an upstream master connection (present iff this broker is
/// running as a replicant). Owned by the replication client's writer task;
/// the broker only ever forwards frames through it.
#[derive(Debug)]
pub struct MasterHandle {
    outbound: UnboundedSender<Bytes>,
    /// The server string this client connected to (spec.md §4.3: `status`'s
    /// `replicant_of` field), e.g. `"node-a:6747"`.
    pub connected_server: String,
}

impl MasterHandle {
    #[must_use]
    pub fn new(outbound: UnboundedSender<Bytes>, connected_server: String) -> Self {
        Self {
            outbound,
            connected_server,
        }
    }

    fn forward(&self, queue: &str, message: &Value) -> bool {
        match crate::wire::encode_frame(queue, message) {
            Ok(bytes) => self.outbound.send(bytes).is_ok(),
            Err(e) => {
                log::warn!("failed to encode frame for master forward: {e}");
                false
            }
        }
    }
}

pub(crate) fn short_label(host: &str) -> String {
    let without_port = host.split(':').next().unwrap_or(host);
    without_port
        .split('.')
        .next()
        .unwrap_or(without_port)
        .to_lowercase()
}

/// Process-wide broker state, owned by `main`/the test harness and shared
/// via `Arc` with every connection task and the replication client.
pub struct Broker {
    /// Local hostname, lowercased.
    pub name: String,
    pub listen_port: u16,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    replicant_names: Mutex<HashMap<ConnectionId, String>>,
    history: HistoryStore,
    allowed_replicants: Vec<String>,
    master: RwLock<Option<MasterHandle>>,
    shutting_down: AtomicBool,
}

impl Broker {
    #[must_use]
    pub fn new(name: String, listen_port: u16, cluster_nodes: &[String], allowed_replicants: &[String]) -> Arc<Self> {
        let mut allowed: Vec<String> = allowed_replicants.iter().map(|h| short_label(h)).collect();
        allowed.extend(cluster_nodes.iter().map(|h| short_label(h)));

        Arc::new(Self {
            name,
            listen_port,
            connections: RwLock::new(HashMap::new()),
            replicant_names: Mutex::new(HashMap::new()),
            history: HistoryStore::new(),
            allowed_replicants: allowed,
            master: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn server_identity(&self) -> String {
        format!("{}:{}", self.name, self.listen_port)
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections.write().unwrap().insert(conn.id.clone(), conn);
    }

    pub fn deregister(&self, id: &ConnectionId) {
        self.connections.write().unwrap().remove(id);
        self.replicant_names.lock().unwrap().remove(id);
    }

    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(id).cloned()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn set_master(&self, handle: MasterHandle) {
        *self.master.write().unwrap() = Some(handle);
    }

    pub fn clear_master(&self) {
        *self.master.write().unwrap() = None;
    }

    #[must_use]
    pub fn has_master(&self) -> bool {
        self.master.read().unwrap().is_some()
    }

    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Is `hostname`/`ip` permitted to complete a replicant handshake?
    /// Grounded on `aio_server.py::begin_replication`: compares the raw peer
    /// IP string and the lowercased first DNS label of the resolved
    /// hostname against `allowed_replicants ∪ cluster_nodes`.
    #[must_use]
    pub fn is_allowed_replicant(&self, hostname: Option<&str>, ip: &IpAddr) -> bool {
        if let Some(h) = hostname {
            if self.allowed_replicants.contains(&short_label(h)) {
                return true;
            }
        }
        let ip_string = ip.to_string();
        self.allowed_replicants.iter().any(|a| a == &ip_string)
    }

    /// Inject a mirrored publish from the replication client into local
    /// dispatch, exactly as if a local client had published it: store +
    /// broadcast, no reply (there is no originating connection to reply to).
    pub fn inject(&self, queue: &str, mut message: Map<String, Value>) {
        self.history.push(queue, Value::Object(message.clone()));
        self.broadcast(queue, &mut message);
    }

    /// Run the full command-dispatch priority order (spec.md §4.3) for a
    /// frame received on `conn`.
    pub fn dispatch(&self, conn: &Arc<Connection>, queue: String, mut message: Map<String, Value>) -> DispatchOutcome {
        // "First observation" stamp: whichever broker sees a message with no
        // coremq_server yet is the origin; everything downstream treats this
        // as a relayed/injected message and suppresses the ack reply.
        let quiet = message.server().is_some();
        if !quiet {
            message.stamp_server(&self.server_identity());
        }

        let reply_to: ConnectionId = match message.fwdto() {
            Some(fwdto) if conn.is_replicant() => fwdto.into(),
            _ => conn.id.clone(),
        };

        let outcome = match message.command() {
            Some(Command::Subscribe) => {
                self.handle_subscribe(conn, &message, &reply_to, quiet);
                DispatchOutcome::Continue
            }
            Some(Command::Unsubscribe) => {
                self.handle_unsubscribe(conn, &message, &reply_to, quiet);
                DispatchOutcome::Continue
            }
            Some(Command::Options) => {
                self.handle_options(conn, &message, &reply_to, quiet);
                DispatchOutcome::Continue
            }
            Some(Command::GetHistory) => {
                self.handle_get_history(&message, &reply_to);
                DispatchOutcome::Continue
            }
            Some(Command::Replicant) => self.handle_replicant(conn, &message),
            Some(Command::Status) => {
                self.handle_status(&reply_to);
                DispatchOutcome::Continue
            }
            None => {
                self.handle_publish(&queue, message, &reply_to, quiet);
                DispatchOutcome::Continue
            }
        };

        outcome
    }

    fn respond(&self, to: &ConnectionId, body: Value, quiet: bool) {
        if quiet {
            return;
        }
        if let Some(target) = self.get(to) {
            target.send_frame(to.as_ref(), &body);
        }
    }

    fn handle_subscribe(&self, conn: &Arc<Connection>, message: &Map<String, Value>, to: &ConnectionId, quiet: bool) {
        match message
            .get(crate::wire::keys::SUBSCRIBE)
            .map(normalize_queue_list)
            .unwrap_or_else(|| Ok(Vec::new()))
        {
            Ok(queues) => {
                conn.subscribe(queues);
                self.respond(to, serde_json::json!({"response": "OK: Subscribe successful"}), quiet);
            }
            Err(e) => self.respond(to, serde_json::json!({"response": format!("ERROR: {e}")}), quiet),
        }
    }

    fn handle_unsubscribe(&self, conn: &Arc<Connection>, message: &Map<String, Value>, to: &ConnectionId, quiet: bool) {
        match message
            .get(crate::wire::keys::UNSUBSCRIBE)
            .map(normalize_queue_list)
            .unwrap_or_else(|| Ok(Vec::new()))
        {
            Ok(queues) => {
                conn.unsubscribe(queues);
                self.respond(to, serde_json::json!({"response": "OK: Unsubscribe successful"}), quiet);
            }
            Err(e) => self.respond(to, serde_json::json!({"response": format!("ERROR: {e}")}), quiet),
        }
    }

    fn handle_options(&self, conn: &Arc<Connection>, message: &Map<String, Value>, to: &ConnectionId, quiet: bool) {
        match message.get(crate::wire::keys::OPTIONS) {
            Some(Value::Object(opts)) => {
                conn.set_options(opts.clone());
                self.respond(to, serde_json::json!({"response": "OK: Options set"}), quiet);
            }
            _ => self.respond(
                to,
                serde_json::json!({"response": "ERROR: coremq_options must be an object"}),
                quiet,
            ),
        }
    }

    fn handle_get_history(&self, message: &Map<String, Value>, to: &ConnectionId) {
        let queues = match message
            .get(crate::wire::keys::GETHISTORY)
            .map(normalize_queue_list)
        {
            Some(Ok(queues)) => queues,
            _ => {
                self.respond(to, serde_json::json!({"response": "ERROR: coremq_gethistory requires a queue name or list"}), false);
                return;
            }
        };

        let mut result = Map::new();
        for q in queues {
            if let Some(snapshot) = self.history.snapshot(&q) {
                result.insert(q, Value::Array(snapshot));
            }
        }
        self.respond(to, serde_json::json!({"history": Value::Object(result)}), false);
    }

    fn handle_replicant(&self, conn: &Arc<Connection>, message: &Map<String, Value>) -> DispatchOutcome {
        let declared_name = match message.get(crate::wire::keys::REPLICANT).and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                conn.reply(&serde_json::json!({"response": "ERROR: coremq_replicant requires a name"}));
                return DispatchOutcome::Close;
            }
        };

        if self.is_allowed_replicant(conn.hostname(), &conn.addr.ip()) {
            self.replicant_names.lock().unwrap().entry(conn.id.clone()).or_insert(declared_name);
            conn.set_replicant(true);
            conn.reply(&serde_json::json!({"response": "OK: Replication request successful"}));
            log::info!("new replicant: {}", conn.hostname().unwrap_or_else(|| conn.id.as_ref()));
            DispatchOutcome::Continue
        } else {
            conn.reply(&serde_json::json!({"response": "ERROR: Not allowed to be a replicant"}));
            DispatchOutcome::Close
        }
    }

    fn handle_status(&self, to: &ConnectionId) {
        let replicants: Vec<String> = self.replicant_names.lock().unwrap().values().cloned().collect();
        let connections = self.connection_count();

        let body = match &*self.master.read().unwrap() {
            None => serde_json::json!({
                "master": self.name,
                "replicants": replicants,
                "connections": connections,
            }),
            Some(handle) => serde_json::json!({
                "replicant_of": handle.connected_server,
                "replicants": replicants,
                "connections": connections,
            }),
        };
        self.respond(to, body, false);
    }

    fn handle_publish(&self, queue: &str, message: Map<String, Value>, to: &ConnectionId, quiet: bool) {
        let mut message = message;
        self.history.push(queue, Value::Object(message.clone()));
        self.broadcast(queue, &mut message);
        self.respond(to, serde_json::json!({"response": "OK: Message sent"}), quiet);
    }

    /// Three-stage fan-out (spec.md §4.5): upstream to master, downstream to
    /// replicants (loop-suppressed), then local subscribers.
    fn broadcast(&self, queue: &str, message: &mut Map<String, Value>) {
        let master_guard = self.master.read().unwrap();
        if let Some(master) = master_guard.as_ref() {
            if message.master().is_none() {
                if message.fwdto().is_none() {
                    if let Some(sender) = message.sender().map(str::to_string) {
                        message.stamp_fwdto(&sender);
                    }
                }
                master.forward(queue, &Value::Object(message.clone()));
            }
        }
        let is_master = master_guard.is_none();
        drop(master_guard);

        let origin = message.server().map(str::to_string);
        let replicant_targets: Vec<(ConnectionId, String)> = self
            .replicant_names
            .lock()
            .unwrap()
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect();

        // coremq_master is only ever stamped here, inside the replicant
        // loop — a publish with no replicants to mirror to never carries it.
        if is_master && !replicant_targets.is_empty() {
            message.stamp_master(&self.name);
        }

        let mut dead = Vec::new();
        for (id, declared_name) in replicant_targets {
            if origin.as_deref() == Some(declared_name.as_str()) {
                continue;
            }
            if let Some(conn) = self.get(&id) {
                if !conn.send_frame(queue, &Value::Object(message.clone())) {
                    dead.push(id);
                }
            }
        }

        let sender = message.sender().map(str::to_string);
        let subscribers: Vec<Arc<Connection>> = self
            .connections
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();

        for conn in subscribers {
            if Some(conn.id.as_ref()) == sender.as_deref() {
                continue;
            }
            if conn.is_replicant() {
                continue;
            }
            if conn.is_subscribed(queue) && !conn.send_frame(queue, &Value::Object(message.clone())) {
                dead.push(conn.id.clone());
            }
        }

        for id in dead {
            log::warn!("dropping unreachable connection {id}");
            self.deregister(&id);
        }
    }
}
