//! Typed access to the `coremq_*` reserved keys on a message object.
//!
//! Dispatch code works against [`MessageExt`] rather than hand-rolling
//! `message.get("coremq_sender")` string lookups everywhere.

use serde_json::{Map, Value};

use crate::wire::keys;

/// Which control command (if any) a message carries, in dispatch priority
/// order (spec §4.3 items 1–6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Subscribe,
    Unsubscribe,
    Options,
    GetHistory,
    Replicant,
    Status,
}

pub trait MessageExt {
    fn sender(&self) -> Option<&str>;
    fn sent(&self) -> Option<f64>;
    fn server(&self) -> Option<&str>;
    fn master(&self) -> Option<&str>;
    fn fwdto(&self) -> Option<&str>;

    fn stamp_sender(&mut self, id: &str);
    fn stamp_sent(&mut self, timestamp: f64);
    fn stamp_server(&mut self, server: &str);
    fn stamp_master(&mut self, name: &str);
    fn stamp_fwdto(&mut self, id: &str);

    /// Which reserved command key is present, if any, checked in the fixed
    /// priority order the dispatcher uses.
    fn command(&self) -> Option<Command>;
}

impl MessageExt for Map<String, Value> {
    fn sender(&self) -> Option<&str> {
        self.get(keys::SENDER).and_then(Value::as_str)
    }

    fn sent(&self) -> Option<f64> {
        self.get(keys::SENT).and_then(Value::as_f64)
    }

    fn server(&self) -> Option<&str> {
        self.get(keys::SERVER).and_then(Value::as_str)
    }

    fn master(&self) -> Option<&str> {
        self.get(keys::MASTER).and_then(Value::as_str)
    }

    fn fwdto(&self) -> Option<&str> {
        self.get(keys::FWDTO).and_then(Value::as_str)
    }

    fn stamp_sender(&mut self, id: &str) {
        self.insert(keys::SENDER.to_string(), Value::String(id.to_string()));
    }

    fn stamp_sent(&mut self, timestamp: f64) {
        self.insert(
            keys::SENT.to_string(),
            serde_json::Number::from_f64(timestamp)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
    }

    fn stamp_server(&mut self, server: &str) {
        self.insert(
            keys::SERVER.to_string(),
            Value::String(server.to_string()),
        );
    }

    fn stamp_master(&mut self, name: &str) {
        self.insert(
            keys::MASTER.to_string(),
            Value::String(name.to_string()),
        );
    }

    fn stamp_fwdto(&mut self, id: &str) {
        self.insert(keys::FWDTO.to_string(), Value::String(id.to_string()));
    }

    fn command(&self) -> Option<Command> {
        if self.contains_key(keys::SUBSCRIBE) {
            Some(Command::Subscribe)
        } else if self.contains_key(keys::UNSUBSCRIBE) {
            Some(Command::Unsubscribe)
        } else if self.contains_key(keys::OPTIONS) {
            Some(Command::Options)
        } else if self.contains_key(keys::GETHISTORY) {
            Some(Command::GetHistory)
        } else if self.contains_key(keys::REPLICANT) {
            Some(Command::Replicant)
        } else if self.contains_key(keys::STATUS) {
            Some(Command::Status)
        } else {
            None
        }
    }
}
