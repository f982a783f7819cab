// Library modules
pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod message;
pub mod replication;
pub mod server;
pub mod wire;

// Re-export commonly used types
pub use broker::{Broker, DispatchOutcome, MasterHandle};
pub use client::SyncClient;
pub use config::Config;
pub use connection::{Connection, ConnectionId};
pub use error::CoreMqError;
pub use history::HistoryStore;
pub use message::{Command, MessageExt};
pub use replication::ReplicationClient;
