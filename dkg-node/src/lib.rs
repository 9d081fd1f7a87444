//! Knowledge-graph replication node
//!
//! A command executor drives every operation as a chain of named commands:
//! shard selection over a membership-aware XOR routing table, optional local
//! steps, then one INIT/REQUEST handshake per selected peer. Per-peer chains
//! are aggregated by the operation service into a single completed or failed
//! record.

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod find_shard;
pub mod journal;
pub mod local;
pub mod maintenance;
pub mod network;
pub mod network_protocol;
pub mod node;
pub mod operation;
pub mod protocol;
pub mod repository;
pub mod routing;
pub mod server;
pub mod sharding;
pub mod store;
pub mod transport;
pub mod types;

// Re-export key types for convenience
pub use command::{Command, CommandData, CommandHandler, CommandRegistry, Outcome, Sequence};
pub use config::NodeConfig;
pub use context::Context;
pub use error::{NodeError, Result};
pub use executor::CommandExecutor;
pub use node::{AssertionRequest, Node, TransportKind};
pub use operation::{OperationId, OperationRecord, OperationStatus};
pub use types::{BlockchainId, OperationKind, PeerId};
