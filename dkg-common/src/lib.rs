//! Common types and constants for the DKG replication protocol.
//!
//! This crate provides the wire envelope shared by the node and any external
//! tooling: message types, the rkyv-archived [`message::Message`] and the
//! protocol constants.

pub mod constants;
pub mod message;

pub use message::{Header, Message, MessageType};
