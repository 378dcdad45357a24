//! An async client driver for RESP2/RESP3 key-value stores.
//!
//! This crate provides the transport core for talking to a Redis-compatible
//! store without blocking the caller's event loop:
//!
//! - Incremental, binary-safe RESP2/RESP3 encoding and decoding
//! - Pipelined request/reply correlation on a strict per-connection FIFO
//! - Pub/sub push dispatch independent of reply correlation
//! - A bounded connection pool with waiter backpressure and idle recycling
//! - Cluster routing with slot hashing and MOVED/ASK redirection handling
//! - Sentinel discovery with failover notifications, plus a plain
//!   replication resolver
//!
//! The driver is command-agnostic: callers build a [`command::Command`]
//! from a name and binary-safe arguments and submit it through a
//! [`client::Client`], a [`cluster::ClusterClient`] or a raw
//! [`connection::Connection`]. Typed per-command helpers belong in a layer
//! above this crate.

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod resp;
pub mod sentinel;

pub use client::Client;
pub use cluster::ClusterClient;
pub use command::Command;
pub use config::{
    ClusterConfig, ConnectionConfig, NodeRole, PoolConfig, ProtocolVersion, ReplicaReads,
    ReplicationConfig, SentinelConfig, ServerAddr,
};
pub use connection::{ConnState, Connection, PushMessage, PushReceiver};
pub use error::{DriverError, ServerError};
pub use pool::{Pool, PooledConnection};
pub use resp::{RespError, RespValue};
pub use sentinel::{ReplicationResolver, SentinelResolver};
