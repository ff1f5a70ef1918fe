//! # EmberKV - A Concurrent In-Memory Key-Value Cache
//!
//! EmberKV stores scalar values (byte strings and 64-bit integers) under
//! byte-string keys, expires them on a per-key deadline, and survives restarts
//! through crash-consistent snapshots.
//!
//! ## Features
//!
//! - **Sharded Store**: 64 independently locked shards
//! - **Atomic Counters**: `INCR`/`DECR` run as one read-modify-write under a
//!   single shard lock
//! - **Two-Way Expiry**: lazy on access, plus a deadline-driven background
//!   sweeper fed by per-shard min-heaps
//! - **Snapshots**: write temp file, fsync, rename; never a torn file on disk
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              EmberKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │──── SAVE ────┐   │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘              │   │
//! │                                               │                     ▼   │
//! │  ┌─────────────┐    ┌─────────────────────────▼────────────┐ ┌────────┐ │
//! │  │   Line      │    │                 Store                │ │Snapshot│ │
//! │  │   Parser    │    │  ┌────────┐ ┌────────┐ ┌────────┐    │<│Schedul-│ │
//! │  │             │    │  │Shard 0 │ │Shard 1 │ │...63   │    │ │  er    │ │
//! │  └─────────────┘    │  │map+heap│ │map+heap│ │        │    │ └────────┘ │
//! │                     │  └────────┘ └────────┘ └────────┘    │            │
//! │                     └──────────────────────────────────────┘            │
//! │                                      ▲                                  │
//! │                     ┌────────────────┴────────────────┐                 │
//! │                     │          ExpirySweeper          │                 │
//! │                     │     (Background Tokio Task)     │                 │
//! │                     └─────────────────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberkv::commands::CommandHandler;
//! use emberkv::connection::{handle_connection, ConnectionStats};
//! use emberkv::persistence::{PersistenceConfig, SnapshotScheduler};
//! use emberkv::storage::{start_expiry_sweeper, Store};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(Store::new());
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&store));
//!     let snapshots = SnapshotScheduler::start(Arc::clone(&store), PersistenceConfig::default());
//!     let stats = Arc::new(ConnectionStats::new());
//!
//!     let listener = TcpListener::bind("127.0.0.1:7379").await.unwrap();
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         let handler = CommandHandler::with_saver(Arc::clone(&store), snapshots.trigger());
//!         tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: the store, its expiry index and the background sweeper
//! - [`commands`]: command parsing and execution
//! - [`persistence`]: snapshot format, atomic save/load and the save scheduler
//! - [`protocol`]: request line parser and reply encoding
//! - [`connection`]: client connection management

pub mod commands;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{Command, CommandError, CommandHandler, Response};
pub use connection::{handle_connection, ConnectionStats};
pub use persistence::{Persistence, PersistenceConfig, PersistenceError, SnapshotScheduler};
pub use protocol::{LineParser, ParseError, Reply};
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, Store};

/// The default port EmberKV listens on
pub const DEFAULT_PORT: u16 = 7379;

/// The default host EmberKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
