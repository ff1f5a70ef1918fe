//! Storage Module
//!
//! The in-memory key space and everything that expires it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐        │
//! │  │ Shard 0  │ │ Shard 1  │ │ Shard 2  │ │...64     │        │
//! │  │ entries  │ │ entries  │ │ entries  │ │ shards   │        │
//! │  │ + heap   │ │ + heap   │ │ + heap   │ │          │        │
//! │  └──────────┘ └──────────┘ └──────────┘ └──────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//!                  ▲                         ▲
//!                  │ reap_due()              │ snapshot() / restore()
//!     ┌────────────┴─────────────┐   ┌───────┴──────────────┐
//!     │      ExpirySweeper       │   │  persistence module  │
//!     │  (Background Tokio Task) │   │                      │
//!     └──────────────────────────┘   └──────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::{Store, TtlStatus, Value};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let store = Store::new();
//!
//! store.set(Bytes::from("a"), Value::from("10"), None);
//! assert_eq!(store.incr(&Bytes::from("a"), 1), Ok(11));
//!
//! store.set(Bytes::from("b"), Value::from("1"), Some(Duration::from_secs(60)));
//! assert!(matches!(store.ttl(&Bytes::from("b")), TtlStatus::ExpiresIn(_)));
//! ```

pub mod clock;
pub mod entry;
pub mod expiry;
pub mod index;
pub mod pattern;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{Entry, Value, ValueKind};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use index::ExpiryIndex;
pub use store::{
    ReapReport, RestoreReport, Snapshot, StorageStats, Store, StoreError, TtlStatus,
    TTL_NOT_FOUND, TTL_NO_EXPIRY,
};
