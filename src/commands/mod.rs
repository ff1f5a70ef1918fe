//! Command Module
//!
//! Turns tokenized request lines into store operations and their outcomes.
//!
//! ```text
//! tokens ──> Command::from_tokens ──> CommandHandler::execute ──> Response
//!                   │                          │
//!                   └──── CommandError <───────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### Keys and values
//! - `GET key`, `SET key value [EX seconds | PX milliseconds]`
//! - `DEL key [key ...]`, `EXISTS key [key ...]`
//! - `TTL key`, `PTTL key`
//! - `INCR`, `DECR`, `INCRBY`, `DECRBY`
//! - `KEYS pattern`
//!
//! ### Server
//! - `PING [message]`, `ECHO message`, `INFO`, `DBSIZE`
//! - `FLUSHALL` / `FLUSHDB`, `SAVE`, `QUIT`

pub mod command;
pub mod error;
pub mod handler;

pub use command::Command;
pub use error::CommandError;
pub use handler::{into_reply, CommandHandler, Response};
