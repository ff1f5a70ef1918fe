//! Wire Protocol
//!
//! Requests arrive as whitespace-separated text lines; replies go back with a
//! one-byte type marker, length-prefixed where the payload is arbitrary bytes.
//!
//! ## Modules
//!
//! - `parser`: splits incoming bytes into tokenized request lines
//! - `types`: the `Reply` enum and its serialization
//!
//! ## Example
//!
//! ```
//! use emberkv::protocol::{parse_line, Reply};
//! use bytes::Bytes;
//!
//! let (tokens, _consumed) = parse_line(b"GET name\r\n").unwrap().unwrap();
//! assert_eq!(tokens.len(), 2);
//!
//! let reply = Reply::value(Bytes::from("ember"));
//! assert_eq!(reply.serialize(), b"$5\r\nember\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_line, LineParser, ParseError, ParseResult, MAX_LINE_LENGTH};
pub use types::Reply;
