//! Reply Types
//!
//! Every reply starts with a one-byte type marker and ends with CRLF:
//!
//! - `+` status (`+OK`, `+PONG`)
//! - `-` error (`-ERR ...`, `-WRONGTYPE ...`)
//! - `:` integer
//! - `$` value, length-prefixed: `$5\r\nhello\r\n`; absence is `$-1\r\n`
//! - `*` list of values, count-prefixed (used by `KEYS`)
//!
//! Values are length-prefixed so they may contain any bytes, including
//! newlines.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator ending every reply line
pub const CRLF: &[u8] = b"\r\n";

/// Reply type markers
pub mod prefix {
    pub const STATUS: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const VALUE: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply sent back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Short status line such as `OK`. Must not contain CR or LF.
    Status(String),

    /// Error line: an upper-case code, a space, then the message.
    Error(String),

    Integer(i64),

    /// Binary-safe value.
    Value(Bytes),

    /// The key does not exist.
    Nil,

    Array(Vec<Reply>),
}

impl Reply {
    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    /// Builds an error reply from a code (`ERR`, `WRONGTYPE`) and a message.
    pub fn error(code: &str, message: impl fmt::Display) -> Self {
        Reply::Error(format!("{} {}", code, message))
    }

    pub fn value(data: impl Into<Bytes>) -> Self {
        Reply::Value(data.into())
    }

    pub fn ok() -> Self {
        Reply::status("OK")
    }

    pub fn pong() -> Self {
        Reply::status("PONG")
    }

    /// Serializes the reply to its wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                buf.put_u8(prefix::STATUS);
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.put_u8(prefix::ERROR);
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.put_u8(prefix::INTEGER);
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            Reply::Value(data) => {
                buf.put_u8(prefix::VALUE);
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            Reply::Nil => {
                buf.put_u8(prefix::VALUE);
                buf.put_slice(b"-1");
                buf.put_slice(CRLF);
            }
            Reply::Array(items) => {
                buf.put_u8(prefix::ARRAY);
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in items {
                    item.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Value(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty list)"),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}
