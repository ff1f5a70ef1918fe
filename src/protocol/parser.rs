//! Line Request Parser
//!
//! Requests are plain text, one command per line:
//!
//! ```text
//! SET greeting hello EX 60\r\n
//! GET greeting\n
//! ```
//!
//! Lines end with `\n`; a preceding `\r` is stripped. Tokens are separated by
//! runs of ASCII whitespace and are otherwise taken byte-for-byte, so keys and
//! values need not be UTF-8 but cannot contain whitespace.
//!
//! The parser is incremental in the same way a frame parser is:
//! - `Ok(Some((tokens, consumed)))` - a full line was read
//! - `Ok(None)` - no newline yet, wait for more data
//! - `Err(ParseError)` - the client sent something unusable

use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while reading a request line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A line grew past the limit without a newline
    #[error("line too long: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Longest accepted request line, terminator excluded (64 KiB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream into tokenized request lines.
///
/// # Example
///
/// ```
/// use emberkv::protocol::LineParser;
///
/// let parser = LineParser::new();
/// let (tokens, consumed) = parser.parse(b"GET name\r\nDEL").unwrap().unwrap();
///
/// assert_eq!(tokens, vec!["GET", "name"]);
/// assert_eq!(consumed, 10);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LineParser {
    max_line: usize,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self {
            max_line: MAX_LINE_LENGTH,
        }
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self { max_line }
    }

    /// Reads one line from the front of `buf`.
    ///
    /// A blank line yields an empty token list; callers skip it.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
        let newline = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None if buf.len() > self.max_line => {
                return Err(ParseError::LineTooLong {
                    size: buf.len(),
                    max: self.max_line,
                });
            }
            None => return Ok(None),
        };

        let line = match buf[..newline].strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => &buf[..newline],
        };
        if line.len() > self.max_line {
            return Err(ParseError::LineTooLong {
                size: line.len(),
                max: self.max_line,
            });
        }

        Ok(Some((tokenize(line), newline + 1)))
    }
}

fn tokenize(line: &[u8]) -> Vec<Bytes> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Parses a single complete line with default limits.
pub fn parse_line(buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    LineParser::new().parse(buf)
}
