//! Typed commands built from request tokens.
//!
//! Validation runs in a fixed order: the name must be known, then the
//! argument count must fit, then the arguments themselves must parse.

use crate::commands::CommandError;
use crate::storage::entry::parse_decimal_i64;
use bytes::Bytes;
use std::time::Duration;

/// A validated request, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    Ttl {
        key: Bytes,
    },
    Pttl {
        key: Bytes,
    },
    Incr {
        key: Bytes,
        delta: i64,
    },
    Decr {
        key: Bytes,
        delta: i64,
    },
    FlushAll,
    Ping {
        message: Option<Bytes>,
    },
    Echo {
        message: Bytes,
    },
    DbSize,
    Keys {
        pattern: Bytes,
    },
    Info,
    Save,
    Quit,
}

/// Argument count bounds, command name excluded.
struct Arity {
    min: usize,
    max: Option<usize>,
}

const fn exactly(n: usize) -> Arity {
    Arity {
        min: n,
        max: Some(n),
    }
}

const fn between(min: usize, max: usize) -> Arity {
    Arity {
        min,
        max: Some(max),
    }
}

const fn at_least(min: usize) -> Arity {
    Arity { min, max: None }
}

/// Canonical name and arity for every known command.
fn lookup(name: &str) -> Option<(&'static str, Arity)> {
    let entry = match name {
        "GET" => ("GET", exactly(1)),
        "SET" => ("SET", between(2, 4)),
        "DEL" => ("DEL", at_least(1)),
        "EXISTS" => ("EXISTS", at_least(1)),
        "TTL" => ("TTL", exactly(1)),
        "PTTL" => ("PTTL", exactly(1)),
        "INCR" => ("INCR", exactly(1)),
        "DECR" => ("DECR", exactly(1)),
        "INCRBY" => ("INCRBY", exactly(2)),
        "DECRBY" => ("DECRBY", exactly(2)),
        "FLUSHALL" => ("FLUSHALL", exactly(0)),
        "FLUSHDB" => ("FLUSHDB", exactly(0)),
        "PING" => ("PING", between(0, 1)),
        "ECHO" => ("ECHO", exactly(1)),
        "DBSIZE" => ("DBSIZE", exactly(0)),
        "KEYS" => ("KEYS", exactly(1)),
        "INFO" => ("INFO", between(0, 1)),
        "SAVE" => ("SAVE", exactly(0)),
        "QUIT" => ("QUIT", exactly(0)),
        _ => return None,
    };
    Some(entry)
}

impl Command {
    /// Builds a command from a tokenized request line.
    ///
    /// The first token is the case-insensitive command name.
    pub fn from_tokens(tokens: &[Bytes]) -> Result<Command, CommandError> {
        let (first, args) = tokens
            .split_first()
            .ok_or_else(|| CommandError::syntax("empty command"))?;
        let upper = String::from_utf8_lossy(first).to_ascii_uppercase();

        let (name, arity) =
            lookup(&upper).ok_or_else(|| CommandError::UnknownCommand(upper.clone()))?;

        if args.len() < arity.min || arity.max.is_some_and(|max| args.len() > max) {
            return Err(CommandError::Arity(name));
        }
        // SET options come in pairs
        if name == "SET" && args.len() % 2 != 0 {
            return Err(CommandError::Arity(name));
        }

        let key = || args[0].clone();

        let command = match name {
            "GET" => Command::Get { key: key() },
            "SET" => Command::Set {
                key: key(),
                value: args[1].clone(),
                ttl: parse_set_ttl(&args[2..])?,
            },
            "DEL" => Command::Del {
                keys: args.to_vec(),
            },
            "EXISTS" => Command::Exists {
                keys: args.to_vec(),
            },
            "TTL" => Command::Ttl { key: key() },
            "PTTL" => Command::Pttl { key: key() },
            "INCR" => Command::Incr {
                key: key(),
                delta: 1,
            },
            "DECR" => Command::Decr {
                key: key(),
                delta: 1,
            },
            "INCRBY" => Command::Incr {
                key: key(),
                delta: parse_i64(&args[1]).ok_or(CommandError::NotAnInteger)?,
            },
            "DECRBY" => Command::Decr {
                key: key(),
                delta: parse_i64(&args[1]).ok_or(CommandError::NotAnInteger)?,
            },
            "FLUSHALL" | "FLUSHDB" => Command::FlushAll,
            "PING" => Command::Ping {
                message: args.first().cloned(),
            },
            "ECHO" => Command::Echo { message: key() },
            "DBSIZE" => Command::DbSize,
            "KEYS" => Command::Keys { pattern: key() },
            "INFO" => Command::Info,
            "SAVE" => Command::Save,
            "QUIT" => Command::Quit,
            _ => return Err(CommandError::UnknownCommand(upper)),
        };
        Ok(command)
    }

    /// Upper-case command name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Ttl { .. } => "TTL",
            Command::Pttl { .. } => "PTTL",
            Command::Incr { .. } => "INCR",
            Command::Decr { .. } => "DECR",
            Command::FlushAll => "FLUSHALL",
            Command::Ping { .. } => "PING",
            Command::Echo { .. } => "ECHO",
            Command::DbSize => "DBSIZE",
            Command::Keys { .. } => "KEYS",
            Command::Info => "INFO",
            Command::Save => "SAVE",
            Command::Quit => "QUIT",
        }
    }
}

/// `[EX seconds | PX milliseconds]`
fn parse_set_ttl(options: &[Bytes]) -> Result<Option<Duration>, CommandError> {
    match options {
        [] => Ok(None),
        [unit, amount] => {
            let amount = parse_u64(amount)
                .ok_or_else(|| CommandError::syntax("invalid expire time in 'SET' command"))?;
            if unit.eq_ignore_ascii_case(b"EX") {
                Ok(Some(Duration::from_secs(amount)))
            } else if unit.eq_ignore_ascii_case(b"PX") {
                Ok(Some(Duration::from_millis(amount)))
            } else {
                Err(CommandError::syntax("syntax error"))
            }
        }
        _ => Err(CommandError::syntax("syntax error")),
    }
}

/// Plain decimal only: no leading `+`, no whitespace.
fn parse_u64(token: &[u8]) -> Option<u64> {
    if token.first() == Some(&b'+') {
        return None;
    }
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_i64(token: &[u8]) -> Option<i64> {
    parse_decimal_i64(token)
}
