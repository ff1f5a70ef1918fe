//! Command errors and their single-line replies.

use crate::persistence::PersistenceError;
use crate::protocol::Reply;
use crate::storage::StoreError;
use thiserror::Error;

/// Everything a command can fail with.
///
/// Each variant maps to exactly one error reply line; see
/// [`CommandError::to_reply`].
#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    Arity(&'static str),

    #[error("{0}")]
    Syntax(String),

    /// A numeric argument (such as an `INCRBY` delta) is not an integer
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    /// The stored value cannot be used as an integer
    #[error("value is not an integer")]
    TypeMismatch,

    #[error("increment or decrement would overflow")]
    Overflow,

    #[error("snapshot failed: {0}")]
    Persistence(#[from] PersistenceError),
}

impl CommandError {
    pub fn syntax(message: impl Into<String>) -> Self {
        CommandError::Syntax(message.into())
    }

    /// The reply code that prefixes the error line.
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::TypeMismatch => "WRONGTYPE",
            _ => "ERR",
        }
    }

    /// Renders the error as the line sent to the client.
    ///
    /// Persistence failures stay vague on the wire; the detail goes to the
    /// server log.
    pub fn to_reply(&self) -> Reply {
        match self {
            CommandError::Persistence(PersistenceError::Disabled) => {
                Reply::error(self.code(), "persistence is disabled")
            }
            CommandError::Persistence(_) => Reply::error(self.code(), "snapshot failed"),
            _ => Reply::error(self.code(), self),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TypeMismatch => CommandError::TypeMismatch,
            StoreError::Overflow => CommandError::Overflow,
        }
    }
}
