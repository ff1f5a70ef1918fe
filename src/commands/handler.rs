//! Command Executor
//!
//! Runs validated [`Command`]s against the [`Store`]. Each command maps to a
//! single store operation, so whatever atomicity the store gives a single
//! call (one shard lock, `incr` as one read-modify-write) the command gets
//! too.
//!
//! The executor performs no I/O of its own except `SAVE`, which hands the
//! work to the snapshot scheduler and waits for the outcome.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌──────────────┐   ┌─────────────┐   ┌────────────────┐    │
//! │  │ from_tokens()│──>│  execute()  │──>│ Response/Reply │    │
//! │  └──────────────┘   └─────────────┘   └────────────────┘    │
//! │                           │                                 │
//! │                  Store    │    SaveTrigger                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::commands::{Command, CommandError};
use crate::persistence::{PersistenceError, SaveTrigger};
use crate::protocol::Reply;
use crate::storage::{Store, Value};
use bytes::Bytes;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Successful outcome of a command, before wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Pong,
    Value(Bytes),
    /// The key does not exist
    Nil,
    Integer(i64),
    Keys(Vec<Bytes>),
    /// Multi-line human-readable text (`INFO`)
    Text(String),
    /// Reply `OK`, then close the connection
    Quit,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        match response {
            Response::Ok | Response::Quit => Reply::ok(),
            Response::Pong => Reply::pong(),
            Response::Value(data) => Reply::Value(data),
            Response::Nil => Reply::Nil,
            Response::Integer(n) => Reply::Integer(n),
            Response::Keys(keys) => Reply::Array(keys.into_iter().map(Reply::Value).collect()),
            Response::Text(text) => Reply::Value(Bytes::from(text)),
        }
    }
}

/// Executes commands against a shared store.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    store: Arc<Store>,
    /// Absent when persistence is turned off
    saver: Option<SaveTrigger>,
    /// Server start time for INFO
    start_time: Instant,
}

impl CommandHandler {
    /// Creates a handler with persistence disabled.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            saver: None,
            start_time: Instant::now(),
        }
    }

    /// Creates a handler whose `SAVE` goes through `saver`.
    pub fn with_saver(store: Arc<Store>, saver: SaveTrigger) -> Self {
        Self {
            store,
            saver: Some(saver),
            start_time: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Parses and executes one request line, producing the reply to send.
    pub async fn handle(&self, tokens: &[Bytes]) -> (Reply, bool) {
        match Command::from_tokens(tokens) {
            Ok(command) => {
                let result = self.execute(command).await;
                let quit = matches!(result, Ok(Response::Quit));
                (into_reply(result), quit)
            }
            Err(e) => {
                debug!(error = %e, "Rejected command");
                (e.to_reply(), false)
            }
        }
    }

    /// Executes a validated command.
    pub async fn execute(&self, command: Command) -> Result<Response, CommandError> {
        let store = &self.store;

        let response = match command {
            Command::Get { key } => match store.get(&key) {
                Some(value) => Response::Value(value.to_bytes()),
                None => Response::Nil,
            },
            Command::Set { key, value, ttl } => {
                store.set(key, Value::from_bytes(value), ttl);
                Response::Ok
            }
            Command::Del { keys } => Response::Integer(store.delete_many(&keys) as i64),
            Command::Exists { keys } => Response::Integer(store.exists_many(&keys) as i64),
            Command::Ttl { key } => Response::Integer(store.ttl(&key).as_secs()),
            Command::Pttl { key } => Response::Integer(store.ttl(&key).as_millis()),
            Command::Incr { key, delta } => Response::Integer(store.incr(&key, delta)?),
            Command::Decr { key, delta } => Response::Integer(store.decr(&key, delta)?),
            Command::FlushAll => {
                let dropped = store.flush_all();
                debug!(dropped, "Store flushed");
                Response::Ok
            }
            Command::Ping { message: None } => Response::Pong,
            Command::Ping {
                message: Some(message),
            }
            | Command::Echo { message } => Response::Value(message),
            Command::DbSize => Response::Integer(store.len() as i64),
            Command::Keys { pattern } => Response::Keys(store.keys(&pattern)),
            Command::Info => Response::Text(self.info()),
            Command::Save => {
                let saver = self.saver.as_ref().ok_or(PersistenceError::Disabled)?;
                saver.save().await?;
                Response::Ok
            }
            Command::Quit => Response::Quit,
        };

        Ok(response)
    }

    fn info(&self) -> String {
        let stats = self.store.stats();
        let mut info = String::new();

        // Writing to a String cannot fail
        let _ = write!(
            info,
            "# Server\r\n\
             emberkv_version:{}\r\n\
             os:{}\r\n\
             uptime_in_seconds:{}\r\n\
             \r\n\
             # Keyspace\r\n\
             keys:{}\r\n\
             expiring_keys:{}\r\n\
             pending_expiries:{}\r\n\
             \r\n\
             # Stats\r\n\
             get_ops:{}\r\n\
             set_ops:{}\r\n\
             del_ops:{}\r\n\
             expired_lazy:{}\r\n\
             expired_active:{}\r\n\
             stale_expiries_skipped:{}\r\n\
             \r\n\
             # Persistence\r\n",
            crate::VERSION,
            std::env::consts::OS,
            self.start_time.elapsed().as_secs(),
            stats.keys,
            stats.expiring_keys,
            stats.pending_expiries,
            stats.get_ops,
            stats.set_ops,
            stats.del_ops,
            stats.expired_lazy,
            stats.expired_active,
            stats.stale_skipped,
        );

        match &self.saver {
            Some(saver) => {
                let _ = write!(
                    info,
                    "snapshot_enabled:1\r\n\
                     snapshot_path:{}\r\n\
                     snapshot_saves:{}\r\n\
                     last_save_time:{}\r\n",
                    saver.path().display(),
                    saver.saves(),
                    saver.last_save().unwrap_or(0),
                );
            }
            None => info.push_str("snapshot_enabled:0\r\n"),
        }

        info
    }
}

/// Encodes an execution result as the reply line(s) to send.
pub fn into_reply(result: Result<Response, CommandError>) -> Reply {
    match result {
        Ok(response) => response.into(),
        Err(e) => e.to_reply(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistenceConfig, SnapshotScheduler};
    use crate::storage::ManualClock;
    use std::time::Duration;
    use tempfile::tempdir;

    fn create_handler() -> CommandHandler {
        CommandHandler::new(Arc::new(Store::new()))
    }

    async fn run(handler: &CommandHandler, line: &str) -> Result<Response, CommandError> {
        let tokens: Vec<Bytes> = line
            .split_whitespace()
            .map(|t| Bytes::from(t.to_string()))
            .collect();
        handler.execute(Command::from_tokens(&tokens)?).await
    }

    fn value(s: &str) -> Response {
        Response::Value(Bytes::from(s.to_string()))
    }

    #[tokio::test]
    async fn test_ping_and_echo() {
        let handler = create_handler();

        assert_eq!(run(&handler, "PING").await.unwrap(), Response::Pong);
        assert_eq!(run(&handler, "PING hello").await.unwrap(), value("hello"));
        assert_eq!(run(&handler, "ECHO hi").await.unwrap(), value("hi"));
    }

    #[tokio::test]
    async fn test_set_get() {
        let handler = create_handler();

        assert_eq!(run(&handler, "SET key value").await.unwrap(), Response::Ok);
        assert_eq!(run(&handler, "GET key").await.unwrap(), value("value"));
        assert_eq!(run(&handler, "GET missing").await.unwrap(), Response::Nil);
        assert_eq!(run(&handler, "TTL missing").await.unwrap(), Response::Integer(-2));
    }

    #[tokio::test]
    async fn test_integer_values_read_back_verbatim() {
        let handler = create_handler();

        run(&handler, "SET n 010").await.unwrap();
        assert_eq!(run(&handler, "GET n").await.unwrap(), value("010"));
        assert_eq!(run(&handler, "INCR n").await.unwrap(), Response::Integer(11));

        run(&handler, "SET m -5").await.unwrap();
        assert_eq!(run(&handler, "GET m").await.unwrap(), value("-5"));
    }

    #[tokio::test]
    async fn test_session_scenario() {
        let clock = Arc::new(ManualClock::starting_now());
        let handler = CommandHandler::new(Arc::new(Store::with_clock(clock.clone())));

        assert_eq!(run(&handler, "SET a 10").await.unwrap(), Response::Ok);
        assert_eq!(run(&handler, "INCR a").await.unwrap(), Response::Integer(11));
        assert_eq!(run(&handler, "GET a").await.unwrap(), value("11"));

        assert_eq!(run(&handler, "SET b 1 EX 1").await.unwrap(), Response::Ok);
        assert_eq!(run(&handler, "TTL b").await.unwrap(), Response::Integer(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(run(&handler, "GET b").await.unwrap(), Response::Nil);
        assert_eq!(run(&handler, "TTL b").await.unwrap(), Response::Integer(-2));
        assert!(!handler.store().is_resident(b"b"));

        assert_eq!(run(&handler, "DEL a").await.unwrap(), Response::Integer(1));
        assert_eq!(run(&handler, "EXISTS a").await.unwrap(), Response::Integer(0));

        assert_eq!(run(&handler, "INCR c").await.unwrap(), Response::Integer(1));

        run(&handler, "SET d hello").await.unwrap();
        assert!(matches!(
            run(&handler, "INCR d").await,
            Err(CommandError::TypeMismatch)
        ));
        assert_eq!(run(&handler, "GET d").await.unwrap(), value("hello"));

        run(&handler, "SET a 1").await.unwrap();
        assert_eq!(run(&handler, "FLUSHALL").await.unwrap(), Response::Ok);
        for key in ["a", "b", "c", "d"] {
            assert_eq!(
                run(&handler, &format!("EXISTS {}", key)).await.unwrap(),
                Response::Integer(0)
            );
        }
    }

    #[tokio::test]
    async fn test_set_without_ttl_clears_previous_ttl() {
        let handler = create_handler();

        run(&handler, "SET k v EX 100").await.unwrap();
        assert_eq!(run(&handler, "TTL k").await.unwrap(), Response::Integer(100));
        run(&handler, "SET k v2").await.unwrap();
        assert_eq!(run(&handler, "TTL k").await.unwrap(), Response::Integer(-1));
    }

    #[tokio::test]
    async fn test_pttl_and_px() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let handler = CommandHandler::new(Arc::new(Store::with_clock(clock.clone())));

        run(&handler, "SET k v PX 1500").await.unwrap();
        assert_eq!(run(&handler, "PTTL k").await.unwrap(), Response::Integer(1500));
        assert_eq!(run(&handler, "TTL k").await.unwrap(), Response::Integer(2));

        clock.advance(Duration::from_millis(1499));
        assert_eq!(run(&handler, "PTTL k").await.unwrap(), Response::Integer(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(run(&handler, "PTTL k").await.unwrap(), Response::Integer(-2));
    }

    #[tokio::test]
    async fn test_incrby_decrby() {
        let handler = create_handler();

        assert_eq!(run(&handler, "INCRBY n 5").await.unwrap(), Response::Integer(5));
        assert_eq!(run(&handler, "DECRBY n 7").await.unwrap(), Response::Integer(-2));
        assert_eq!(run(&handler, "DECR n").await.unwrap(), Response::Integer(-3));

        run(&handler, &format!("SET big {}", i64::MAX)).await.unwrap();
        assert!(matches!(run(&handler, "INCR big").await, Err(CommandError::Overflow)));
        assert_eq!(
            run(&handler, "GET big").await.unwrap(),
            value(&i64::MAX.to_string())
        );
    }

    #[tokio::test]
    async fn test_incr_rejects_explicit_plus_sign() {
        let handler = create_handler();

        run(&handler, "SET signed +5").await.unwrap();
        assert!(matches!(
            run(&handler, "INCR signed").await,
            Err(CommandError::TypeMismatch)
        ));
        assert_eq!(run(&handler, "GET signed").await.unwrap(), value("+5"));
    }

    #[tokio::test]
    async fn test_multi_key_del_exists() {
        let handler = create_handler();

        run(&handler, "SET a 1").await.unwrap();
        run(&handler, "SET b 2").await.unwrap();

        assert_eq!(run(&handler, "EXISTS a b c").await.unwrap(), Response::Integer(2));
        assert_eq!(run(&handler, "DEL a b c").await.unwrap(), Response::Integer(2));
        assert_eq!(run(&handler, "DBSIZE").await.unwrap(), Response::Integer(0));
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let handler = create_handler();

        run(&handler, "SET user:1 a").await.unwrap();
        run(&handler, "SET user:2 b").await.unwrap();
        run(&handler, "SET session:1 c").await.unwrap();

        let mut keys = match run(&handler, "KEYS user:*").await.unwrap() {
            Response::Keys(keys) => keys,
            other => panic!("unexpected response {:?}", other),
        };
        keys.sort();
        assert_eq!(keys, vec![Bytes::from("user:1"), Bytes::from("user:2")]);
    }

    #[tokio::test]
    async fn test_info_sections() {
        let handler = create_handler();
        run(&handler, "SET a 1 EX 60").await.unwrap();

        let info = match run(&handler, "INFO").await.unwrap() {
            Response::Text(text) => text,
            other => panic!("unexpected response {:?}", other),
        };
        assert!(info.contains("# Keyspace"));
        assert!(info.contains("keys:1\r\n"));
        assert!(info.contains("expiring_keys:1\r\n"));
        assert!(info.contains("snapshot_enabled:0\r\n"));
    }

    #[tokio::test]
    async fn test_save_without_persistence() {
        let handler = create_handler();

        let err = run(&handler, "SAVE").await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Persistence(PersistenceError::Disabled)
        ));
        assert_eq!(
            err.to_reply().serialize(),
            b"-ERR persistence is disabled\r\n"
        );
    }

    #[tokio::test]
    async fn test_save_through_scheduler() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let store = Arc::new(Store::new());
        let scheduler = SnapshotScheduler::start(
            Arc::clone(&store),
            PersistenceConfig {
                path: path.clone(),
                interval: None,
                save_on_shutdown: false,
            },
        );
        let handler = CommandHandler::with_saver(Arc::clone(&store), scheduler.trigger());

        run(&handler, "SET a 1").await.unwrap();
        assert_eq!(run(&handler, "SAVE").await.unwrap(), Response::Ok);
        assert!(path.exists());

        let info = match run(&handler, "INFO").await.unwrap() {
            Response::Text(text) => text,
            other => panic!("unexpected response {:?}", other),
        };
        assert!(info.contains("snapshot_saves:1\r\n"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_reports_quit() {
        let handler = create_handler();

        let (reply, quit) = handler.handle(&[Bytes::from("quit")]).await;
        assert_eq!(reply, Reply::ok());
        assert!(quit);

        let (reply, quit) = handler.handle(&[Bytes::from("BOGUS")]).await;
        assert_eq!(reply, Reply::Error("ERR unknown command 'BOGUS'".into()));
        assert!(!quit);
    }

    #[tokio::test]
    async fn test_concurrent_incr_through_handler() {
        let handler = create_handler();
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    run(&handler, "INCR counter").await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(run(&handler, "GET counter").await.unwrap(), value("2000"));
    }

    #[test]
    fn test_response_encoding() {
        assert_eq!(Reply::from(Response::Ok).serialize(), b"+OK\r\n");
        assert_eq!(Reply::from(Response::Nil).serialize(), b"$-1\r\n");
        assert_eq!(Reply::from(Response::Integer(-2)).serialize(), b":-2\r\n");
        assert_eq!(
            Reply::from(Response::Keys(vec![Bytes::from("a")])).serialize(),
            b"*1\r\n$1\r\na\r\n"
        );
    }
}
