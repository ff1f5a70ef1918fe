//! Per-Client Connection Loop
//!
//! Each client gets its own task that reads request lines, executes them and
//! writes the replies back.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects
//!        │
//!        ▼
//! 2. ┌──────────────────────────────┐
//!    │  Read bytes into buffer      │<─────────┐
//!    │              │               │          │
//!    │              ▼               │          │
//!    │  Split complete lines        │          │
//!    │              │               │          │
//!    │              ▼               │          │
//!    │  Execute, queue replies      │          │
//!    │              │               │          │
//!    │              ▼               │          │
//!    │  Flush once per batch        │──────────┘
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 3. QUIT, EOF, oversized line or I/O error ends the task
//! ```
//!
//! TCP is a stream, so a read may hold half a line or several lines; the
//! buffer keeps whatever is left over for the next read.

use crate::commands::CommandHandler;
use crate::protocol::{LineParser, ParseError, Reply};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Bytes received but not yet parsed
    buffer: BytesMut,

    /// Replies waiting to be flushed
    out: BytesMut,

    command_handler: CommandHandler,

    parser: LineParser,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            out: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: LineParser::new(),
            stats,
        }
    }

    /// Runs the connection until the client leaves or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "Client disconnected"),
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let quit = match self.process_buffered().await {
                Ok(quit) => quit,
                Err(ConnectionError::Parse(e)) => {
                    // Tell the client why before hanging up
                    self.queue(&Reply::error("ERR", &e));
                    self.flush().await?;
                    return Err(e.into());
                }
                Err(e) => return Err(e),
            };

            self.flush().await?;
            if quit {
                return Ok(());
            }

            if !self.read_more_data().await? {
                return Ok(());
            }
        }
    }

    /// Executes every complete line in the buffer. Returns true on `QUIT`.
    async fn process_buffered(&mut self) -> Result<bool, ConnectionError> {
        while let Some((tokens, consumed)) = self.parser.parse(&self.buffer)? {
            self.buffer.advance(consumed);
            if tokens.is_empty() {
                continue;
            }

            trace!(
                client = %self.addr,
                consumed,
                remaining = self.buffer.len(),
                "Parsed request line"
            );

            let (reply, quit) = self.command_handler.handle(&tokens).await;
            self.stats.command_processed();
            self.queue(&reply);

            if quit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reads more data. Returns false when the client closed its side.
    async fn read_more_data(&mut self) -> Result<bool, ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            if !self.buffer.is_empty() {
                debug!(
                    client = %self.addr,
                    discarded = self.buffer.len(),
                    "Client closed with an unterminated line"
                );
            }
            return Ok(false);
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(true)
    }

    fn queue(&mut self, reply: &Reply) {
        reply.serialize_into(&mut self.out);
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        if self.out.is_empty() {
            return Ok(());
        }
        let out = self.out.split();
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(out.len());
        trace!(client = %self.addr, bytes = out.len(), "Sent replies");
        Ok(())
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

/// Handles a client connection.
///
/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        debug!(client = %addr, error = %e, "Connection ended with error");
    }
}

/// Logs a server-wide summary of connection activity.
pub fn log_summary(stats: &ConnectionStats) {
    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        bytes_read = stats.bytes_read.load(Ordering::Relaxed),
        bytes_written = stats.bytes_written.load(Ordering::Relaxed),
        "Connection totals"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_LINE_LENGTH;
    use crate::storage::Store;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn create_test_server() -> (SocketAddr, Arc<Store>, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Store::new());
        let stats = Arc::new(ConnectionStats::new());

        let store_clone = Arc::clone(&store);
        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = CommandHandler::new(Arc::clone(&store_clone));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(stream, client_addr, handler, stats));
            }
        });

        (addr, store, stats)
    }

    /// Reads until `expected` bytes arrived or the stream goes quiet.
    async fn read_n(client: &mut TcpStream, expected: usize) -> Vec<u8> {
        let mut buf = vec![0u8; expected.max(64) * 2];
        let mut total = 0;
        while total < expected {
            match timeout(Duration::from_millis(500), client.read(&mut buf[total..])).await {
                Ok(Ok(n)) if n > 0 => total += n,
                _ => break,
            }
        }
        buf.truncate(total);
        buf
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"PING\r\n").await.unwrap();
        assert_eq!(read_n(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_get() {
        let (addr, store, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"SET name ember\n").await.unwrap();
        assert_eq!(read_n(&mut client, 5).await, b"+OK\r\n");

        client.write_all(b"get name\r\n").await.unwrap();
        assert_eq!(read_n(&mut client, 11).await, b"$5\r\nember\r\n");

        client.write_all(b"GET nothing\n").await.unwrap();
        assert_eq!(read_n(&mut client, 5).await, b"$-1\r\n");

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_pipelined_lines_and_blank_lines() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"SET a 10\r\n\r\nINCR a\n   \nGET a\nTTL a\n")
            .await
            .unwrap();

        let expected = b"+OK\r\n:11\r\n$2\r\n11\r\n:-1\r\n";
        assert_eq!(read_n(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_line_split_across_writes() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"EC").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"HO hi\r\n").await.unwrap();

        assert_eq!(read_n(&mut client, 8).await, b"$2\r\nhi\r\n");
    }

    #[tokio::test]
    async fn test_errors_keep_connection_open() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"NOPE\nGET\nSET d hello\nINCR d\nPING\n").await.unwrap();

        let expected: &[u8] = b"-ERR unknown command 'NOPE'\r\n\
            -ERR wrong number of arguments for 'GET' command\r\n\
            +OK\r\n\
            -WRONGTYPE value is not an integer\r\n\
            +PONG\r\n";
        assert_eq!(read_n(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"QUIT\n").await.unwrap();
        assert_eq!(read_n(&mut client, 5).await, b"+OK\r\n");

        // Server side is closed: the next read sees EOF
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // One byte past the limit: the server reads all of it before refusing
        let junk = vec![b'x'; MAX_LINE_LENGTH + 1];
        client.write_all(&junk).await.unwrap();

        let reply = read_n(&mut client, 18).await;
        assert!(reply.starts_with(b"-ERR line too long"));
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = create_test_server().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"PING\n").await.unwrap();
        let _ = read_n(&mut client, 7).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 5);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 7);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
