//! ClamAV virus scanning
//!
//! Streams message bytes to a clamd daemon over the INSTREAM protocol:
//! a scan command, 4-byte big-endian length-prefixed chunks, a
//! zero-length terminator, and a single-line verdict. Connections to the
//! daemon are kept in a bounded pool and health-checked before reuse.
//!
//! Scanning is an optional defense layer: a disabled scanner reports
//! every message clean, and messages over the size limit skip scanning
//! entirely rather than blocking on scan cost.

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use mailgate_common::config::ScannerConfig;

const CHUNK_SIZE: usize = 8192;

/// Deadline for the liveness check on a pooled connection
const POOL_PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Result of a virus scan
///
/// Exactly one of `clean`/`infected` is true when `error` is `None`.
/// An error means the verdict is unknown; callers decide whether that
/// fails open or closed.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub clean: bool,
    pub infected: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virus_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub scan_time: Duration,
    pub file_size: i64,
}

impl ScanResult {
    fn new(file_size: i64) -> Self {
        Self {
            clean: false,
            infected: false,
            virus_names: Vec::new(),
            error: None,
            scan_time: Duration::ZERO,
            file_size,
        }
    }
}

/// Where the clamd daemon listens
#[derive(Debug, Clone)]
enum ScanTarget {
    Unix(String),
    Tcp(String),
}

/// A connection to clamd over either transport
enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.write_all(buf).await,
            Connection::Unix(stream) => stream.write_all(buf).await,
        }
    }

    async fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = match self {
            Connection::Tcp(stream) => stream.read(&mut byte).await?,
            Connection::Unix(stream) => stream.read(&mut byte).await?,
        };
        Ok(if n == 0 { None } else { Some(byte[0]) })
    }

    /// Read a single NUL- or newline-terminated response line
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            match self.read_byte().await? {
                None => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                Some(b'\0') | Some(b'\n') => break,
                Some(byte) => line.push(byte),
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).trim().to_string()))
    }
}

/// Virus scanner backed by a clamd daemon
pub struct Scanner {
    config: ScannerConfig,
    target: Option<ScanTarget>,
    pool: Mutex<Vec<Connection>>,
}

impl Scanner {
    /// Create a new scanner. A disabled configuration yields a scanner
    /// that reports everything clean without contacting a daemon.
    pub fn new(config: ScannerConfig) -> Self {
        let target = if config.enabled {
            Some(parse_address(&config.address))
        } else {
            None
        };

        if config.enabled {
            info!(
                "ClamAV scanner initialized: address={}, pool_size={}, timeout={}s",
                config.address, config.connection_pool, config.timeout_secs
            );
        }

        Self {
            config,
            target,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Whether scanning is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Scan a byte buffer for viruses
    pub async fn scan(&self, data: &[u8]) -> ScanResult {
        self.scan_reader(data, data.len() as i64).await
    }

    /// Scan data from a reader for viruses
    pub async fn scan_reader(
        &self,
        mut reader: impl AsyncRead + Unpin,
        size: i64,
    ) -> ScanResult {
        let mut result = ScanResult::new(size);

        if !self.config.enabled {
            result.clean = true;
            return result;
        }

        let start = Instant::now();

        if self.config.max_size > 0 && size > self.config.max_size {
            debug!(
                "Skipping scan, message too large: {} > {}",
                size, self.config.max_size
            );
            result.clean = true;
            result.scan_time = start.elapsed();
            return result;
        }

        let mut conn = match self.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to get clamd connection: {}", e);
                result.error = Some(e.to_string());
                result.scan_time = start.elapsed();
                return result;
            }
        };

        let response = match self.stream_scan(&mut conn, &mut reader).await {
            Ok(response) => response,
            Err(e) => {
                // The connection may hold half-written scan state; close
                // it instead of pooling
                result.error = Some(e.to_string());
                result.scan_time = start.elapsed();
                return result;
            }
        };

        result.scan_time = start.elapsed();
        self.classify_response(&response, &mut result);
        self.release_conn(conn).await;

        result
    }

    /// Stream the payload and read the daemon's verdict line
    async fn stream_scan(
        &self,
        conn: &mut Connection,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<String> {
        self.with_deadline(conn.write_all(b"zINSTREAM\0"))
            .await
            .map_err(|e| anyhow!("failed to send command: {}", e))?;

        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = self
                .with_deadline(reader.read(&mut buf))
                .await
                .map_err(|e| anyhow!("failed to read data: {}", e))?;
            if n == 0 {
                break;
            }

            let length = (n as u32).to_be_bytes();
            self.with_deadline(conn.write_all(&length))
                .await
                .map_err(|e| anyhow!("failed to send chunk length: {}", e))?;
            self.with_deadline(conn.write_all(&buf[..n]))
                .await
                .map_err(|e| anyhow!("failed to send chunk data: {}", e))?;
        }

        self.with_deadline(conn.write_all(&[0, 0, 0, 0]))
            .await
            .map_err(|e| anyhow!("failed to send terminator: {}", e))?;

        match self
            .with_deadline(conn.read_line())
            .await
            .map_err(|e| anyhow!("failed to read response: {}", e))?
        {
            Some(response) => Ok(response),
            None => bail!("no response from clamd"),
        }
    }

    /// Parse a scan response: `stream: OK`, `stream: <Name> FOUND`, or
    /// an error line
    fn classify_response(&self, response: &str, result: &mut ScanResult) {
        if response.ends_with("OK") {
            result.clean = true;
            debug!(
                "Scan completed clean in {:?} ({} bytes)",
                result.scan_time, result.file_size
            );
        } else if response.contains("FOUND") {
            result.infected = true;
            if let Some(virus_part) = response.split(':').nth(1) {
                let name = virus_part.trim().trim_end_matches(" FOUND").trim();
                if !name.is_empty() {
                    result.virus_names = vec![name.to_string()];
                }
            }
            warn!(
                "Virus detected in {:?}: {:?}",
                result.scan_time, result.virus_names
            );
        } else if response.contains("ERROR") {
            result.error = Some(format!("clamd error: {}", response));
            error!("Scan error: {}", response);
        } else {
            result.error = Some(format!("unexpected clamd response: {}", response));
            error!("Unexpected scan response: {}", response);
        }
    }

    /// Check whether clamd is reachable
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;

        self.with_deadline(conn.write_all(b"zPING\0")).await?;
        let response = self
            .with_deadline(conn.read_line())
            .await?
            .unwrap_or_default();

        if response != "PONG" {
            bail!("unexpected response: {}", response);
        }

        self.release_conn(conn).await;
        Ok(())
    }

    /// Fetch the ClamAV version string
    pub async fn version(&self) -> Result<String> {
        let mut conn = self.get_conn().await?;

        self.with_deadline(conn.write_all(b"zVERSION\0")).await?;
        let response = self
            .with_deadline(conn.read_line())
            .await?
            .ok_or_else(|| anyhow!("no response from clamd"))?;

        self.release_conn(conn).await;
        Ok(response)
    }

    /// Fetch ClamAV statistics (multi-line, terminated by `END`)
    pub async fn stats(&self) -> Result<String> {
        let mut conn = self.get_conn().await?;

        self.with_deadline(conn.write_all(b"zSTATS\0")).await?;

        let mut lines = Vec::new();
        loop {
            match self.with_deadline(conn.read_line()).await? {
                None => break,
                Some(line) if line.is_empty() => break,
                Some(line) => {
                    let done = line == "END";
                    lines.push(line);
                    if done {
                        break;
                    }
                }
            }
        }

        self.release_conn(conn).await;
        Ok(lines.join("\n"))
    }

    /// Get a pooled connection, verifying liveness, or dial a new one
    async fn get_conn(&self) -> Result<Connection> {
        let pooled = self.pool.lock().await.pop();
        if let Some(mut conn) = pooled {
            if self.ping_conn(&mut conn).await {
                return Ok(conn);
            }
            debug!("Discarding stale pooled clamd connection");
        }

        self.connect().await
    }

    /// Lightweight PING/PONG exchange used before reusing a pooled
    /// connection
    async fn ping_conn(&self, conn: &mut Connection) -> bool {
        let exchange = async {
            conn.write_all(b"zPING\0").await?;
            conn.read_line().await
        };
        matches!(
            timeout(POOL_PING_TIMEOUT, exchange).await,
            Ok(Ok(Some(response))) if response == "PONG"
        )
    }

    /// Dial a new connection to clamd
    async fn connect(&self) -> Result<Connection> {
        let target = match &self.target {
            Some(target) => target,
            None => bail!("virus scanner is disabled"),
        };

        let deadline = self.scan_timeout();
        let conn = match target {
            ScanTarget::Unix(path) => timeout(deadline, UnixStream::connect(path))
                .await
                .map_err(|_| anyhow!("connection to clamd timed out"))?
                .map(Connection::Unix),
            ScanTarget::Tcp(addr) => timeout(deadline, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow!("connection to clamd timed out"))?
                .map(Connection::Tcp),
        };

        conn.map_err(|e| anyhow!("connection to clamd failed: {}", e))
    }

    /// Return a connection to the pool, or close it when the pool is full
    async fn release_conn(&self, conn: Connection) {
        let mut pool = self.pool.lock().await;
        if pool.len() < self.config.connection_pool {
            pool.push(conn);
        }
        // Dropping the connection closes it
    }

    fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn with_deadline<T>(
        &self,
        operation: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        match timeout(self.scan_timeout(), operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(anyhow!("{}", e)),
            Err(_) => Err(anyhow!("operation timed out")),
        }
    }
}

/// Parse a clamd address into its transport and endpoint
fn parse_address(addr: &str) -> ScanTarget {
    if let Some(path) = addr.strip_prefix("unix:") {
        return ScanTarget::Unix(path.to_string());
    }
    if let Some(addr) = addr.strip_prefix("tcp://") {
        return ScanTarget::Tcp(addr.to_string());
    }
    ScanTarget::Unix(addr.to_string())
}
