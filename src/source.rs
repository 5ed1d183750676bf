//! Byte sources for scan input.
//!
//! The physical scanner is an opaque byte stream. [`EventSource`] abstracts
//! it so the ingest loop can also run against stdin or an in-memory reader.
//! Every read is bounded by an idle timeout so the loop regains control
//! periodically to check for day rollover even when nothing is scanned.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::{TallyError, TallyResult};

const READ_BUF_SIZE: usize = 256;

/// What a single wait on a source produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Raw bytes, possibly a partial frame.
    Data(Vec<u8>),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The source reached end of input and will produce nothing more.
    Closed,
}

#[async_trait]
pub trait EventSource: Send {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Waits at most `idle` for the next bytes.
    async fn next_event(&mut self, idle: Duration) -> TallyResult<SourceEvent>;
}

/// Reads from any async reader. End of input closes the source.
pub struct ReaderSource<R> {
    name: String,
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            buf: vec![0u8; READ_BUF_SIZE],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for ReaderSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self, idle: Duration) -> TallyResult<SourceEvent> {
        match tokio::time::timeout(idle, self.reader.read(&mut self.buf)).await {
            Err(_) => Ok(SourceEvent::Idle),
            Ok(Ok(0)) => Ok(SourceEvent::Closed),
            Ok(Ok(n)) => Ok(SourceEvent::Data(self.buf[..n].to_vec())),
            Ok(Err(e)) => Err(TallyError::device(self.name.clone(), e)),
        }
    }
}

/// A character device (serial scanner) or FIFO, read without blocking a
/// thread.
///
/// The descriptor is opened `O_NONBLOCK` and registered with the runtime's
/// reactor, so a pending read is dropped cleanly on shutdown. Line settings
/// such as baud rate and raw mode are configured on the device outside
/// this process. A read failure or hang-up triggers a bounded number of
/// reopen attempts before the source gives up with a device error.
pub struct DeviceSource {
    path: PathBuf,
    name: String,
    fd: Option<AsyncFd<File>>,
    buf: Vec<u8>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl DeviceSource {
    pub async fn open(config: &DeviceConfig) -> TallyResult<Self> {
        let path = PathBuf::from(&config.path);
        let fd = open_nonblocking(&path).map_err(|e| TallyError::device(config.path.clone(), e))?;
        info!(device = %config.path, "scan device opened");
        Ok(Self {
            path,
            name: config.path.clone(),
            fd: Some(fd),
            buf: vec![0u8; READ_BUF_SIZE],
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        })
    }

    async fn reconnect(&mut self, cause: io::Error) -> TallyResult<()> {
        self.fd = None;
        let mut last = cause;
        for attempt in 1..=self.reconnect_attempts {
            warn!(device = %self.name, attempt, error = %last, "scan device lost, reopening");
            tokio::time::sleep(self.reconnect_delay).await;
            match open_nonblocking(&self.path) {
                Ok(fd) => {
                    info!(device = %self.name, attempt, "scan device reopened");
                    self.fd = Some(fd);
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(TallyError::device(self.name.clone(), last))
    }
}

fn open_nonblocking(path: &Path) -> io::Result<AsyncFd<File>> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY | libc::O_CLOEXEC)
        .open(path)?;
    AsyncFd::new(file)
}

async fn read_ready(fd: &AsyncFd<File>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| inner.get_ref().read(buf)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

#[async_trait]
impl EventSource for DeviceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self, idle: Duration) -> TallyResult<SourceEvent> {
        let Some(fd) = self.fd.as_ref() else {
            let gone = io::Error::new(io::ErrorKind::NotConnected, "device not open");
            self.reconnect(gone).await?;
            return Ok(SourceEvent::Idle);
        };
        match tokio::time::timeout(idle, read_ready(fd, &mut self.buf)).await {
            Err(_) => Ok(SourceEvent::Idle),
            Ok(Ok(0)) => {
                let hangup = io::Error::new(io::ErrorKind::UnexpectedEof, "device hung up");
                self.reconnect(hangup).await?;
                Ok(SourceEvent::Idle)
            }
            Ok(Ok(n)) => Ok(SourceEvent::Data(self.buf[..n].to_vec())),
            Ok(Err(e)) => {
                self.reconnect(e).await?;
                Ok(SourceEvent::Idle)
            }
        }
    }
}

/// Opens the configured source. A device path of `-` reads stdin.
pub async fn open_source(config: &DeviceConfig) -> TallyResult<Box<dyn EventSource>> {
    if config.path == "-" {
        return Ok(Box::new(ReaderSource::new("stdin", tokio::io::stdin())));
    }
    Ok(Box::new(DeviceSource::open(config).await?))
}
