//! Background transform streaming to a visualization host.
//!
//! The tracking loop never touches the socket: [`TransformPublisher::publish`]
//! serializes the message and hands it to a sender thread over a bounded
//! channel with `try_send`. A full queue drops the message. The sender thread
//! owns the TCP connection, writes with a bounded timeout, and after any
//! failure drops the socket and reconnects with exponential backoff.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NavError;
use crate::geometry::SE3;

use super::igtl::{encode_transform, timestamp_now, ChannelName, DEFAULT_PORT};

/// How long the sender thread waits for a message before re-checking the
/// connection.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub queue_capacity: usize,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            queue_capacity: 8,
            connect_timeout_ms: 500,
            write_timeout_ms: 50,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
        }
    }
}

/// Connection state and counters shared with the sender thread.
#[derive(Debug, Default)]
pub struct PublisherStatus {
    connected: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PublisherStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Messages written to the socket.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Messages discarded (queue full or no connection).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Failed connection attempts and writes.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_failure(&self, err: &NavError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(err.to_string());
    }
}

pub struct TransformPublisher {
    sender: Option<Sender<Vec<u8>>>,
    status: Arc<PublisherStatus>,
    handle: Option<JoinHandle<()>>,
}

impl TransformPublisher {
    /// Start the sender thread. Connection happens in the background; the
    /// publisher is usable (degraded) while no host is listening.
    pub fn spawn(config: PublisherConfig) -> Self {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let status = Arc::new(PublisherStatus::default());

        let thread_status = Arc::clone(&status);
        let handle = thread::Builder::new()
            .name("transform-publisher".to_string())
            .spawn(move || SenderLoop::new(config, thread_status).run(rx));

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("Failed to start publisher thread: {}", e);
                None
            }
        };

        Self {
            sender: Some(tx),
            status,
            handle,
        }
    }

    /// Queue a transform for sending. Never blocks; returns false when the
    /// message was dropped.
    pub fn publish(&self, channel: &ChannelName, transform: &SE3) -> bool {
        let sender = match (&self.sender, &self.handle) {
            (Some(s), Some(_)) => s,
            _ => {
                self.status.dropped.fetch_add(1, Ordering::SeqCst);
                return false;
            }
        };
        let msg = encode_transform(channel, transform, timestamp_now());
        match sender.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.status.dropped.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn status(&self) -> &PublisherStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Close the queue and wait for the sender thread to drain it and exit.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Publisher thread panicked");
            }
        }
    }
}

impl Drop for TransformPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the sender thread.
struct SenderLoop {
    config: PublisherConfig,
    status: Arc<PublisherStatus>,
    stream: Option<TcpStream>,
    backoff: Duration,
    next_attempt: Instant,
}

impl SenderLoop {
    fn new(config: PublisherConfig, status: Arc<PublisherStatus>) -> Self {
        let backoff = Duration::from_millis(config.initial_backoff_ms);
        Self {
            config,
            status,
            stream: None,
            backoff,
            next_attempt: Instant::now(),
        }
    }

    fn run(mut self, rx: Receiver<Vec<u8>>) {
        info!(
            "Publisher thread started ({}:{})",
            self.config.host, self.config.port
        );
        loop {
            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.send(&msg),
                Err(RecvTimeoutError::Timeout) => self.ensure_connected(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.disconnect();
        info!(
            "Publisher thread exiting. sent={}, dropped={}, failures={}",
            self.status.sent(),
            self.status.dropped(),
            self.status.failures()
        );
    }

    fn send(&mut self, msg: &[u8]) {
        self.ensure_connected();
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => {
                self.status.dropped.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        match stream.write_all(msg) {
            Ok(()) => {
                self.status.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                let err = match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => NavError::PublishTimeout {
                        timeout_ms: self.config.write_timeout_ms,
                    },
                    _ => NavError::ConnectionLost(e.to_string()),
                };
                warn!("Publisher: {}", err);
                self.status.record_failure(&err);
                self.status.dropped.fetch_add(1, Ordering::SeqCst);
                self.disconnect();
                self.schedule_retry();
            }
        }
    }

    fn ensure_connected(&mut self) {
        if self.stream.is_some() || Instant::now() < self.next_attempt {
            return;
        }
        match self.connect() {
            Ok(stream) => {
                info!("Publisher connected to {}:{}", self.config.host, self.config.port);
                self.stream = Some(stream);
                self.status.connected.store(true, Ordering::SeqCst);
                self.backoff = Duration::from_millis(self.config.initial_backoff_ms);
            }
            Err(err) => {
                debug!("Publisher connect failed: {}", err);
                self.status.record_failure(&err);
                self.schedule_retry();
            }
        }
    }

    fn connect(&self) -> Result<TcpStream, NavError> {
        let addr: SocketAddr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| NavError::ConnectionLost(e.to_string()))?
            .next()
            .ok_or_else(|| NavError::ConnectionLost(format!("cannot resolve {}", self.config.host)))?;

        let stream = TcpStream::connect_timeout(
            &addr,
            Duration::from_millis(self.config.connect_timeout_ms.max(1)),
        )
        .map_err(|e| NavError::ConnectionLost(e.to_string()))?;
        stream
            .set_write_timeout(Some(Duration::from_millis(self.config.write_timeout_ms.max(1))))
            .map_err(|e| NavError::ConnectionLost(e.to_string()))?;
        // Latency matters more than throughput for pose updates
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn schedule_retry(&mut self) {
        self.next_attempt = Instant::now() + self.backoff;
        let max = Duration::from_millis(self.config.max_backoff_ms);
        self.backoff = (self.backoff * 2).min(max);
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Publisher socket closed");
        }
        self.status.connected.store(false, Ordering::SeqCst);
    }
}
