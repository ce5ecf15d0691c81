//! Per-connection outbound queues and the subscriber registry.
//!
//! Every accepted connection gets an [`Outbound`]: an unbounded channel drained
//! by a dedicated writer thread, so a response and a broadcast event can never
//! interleave mid-line on the same socket. The queue tracks how many bytes are
//! enqueued but not yet written; the hub uses that count to drop subscribers
//! that stopped reading.

use serde::Serialize;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempo_daemon_protocol::{DaemonEvent, ERROR_SUBSCRIBER_LIMIT};
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_SUBSCRIBERS: usize = 32;
pub const HIGH_WATER_BYTES: usize = 256 * 1024;

const FLUSH_POLL_MS: u64 = 10;

#[derive(Error, Debug, PartialEq)]
pub enum SubscribeError {
    #[error("{}", ERROR_SUBSCRIBER_LIMIT)]
    LimitReached,
}

#[derive(Clone)]
pub struct Outbound {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    control: Arc<UnixStream>,
}

impl Outbound {
    pub fn spawn(id: u64, stream: &UnixStream) -> std::io::Result<Self> {
        let mut writer = stream.try_clone()?;
        let control = Arc::new(stream.try_clone()?);
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let pending = Arc::new(AtomicUsize::new(0));

        let writer_pending = Arc::clone(&pending);
        thread::spawn(move || {
            for line in rx {
                let len = line.len();
                let result = writer.write_all(&line).and_then(|_| writer.flush());
                writer_pending.fetch_sub(len, Ordering::SeqCst);
                if let Err(err) = result {
                    debug!(connection = id, error = %err, "Connection writer stopped");
                    let _ = writer.shutdown(Shutdown::Both);
                    break;
                }
            }
        });

        Ok(Self {
            id,
            tx,
            pending,
            control,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serializes `value` as one JSON line and enqueues it.
    pub fn send<T: Serialize>(&self, value: &T) -> bool {
        match encode_line(value) {
            Some(line) => self.send_line(line),
            None => false,
        }
    }

    pub fn send_line(&self, line: Vec<u8>) -> bool {
        let len = line.len();
        self.pending.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(line).is_err() {
            self.pending.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits until everything enqueued so far has been written, up to `timeout`.
    pub fn wait_flushed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending_bytes() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(FLUSH_POLL_MS));
        }
        true
    }

    /// Shuts the socket down in both directions, unblocking reader and writer.
    pub fn close(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

pub struct SubscriberHub {
    subscribers: Vec<Outbound>,
    max_subscribers: usize,
    high_water_bytes: usize,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::with_limits(MAX_SUBSCRIBERS, HIGH_WATER_BYTES)
    }
}

impl SubscriberHub {
    pub fn with_limits(max_subscribers: usize, high_water_bytes: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            max_subscribers,
            high_water_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.subscribers.iter().any(|sub| sub.id == id)
    }

    /// Registers a connection. Subscribing twice is a no-op.
    pub fn add(&mut self, outbound: Outbound) -> Result<(), SubscribeError> {
        if self.contains(outbound.id) {
            return Ok(());
        }
        if self.subscribers.len() >= self.max_subscribers {
            return Err(SubscribeError::LimitReached);
        }
        debug!(connection = outbound.id, "Subscriber added");
        self.subscribers.push(outbound);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) {
        self.subscribers.retain(|sub| sub.id != id);
    }

    /// Sends `event` to every subscriber, dropping the ones that fell behind.
    /// Returns how many were dropped.
    pub fn broadcast(&mut self, event: &DaemonEvent) -> usize {
        if self.subscribers.is_empty() {
            return 0;
        }
        let Some(line) = encode_line(event) else {
            return 0;
        };

        let high_water = self.high_water_bytes;
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| {
            let pending = sub.pending_bytes();
            if pending > high_water {
                warn!(
                    connection = sub.id,
                    pending_bytes = pending,
                    "Dropping slow subscriber"
                );
                sub.close();
                return false;
            }
            sub.send_line(line.clone())
        });
        before - self.subscribers.len()
    }

    pub fn close_all(&mut self) {
        for sub in self.subscribers.drain(..) {
            sub.close();
        }
    }
}

fn encode_line<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line)
        }
        Err(err) => {
            warn!(error = %err, "Failed to serialize outbound message");
            None
        }
    }
}
