//! Byte sources feeding an update, and the policy for waiting on them

use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// A blocking source of update bytes, such as a socket or a serial port
pub trait ByteSource {
    /// Look at the next byte without consuming it, `None` if nothing arrives
    fn peek(&mut self) -> Option<u8>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for them
    ///
    /// Returns 0 on timeout or end of data.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> usize;
}

/// A non-blocking source that knows how many bytes it currently holds
pub trait AvailableSource {
    /// Bytes that can be read right now
    fn available(&mut self) -> usize;

    /// Read up to `buf.len()` of the available bytes
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// [ByteSource] over any [embedded_io::Read]
///
/// The reader is expected to block until data is available; the timeout
/// passed to [ByteSource::read_bytes] is left to the reader.
#[derive(Debug)]
pub struct IoSource<R> {
    inner: R,
    peeked: Option<u8>,
}

impl<R: embedded_io::Read> IoSource<R> {
    pub fn new(inner: R) -> Self {
        IoSource {
            inner,
            peeked: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_once(&mut self, buf: &mut [u8]) -> usize {
        match self.inner.read(buf) {
            Ok(n) => n,
            Err(err) => {
                warn!("Failed to read update data: {:?}", err);
                0
            }
        }
    }
}

impl<R: embedded_io::Read> ByteSource for IoSource<R> {
    fn peek(&mut self) -> Option<u8> {
        if self.peeked.is_none() {
            let mut byte = [0u8; 1];
            if self.read_once(&mut byte) == 1 {
                self.peeked = Some(byte[0]);
            }
        }

        self.peeked
    }

    fn read_bytes(&mut self, buf: &mut [u8], _timeout: Duration) -> usize {
        let mut filled = 0;

        if let (Some(byte), Some(first)) = (self.peeked, buf.first_mut()) {
            *first = byte;
            self.peeked = None;
            filled = 1;
        }

        while filled < buf.len() {
            let n = self.read_once(&mut buf[filled..]);
            if n == 0 {
                break;
            }
            filled += n;
        }

        filled
    }
}

/// How long to keep waiting on a stalled source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Give up when nothing arrived for this long
    pub timeout_ms: u64,
    /// Pause between attempts on a stalled source
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, backoff: Duration) -> Self {
        RetryPolicy {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            backoff_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The same policy with another timeout
    pub fn with_timeout(self, timeout: Duration) -> Self {
        RetryPolicy::new(timeout, Duration::from_millis(self.backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout_ms: 60_000,
            backoff_ms: 100,
        }
    }
}

/// What to do after a read returned no data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallAction {
    /// Wait this many milliseconds, then read again
    Retry { backoff_ms: u64 },
    /// The source has been silent for longer than the timeout
    TimedOut,
}

/// Tracks the time since the last successful read
///
/// All time values come from the caller, so the timer runs just as well on a
/// virtual clock.
#[derive(Clone, Copy, Debug)]
pub struct StallTimer {
    policy: RetryPolicy,
    last_progress: u64,
    retries: u32,
}

impl StallTimer {
    pub fn start(policy: RetryPolicy, now: u64) -> Self {
        StallTimer {
            policy,
            last_progress: now,
            retries: 0,
        }
    }

    /// Data arrived at `now`
    pub fn record_progress(&mut self, now: u64) {
        self.last_progress = now;
        self.retries = 0;
    }

    /// A read came back empty at `now`
    pub fn on_stall(&mut self, now: u64) -> StallAction {
        let silent = now.saturating_sub(self.last_progress);
        if silent >= self.policy.timeout_ms {
            debug!("Stream silent for {} ms after {} retries", silent, self.retries);
            return StallAction::TimedOut;
        }

        self.retries += 1;
        StallAction::Retry {
            backoff_ms: self.policy.backoff_ms,
        }
    }

    /// Empty reads since the last successful one
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
