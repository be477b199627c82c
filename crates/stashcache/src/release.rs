//! Where evicted and replaced values are dropped
//!
//! Dropping a large object graph can be slow. The memory cache hands values
//! it no longer holds to a [`ReleasePolicy`]; by the time a cache call
//! returns the value is gone from the cache whichever policy is used.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;

type Garbage = Box<dyn Any + Send>;

static BACKGROUND: Lazy<Option<Sender<Garbage>>> = Lazy::new(|| {
    let (tx, rx) = channel::unbounded::<Garbage>();
    std::thread::Builder::new()
        .name("stash-release".to_string())
        .spawn(move || {
            for garbage in rx {
                drop(garbage);
            }
        })
        .map_err(|e| tracing::warn!("Background release thread unavailable: {}", e))
        .ok()
        .map(|_| tx)
});

/// Disposal strategy for values leaving the memory cache
#[derive(Clone, Default)]
pub enum ReleasePolicy {
    /// Drop on the calling thread
    Inline,
    /// Drop on a shared background thread
    #[default]
    Background,
    /// Drop wherever the paired [`ReleaseQueue`] is drained
    Dedicated(ReleaseThread),
}

impl fmt::Debug for ReleasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleasePolicy::Inline => write!(f, "Inline"),
            ReleasePolicy::Background => write!(f, "Background"),
            ReleasePolicy::Dedicated(_) => write!(f, "Dedicated"),
        }
    }
}

impl ReleasePolicy {
    pub(crate) fn release<T: Send + 'static>(&self, garbage: Vec<T>) {
        if garbage.is_empty() {
            return;
        }
        let sender = match self {
            ReleasePolicy::Inline => None,
            ReleasePolicy::Background => BACKGROUND.as_ref(),
            ReleasePolicy::Dedicated(thread) => Some(&thread.tx),
        };
        match sender {
            // A closed queue hands the values back; drop them here
            Some(tx) => drop(tx.send(Box::new(garbage))),
            None => drop(garbage),
        }
    }
}

/// Sending half of a host-designated release thread
#[derive(Clone)]
pub struct ReleaseThread {
    tx: Sender<Garbage>,
}

impl ReleaseThread {
    /// Create a release channel. Values are dropped by whichever thread
    /// drains the returned queue, e.g. an application's main loop.
    pub fn new() -> (Self, ReleaseQueue) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, ReleaseQueue { rx })
    }
}

/// Receiving half of a [`ReleaseThread`]
pub struct ReleaseQueue {
    rx: Receiver<Garbage>,
}

impl ReleaseQueue {
    /// Drop everything queued so far; returns how many batches were dropped
    pub fn drain(&self) -> usize {
        self.rx.try_iter().map(drop).count()
    }

    /// Drop batches as they arrive for up to `timeout`
    pub fn drain_for(&self, timeout: Duration) -> usize {
        let mut dropped = 0;
        loop {
            match self.rx.recv_timeout(timeout) {
                Ok(garbage) => {
                    drop(garbage);
                    dropped += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return dropped
                }
            }
        }
    }

    /// Drop batches until every [`ReleaseThread`] handle is gone
    pub fn run(self) {
        for garbage in self.rx {
            drop(garbage);
        }
    }
}
