//! Background execution: periodic sweepers and per-key worker lanes

use std::hash::Hash;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use ahash::RandomState;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::error;

/// Poll period while a sweeper is disabled by a zero interval
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Periodic task on its own thread, stopped and joined on drop
pub(crate) struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Run `tick` every interval. `tick` returns the next interval, `None`
    /// to stop; a zero interval idles without ticking.
    pub fn spawn<F>(name: &str, first: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut(bool) -> Option<Duration> + Send + 'static,
    {
        let (stop, stopped) = channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut interval = first;
                loop {
                    let active = !interval.is_zero();
                    let wait = if active { interval } else { IDLE_POLL };
                    match stopped.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => match tick(active) {
                            Some(next) => interval = next,
                            None => break,
                        },
                        _ => break,
                    }
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            // The last owner may be released from inside a tick
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads fed by FIFO queues.
///
/// Jobs submitted for the same key always land on the same lane and run in
/// submission order. Keyless jobs use a separate control lane.
pub(crate) struct Lanes {
    keyed: Vec<Sender<Job>>,
    control: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    hasher: RandomState,
}

impl Lanes {
    pub fn new(name: &str, count: usize) -> io::Result<Self> {
        let count = count.max(1);
        let mut keyed = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count + 1);

        for i in 0..count {
            let (tx, handle) = Self::spawn_lane(format!("{}-lane-{}", name, i))?;
            keyed.push(tx);
            handles.push(handle);
        }
        let (control, handle) = Self::spawn_lane(format!("{}-control", name))?;
        handles.push(handle);

        Ok(Self {
            keyed,
            control: Some(control),
            handles,
            hasher: RandomState::new(),
        })
    }

    fn spawn_lane(name: String) -> io::Result<(Sender<Job>, JoinHandle<()>)> {
        let (tx, rx) = channel::unbounded::<Job>();
        let handle = thread::Builder::new().name(name).spawn(move || {
            for job in rx {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Cache job panicked; lane continues");
                }
            }
        })?;
        Ok((tx, handle))
    }

    /// Queue a job behind every earlier job for the same key
    pub fn submit_keyed<K, F>(&self, key: &K, job: F)
    where
        K: Hash + ?Sized,
        F: FnOnce() + Send + 'static,
    {
        let lane = (self.hasher.hash_one(key) % self.keyed.len() as u64) as usize;
        let _ = self.keyed[lane].send(Box::new(job));
    }

    /// Queue a job with no key ordering
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(control) = &self.control {
            let _ = control.send(Box::new(job));
        }
    }

    fn thread_ids(&self) -> Vec<ThreadId> {
        self.handles.iter().map(|h| h.thread().id()).collect()
    }
}

impl Drop for Lanes {
    fn drop(&mut self) {
        // Closing the queues lets each lane finish what is already queued
        self.keyed.clear();
        self.control = None;

        let current = thread::current().id();
        if self.thread_ids().contains(&current) {
            return;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_same_key_runs_in_order() {
        let lanes = Lanes::new("test", 4).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            lanes.submit_keyed("key", move || seen.lock().push(i));
        }
        drop(lanes);

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_queued_jobs() {
        let lanes = Lanes::new("test", 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..50 {
            let done = done.clone();
            lanes.submit_keyed(&i, move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        let control = done.clone();
        lanes.submit(move || {
            control.fetch_add(1, Ordering::SeqCst);
        });
        drop(lanes);

        assert_eq!(done.load(Ordering::SeqCst), 51);
    }

    #[test]
    fn test_panicking_job_does_not_kill_lane() {
        let lanes = Lanes::new("test", 1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        lanes.submit_keyed("k", || panic!("boom"));
        let after = done.clone();
        lanes.submit_keyed("k", move || {
            after.fetch_add(1, Ordering::SeqCst);
        });
        drop(lanes);

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ticker_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = Ticker::spawn("tick-test", Duration::from_millis(5), move |active| {
            if active {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Some(Duration::from_millis(5))
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        drop(ticker);
        let after_drop = ticks.load(Ordering::SeqCst);
        assert!(after_drop > 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_ticker_stops_when_tick_returns_none() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let _ticker = Ticker::spawn("tick-test", Duration::from_millis(1), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
