//! Delayed executor: a dedicated worker thread with a deadline heap.
//!
//! Upcall follow-up work and other deferred chores go here so they never
//! run on the notifying backend's thread. Teardown stops the executor
//! early in the shutdown sequence; after that point submissions are
//! dropped with a warning.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    // Reversed so the BinaryHeap pops the earliest deadline first; ties
    // resolve in submission order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}

#[derive(Default)]
struct ExecState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    stop: bool,
    abandon: bool,
}

struct ExecInner {
    m: Mutex<ExecState>,
    cv: Condvar,
}

/// A single-threaded deadline-ordered executor.
pub struct DelayedExecutor {
    inner: Arc<ExecInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedExecutor {
    /// Spawn the worker thread.
    #[must_use]
    pub fn start(thread_name: &str) -> Self {
        let inner = Arc::new(ExecInner {
            m: Mutex::new(ExecState::default()),
            cv: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || Self::work(&worker_inner))
            .unwrap_or_else(|e| panic!("failed to spawn delayed executor: {e}"));
        Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    fn work(inner: &ExecInner) {
        loop {
            let job = {
                let mut st = inner.m.lock();
                loop {
                    if st.abandon {
                        let dropped = st.heap.len();
                        if dropped > 0 {
                            warn!(dropped, "abandoning queued delayed work");
                        }
                        st.heap.clear();
                        return;
                    }
                    let now = Instant::now();
                    match st.heap.peek() {
                        // On orderly stop, remaining work runs immediately
                        // (drain) rather than waiting out its deadline.
                        Some(s) if s.at <= now || st.stop => {
                            break st.heap.pop().map(|s| s.job);
                        }
                        Some(s) => {
                            let wait = s.at - now;
                            let _ = inner.cv.wait_for(&mut st, wait);
                        }
                        None if st.stop => return,
                        None => inner.cv.wait(&mut st),
                    }
                }
            };
            if let Some(job) = job {
                // A panicking job must not kill the executor.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    warn!("delayed job panicked");
                }
            }
        }
    }

    /// Run `job` as soon as the worker gets to it.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.submit_after(Duration::ZERO, job);
    }

    /// Run `job` no earlier than `delay` from now.
    pub fn submit_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let mut st = self.inner.m.lock();
        if st.stop {
            warn!("delayed executor stopped; dropping submission");
            return;
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.heap.push(Scheduled {
            at: Instant::now() + delay,
            seq,
            job: Box::new(job),
        });
        self.cv_notify();
    }

    fn cv_notify(&self) {
        self.inner.cv.notify_all();
    }

    /// Jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.m.lock().heap.len()
    }

    /// Orderly stop: queued work is drained (run immediately), then the
    /// worker exits and is joined.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.m.lock();
            st.stop = true;
        }
        self.cv_notify();
        self.join();
        debug!("delayed executor stopped");
    }

    /// Disorderly stop: queued work is dropped unrun.
    pub fn abandon(&self) {
        {
            let mut st = self.inner.m.lock();
            st.stop = true;
            st.abandon = true;
        }
        self.cv_notify();
        self.join();
    }

    fn join(&self) {
        if let Some(h) = self.worker.lock().take() {
            if h.join().is_err() {
                warn!("delayed executor thread panicked before join");
            }
        }
    }
}

impl Drop for DelayedExecutor {
    fn drop(&mut self) {
        // Idempotent: join() already ran if shutdown()/abandon() did.
        {
            let mut st = self.inner.m.lock();
            st.stop = true;
            st.abandon = true;
        }
        self.cv_notify();
        self.join();
    }
}
