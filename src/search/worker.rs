// src/search/worker.rs
//
// The single thread the search recurses on. The front-end never touches
// search state directly: it pauses (cooperative cancellation through
// `keep_going`), resumes with a fresh job, and waits on a completion latch.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Signals shared between the front-end and the searcher. The searcher polls
/// these at every recursion entry and inside its periodic time check.
pub struct Signals {
    keep_going: AtomicBool,
    pondering: AtomicBool,
    nodes: AtomicU64,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            keep_going: AtomicBool::new(true),
            pondering: AtomicBool::new(false),
            nodes: AtomicU64::new(0),
        }
    }
}

impl Signals {
    #[inline]
    pub fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::Relaxed)
    }

    pub fn set_keep_going(&self, v: bool) {
        self.keep_going.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn pondering(&self) -> bool {
        self.pondering.load(Ordering::Relaxed)
    }

    pub fn set_pondering(&self, v: bool) {
        self.pondering.store(v, Ordering::Relaxed);
    }

    /// Published node counter, refreshed on the check-time cadence.
    pub fn nodes(&self) -> u64 {
        self.nodes.load(Ordering::Relaxed)
    }

    pub fn publish_nodes(&self, n: u64) {
        self.nodes.store(n, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
    quit: AtomicBool,
    signals: Arc<Signals>,
}

pub struct WorkerLoop {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerLoop {
    /// Spawn the worker and attach its long-running function. The function
    /// runs once per `resume` call.
    pub fn start<F>(signals: Arc<Signals>, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Idle),
            cv: Condvar::new(),
            quit: AtomicBool::new(false),
            signals,
        });

        let s = Arc::clone(&shared);
        let handle = std::thread::spawn(move || loop {
            {
                let mut state = s.state.lock();
                while *state == State::Idle && !s.quit.load(Ordering::Acquire) {
                    s.cv.wait(&mut state);
                }
            }
            if s.quit.load(Ordering::Acquire) {
                break;
            }

            f();

            *s.state.lock() = State::Idle;
            s.cv.notify_all();
        });

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Request cancellation; the searcher observes it within O(2048 nodes).
    pub fn pause(&self) {
        self.shared.signals.set_keep_going(false);
    }

    /// Re-arm and kick off one run of the attached function.
    pub fn resume(&self) {
        self.shared.signals.set_keep_going(true);
        let mut state = self.shared.state.lock();
        *state = State::Running;
        self.shared.cv.notify_all();
    }

    #[inline]
    pub fn keep_going(&self) -> bool {
        self.shared.signals.keep_going()
    }

    /// Block until the worker is idle again.
    pub fn wait_for_completion(&self) {
        let mut state = self.shared.state.lock();
        while *state == State::Running {
            self.shared.cv.wait(&mut state);
        }
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        self.pause();
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_once_per_resume_and_latches_idle() {
        let signals = Arc::new(Signals::default());
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let worker = WorkerLoop::start(Arc::clone(&signals), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        worker.resume();
        worker.wait_for_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        worker.resume();
        worker.wait_for_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pause_is_observed_by_a_spinning_job() {
        let signals = Arc::new(Signals::default());
        let s = Arc::clone(&signals);
        let worker = WorkerLoop::start(Arc::clone(&signals), move || {
            while s.keep_going() {
                std::thread::yield_now();
            }
        });

        worker.resume();
        std::thread::sleep(Duration::from_millis(20));
        worker.pause();
        worker.wait_for_completion();
    }
}
