//! # Serial Execution Lanes
//!
//! A [`Lane`] is the scheduling primitive of the engine: a dedicated OS
//! thread that owns a piece of state and drains a FIFO channel of jobs, each
//! job receiving `&mut` access to that state. Lanes differ only in who
//! submits to them:
//!
//! - **per-connection lane** — owns the connection's SQLite handle and cache
//!   views; every transaction runs here
//! - **snapshot lane** — owns the coordinator's bookkeeping (connection
//!   states, changeset log, snapshot clock); short critical sections only
//! - **checkpoint lane** — owns a dedicated read-write handle; background
//!   WAL maintenance
//!
//! ## Why Threads Owning State?
//!
//! SQLite handles are `Send` but not `Sync`: a `rusqlite::Connection` can
//! move between threads but never be shared. Parking each handle on its own
//! thread and shipping closures to it gives strict FIFO serialization with
//! no locking around the handle at all. The same shape serializes the
//! coordinator's state without a mutex in sight — jobs *are* the critical
//! sections.
//!
//! ## Submission Modes
//!
//! - [`LaneSender::submit`] — fire-and-forget; never blocks the caller. This
//!   is what cross-lane traffic uses (a lane must never block on another
//!   lane, or two lanes could deadlock on each other).
//! - [`LaneSender::run`] — submit and block on a response channel. This is
//!   what client-facing calls use.
//!
//! A job submitted from the lane's own thread via `run` would wait for
//! itself forever; [`LaneSender::is_current`] lets callers detect and reject
//! that reentrancy.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::{Error, Result};

/// A job shipped to a lane: runs once with exclusive access to the state.
type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

// =============================================================================
// Lane
// =============================================================================

/// A serial execution lane: one thread, one state, FIFO jobs.
///
/// Dropping the `Lane` (after every [`LaneSender`] clone is gone) closes the
/// channel; the thread drains remaining jobs and exits. [`Lane::join`] waits
/// for that to finish.
#[derive(Debug)]
pub struct Lane<S> {
    sender: LaneSender<S>,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> Lane<S> {
    /// Spawns a named lane thread owning `state`.
    pub fn spawn(name: &str, state: S) -> Self {
        let (tx, rx) = mpsc::channel::<Job<S>>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_lane(state, rx))
            .expect("failed to spawn lane thread");

        let sender = LaneSender {
            tx,
            thread_id: handle.thread().id(),
        };

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Returns a cloneable submission handle for this lane.
    pub fn sender(&self) -> LaneSender<S> {
        self.sender.clone()
    }

    /// Closes the lane and waits for queued jobs to drain.
    ///
    /// Jobs already in the channel still run; only then does the thread
    /// exit. Outstanding [`LaneSender`] clones keep the lane alive — `join`
    /// blocks until they are dropped too.
    pub fn join(mut self) {
        let handle = self.handle.take();
        // Dropping self drops our sender, letting the channel close.
        drop(self);
        if let Some(handle) = handle {
            handle.join().expect("lane thread panicked");
        }
    }
}

impl<S> Drop for Lane<S> {
    fn drop(&mut self) {
        // Detach rather than join: clones of the sender may outlive the
        // Lane briefly during teardown, and joining here would deadlock on
        // them. The thread exits once the last sender is gone.
        self.handle.take();
    }
}

/// The lane's main loop: drain jobs until every sender is gone.
fn run_lane<S>(mut state: S, rx: Receiver<Job<S>>) {
    while let Ok(job) = rx.recv() {
        job(&mut state);
    }
}

// =============================================================================
// LaneSender
// =============================================================================

/// A cloneable handle for submitting jobs to a [`Lane`].
#[derive(Debug)]
pub struct LaneSender<S> {
    tx: Sender<Job<S>>,
    thread_id: ThreadId,
}

impl<S> Clone for LaneSender<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            thread_id: self.thread_id,
        }
    }
}

impl<S: Send + 'static> LaneSender<S> {
    /// Enqueues a job without waiting for it.
    ///
    /// Never blocks: the channel is unbounded, which is what lets lanes
    /// submit to each other freely. Cross-lane fan-out (the changeset
    /// broadcast) depends on this.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if the lane has shut down.
    pub fn submit(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.tx.send(Box::new(job)).map_err(|_| Error::Cancelled)
    }

    /// Enqueues a job and blocks until it has run, returning its result.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if the lane shut down before (or while) the job
    /// could run.
    ///
    /// # Panics
    ///
    /// Must not be called from the lane's own thread (the job would wait on
    /// itself). Callers check [`LaneSender::is_current`] and surface a
    /// descriptive panic; this method will simply deadlock if misused.
    pub fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        self.submit(move |state| {
            let _ = result_tx.send(f(state));
        })?;
        result_rx.recv().map_err(|_| Error::Cancelled)
    }

    /// Whether the calling thread *is* the lane thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_run_returns_result() {
        let lane = Lane::spawn("test-lane", 10i64);
        let doubled = lane.sender().run(|n| *n * 2).unwrap();
        assert_eq!(doubled, 20);
        lane.join();
    }

    /// Jobs run in strict submission order.
    #[test]
    fn test_fifo_order() {
        let lane = Lane::spawn("test-fifo", Vec::<u32>::new());
        let sender = lane.sender();

        for i in 0..100 {
            sender.submit(move |v| v.push(i)).unwrap();
        }

        let observed = sender.run(|v| v.clone()).unwrap();
        assert_eq!(observed, (0..100).collect::<Vec<_>>());
        drop(sender);
        lane.join();
    }

    /// Mutations made by earlier jobs are visible to later ones.
    #[test]
    fn test_state_persists_across_jobs() {
        let lane = Lane::spawn("test-state", 0u64);
        let sender = lane.sender();

        sender.submit(|n| *n += 1).unwrap();
        sender.submit(|n| *n += 2).unwrap();
        assert_eq!(sender.run(|n| *n).unwrap(), 3);
        drop(sender);
        lane.join();
    }

    /// Submission from many threads serializes without loss.
    #[test]
    fn test_concurrent_submission() {
        let lane = Lane::spawn("test-concurrent", 0u64);
        let sender = lane.sender();

        let mut handles = vec![];
        for _ in 0..8 {
            let s = sender.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    s.submit(|n| *n += 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sender.run(|n| *n).unwrap(), 8000);
        drop(sender);
        lane.join();
    }

    #[test]
    fn test_is_current() {
        let lane = Lane::spawn("test-current", ());
        let sender = lane.sender();

        assert!(!sender.is_current());

        let inner = sender.clone();
        let seen = Arc::new(Mutex::new(false));
        let seen2 = Arc::clone(&seen);
        sender
            .run(move |_| {
                *seen2.lock().unwrap() = inner.is_current();
            })
            .unwrap();

        assert!(*seen.lock().unwrap());
        drop(sender);
        lane.join();
    }

    /// A queued job still runs before the lane exits.
    #[test]
    fn test_join_drains_queue() {
        let observed = Arc::new(Mutex::new(0u32));
        let lane = Lane::spawn("test-drain", Arc::clone(&observed));
        let sender = lane.sender();

        for _ in 0..50 {
            sender
                .submit(|state: &mut Arc<Mutex<u32>>| {
                    *state.lock().unwrap() += 1;
                })
                .unwrap();
        }

        drop(sender);
        lane.join();
        assert_eq!(*observed.lock().unwrap(), 50);
    }
}
