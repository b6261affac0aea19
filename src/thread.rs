//! Thread-handle wrapper with a guaranteed drop action.
//!
//! A bare [`std::thread::JoinHandle`] detaches when dropped. A
//! [`ScopedThread`] instead joins or detaches deliberately, chosen at
//! construction, so a worker cannot silently outlive the scope that
//! spawned it.

use std::thread::JoinHandle;

use crate::trace::warn;

/// What to do with the wrapped thread when the wrapper drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropAction {
    /// Block until the thread finishes.
    Join,
    /// Let the thread run to completion on its own.
    Detach,
}

/// A join handle that resolves its thread on scope exit.
///
/// Not thread safe in itself: one owner drives the wrapper, exactly like
/// the handle it wraps.
pub struct ScopedThread {
    handle: Option<JoinHandle<()>>,
    action: DropAction,
}

impl ScopedThread {
    /// Wraps an already-spawned thread.
    #[must_use]
    pub fn new(handle: JoinHandle<()>, action: DropAction) -> Self {
        Self {
            handle: Some(handle),
            action,
        }
    }

    /// Spawns `f` on a new thread wrapped with the given drop action.
    pub fn spawn<F>(action: DropAction, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(std::thread::spawn(f), action)
    }

    /// Joins the thread now instead of at drop.
    ///
    /// A panic on the joined thread is logged and swallowed.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("joined thread had panicked");
        }
    }

    /// Whether the wrapped thread has finished running.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ScopedThread {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.action {
            DropAction::Join => {
                if handle.join().is_err() {
                    warn!("joined thread had panicked");
                }
            }
            DropAction::Detach => drop(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn drop_joins_the_worker() {
        let done = Arc::new(AtomicBool::new(false));
        let done_worker = Arc::clone(&done);

        let worker = ScopedThread::spawn(DropAction::Join, move || {
            std::thread::sleep(Duration::from_millis(20));
            done_worker.store(true, Ordering::Release);
        });
        drop(worker);

        // The drop above blocked until the worker finished.
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn explicit_join_consumes_the_wrapper() {
        let (tx, rx) = mpsc::channel();
        let worker = ScopedThread::spawn(DropAction::Join, move || {
            tx.send(42u32).expect("receiver alive");
        });
        worker.join();
        assert_eq!(rx.try_recv(), Ok(42));
    }

    #[test]
    fn detached_worker_keeps_running() {
        let (tx, rx) = mpsc::channel();
        let worker = ScopedThread::spawn(DropAction::Detach, move || {
            std::thread::sleep(Duration::from_millis(20));
            // The receiver may already be gone; that is fine.
            let _ = tx.send(());
        });
        drop(worker); // returns immediately

        // The thread is still alive and delivers afterwards.
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(()));
    }

    #[test]
    fn is_finished_tracks_the_worker() {
        let (tx, rx) = mpsc::channel::<()>();
        let worker = ScopedThread::spawn(DropAction::Join, move || {
            // Block until the test releases us.
            let _ = rx.recv();
        });

        assert!(!worker.is_finished());
        tx.send(()).expect("worker waiting");
        worker.join();
    }
}
