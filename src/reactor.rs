//! Single-threaded readiness reactor.
//!
//! A [`Reactor`] composes one or more [`FdAggregator`]s and drives them
//! from the calling thread until stopped. The loop never sleeps: intended
//! deployments register edge-triggered descriptors plus a timerfd or
//! eventfd for liveness, and layer their own idle back-off if they want
//! one.
//!
//! Dispatch is single-threaded by design. Registering descriptors while
//! [`Reactor::run`] is executing is not supported — register everything
//! first, or build a self-wakeup descriptor protocol on top.

pub mod aggregator;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use aggregator::{EventMask, FdAggregator, FdHandler, ReactorError};

use crate::trace::{debug, info};

/// Cross-thread stop signal for a [`Reactor`].
///
/// Cloneable and [`Send`]; obtained from [`Reactor::stop_handle`] before
/// the reactor moves to its loop thread.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests the reactor loop to exit after its current pass.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Drives a set of aggregators until told to stop.
pub struct Reactor {
    aggregators: Vec<FdAggregator>,
    stop: Arc<AtomicBool>,
}

impl Reactor {
    /// Creates a reactor with no aggregators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            aggregators: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adds an aggregator to the polling rotation.
    pub fn add_aggregator(&mut self, aggregator: FdAggregator) {
        self.aggregators.push(aggregator);
    }

    /// Runs the event loop on the calling thread.
    ///
    /// Polls every aggregator in turn until a stop request is observed.
    /// Observing the request consumes it, so a stop issued before `run`
    /// makes this return immediately and the reactor stays reusable.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReactorError::PollFailure`] raised by any
    /// aggregator; the failing pass is abandoned.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        info!(aggregators = self.aggregators.len(), "reactor running");
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.stop.store(false, Ordering::Release);
                debug!("reactor stop observed");
                return Ok(());
            }
            for aggregator in &mut self.aggregators {
                aggregator.poll_once()?;
            }
        }
    }

    /// Requests the loop to exit after its current pass.
    ///
    /// Safe to call from any thread through a clone of
    /// [`stop_handle`](Self::stop_handle); calling it again before the
    /// loop observes the request is a no-op.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Returns a cloneable cross-thread stop signal.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}
