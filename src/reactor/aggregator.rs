//! Fd readiness aggregation over an epoll set.
//!
//! An [`FdAggregator`] owns one kernel readiness set plus a bounded scratch
//! buffer of ready records. Callers register file descriptors with a raw
//! [`EventMask`] and a handler; [`FdAggregator::poll_once`] performs one
//! zero-timeout wait and dispatches every ready record:
//!
//! - error or hang-up conditions remove the fd from the set, then invoke
//!   the handler's [`on_error`](FdHandler::on_error);
//! - readable records invoke [`on_event`](FdHandler::on_event).
//!
//! The aggregator never owns descriptors and never performs I/O on them;
//! it is purely a readiness dispatcher. Handlers stay owned by the caller
//! — the aggregator keeps only a [`Weak`] reference, so a handler dropped
//! while still registered is detected at dispatch and its registration is
//! discarded instead of dereferencing a dangling pointer.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use rustix::event::epoll;
use rustix::io::Errno;
use thiserror::Error;

use crate::trace::{debug, error, trace, warn};

/// Event mask registered for a file descriptor.
///
/// Handed to the kernel verbatim; dispatch only inspects the readable and
/// error/hang-up bits, everything else (edge-trigger, one-shot, …) is the
/// caller's business.
pub type EventMask = epoll::EventFlags;

/// Default capacity of the scratch buffer of ready records.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Conditions routed to [`FdHandler::on_error`] after removing the fd.
const ERROR_MASK: epoll::EventFlags = epoll::EventFlags::ERR
    .union(epoll::EventFlags::HUP)
    .union(epoll::EventFlags::RDHUP);

/// Errors surfaced by the aggregator and the reactor loop.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The kernel readiness set could not be created.
    #[error("failed to create readiness set: {0}")]
    ResourceExhausted(#[source] io::Error),
    /// The readiness wait itself failed. Per-fd conditions are routed to
    /// the affected handler instead and never raise this.
    #[error("readiness poll failed: {0}")]
    PollFailure(#[source] io::Error),
}

/// A file-descriptor event handler.
///
/// Implementations own their descriptor; the aggregator borrows it only
/// for registration syscalls and never closes it. Handlers run on the
/// reactor thread and must not block indefinitely.
pub trait FdHandler: Send + Sync {
    /// The descriptor this handler serves.
    fn fd(&self) -> RawFd;

    /// Called when the descriptor is readable.
    fn on_event(&self);

    /// Called once when the kernel reports an error or hang-up condition.
    /// The descriptor has already been removed from the readiness set;
    /// closing it is the handler's job.
    fn on_error(&self);
}

/// One kernel readiness set with per-fd handler dispatch.
pub struct FdAggregator {
    epoll: OwnedFd,
    handlers: HashMap<RawFd, Weak<dyn FdHandler>>,
    events: epoll::EventVec,
    /// Ready records copied out of `events` before dispatch, so removal
    /// can touch the map mid-iteration.
    ready: Vec<(epoll::EventFlags, RawFd)>,
}

// SAFETY: `events` always carries fds as `u64` user data (see `add_fd`),
// never a real pointer, so the non-`Send` pointer variant of rustix's
// `EventData` union is never populated. `handlers` requires `FdHandler:
// Send + Sync`, so every other field is `Send` on its own.
unsafe impl Send for FdAggregator {}

impl FdAggregator {
    /// Creates an empty readiness set with the default scratch capacity.
    ///
    /// # Errors
    ///
    /// [`ReactorError::ResourceExhausted`] if the kernel refuses to create
    /// the set.
    pub fn new() -> Result<Self, ReactorError> {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates an empty readiness set collecting at most `events` ready
    /// records per poll.
    ///
    /// # Errors
    ///
    /// [`ReactorError::ResourceExhausted`] if the kernel refuses to create
    /// the set.
    pub fn with_capacity(events: usize) -> Result<Self, ReactorError> {
        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC)
            .map_err(|e| ReactorError::ResourceExhausted(e.into()))?;
        Ok(Self {
            epoll,
            handlers: HashMap::new(),
            events: epoll::EventVec::with_capacity(events),
            ready: Vec::with_capacity(events),
        })
    }

    /// Registers `fd` with the given event mask.
    ///
    /// The handler must outlive the registration or be removed with
    /// [`remove_fd`](Self::remove_fd) first; only a weak reference is
    /// retained. Returns `false` if the kernel rejects the registration,
    /// e.g. for a descriptor already in the set.
    pub fn add_fd<H>(&mut self, fd: RawFd, mask: EventMask, handler: &Arc<H>) -> bool
    where
        H: FdHandler + 'static,
    {
        // SAFETY: the caller keeps `fd` open across the call; epoll_ctl
        // does not retain the borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = epoll::add(&self.epoll, borrowed, epoll::EventData::new_u64(fd as u64), mask)
        {
            warn!(fd, errno = e.raw_os_error(), "failed to add fd to aggregator");
            return false;
        }

        let handler_dyn: Arc<dyn FdHandler> = handler.clone();
        let weak: Weak<dyn FdHandler> = Arc::downgrade(&handler_dyn);
        self.handlers.insert(fd, weak);
        debug!(fd, mask = ?mask, "fd added to aggregator");
        true
    }

    /// Deregisters `fd`, dropping its handler reference.
    ///
    /// Returns `false` if the fd was not registered with this aggregator.
    pub fn remove_fd(&mut self, fd: RawFd) -> bool {
        let known = self.handlers.remove(&fd).is_some();

        // SAFETY: borrowed for the syscall only.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = epoll::delete(&self.epoll, borrowed) {
            // Closed descriptors fall out of the kernel set on their own.
            debug!(fd, errno = e.raw_os_error(), "fd not in readiness set");
        }

        known
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn fd_count(&self) -> usize {
        self.handlers.len()
    }

    /// Performs one zero-timeout poll and dispatches every ready record.
    ///
    /// Dispatch order within a pass is whatever the kernel returned.
    /// Error/hang-up conditions remove the fd before `on_error` runs, so a
    /// broken descriptor is reported exactly once.
    ///
    /// # Errors
    ///
    /// [`ReactorError::PollFailure`] if the wait fails for any reason
    /// other than an interrupting signal.
    pub fn poll_once(&mut self) -> Result<(), ReactorError> {
        match epoll::wait(&self.epoll, &mut self.events, 0) {
            Ok(()) => {}
            // A signal between two passes is not a failure.
            Err(e) if e == Errno::INTR => return Ok(()),
            Err(e) => {
                error!(errno = e.raw_os_error(), "readiness wait failed");
                return Err(ReactorError::PollFailure(e.into()));
            }
        }

        self.ready.clear();
        self.ready.extend(self.events.iter().map(|event| {
            let data = event.data;
            (event.flags, data.u64() as RawFd)
        }));

        for &(flags, fd) in &self.ready {
            let Some(weak) = self.handlers.get(&fd) else {
                // Removed earlier in this pass (or never ours).
                trace!(fd, "ready record for unregistered fd, skipping");
                continue;
            };
            let handler = weak.upgrade();

            if flags.intersects(ERROR_MASK) {
                // SAFETY: borrowed for the syscall only.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                match epoll::delete(&self.epoll, borrowed) {
                    Ok(()) => debug!(fd, flags = ?flags, "error condition, fd removed from set"),
                    Err(e) => warn!(
                        fd,
                        errno = e.raw_os_error(),
                        "failed to remove fd after error condition"
                    ),
                }
                self.handlers.remove(&fd);
                match handler {
                    // The handler closes the fd, not the aggregator.
                    Some(handler) => handler.on_error(),
                    None => warn!(fd, "handler dropped while registered"),
                }
            } else if flags.contains(epoll::EventFlags::IN) {
                match handler {
                    Some(handler) => {
                        trace!(fd, "readable, dispatching");
                        handler.on_event();
                    }
                    None => {
                        // Contract breach: the handler died while its fd
                        // was still registered. Discard the registration.
                        warn!(fd, "handler dropped while registered, discarding fd");
                        // SAFETY: borrowed for the syscall only.
                        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                        if let Err(e) = epoll::delete(&self.epoll, borrowed) {
                            debug!(fd, errno = e.raw_os_error(), "fd not in readiness set");
                        }
                        self.handlers.remove(&fd);
                    }
                }
            }
        }

        Ok(())
    }
}
