//! Low-level concurrency and I/O building blocks.
//!
//! kestrel is a small utilities crate meant to be composed by higher-level
//! services. Two subsystems do the heavy lifting:
//!
//! - [`mpmc`] — a bounded, lock-free multi-producer/multi-consumer ring
//!   buffer with in-place slot access through a reserve/commit protocol.
//! - [`reactor`] — an epoll-based readiness aggregator plus a stoppable
//!   single-threaded dispatch loop.
//!
//! The remaining modules are the glue those subsystems (and their users)
//! lean on: [`math`] bit helpers, a process-wide [`singleton`] holder, an
//! [`event`] observer multiplexer, and a join-on-drop [`thread`] wrapper.

pub mod event;
pub mod math;
pub mod mpmc;
pub mod reactor;
pub mod singleton;
pub mod thread;
mod trace;

pub use trace::init_tracing;

#[doc(inline)]
pub use mpmc::{MpmcRing, ReadSlot, Timeout, WriteSlot};

#[doc(inline)]
pub use reactor::{EventMask, FdAggregator, FdHandler, Reactor, ReactorError, StopHandle};
