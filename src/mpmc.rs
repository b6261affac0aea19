//! Bounded lock-free MPMC queue primitives.
//!
//! The ring hands out slots *in place*: a writer reserves a slot, fills the
//! payload through the returned guard, and commits; readers mirror the same
//! protocol. Payload memory is allocated once at [`MpmcRing::init`] and
//! reused for the lifetime of the queue, so steady-state operation never
//! allocates.

pub mod ring;

pub use ring::{MpmcRing, ReadSlot, Timeout, WriteSlot};
