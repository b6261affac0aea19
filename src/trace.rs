//! Feature-gated tracing facade.
//!
//! With the `tracing` feature enabled the crate emits structured events
//! through the `tracing` ecosystem; without it every macro below compiles
//! to nothing, keeping the hot paths free of logging overhead.

/// Installs a formatting subscriber with an uptime timer.
///
/// Call at the start of tests or binaries to see the crate's trace output.
/// Honors `RUST_LOG`; defaults to `kestrel=trace`. Does nothing when the
/// `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kestrel=trace"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// A single no-op macro stands in for every level when tracing is disabled.
#[cfg(not(feature = "tracing"))]
macro_rules! noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop as trace;

#[cfg(not(feature = "tracing"))]
pub(crate) use noop as debug;

#[cfg(not(feature = "tracing"))]
pub(crate) use noop as info;

#[cfg(not(feature = "tracing"))]
pub(crate) use noop as warn;

#[cfg(not(feature = "tracing"))]
pub(crate) use noop as error;
