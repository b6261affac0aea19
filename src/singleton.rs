//! Process-wide two-phase singleton holder.
//!
//! Construction and access are separate operations with explicit failures,
//! for services that must be configured exactly once at startup and only
//! consumed afterwards. Compare [`std::sync::OnceLock`], whose
//! get-or-init surface would silently paper over a double initialization.

use std::sync::OnceLock;

use thiserror::Error;

/// Lifecycle violations of a [`Singleton`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SingletonError {
    /// `init` was called on an already-initialized holder.
    #[error("instance already initialized")]
    AlreadyInitialized,
    /// `get` was called before `init` succeeded.
    #[error("instance not initialized")]
    NotInitialized,
}

/// A once-initialized holder, meant to live in a `static`.
///
/// Thread safe: when several threads race on [`init`](Self::init), exactly
/// one wins and the rest get [`SingletonError::AlreadyInitialized`].
///
/// # Example
///
/// ```
/// use kestrel::singleton::Singleton;
///
/// struct Config {
///     workers: usize,
/// }
///
/// static CONFIG: Singleton<Config> = Singleton::new();
///
/// CONFIG.init(Config { workers: 4 }).expect("first init");
/// assert_eq!(CONFIG.get().expect("initialized").workers, 4);
/// assert!(CONFIG.init(Config { workers: 8 }).is_err());
/// ```
pub struct Singleton<T> {
    inner: OnceLock<T>,
}

impl<T> Singleton<T> {
    /// Creates an empty holder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Stores the instance and returns a reference to it.
    ///
    /// # Errors
    ///
    /// [`SingletonError::AlreadyInitialized`] if some call — possibly a
    /// racing one — already won initialization; `value` is dropped.
    pub fn init(&self, value: T) -> Result<&T, SingletonError> {
        self.inner
            .set(value)
            .map_err(|_| SingletonError::AlreadyInitialized)?;
        self.get()
    }

    /// Returns the stored instance.
    ///
    /// # Errors
    ///
    /// [`SingletonError::NotInitialized`] before a successful `init`.
    pub fn get(&self) -> Result<&T, SingletonError> {
        self.inner.get().ok_or(SingletonError::NotInitialized)
    }
}

impl<T> Default for Singleton<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn get_before_init_fails() {
        let holder: Singleton<String> = Singleton::new();
        assert_eq!(holder.get(), Err(SingletonError::NotInitialized));
    }

    #[test]
    fn init_then_get() {
        let holder: Singleton<String> = Singleton::new();
        assert_eq!(holder.init("one".to_string()), Ok(&"one".to_string()));
        assert_eq!(holder.get(), Ok(&"one".to_string()));
    }

    #[test]
    fn second_init_fails() {
        let holder: Singleton<u32> = Singleton::new();
        assert!(holder.init(1).is_ok());
        assert_eq!(holder.init(2), Err(SingletonError::AlreadyInitialized));
        assert_eq!(holder.get(), Ok(&1));
    }

    #[test]
    fn racing_inits_have_one_winner() {
        static HOLDER: Singleton<usize> = Singleton::new();
        static WINS: AtomicUsize = AtomicUsize::new(0);

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(thread::spawn(move || {
                if HOLDER.init(i).is_ok() {
                    WINS.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("initializer thread");
        }

        assert_eq!(WINS.load(Ordering::Relaxed), 1);
        assert!(*HOLDER.get().expect("initialized") < 8);
    }
}
