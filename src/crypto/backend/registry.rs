//! Process-wide choice of [`Backend`].
//!
//! The first caller probes for an accelerated library; everyone after
//! that reads the stored result. Probing is serialized by a re-entrant
//! lock, so racing first users converge on one discovery attempt.
//! Failing to find a library is not an error, it just means the
//! portable implementation is used.

use std::sync::Arc;

use parking_lot::{const_reentrant_mutex, const_rwlock, ReentrantMutex, RwLock};
use tracing::{debug, info};

use super::openssl::LibCrypto;
use super::Backend;

static PROBE_LOCK: ReentrantMutex<()> = const_reentrant_mutex(());
static ACTIVE: RwLock<Option<Backend>> = const_rwlock(None);

#[cfg(test)]
static SELECTIONS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// How [`initialize_with`] should pick a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendPreference {
    /// Use an accelerated library if one qualifies.
    #[default]
    Auto,
    /// Never probe, always use the bundled implementation.
    Portable,
}

fn current() -> Option<Backend> {
    ACTIVE.read().clone()
}

/// Looks for an accelerated library without touching the registry.
pub fn probe() -> Backend {
    match LibCrypto::discover() {
        Some(lib) => Backend::OpenSsl(Arc::new(lib)),
        None => Backend::Portable,
    }
}

/// Same as `initialize_with(BackendPreference::Auto)`.
pub fn initialize() -> Backend {
    initialize_with(BackendPreference::Auto)
}

/// Selects the process backend if none is selected yet and returns
/// the active one. A preference only takes effect on the call that
/// actually initializes; call [`teardown`] first to change it.
pub fn initialize_with(preference: BackendPreference) -> Backend {
    if let Some(backend) = current() {
        return backend;
    }
    let _guard = PROBE_LOCK.lock();
    if let Some(backend) = current() {
        return backend;
    }
    #[cfg(test)]
    SELECTIONS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let backend = match preference {
        BackendPreference::Auto => probe(),
        BackendPreference::Portable => Backend::Portable,
    };
    *ACTIVE.write() = Some(backend.clone());
    match &backend {
        Backend::OpenSsl(lib) => info!(
            path = %lib.path().display(),
            version = format_args!("{:#x}", lib.version()),
            "accelerated backend in use"
        ),
        Backend::Portable => info!("portable backend in use"),
    }
    backend
}

/// The active backend, initializing with [`BackendPreference::Auto`]
/// on first use.
pub fn active() -> Backend {
    current().unwrap_or_else(initialize)
}

/// Forgets the active backend so the next use probes again. A loaded
/// library is unloaded once in-flight calls holding it finish.
pub fn teardown() {
    let _guard = PROBE_LOCK.lock();
    if let Some(backend) = ACTIVE.write().take() {
        debug!(backend = backend.name(), "backend released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;

    #[test]
    #[serial]
    fn test_portable_preference_skips_probe() {
        teardown();
        let backend = initialize_with(BackendPreference::Portable);
        assert!(!backend.is_accelerated());
        assert!(!active().is_accelerated());
        teardown();
    }

    #[test]
    #[serial]
    fn test_initialize_is_sticky_until_teardown() {
        teardown();
        initialize_with(BackendPreference::Portable);
        let again = initialize_with(BackendPreference::Auto);
        assert_eq!(again.name(), "portable");
        teardown();
        let reprobed = initialize();
        assert_eq!(reprobed.name(), probe().name());
        teardown();
    }

    #[test]
    #[serial]
    fn test_racing_first_use_converges() {
        teardown();
        SELECTIONS.store(0, Ordering::SeqCst);
        let barrier = Barrier::new(8);
        let backends: Vec<Backend> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        active()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(SELECTIONS.load(Ordering::SeqCst), 1);
        for pair in backends.windows(2) {
            match (&pair[0], &pair[1]) {
                (Backend::Portable, Backend::Portable) => {}
                (Backend::OpenSsl(a), Backend::OpenSsl(b)) => assert!(Arc::ptr_eq(a, b)),
                (a, b) => panic!("{} and {} both selected", a.name(), b.name()),
            }
        }
        teardown();
    }

    #[test]
    #[serial]
    fn test_selected_once_until_teardown() {
        teardown();
        SELECTIONS.store(0, Ordering::SeqCst);
        initialize_with(BackendPreference::Portable);
        initialize();
        active();
        assert_eq!(SELECTIONS.load(Ordering::SeqCst), 1);
        teardown();
        active();
        assert_eq!(SELECTIONS.load(Ordering::SeqCst), 2);
        teardown();
    }
}
