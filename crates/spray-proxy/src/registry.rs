//! In-memory registry of backend base URLs.
//!
//! The registry is the only shared mutable state in the proxy. Every
//! operation takes the lock for the duration of an in-memory update or copy
//! and never holds it across I/O.

use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome of [`BackendRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    AlreadyPresent,
}

/// Outcome of [`BackendRegistry::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

/// Thread-safe set of backend URLs. Cheap to clone (Arc).
///
/// URLs are compared by exact string equality and enumerated in
/// registration order, so the first registered backend is the primary.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    inner: Arc<Mutex<Vec<String>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-seeded with `urls`, keeping the first
    /// occurrence of any duplicate.
    pub fn with_backends<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for url in urls {
            registry.register(url);
        }
        registry
    }

    /// Insert `url` unless it is already registered.
    pub fn register(&self, url: impl Into<String>) -> Registration {
        let url = url.into();
        let mut backends = self.inner.lock();
        if backends.contains(&url) {
            return Registration::AlreadyPresent;
        }
        backends.push(url);
        Registration::Added
    }

    /// Remove `url` if it is registered.
    pub fn unregister(&self, url: &str) -> Removal {
        let mut backends = self.inner.lock();
        match backends.iter().position(|b| b == url) {
            Some(pos) => {
                backends.remove(pos);
                Removal::Removed
            }
            None => Removal::NotFound,
        }
    }

    /// Point-in-time copy of the registered URLs in registration order.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
