//! Generic typed registry: lazily-constructed, config-initialized
//! singletons keyed by a string kind.
//!
//! Each kind is registered with an explicit constructor closure rather
//! than built through reflection, which is the idiomatic substitute a
//! strongly-typed language reaches for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Capability every registrable kind must expose.
pub trait Identified {
    /// Stable string matching the registry key and the config map key.
    fn id(&self) -> &str;
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct Inner<T> {
    factories: HashMap<String, Factory<T>>,
    singletons: HashMap<String, Arc<T>>,
}

/// Thread-safe registry of lazily-initialized singletons of type `T`,
/// keyed by kind. All map mutations, including the one-time init, happen
/// under one mutex so concurrent first-readers observe a single init.
pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                factories: HashMap::new(),
                singletons: HashMap::new(),
            }),
        }
    }

    /// Register a factory under `kind`, replacing any prior factory for
    /// the same kind. Does not affect an already-cached singleton.
    pub fn register(&self, kind: impl Into<String>, factory: impl Fn() -> T + Send + Sync + 'static) {
        let mut inner = self.inner.lock().unwrap();
        inner.factories.insert(kind.into(), Box::new(factory));
    }

    /// Get the singleton for `kind`, constructing and initializing it via
    /// `init` on first access. If `init` fails, nothing is cached and the
    /// next call retries from scratch.
    pub fn get_singleton_with<E>(
        &self,
        kind: &str,
        init: impl FnOnce(T) -> Result<T, E>,
    ) -> Result<Arc<T>, RegistryError<E>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.singletons.get(kind) {
            return Ok(existing.clone());
        }
        let factory = inner
            .factories
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_owned()))?;
        let fresh = factory();
        let initialized = init(fresh).map_err(RegistryError::Init)?;
        let arc = Arc::new(initialized);
        inner.singletons.insert(kind.to_owned(), arc.clone());
        Ok(arc)
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.inner.lock().unwrap().factories.contains_key(kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError<E> {
    #[error("no factory registered for kind {0:?}")]
    UnknownKind(String),
    #[error("singleton init failed: {0}")]
    Init(E),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Widget {
        build_count: usize,
    }

    #[test]
    fn constructs_and_caches_singleton() {
        static CONSTRUCTIONS: AtomicUsize = AtomicUsize::new(0);
        let reg: Registry<Widget> = Registry::new();
        reg.register("demo", || {
            CONSTRUCTIONS.fetch_add(1, Ordering::SeqCst);
            Widget { build_count: 0 }
        });

        let a = reg
            .get_singleton_with::<()>("demo", |w| Ok(Widget { build_count: w.build_count + 1 }))
            .unwrap();
        let b = reg
            .get_singleton_with::<()>("demo", |w| Ok(Widget { build_count: w.build_count + 1 }))
            .unwrap();

        assert_eq!(CONSTRUCTIONS.load(Ordering::SeqCst), 1);
        assert_eq!(a.build_count, 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn failed_init_does_not_cache() {
        let reg: Registry<Widget> = Registry::new();
        let mut calls = 0;
        reg.register("flaky", || Widget { build_count: 0 });

        let first = reg.get_singleton_with("flaky", |_| {
            calls += 1;
            Err::<Widget, &str>("boom")
        });
        assert!(first.is_err());

        let second = reg.get_singleton_with::<()>("flaky", |w| Ok(w));
        assert!(second.is_ok());
    }

    #[test]
    fn unknown_kind_errors() {
        let reg: Registry<Widget> = Registry::new();
        let err = reg.get_singleton_with::<()>("missing", Ok);
        assert!(matches!(err, Err(RegistryError::UnknownKind(_))));
    }
}
