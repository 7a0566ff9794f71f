//! Exclusive port ownership.
//!
//! Only one session may read a physical port at a time. Ownership is a
//! lock keyed by port identifier; the returned guard releases it on drop.

use crate::source::types::{Sample, SourceError};
use crate::source::SampleSource;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Registry of ports currently held by a session.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortRegistry {
    /// Create an empty, independent registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used unless another one is injected.
    pub fn global() -> &'static PortRegistry {
        static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PortRegistry::new)
    }

    /// Claim a port, failing with `PortBusy` if it is already held.
    pub fn acquire(&self, port: &str) -> Result<PortGuard, SourceError> {
        let key = port.trim().to_string();
        let mut held = self.lock();
        if !held.insert(key.clone()) {
            return Err(SourceError::PortBusy(key));
        }
        tracing::debug!(port = %key, "port acquired");
        Ok(PortGuard {
            port: key,
            held: self.held.clone(),
        })
    }

    /// Check whether a port is currently held.
    pub fn is_held(&self, port: &str) -> bool {
        self.lock().contains(port.trim())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof of exclusive access to a port. Dropping it frees the port.
#[derive(Debug)]
pub struct PortGuard {
    port: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortGuard {
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.port);
        tracing::debug!(port = %self.port, "port released");
    }
}

/// Wraps a source that has no port of its own so it still occupies one.
pub struct GuardedSource<S> {
    inner: S,
    guard: Option<PortGuard>,
}

impl<S: SampleSource> GuardedSource<S> {
    pub fn new(inner: S, guard: PortGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<S: SampleSource> SampleSource for GuardedSource<S> {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        if self.guard.is_none() {
            return Err(SourceError::Closed);
        }
        self.inner.next_sample()
    }

    fn close(&mut self) {
        self.inner.close();
        self.guard.take();
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
