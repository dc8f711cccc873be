//! Structured cache events and counters.
//!
//! A process-wide [`CacheEventSink`] can be installed with [`install_global_sink`]; every
//! [`FusionCache`](crate::cache::FusionCache) reports hits, misses, compilations and persistence
//! through it. Without a sink the cost per event is one relaxed atomic load.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::CompileError;
use crate::fingerprint::Fingerprint;
use crate::shape_key::ConcreteShapeKey;

#[derive(Debug)]
pub enum CacheEvent<'a> {
    Hit {
        fingerprint: Fingerprint,
        key: &'a ConcreteShapeKey,
    },
    Miss {
        fingerprint: Fingerprint,
        key: &'a ConcreteShapeKey,
    },
    CompileStarted {
        fingerprint: Fingerprint,
        key: &'a ConcreteShapeKey,
    },
    CompileFinished {
        fingerprint: Fingerprint,
        key: &'a ConcreteShapeKey,
        elapsed: Duration,
    },
    CompileFailed {
        fingerprint: Fingerprint,
        key: &'a ConcreteShapeKey,
        error: &'a CompileError,
    },
    /// A persisted artifact was rebuilt from its portable bytes.
    Restored {
        fingerprint: Fingerprint,
        key: &'a ConcreteShapeKey,
    },
    Reset {
        entries: usize,
    },
    Serialized {
        path: &'a Path,
        entries: usize,
    },
    Deserialized {
        path: &'a Path,
        entries: usize,
    },
}

pub trait CacheEventSink: Send + Sync {
    fn on_event(&self, event: &CacheEvent<'_>);
}

static SINK_INSTALLED: AtomicBool = AtomicBool::new(false);
static GLOBAL_SINK: Lazy<RwLock<Option<Arc<dyn CacheEventSink>>>> =
    Lazy::new(|| RwLock::new(None));

/// Restores the previously installed sink when dropped.
#[must_use = "the sink is uninstalled when the guard is dropped"]
pub struct SinkGuard {
    previous: Option<Arc<dyn CacheEventSink>>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let mut slot = GLOBAL_SINK.write().expect("cache event sink lock poisoned");
        *slot = self.previous.take();
        SINK_INSTALLED.store(slot.is_some(), Ordering::Release);
    }
}

pub fn install_global_sink(sink: Arc<dyn CacheEventSink>) -> SinkGuard {
    let mut slot = GLOBAL_SINK.write().expect("cache event sink lock poisoned");
    let previous = slot.replace(sink);
    SINK_INSTALLED.store(true, Ordering::Release);
    SinkGuard { previous }
}

pub(crate) fn emit(event: CacheEvent<'_>) {
    if !SINK_INSTALLED.load(Ordering::Relaxed) {
        return;
    }
    let sink = GLOBAL_SINK
        .read()
        .expect("cache event sink lock poisoned")
        .clone();
    if let Some(sink) = sink {
        sink.on_event(&event);
    }
}

/// Snapshot of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub failed_compilations: u64,
    pub restores: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    failed_compilations: AtomicU64,
    restores: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compiled(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compile_failed(&self) {
        self.failed_compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn restored(&self) {
        self.restored_many(1);
    }

    pub(crate) fn restored_many(&self, count: u64) {
        self.restores.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            failed_compilations: self.failed_compilations.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
        }
    }
}
