//! Bounded worker pools
//!
//! Every external call runs through one of two independent pools: [`PoolKind::Network`]
//! for the Census API and [`PoolKind::Storage`] for database writes. A pool is a
//! counting semaphore; a submitted future waits for a permit, runs while holding
//! it, and releases it on completion. Sibling tasks keep running while a call
//! waits for a slot.
//!
//! The pool a future runs in is recorded in a task-local, readable through
//! [`current_pool`], so tests can assert that each call site uses the right pool.

use census_common::{CensusError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::trace;

/// Resource class of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Network,
    Storage,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Network => f.write_str("network"),
            PoolKind::Storage => f.write_str("storage"),
        }
    }
}

tokio::task_local! {
    static CURRENT_POOL: PoolKind;
}

/// Pool the current task is executing in, if any
pub fn current_pool() -> Option<PoolKind> {
    CURRENT_POOL.try_with(|kind| *kind).ok()
}

/// A fixed-size pool of execution slots
#[derive(Debug, Clone)]
pub struct WorkerPool {
    kind: PoolKind,
    size: usize,
    permits: Arc<Semaphore>,
    call_timeout: Option<Duration>,
    submitted: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(kind: PoolKind, size: usize) -> Self {
        Self {
            kind,
            size,
            permits: Arc::new(Semaphore::new(size)),
            call_timeout: None,
            submitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bound each call's running time, not counting the wait for a slot
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Calls currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// Total calls that have acquired a slot
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Run `call` once a slot is free
    pub async fn run<F, T>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| {
            CensusError::Internal(format!("{} pool closed while '{}' was queued", self.kind, operation))
        })?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(pool = %self.kind, operation, in_flight = self.in_flight(), "Acquired pool slot");

        let scoped = CURRENT_POOL.scope(self.kind, call);
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, scoped).await.map_err(|_| {
                CensusError::Timeout {
                    operation: operation.to_string(),
                    secs: limit.as_secs(),
                }
            })?,
            None => scoped.await,
        }
    }
}

/// The two pools shared by every component of one ingestion run
#[derive(Debug, Clone)]
pub struct Executors {
    pub network: WorkerPool,
    pub storage: WorkerPool,
}

impl Executors {
    pub fn new(network_size: usize, storage_size: usize, call_timeout: Option<Duration>) -> Self {
        Self {
            network: WorkerPool::new(PoolKind::Network, network_size).with_call_timeout(call_timeout),
            storage: WorkerPool::new(PoolKind::Storage, storage_size).with_call_timeout(call_timeout),
        }
    }
}
