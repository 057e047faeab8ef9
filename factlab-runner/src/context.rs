//! Run-scoped state shared by every task: configuration, the target-store
//! handle pool, the retry policy and the stop signal.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use factlab_core::retry::RetryPolicy;
use thiserror::Error;
use tracing::warn;

use crate::config::PipelineConfig;
use crate::store::{MemoryStore, TargetStore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("handle pool is empty")]
    Empty,

    #[error("timed out after {0:?} waiting for a store handle")]
    Timeout(Duration),

    #[error("handle pool closed")]
    Closed,
}

/// Fixed set of handles lent out one at a time.
///
/// Backed by a bounded crossbeam channel holding the idle handles: acquiring
/// receives, dropping the guard sends back.
pub struct HandlePool<H> {
    idle_tx: Sender<H>,
    idle_rx: Receiver<H>,
    size: usize,
}

impl<H> HandlePool<H> {
    pub fn new(handles: Vec<H>) -> Self {
        let size = handles.len();
        let (idle_tx, idle_rx) = bounded(size.max(1));
        for h in handles {
            // Capacity equals the number of handles; cannot block.
            let _ = idle_tx.send(h);
        }
        Self {
            idle_tx,
            idle_rx,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently idle.
    pub fn available(&self) -> usize {
        self.idle_rx.len()
    }

    /// Block until a handle is free.
    pub fn acquire(&self) -> Result<PooledHandle<'_, H>, PoolError> {
        if self.size == 0 {
            return Err(PoolError::Empty);
        }
        let handle = self.idle_rx.recv().map_err(|_| PoolError::Closed)?;
        Ok(PooledHandle {
            handle: Some(handle),
            pool: self,
        })
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledHandle<'_, H>, PoolError> {
        if self.size == 0 {
            return Err(PoolError::Empty);
        }
        let handle = self.idle_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => PoolError::Timeout(timeout),
            RecvTimeoutError::Disconnected => PoolError::Closed,
        })?;
        Ok(PooledHandle {
            handle: Some(handle),
            pool: self,
        })
    }

    pub fn try_acquire(&self) -> Option<PooledHandle<'_, H>> {
        self.idle_rx.try_recv().ok().map(|handle| PooledHandle {
            handle: Some(handle),
            pool: self,
        })
    }
}

/// A borrowed handle. Returned to the pool on drop, including during unwinding.
pub struct PooledHandle<'a, H> {
    handle: Option<H>,
    pool: &'a HandlePool<H>,
}

impl<H> Deref for PooledHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        // Only `None` after drop.
        self.handle.as_ref().unwrap_or_else(|| unreachable!("handle used after release"))
    }
}

impl<H> DerefMut for PooledHandle<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.handle.as_mut().unwrap_or_else(|| unreachable!("handle used after release"))
    }
}

impl<H> Drop for PooledHandle<'_, H> {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            if self.pool.idle_tx.send(h).is_err() {
                warn!("store handle could not be returned to pool");
            }
        }
    }
}

/// Cooperative cancellation: once tripped, tasks not yet started are skipped.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The flag itself, for code that takes `Option<&AtomicBool>`.
    pub fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

pub type StoreHandle = Box<dyn TargetStore>;

/// Everything a task may touch besides its inputs. Built fresh per run.
pub struct RunContext {
    pub config: PipelineConfig,
    pub pool: HandlePool<StoreHandle>,
    pub retry: RetryPolicy,
    pub stop: StopSignal,
}

impl RunContext {
    pub fn new(config: PipelineConfig, handles: Vec<StoreHandle>) -> Self {
        let retry = config.retry.clone();
        Self {
            config,
            pool: HandlePool::new(handles),
            retry,
            stop: StopSignal::new(),
        }
    }

    /// Context over a fresh [`MemoryStore`] with `config.run.pool_size`
    /// handles. The returned store shares the tables.
    pub fn in_memory(config: PipelineConfig) -> (Self, MemoryStore) {
        let store = MemoryStore::new();
        let handles = store.handles(config.run.pool_size.max(1));
        (Self::new(config, handles), store)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
