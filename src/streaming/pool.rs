//! Bounded decoder pools, one per payload format
//!
//! A pool creates decoders lazily up to its capacity and hands them out as
//! [`WorkerLease`]s. Dropping a lease puts the decoder back, so a worker is
//! returned on every path out of a decode task, including errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::decode::{DecodeError, DecodeFormat, DecodedBuffers, Decoder};

/// Creates a fresh decoder for a pool
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;

struct PoolInner {
    format: DecodeFormat,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Decoder>>>,
    factory: DecoderFactory,
    created: AtomicUsize,
}

/// Pool of at most `capacity` live decoders. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(format: DecodeFormat, capacity: usize, factory: DecoderFactory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                format,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                factory,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free worker
    pub async fn acquire(&self) -> Result<WorkerLease, DecodeError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DecodeError::PoolClosed)?;

        let reused = self.inner.idle.lock().ok().and_then(|mut idle| idle.pop());
        let decoder = match reused {
            Some(decoder) => decoder,
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)()
            }
        };

        Ok(WorkerLease {
            pool: self.clone(),
            decoder: Some(decoder),
            _permit: permit,
        })
    }

    /// Fail pending and future acquires
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn format(&self) -> DecodeFormat {
        self.inner.format
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Workers not currently leased
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Decoders constructed so far
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    fn give_back(&self, decoder: Box<dyn Decoder>) {
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.push(decoder);
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("format", &self.inner.format)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A leased decoder; returned to its pool on drop
pub struct WorkerLease {
    pool: WorkerPool,
    decoder: Option<Box<dyn Decoder>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn decode(&mut self, bytes: &[u8]) -> Result<DecodedBuffers, DecodeError> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.decode(bytes),
            None => Err(DecodeError::PoolClosed),
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        // A decoder that panicked mid-task may hold broken scratch state
        if std::thread::panicking() {
            return;
        }
        if let Some(decoder) = self.decoder.take() {
            self.pool.give_back(decoder);
        }
    }
}
