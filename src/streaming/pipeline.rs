//! Asynchronous decode pipeline
//!
//! The frame loop dispatches [`DecodeRequest`]s; each becomes a task on a
//! tokio runtime that leases a decoder from the pool for its format, runs the
//! CPU-bound decode on the blocking thread pool and sends a
//! [`DecodeResponse`] back over a channel. The frame loop drains responses
//! without blocking at the start of reconciliation.
//!
//! The runtime is either owned by the pipeline ([`LoadPipeline::new`]) or
//! borrowed from the host application ([`LoadPipeline::with_handle`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

use crate::config::StreamingConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use super::decode::{
    BinaryDecoder, DecodeError, DecodeFormat, DecodeRequest, DecodeResponse, DecodedBuffers, Decoder,
    Lz4BinaryDecoder,
};
use super::pool::{DecoderFactory, WorkerPool};

/// Dispatches decodes to per-format worker pools
pub struct LoadPipeline {
    handle: Handle,
    /// Present when the pipeline created its own runtime
    runtime: Option<Runtime>,
    pools: HashMap<DecodeFormat, WorkerPool>,
    /// Sender cloned into every decode task
    response_tx: mpsc::UnboundedSender<DecodeResponse>,
    /// Completed decodes, drained by the frame loop
    response_rx: mpsc::UnboundedReceiver<DecodeResponse>,
    next_ticket: u64,
    /// Dispatched requests whose response was not drained yet
    in_flight: usize,
}

impl LoadPipeline {
    /// Create a dedicated decode runtime and the pools named in the config
    ///
    /// Formats without a built-in decoder are skipped with a warning; use
    /// [`LoadPipeline::register_pool`] for them.
    pub fn new(config: &StreamingConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime_threads)
            .thread_name("pointstream-decode")
            .enable_all()
            .build()?;

        Ok(Self::from_parts(config, runtime.handle().clone(), Some(runtime)))
    }

    /// Run decodes on an existing runtime, e.g. `Handle::current()` inside a
    /// tokio application. The runtime needs its time driver enabled.
    /// `config.runtime_threads` is ignored.
    pub fn with_handle(config: &StreamingConfig, handle: Handle) -> Self {
        Self::from_parts(config, handle, None)
    }

    fn from_parts(config: &StreamingConfig, handle: Handle, runtime: Option<Runtime>) -> Self {
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let mut pipeline = Self {
            handle,
            runtime,
            pools: HashMap::new(),
            response_tx,
            response_rx,
            next_ticket: 0,
            in_flight: 0,
        };

        for pool in &config.pools {
            match pool.format {
                DecodeFormat::Binary => pipeline.register_pool(pool.format, pool.workers, || Box::new(BinaryDecoder)),
                DecodeFormat::BinaryLz4 => {
                    pipeline.register_pool(pool.format, pool.workers, || Box::new(Lz4BinaryDecoder))
                }
                other => log::warn!("No built-in decoder for {:?}, pool not created", other),
            }
        }

        pipeline
    }

    /// Whether the pipeline runs on its own runtime
    pub fn owns_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    /// Add or replace the pool for a format
    pub fn register_pool<F>(&mut self, format: DecodeFormat, workers: usize, factory: F)
    where
        F: Fn() -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        let factory: DecoderFactory = Arc::new(factory);
        if let Some(previous) = self.pools.insert(format, WorkerPool::new(format, workers, factory)) {
            previous.close();
        }
        log::info!("Registered {:?} decode pool with {} workers", format, workers);
    }

    /// Whether requests of this format can be dispatched
    pub fn supports(&self, format: DecodeFormat) -> bool {
        self.pools.contains_key(&format)
    }

    pub fn pool(&self, format: DecodeFormat) -> Option<&WorkerPool> {
        self.pools.get(&format)
    }

    /// Fresh ticket for a dispatch
    pub fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Start a decode
    ///
    /// # Errors
    /// [`Error::UnsupportedFormat`] when no pool exists for the format
    pub fn dispatch(&mut self, request: DecodeRequest) -> Result<()> {
        let pool = self
            .pools
            .get(&request.format)
            .cloned()
            .ok_or(Error::UnsupportedFormat(request.format))?;
        let response_tx = self.response_tx.clone();

        log::trace!("Dispatching {:?} ticket {}", request.key, request.ticket);
        self.in_flight += 1;

        self.handle.spawn(async move {
            let DecodeRequest { key, ticket, locator, .. } = request;

            let result = match pool.acquire().await {
                Ok(mut lease) => {
                    let task = tokio::task::spawn_blocking(move || -> std::result::Result<DecodedBuffers, DecodeError> {
                        let bytes = locator.read()?;
                        lease.decode(&bytes)
                    });
                    match task.await {
                        Ok(result) => result,
                        Err(_) => Err(DecodeError::WorkerPanicked),
                    }
                }
                Err(e) => Err(e),
            };

            // The receiver only goes away with the pipeline itself
            let _ = response_tx.send(DecodeResponse { key, ticket, result });
        });

        Ok(())
    }

    /// Drain completed decodes (non-blocking)
    pub fn poll_responses(&mut self) -> Vec<DecodeResponse> {
        let mut responses = Vec::new();
        while let Ok(response) = self.response_rx.try_recv() {
            responses.push(response);
        }
        self.in_flight = self.in_flight.saturating_sub(responses.len());
        responses
    }

    /// Block until at least one decode completes or `timeout` passes, then
    /// drain everything available.
    ///
    /// Inside an async context blocking is not allowed, so this only drains;
    /// use [`LoadPipeline::recv_responses`] there.
    pub fn wait_for_responses(&mut self, timeout: Duration) -> Vec<DecodeResponse> {
        if Handle::try_current().is_ok() {
            log::debug!("wait_for_responses inside an async context, draining only");
            return self.poll_responses();
        }
        let handle = self.handle.clone();
        handle.block_on(self.recv_responses(timeout))
    }

    /// Wait until at least one decode completes or `timeout` passes, then
    /// drain everything available.
    pub async fn recv_responses(&mut self, timeout: Duration) -> Vec<DecodeResponse> {
        let mut responses = self.poll_responses();
        if !responses.is_empty() || self.in_flight == 0 {
            return responses;
        }

        if let Ok(Some(response)) = tokio::time::timeout(timeout, self.response_rx.recv()).await {
            self.in_flight = self.in_flight.saturating_sub(1);
            responses.push(response);
            responses.extend(self.poll_responses());
        }
        responses
    }

    /// Dispatched decodes not yet drained
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for LoadPipeline {
    fn drop(&mut self) {
        // Shutting down without waiting is allowed from async contexts too
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
