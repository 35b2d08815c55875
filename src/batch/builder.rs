use super::aggregator::{BatchHandle, Shared};
use super::cancel::CancellationController;
use super::config::BatchConfig;
use super::dispatcher::{Completion, Dispatcher};
use super::operation::{Operation, PayloadRef};
use super::permits::PermitPool;
use super::tracker::OutcomeTracker;
use crate::telemetry::{noop_sink, BatchEvent, BatchEventSink};
use crate::transport::Transport;
use crate::{Error, ErrorContext, Result};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{info, Instrument};
use uuid::Uuid;

/// Entry point for creating batches.
pub struct Batch;

impl Batch {
    pub fn builder() -> BatchBuilder {
        BatchBuilder::new()
    }

    /// Start a batch with the default configuration and the given concurrency limit.
    pub fn spawn<I>(
        transport: Arc<dyn Transport>,
        payloads: I,
        concurrency_limit: usize,
    ) -> Result<BatchHandle>
    where
        I: IntoIterator<Item = PayloadRef>,
    {
        BatchBuilder::new()
            .concurrency_limit(concurrency_limit)
            .spawn(transport, payloads)
    }
}

pub struct BatchBuilder {
    config: BatchConfig,
    sink: Arc<dyn BatchEventSink>,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self {
            config: BatchConfig::default(),
            sink: noop_sink(),
        }
    }

    pub fn config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn BatchEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register every payload as a pending operation and start dispatching.
    ///
    /// All operations are counted as outstanding before this returns, so a
    /// `cancel()` issued right away still accounts for each of them. Must be
    /// called from within a Tokio runtime.
    pub fn spawn<I>(self, transport: Arc<dyn Transport>, payloads: I) -> Result<BatchHandle>
    where
        I: IntoIterator<Item = PayloadRef>,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "batches must be spawned inside a Tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("batch_builder"),
            )
        })?;

        let batch_id = Uuid::new_v4();
        let limit = self.config.effective_limit();
        let tracker = Arc::new(OutcomeTracker::new());
        let mut operations = Vec::new();
        for payload in payloads {
            // not sealed yet, so enqueue always yields an id
            if let Some(id) = tracker.enqueue() {
                operations.push(Operation::new(id, payload));
            }
        }
        tracker.seal();

        let pool = Arc::new(PermitPool::new(limit));
        let cancel = CancellationController::new(self.config.cancel_policy());
        let total = operations.len();

        let started = Instant::now();
        info!(%batch_id, total, limit, "batch started");
        self.sink.report(&BatchEvent::Started {
            batch_id,
            total,
            limit,
        });

        let dispatcher = Dispatcher::new(
            Arc::clone(&pool),
            Completion {
                batch_id,
                transport,
                tracker: Arc::clone(&tracker),
                cancel: cancel.clone(),
                sink: Arc::clone(&self.sink),
                operation_timeout: self.config.operation_timeout(),
            },
        );
        runtime.spawn(
            dispatcher
                .run(operations)
                .instrument(tracing::info_span!("batch", %batch_id)),
        );

        Ok(BatchHandle::new(Shared {
            batch_id,
            tracker,
            pool,
            cancel,
            sink: self.sink,
            started,
            result: OnceLock::new(),
        }))
    }
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}
