use std::sync::Arc;
use std::time::Duration;

use ingest_common::plugin::StorageDriver;
use ingest_common::registry::PluginRegistry;
use ingest_common::retry::RetryPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::batch::{run_flush_loop, BatchBuffer};
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::error::PipelineError;
use crate::health::HealthHandle;
use crate::inflight::InFlightTracker;
use crate::transport::{MessageSink, MessageSource};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dispatch: DispatchSettings,
    pub flush_interval: Duration,
    pub flush_retry: RetryPolicy,
}

/// The running two-stage ingestion pipeline: one dispatch loop over both topics plus the
/// periodic flush of normalized events.
pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    buffer: Arc<BatchBuffer>,
    inflight: InFlightTracker,
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn MessageSink>,
    storage: Vec<Arc<dyn StorageDriver>>,
    shutdown: CancellationToken,
    dispatch_loop: JoinHandle<()>,
    flush_loop: JoinHandle<()>,
}

impl Pipeline {
    pub fn start(
        settings: PipelineSettings,
        registry: PluginRegistry,
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn MessageSink>,
        storage: Vec<Arc<dyn StorageDriver>>,
        flusher_liveness: HealthHandle,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let inflight = InFlightTracker::new();
        let buffer = Arc::new(BatchBuffer::new(sink.clone(), settings.flush_retry));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            buffer.clone(),
            inflight.clone(),
            sink.clone(),
            settings.dispatch,
        ));

        let flush_loop = tokio::spawn(run_flush_loop(
            buffer.clone(),
            settings.flush_interval,
            flusher_liveness,
            shutdown.clone(),
        ));
        let dispatch_loop = tokio::spawn(dispatcher.clone().run(source.clone(), shutdown.clone()));
        info!("pipeline started");

        Self {
            dispatcher,
            buffer,
            inflight,
            source,
            sink,
            storage,
            shutdown,
            dispatch_loop,
            flush_loop,
        }
    }

    pub fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.buffer
    }

    pub fn inflight(&self) -> &InFlightTracker {
        &self.inflight
    }

    /// Stops the pipeline without losing accepted work.
    ///
    /// Intake stops first, then messages already being processed are allowed to settle, the
    /// buffer gets a final flush and pending storage writes are drained. Connections are closed
    /// last: source, then sink, then storage. Every step runs even if an earlier one failed;
    /// the first failure is returned.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        info!("shutting down pipeline");
        self.shutdown.cancel();

        let mut first_error: Option<PipelineError> = None;
        let mut record = |result: Result<(), PipelineError>| {
            if let Err(e) = result {
                error!(error = %e, "pipeline shutdown step failed");
                first_error.get_or_insert(e);
            }
        };

        record(self.dispatch_loop.await.map_err(PipelineError::from));
        self.dispatcher.wait_for_dispatches().await;
        record(self.flush_loop.await.map_err(PipelineError::from));

        match self.buffer.flush().await {
            Ok(count) => info!(count, "final flush complete"),
            Err(e) => record(Err(PipelineError::Flush(e))),
        }

        info!(pending = self.inflight.len(), "waiting for pending upserts");
        self.inflight.drain().await;

        record(self.source.close().await.map_err(PipelineError::from));
        record(self.sink.close().await.map_err(PipelineError::Sink));
        for driver in &self.storage {
            record(
                driver
                    .close()
                    .await
                    .map_err(|source| PipelineError::Storage {
                        name: driver.name(),
                        source,
                    }),
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("pipeline shut down cleanly");
                Ok(())
            }
        }
    }
}
