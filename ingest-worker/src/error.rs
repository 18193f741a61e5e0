use ingest_common::envelope::EnvelopeError;
use ingest_common::plugin::PluginError;
use thiserror::Error;

use crate::transport::{SinkError, SourceError};

/// Failure of one dispatch attempt for one consumed message.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("normalizer for tool {tool} failed: {source}")]
    Normalizer {
        tool: String,
        #[source]
        source: PluginError,
    },
    #[error("normalizer for tool {tool} produced an invalid event: {source}")]
    InvalidEvent {
        tool: String,
        #[source]
        source: EnvelopeError,
    },
    #[error("upserter for event type {event_type} failed: {source}")]
    Upserter {
        event_type: String,
        #[source]
        source: PluginError,
    },
}

impl DispatchError {
    /// Label for the processing error counter.
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::Envelope(EnvelopeError::Json(_)) => "parse",
            DispatchError::Envelope(_) => "schema",
            DispatchError::Normalizer { .. } => "normalizer",
            DispatchError::InvalidEvent { .. } => "invalid_event",
            DispatchError::Upserter { .. } => "upserter",
        }
    }

    /// Whether another attempt could succeed. Malformed payloads and events never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Normalizer { .. } | DispatchError::Upserter { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("final flush failed: {0}")]
    Flush(#[source] SinkError),
    #[error("failed to close message source: {0}")]
    Source(#[from] SourceError),
    #[error("failed to close message sink: {0}")]
    Sink(#[source] SinkError),
    #[error("failed to close storage driver {name}: {source}")]
    Storage {
        name: &'static str,
        #[source]
        source: PluginError,
    },
}
