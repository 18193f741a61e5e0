use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{DomainEvent, RawMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unprocessable tool output: {0}")]
    InvalidInput(String),
    #[error("unprocessable domain event: {0}")]
    InvalidEvent(String),
    #[error("{backend} storage request failed: {source}")]
    Storage {
        backend: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("plugin failed to initialize: {0}")]
    Init(String),
}

impl PluginError {
    pub fn storage(backend: &'static str, source: impl Into<BoxError>) -> Self {
        PluginError::Storage {
            backend,
            source: source.into(),
        }
    }
}

/// Turns the output of one tool into canonical domain events.
///
/// Normalizers run inline on the dispatch path and must not perform I/O. Returning `Ok(None)`
/// or an empty list means the input does not apply and is dropped without error.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &RawMessage) -> Result<Option<Vec<DomainEvent>>, PluginError>;
}

impl<F> Normalizer for F
where
    F: Fn(&RawMessage) -> Result<Option<Vec<DomainEvent>>, PluginError> + Send + Sync,
{
    fn normalize(&self, raw: &RawMessage) -> Result<Option<Vec<DomainEvent>>, PluginError> {
        self(raw)
    }
}

/// Persists one kind of domain event.
///
/// Upserts must be idempotent: the event fingerprint is the merge key, so replaying an event
/// leaves storage unchanged.
#[async_trait]
pub trait Upserter: Send + Sync {
    /// Storage backend label used in metrics.
    fn backend(&self) -> &'static str;

    async fn upsert(&self, event: &DomainEvent) -> Result<(), PluginError>;
}

/// A storage connection shared by upserters, closed last during shutdown.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn close(&self) -> Result<(), PluginError>;
}
