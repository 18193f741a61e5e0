//! Wire envelopes for the raw and domain topics.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Format marker stamped on every domain event produced by this pipeline.
pub const SPEC_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("payload does not match the envelope schema: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("field `{0}` must be a non-empty string")]
    EmptyField(&'static str),
}

/// Unvalidated tool output, as published by external producers on the raw topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    /// Selects the normalizer.
    pub tool: String,
    /// Correlation id of the tool run that produced this output.
    pub run_id: String,
    /// Tool-specific payload, only interpreted by the normalizer.
    pub data: Value,
}

impl RawMessage {
    /// Parses and validates a raw-topic payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let message: RawMessage = parse(payload)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        require_non_empty("tool", &self.tool)?;
        require_non_empty("runId", &self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Selects the upserter.
    pub event_type: String,
    /// Content hash, used as the message key and as the storage merge key.
    pub fingerprint: String,
}

/// The canonical event representation carried on the domain topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "specVersion")]
    pub spec_version: String,
    pub event: EventHeader,
    /// Type-specific payload.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_owned(),
            event: EventHeader {
                event_type: event_type.into(),
                fingerprint: fingerprint.into(),
            },
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Parses and validates a domain-topic payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let event: DomainEvent = parse(payload)?;
        event.validate()?;
        Ok(event)
    }

    /// `specVersion` is carried through as-is; only the routing fields must be present.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        require_non_empty("event.event_type", &self.event.event_type)?;
        require_non_empty("event.fingerprint", &self.event.fingerprint)
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn fingerprint(&self) -> &str {
        &self.event.fingerprint
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Schema)
    }
}

// Syntax errors and shape errors are reported separately so they can be told apart in metrics.
fn parse<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, EnvelopeError> {
    let value: Value = serde_json::from_slice(payload).map_err(EnvelopeError::Json)?;
    if !value.is_object() {
        return Err(EnvelopeError::Schema(serde::de::Error::custom(
            "expected a JSON object",
        )));
    }
    serde_json::from_value(value).map_err(EnvelopeError::Schema)
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        return Err(EnvelopeError::EmptyField(field));
    }
    Ok(())
}
