//! Graph storage for sensor data.
//!
//! Both drivers merge on identity keys (sensor id, reading fingerprint), so replaying the same
//! domain event never creates a second node.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ingest_common::plugin::{PluginError, StorageDriver};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

const BACKEND: &str = "graph";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: String,
    pub sensor_type: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub fingerprint: String,
    pub sensor_id: String,
    pub value: f64,
    pub unit: String,
    pub run_id: String,
    pub observed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Matched,
}

#[async_trait]
pub trait GraphStore: StorageDriver {
    async fn merge_sensor(&self, sensor: &Sensor) -> Result<MergeOutcome, PluginError>;

    /// Merges the reading and links it to its sensor, which must already exist.
    async fn merge_reading(&self, reading: &Reading) -> Result<MergeOutcome, PluginError>;
}

#[derive(Default)]
struct GraphState {
    sensors: HashMap<String, Sensor>,
    readings: HashMap<String, Reading>,
    sensor_creations: usize,
    reading_creations: usize,
}

/// Process-local graph, for tests and for running without a database.
#[derive(Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    closed: AtomicBool,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), PluginError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PluginError::storage(BACKEND, "connection is closed"));
        }
        Ok(())
    }

    pub fn sensor(&self, id: &str) -> Option<Sensor> {
        self.state().sensors.get(id).cloned()
    }

    pub fn reading(&self, fingerprint: &str) -> Option<Reading> {
        self.state().readings.get(fingerprint).cloned()
    }

    pub fn sensor_count(&self) -> usize {
        self.state().sensors.len()
    }

    pub fn reading_count(&self) -> usize {
        self.state().readings.len()
    }

    /// How many times a sensor node was created rather than matched.
    pub fn sensor_creations(&self) -> usize {
        self.state().sensor_creations
    }

    pub fn reading_creations(&self) -> usize {
        self.state().reading_creations
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageDriver for MemoryGraph {
    fn name(&self) -> &'static str {
        "memory-graph"
    }

    async fn close(&self) -> Result<(), PluginError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn merge_sensor(&self, sensor: &Sensor) -> Result<MergeOutcome, PluginError> {
        self.ensure_open()?;
        let mut state = self.state();
        let outcome = match state.sensors.insert(sensor.id.clone(), sensor.clone()) {
            Some(_) => MergeOutcome::Matched,
            None => {
                state.sensor_creations += 1;
                MergeOutcome::Created
            }
        };
        Ok(outcome)
    }

    async fn merge_reading(&self, reading: &Reading) -> Result<MergeOutcome, PluginError> {
        self.ensure_open()?;
        let mut state = self.state();
        if !state.sensors.contains_key(&reading.sensor_id) {
            return Err(PluginError::InvalidEvent(format!(
                "sensor {} does not exist",
                reading.sensor_id
            )));
        }
        if state.readings.contains_key(&reading.fingerprint) {
            return Ok(MergeOutcome::Matched);
        }
        state
            .readings
            .insert(reading.fingerprint.clone(), reading.clone());
        state.reading_creations += 1;
        Ok(MergeOutcome::Created)
    }
}

const MERGE_SENSOR: &str = "\
OPTIONAL MATCH (existing:Sensor {id: $id}) \
WITH existing IS NULL AS created \
MERGE (s:Sensor {id: $id}) \
SET s.sensorType = $sensorType, s.location = $location \
RETURN created";

const MERGE_READING: &str = "\
MATCH (s:Sensor {id: $sensorId}) \
OPTIONAL MATCH (existing:Reading {fingerprint: $fingerprint}) \
WITH s, existing IS NULL AS created \
MERGE (r:Reading {fingerprint: $fingerprint}) \
ON CREATE SET r.value = $value, r.unit = $unit, r.runId = $runId, r.observedAt = $observedAt \
MERGE (s)-[:REPORTED]->(r) \
RETURN created";

pub struct HttpGraphConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

/// Talks to a graph database through its transactional HTTP endpoint, one auto-committed
/// transaction per statement.
pub struct HttpGraph {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: Option<String>,
    closed: AtomicBool,
}

impl HttpGraph {
    pub fn new(config: HttpGraphConfig) -> Result<Self, PluginError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent("ingest-worker")
            .build()
            .map_err(|e| PluginError::storage(BACKEND, e))?;

        Ok(Self {
            client,
            endpoint: commit_endpoint(&config.url, &config.database),
            user: config.user,
            password: config.password,
            closed: AtomicBool::new(false),
        })
    }

    async fn run(&self, statement: &str, parameters: Value) -> Result<Value, PluginError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PluginError::storage(BACKEND, "connection is closed"));
        }

        let body = json!({
            "statements": [{"statement": statement, "parameters": parameters}]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, self.password.as_ref())
            .json(&body)
            .send()
            .await
            .map_err(|e| PluginError::storage(BACKEND, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PluginError::storage(
                BACKEND,
                format!("graph responded with {status}: {text}"),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| PluginError::storage(BACKEND, e))
    }
}

#[async_trait]
impl StorageDriver for HttpGraph {
    fn name(&self) -> &'static str {
        "http-graph"
    }

    async fn close(&self) -> Result<(), PluginError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl GraphStore for HttpGraph {
    async fn merge_sensor(&self, sensor: &Sensor) -> Result<MergeOutcome, PluginError> {
        let parameters = serde_json::to_value(sensor).map_err(|e| PluginError::storage(BACKEND, e))?;
        let response = self.run(MERGE_SENSOR, parameters).await?;
        let outcome = merge_outcome(&response)?;
        debug!(sensor = sensor.id, ?outcome, "merged sensor");
        Ok(outcome)
    }

    async fn merge_reading(&self, reading: &Reading) -> Result<MergeOutcome, PluginError> {
        let parameters =
            serde_json::to_value(reading).map_err(|e| PluginError::storage(BACKEND, e))?;
        let response = self.run(MERGE_READING, parameters).await?;
        let outcome = merge_outcome(&response)?;
        debug!(fingerprint = reading.fingerprint, ?outcome, "merged reading");
        Ok(outcome)
    }
}

fn commit_endpoint(url: &str, database: &str) -> String {
    format!("{}/db/{}/tx/commit", url.trim_end_matches('/'), database)
}

// Reads the `created` column of the first row, surfacing statement errors reported in-band.
fn merge_outcome(response: &Value) -> Result<MergeOutcome, PluginError> {
    if let Some(error) = response["errors"].as_array().and_then(|e| e.first()) {
        return Err(PluginError::storage(
            BACKEND,
            format!(
                "{}: {}",
                error["code"].as_str().unwrap_or("unknown"),
                error["message"].as_str().unwrap_or_default()
            ),
        ));
    }

    match response["results"][0]["data"][0]["row"][0].as_bool() {
        Some(true) => Ok(MergeOutcome::Created),
        Some(false) => Ok(MergeOutcome::Matched),
        // MATCH on a missing sensor yields no rows
        None => Err(PluginError::InvalidEvent(
            "merge statement returned no rows".to_owned(),
        )),
    }
}
