use std::sync::Arc;

use async_trait::async_trait;
use ingest_common::envelope::{DomainEvent, RawMessage};
use ingest_common::fingerprint::fingerprint;
use ingest_common::plugin::{Normalizer, PluginError, Upserter};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::graph::{GraphStore, Reading, Sensor};

pub const SENSOR_REPORT_TOOL: &str = "sensor_report";
pub const SENSOR_READING_EVENT: &str = "SENSOR_READING";

const UNKNOWN_LOCATION: &str = "unknown";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorReport {
    sensor_id: String,
    value: Number,
    unit: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

pub fn sensor_type_for_unit(unit: &str) -> &'static str {
    match unit.to_ascii_lowercase().as_str() {
        "celsius" | "fahrenheit" | "kelvin" | "c" | "f" | "k" => "temperature",
        "percent" | "%" | "rh" => "humidity",
        "hpa" | "pa" | "kpa" | "bar" | "mbar" => "pressure",
        "lux" | "lx" => "light",
        _ => "generic",
    }
}

/// Normalizes `sensor_report` tool output into `SENSOR_READING` events.
pub struct SensorReportNormalizer;

impl Normalizer for SensorReportNormalizer {
    fn normalize(&self, raw: &RawMessage) -> Result<Option<Vec<DomainEvent>>, PluginError> {
        let report: SensorReport = match serde_json::from_value(raw.data.clone()) {
            Ok(report) => report,
            Err(e) => {
                debug!(run_id = raw.run_id, error = %e, "dropping unprocessable sensor report");
                return Ok(None);
            }
        };

        if report.sensor_id.trim().is_empty() || report.unit.trim().is_empty() {
            debug!(run_id = raw.run_id, "dropping sensor report without sensor id or unit");
            return Ok(None);
        }

        let location = report
            .location
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_owned());
        let sensor_type = sensor_type_for_unit(&report.unit);

        let fingerprint = fingerprint([
            ("type", Value::from(SENSOR_READING_EVENT)),
            ("sensor", Value::from(report.sensor_id.as_str())),
            ("location", Value::from(location.as_str())),
            ("value", Value::Number(report.value.clone())),
            ("unit", Value::from(report.unit.as_str())),
        ]);

        let mut event = DomainEvent::new(SENSOR_READING_EVENT, fingerprint)
            .with_meta("runId", raw.run_id.as_str())
            .with_meta("sensorId", report.sensor_id)
            .with_meta("sensorType", sensor_type)
            .with_meta("value", Value::Number(report.value))
            .with_meta("unit", report.unit)
            .with_meta("location", location);
        if let Some(timestamp) = report.timestamp {
            event = event.with_meta("timestamp", timestamp);
        }

        Ok(Some(vec![event]))
    }
}

/// Merges `SENSOR_READING` events into the graph as a Sensor node and a linked Reading node.
pub struct SensorReadingUpserter {
    graph: Arc<dyn GraphStore>,
}

impl SensorReadingUpserter {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Upserter for SensorReadingUpserter {
    fn backend(&self) -> &'static str {
        "graph"
    }

    async fn upsert(&self, event: &DomainEvent) -> Result<(), PluginError> {
        let meta = &event.meta;
        let sensor = Sensor {
            id: meta_str(meta, "sensorId")?.to_owned(),
            sensor_type: meta_str(meta, "sensorType")?.to_owned(),
            location: meta_str(meta, "location")?.to_owned(),
        };
        let reading = Reading {
            fingerprint: event.fingerprint().to_owned(),
            sensor_id: sensor.id.clone(),
            value: meta
                .get("value")
                .and_then(Value::as_f64)
                .ok_or_else(|| missing("value"))?,
            unit: meta_str(meta, "unit")?.to_owned(),
            run_id: meta_str(meta, "runId")?.to_owned(),
            observed_at: meta
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };

        let sensor_outcome = self.graph.merge_sensor(&sensor).await?;
        let reading_outcome = self.graph.merge_reading(&reading).await?;
        debug!(
            sensor = sensor.id,
            fingerprint = reading.fingerprint,
            ?sensor_outcome,
            ?reading_outcome,
            "upserted sensor reading"
        );
        Ok(())
    }
}

fn meta_str<'a>(meta: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, PluginError> {
    meta.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing(key))
}

fn missing(key: &str) -> PluginError {
    PluginError::InvalidEvent(format!("meta.{key} is missing or has the wrong type"))
}
