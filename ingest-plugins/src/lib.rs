use std::sync::Arc;

use ingest_common::registry::{PluginCatalog, PluginConfig};

use crate::graph::GraphStore;
use crate::sensor::{SensorReadingUpserter, SensorReportNormalizer};

pub mod graph;
pub mod sensor;

pub const SENSOR_REPORT_NORMALIZER_PATH: &str = "normalizers/sensor_report";
pub const SENSOR_READING_UPSERTER_PATH: &str = "upserters/sensor_reading";

/// Catalog of the plugins compiled into this build, wired to the given graph connection.
pub fn builtin_catalog(graph: Arc<dyn GraphStore>) -> PluginCatalog {
    let mut catalog = PluginCatalog::new();
    catalog
        .register_normalizer(SENSOR_REPORT_NORMALIZER_PATH, || {
            Ok(Arc::new(SensorReportNormalizer))
        })
        .register_upserter(SENSOR_READING_UPSERTER_PATH, move || {
            Ok(Arc::new(SensorReadingUpserter::new(graph.clone())))
        });
    catalog
}

/// Plugin map used when no plugin config file is supplied.
pub fn builtin_config() -> PluginConfig {
    let mut config = PluginConfig::default();
    config.normalizers.insert(
        sensor::SENSOR_REPORT_TOOL.to_owned(),
        SENSOR_REPORT_NORMALIZER_PATH.to_owned(),
    );
    config.upserters.insert(
        sensor::SENSOR_READING_EVENT.to_owned(),
        SENSOR_READING_UPSERTER_PATH.to_owned(),
    );
    config
}
