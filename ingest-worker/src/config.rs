use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use ingest_common::retry::RetryPolicy;
use ingest_plugins::graph::HttpGraphConfig;
use thiserror::Error;

use crate::dispatch::{DispatchSettings, Topics};
pub use crate::kafka::KafkaConfig;
use crate::pipeline::PipelineSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "ingest-worker")]
    pub kafka_consumer_group: String,

    // earliest, latest
    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(from = "RAW_TOPIC", default = "tool_output_raw")]
    pub raw_topic: String,

    #[envconfig(from = "DOMAIN_TOPIC", default = "domain_events")]
    pub domain_topic: String,

    #[envconfig(from = "DEAD_LETTER_TOPIC", default = "ingest_dead_letter")]
    pub dead_letter_topic: String,

    #[envconfig(from = "FLUSH_INTERVAL_MS", default = "1000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(from = "FLUSH_RETRIES", default = "3")]
    pub flush_retries: u32,

    #[envconfig(from = "FLUSH_RETRY_BASE_DELAY_MS", default = "200")]
    pub flush_retry_base_delay: EnvMsDuration,

    #[envconfig(from = "DISPATCH_RETRIES", default = "2")]
    pub dispatch_retries: u32,

    #[envconfig(from = "DISPATCH_RETRY_BASE_DELAY_MS", default = "200")]
    pub dispatch_retry_base_delay: EnvMsDuration,

    #[envconfig(from = "MAX_CONCURRENT_DISPATCHES", default = "1024")]
    pub max_concurrent_dispatches: usize,

    #[envconfig(from = "DEAD_LETTER_TERMINAL_ERRORS", default = "false")]
    pub dead_letter_terminal_errors: bool,

    // Plugin mapping file, the built-in mapping is used when unset
    #[envconfig(from = "PLUGIN_CONFIG_PATH")]
    pub plugin_config_path: Option<String>,

    #[envconfig(from = "PLUGIN_BASE_DIR", default = "/plugins")]
    pub plugin_base_dir: String,

    #[envconfig(from = "GRAPH_BACKEND", default = "neo4j")]
    pub graph_backend: GraphBackend,

    #[envconfig(from = "GRAPH_URL", default = "http://localhost:7474")]
    pub graph_url: String,

    #[envconfig(from = "GRAPH_DATABASE", default = "neo4j")]
    pub graph_database: String,

    #[envconfig(from = "GRAPH_USER", default = "neo4j")]
    pub graph_user: String,

    #[envconfig(from = "GRAPH_PASSWORD")]
    pub graph_password: Option<String>,

    #[envconfig(from = "GRAPH_REQUEST_TIMEOUT_MS", default = "10000")]
    pub graph_request_timeout: EnvMsDuration,

    #[envconfig(from = "SHUTDOWN_FLUSH_TIMEOUT_MS", default = "30000")]
    pub shutdown_flush_timeout: EnvMsDuration,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("topic {0} is configured for more than one role")]
    DuplicateTopic(String),
    #[error("MAX_CONCURRENT_DISPATCHES must be at least 1")]
    NoDispatchCapacity,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let topics = [&self.raw_topic, &self.domain_topic, &self.dead_letter_topic];
        for (i, topic) in topics.iter().enumerate() {
            if topics[i + 1..].contains(topic) {
                return Err(ConfigError::DuplicateTopic(topic.to_string()));
            }
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(ConfigError::NoDispatchCapacity);
        }
        let durations = [
            ("FLUSH_INTERVAL_MS", self.flush_interval),
            ("GRAPH_REQUEST_TIMEOUT_MS", self.graph_request_timeout),
            ("SHUTDOWN_FLUSH_TIMEOUT_MS", self.shutdown_flush_timeout),
        ];
        for (name, duration) in durations {
            if duration.0.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics {
            raw: self.raw_topic.clone(),
            domain: self.domain_topic.clone(),
            dead_letter: self.dead_letter_topic.clone(),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            dispatch: DispatchSettings {
                topics: self.topics(),
                retry: RetryPolicy::new(self.dispatch_retries, self.dispatch_retry_base_delay.0),
                dead_letter_terminal_errors: self.dead_letter_terminal_errors,
                max_concurrent: self.max_concurrent_dispatches,
            },
            flush_interval: self.flush_interval.0,
            flush_retry: RetryPolicy::new(self.flush_retries, self.flush_retry_base_delay.0),
        }
    }

    pub fn graph_config(&self) -> HttpGraphConfig {
        HttpGraphConfig {
            url: self.graph_url.clone(),
            database: self.graph_database.clone(),
            user: self.graph_user.clone(),
            password: self.graph_password.clone(),
            request_timeout: self.graph_request_timeout.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphBackend {
    /// Neo4j over its transactional HTTP API
    Neo4j,
    /// Process-local graph, for development and tests
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownGraphBackendError;

impl FromStr for GraphBackend {
    type Err = UnknownGraphBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "neo4j" => Ok(GraphBackend::Neo4j),
            "memory" => Ok(GraphBackend::Memory),
            _ => Err(UnknownGraphBackendError),
        }
    }
}
