use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use ingest_common::plugin::StorageDriver;
use ingest_common::registry::{PluginConfig, PluginRegistry};
use ingest_plugins::graph::{GraphStore, HttpGraph, MemoryGraph};
use ingest_plugins::{builtin_catalog, builtin_config};
use tokio::signal::unix::SignalKind;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_worker::config::{Config, GraphBackend};
use ingest_worker::health::HealthRegistry;
use ingest_worker::kafka::{KafkaSink, KafkaSource};
use ingest_worker::metrics_utils::{serve, with_metrics};
use ingest_worker::pipeline::Pipeline;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "ingest worker"
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

/// Returns the graph twice: once for the upserters, once to be closed on shutdown.
fn connect_graph(
    config: &Config,
) -> anyhow::Result<(Arc<dyn GraphStore>, Arc<dyn StorageDriver>)> {
    fn split<G: GraphStore + 'static>(
        graph: G,
    ) -> (Arc<dyn GraphStore>, Arc<dyn StorageDriver>) {
        let graph = Arc::new(graph);
        let store: Arc<dyn GraphStore> = graph.clone();
        let driver: Arc<dyn StorageDriver> = graph;
        (store, driver)
    }

    Ok(match config.graph_backend {
        GraphBackend::Neo4j => {
            info!(url = config.graph_url, "using http graph store");
            split(HttpGraph::new(config.graph_config())?)
        }
        GraphBackend::Memory => {
            warn!("using the in-memory graph, nothing will be persisted");
            split(MemoryGraph::new())
        }
    })
}

fn load_plugins(config: &Config, graph: Arc<dyn GraphStore>) -> anyhow::Result<PluginRegistry> {
    let plugin_config = match &config.plugin_config_path {
        Some(path) => PluginConfig::from_file(Path::new(path))
            .with_context(|| format!("failed to load plugin config from {path}"))?,
        None => builtin_config(),
    };

    let registry = PluginRegistry::load(
        &plugin_config,
        Path::new(&config.plugin_base_dir),
        &builtin_catalog(graph),
    );
    info!(
        normalizers = registry.normalizer_count(),
        upserters = registry.upserter_count(),
        failures = registry.load_failures().len(),
        "plugins loaded"
    );
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting ingest worker...");

    let config = Config::init_from_env()?;
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");

    let health_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get({
                let liveness = liveness.clone();
                move || std::future::ready(liveness.get_status())
            }),
        );
    let health_router = with_metrics(health_router)?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(health_router, &bind).await {
            error!(error = %e, bind, "health server stopped");
        }
    });

    let (graph, storage) = connect_graph(&config)?;
    let registry = load_plugins(&config, graph)?;

    let sink = KafkaSink::new(
        &config.kafka,
        liveness.register("kafka_producer", Duration::from_secs(30)),
        config.shutdown_flush_timeout.0,
    )
    .context("failed to create kafka producer")?;
    let source = KafkaSource::new(
        &config.kafka,
        &config.kafka_consumer_group,
        &config.kafka_consumer_offset_reset,
        &[config.raw_topic.as_str(), config.domain_topic.as_str()],
        liveness.register("kafka_consumer", Duration::from_secs(30)),
    )
    .context("failed to create kafka consumer")?;

    let settings = config.pipeline_settings();
    let flusher_deadline = Duration::from_secs(30).max(settings.flush_interval * 3);
    let pipeline = Pipeline::start(
        settings,
        registry,
        Arc::new(source),
        Arc::new(sink),
        vec![storage],
        liveness.register("flusher", flusher_deadline),
    );

    wait_for_shutdown_signal().await?;
    pipeline.shutdown().await?;

    info!("Ingest worker shut down");
    Ok(())
}
