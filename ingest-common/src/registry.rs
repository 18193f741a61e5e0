//! Name-to-handler registries for normalizers and upserters.
//!
//! Plugins are compiled in and advertised through a [`PluginCatalog`], keyed by a path relative
//! to a plugin root. The deployment's [`PluginConfig`] maps logical names (tool names, event
//! types) onto those paths, and [`PluginRegistry::load`] resolves each entry independently: an
//! entry that escapes the plugin root, is unknown, or fails to initialize is logged and skipped
//! so the remaining message types keep flowing.
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::plugin::{Normalizer, PluginError, Upserter};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read plugin config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid plugin config: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("plugin path {path} resolves outside of {base}")]
    OutsideBase { path: String, base: PathBuf },
    #[error("no plugin is available at {0}")]
    NotFound(String),
    #[error("plugin at {path} failed to load: {source}")]
    Load {
        path: String,
        #[source]
        source: PluginError,
    },
}

/// Which plugin serves which tool / event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Tool name to plugin path.
    #[serde(default)]
    pub normalizers: BTreeMap<String, String>,
    /// Event type to plugin path.
    #[serde(default)]
    pub upserters: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, RegistryError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(RegistryError::ConfigParse(serde::de::Error::custom(
                "plugin config must be a JSON object",
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let bytes = std::fs::read(path).map_err(|source| RegistryError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&bytes)
    }
}

pub type NormalizerFactory =
    Box<dyn Fn() -> Result<Arc<dyn Normalizer>, PluginError> + Send + Sync>;
pub type UpserterFactory = Box<dyn Fn() -> Result<Arc<dyn Upserter>, PluginError> + Send + Sync>;

/// Every plugin this build knows how to construct, keyed by plugin path.
#[derive(Default)]
pub struct PluginCatalog {
    normalizers: HashMap<String, NormalizerFactory>,
    upserters: HashMap<String, UpserterFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_normalizer<F>(&mut self, path: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Normalizer>, PluginError> + Send + Sync + 'static,
    {
        self.normalizers.insert(path.to_owned(), Box::new(factory));
        self
    }

    pub fn register_upserter<F>(&mut self, path: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn Upserter>, PluginError> + Send + Sync + 'static,
    {
        self.upserters.insert(path.to_owned(), Box::new(factory));
        self
    }

    fn load_normalizer(&self, path: &str) -> Result<Arc<dyn Normalizer>, RegistryError> {
        let factory = self
            .normalizers
            .get(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_owned()))?;
        factory().map_err(|source| RegistryError::Load {
            path: path.to_owned(),
            source,
        })
    }

    fn load_upserter(&self, path: &str) -> Result<Arc<dyn Upserter>, RegistryError> {
        let factory = self
            .upserters
            .get(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_owned()))?;
        factory().map_err(|source| RegistryError::Load {
            path: path.to_owned(),
            source,
        })
    }
}

#[derive(Debug)]
pub struct LoadFailure {
    pub key: String,
    pub error: RegistryError,
}

/// Loaded handlers. Built once at startup and read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
    upserters: HashMap<String, Arc<dyn Upserter>>,
    failures: Vec<LoadFailure>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every configured entry against the catalog. Never fails as a whole; entries
    /// that could not be loaded are reported by [`PluginRegistry::load_failures`].
    pub fn load(config: &PluginConfig, base_dir: &Path, catalog: &PluginCatalog) -> Self {
        let mut registry = Self::new();

        for (tool, path) in &config.normalizers {
            match resolve_plugin_path(base_dir, path).and_then(|p| catalog.load_normalizer(&p)) {
                Ok(normalizer) => registry.register_normalizer(tool, normalizer),
                Err(error) => {
                    warn!(tool, path, error = %error, "skipping normalizer that failed to load");
                    registry.failures.push(LoadFailure {
                        key: tool.clone(),
                        error,
                    });
                }
            }
        }

        for (event_type, path) in &config.upserters {
            match resolve_plugin_path(base_dir, path).and_then(|p| catalog.load_upserter(&p)) {
                Ok(upserter) => registry.register_upserter(event_type, upserter),
                Err(error) => {
                    warn!(event_type, path, error = %error, "skipping upserter that failed to load");
                    registry.failures.push(LoadFailure {
                        key: event_type.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            normalizers = registry.normalizers.len(),
            upserters = registry.upserters.len(),
            failures = registry.failures.len(),
            "plugin registry loaded"
        );
        registry
    }

    pub fn register_normalizer(&mut self, tool: &str, normalizer: Arc<dyn Normalizer>) {
        info!(tool, "registered normalizer");
        self.normalizers.insert(tool.to_owned(), normalizer);
    }

    pub fn register_upserter(&mut self, event_type: &str, upserter: Arc<dyn Upserter>) {
        info!(event_type, backend = upserter.backend(), "registered upserter");
        self.upserters.insert(event_type.to_owned(), upserter);
    }

    pub fn normalizer(&self, tool: &str) -> Option<&Arc<dyn Normalizer>> {
        self.normalizers.get(tool)
    }

    pub fn upserter(&self, event_type: &str) -> Option<&Arc<dyn Upserter>> {
        self.upserters.get(event_type)
    }

    pub fn normalizer_count(&self) -> usize {
        self.normalizers.len()
    }

    pub fn upserter_count(&self) -> usize {
        self.upserters.len()
    }

    pub fn load_failures(&self) -> &[LoadFailure] {
        &self.failures
    }
}

/// Drops every character outside `[A-Za-z0-9/_-]`.
pub fn sanitize_plugin_path(path: &str) -> String {
    path.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-'))
        .collect()
}

/// Sanitizes `path`, resolves it under `base_dir` and returns the catalog key, i.e. the
/// `/`-separated path relative to `base_dir`.
pub fn resolve_plugin_path(base_dir: &Path, path: &str) -> Result<String, RegistryError> {
    let sanitized = sanitize_plugin_path(path);
    let base = normalize_lexically(base_dir);
    let resolved = normalize_lexically(&base.join(&sanitized));

    let relative = resolved
        .strip_prefix(&base)
        .map_err(|_| RegistryError::OutsideBase {
            path: path.to_owned(),
            base: base.clone(),
        })?;

    let key = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    if key.is_empty() {
        return Err(RegistryError::NotFound(sanitized));
    }
    Ok(key)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DomainEvent, RawMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Clone, Default)]
    struct WarningCount(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarningCount {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct NoopUpserter;

    #[async_trait]
    impl Upserter for NoopUpserter {
        fn backend(&self) -> &'static str {
            "noop"
        }

        async fn upsert(&self, _event: &DomainEvent) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn drop_everything(_raw: &RawMessage) -> Result<Option<Vec<DomainEvent>>, PluginError> {
        Ok(None)
    }

    fn catalog() -> PluginCatalog {
        let mut catalog = PluginCatalog::new();
        catalog
            .register_normalizer("normalizers/alpha", || Ok(Arc::new(drop_everything)))
            .register_normalizer("normalizers/beta", || {
                Err(PluginError::Init("schema file missing".to_owned()))
            })
            .register_normalizer("normalizers/gamma", || Ok(Arc::new(drop_everything)))
            .register_upserter("upserters/noop", || Ok(Arc::new(NoopUpserter)));
        catalog
    }

    fn config(normalizers: &[(&str, &str)], upserters: &[(&str, &str)]) -> PluginConfig {
        PluginConfig {
            normalizers: normalizers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            upserters: upserters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_failing_plugin_does_not_prevent_others_from_loading() {
        let config = config(
            &[
                ("alpha", "normalizers/alpha"),
                ("beta", "normalizers/beta"),
                ("gamma", "normalizers/gamma"),
            ],
            &[],
        );

        let warnings = WarningCount::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());
        let registry = tracing::subscriber::with_default(subscriber, || {
            PluginRegistry::load(&config, Path::new("/plugins"), &catalog())
        });

        assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
        assert_eq!(registry.normalizer_count(), 2);
        assert!(registry.normalizer("alpha").is_some());
        assert!(registry.normalizer("beta").is_none());
        assert!(registry.normalizer("gamma").is_some());

        let failures = registry.load_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "beta");
        assert!(matches!(failures[0].error, RegistryError::Load { .. }));
    }

    #[test]
    fn test_loads_upserters_by_event_type() {
        let config = config(&[], &[("SENSOR_READING", "upserters/noop")]);

        let registry = PluginRegistry::load(&config, Path::new("/plugins"), &catalog());

        assert_eq!(registry.upserter_count(), 1);
        assert_eq!(
            registry.upserter("SENSOR_READING").map(|u| u.backend()),
            Some("noop")
        );
        assert!(registry.upserter("OTHER").is_none());
    }

    #[test]
    fn test_unknown_plugin_path_is_skipped() {
        let config = config(&[("alpha", "normalizers/missing")], &[]);

        let registry = PluginRegistry::load(&config, Path::new("/plugins"), &catalog());

        assert_eq!(registry.normalizer_count(), 0);
        assert!(matches!(
            registry.load_failures()[0].error,
            RegistryError::NotFound(_)
        ));
    }

    #[test]
    fn test_sanitize_strips_disallowed_characters() {
        assert_eq!(
            sanitize_plugin_path("normalizers/sensor_report.js"),
            "normalizers/sensor_reportjs"
        );
        assert_eq!(sanitize_plugin_path("a b;c$(d)"), "abcd");
        assert_eq!(sanitize_plugin_path("../../etc/passwd"), "//etc/passwd");
    }

    #[test]
    fn test_resolve_within_base() {
        let base = Path::new("/plugins");

        assert_eq!(
            resolve_plugin_path(base, "normalizers/sensor_report").unwrap(),
            "normalizers/sensor_report"
        );
        assert_eq!(
            resolve_plugin_path(base, "normalizers//sensor_report").unwrap(),
            "normalizers/sensor_report"
        );
        // Dots are stripped before resolution, so parent references cannot survive.
        assert_eq!(
            resolve_plugin_path(base, "normalizers/../sensor_report").unwrap(),
            "normalizers/sensor_report"
        );
    }

    #[test]
    fn test_resolve_rejects_paths_escaping_base() {
        let base = Path::new("/plugins");

        assert!(matches!(
            resolve_plugin_path(base, "../../etc/passwd"),
            Err(RegistryError::OutsideBase { .. })
        ));
        assert!(matches!(
            resolve_plugin_path(base, "/etc/passwd"),
            Err(RegistryError::OutsideBase { .. })
        ));
        assert!(matches!(
            resolve_plugin_path(base, "/pluginsevil/x"),
            Err(RegistryError::OutsideBase { .. })
        ));
    }

    #[test]
    fn test_escaping_entry_is_skipped() {
        let config = config(
            &[
                ("alpha", "normalizers/alpha"),
                ("evil", "/normalizers/alpha"),
            ],
            &[],
        );

        let registry = PluginRegistry::load(&config, Path::new("/plugins"), &catalog());

        assert_eq!(registry.normalizer_count(), 1);
        assert!(matches!(
            registry.load_failures()[0].error,
            RegistryError::OutsideBase { .. }
        ));
    }

    #[test]
    fn test_resolve_rejects_base_itself() {
        assert!(matches!(
            resolve_plugin_path(Path::new("/plugins"), "..."),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_plugin_config_from_json() {
        let config = PluginConfig::from_json(
            br#"{"normalizers": {"sensor_report": "normalizers/sensor_report"}}"#,
        )
        .unwrap();

        assert_eq!(
            config.normalizers.get("sensor_report").map(String::as_str),
            Some("normalizers/sensor_report")
        );
        assert!(config.upserters.is_empty());

        assert!(matches!(
            PluginConfig::from_json(b"[]"),
            Err(RegistryError::ConfigParse(_))
        ));
    }
}
