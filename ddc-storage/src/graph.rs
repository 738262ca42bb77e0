//! Backend graph built from TOML configuration.
//!
//! ```toml
//! root = "Hierarchy"
//!
//! [runtime]
//! worker_count = 4
//!
//! [[nodes]]
//! name = "Boot"
//! type = "memory"
//! max_cache_size_mb = 256
//! snapshot = "/var/cache/ddc/boot.ddc"
//!
//! [[nodes]]
//! name = "Local"
//! type = "lmdb"
//! path = "/var/cache/ddc/local"
//!
//! [[nodes]]
//! name = "Hierarchy"
//! type = "hierarchical"
//! tiers = ["Boot", "Local"]
//! ```
//!
//! Only nodes reachable from `root` are built.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ddc_core::{
    AsyncPutConfig, ConfigError, DdcError, DdcResult, MemoryCacheConfig, RuntimeConfig,
    SpeedClass, DEFAULT_MAX_ENTRY_AGE,
};
use serde::Deserialize;

use crate::async_put::AsyncPutBackend;
use crate::backend::CacheBackend;
use crate::hierarchical::HierarchicalBackend;
use crate::lmdb_backend::LmdbCacheBackend;
use crate::memory::MemoryCacheBackend;
use crate::runtime::CacheRuntime;

const DEFAULT_LMDB_SIZE_MB: usize = 1024;

fn default_lmdb_size() -> usize {
    DEFAULT_LMDB_SIZE_MB
}

fn default_max_entry_age() -> u32 {
    DEFAULT_MAX_ENTRY_AGE
}

/// Top-level graph configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    pub root: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Write-behind settings for hierarchy tiers and `async_put` nodes.
    #[serde(default)]
    pub async_put: AsyncPutConfig,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Memory {
        #[serde(default)]
        max_cache_size_mb: Option<u64>,
        #[serde(default)]
        allow_disable: bool,
        #[serde(default = "default_max_entry_age")]
        max_entry_age: u32,
        #[serde(default)]
        snapshot: Option<PathBuf>,
        #[serde(default)]
        speed_class: SpeedClass,
    },
    Lmdb {
        path: PathBuf,
        #[serde(default = "default_lmdb_size")]
        max_size_mb: usize,
        #[serde(default)]
        read_only: bool,
    },
    Hierarchical {
        tiers: Vec<String>,
    },
    AsyncPut {
        inner: String,
        #[serde(default)]
        cache_in_flight_puts: Option<bool>,
    },
}

impl GraphConfig {
    pub fn from_toml_str(source: &str) -> DdcResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check names, references and cycles without building anything.
    pub fn validate(&self) -> DdcResult<()> {
        self.runtime.validate()?;
        self.async_put.validate()?;

        let mut by_name: HashMap<&str, &NodeConfig> = HashMap::new();
        for node in &self.nodes {
            if by_name.insert(node.name.as_str(), node).is_some() {
                return Err(ConfigError::DuplicateNode {
                    name: node.name.clone(),
                }
                .into());
            }
        }
        let mut stack = Vec::new();
        check_acyclic(&self.root, &by_name, &mut stack)
    }
}

fn node_children(kind: &NodeKind) -> Vec<&str> {
    match kind {
        NodeKind::Hierarchical { tiers } => tiers.iter().map(String::as_str).collect(),
        NodeKind::AsyncPut { inner, .. } => vec![inner.as_str()],
        NodeKind::Memory { .. } | NodeKind::Lmdb { .. } => Vec::new(),
    }
}

fn check_acyclic(
    name: &str,
    by_name: &HashMap<&str, &NodeConfig>,
    stack: &mut Vec<String>,
) -> DdcResult<()> {
    if stack.iter().any(|n| n == name) {
        let mut path = stack.clone();
        path.push(name.to_string());
        return Err(ConfigError::CycleDetected { path }.into());
    }
    let node = by_name.get(name).ok_or_else(|| ConfigError::UnknownNode {
        name: name.to_string(),
    })?;
    stack.push(name.to_string());
    for child in node_children(&node.kind) {
        check_acyclic(child, by_name, stack)?;
    }
    stack.pop();
    Ok(())
}

// ============================================================================
// GRAPH
// ============================================================================

/// A built backend graph.
pub struct CacheGraph {
    root: Arc<dyn CacheBackend>,
    nodes: HashMap<String, Arc<dyn CacheBackend>>,
    memory: HashMap<String, (Arc<MemoryCacheBackend>, Option<PathBuf>)>,
    runtime: Arc<CacheRuntime>,
}

struct GraphBuilder<'a> {
    configs: HashMap<&'a str, &'a NodeConfig>,
    async_put: &'a AsyncPutConfig,
    runtime: Arc<CacheRuntime>,
    built: HashMap<String, Arc<dyn CacheBackend>>,
    memory: HashMap<String, (Arc<MemoryCacheBackend>, Option<PathBuf>)>,
}

impl<'a> GraphBuilder<'a> {
    fn build(&mut self, name: &str) -> DdcResult<Arc<dyn CacheBackend>> {
        if let Some(node) = self.built.get(name) {
            return Ok(Arc::clone(node));
        }
        let config = *self.configs.get(name).ok_or_else(|| ConfigError::UnknownNode {
            name: name.to_string(),
        })?;

        let backend: Arc<dyn CacheBackend> = match &config.kind {
            NodeKind::Memory {
                max_cache_size_mb,
                allow_disable,
                max_entry_age,
                snapshot,
                speed_class,
            } => {
                let max_cache_size_bytes = match max_cache_size_mb {
                    Some(mb) => Some(mb.checked_mul(1024 * 1024).ok_or_else(|| {
                        ConfigError::InvalidValue {
                            field: "max_cache_size_mb".to_string(),
                            value: mb.to_string(),
                            reason: "size in bytes overflows u64".to_string(),
                        }
                    })?),
                    None => None,
                };
                let memory_config = MemoryCacheConfig {
                    max_cache_size_bytes,
                    allow_disable: *allow_disable,
                    max_entry_age: *max_entry_age,
                };
                let cache = Arc::new(
                    MemoryCacheBackend::new(name, memory_config)?.with_speed_class(*speed_class),
                );
                if let Some(path) = snapshot.as_ref().filter(|p| p.exists()) {
                    if let Err(e) = cache.load_snapshot(path) {
                        tracing::warn!(
                            cache = name,
                            path = %path.display(),
                            error = %e,
                            "Ignoring unreadable memory cache snapshot"
                        );
                    }
                }
                self.memory
                    .insert(name.to_string(), (Arc::clone(&cache), snapshot.clone()));
                cache
            }
            NodeKind::Lmdb {
                path,
                max_size_mb,
                read_only,
            } => Arc::new(LmdbCacheBackend::open(name, path, *max_size_mb, *read_only)?),
            NodeKind::Hierarchical { tiers } => {
                let mut backends = Vec::with_capacity(tiers.len());
                for tier in tiers {
                    backends.push(self.build(tier)?);
                }
                Arc::new(HierarchicalBackend::new(
                    name,
                    backends,
                    Arc::clone(&self.runtime),
                    self.async_put.clone(),
                )?)
            }
            NodeKind::AsyncPut {
                inner,
                cache_in_flight_puts,
            } => {
                let inner = self.build(inner)?;
                let mut config = self.async_put.clone();
                if let Some(enabled) = cache_in_flight_puts {
                    config.cache_in_flight_puts = *enabled;
                }
                Arc::new(AsyncPutBackend::new(inner, Arc::clone(&self.runtime), config)?)
            }
        };

        self.built.insert(name.to_string(), Arc::clone(&backend));
        Ok(backend)
    }
}

impl CacheGraph {
    /// Parse, validate and build a graph on a new runtime.
    pub fn from_toml_str(source: &str) -> DdcResult<Self> {
        let config = GraphConfig::from_toml_str(source)?;
        let runtime = CacheRuntime::new(config.runtime.clone())?;
        Self::build(&config, runtime)
    }

    pub fn build(config: &GraphConfig, runtime: Arc<CacheRuntime>) -> DdcResult<Self> {
        config.validate()?;
        let mut builder = GraphBuilder {
            configs: config.nodes.iter().map(|n| (n.name.as_str(), n)).collect(),
            async_put: &config.async_put,
            runtime: Arc::clone(&runtime),
            built: HashMap::new(),
            memory: HashMap::new(),
        };
        let root = builder.build(&config.root)?;

        let unused = config.nodes.len() - builder.built.len();
        tracing::info!(
            root = %config.root,
            nodes = builder.built.len(),
            unused,
            workers = config.runtime.worker_count,
            "Cache graph built"
        );
        Ok(Self {
            root,
            nodes: builder.built,
            memory: builder.memory,
            runtime,
        })
    }

    pub fn root(&self) -> &Arc<dyn CacheBackend> {
        &self.root
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn CacheBackend>> {
        self.nodes.get(name)
    }

    pub fn memory_node(&self, name: &str) -> Option<&Arc<MemoryCacheBackend>> {
        self.memory.get(name).map(|(cache, _)| cache)
    }

    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Drain outstanding work, stop the workers and save memory snapshots.
    ///
    /// Every snapshot is attempted; the first failure is returned.
    pub async fn shutdown(&self) -> DdcResult<usize> {
        self.runtime.shutdown().await;

        let mut saved = 0;
        let mut first_error: Option<DdcError> = None;
        for (cache, path) in self.memory.values() {
            let Some(path) = path else {
                continue;
            };
            match cache.save_snapshot(path) {
                Ok(_) => saved += 1,
                Err(e) => {
                    tracing::warn!(
                        cache = cache.name(),
                        path = %path.display(),
                        error = %e,
                        "Failed to save memory cache snapshot"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        tracing::info!(snapshots = saved, "Cache graph shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn graph_toml(dir: &TempDir) -> String {
        format!(
            r#"
root = "Root"

[runtime]
worker_count = 2

[async_put]
retry_delay_ms = 1

[[nodes]]
name = "Boot"
type = "memory"
max_cache_size_mb = 16
snapshot = "{snapshot}"

[[nodes]]
name = "Local"
type = "lmdb"
path = "{lmdb}"
max_size_mb = 16

[[nodes]]
name = "Hierarchy"
type = "hierarchical"
tiers = ["Boot", "Local"]

[[nodes]]
name = "Root"
type = "async_put"
inner = "Hierarchy"
cache_in_flight_puts = false

[[nodes]]
name = "Unused"
type = "memory"
"#,
            snapshot = dir.path().join("boot.ddc").display(),
            lmdb = dir.path().join("local").display(),
        )
    }

    #[test]
    fn test_parse_graph_config() {
        let dir = TempDir::new().expect("tempdir");
        let config = GraphConfig::from_toml_str(&graph_toml(&dir)).expect("parse");
        assert_eq!(config.root, "Root");
        assert_eq!(config.runtime.worker_count, 2);
        assert_eq!(config.async_put.retry_delay_ms, 1);
        assert!(config.async_put.cache_in_flight_puts);
        assert_eq!(config.nodes.len(), 5);
        assert!(matches!(
            config.nodes[0].kind,
            NodeKind::Memory {
                max_cache_size_mb: Some(16),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let source = r#"
root = "Hierarchy"
[[nodes]]
name = "Hierarchy"
type = "hierarchical"
tiers = ["Missing"]
"#;
        let err = GraphConfig::from_toml_str(source).expect_err("unknown");
        assert!(matches!(
            err,
            DdcError::Config(ConfigError::UnknownNode { ref name }) if name == "Missing"
        ));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let source = r#"
root = "A"
[[nodes]]
name = "A"
type = "memory"
[[nodes]]
name = "A"
type = "memory"
"#;
        let err = GraphConfig::from_toml_str(source).expect_err("duplicate");
        assert!(matches!(err, DdcError::Config(ConfigError::DuplicateNode { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let source = r#"
root = "A"
[[nodes]]
name = "A"
type = "hierarchical"
tiers = ["B"]
[[nodes]]
name = "B"
type = "async_put"
inner = "A"
"#;
        let err = GraphConfig::from_toml_str(source).expect_err("cycle");
        match err {
            DdcError::Config(ConfigError::CycleDetected { path }) => {
                assert_eq!(path, vec!["A", "B", "A"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        let source = r#"
root = "A"
[[nodes]]
name = "A"
type = "redis"
"#;
        let err = GraphConfig::from_toml_str(source).expect_err("parse");
        assert!(matches!(err, DdcError::Config(ConfigError::Parse { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_memory_budget_rejected() {
        let source = r#"
root = "Boot"
[[nodes]]
name = "Boot"
type = "memory"
max_cache_size_mb = 9223372036854775807
"#;
        let err = CacheGraph::from_toml_str(source).err().expect("overflow");
        assert!(matches!(
            err,
            DdcError::Config(ConfigError::InvalidValue { ref field, .. })
                if field == "max_cache_size_mb"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_and_shutdown_saves_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let graph = CacheGraph::from_toml_str(&graph_toml(&dir)).expect("build");
        assert_eq!(graph.root().name(), "AsyncPut(Hierarchy)");
        assert_eq!(graph.node_names(), vec!["Boot", "Hierarchy", "Local", "Root"]);
        assert!(graph.node("Unused").is_none());

        graph
            .node("Hierarchy")
            .expect("hierarchy")
            .put("Meshes/1", Bytes::from_static(b"mesh"), false)
            .await;
        assert_eq!(graph.shutdown().await.expect("shutdown"), 1);
        assert!(graph.memory_node("Boot").expect("boot").probe("Meshes/1"));
        assert!(dir.path().join("boot.ddc").exists());
    }
}
