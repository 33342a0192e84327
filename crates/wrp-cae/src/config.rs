//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wrp_reduce::SelectorConfig;
use wrp_storage::{
    BdevConfig, BdevType, ChecksumAlgorithm, PlacementKind, Reassimilation, RegistryConfig,
};

use crate::error::{CaeError, CaeResult};
use crate::logging::LogFormat;

/// Whether pool resolution happens in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Resolution is proxied to a remote coordinator; a registry must be injected
    Client,
    /// This process owns the registry
    #[default]
    Server,
}

/// Pool storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backing device type for new pools
    pub bdev_type: BdevType,
    /// Directory for file-backed pools
    pub storage_root: Option<PathBuf>,
    /// Per-device capacity limit
    pub bdev_capacity_bytes: Option<u64>,
    /// Devices a pool may add as earlier ones fill (None = unlimited)
    pub max_bdevs_per_pool: Option<usize>,
    /// Chunk checksum algorithm
    pub checksum: ChecksumAlgorithm,
    /// Node placement policy for new pools
    pub placement: PlacementKind,
    /// Number of storage nodes
    pub nodes: u32,
    /// Node this process runs on
    pub local_node: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bdev_type: BdevType::Memory,
            storage_root: None,
            bdev_capacity_bytes: None,
            max_bdevs_per_pool: None,
            checksum: ChecksumAlgorithm::Crc32,
            placement: PlacementKind::LeastLoaded,
            nodes: 1,
            local_node: 0,
        }
    }
}

/// Optional limits, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Pool resolution, including the wait for a contended tag
    pub resolve_ms: Option<u64>,
    /// Each source read and each chunk write
    pub chunk_io_ms: Option<u64>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaeConfig {
    /// Client or server
    pub runtime_mode: RuntimeMode,
    /// Jobs allowed to run at once
    pub max_concurrent_jobs: usize,
    /// Chunks read ahead of the writer
    pub pipeline_depth: usize,
    /// Chunk size used for sampling and for hinted jobs
    pub chunk_size_hint: usize,
    /// Compression selector
    pub selector: SelectorConfig,
    /// Pool storage
    pub storage: StorageConfig,
    /// Timeouts
    pub timeouts: TimeoutConfig,
    /// Policy when a job names no overwrite behavior
    pub reassimilation: Reassimilation,
    /// Read every chunk back after a job finishes writing
    pub verify_after_write: bool,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for CaeConfig {
    fn default() -> Self {
        Self {
            runtime_mode: RuntimeMode::Server,
            max_concurrent_jobs: 4,
            pipeline_depth: 4,
            chunk_size_hint: 64 * 1024,
            selector: SelectorConfig::default(),
            storage: StorageConfig::default(),
            timeouts: TimeoutConfig::default(),
            reassimilation: Reassimilation::Reject,
            verify_after_write: false,
            log_format: LogFormat::Text,
        }
    }
}

impl CaeConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CaeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> CaeResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(CaeError::Config("max_concurrent_jobs must be at least 1".into()));
        }
        if self.pipeline_depth == 0 {
            return Err(CaeError::Config("pipeline_depth must be at least 1".into()));
        }
        if self.chunk_size_hint == 0 {
            return Err(CaeError::Config("chunk_size_hint must be non-zero".into()));
        }
        if self.storage.bdev_type == BdevType::File && self.storage.storage_root.is_none() {
            return Err(CaeError::Config("file bdevs need storage.storage_root".into()));
        }
        if self.storage.max_bdevs_per_pool == Some(0) {
            return Err(CaeError::Config("storage.max_bdevs_per_pool must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.selector.tie_epsilon) {
            return Err(CaeError::Config("selector.tie_epsilon must be in [0, 1)".into()));
        }
        Ok(())
    }

    /// Settings for a local registry.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            bdev: BdevConfig {
                bdev_type: self.storage.bdev_type,
                capacity_bytes: self.storage.bdev_capacity_bytes,
                root: self.storage.storage_root.clone(),
                max_per_pool: self.storage.max_bdevs_per_pool,
            },
            checksum: self.storage.checksum,
            placement: self.storage.placement,
            nodes: self.storage.nodes,
            local_node: self.storage.local_node,
            lease_timeout_ms: None,
        }
    }
}
