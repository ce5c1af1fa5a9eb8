//! Core configuration types and data structures

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Main lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Which path set is active
    pub environment: EnvironmentKind,
    /// Stage and dataset locations per environment
    pub paths: PathsConfig,
    /// Lock waiting policy
    pub locking: LockingConfig,
    /// Downstream dataset handling
    pub downstream: DownstreamConfig,
    /// Numeric classification keys assigned at publication
    pub classification: ClassificationConfig,
    /// Topology evaluation settings
    pub topology: TopologyConfig,
    /// Enumerated values per governed field
    pub domains: BTreeMap<String, Vec<String>>,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// External system-of-record extract
    pub system_of_record: SystemOfRecordConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            environment: EnvironmentKind::default(),
            paths: PathsConfig::default(),
            locking: LockingConfig::default(),
            downstream: DownstreamConfig::default(),
            classification: ClassificationConfig::default(),
            topology: TopologyConfig::default(),
            domains: default_domains(),
            logging: LoggingConfig::default(),
            system_of_record: SystemOfRecordConfig::default(),
        }
    }
}

fn default_domains() -> BTreeMap<String, Vec<String>> {
    let mut domains = BTreeMap::new();
    domains.insert(
        "Status_Code".to_string(),
        vec!["ACTIVE".to_string(), "RETIRED".to_string()],
    );
    domains.insert(
        "Poly_Type".to_string(),
        ["Current_View", "Addition", "Deletion", "Replacement"]
            .iter()
            .map(|v| v.to_string())
            .collect(),
    );
    domains
}

impl LifecycleConfig {
    /// Paths of the active environment
    pub fn active_paths(&self) -> &StagePaths {
        match self.environment {
            EnvironmentKind::Test => &self.paths.test,
            EnvironmentKind::Production => &self.paths.production,
        }
    }

    /// Configuration with both environments rooted under one directory
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            paths: PathsConfig {
                test: StagePaths::under(root.join("test")),
                production: StagePaths::under(root.join("production")),
            },
            ..Self::default()
        }
    }

    /// Reject configurations that would let stages or keys collide
    pub fn validate(&self) -> Result<()> {
        let paths = self.active_paths();
        let stage_paths = [
            ("baseline", &paths.baseline),
            ("editing", &paths.editing),
            ("review", &paths.review),
            ("pending", &paths.pending),
            ("archive", &paths.archive),
            ("downstream", &paths.downstream),
        ];

        let mut seen = BTreeSet::new();
        for (name, path) in stage_paths {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!("{} path is empty", name)));
            }
            if !seen.insert(path.clone()) {
                return Err(ConfigError::Validation(format!(
                    "{} path {} is shared with another stage",
                    name,
                    path.display()
                )));
            }
        }

        for (field, values) in &self.domains {
            if values.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Domain for {} has no values",
                    field
                )));
            }
        }

        if !(self.topology.cluster_tolerance > 0.0) {
            return Err(ConfigError::Validation(
                "Cluster tolerance must be greater than 0".to_string(),
            ));
        }

        let keys = self.classification.all();
        let unique: BTreeSet<u32> = keys.iter().copied().collect();
        if unique.len() != keys.len() {
            return Err(ConfigError::Validation(
                "Classification keys must be distinct".to_string(),
            ));
        }

        if self.locking.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "Lock poll interval must be greater than 0".to_string(),
            ));
        }

        if self.downstream.backup_suffix.is_empty() {
            return Err(ConfigError::Validation(
                "Backup suffix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Test or production path set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    #[default]
    Test,
    Production,
}

/// Path sets for each environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub test: StagePaths,
    pub production: StagePaths,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            test: StagePaths::under("tfl/test"),
            production: StagePaths::under("tfl/production"),
        }
    }
}

/// Directories for each stage, the archive and downstream datasets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagePaths {
    pub baseline: PathBuf,
    pub editing: PathBuf,
    pub review: PathBuf,
    pub pending: PathBuf,
    pub archive: PathBuf,
    pub downstream: PathBuf,
}

impl StagePaths {
    /// Standard folder layout under one root
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            baseline: root.join("1_TFL_Final"),
            editing: root.join("2_TFL_Working"),
            review: root.join("3_TFL_Review"),
            pending: root.join("4_TFL_Pending"),
            archive: root.join("5_TFL_Archive"),
            downstream: root.join("TFL_Staging"),
        }
    }
}

impl Default for StagePaths {
    fn default() -> Self {
        Self::under("tfl")
    }
}

/// Lock waiting policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockingConfig {
    /// How long to wait for a unit lock after the compaction retry; 0 fails fast
    pub unit_lock_wait_ms: u64,
    /// How long to wait for a downstream dataset lock
    pub dataset_lock_wait_ms: u64,
    /// Poll interval while waiting
    pub poll_interval_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            unit_lock_wait_ms: 0,
            dataset_lock_wait_ms: 30_000,
            poll_interval_ms: 250,
        }
    }
}

/// Downstream dataset handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Suffix of the backup slot written before each overwrite
    pub backup_suffix: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            backup_suffix: "_BACKUP".to_string(),
        }
    }
}

/// Numeric feature class keys per polygon tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationConfig {
    pub current_view: u32,
    pub addition: u32,
    pub deletion: u32,
    pub replacement: u32,
    pub schedule_a: u32,
}

impl ClassificationConfig {
    /// Every configured key
    pub fn all(&self) -> [u32; 5] {
        [
            self.current_view,
            self.addition,
            self.deletion,
            self.replacement,
            self.schedule_a,
        ]
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            current_view: 830,
            addition: 831,
            deletion: 832,
            replacement: 833,
            schedule_a: 834,
        }
    }
}

/// Topology evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    pub cluster_tolerance: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            cluster_tolerance: 0.0001,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Location of the exported system-of-record snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SystemOfRecordConfig {
    pub extract_path: Option<PathBuf>,
}

/// Load, save and validate a configuration
pub trait ConfigStore {
    /// Load configuration from all sources
    fn load_config(&self) -> Result<LifecycleConfig>;

    /// Save configuration to the store's file
    fn save_config(&self, config: &LifecycleConfig) -> Result<()>;

    /// Validate configuration
    fn validate_config(&self, config: &LifecycleConfig) -> Result<()> {
        config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LifecycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.environment, EnvironmentKind::Test);
        assert_eq!(config.classification.current_view, 830);
    }

    #[test]
    fn test_active_paths_follow_environment() {
        let mut config = LifecycleConfig::rooted_at("/srv/tfl");
        assert_eq!(config.active_paths().baseline, PathBuf::from("/srv/tfl/test/1_TFL_Final"));

        config.environment = EnvironmentKind::Production;
        assert_eq!(
            config.active_paths().pending,
            PathBuf::from("/srv/tfl/production/4_TFL_Pending")
        );
    }

    #[test]
    fn test_shared_stage_path_rejected() {
        let mut config = LifecycleConfig::default();
        config.paths.test.review = config.paths.test.editing.clone();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_duplicate_classification_keys_rejected() {
        let mut config = LifecycleConfig::default();
        config.classification.addition = config.classification.deletion;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_domain_rejected() {
        let mut config = LifecycleConfig::default();
        config.domains.insert("Status_Code".to_string(), Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_tolerance_rejected() {
        let mut config = LifecycleConfig::default();
        config.topology.cluster_tolerance = 0.0;
        assert!(config.validate().is_err());
    }
}
