//! Configuration types for the GDS store
//!
//! Every section has a usable default. [`GdsConfig::load`] layers an
//! optional file and `GDS_*` environment variables (sections separated by
//! `__`, e.g. `GDS_SHMEM__FLUFF_FACTOR=3.0`) on top of the defaults.

use crate::compress::DEFAULT_THRESHOLD;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GdsConfig {
    /// Hash backend configuration
    pub hash: HashConfig,
    /// Shared-memory backend configuration
    pub shmem: ShmemConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Default module directive applied when a peer names none
    pub modules: Vec<String>,
}

impl GdsConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GDS")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make sizing or compression meaningless
    pub fn validate(&self) -> Result<()> {
        if self.shmem.segment_size_multiplier <= 0.0 {
            return Err(Error::Configuration(
                "shmem.segment_size_multiplier must be positive".into(),
            ));
        }
        if self.shmem.fluff_factor < 1.0 {
            return Err(Error::Configuration(
                "shmem.fluff_factor must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Hash backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Strings longer than this are stored compressed (bytes)
    pub compression_threshold: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Which free virtual-memory range to place a segment in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmHoleKind {
    /// Do not look for a hole
    None,
    /// Below the first mapping
    Begin,
    /// Largest gap below the stack
    #[default]
    Biggest,
    /// Largest gap between heap and stack
    Libs,
    /// Right after the heap
    Heap,
    /// Right before the stack
    Stack,
}

impl FromStr for VmHoleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "begin" => Ok(Self::Begin),
            "biggest" => Ok(Self::Biggest),
            "libs" => Ok(Self::Libs),
            "heap" => Ok(Self::Heap),
            "stack" => Ok(Self::Stack),
            other => Err(Error::Configuration(format!("invalid vm hole kind: {other}"))),
        }
    }
}

/// Shared-memory backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Offer the shared-memory module at all
    pub enabled: bool,
    /// Operator-tunable multiplier applied to every segment size estimate
    pub segment_size_multiplier: f64,
    /// Slack applied to the measured footprint before the multiplier
    pub fluff_factor: f64,
    /// Directory for backing files (`TMPDIR` or /tmp when unset)
    pub tmpdir: Option<PathBuf>,
    /// Package prefix of backing file names
    pub file_prefix: String,
    /// Hole placement strategy
    pub vmhole_kind: VmHoleKind,
    /// Hand backing files to this user
    pub owner_uid: Option<u32>,
    /// Hand backing files to this group
    pub owner_gid: Option<u32>,
    /// Permission bits of backing files
    pub mode: u32,
}

impl ShmemConfig {
    /// Directory backing files are created in
    #[must_use]
    pub fn resolved_tmpdir(&self) -> PathBuf {
        self.tmpdir.clone().unwrap_or_else(|| {
            std::env::var_os("TMPDIR").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        })
    }
}

impl Default for ShmemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            segment_size_multiplier: 1.0,
            fluff_factor: 2.0,
            tmpdir: None,
            file_prefix: "pmix".to_string(),
            vmhole_kind: VmHoleKind::Biggest,
            owner_uid: None,
            owner_gid: None,
            mode: 0o600,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GdsConfig::default();
        assert_eq!(config.hash.compression_threshold, 4096);
        assert!(config.shmem.enabled);
        assert_eq!(config.shmem.vmhole_kind, VmHoleKind::Biggest);
        assert_eq!(config.shmem.mode, 0o600);
        assert!(config.modules.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gds.toml");
        std::fs::write(
            &path,
            "[hash]\ncompression_threshold = 128\n\n[shmem]\nvmhole_kind = \"begin\"\nfluff_factor = 3.0\n",
        )
        .unwrap();
        let config = GdsConfig::load(Some(&path)).unwrap();
        assert_eq!(config.hash.compression_threshold, 128);
        assert_eq!(config.shmem.vmhole_kind, VmHoleKind::Begin);
        assert!((config.shmem.fluff_factor - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.shmem.file_prefix, "pmix");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GdsConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.hash.compression_threshold, DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_validate_rejects_bad_sizing() {
        let mut config = GdsConfig::default();
        config.shmem.fluff_factor = 0.5;
        assert!(config.validate().is_err());
        let json = serde_json::to_string(&GdsConfig::default()).unwrap();
        let back: GdsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shmem.file_prefix, "pmix");
    }

    #[test]
    fn test_hole_kind_parse() {
        assert_eq!("Heap".parse::<VmHoleKind>().unwrap(), VmHoleKind::Heap);
        assert!("middle".parse::<VmHoleKind>().is_err());
    }
}
