use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BdeError, BdeResult};

/// Top-level configuration (loaded from gbde.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BdeConfig {
    pub device: DeviceConfig,
    pub format: FormatConfig,
    pub kdf: KdfConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl BdeConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> BdeResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| BdeError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backing device node or image file
    pub path: PathBuf,
    /// Sector size of the backing device in bytes
    pub sector_size: u32,
    /// External key-location table (when sector 0 is not reserved)
    pub lock_file: Option<PathBuf>,
    /// Refuse write and delete requests
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// Payload sectors per zone (0 = one per key slot in a key sector)
    pub zone_cont: u32,
    /// Keep the key-location table in physical sector 0
    pub reserve_sector0: bool,
}

/// Argon2id parameters used to turn a passphrase into key material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept before the least recently released one is reclaimed
    pub max_sectors: usize,
    /// Unreferenced entries older than this are purged
    pub max_idle_secs: u64,
    /// How often the worker runs the purge
    pub purge_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gbde.img"),
            sector_size: 512,
            lock_file: None,
            read_only: false,
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            zone_cont: 0,
            reserve_sector0: true,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sectors: 4096,
            max_idle_secs: 300,
            purge_interval_secs: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[device]
path = "/dev/ada0"
sector_size = 4096
lock_file = "/etc/gbde/ada0.lock"
read_only = true

[format]
zone_cont = 16
reserve_sector0 = false

[kdf]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8

[cache]
max_sectors = 1024
max_idle_secs = 60
purge_interval_secs = 5

[log]
level = "debug"
format = "json"
"#;
        let config: BdeConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.device.path, PathBuf::from("/dev/ada0"));
        assert_eq!(config.device.sector_size, 4096);
        assert_eq!(
            config.device.lock_file,
            Some(PathBuf::from("/etc/gbde/ada0.lock"))
        );
        assert!(config.device.read_only);
        assert_eq!(config.format.zone_cont, 16);
        assert!(!config.format.reserve_sector0);
        assert_eq!(config.kdf.argon2_mem_cost_kib, 131072);
        assert_eq!(config.kdf.argon2_parallelism, 8);
        assert_eq!(config.cache.max_sectors, 1024);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: BdeConfig = toml::from_str("").unwrap();

        assert_eq!(config.device.path, PathBuf::from("gbde.img"));
        assert_eq!(config.device.sector_size, 512);
        assert!(config.device.lock_file.is_none());
        assert_eq!(config.format.zone_cont, 0);
        assert!(config.format.reserve_sector0);
        assert_eq!(config.kdf.argon2_mem_cost_kib, 65536);
        assert_eq!(config.kdf.argon2_time_cost, 3);
        assert_eq!(config.cache.max_sectors, 4096);
        assert_eq!(config.cache.max_idle_secs, 300);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[cache]
max_sectors = 64
"#;
        let config: BdeConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.cache.max_sectors, 64);
        // Defaults
        assert_eq!(config.cache.purge_interval_secs, 10);
        assert!(config.format.reserve_sector0);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = BdeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BdeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.device.path, parsed.device.path);
        assert_eq!(config.kdf.argon2_time_cost, parsed.kdf.argon2_time_cost);
        assert_eq!(config.cache.max_sectors, parsed.cache.max_sectors);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BdeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gbde.toml");
        std::fs::write(&path, "[cache\nmax_sectors = ").unwrap();
        assert!(matches!(BdeConfig::load(&path), Err(BdeError::Config(_))));
    }
}
