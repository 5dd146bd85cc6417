use crate::error::{RepairError, RepairResult};
use crate::PPR_CONFIG;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub dry_run: bool,
    pub compact: bool,
    pub report_path: Option<PathBuf>,
    /// Deadline given to each stage individually, not to the whole run.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: false,
            compact: false,
            report_path: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkgSettings {
    #[serde(default = "default_pkg_binary")]
    pub pkg_binary: String,

    #[serde(default = "default_database_dir")]
    pub database_dir: PathBuf,

    #[serde(default = "default_cache_pattern")]
    pub cache_pattern: String,

    #[serde(default = "default_local_database")]
    pub local_database: String,

    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,

    #[serde(default = "default_abi_placeholder")]
    pub abi_placeholder: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_success_tail")]
    pub success_tail: usize,

    #[serde(default = "default_failure_tail")]
    pub failure_tail: usize,
}

impl PkgSettings {
    /// Reads the settings file if one exists. A missing file yields defaults;
    /// the file is never created.
    pub fn load(config_path: Option<&Path>) -> RepairResult<Self> {
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var("PPR_CONFIG") {
                Ok(path) => PathBuf::from(path),
                Err(_) => PPR_CONFIG.join("ppr.toml"),
            },
        };

        if config_path.is_file() {
            log::debug!("Loading settings from {}", config_path.display());
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            log::debug!(
                "No settings file at {}, using defaults",
                config_path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> RepairResult<Self> {
        let settings: PkgSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> RepairResult<()> {
        if self.pkg_binary.trim().is_empty() {
            return Err(RepairError::ConfigError("pkg_binary must not be empty".into()));
        }
        if self.local_database.contains('/') {
            return Err(RepairError::ConfigError(format!(
                "local_database must be a file name, got '{}'",
                self.local_database
            )));
        }
        if self.backup_suffix.is_empty() {
            return Err(RepairError::ConfigError("backup_suffix must not be empty".into()));
        }
        if self.connect_timeout_secs == 0 || self.http_timeout_secs == 0 {
            return Err(RepairError::ConfigError("probe timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn local_database_path(&self) -> PathBuf {
        self.database_dir.join(&self.local_database)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.database_dir
            .join(format!("{}{}", self.local_database, self.backup_suffix))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for PkgSettings {
    fn default() -> Self {
        Self {
            pkg_binary: default_pkg_binary(),
            database_dir: default_database_dir(),
            cache_pattern: default_cache_pattern(),
            local_database: default_local_database(),
            backup_suffix: default_backup_suffix(),
            abi_placeholder: default_abi_placeholder(),
            connect_timeout_secs: default_connect_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            success_tail: default_success_tail(),
            failure_tail: default_failure_tail(),
        }
    }
}

fn default_pkg_binary() -> String {
    "pkg".to_string()
}
fn default_database_dir() -> PathBuf {
    PathBuf::from("/var/db/pkg")
}
fn default_cache_pattern() -> String {
    "repo-*.sqlite*".to_string()
}
fn default_local_database() -> String {
    "local.sqlite".to_string()
}
fn default_backup_suffix() -> String {
    ".bak".to_string()
}
fn default_abi_placeholder() -> String {
    "${ABI}".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_http_timeout_secs() -> u64 {
    6
}
fn default_success_tail() -> usize {
    200
}
fn default_failure_tail() -> usize {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = PkgSettings::default();
        assert_eq!(settings.pkg_binary, "pkg");
        assert_eq!(
            settings.local_database_path(),
            PathBuf::from("/var/db/pkg/local.sqlite")
        );
        assert_eq!(
            settings.backup_path(),
            PathBuf::from("/var/db/pkg/local.sqlite.bak")
        );
        assert_eq!(settings.connect_timeout(), Duration::from_secs(5));
        assert_eq!(settings.http_timeout(), Duration::from_secs(6));
        assert_eq!(Config::default().timeout, Duration::from_secs(1200));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings = PkgSettings::from_toml(
            r#"
            pkg_binary = "/usr/local/sbin/pkg-static"
            database_dir = "/tmp/pkgdb"
            "#,
        )
        .unwrap();
        assert_eq!(settings.pkg_binary, "/usr/local/sbin/pkg-static");
        assert_eq!(settings.database_dir, PathBuf::from("/tmp/pkgdb"));
        assert_eq!(settings.cache_pattern, "repo-*.sqlite*");
        assert_eq!(settings.failure_tail, 300);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(PkgSettings::from_toml("pkg_binary = \"\"").is_err());
        assert!(PkgSettings::from_toml("local_database = \"a/b.sqlite\"").is_err());
        assert!(PkgSettings::from_toml("connect_timeout_secs = 0").is_err());
        assert!(PkgSettings::from_toml("connect_timeout_secs = \"five\"").is_err());
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ppr.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "backup_suffix = \".broken\"").unwrap();

        let settings = PkgSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.backup_suffix, ".broken");

        let missing = dir.path().join("absent.toml");
        let settings = PkgSettings::load(Some(&missing)).unwrap();
        assert_eq!(settings, PkgSettings::default());
        assert!(!missing.exists());
    }
}
