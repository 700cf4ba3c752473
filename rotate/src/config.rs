//! nss-rotate configuration loading

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use nss_rotate::rotation::{DEFAULT_CERT_DIR, DEFAULT_CONF_DIR};
use nss_rotate::store::DEFAULT_CERTUTIL;

const DEFAULT_CONFIG_PATH: &str = "/etc/nss-rotate/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct RotateConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            conf_dir: default_conf_dir(),
            cert_dir: default_cert_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// NSS command-line tool used to edit the database.
    #[serde(default = "default_certutil")]
    pub certutil: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            certutil: default_certutil(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_conf_dir() -> PathBuf { DEFAULT_CONF_DIR.into() }
fn default_cert_dir() -> PathBuf { DEFAULT_CERT_DIR.into() }
fn default_certutil() -> PathBuf { DEFAULT_CERTUTIL.into() }
fn default_log_level() -> String { "info".into() }

/// Path of the configuration file, from `NSS_ROTATE_CONFIG` if set.
pub fn config_path() -> PathBuf {
    std::env::var_os("NSS_ROTATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the configuration file, or `None` if it does not exist.
pub fn load_config(path: &Path) -> Result<Option<RotateConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: RotateConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = RotateConfig::default();
        assert_eq!(config.paths.conf_dir, PathBuf::from("/etc/httpd"));
        assert_eq!(config.paths.cert_dir, PathBuf::from("/var/lib/acme"));
        assert_eq!(config.store.certutil, PathBuf::from("certutil"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[paths]
cert_dir = "/etc/letsencrypt/live"

[store]
certutil = "/usr/bin/certutil"
"#;
        let config: RotateConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.paths.conf_dir, PathBuf::from("/etc/httpd"));
        assert_eq!(config.paths.cert_dir, PathBuf::from("/etc/letsencrypt/live"));
        assert_eq!(config.store.certutil, PathBuf::from("/usr/bin/certutil"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(load_config(&tmp.path().join("config.toml")).unwrap().is_none());
    }

    #[test]
    fn test_load_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        let config = load_config(&path).unwrap().unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[paths\nconf_dir = 1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }
}
