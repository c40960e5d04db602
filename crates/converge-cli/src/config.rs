//! converge CLI configuration stored at `~/.converge/`.
//!
//! - `~/.converge/config.json` holds defaults for the global flags
//! - `~/.converge/kubeconfig` is picked up when nothing else is configured
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `CONVERGE_KUBECONFIG` environment variable
//! 3. `kubeconfig` in `config.json`
//! 4. `~/.converge/kubeconfig`
//! 5. Fall back to kube default (`KUBECONFIG` env / `~/.kube/config`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use converge_common::crd::{DEFAULT_KYMA_NAME, DEFAULT_KYMA_NAMESPACE};
use converge_common::DEFAULT_FIELD_MANAGER;

use crate::{Error, GlobalArgs, Result};

const CONFIG_DIR_NAME: &str = ".converge";
const CONFIG_FILE_NAME: &str = "config.json";
const KUBECONFIG_FILE_NAME: &str = "kubeconfig";
const CONVERGE_KUBECONFIG_ENV: &str = "CONVERGE_KUBECONFIG";

/// Readiness wait used when neither flag nor config sets one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Persistent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConvergeConfig {
    /// Kubeconfig to use when no flag or env var is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Name of the Kyma resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyma_name: Option<String>,
    /// Namespace of the Kyma resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Field manager for server-side apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_owner: Option<String>,
    /// Readiness timeout, same syntax as `--timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Flags merged over the config file, with defaults filled in
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub kubeconfig: Option<PathBuf>,
    pub kyma_name: String,
    pub namespace: String,
    pub field_owner: String,
    pub timeout: Duration,
}

impl Settings {
    /// Merge `flags` over `config`
    pub fn merge(flags: &GlobalArgs, config: ConvergeConfig) -> Result<Self> {
        let timeout = match flags.timeout.as_deref().or(config.timeout.as_deref()) {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_TIMEOUT,
        };
        Ok(Self {
            kubeconfig: resolve_kubeconfig(flags.kubeconfig.as_deref(), config.kubeconfig.as_deref()),
            kyma_name: flags
                .kyma_name
                .clone()
                .or(config.kyma_name)
                .unwrap_or_else(|| DEFAULT_KYMA_NAME.to_string()),
            namespace: flags
                .namespace
                .clone()
                .or(config.namespace)
                .unwrap_or_else(|| DEFAULT_KYMA_NAMESPACE.to_string()),
            field_owner: flags
                .field_owner
                .clone()
                .or(config.field_owner)
                .unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string()),
            timeout,
        })
    }
}

/// Returns `~/.converge/` without creating it.
pub fn converge_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Path to `~/.converge/config.json`.
pub fn config_path() -> Result<PathBuf> {
    Ok(converge_dir()?.join(CONFIG_FILE_NAME))
}

/// Path to `~/.converge/kubeconfig`.
pub fn kubeconfig_path() -> Result<PathBuf> {
    Ok(converge_dir()?.join(KUBECONFIG_FILE_NAME))
}

/// Load config from `~/.converge/config.json`, returning default if missing.
pub fn load_config() -> Result<ConvergeConfig> {
    load_config_from(&config_path()?)
}

/// Load config from `path`, returning default if missing.
pub fn load_config_from(path: &Path) -> Result<ConvergeConfig> {
    if !path.exists() {
        return Ok(ConvergeConfig::default());
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::command_failed(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::command_failed(format!("failed to parse {}: {}", path.display(), e)))
}

/// Resolve a kubeconfig path using the priority chain.
///
/// Returns `Some(path)` if a kubeconfig is found, `None` to use kube defaults.
pub fn resolve_kubeconfig(explicit: Option<&str>, configured: Option<&str>) -> Option<PathBuf> {
    resolve_kubeconfig_from(
        explicit,
        std::env::var(CONVERGE_KUBECONFIG_ENV).ok(),
        configured,
        kubeconfig_path().ok(),
    )
}

fn resolve_kubeconfig_from(
    explicit: Option<&str>,
    env: Option<String>,
    configured: Option<&str>,
    saved: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }

    if let Some(path) = configured {
        return Some(PathBuf::from(path));
    }

    saved.filter(|path| path.exists())
}

/// Parse a human-friendly duration.
///
/// Supports `Nh`, `Nm` and `Ns`; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, scale) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| {
        Error::validation(format!("invalid duration '{}', expected e.g. 90s, 5m, 1h", s))
    })?;
    Ok(Duration::from_secs(n * scale))
}
