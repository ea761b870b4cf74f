//! Engine configuration stored as TOML (conventionally `flowcore.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const ENV_MAX_ITERATIONS: &str = "FLOWCORE_MAX_ITERATIONS";
pub const ENV_TIMEOUT_SECS: &str = "FLOWCORE_TIMEOUT_SECS";
pub const ENV_MAX_CONCURRENCY: &str = "FLOWCORE_MAX_CONCURRENCY";
pub const ENV_STORE_DIR: &str = "FLOWCORE_STORE_DIR";

/// Engine configuration (TOML).
///
/// Missing fields fall back to [`EngineConfig::default`]. The `[settings]`
/// table is not interpreted here; it is handed to every constructed policy
/// and executor through the registry's shared context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on run-loop iterations (policy invocations).
    pub max_iterations: u32,

    /// Wall-clock budget for one `run` in seconds. `0` disables the check.
    pub timeout_secs: u64,

    /// Steps dispatched concurrently per iteration. `1` is sequential.
    pub max_concurrency: usize,

    /// Decisions with more actions than this are rejected before application.
    pub max_actions_per_decision: usize,

    /// Registered policy name to resolve.
    pub policy: String,

    /// Registered executor name to resolve.
    pub executor: String,

    pub store: StoreConfig,

    pub settings: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Registered store backend name.
    pub backend: String,
    pub base_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            base_dir: ".flowcore/artifacts".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            timeout_secs: 0,
            max_concurrency: 1,
            max_actions_per_decision: 256,
            policy: "default".to_string(),
            executor: "default".to_string(),
            store: StoreConfig::default(),
            settings: toml::Table::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be > 0"));
        }
        if self.max_actions_per_decision == 0 {
            return Err(anyhow!("max_actions_per_decision must be > 0"));
        }
        if self.policy.trim().is_empty() {
            return Err(anyhow!("policy must be a non-empty name"));
        }
        if self.executor.trim().is_empty() {
            return Err(anyhow!("executor must be a non-empty name"));
        }
        if self.store.backend.trim().is_empty() {
            return Err(anyhow!("store.backend must be a non-empty name"));
        }
        if self.store.base_dir.trim().is_empty() {
            return Err(anyhow!("store.base_dir must be non-empty"));
        }
        Ok(())
    }

    /// Apply `FLOWCORE_*` overrides read through `lookup`.
    ///
    /// Pass `|name| std::env::var(name).ok()` for the process environment.
    /// Overrides win over file values; unparsable values are errors.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_ITERATIONS) {
            self.max_iterations = parse_env(ENV_MAX_ITERATIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            self.timeout_secs = parse_env(ENV_TIMEOUT_SECS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = parse_env(ENV_MAX_CONCURRENCY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STORE_DIR) {
            self.store.base_dir = raw;
        }
        self.validate()
    }
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("parse {name}={raw:?}"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips_settings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/flowcore.toml");
        let mut cfg = EngineConfig {
            max_concurrency: 4,
            policy: "linear".to_string(),
            ..EngineConfig::default()
        };
        cfg.settings
            .insert("model".to_string(), toml::Value::String("small".to_string()));

        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flowcore.toml");
        fs::write(&path, "max_iterations = 7\n[store]\nbase_dir = \"/tmp/art\"\n")
            .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.store.base_dir, "/tmp/art");
        assert_eq!(cfg.store.backend, "local");
        assert_eq!(cfg.max_concurrency, 1);
    }

    #[test]
    fn zero_iterations_is_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flowcore.toml");
        fs::write(&path, "max_iterations = 0\n").expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_ITERATIONS, "12"),
            (ENV_TIMEOUT_SECS, " 30 "),
            (ENV_STORE_DIR, "/srv/artifacts"),
        ]);
        let mut cfg = EngineConfig::default();

        cfg.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .expect("overrides");

        assert_eq!(cfg.max_iterations, 12);
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.max_concurrency, 1);
        assert_eq!(cfg.store.base_dir, "/srv/artifacts");
    }

    #[test]
    fn unparsable_env_override_is_an_error() {
        let mut cfg = EngineConfig::default();
        let err = cfg
            .apply_env_overrides(|name| (name == ENV_MAX_CONCURRENCY).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_CONCURRENCY));
    }
}
