// qci-trainer-rs/src/config.rs
// Runtime configuration for the training cycle.
//
// Precedence: built-in defaults, then the optional TOML file named by
// QCI_CONFIG_PATH, then individual QCI_* environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config_rs::{parse_flag, parse_or};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Cap on calls scored per agent per run
    pub max_calls_per_agent: usize,
    /// Minimum gap between consecutive calls' requests
    pub call_pacing_ms: u64,
    /// Gap between dependent requests (structure then score, mining, rewrite)
    pub stage_pacing_ms: u64,
    pub min_transcript_chars: usize,
    /// Batch-level retries of a call stage after the completion service was
    /// unavailable
    pub upstream_retries: u32,
    pub require_verbatim_turns: bool,
    pub ab_variants: bool,
    pub store_path: PathBuf,
    pub calls_path: PathBuf,
    pub prompts_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_calls_per_agent: 15,
            call_pacing_ms: 2000,
            stage_pacing_ms: 1000,
            min_transcript_chars: 10,
            upstream_retries: 1,
            require_verbatim_turns: true,
            ab_variants: true,
            store_path: PathBuf::from("data/processed"),
            calls_path: PathBuf::from("data/calls.json"),
            prompts_dir: None,
            log_json: false,
        }
    }
}

impl TrainerConfig {
    /// Construct configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Construct configuration from an arbitrary variable lookup.
    ///
    /// Invalid values never fail; they fall back to the current value with a
    /// warning. Only an unreadable or invalid TOML file is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup("QCI_CONFIG_PATH").filter(|p| !p.trim().is_empty()) {
            Some(path) => Self::from_toml_file(Path::new(path.trim()))?,
            None => Self::default(),
        };

        cfg.max_calls_per_agent = parse_or(
            "QCI_MAX_CALLS_PER_AGENT",
            lookup("QCI_MAX_CALLS_PER_AGENT"),
            cfg.max_calls_per_agent,
        );
        cfg.call_pacing_ms = parse_or("QCI_CALL_PACING_MS", lookup("QCI_CALL_PACING_MS"), cfg.call_pacing_ms);
        cfg.stage_pacing_ms = parse_or("QCI_STAGE_PACING_MS", lookup("QCI_STAGE_PACING_MS"), cfg.stage_pacing_ms);
        cfg.min_transcript_chars = parse_or(
            "QCI_MIN_TRANSCRIPT_CHARS",
            lookup("QCI_MIN_TRANSCRIPT_CHARS"),
            cfg.min_transcript_chars,
        );
        cfg.upstream_retries = parse_or(
            "QCI_UPSTREAM_RETRIES",
            lookup("QCI_UPSTREAM_RETRIES"),
            cfg.upstream_retries,
        );
        cfg.require_verbatim_turns = parse_flag(
            "QCI_REQUIRE_VERBATIM_TURNS",
            lookup("QCI_REQUIRE_VERBATIM_TURNS"),
            cfg.require_verbatim_turns,
        );
        cfg.ab_variants = parse_flag("QCI_AB_VARIANTS", lookup("QCI_AB_VARIANTS"), cfg.ab_variants);
        cfg.log_json = parse_flag("QCI_LOG_JSON", lookup("QCI_LOG_JSON"), cfg.log_json);

        if let Some(path) = non_empty(lookup("QCI_STORE_PATH")) {
            cfg.store_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty(lookup("QCI_CALLS_PATH")) {
            cfg.calls_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty(lookup("QCI_PROMPTS_DIR")) {
            cfg.prompts_dir = Some(PathBuf::from(path));
        }

        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn call_pacing(&self) -> Duration {
        Duration::from_millis(self.call_pacing_ms)
    }

    pub fn stage_pacing(&self) -> Duration {
        Duration::from_millis(self.stage_pacing_ms)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = TrainerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, TrainerConfig::default());
        assert_eq!(cfg.max_calls_per_agent, 15);
        assert_eq!(cfg.call_pacing(), Duration::from_secs(2));
        assert_eq!(cfg.min_transcript_chars, 10);
        assert!(cfg.ab_variants);
    }

    #[test]
    fn environment_overrides_and_invalid_values_fall_back() {
        let cfg = TrainerConfig::from_lookup(lookup_from(&[
            ("QCI_MAX_CALLS_PER_AGENT", "3"),
            ("QCI_CALL_PACING_MS", "fast"),
            ("QCI_AB_VARIANTS", "off"),
            ("QCI_PROMPTS_DIR", "prompts"),
            ("QCI_STORE_PATH", "  "),
        ]))
        .unwrap();

        assert_eq!(cfg.max_calls_per_agent, 3);
        assert_eq!(cfg.call_pacing_ms, 2000);
        assert!(!cfg.ab_variants);
        assert_eq!(cfg.prompts_dir, Some(PathBuf::from("prompts")));
        assert_eq!(cfg.store_path, PathBuf::from("data/processed"));
    }

    #[test]
    fn toml_file_is_overlaid_by_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_calls_per_agent = 5\nstage_pacing_ms = 0\nlog_json = true").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cfg = TrainerConfig::from_lookup(lookup_from(&[
            ("QCI_CONFIG_PATH", path.as_str()),
            ("QCI_MAX_CALLS_PER_AGENT", "7"),
        ]))
        .unwrap();

        assert_eq!(cfg.max_calls_per_agent, 7);
        assert_eq!(cfg.stage_pacing_ms, 0);
        assert!(cfg.log_json);
        assert_eq!(cfg.call_pacing_ms, 2000);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = TrainerConfig::from_lookup(lookup_from(&[("QCI_CONFIG_PATH", "/nonexistent/qci.toml")]));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }
}
