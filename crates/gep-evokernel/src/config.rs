use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use gep_evolution_network::{PublishConfig, Visibility};
use gep_governor::GovernorConfig;
use gep_memory_graph::MemoryGraphConfig;
use gep_mutation::StrategyName;
use gep_personality::PersonalityConfig;
use gep_sandbox::{CountedPathPolicy, SandboxPolicy};
use gep_selector::SelectorConfig;
use serde::{Deserialize, Serialize};

use crate::EvoKernelError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub repo_root: PathBuf,
    /// Relative paths resolve against `repo_root`.
    pub assets_dir: PathBuf,
    pub evolution_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            assets_dir: PathBuf::from("assets/gep"),
            evolution_dir: PathBuf::from("memory/evolution"),
        }
    }
}

impl PathsConfig {
    pub fn assets_path(&self) -> PathBuf {
        self.repo_root.join(&self.assets_dir)
    }

    pub fn evolution_path(&self) -> PathBuf {
        self.repo_root.join(&self.evolution_dir)
    }
}

/// Every tunable of one evolver instance. Components receive their section
/// at construction and never consult the process environment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolverConfig {
    pub paths: PathsConfig,
    pub governor: GovernorConfig,
    pub sandbox: SandboxPolicy,
    pub counted_paths: CountedPathPolicy,
    pub memory_graph: MemoryGraphConfig,
    pub personality: PersonalityConfig,
    pub selector: SelectorConfig,
    pub strategy: Option<StrategyName>,
    pub publish: PublishConfig,
    pub device_id: Option<String>,
}

impl EvolverConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, EvoKernelError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|err| EvoKernelError::Config(err.to_string()))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, EvoKernelError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| EvoKernelError::Config(format!("{}: {err}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    /// Applies legacy variable names (as collected by the caller, typically
    /// once from the process environment). Unparseable values are ignored.
    pub fn with_overrides(mut self, vars: &HashMap<String, String>) -> Self {
        let get = |name: &str| {
            vars.get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("EVOLVER_HARD_CAP_FILES").and_then(parse_positive) {
            self.governor.hard_cap_files = value;
        }
        if let Some(value) = get("EVOLVER_HARD_CAP_LINES").and_then(parse_positive) {
            self.governor.hard_cap_lines = value;
        }
        if let Some(value) = get("EVOLVE_ALLOW_SELF_MODIFY") {
            self.governor.allow_self_modify = value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = get("EVOLVER_AUTO_PUBLISH") {
            self.publish.auto_publish = !value.eq_ignore_ascii_case("false");
        }
        if let Some(value) = get("EVOLVER_DEFAULT_VISIBILITY") {
            self.publish.visibility = if value.eq_ignore_ascii_case("public") {
                Visibility::Public
            } else {
                Visibility::Private
            };
        }
        if let Some(value) = get("EVOLVER_MIN_PUBLISH_SCORE")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|score| score.is_finite() && *score > 0.0)
        {
            self.publish.min_publish_score = value;
        }
        if let Some(value) = get("EVOLVE_STRATEGY").and_then(StrategyName::parse) {
            self.strategy = Some(value);
        }
        if let Some(value) = get("A2A_NODE_SECRET") {
            self.publish.node_secret = Some(value.to_string());
        }
        if let Some(value) = get("A2A_NODE_ID") {
            self.publish.node_id = Some(value.to_string());
        }
        if let Some(value) = get("A2A_MAX_FILES").and_then(parse_positive) {
            self.publish.a2a_max_files = value;
        }
        if let Some(value) = get("A2A_MAX_LINES").and_then(parse_positive) {
            self.publish.a2a_max_lines = value;
        }
        if let Some(value) = get("EVOMAP_DEVICE_ID") {
            self.device_id = Some(value.to_string());
        }
        self
    }
}

fn parse_positive(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EvolverConfig::default();
        assert_eq!(config.paths.assets_dir, PathBuf::from("assets/gep"));
        assert_eq!(config.governor.hard_cap_files, 60);
        assert_eq!(config.governor.hard_cap_lines, 20_000);
        assert_eq!(config.sandbox.validation_timeout_ms, 180_000);
        assert_eq!(config.sandbox.canary_timeout_ms, 30_000);
        assert_eq!(config.memory_graph.read_limit, 2000);
        assert_eq!(config.personality.history_limit, 120);
        assert!(config.publish.auto_publish);
        assert_eq!(config.publish.min_publish_score, 0.78);
        assert!(config.strategy.is_none());
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_fields() {
        let config = EvolverConfig::from_yaml_str(
            r#"
paths:
  repo_root: /srv/agent
governor:
  hard_cap_files: 40
sandbox:
  canary_timeout_ms: 5000
strategy: harden
publish:
  visibility: private
"#,
        )
        .unwrap();
        assert_eq!(config.paths.repo_root, PathBuf::from("/srv/agent"));
        assert_eq!(
            config.paths.evolution_path(),
            PathBuf::from("/srv/agent/memory/evolution")
        );
        assert_eq!(config.governor.hard_cap_files, 40);
        assert_eq!(config.governor.hard_cap_lines, 20_000);
        assert_eq!(config.sandbox.canary_timeout_ms, 5000);
        assert_eq!(config.sandbox.validation_timeout_ms, 180_000);
        assert_eq!(config.strategy, Some(StrategyName::Harden));
        assert_eq!(config.publish.visibility, Visibility::Private);
        assert_eq!(config.publish.a2a_max_files, 5);
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = EvolverConfig::from_yaml_str("governor: [1, 2").unwrap_err();
        assert!(matches!(err, EvoKernelError::Config(_)));
        assert!(EvolverConfig::from_yaml_str("  \n").is_ok());
    }

    #[test]
    fn legacy_names_translate_into_fields() {
        let vars = [
            ("EVOLVER_HARD_CAP_FILES", "80"),
            ("EVOLVER_HARD_CAP_LINES", "not-a-number"),
            ("EVOLVE_ALLOW_SELF_MODIFY", "true"),
            ("EVOLVER_AUTO_PUBLISH", "FALSE"),
            ("EVOLVER_DEFAULT_VISIBILITY", "private"),
            ("EVOLVER_MIN_PUBLISH_SCORE", "0.9"),
            ("EVOLVE_STRATEGY", "repair-only"),
            ("A2A_NODE_SECRET", "s3cret"),
            ("A2A_MAX_FILES", "0"),
            ("A2A_MAX_LINES", "400"),
            ("EVOMAP_DEVICE_ID", "device-1"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<HashMap<_, _>>();

        let config = EvolverConfig::default().with_overrides(&vars);
        assert_eq!(config.governor.hard_cap_files, 80);
        assert_eq!(config.governor.hard_cap_lines, 20_000);
        assert!(config.governor.allow_self_modify);
        assert!(!config.publish.auto_publish);
        assert_eq!(config.publish.visibility, Visibility::Private);
        assert_eq!(config.publish.min_publish_score, 0.9);
        assert_eq!(config.strategy, Some(StrategyName::RepairOnly));
        assert_eq!(config.publish.node_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.publish.a2a_max_files, 5);
        assert_eq!(config.publish.a2a_max_lines, 400);
        assert_eq!(config.device_id.as_deref(), Some("device-1"));
    }
}
