// ABOUTME: convoke.toml loading: router, connector and orchestrator sections with defaults.
// ABOUTME: Durations are stored in milliseconds and converted to runtime configs here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use convoke_connect::{BackoffConfig, ConnectorConfig, RegistrationConfig};
use convoke_orchestrator::{OrchestratorConfig, Stage, StageTarget};
use convoke_serve::RouterConfig;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "convoke.toml";

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Top-level `convoke.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub router: RouterSection,
    pub connector: ConnectorSection,
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterSection {
    pub listen_addr: String,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
    pub eviction_grace_ms: u64,
    pub queue_window_ms: u64,
    pub task_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7450".to_string(),
            heartbeat_interval_ms: 10_000,
            missed_heartbeats: 3,
            eviction_grace_ms: 10_000,
            queue_window_ms: 5_000,
            task_timeout_ms: 120_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl RouterSection {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            listen_addr: self.listen_addr.clone(),
            heartbeat_interval: ms(self.heartbeat_interval_ms),
            missed_heartbeats: self.missed_heartbeats,
            eviction_grace: ms(self.eviction_grace_ms),
            queue_window: ms(self.queue_window_ms),
            task_timeout: ms(self.task_timeout_ms),
            sweep_interval: ms(self.sweep_interval_ms.max(1)),
            ..RouterConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectorSection {
    /// Router address agents connect to.
    pub router_addr: String,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub registration_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub backoff: BackoffSection,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        Self {
            router_addr: "127.0.0.1:7450".to_string(),
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 10_000,
            registration_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            backoff: BackoffSection::default(),
        }
    }
}

impl ConnectorSection {
    /// Connector settings for an agent with the given identity.
    pub fn to_connector_config(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
    ) -> ConnectorConfig {
        let registration = RegistrationConfig::new(agent_id, agent_type)
            .with_capabilities(capabilities)
            .with_timeout(ms(self.registration_timeout_ms));
        let mut config = ConnectorConfig::new(registration);
        config.heartbeat_interval = ms(self.heartbeat_interval_ms);
        config.shutdown_grace = ms(self.shutdown_grace_ms);
        config.backoff = self.backoff.to_backoff_config();
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffSection {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// Unset retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.1,
            max_attempts: None,
        }
    }
}

impl BackoffSection {
    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: ms(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: ms(self.max_delay_ms),
            jitter: self.jitter,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorSection {
    pub agent_id: String,
    pub max_concurrent_workflows: usize,
    pub queue_capacity: usize,
    pub stage_timeout_ms: u64,
    pub max_retained_workflows: usize,
    /// Overrides keyed by stage name, e.g. `[orchestrator.stages.literature_review]`.
    pub stages: BTreeMap<String, StageSection>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            agent_id: "orchestrator-1".to_string(),
            max_concurrent_workflows: 8,
            queue_capacity: 1024,
            stage_timeout_ms: 120_000,
            max_retained_workflows: 1024,
            stages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSection {
    pub agent_type: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn stage_named(name: &str) -> Option<Stage> {
    Stage::PIPELINE
        .into_iter()
        .find(|stage| stage.as_str().eq_ignore_ascii_case(name))
}

impl OrchestratorSection {
    pub fn to_orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let mut config = OrchestratorConfig {
            max_concurrent_workflows: self.max_concurrent_workflows,
            queue_capacity: self.queue_capacity,
            stage_timeout: ms(self.stage_timeout_ms),
            max_retained_workflows: self.max_retained_workflows,
            ..OrchestratorConfig::default()
        };
        for (name, section) in &self.stages {
            let Some(stage) = stage_named(name) else {
                bail!("unknown workflow stage '{}' in [orchestrator.stages]", name);
            };
            let mut target = StageTarget::new(&section.agent_type, &section.action);
            target.timeout = section.timeout_ms.map(ms);
            config.stages.insert(stage, target);
        }
        Ok(config)
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load `explicit` if given, else the default path if it exists, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `$XDG_CONFIG_HOME/convoke/convoke.toml`, falling back to the platform config dir.
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(dirs::config_dir)?;
        Some(base.join("convoke").join(CONFIG_FILE))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = Config::default();
        assert_eq!(config.router.to_router_config(), RouterConfig::default());
        let backoff = config.connector.backoff.to_backoff_config();
        assert_eq!(backoff.base_delay, BackoffConfig::default().base_delay);
        assert_eq!(backoff.max_delay, BackoffConfig::default().max_delay);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[router]
listen_addr = "0.0.0.0:9000"
queue_window_ms = 250

[connector.backoff]
max_delay_ms = 1000
max_attempts = 4
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.router.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.router.missed_heartbeats, 3);
        let router = config.router.to_router_config();
        assert_eq!(router.queue_window, Duration::from_millis(250));

        let backoff = config.connector.backoff.to_backoff_config();
        assert_eq!(backoff.max_delay, Duration::from_secs(1));
        assert_eq!(backoff.max_attempts, Some(4));
        assert_eq!(backoff.base_delay, Duration::from_millis(500));
        assert_eq!(config.orchestrator.agent_id, "orchestrator-1");
    }

    #[test]
    fn test_stage_overrides() {
        let config: Config = toml::from_str(
            r#"
[orchestrator]
max_concurrent_workflows = 2
max_retained_workflows = 16

[orchestrator.stages.literature_review]
agent_type = "scholar"
action = "search"
timeout_ms = 2000
"#,
        )
        .unwrap();

        let orch = config.orchestrator.to_orchestrator_config().unwrap();
        assert_eq!(orch.max_concurrent_workflows, 2);
        assert_eq!(orch.max_retained_workflows, 16);
        let lit = orch.target(Stage::LiteratureReview).unwrap();
        assert_eq!(lit.agent_type, "scholar");
        assert_eq!(orch.timeout_for(Stage::LiteratureReview), Duration::from_secs(2));
        assert_eq!(orch.target(Stage::Planning).unwrap().action, "plan");
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[orchestrator.stages.peer_review]
agent_type = "reviewer"
action = "review"
"#,
        )
        .unwrap();
        let err = config.orchestrator.to_orchestrator_config().unwrap_err();
        assert!(err.to_string().contains("peer_review"));
    }

    #[test]
    fn test_connector_config_from_section() {
        let section = ConnectorSection {
            heartbeat_interval_ms: 250,
            ..ConnectorSection::default()
        };
        let config = section.to_connector_config("lit-1", "literature", vec!["review".into()]);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.registration.agent_id, "lit-1");
        assert_eq!(config.registration.capabilities, vec!["review"]);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
