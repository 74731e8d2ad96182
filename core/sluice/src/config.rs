//! Agent-level configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of the collection agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentConfig {
    /// Directory where input checkpoints are persisted across restarts.
    pub checkpoint_dir: PathBuf,

    /// Emit one final self-metrics collection round before shutting down.
    pub force_self_collect: bool,

    /// How long a pipeline's stop procedure may run before the pipeline is
    /// quarantined and the agent moves on.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            force_self_collect: false,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AgentConfig;
    use std::time::Duration;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config: AgentConfig = toml::from_str("force_self_collect = true").unwrap();
        assert!(config.force_self_collect);
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
    }

    #[test]
    fn durations_parse_from_humantime_strings() {
        let config: AgentConfig = toml::from_str(r#"stop_timeout = "250ms""#).unwrap();
        assert_eq!(config.stop_timeout, Duration::from_millis(250));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<AgentConfig>("no_such_key = 1").is_err());
    }
}
