use ibft_common::{round_timeout, IbftError, IbftResult, ProposerPolicy, RetainWindow};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for round 0 of every sequence, in milliseconds
    pub request_timeout_ms: u64,

    /// Base of the exponential backoff added to later rounds, in milliseconds
    pub round_backoff_ms: u64,

    /// Cap on the backoff exponent
    pub max_backoff_exponent: u32,

    /// Proposer rotation
    pub proposer_policy: ProposerPolicy,

    /// Future messages buffered per sender
    pub backlog_capacity: usize,

    /// Online proof retention
    pub online_proofs: OnlineProofConfig,
}

/// When stale online proofs are removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneTrigger {
    /// After each finalized sequence
    Finalize,

    /// On a fixed interval, relative to the current sequence
    Interval,
}

/// Online proof retention settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineProofConfig {
    pub prune_trigger: PruneTrigger,

    /// Sequences kept below the horizon
    pub retain_sequences: u64,

    /// Period of the interval pruner, in milliseconds
    pub prune_interval_ms: u64,
}

impl EngineConfig {
    /// Load configuration from an optional file, then `IBFT_*` environment variables
    pub fn load(path: Option<&Path>) -> IbftResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("IBFT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| IbftError::Config(format!("Failed to load engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> IbftResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(IbftError::Config("Request timeout must be greater than 0".to_string()));
        }

        if self.backlog_capacity == 0 {
            return Err(IbftError::Config("Backlog capacity must be greater than 0".to_string()));
        }

        if self.max_backoff_exponent > 31 {
            return Err(IbftError::Config("Backoff exponent cannot exceed 31".to_string()));
        }

        if self.online_proofs.prune_trigger == PruneTrigger::Interval && self.online_proofs.prune_interval_ms == 0 {
            return Err(IbftError::Config("Prune interval must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Deadline for `round`
    pub fn round_timeout(&self, round: u64) -> Duration {
        round_timeout(
            self.request_timeout(),
            Duration::from_millis(self.round_backoff_ms),
            round,
            self.max_backoff_exponent,
        )
    }

    pub fn prune_strategy(&self) -> RetainWindow {
        RetainWindow::new(self.online_proofs.retain_sequences)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.online_proofs.prune_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            round_backoff_ms: 1_000,
            max_backoff_exponent: 10,
            proposer_policy: ProposerPolicy::RoundRobin,
            backlog_capacity: 1024,
            online_proofs: OnlineProofConfig::default(),
        }
    }
}

impl Default for OnlineProofConfig {
    fn default() -> Self {
        Self {
            prune_trigger: PruneTrigger::Finalize,
            retain_sequences: 8,
            prune_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.round_timeout(0), Duration::from_secs(10));
        assert_eq!(config.round_timeout(2), Duration::from_secs(14));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig { request_timeout_ms: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(IbftError::Config(_))));

        let config = EngineConfig {
            online_proofs: OnlineProofConfig {
                prune_trigger: PruneTrigger::Interval,
                prune_interval_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
request_timeout_ms = 2500
proposer_policy = "sticky"

[online_proofs]
prune_trigger = "interval"
retain_sequences = 3
"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.request_timeout_ms, 2500);
        assert_eq!(config.proposer_policy, ProposerPolicy::Sticky);
        assert_eq!(config.online_proofs.prune_trigger, PruneTrigger::Interval);
        assert_eq!(config.online_proofs.retain_sequences, 3);
        assert_eq!(config.online_proofs.prune_interval_ms, 1_000);
        assert_eq!(config.backlog_capacity, 1024);
    }

    #[test]
    fn test_load_from_environment() {
        std::env::set_var("IBFT_ROUND_BACKOFF_MS", "250");
        std::env::set_var("IBFT_MAX_BACKOFF_EXPONENT", "4");
        let loaded = EngineConfig::load(None);
        std::env::remove_var("IBFT_ROUND_BACKOFF_MS");
        std::env::remove_var("IBFT_MAX_BACKOFF_EXPONENT");

        let config = loaded.unwrap();
        assert_eq!(config.round_backoff_ms, 250);
        assert_eq!(config.max_backoff_exponent, 4);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "request_timeout_ms = 0").unwrap();
        assert!(EngineConfig::load(Some(file.path())).is_err());
    }
}
