use crate::error::ConfigError;
use crate::storage::RecordSinkConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings for one collection's drop.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DropConfig {
    pub phases: PhaseDefaults,
    pub submission: SubmissionConfig,
    pub fees: FeePolicyConfig,
    pub backoff: BackoffConfig,
    pub records: RecordSinkConfig,
}

impl DropConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.phases.validate()?;
        self.submission.validate()?;
        self.fees.validate()?;
        self.backoff.validate()?;
        if self.records.channel_capacity == 0 || self.records.batch_size == 0 {
            return Err(invalid("records", "channel_capacity and batch_size must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDefaults {
    /// Supply used when a collection is opened for the first time.
    pub total_supply: u64,
    /// Window length given to a newly enabled phase.
    pub default_duration_secs: u64,
    /// Shortest window the clamp allows.
    pub min_duration_secs: u64,
    pub event_capacity: usize,
}

impl Default for PhaseDefaults {
    fn default() -> Self {
        Self {
            total_supply: 10_000,
            default_duration_secs: 86_400,
            min_duration_secs: 60,
            event_capacity: 64,
        }
    }
}

impl PhaseDefaults {
    pub fn default_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_duration_secs as i64)
    }

    pub fn min_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_duration_secs as i64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_duration_secs == 0 {
            return Err(invalid("phases.min_duration_secs", "must be > 0"));
        }
        if self.default_duration_secs < self.min_duration_secs {
            return Err(invalid(
                "phases.default_duration_secs",
                "must be >= phases.min_duration_secs",
            ));
        }
        if self.event_capacity == 0 {
            return Err(invalid("phases.event_capacity", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub max_attempts: u32,
    pub confirmations: u64,
    pub fee_timeout_ms: u64,
    pub confirmation_timeout_ms: u64,
    /// Completed requests between two fee tuning cycles.
    pub tuning_window: u32,
    pub public_mint_signature: String,
    pub gated_mint_signature: String,
    pub event_capacity: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confirmations: 1,
            fee_timeout_ms: 10_000,
            confirmation_timeout_ms: 60_000,
            tuning_window: 20,
            public_mint_signature: "mint(uint256)".to_string(),
            gated_mint_signature: "whitelistMint(uint256,bytes32[])".to_string(),
            event_capacity: 256,
        }
    }
}

impl SubmissionConfig {
    pub fn fee_timeout(&self) -> Duration {
        Duration::from_millis(self.fee_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("submission.max_attempts", "must be >= 1"));
        }
        if self.fee_timeout_ms == 0 || self.confirmation_timeout_ms == 0 {
            return Err(invalid("submission", "timeouts must be > 0"));
        }
        if self.tuning_window == 0 {
            return Err(invalid("submission.tuning_window", "must be >= 1"));
        }
        for (field, signature) in [
            ("submission.public_mint_signature", &self.public_mint_signature),
            ("submission.gated_mint_signature", &self.gated_mint_signature),
        ] {
            if !(signature.contains('(') && signature.ends_with(')')) {
                return Err(invalid(field, "expected a signature like 'mint(uint256)'"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicyConfig {
    /// Hard cap for both fee fields, in gwei.
    pub max_gwei: u64,
    pub initial_multiplier: f64,
    /// Samples a cycle needs before the baseline may be lowered.
    pub min_samples: u64,
}

impl Default for FeePolicyConfig {
    fn default() -> Self {
        Self {
            max_gwei: 500,
            initial_multiplier: 1.0,
            min_samples: 10,
        }
    }
}

impl FeePolicyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_gwei == 0 {
            return Err(invalid("fees.max_gwei", "must be > 0"));
        }
        if !(0.5..=3.0).contains(&self.initial_multiplier) {
            return Err(invalid("fees.initial_multiplier", "must be within [0.5, 3.0]"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("backoff.max_delay_ms", "must be >= backoff.base_delay_ms"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
