//! Scheduler tuning knobs.
//!
//! Every field has a default so a partial `[scheduler]` table is valid.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Quiet period that coalesces rapid user sends into one task.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Maximum consecutive simulated messages between two user messages.
    #[serde(default = "default_turn_limit")]
    pub turn_limit: u32,
    /// Probability that a request asks the service for a reaction.
    #[serde(default = "default_react_probability")]
    pub react_probability: f64,
    #[serde(default = "default_reaction_delay_ms")]
    pub reaction_delay_ms: u64,
    /// Typing latency base for a direct reply to the user.
    #[serde(default = "default_direct_typing_base_ms")]
    pub direct_typing_base_ms: u64,
    /// Typing latency base for multi-party chatter between recipients.
    #[serde(default = "default_organic_typing_base_ms")]
    pub organic_typing_base_ms: u64,
    /// Upper bound of the random extra added to either typing base.
    #[serde(default = "default_typing_jitter_ms")]
    pub typing_jitter_ms: u64,
    #[serde(default = "default_continuation_delay_ms")]
    pub continuation_delay_ms: u64,
    #[serde(default = "default_wrap_up_delay_ms")]
    pub wrap_up_delay_ms: u64,
    #[serde(default = "default_lane_ttl_secs")]
    pub lane_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Content of the terminal system message emitted after a wrap-up turn.
    #[serde(default = "default_silenced_message")]
    pub silenced_message: String,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_turn_limit() -> u32 {
    5
}

fn default_react_probability() -> f64 {
    0.25
}

fn default_reaction_delay_ms() -> u64 {
    3_000
}

fn default_direct_typing_base_ms() -> u64 {
    4_000
}

fn default_organic_typing_base_ms() -> u64 {
    7_000
}

fn default_typing_jitter_ms() -> u64 {
    2_000
}

fn default_continuation_delay_ms() -> u64 {
    1_500
}

fn default_wrap_up_delay_ms() -> u64 {
    2_000
}

fn default_lane_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    30 * 60
}

fn default_silenced_message() -> String {
    "Notifications silenced".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            turn_limit: default_turn_limit(),
            react_probability: default_react_probability(),
            reaction_delay_ms: default_reaction_delay_ms(),
            direct_typing_base_ms: default_direct_typing_base_ms(),
            organic_typing_base_ms: default_organic_typing_base_ms(),
            typing_jitter_ms: default_typing_jitter_ms(),
            continuation_delay_ms: default_continuation_delay_ms(),
            wrap_up_delay_ms: default_wrap_up_delay_ms(),
            lane_ttl_secs: default_lane_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            silenced_message: default_silenced_message(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.turn_limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "turn_limit must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.react_probability) {
            return Err(SchedulerError::InvalidConfig(format!(
                "react_probability must be within [0, 1], got {}",
                self.react_probability
            )));
        }
        if self.lane_ttl_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "lane_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if self.silenced_message.trim().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "silenced_message must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reaction_delay(&self) -> Duration {
        Duration::from_millis(self.reaction_delay_ms)
    }

    pub fn continuation_delay(&self) -> Duration {
        Duration::from_millis(self.continuation_delay_ms)
    }

    pub fn wrap_up_delay(&self) -> Duration {
        Duration::from_millis(self.wrap_up_delay_ms)
    }

    pub fn lane_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lane_ttl_secs.min(i64::MAX as u64) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = SchedulerConfig::default();
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.debounce(), Duration::from_millis(500));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1800));
        assert_eq!(cfg.lane_ttl(), chrono::Duration::hours(24));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cfg = SchedulerConfig {
            turn_limit: 0,
            ..SchedulerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SchedulerConfig {
            react_probability: 1.5,
            ..SchedulerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SchedulerConfig {
            sweep_interval_secs: 0,
            ..SchedulerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
