use std::env;
use std::time::Duration;

use chrono::FixedOffset;

/// What to do when the external reserve call reports the slot gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Terminate the session; the user restarts from a notification
    #[default]
    Terminate,
    /// Send the session back to slot selection, keeping the queue entry
    ReturnToSelection,
}

/// Engine configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between check cycles (default: 120 seconds)
    pub check_interval: Duration,

    /// How long a derived token is assumed valid (default: 5 minutes)
    pub token_validity: Duration,

    /// Token age at which a refresh is forced (default: 4.5 minutes)
    pub token_refresh_margin: Duration,

    /// How long a queue entry suppresses notifications (default: 10 minutes)
    pub queue_timeout: Duration,

    /// Booking session inactivity timeout (default: 10 minutes)
    pub session_timeout: Duration,

    /// Consecutive failed cycles before an operator alert (default: 5)
    pub health_alert_threshold: u32,

    /// Workers in the proof-of-work pool (default: 2)
    pub pow_workers: usize,

    /// Reservation-conflict handling at the confirm step
    pub conflict_policy: ConflictPolicy,

    /// UTC offset used to render slot times to users (default: +02:00)
    pub slot_display_offset: FixedOffset,

    /// How many open days get a time-slot fetch per group (default: 5)
    pub max_slot_days: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(120),
            token_validity: Duration::from_secs(300),
            token_refresh_margin: Duration::from_secs(270),
            queue_timeout: Duration::from_secs(600),
            session_timeout: Duration::from_secs(600),
            health_alert_threshold: 5,
            pow_workers: 2,
            conflict_policy: ConflictPolicy::default(),
            slot_display_offset: FixedOffset::east_opt(2 * 3600).unwrap(),
            max_slot_days: 5,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable held a value that could not be parsed or is out of range
    #[error("invalid value for {key}: {value}")]
    Invalid {
        /// Environment variable name
        key: String,
        /// Offending value
        value: String,
    },
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let check_interval = secs(&lookup, "CHECK_INTERVAL_SECS", defaults.check_interval)?;
        if !(5..=600).contains(&check_interval.as_secs()) {
            return Err(ConfigError::Invalid {
                key: "CHECK_INTERVAL_SECS".to_string(),
                value: check_interval.as_secs().to_string(),
            });
        }

        let conflict_policy = match lookup("CONFLICT_POLICY") {
            None => defaults.conflict_policy,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "terminate" => ConflictPolicy::Terminate,
                "reselect" => ConflictPolicy::ReturnToSelection,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "CONFLICT_POLICY".to_string(),
                        value: v,
                    });
                }
            },
        };

        let offset_minutes = int(
            &lookup,
            "SLOT_DISPLAY_UTC_OFFSET_MINUTES",
            i64::from(defaults.slot_display_offset.local_minus_utc()) / 60,
        )?;
        let slot_display_offset = i32::try_from(offset_minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::Invalid {
                key: "SLOT_DISPLAY_UTC_OFFSET_MINUTES".to_string(),
                value: offset_minutes.to_string(),
            })?;

        Ok(Self {
            check_interval,
            token_validity: secs(&lookup, "TOKEN_VALIDITY_SECS", defaults.token_validity)?,
            token_refresh_margin: secs(
                &lookup,
                "TOKEN_REFRESH_MARGIN_SECS",
                defaults.token_refresh_margin,
            )?,
            queue_timeout: secs(&lookup, "QUEUE_TIMEOUT_SECS", defaults.queue_timeout)?,
            session_timeout: secs(&lookup, "SESSION_TIMEOUT_SECS", defaults.session_timeout)?,
            health_alert_threshold: int(
                &lookup,
                "HEALTH_ALERT_THRESHOLD",
                i64::from(defaults.health_alert_threshold),
            )?
            .try_into()
            .map_err(|_| ConfigError::Invalid {
                key: "HEALTH_ALERT_THRESHOLD".to_string(),
                value: "negative".to_string(),
            })?,
            pow_workers: int(&lookup, "POW_WORKERS", defaults.pow_workers as i64)?
                .try_into()
                .map_err(|_| ConfigError::Invalid {
                    key: "POW_WORKERS".to_string(),
                    value: "negative".to_string(),
                })?,
            conflict_policy,
            slot_display_offset,
            max_slot_days: defaults.max_slot_days,
        })
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: v,
            }),
    }
}

fn int(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
) -> Result<i64, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(v) => v.parse::<i64>().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: v,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_are_the_documented_values() {
        let config = config_from(&[]).expect("defaults");
        assert_eq!(config.check_interval, Duration::from_secs(120));
        assert_eq!(config.token_refresh_margin, Duration::from_secs(270));
        assert_eq!(config.queue_timeout, Duration::from_secs(600));
        assert_eq!(config.session_timeout, Duration::from_secs(600));
        assert_eq!(config.health_alert_threshold, 5);
        assert_eq!(config.pow_workers, 2);
        assert_eq!(config.conflict_policy, ConflictPolicy::Terminate);
    }

    #[test]
    fn check_interval_outside_bounds_is_rejected() {
        assert!(config_from(&[("CHECK_INTERVAL_SECS", "3")]).is_err());
        assert!(config_from(&[("CHECK_INTERVAL_SECS", "601")]).is_err());
        assert!(config_from(&[("CHECK_INTERVAL_SECS", "60")]).is_ok());
    }

    #[test]
    fn conflict_policy_parses() {
        let config = config_from(&[("CONFLICT_POLICY", "reselect")]).expect("config");
        assert_eq!(config.conflict_policy, ConflictPolicy::ReturnToSelection);
        assert!(config_from(&[("CONFLICT_POLICY", "retry")]).is_err());
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        assert!(config_from(&[("TOKEN_VALIDITY_SECS", "soon")]).is_err());
    }
}
