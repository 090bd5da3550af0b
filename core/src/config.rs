//! Environment configuration (spec.md §6 "Environment configuration")
//!
//! Replaces the teacher's LLM-profile/provider configuration (out of scope
//! for this system) with the fixed set of environment options the core
//! contract pins. Layered the same way the teacher layers `config::Config`
//! over defaults, but sourced purely from the environment — there is no
//! profile/provider concept here.

use crate::error::{Result, StewardError};
use std::path::PathBuf;
use std::time::Duration;

/// Quiet hours window, as local wall-clock hours `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl QuietHours {
    /// True if `hour` (0-23) falls within the quiet window. Handles windows
    /// that wrap past midnight (e.g. 22 -> 6).
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Process-wide environment configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Root directory for the persisted state layout (spec.md §6). Required.
    pub data_root: PathBuf,
    pub bind_host: String,
    pub api_port: u16,
    pub heartbeat_interval: Duration,
    pub bus_queue_size: usize,
    pub cost_auto_cap: f64,
    pub cost_confirm_cap: f64,
    pub quiet_hours: QuietHours,
    pub backup_retention_days: u32,
}

impl EnvConfig {
    /// Load from the process environment, validating every value.
    /// `DATA_ROOT` is required; every other option has a documented default.
    pub fn from_env() -> Result<Self> {
        Self::from_map(&std::env::vars().collect())
    }

    /// Testable variant that takes an explicit environment map instead of
    /// reading the real process environment.
    pub fn from_map(vars: &std::collections::HashMap<String, String>) -> Result<Self> {
        let data_root = vars
            .get("DATA_ROOT")
            .map(PathBuf::from)
            .ok_or_else(|| StewardError::MissingConfig {
                key: "DATA_ROOT".to_string(),
            })?;

        let bind_host = vars
            .get("BIND_HOST")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let api_port = parse_or_default(vars, "API_PORT", 8787)?;
        let heartbeat_secs: u64 = parse_or_default(vars, "HEARTBEAT_INTERVAL", 5)?;
        let bus_queue_size = parse_or_default(vars, "BUS_QUEUE_SIZE", 1024)?;
        let cost_auto_cap = parse_or_default(vars, "COST_AUTO_CAP", 1.0)?;
        let cost_confirm_cap = parse_or_default(vars, "COST_CONFIRM_CAP", 25.0)?;
        let quiet_start = parse_or_default(vars, "QUIET_HOURS_START", 22)?;
        let quiet_end = parse_or_default(vars, "QUIET_HOURS_END", 7)?;
        let backup_retention_days = parse_or_default(vars, "BACKUP_RETENTION_DAYS", 7)?;

        if quiet_start > 23 || quiet_end > 23 {
            return Err(StewardError::InvalidConfig {
                message: "quiet hours must be 0-23".to_string(),
            });
        }
        if cost_auto_cap < 0.0 || cost_confirm_cap < cost_auto_cap {
            return Err(StewardError::InvalidConfig {
                message: "COST_CONFIRM_CAP must be >= COST_AUTO_CAP >= 0".to_string(),
            });
        }

        Ok(Self {
            data_root,
            bind_host,
            api_port,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            bus_queue_size,
            cost_auto_cap,
            cost_confirm_cap,
            quiet_hours: QuietHours {
                start_hour: quiet_start,
                end_hour: quiet_end,
            },
            backup_retention_days,
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_root.join("events.ndjson")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_root.join("audit.ndjson")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }

    pub fn policy_snapshot_path(&self) -> PathBuf {
        self.data_root.join("policy_snapshot.json")
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.data_root.join("entities")
    }
}

fn parse_or_default<T>(
    vars: &std::collections::HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T: std::str::FromStr,
{
    match vars.get(key) {
        Some(raw) => raw.parse::<T>().map_err(|_| StewardError::InvalidConfig {
            message: format!("{key} has an invalid value: {raw}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn requires_data_root() {
        let err = EnvConfig::from_map(&map(&[])).unwrap_err();
        assert!(matches!(err, StewardError::MissingConfig { .. }));
    }

    #[test]
    fn applies_defaults() {
        let cfg = EnvConfig::from_map(&map(&[("DATA_ROOT", "/tmp/steward")])).unwrap();
        assert_eq!(cfg.api_port, 8787);
        assert_eq!(cfg.bus_queue_size, 1024);
        assert_eq!(cfg.backup_retention_days, 7);
    }

    #[test]
    fn rejects_inverted_cost_caps() {
        let err = EnvConfig::from_map(&map(&[
            ("DATA_ROOT", "/tmp/steward"),
            ("COST_AUTO_CAP", "10"),
            ("COST_CONFIRM_CAP", "1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, StewardError::InvalidConfig { .. }));
    }

    #[test]
    fn quiet_hours_wraps_midnight() {
        let q = QuietHours {
            start_hour: 22,
            end_hour: 7,
        };
        assert!(q.contains(23));
        assert!(q.contains(2));
        assert!(!q.contains(12));
    }
}
