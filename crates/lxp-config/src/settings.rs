//! Typed worker settings.
//!
//! Recognized options, each with one effect:
//! - `WORKER_CONCURRENCY` (env, int >= 1; default 4) — worker pool size.
//! - `/worker/retry_delay_secs` (default 30 s) — minimum wall time between retries.
//! - `/worker/stale_running_secs` (default 30 min) — heartbeat expiry threshold.
//! - `/worker/max_attempts` (default 5) — attempts cap before a job is no
//!   longer runnable.
//! - `/worker/heartbeat_interval_secs` (default 30 s) — lease renewal tick.
//! - `/worker/tick_interval_secs` (default 1 s) — poll loop tick.
//! - `/worker/frozen_job_types` — job types parked as `paused` while the
//!   freeze gate is active.

use serde_json::Value;
use std::time::Duration;

use crate::{cfg_duration_secs, cfg_i64, ENV_WORKER_CONCURRENCY};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub retry_delay: Duration,
    pub stale_running: Duration,
    pub max_attempts: i32,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
    pub frozen_job_types: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_delay: Duration::from_secs(30),
            stale_running: Duration::from_secs(30 * 60),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            frozen_job_types: Vec::new(),
        }
    }
}

impl WorkerSettings {
    /// Build from merged config JSON, then apply env overrides.
    /// Nonsense values (zero, negative, unparsable) fall back to defaults.
    pub fn from_config(cfg: &Value) -> Self {
        let d = Self::default();

        let concurrency = cfg_i64(cfg, "/worker/concurrency")
            .filter(|n| *n >= 1)
            .map(|n| n as usize)
            .unwrap_or(d.concurrency);

        let mut out = Self {
            concurrency,
            retry_delay: cfg_duration_secs(cfg, "/worker/retry_delay_secs", d.retry_delay),
            stale_running: cfg_duration_secs(cfg, "/worker/stale_running_secs", d.stale_running),
            max_attempts: cfg_i64(cfg, "/worker/max_attempts")
                .filter(|n| *n >= 1)
                .map(|n| n as i32)
                .unwrap_or(d.max_attempts),
            heartbeat_interval: cfg_duration_secs(
                cfg,
                "/worker/heartbeat_interval_secs",
                d.heartbeat_interval,
            ),
            tick_interval: cfg_duration_secs(cfg, "/worker/tick_interval_secs", d.tick_interval),
            frozen_job_types: cfg
                .pointer("/worker/frozen_job_types")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default(),
        };

        if let Ok(raw) = std::env::var(ENV_WORKER_CONCURRENCY) {
            if let Ok(n) = raw.trim().parse::<usize>() {
                if n >= 1 {
                    out.concurrency = n;
                }
            }
        }

        out
    }

    /// Heartbeats must renew the lease well before it expires; otherwise a
    /// busy-but-alive worker gets its job reclaimed mid-run.
    pub fn heartbeat_bound_ok(&self) -> bool {
        self.heartbeat_interval < self.stale_running / 4
    }

    /// Log (never fail boot on) suspicious combinations.
    pub fn validate(&self) {
        if !self.heartbeat_bound_ok() {
            tracing::warn!(
                heartbeat_interval_secs = self.heartbeat_interval.as_secs(),
                stale_running_secs = self.stale_running.as_secs(),
                "heartbeat interval should be < stale_running / 4; running jobs may be reclaimed spuriously"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let d = WorkerSettings::default();
        assert_eq!(d.concurrency, 4);
        assert_eq!(d.retry_delay, Duration::from_secs(30));
        assert_eq!(d.stale_running, Duration::from_secs(1800));
        assert_eq!(d.max_attempts, 5);
        assert!(d.heartbeat_bound_ok());
    }

    #[test]
    fn config_values_override_defaults() {
        let cfg = json!({
            "worker": {
                "concurrency": 8,
                "retry_delay_secs": 5,
                "stale_running_secs": 600,
                "max_attempts": 2,
                "frozen_job_types": ["chat_respond", "reindex_content"]
            }
        });
        let s = WorkerSettings::from_config(&cfg);
        assert_eq!(s.concurrency, 8);
        assert_eq!(s.retry_delay, Duration::from_secs(5));
        assert_eq!(s.stale_running, Duration::from_secs(600));
        assert_eq!(s.max_attempts, 2);
        assert_eq!(
            s.frozen_job_types,
            vec!["chat_respond".to_string(), "reindex_content".to_string()]
        );
    }

    #[test]
    fn zero_and_negative_values_fall_back() {
        let cfg = json!({
            "worker": {"concurrency": 0, "max_attempts": -3, "retry_delay_secs": 0}
        });
        let s = WorkerSettings::from_config(&cfg);
        assert_eq!(s.concurrency, 4);
        assert_eq!(s.max_attempts, 5);
        assert_eq!(s.retry_delay, Duration::from_secs(30));
    }

    #[test]
    fn heartbeat_bound_detects_violation() {
        let s = WorkerSettings {
            heartbeat_interval: Duration::from_secs(600),
            stale_running: Duration::from_secs(900),
            ..Default::default()
        };
        assert!(!s.heartbeat_bound_ok());
    }
}
