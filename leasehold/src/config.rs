//! Duration, engine and security configuration.
//!
//! Engine configuration is loaded from JSON files; every loader validates
//! before handing the value out.

use crate::{time::DURATION_MAX, Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PROTOCOL_MAJOR_VERSION: u8 = 2;
pub const PROTOCOL_MINOR_VERSION: u8 = 1;

/// Which configured duration an establish request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurationType {
    #[default]
    Regular,
    AcrossFaultDomain,
}

/// Per-agent lease timing configuration, all values in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationConfig {
    #[serde(default = "default_lease_duration")]
    pub lease_duration: i32,

    #[serde(default = "default_lease_duration")]
    pub lease_duration_across_fault_domain: i32,

    #[serde(default = "default_lease_suspend_duration")]
    pub lease_suspend_duration: i32,

    #[serde(default = "default_arbitration_duration")]
    pub arbitration_duration: i32,

    /// Upper bound on how long a relationship may survive on forwarded renewals alone.
    #[serde(default)]
    pub max_indirect_lease_timeout: i32,

    /// Heartbeat silence after which the host is declared unresponsive. Zero disables.
    #[serde(default)]
    pub unresponsive_duration: i32,

    #[serde(default = "default_lease_retry_count")]
    pub lease_retry_count: i32,

    /// Renewal starts after `duration / lease_renew_begin_ratio` has elapsed.
    #[serde(default = "default_lease_renew_begin_ratio")]
    pub lease_renew_begin_ratio: i32,

    /// TTLs below this raise a warning when handed to an application.
    #[serde(default = "default_app_expiry_timeout")]
    pub app_expiry_timeout: i32,
}

impl Default for DurationConfig {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            lease_duration_across_fault_domain: default_lease_duration(),
            lease_suspend_duration: default_lease_suspend_duration(),
            arbitration_duration: default_arbitration_duration(),
            max_indirect_lease_timeout: 0,
            unresponsive_duration: 0,
            lease_retry_count: default_lease_retry_count(),
            lease_renew_begin_ratio: default_lease_renew_begin_ratio(),
            app_expiry_timeout: default_app_expiry_timeout(),
        }
    }
}

impl DurationConfig {
    pub fn with_lease_duration(mut self, duration: i32) -> Self {
        self.lease_duration = duration;
        self.lease_duration_across_fault_domain = duration;
        self
    }

    pub fn lease_duration_for(&self, duration_type: DurationType) -> i32 {
        match duration_type {
            DurationType::Regular => self.lease_duration,
            DurationType::AcrossFaultDomain => self.lease_duration_across_fault_domain,
        }
    }

    /// Number of consecutive forwarded renewals allowed before giving up on indirection.
    pub fn consecutive_indirect_lease_limit(&self) -> i32 {
        if self.lease_duration == 0 {
            0
        } else {
            self.max_indirect_lease_timeout / self.lease_duration
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_duration("lease_duration", self.lease_duration)?;
        check_duration(
            "lease_duration_across_fault_domain",
            self.lease_duration_across_fault_domain,
        )?;
        check_duration("lease_suspend_duration", self.lease_suspend_duration)?;
        check_duration("arbitration_duration", self.arbitration_duration)?;

        if self.max_indirect_lease_timeout < 0 {
            return Err(Error::InvalidDuration {
                name: "max_indirect_lease_timeout",
                value: self.max_indirect_lease_timeout,
            });
        }
        if self.unresponsive_duration < 0 {
            return Err(Error::InvalidDuration {
                name: "unresponsive_duration",
                value: self.unresponsive_duration,
            });
        }
        if self.lease_retry_count <= 0 {
            return Err(Error::InvalidParameter(format!(
                "lease_retry_count must be > 0, got {}",
                self.lease_retry_count
            )));
        }
        if self.lease_renew_begin_ratio <= 0 {
            return Err(Error::InvalidParameter(format!(
                "lease_renew_begin_ratio must be > 0, got {}",
                self.lease_renew_begin_ratio
            )));
        }
        Ok(())
    }
}

fn check_duration(name: &'static str, value: i32) -> Result<()> {
    if value <= 0 || value == DURATION_MAX {
        return Err(Error::InvalidDuration { name, value });
    }
    Ok(())
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Grace between a lease agent becoming fail-eligible and being failed.
    #[serde(default = "default_agent_fail_grace_ms")]
    pub agent_fail_grace_ms: i64,

    #[serde(default = "default_ping_retry_interval_ms")]
    pub ping_retry_interval_ms: i64,

    /// Lead time of the pre-arbitration liveness hint.
    #[serde(default = "default_pre_arbitration_ms")]
    pub pre_arbitration_ms: i64,

    /// How long a process that asserted may keep its unregistered applications before
    /// maintenance declares it hung.
    #[serde(default = "default_process_assert_exit_timeout_ms")]
    pub process_assert_exit_timeout_ms: i64,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_major")]
    pub protocol_major_version: u8,

    #[serde(default = "default_minor")]
    pub protocol_minor_version: u8,

    /// Durations applied to agents created from this configuration file.
    #[serde(default)]
    pub durations: DurationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: default_maintenance_interval_ms(),
            agent_fail_grace_ms: default_agent_fail_grace_ms(),
            ping_retry_interval_ms: default_ping_retry_interval_ms(),
            pre_arbitration_ms: default_pre_arbitration_ms(),
            process_assert_exit_timeout_ms: default_process_assert_exit_timeout_ms(),
            event_queue_capacity: default_event_queue_capacity(),
            protocol_major_version: PROTOCOL_MAJOR_VERSION,
            protocol_minor_version: PROTOCOL_MINOR_VERSION,
            durations: DurationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(content).with_context(|| "failed to parse config")?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval_ms == 0 {
            return Err(Error::Config("maintenance_interval_ms must be > 0".into()));
        }
        if self.agent_fail_grace_ms < 0 {
            return Err(Error::Config("agent_fail_grace_ms must be >= 0".into()));
        }
        if self.ping_retry_interval_ms <= 0 {
            return Err(Error::Config("ping_retry_interval_ms must be > 0".into()));
        }
        if self.process_assert_exit_timeout_ms <= 0 {
            return Err(Error::Config("process_assert_exit_timeout_ms must be > 0".into()));
        }
        if self.event_queue_capacity < 2 {
            return Err(Error::Config("event_queue_capacity must be >= 2".into()));
        }
        self.durations.validate()
    }
}

/// Security provider an agent's transport runs with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityProvider {
    #[default]
    None,
    Certificate {
        thumbprint: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub provider: SecurityProvider,
}

impl SecuritySettings {
    /// Two agents on one endpoint must agree on the provider kind.
    pub fn same_provider(&self, other: &SecuritySettings) -> bool {
        std::mem::discriminant(&self.provider) == std::mem::discriminant(&other.provider)
    }
}

fn default_lease_duration() -> i32 {
    30_000
}

fn default_lease_suspend_duration() -> i32 {
    2_000
}

fn default_arbitration_duration() -> i32 {
    30_000
}

fn default_lease_retry_count() -> i32 {
    5
}

fn default_lease_renew_begin_ratio() -> i32 {
    4
}

fn default_app_expiry_timeout() -> i32 {
    3_000
}

fn default_maintenance_interval_ms() -> u64 {
    15_000
}

fn default_agent_fail_grace_ms() -> i64 {
    14_000
}

fn default_ping_retry_interval_ms() -> i64 {
    10_000
}

fn default_pre_arbitration_ms() -> i64 {
    2_000
}

fn default_process_assert_exit_timeout_ms() -> i64 {
    300_000
}

fn default_event_queue_capacity() -> usize {
    16
}

fn default_major() -> u8 {
    PROTOCOL_MAJOR_VERSION
}

fn default_minor() -> u8 {
    PROTOCOL_MINOR_VERSION
}
