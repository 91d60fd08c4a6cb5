//! The one-way subject/monitor pair of a remote lease agent and its negotiated durations.

use crate::{
    config::{DurationConfig, DurationType},
    time::{add_duration, Instance, DURATION_MAX, INFINITE},
};
use std::fmt;

/// State of one half of a lease relationship. Ordered so that `>= Expired` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OneWayState {
    Inactive,
    Active,
    Expired,
    Failed,
}

impl fmt::Display for OneWayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OneWayState::Inactive => "inactive",
            OneWayState::Active => "active",
            OneWayState::Expired => "expired",
            OneWayState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Durations carried by one lease request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseDurations {
    pub duration: i32,
    pub suspend: i32,
    pub arbitration: i32,
}

impl LeaseDurations {
    pub const UNSET: LeaseDurations = LeaseDurations {
        duration: DURATION_MAX,
        suspend: DURATION_MAX,
        arbitration: DURATION_MAX,
    };

    pub fn from_config(config: &DurationConfig, duration_type: DurationType) -> Self {
        Self {
            duration: config.lease_duration_for(duration_type),
            suspend: config.lease_suspend_duration,
            arbitration: config.arbitration_duration,
        }
    }

    pub fn any_unset(&self) -> bool {
        self.duration == DURATION_MAX
            || self.suspend == DURATION_MAX
            || self.arbitration == DURATION_MAX
    }
}

#[derive(Debug, Clone)]
pub struct LeaseRelationship {
    pub subject_state: OneWayState,
    pub monitor_state: OneWayState,
    pub subject_identifier: Instance,
    pub monitor_identifier: Instance,

    pub subject_expire_time: i64,
    pub subject_suspend_time: i64,
    pub subject_fail_time: i64,
    pub monitor_expire_time: i64,

    /// Durations this side currently runs the relationship with.
    pub durations: LeaseDurations,
    /// Durations most recently requested by the peer.
    pub remote_durations: LeaseDurations,
    pub is_duration_updated: bool,
    pub establish_duration_type: DurationType,

    pub renew_retry_count: i32,
    pub is_renew_retry: bool,
    pub indirect_lease_count: i32,
    pub lease_message_sent: bool,
}

impl Default for LeaseRelationship {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseRelationship {
    pub fn new() -> Self {
        Self {
            subject_state: OneWayState::Inactive,
            monitor_state: OneWayState::Inactive,
            subject_identifier: Instance::NONE,
            monitor_identifier: Instance::NONE,
            subject_expire_time: INFINITE,
            subject_suspend_time: INFINITE,
            subject_fail_time: INFINITE,
            monitor_expire_time: INFINITE,
            durations: LeaseDurations::UNSET,
            remote_durations: LeaseDurations::UNSET,
            is_duration_updated: false,
            establish_duration_type: DurationType::Regular,
            renew_retry_count: 0,
            is_renew_retry: false,
            indirect_lease_count: 0,
            lease_message_sent: false,
        }
    }

    /// Sets the subject expiration together with the derived suspend and fail deadlines.
    pub fn set_subject_expire_time(&mut self, expiration: i64, suspend: i32, arbitration: i32) {
        if expiration == INFINITE {
            self.subject_expire_time = INFINITE;
            self.subject_suspend_time = INFINITE;
            self.subject_fail_time = INFINITE;
            return;
        }
        self.subject_expire_time = expiration;
        self.subject_suspend_time = add_duration(expiration, suspend);
        self.subject_fail_time = add_duration(expiration, arbitration);
    }

    /// Installs negotiated durations; a set containing the unset sentinel is ignored.
    pub fn set_durations(&mut self, durations: LeaseDurations) {
        if durations.any_unset() {
            return;
        }
        self.durations = durations;
    }

    /// Durations to propose in the next request.
    ///
    /// Fresh subjects and administrative updates use the configured values. Otherwise each field
    /// is the larger of the configured value and what the peer last asked for, so an agreed
    /// duration never shrinks.
    pub fn durations_for_request(&mut self, config: &DurationConfig) -> LeaseDurations {
        let configured = LeaseDurations::from_config(config, self.establish_duration_type);
        let proposed = if self.is_duration_updated || self.subject_state == OneWayState::Inactive {
            self.is_duration_updated = false;
            configured
        } else {
            LeaseDurations {
                duration: larger_of(self.remote_durations.duration, configured.duration),
                suspend: larger_of(self.remote_durations.suspend, configured.suspend),
                arbitration: larger_of(self.remote_durations.arbitration, configured.arbitration),
            }
        };
        if proposed != self.durations {
            self.set_durations(proposed);
        }
        proposed
    }

    /// Monitor side of negotiation: records what the peer asked for and raises each field to
    /// the configured value, pushing the expiration out by however much the duration grew.
    pub fn grant_larger_durations(
        &mut self,
        config: &DurationConfig,
        requested: &mut LeaseDurations,
        expiration: &mut i64,
    ) {
        if requested.any_unset() {
            return;
        }
        if *requested != self.durations {
            self.remote_durations = *requested;
        }
        let configured = LeaseDurations::from_config(config, self.establish_duration_type);
        if configured.duration > requested.duration {
            if *expiration != INFINITE {
                *expiration += i64::from(configured.duration - requested.duration);
            }
            requested.duration = configured.duration;
        }
        requested.suspend = requested.suspend.max(configured.suspend);
        requested.arbitration = requested.arbitration.max(configured.arbitration);
    }

    /// Remembers the durations the peer granted so renewals never propose less.
    pub fn record_granted_durations(&mut self, granted: LeaseDurations) {
        if granted.any_unset() {
            return;
        }
        self.remote_durations = granted;
        self.set_durations(granted);
    }

    pub fn is_two_way_active(&self) -> bool {
        self.subject_state == OneWayState::Active && self.monitor_state == OneWayState::Active
    }
}

fn larger_of(remote: i32, configured: i32) -> i32 {
    if remote != DURATION_MAX && remote > configured {
        remote
    } else {
        configured
    }
}
