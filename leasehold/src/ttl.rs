//! Time-to-live queries handed to leasing applications.

use crate::{
    agent::AgentInner,
    relationship::OneWayState,
    time::{remaining_ms, Instance, INFINITE},
    Error, Result,
};
use tracing::{debug, warn};

/// Remaining lease time toward one remote application, as seen from both halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteLeaseExpiration {
    pub monitor_ttl: i32,
    pub subject_ttl: i32,
}

impl AgentInner {
    /// TTL of `identifier`: how long the application may keep acting as alive.
    ///
    /// A `request_ttl <= 0` is a failure report and returns what is left of the last grant, so
    /// repeated reports never extend the lease. A positive request is answered with the smallest
    /// remaining subject suspend time across live relationships, capped at `request_ttl`, and
    /// latches the grant. With only monitor relationships the TTL is `i32::MAX`.
    pub(crate) fn application_ttl(&mut self, identifier: &str, request_ttl: i32) -> i32 {
        let AgentInner { ctx, rlas } = self;
        if ctx.is_failed() || ctx.is_in_delay_timer {
            return 0;
        }
        let now = ctx.now();
        let Some(app) = ctx.apps.get_mut(identifier) else {
            return 0;
        };
        if app.is_being_unregistered {
            return 0;
        }

        if request_ttl <= 0 {
            let last = app.last_grant_expire_time;
            return if last != INFINITE && last >= now {
                remaining_ms(last, now)
            } else {
                0
            };
        }

        let mut min = rlas
            .values()
            .filter(|rla| !rla.is_failed() && rla.subject_state() != OneWayState::Inactive)
            .map(|rla| rla.relationship.subject_suspend_time)
            .min()
            .unwrap_or(INFINITE);
        if min == INFINITE {
            return i32::MAX;
        }
        if app.global_lease_expire_time != INFINITE && app.global_lease_expire_time < min {
            min = app.global_lease_expire_time;
        }
        if now >= min {
            warn!(app = identifier, "lease already expired");
            return 0;
        }
        let ttl = remaining_ms(min, now).min(request_ttl);
        if ttl < app.expiry_timeout {
            warn!(app = identifier, ttl, expiry_timeout = app.expiry_timeout, "application TTL below expiry timeout");
        }
        let granted = now + i64::from(ttl);
        if app.last_grant_expire_time == INFINITE || granted > app.last_grant_expire_time {
            app.last_grant_expire_time = granted;
        }
        debug!(app = identifier, ttl, "application TTL granted");
        ttl
    }

    /// Largest subject and monitor TTLs `local_app` holds toward `remote_app`.
    pub(crate) fn remote_expiration(&self, app_instance: Instance, remote_app: &str) -> Result<RemoteLeaseExpiration> {
        let local_app = self.ctx.app_identifier(app_instance)?;
        let now = self.ctx.now();
        let mut found = false;
        let mut expiration = RemoteLeaseExpiration {
            monitor_ttl: -i32::MAX,
            subject_ttl: -i32::MAX,
        };
        for rla in self.rlas.values().filter(|rla| !rla.is_in_ping()) {
            let matches = rla
                .subject
                .keys()
                .any(|id| id.local_app == local_app && id.remote_app == remote_app);
            if !matches {
                continue;
            }
            found = true;
            let relationship = &rla.relationship;
            if relationship.subject_expire_time != INFINITE {
                expiration.subject_ttl = expiration
                    .subject_ttl
                    .max(remaining_ms(relationship.subject_expire_time, now));
            }
            if relationship.monitor_expire_time != INFINITE {
                expiration.monitor_ttl = expiration
                    .monitor_ttl
                    .max(remaining_ms(relationship.monitor_expire_time, now));
            }
        }
        if !found {
            return Err(Error::NotFound(format!("no lease from {local_app} to {remote_app}")));
        }
        Ok(expiration)
    }

    /// Administrative cap on the application's TTL, as an absolute engine time.
    pub(crate) fn set_global_lease_expiration_time(&mut self, app_instance: Instance, expire_time: i64) -> Result<()> {
        let identifier = self.ctx.app_identifier(app_instance)?;
        if let Some(app) = self.ctx.apps.get_mut(&identifier) {
            debug!(app = %identifier, expire_time, "global lease expiration set");
            app.global_lease_expire_time = expire_time;
        }
        Ok(())
    }
}
