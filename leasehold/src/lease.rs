//! Subject side of a lease relationship: establish, renew, terminate, and expiry timers.

use crate::{
    agent::{AgentContext, AgentInner, Deferred},
    config::DurationType,
    endpoint::ListenEndpoint,
    identifier::{IdentifierSet, LeaseHandle, LeaseRelationshipIdentifier},
    message::{MessageType, APP_IDENTIFIER_MAX},
    relationship::{LeaseDurations, OneWayState},
    remote::{AgentState, RemoteLeaseAgent},
    time::{add_duration, next_instance, Instance, INFINITE},
    timer::RlaTimer,
    Error, Result,
};
use tracing::{debug, info};

/// Outcome of an establish call. `is_established` is false while the peer has not yet
/// accepted the relationship; a `LeaseEstablished` event follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishedLease {
    pub lease: LeaseHandle,
    pub is_established: bool,
}

/// Remote protocol version whose subject expiry fails the lease directly.
const DIRECT_SUBJECT_FAIL_VERSION: u16 = 257;

impl AgentContext {
    /// Activates the subject half if needed and sends a request carrying the pending lists.
    pub(crate) fn establish_lease(&mut self, rla: &mut RemoteLeaseAgent) {
        let requested = rla.relationship.durations_for_request(&self.durations);
        let now = self.now();
        let expiration = add_duration(now, requested.duration);
        if rla.subject_state() == OneWayState::Inactive {
            rla.set_subject_state(OneWayState::Active);
            rla.relationship.subject_identifier = next_instance();
            rla.relationship.set_durations(requested);
            rla.relationship
                .set_subject_expire_time(expiration, requested.suspend, requested.arbitration);
            if rla.monitor_state() == OneWayState::Inactive {
                let subject_expire = rla.relationship.subject_expire_time;
                self.arm(rla, RlaTimer::Subject, subject_expire);
            }
            self.set_renew_timer(rla, false, 0);
        }
        self.send_lease_request(rla, requested, expiration, false);
    }

    /// Schedules the next renew. Renewal begins once `duration / renew_ratio` has elapsed and
    /// retries are spaced evenly over the rest; when no retry fits, the timer is armed at the
    /// expiry itself and becomes the arbitration trigger.
    pub(crate) fn set_renew_timer(&mut self, rla: &mut RemoteLeaseAgent, by_renew_timer: bool, renew_duration: i32) {
        if rla.subject_state() != OneWayState::Active || rla.monitor_state() > OneWayState::Active {
            return;
        }
        let subject_expire = rla.relationship.subject_expire_time;
        if subject_expire == INFINITE {
            return;
        }
        let now = self.now();
        let duration = if renew_duration != 0 {
            renew_duration
        } else if rla.relationship.durations.any_unset() {
            self.durations
                .lease_duration_for(rla.relationship.establish_duration_type)
        } else {
            rla.relationship.durations.duration
        };
        let ratio = self.durations.lease_renew_begin_ratio.max(1);
        let retries = self.durations.lease_retry_count.max(1);
        let remain = i64::from(duration - duration / ratio);
        let interval = remain / i64::from(retries);
        let remaining = subject_expire - now;

        rla.relationship.is_renew_retry = by_renew_timer;
        if !by_renew_timer {
            rla.relationship.renew_retry_count = 0;
        }
        let at = if remaining >= interval {
            let mut at = subject_expire - remain;
            if by_renew_timer {
                rla.relationship.renew_retry_count += 1;
                at += interval * i64::from(rla.relationship.renew_retry_count);
            }
            at
        } else {
            if rla.monitor_state() == OneWayState::Inactive {
                return;
            }
            subject_expire
        };
        self.arm(rla, RlaTimer::RenewOrArbitrate, at);
    }

    pub(crate) fn on_renew_or_arbitrate_timer(&mut self, rla: &mut RemoteLeaseAgent) {
        let now = self.now();
        if self.is_failed() {
            if now >= rla.relationship.subject_fail_time {
                self.on_subject_expired(rla);
            }
            return;
        }
        if rla.subject_state() != OneWayState::Active || rla.monitor_state() >= OneWayState::Expired {
            if rla.is_in_arbitration() && now >= rla.relationship.subject_fail_time {
                info!(rla = %rla.instance, remote = %rla.remote_endpoint, "arbitration result timed out");
                rla.set_subject_state(OneWayState::Failed);
                rla.set_monitor_state(OneWayState::Inactive);
                self.defer(Deferred::LeaseFailure);
            }
            return;
        }

        if now >= rla.relationship.subject_expire_time {
            if rla.monitor_state() == OneWayState::Inactive {
                return;
            }
            info!(rla = %rla.instance, remote = %rla.remote_endpoint, "subject and monitor expired");
            rla.set_subject_state(OneWayState::Expired);
            rla.set_monitor_state(OneWayState::Expired);
            rla.timers.cancel(RlaTimer::Monitor);
            if rla.relationship.lease_message_sent {
                self.create_arbitration_request(rla);
            } else {
                rla.set_subject_state(OneWayState::Inactive);
                rla.fail(now);
            }
            return;
        }

        if rla.is_failed() {
            return;
        }
        if rla.relationship.is_renew_retry {
            rla.relationship.indirect_lease_count += 1;
            let subject_expire = rla.relationship.subject_expire_time;
            self.arm(rla, RlaTimer::RenewOrArbitrate, subject_expire);
            let pre_arbitration = subject_expire - self.engine.pre_arbitration_ms;
            self.arm(rla, RlaTimer::PreArbitrationSubject, pre_arbitration);
            let limit = self.durations.consecutive_indirect_lease_limit();
            if limit != 0 && rla.relationship.indirect_lease_count < limit {
                self.defer(Deferred::IndirectForward(rla.instance));
            } else {
                debug!(
                    rla = %rla.instance,
                    count = rla.relationship.indirect_lease_count,
                    limit,
                    "indirect lease limit reached"
                );
            }
            return;
        }

        let duration_updated = rla.relationship.is_duration_updated;
        let requested = rla.relationship.durations_for_request(&self.durations);
        let expiration = add_duration(now, requested.duration);
        if rla.relationship.subject_expire_time > expiration {
            debug!(rla = %rla.instance, duration = requested.duration, "duration shrank, rescheduling renew");
            self.set_renew_timer(rla, false, requested.duration);
            rla.relationship.is_duration_updated = duration_updated;
            return;
        }
        self.set_renew_timer(rla, true, requested.duration);
        if rla.subject.is_empty() {
            if rla.state == AgentState::Open {
                rla.set_state(AgentState::Suspended);
            }
            self.send_lease_request(rla, LeaseDurations::UNSET, INFINITE, false);
        } else {
            self.send_lease_request(rla, requested, expiration, false);
        }
    }

    /// A peer asked us to monitor it while our subject half is idle: lease back.
    pub(crate) fn establish_reverse_lease(&mut self, rla: &mut RemoteLeaseAgent, id: &LeaseRelationshipIdentifier) {
        if rla.is_suspended() {
            return;
        }
        Self::abort_ping(rla);
        if rla.subject_establish_pending.contains(id) {
            self.establish_lease(rla);
            return;
        }
        if rla.subject.contains_key(id)
            || rla.subject_failed_pending.contains(id)
            || rla.subject_terminate_pending.contains(id)
        {
            return;
        }
        if !self.apps.contains_key(&id.local_app) {
            return;
        }
        debug!(rla = %rla.instance, lease = %id, "establishing reverse lease");
        rla.subject.insert(id.clone(), LeaseHandle(next_instance()));
        rla.subject_establish_pending.insert(id.clone());
        self.establish_lease(rla);
    }

    /// The peer terminated its subject leases; drop our reverse subjects for the same pairs.
    pub(crate) fn terminate_reverse_lease(&mut self, rla: &mut RemoteLeaseAgent, terminated: &IdentifierSet) {
        for id in terminated {
            let ours = id.swapped();
            if rla.subject.contains_key(&ours) {
                Self::terminate_subject_lease(rla, &ours, false);
            }
        }
        self.terminate_subject_lease_send_message(rla, false);
    }

    pub(crate) fn terminate_subject_lease(rla: &mut RemoteLeaseAgent, id: &LeaseRelationshipIdentifier, failed: bool) {
        let pending = if failed {
            &mut rla.subject_failed_pending
        } else {
            &mut rla.subject_terminate_pending
        };
        pending.insert(id.clone());
        rla.subject.remove(id);
        rla.subject_establish_pending.remove(id);
        if rla.relationship.subject_state == OneWayState::Inactive {
            // nothing was ever sent for it
            if failed {
                rla.subject_failed_pending.remove(id);
            } else {
                rla.subject_terminate_pending.remove(id);
            }
        }
    }

    pub(crate) fn terminate_subject_lease_send_message(&mut self, rla: &mut RemoteLeaseAgent, is_two_way: bool) {
        if rla.subject_state() == OneWayState::Inactive {
            if rla.is_in_ping() {
                if rla.subject.is_empty() {
                    rla.fail(self.now());
                }
            } else {
                Self::abort_ping(rla);
            }
            return;
        }
        let is_last = rla.subject.is_empty();
        if is_last {
            if rla.state == AgentState::Open {
                rla.set_state(AgentState::Suspended);
            }
            if is_two_way {
                rla.is_in_two_way_termination = true;
            }
        }
        let (durations, expiration) = if is_last {
            (LeaseDurations::UNSET, INFINITE)
        } else {
            let durations = rla.relationship.durations;
            (durations, add_duration(self.now(), durations.duration))
        };
        self.send_lease_request(rla, durations, expiration, is_two_way);
    }

    fn terminate_monitor_lease(rla: &mut RemoteLeaseAgent, id: &LeaseRelationshipIdentifier) {
        rla.monitor.remove(id);
        rla.monitor_failed_pending.insert(id.clone());
    }

    /// Ends every relationship `app` has through `rla`.
    pub(crate) fn terminate_all(&mut self, rla: &mut RemoteLeaseAgent, app: &str, subject_failed: bool) {
        if rla.is_in_ping() {
            Self::abort_ping(rla);
        }
        if subject_failed {
            let monitored: Vec<_> = rla
                .monitor
                .iter()
                .filter(|id| id.remote_app == app)
                .cloned()
                .collect();
            for id in &monitored {
                Self::terminate_monitor_lease(rla, id);
            }
        }
        let subjects: Vec<_> = rla
            .subject
            .keys()
            .filter(|id| id.local_app == app)
            .cloned()
            .collect();
        let mut send = false;
        for id in &subjects {
            Self::terminate_subject_lease(rla, id, subject_failed);
            if rla.subject_state() == OneWayState::Active {
                send = true;
            }
        }
        if !send {
            return;
        }
        let is_two_way = (rla.subject.is_empty() && rla.monitor.is_empty()) || !subject_failed;
        self.terminate_subject_lease_send_message(rla, is_two_way);
        if is_two_way && rla.monitor_state() == OneWayState::Active {
            Self::update_monitor_timer_for_termination(rla);
            let durations = rla.relationship.durations;
            let subject_expire = rla.relationship.subject_expire_time;
            rla.relationship
                .set_subject_expire_time(subject_expire, durations.suspend, durations.arbitration);
            self.arm(rla, RlaTimer::Subject, subject_expire);
        }
    }

    pub(crate) fn update_subject_timer_for_termination(&mut self, rla: &mut RemoteLeaseAgent) {
        rla.set_subject_state(OneWayState::Inactive);
        rla.relationship.set_subject_expire_time(INFINITE, 0, 0);
        for timer in [
            RlaTimer::RenewOrArbitrate,
            RlaTimer::PreArbitrationMonitor,
            RlaTimer::PreArbitrationSubject,
            RlaTimer::Subject,
            RlaTimer::PingRetry,
        ] {
            rla.timers.cancel(timer);
        }
        if rla.monitor_state() != OneWayState::Active {
            rla.fail(self.now());
        } else if rla.is_suspended() {
            rla.set_state(AgentState::Open);
            rla.is_in_two_way_termination = false;
        }
    }

    pub(crate) fn update_monitor_timer_for_termination(rla: &mut RemoteLeaseAgent) {
        rla.set_monitor_state(OneWayState::Inactive);
        rla.relationship.monitor_expire_time = INFINITE;
        rla.timers.cancel(RlaTimer::Monitor);
        rla.timers.cancel(RlaTimer::PreArbitrationMonitor);
    }

    pub(crate) fn on_subject_timer(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.is_failed() {
            return;
        }
        let now = self.now();
        if rla.subject_state() == OneWayState::Inactive {
            // ping gave up waiting
            if rla.monitor_state() == OneWayState::Active {
                rla.in_ping = false;
                rla.relationship.subject_expire_time = INFINITE;
            } else {
                rla.fail(now);
            }
            return;
        }
        if rla.monitor_state() != OneWayState::Active && !rla.relationship.lease_message_sent {
            rla.set_subject_state(OneWayState::Inactive);
            rla.fail(now);
        } else if rla.remote_version == DIRECT_SUBJECT_FAIL_VERSION {
            self.on_subject_expired(rla);
        } else {
            rla.set_subject_state(OneWayState::Expired);
            rla.set_monitor_state(OneWayState::Expired);
            self.create_arbitration_request(rla);
        }
    }

    pub(crate) fn on_monitor_timer(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.monitor_state() != OneWayState::Active
            || rla.subject_state() >= OneWayState::Expired
            || self.is_failed()
        {
            return;
        }
        if rla.subject_state() == OneWayState::Inactive {
            info!(rla = %rla.instance, remote = %rla.remote_endpoint, "monitor expired");
            rla.set_monitor_state(OneWayState::Inactive);
            self.inform_remote_failed(rla, false);
            rla.fail(self.now());
            return;
        }
        rla.set_subject_state(OneWayState::Expired);
        rla.set_monitor_state(OneWayState::Expired);
        rla.timers.cancel(RlaTimer::RenewOrArbitrate);
        rla.timers.cancel(RlaTimer::PreArbitrationSubject);
        rla.timers.cancel(RlaTimer::PingRetry);
        self.create_arbitration_request(rla);
    }
}

impl AgentInner {
    /// Sends the pending lists of `direct` through every other healthy peer.
    pub(crate) fn send_indirect_lease_forward_messages(&mut self, direct: Instance) {
        let AgentInner { ctx, rlas } = self;
        let Some(direct_rla) = rlas.get(&direct) else {
            return;
        };
        let is_termination = direct_rla.subject.is_empty();
        let (durations, expiration) = if is_termination {
            (LeaseDurations::UNSET, INFINITE)
        } else {
            let durations = direct_rla.relationship.durations;
            (durations, add_duration(ctx.now(), durations.duration))
        };
        let message = ctx.build_message(
            direct_rla,
            MessageType::ForwardRequest,
            AgentContext::request_lists(direct_rla),
            durations,
            expiration,
            false,
        );
        debug!(rla = %direct, remote = %direct_rla.remote_endpoint, is_termination, "sending indirect lease requests");
        for (instance, rla) in rlas.iter() {
            if *instance == direct
                || rla.is_failed()
                || rla.is_suspended()
                || !rla.is_active
                || rla.subject_state() == OneWayState::Inactive
                || rla.monitor_state() == OneWayState::Inactive
            {
                continue;
            }
            ctx.send_message(rla, &message);
        }
    }

    pub(crate) fn establish_lease_relationship(
        &mut self,
        app_instance: Instance,
        remote_endpoint: &ListenEndpoint,
        remote_app: &str,
        duration_type: DurationType,
        remote_instance: Instance,
    ) -> Result<EstablishedLease> {
        if remote_app.is_empty() || remote_app.len() > APP_IDENTIFIER_MAX {
            return Err(Error::InvalidParameter(format!(
                "remote application identifier must be 1..={APP_IDENTIFIER_MAX} bytes"
            )));
        }
        remote_endpoint.validate()?;
        if self.ctx.is_failed() {
            return Err(Error::AgentFailed {
                instance: self.ctx.instance.0,
            });
        }
        let local_app = self.ctx.app_identifier(app_instance)?;
        if self
            .ctx
            .apps
            .get(&local_app)
            .is_some_and(|app| app.is_being_unregistered)
        {
            return Err(Error::InvalidParameter(format!(
                "application {local_app} is being unregistered"
            )));
        }

        let now = self.ctx.now();
        let same_remote: Vec<Instance> = self
            .rlas
            .values()
            .filter(|rla| &rla.remote_endpoint == remote_endpoint)
            .map(|rla| rla.instance)
            .collect();
        let mut reuse = None;
        let mut ping_send_time = None;
        for instance in same_remote {
            let Some(rla) = self.rlas.get_mut(&instance) else {
                continue;
            };
            if remote_instance.is_set() && rla.remote_instance.is_set() && remote_instance > rla.remote_instance {
                self.disconnect(instance, true);
                continue;
            }
            if rla.is_failed() {
                rla.is_active = false;
                continue;
            }
            if rla.is_orphaned(now) {
                ping_send_time = rla.ping_send_time;
                self.disconnect(instance, false);
                continue;
            }
            if rla.is_suspended() {
                return Err(Error::Retry(format!(
                    "relationship with {remote_endpoint} is suspended"
                )));
            }
            rla.relationship.establish_duration_type = duration_type;
            reuse = Some(instance);
            break;
        }

        let rla_instance = match reuse {
            Some(instance) => instance,
            None => {
                let mut rla = RemoteLeaseAgent::new(remote_endpoint.clone(), remote_instance);
                rla.relationship.establish_duration_type = duration_type;
                rla.ping_send_time = ping_send_time;
                let instance = rla.instance;
                for other in self.rlas.values_mut() {
                    if &other.remote_endpoint == remote_endpoint {
                        other.is_active = false;
                    }
                }
                info!(agent = %self.ctx.instance, rla = %instance, remote = %remote_endpoint, "remote lease agent created");
                self.rlas.insert(instance, rla);
                instance
            }
        };

        let AgentInner { ctx, rlas } = self;
        let Some(rla) = rlas.get_mut(&rla_instance) else {
            return Err(Error::NotFound(format!("remote lease agent {rla_instance}")));
        };
        let id = LeaseRelationshipIdentifier::new(local_app, remote_app);
        if rla.subject_failed_pending.contains(&id) || rla.subject_terminate_pending.contains(&id) {
            return Err(Error::ObjectIdExists(id.to_string()));
        }
        if let Some(handle) = rla.subject.get(&id) {
            return Ok(EstablishedLease {
                lease: *handle,
                is_established: !rla.subject_establish_pending.contains(&id),
            });
        }
        let handle = LeaseHandle(next_instance());
        info!(rla = %rla.instance, lease = %id, handle = %handle.0, "establishing lease");
        rla.subject.insert(id.clone(), handle);
        rla.subject_establish_pending.insert(id);
        if rla.subject_state() == OneWayState::Inactive && rla.monitor_state() == OneWayState::Inactive {
            ctx.establish_ping(rla);
        } else {
            ctx.establish_lease(rla);
        }
        Ok(EstablishedLease {
            lease: handle,
            is_established: false,
        })
    }

    pub(crate) fn terminate_lease_relationship(
        &mut self,
        app_instance: Instance,
        lease: LeaseHandle,
        remote_app: &str,
    ) -> Result<()> {
        let local_app = self.ctx.app_identifier(app_instance)?;
        let AgentInner { ctx, rlas } = self;
        let id = LeaseRelationshipIdentifier::new(local_app, remote_app);
        let Some(rla) = rlas
            .values_mut()
            .find(|rla| rla.subject.get(&id) == Some(&lease))
        else {
            return Err(Error::NotFound(format!("lease {} to {remote_app}", lease.0)));
        };
        if rla.is_failed() || rla.is_suspended() {
            return Err(Error::InvalidParameter(format!(
                "relationship with {} is {}",
                rla.remote_endpoint, rla.state
            )));
        }
        info!(rla = %rla.instance, lease = %id, "terminating lease");
        AgentContext::terminate_subject_lease(rla, &id, false);
        ctx.terminate_subject_lease_send_message(rla, false);
        Ok(())
    }
}
