//! Arbitration of suspected mutual failure and the agent-wide lease failure path.

use crate::{
    agent::{AgentContext, AgentInner, Deferred},
    application::{ArbitrationRequest, LeaseEvent},
    endpoint::ListenEndpoint,
    relationship::OneWayState,
    remote::{AgentState, RemoteLeaseAgent},
    time::{remaining_ms, Instance, INFINITE},
    timer::RlaTimer,
    Error, Result,
};
use tracing::{debug, info, warn};

/// Decision returned by the external arbitration authority.
///
/// A TTL of `i32::MAX` means "keep": `local_ttl != MAX` loses the lease locally, `remote_ttl != MAX`
/// declares the peer down after that many milliseconds, and both at MAX is a neutral outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitrationResult {
    pub agent_instance: Instance,
    pub app_instance: Instance,
    pub local_ttl: i32,
    pub remote_endpoint: ListenEndpoint,
    pub remote_instance: Instance,
    pub remote_ttl: i32,
    pub is_delayed: bool,
}

impl AgentContext {
    /// Both halves expired: suspend the relationship and ask an arbitration-enabled application.
    pub(crate) fn create_arbitration_request(&mut self, rla: &mut RemoteLeaseAgent) {
        let now = self.now();
        let fail_time = rla.relationship.subject_fail_time;
        if now >= fail_time {
            info!(rla = %rla.instance, "subject fail time passed before arbitration");
            self.fail_relationship(rla);
            return;
        }
        self.arm(rla, RlaTimer::RenewOrArbitrate, fail_time);
        if rla.state == AgentState::Open {
            rla.set_state(AgentState::Suspended);
        }

        let Some(arbitrator) = self.first_arbitration_app() else {
            warn!(rla = %rla.instance, remote = %rla.remote_endpoint, "no application can arbitrate");
            self.fail_relationship(rla);
            return;
        };

        let suspend = rla.relationship.durations.suspend;
        let local_ttl = remaining_ms(rla.relationship.monitor_expire_time, now).saturating_add(suspend);
        let remote_ttl = remaining_ms(rla.relationship.subject_expire_time, now).saturating_add(suspend);
        let remote_app = rla
            .monitor
            .iter()
            .next()
            .map(|id| id.local_app.clone())
            .or_else(|| rla.subject.keys().next().map(|id| id.remote_app.clone()));
        let last_contact = if rla.renewed_before {
            rla.relationship.subject_expire_time - i64::from(self.durations.lease_duration)
        } else {
            rla.ping_send_time.unwrap_or(now)
        };
        let upper_bound = i32::try_from((now - last_contact).max(0)).unwrap_or(i32::MAX);

        let request = ArbitrationRequest {
            remote_app,
            local_ttl,
            remote_ttl,
            remote_endpoint: rla.remote_endpoint.clone(),
            agent_instance: self.instance,
            remote_agent_instance: rla.remote_instance,
            remote_version: rla.remote_version,
            monitor_lease_instance: rla.relationship.monitor_identifier,
            subject_lease_instance: rla.relationship.subject_identifier,
            remote_arbitration_duration_upper_bound: upper_bound,
            is_pre_arbitration: false,
        };
        info!(
            rla = %rla.instance,
            remote = %rla.remote_endpoint,
            app = %arbitrator,
            local_ttl,
            remote_ttl,
            upper_bound,
            "requesting arbitration"
        );
        rla.arbitration_app = Some(arbitrator.clone());
        self.deliver_to(&arbitrator, LeaseEvent::Arbitrate(request));
    }

    fn fail_relationship(&mut self, rla: &mut RemoteLeaseAgent) {
        rla.set_subject_state(OneWayState::Failed);
        rla.set_monitor_state(OneWayState::Inactive);
        rla.fail(self.now());
        self.defer(Deferred::LeaseFailure);
    }

    /// Applies an arbitration decision that arrived before the subject fail time.
    pub(crate) fn arbitrate_lease(
        &mut self,
        rla: &mut RemoteLeaseAgent,
        local_ttl: i32,
        remote_ttl: i32,
        is_delayed: bool,
    ) {
        info!(rla = %rla.instance, remote = %rla.remote_endpoint, local_ttl, remote_ttl, is_delayed, "arbitration result");
        rla.timers.cancel(RlaTimer::RenewOrArbitrate);
        if local_ttl != i32::MAX {
            rla.set_subject_state(OneWayState::Failed);
            rla.set_monitor_state(OneWayState::Inactive);
            rla.is_in_arbitration_neutral = false;
            self.defer(Deferred::LeaseFailure);
        } else if remote_ttl != i32::MAX {
            // the peer lost; pings may start right away
            rla.relationship.subject_suspend_time = INFINITE;
            rla.is_in_arbitration_neutral = false;
            if is_delayed {
                self.inform_remote_failed(rla, false);
                self.inform_remote_failed(rla, true);
            } else if remote_ttl == 0 {
                self.on_monitor_expired(rla);
            } else {
                let at = self.now() + i64::from(remote_ttl);
                self.arm(rla, RlaTimer::PostArbitration, at);
            }
        } else {
            rla.set_subject_state(OneWayState::Inactive);
            rla.set_monitor_state(OneWayState::Failed);
            rla.is_in_arbitration_neutral = true;
            rla.fail(self.now());
        }
    }

    /// Early liveness hint ahead of a subject or monitor expiry.
    pub(crate) fn on_pre_arbitration_timer(&mut self, rla: &mut RemoteLeaseAgent) {
        if self.is_failed() || rla.is_failed() {
            return;
        }
        let Some(arbitrator) = self.first_arbitration_app() else {
            return;
        };
        let remote_app = rla
            .monitor
            .iter()
            .next()
            .map(|id| id.local_app.clone())
            .or_else(|| rla.subject.keys().next().map(|id| id.remote_app.clone()));
        debug!(rla = %rla.instance, remote = %rla.remote_endpoint, app = %arbitrator, "pre-arbitration");
        let request = ArbitrationRequest {
            remote_app,
            local_ttl: 0,
            remote_ttl: 0,
            remote_endpoint: rla.remote_endpoint.clone(),
            agent_instance: self.instance,
            remote_agent_instance: rla.remote_instance,
            remote_version: rla.remote_version,
            monitor_lease_instance: rla.relationship.monitor_identifier,
            subject_lease_instance: rla.relationship.subject_identifier,
            remote_arbitration_duration_upper_bound: 0,
            is_pre_arbitration: true,
        };
        self.deliver_to(&arbitrator, LeaseEvent::Arbitrate(request));
    }

    /// The peer is considered down: fail the RLA and tell both sides' applications.
    pub(crate) fn on_monitor_expired(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.is_failed() {
            return;
        }
        info!(rla = %rla.instance, remote = %rla.remote_endpoint, "remote considered expired");
        rla.set_subject_state(OneWayState::Inactive);
        rla.set_monitor_state(OneWayState::Failed);
        rla.fail(self.now());
        self.inform_remote_failed(rla, false);
        self.inform_remote_failed(rla, true);
    }

    pub(crate) fn on_subject_expired(&mut self, rla: &mut RemoteLeaseAgent) {
        info!(rla = %rla.instance, remote = %rla.remote_endpoint, "subject expired");
        rla.set_subject_state(OneWayState::Failed);
        rla.set_monitor_state(OneWayState::Inactive);
        self.defer(Deferred::LeaseFailure);
    }
}

impl AgentInner {
    /// Starts the delayed failure: applications keep running for their remaining TTL, bounded by
    /// the suspend duration, before the agent fails.
    pub(crate) fn on_lease_failure(&mut self) {
        if self.ctx.is_failed() || self.ctx.is_in_delay_timer {
            return;
        }
        let identifiers: Vec<String> = self.ctx.apps.keys().cloned().collect();
        let max_ttl = identifiers
            .iter()
            .map(|identifier| self.application_ttl(identifier, 0))
            .max()
            .unwrap_or(0)
            .clamp(0, self.ctx.durations.lease_suspend_duration);
        warn!(agent = %self.ctx.instance, delay = max_ttl, "lease failure, failing agent after delay");
        self.ctx.is_in_delay_timer = true;
        let at = self.ctx.now() + i64::from(max_ttl);
        let agent = self.ctx.weak.clone();
        let scheduler = self.ctx.scheduler.clone();
        self.ctx.delayed_failure_timer.arm(&scheduler, at, move |generation| {
            if let Some(agent) = agent.upgrade() {
                agent.fire_delayed_failure(generation);
            }
        });
    }

    pub(crate) fn on_delayed_lease_failure(&mut self) {
        let identifiers: Vec<String> = self.ctx.apps.keys().cloned().collect();
        let AgentInner { ctx, rlas } = self;
        for identifier in &identifiers {
            ctx.deliver_to(identifier, LeaseEvent::LeasingApplicationExpired);
            for rla in rlas.values_mut() {
                ctx.terminate_all(rla, identifier, true);
            }
        }
        self.ctx.is_in_delay_timer = false;
        self.fail_agent();
    }

    pub(crate) fn process_arbitration_result(&mut self, result: &ArbitrationResult) -> Result<()> {
        if result.local_ttl < 0 || result.remote_ttl < 0 {
            return Err(Error::InvalidParameter(format!(
                "negative arbitration TTL (local {}, remote {})",
                result.local_ttl, result.remote_ttl
            )));
        }
        let now = self.ctx.now();
        let AgentInner { ctx, rlas } = self;
        let Some(rla) = rlas.values_mut().find(|rla| {
            !rla.is_failed()
                && rla.remote_instance == result.remote_instance
                && rla.remote_endpoint == result.remote_endpoint
        }) else {
            return Err(Error::InvalidParameter(format!(
                "no relationship with {} instance {}",
                result.remote_endpoint, result.remote_instance
            )));
        };
        if now >= rla.relationship.subject_fail_time {
            warn!(rla = %rla.instance, remote = %rla.remote_endpoint, "arbitration result arrived after subject fail time");
            rla.set_subject_state(OneWayState::Failed);
            rla.set_monitor_state(OneWayState::Inactive);
            ctx.defer(Deferred::LeaseFailure);
        } else {
            ctx.arbitrate_lease(rla, result.local_ttl, result.remote_ttl, result.is_delayed);
        }
        Ok(())
    }
}

