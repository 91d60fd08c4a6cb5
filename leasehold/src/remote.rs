//! Remote lease agent: the local proxy for one peering with a remote lease agent.

use crate::{
    endpoint::ListenEndpoint,
    identifier::{IdentifierSet, LeaseRelationshipIdentifier, SubjectTable},
    relationship::{LeaseDurations, LeaseRelationship, OneWayState},
    time::{next_instance, Instance},
    timer::RlaTimers,
};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of lease agents and remote lease agents. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Open,
    Suspended,
    Failed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Open => "open",
            AgentState::Suspended => "suspended",
            AgentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of an RLA for status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLeaseAgentSnapshot {
    pub instance: Instance,
    pub remote_endpoint: ListenEndpoint,
    pub remote_instance: Instance,
    pub state: AgentState,
    pub is_active: bool,
    pub is_in_arbitration_neutral: bool,
    pub in_ping: bool,
    pub subject_state: OneWayState,
    pub monitor_state: OneWayState,
    pub durations: LeaseDurations,
    pub subject: Vec<LeaseRelationshipIdentifier>,
    pub subject_establish_pending: Vec<LeaseRelationshipIdentifier>,
    pub subject_failed_pending: Vec<LeaseRelationshipIdentifier>,
    pub subject_terminate_pending: Vec<LeaseRelationshipIdentifier>,
    pub monitor: Vec<LeaseRelationshipIdentifier>,
    pub monitor_failed_pending: Vec<LeaseRelationshipIdentifier>,
}

#[derive(Debug)]
pub struct RemoteLeaseAgent {
    pub instance: Instance,
    pub remote_endpoint: ListenEndpoint,
    /// Instance of the remote lease agent, `NONE` until the first message from it.
    pub remote_instance: Instance,
    pub state: AgentState,
    pub is_active: bool,
    pub is_in_arbitration_neutral: bool,
    pub is_in_two_way_termination: bool,
    pub in_ping: bool,
    pub renewed_before: bool,
    pub relationship: LeaseRelationship,

    /// Subject relationships keyed (local app, remote app).
    pub subject: SubjectTable,
    pub subject_establish_pending: IdentifierSet,
    pub subject_failed_pending: IdentifierSet,
    pub subject_terminate_pending: IdentifierSet,
    /// Monitor relationships as the peer names them: (remote app, local app).
    pub monitor: IdentifierSet,
    pub monitor_failed_pending: IdentifierSet,

    /// Time the first ping went out.
    pub ping_send_time: Option<i64>,
    /// Orphan deadline. Zero means an idle, inactive RLA is orphaned right away.
    pub time_to_be_failed: i64,
    pub failed_at: Option<i64>,
    /// Application chosen to arbitrate on this peering's behalf.
    pub arbitration_app: Option<String>,
    pub remote_version: u16,
    pub timers: RlaTimers,
    inflight: Arc<()>,
}

impl RemoteLeaseAgent {
    pub fn new(remote_endpoint: ListenEndpoint, remote_instance: Instance) -> Self {
        Self {
            instance: next_instance(),
            remote_endpoint,
            remote_instance,
            state: AgentState::Open,
            is_active: true,
            is_in_arbitration_neutral: false,
            is_in_two_way_termination: false,
            in_ping: false,
            renewed_before: false,
            relationship: LeaseRelationship::new(),
            subject: SubjectTable::new(),
            subject_establish_pending: IdentifierSet::new(),
            subject_failed_pending: IdentifierSet::new(),
            subject_terminate_pending: IdentifierSet::new(),
            monitor: IdentifierSet::new(),
            monitor_failed_pending: IdentifierSet::new(),
            ping_send_time: None,
            time_to_be_failed: 0,
            failed_at: None,
            arbitration_app: None,
            remote_version: 0,
            timers: RlaTimers::default(),
            inflight: Arc::new(()),
        }
    }

    pub fn subject_state(&self) -> OneWayState {
        self.relationship.subject_state
    }

    pub fn monitor_state(&self) -> OneWayState {
        self.relationship.monitor_state
    }

    pub fn is_failed(&self) -> bool {
        self.state == AgentState::Failed
    }

    pub fn is_suspended(&self) -> bool {
        self.state == AgentState::Suspended
    }

    /// Open, idle on both halves and not pinging: nothing local asked for this peering.
    pub fn is_orphaned(&self, now: i64) -> bool {
        self.state == AgentState::Open
            && self.subject_state() == OneWayState::Inactive
            && self.monitor_state() == OneWayState::Inactive
            && !self.in_ping
            && now >= self.time_to_be_failed
    }

    pub fn is_open(&self) -> bool {
        self.state == AgentState::Open
            && (self.subject_state() == OneWayState::Active
                || self.monitor_state() == OneWayState::Active)
    }

    pub fn is_open_two_way(&self) -> bool {
        self.state == AgentState::Open && self.relationship.is_two_way_active()
    }

    pub fn is_in_ping(&self) -> bool {
        self.state == AgentState::Open
            && self.subject_state() == OneWayState::Inactive
            && self.monitor_state() == OneWayState::Inactive
            && self.in_ping
    }

    /// Suspended with both halves expired: an arbitration is outstanding.
    pub fn is_in_arbitration(&self) -> bool {
        self.state == AgentState::Suspended
            && self.subject_state() == OneWayState::Expired
            && self.monitor_state() == OneWayState::Expired
    }

    pub fn set_state(&mut self, state: AgentState) {
        if self.state != state {
            tracing::debug!(rla = %self.instance, remote = %self.remote_endpoint, from = %self.state, to = %state, "remote lease agent state change");
            self.state = state;
        }
    }

    /// Cancels every timer and moves to `Failed`. Idempotent.
    pub fn fail(&mut self, now: i64) {
        if self.is_failed() {
            return;
        }
        tracing::info!(
            rla = %self.instance,
            remote = %self.remote_endpoint,
            subject = %self.subject_state(),
            monitor = %self.monitor_state(),
            "remote lease agent failed"
        );
        self.timers.cancel_all();
        self.state = AgentState::Failed;
        self.failed_at = Some(now);
    }

    /// Strong handle keeping this RLA alive across an asynchronous send.
    pub fn inflight_guard(&self) -> Arc<()> {
        self.inflight.clone()
    }

    pub fn has_inflight(&self) -> bool {
        Arc::strong_count(&self.inflight) > 1
    }

    pub fn is_ready_for_deallocation(&self) -> bool {
        self.is_failed() && !self.has_inflight()
    }

    pub fn snapshot(&self) -> RemoteLeaseAgentSnapshot {
        RemoteLeaseAgentSnapshot {
            instance: self.instance,
            remote_endpoint: self.remote_endpoint.clone(),
            remote_instance: self.remote_instance,
            state: self.state,
            is_active: self.is_active,
            is_in_arbitration_neutral: self.is_in_arbitration_neutral,
            in_ping: self.in_ping,
            subject_state: self.subject_state(),
            monitor_state: self.monitor_state(),
            durations: self.relationship.durations,
            subject: self.subject.keys().cloned().collect(),
            subject_establish_pending: self.subject_establish_pending.iter().cloned().collect(),
            subject_failed_pending: self.subject_failed_pending.iter().cloned().collect(),
            subject_terminate_pending: self.subject_terminate_pending.iter().cloned().collect(),
            monitor: self.monitor.iter().cloned().collect(),
            monitor_failed_pending: self.monitor_failed_pending.iter().cloned().collect(),
        }
    }

    pub fn set_subject_state(&mut self, state: OneWayState) {
        if self.relationship.subject_state != state {
            tracing::debug!(rla = %self.instance, from = %self.relationship.subject_state, to = %state, "subject state change");
            self.relationship.subject_state = state;
        }
    }

    pub fn set_monitor_state(&mut self, state: OneWayState) {
        if self.relationship.monitor_state != state {
            tracing::debug!(rla = %self.instance, from = %self.relationship.monitor_state, to = %state, "monitor state change");
            self.relationship.monitor_state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rla() -> RemoteLeaseAgent {
        RemoteLeaseAgent::new(ListenEndpoint::new("10.0.0.2", 9000), Instance::NONE)
    }

    #[test]
    fn test_fresh_rla_is_orphaned() {
        let mut rla = rla();
        assert!(rla.is_orphaned(0));
        rla.in_ping = true;
        assert!(!rla.is_orphaned(0));
        assert!(rla.is_in_ping());
        rla.in_ping = false;
        rla.time_to_be_failed = 100;
        assert!(!rla.is_orphaned(50));
    }

    #[test]
    fn test_open_predicates() {
        let mut rla = rla();
        assert!(!rla.is_open());
        rla.set_subject_state(OneWayState::Active);
        assert!(rla.is_open());
        assert!(!rla.is_open_two_way());
        rla.set_monitor_state(OneWayState::Active);
        assert!(rla.is_open_two_way());
        rla.set_state(AgentState::Suspended);
        assert!(!rla.is_open());
    }

    #[test]
    fn test_inflight_blocks_deallocation() {
        let mut rla = rla();
        let guard = rla.inflight_guard();
        rla.fail(10);
        rla.fail(20);
        assert_eq!(rla.failed_at, Some(10));
        assert!(!rla.is_ready_for_deallocation());
        drop(guard);
        assert!(rla.is_ready_for_deallocation());
    }
}
