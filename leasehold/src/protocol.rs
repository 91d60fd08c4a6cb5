//! Inbound dispatch and the request/response exchange of the lease protocol.

use crate::{
    agent::{AgentContext, AgentInner},
    application::LeaseEvent,
    endpoint::ListenEndpoint,
    identifier::{IdentifierSet, PendingLists},
    message::{peek_version, LeaseMessage, MessageType},
    relationship::{LeaseDurations, OneWayState},
    remote::RemoteLeaseAgent,
    time::{add_duration, next_instance, Instance, INFINITE},
    timer::RlaTimer,
    Error,
};
use tracing::{debug, warn};

const PING_DURATIONS: LeaseDurations = LeaseDurations {
    duration: 0,
    suspend: 0,
    arbitration: 0,
};

impl AgentContext {
    pub(crate) fn build_message(
        &self,
        rla: &RemoteLeaseAgent,
        message_type: MessageType,
        lists: PendingLists,
        durations: LeaseDurations,
        expiration: i64,
        is_two_way_termination: bool,
    ) -> LeaseMessage {
        let lease_instance = match message_type {
            MessageType::LeaseRequest | MessageType::ForwardRequest | MessageType::PingRequest => {
                rla.relationship.subject_identifier
            }
            _ => rla.relationship.monitor_identifier,
        };
        let (durations, expiration) = if message_type.is_ping() {
            (PING_DURATIONS, 0)
        } else {
            (durations, expiration)
        };
        LeaseMessage {
            major_version: self.engine.protocol_major_version,
            minor_version: self.engine.protocol_minor_version,
            message_id: next_instance().0,
            message_type,
            lease_instance,
            remote_lease_agent_instance: self.instance,
            duration: durations.duration,
            expiration,
            lease_suspend_duration: durations.suspend,
            arbitration_duration: durations.arbitration,
            is_two_way_termination,
            lists,
            sender: self.endpoint.clone(),
            lease_endpoint: message_type
                .is_forward()
                .then(|| rla.remote_endpoint.clone()),
            msg_lease_agent_instance: rla.remote_instance,
        }
    }

    pub(crate) fn send_message(&mut self, rla: &RemoteLeaseAgent, message: &LeaseMessage) {
        let to = rla.remote_endpoint.clone();
        self.send_to(&to, rla, message);
    }

    pub(crate) fn send_to(&mut self, to: &ListenEndpoint, rla: &RemoteLeaseAgent, message: &LeaseMessage) {
        if self.is_blocked {
            debug!(agent = %self.instance, message_type = ?message.message_type, "agent blocked, not sending");
            return;
        }
        self.outbox.send(to, message, Some(rla));
    }

    /// The subject-side lists every request carries.
    pub(crate) fn request_lists(rla: &RemoteLeaseAgent) -> PendingLists {
        PendingLists {
            subject_pending: rla.subject_establish_pending.clone(),
            subject_failed_pending: rla.subject_failed_pending.clone(),
            monitor_failed_pending: rla.monitor_failed_pending.clone(),
            subject_terminate_pending: rla.subject_terminate_pending.clone(),
            ..PendingLists::default()
        }
    }

    pub(crate) fn send_lease_request(
        &mut self,
        rla: &RemoteLeaseAgent,
        durations: LeaseDurations,
        expiration: i64,
        is_two_way_termination: bool,
    ) {
        let lists = Self::request_lists(rla);
        let message = self.build_message(
            rla,
            MessageType::LeaseRequest,
            lists,
            durations,
            expiration,
            is_two_way_termination,
        );
        self.send_message(rla, &message);
    }

    fn send_lease_response(
        &mut self,
        rla: &RemoteLeaseAgent,
        response_type: MessageType,
        lists: PendingLists,
        durations: LeaseDurations,
        expiration: i64,
        reply_to: &ListenEndpoint,
    ) {
        let message = self.build_message(rla, response_type, lists, durations, expiration, false);
        self.send_to(reply_to, rla, &message);
    }

    pub(crate) fn send_ping_request(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.ping_send_time.is_none() {
            rla.ping_send_time = Some(self.now());
        }
        let message = self.build_message(
            rla,
            MessageType::PingRequest,
            PendingLists::default(),
            PING_DURATIONS,
            0,
            false,
        );
        self.send_message(rla, &message);
    }

    fn send_ping_response(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.ping_send_time.is_none() {
            rla.ping_send_time = Some(self.now());
        }
        let message = self.build_message(
            rla,
            MessageType::PingResponse,
            PendingLists::default(),
            PING_DURATIONS,
            0,
            false,
        );
        self.send_message(rla, &message);
    }

    /// Starts the first-contact ping exchange.
    pub(crate) fn establish_ping(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.in_ping {
            return;
        }
        debug!(rla = %rla.instance, remote = %rla.remote_endpoint, "starting ping");
        rla.in_ping = true;
        let now = self.now();
        self.arm(rla, RlaTimer::PingRetry, now);
    }

    pub(crate) fn on_ping_retry_timer(&mut self, rla: &mut RemoteLeaseAgent) {
        if !rla.in_ping {
            rla.timers.cancel(RlaTimer::PingRetry);
            return;
        }
        self.send_ping_request(rla);
        let next = self.now() + self.engine.ping_retry_interval_ms;
        self.arm(rla, RlaTimer::PingRetry, next);
    }

    pub(crate) fn abort_ping(rla: &mut RemoteLeaseAgent) {
        rla.in_ping = false;
        rla.timers.cancel(RlaTimer::Subject);
        rla.relationship.subject_expire_time = INFINITE;
        rla.timers.cancel(RlaTimer::PingRetry);
    }

    pub(crate) fn process_lease_message(
        &mut self,
        rla: &mut RemoteLeaseAgent,
        message: &LeaseMessage,
        reply_to: &ListenEndpoint,
    ) {
        if !rla.remote_instance.is_set() {
            rla.remote_instance = message.remote_lease_agent_instance;
        }
        match message.message_type {
            MessageType::PingRequest => self.send_ping_response(rla),
            MessageType::PingResponse => self.process_ping_response(rla),
            t if t.is_received_request() => self.process_lease_request(rla, message, reply_to),
            t if t.is_received_response() => self.process_lease_response(rla, message),
            other => debug!(message_type = ?other, "unexpected message type"),
        }
    }

    fn process_ping_response(&mut self, rla: &mut RemoteLeaseAgent) {
        if rla.subject_state() == OneWayState::Active {
            if rla.monitor_state() == OneWayState::Active {
                rla.timers.cancel(RlaTimer::Subject);
                rla.in_ping = false;
            }
            return;
        }
        Self::abort_ping(rla);
        if !rla.subject.is_empty() {
            self.establish_lease(rla);
        } else if rla.monitor_state() == OneWayState::Inactive {
            debug!(rla = %rla.instance, "ping answered with nothing to establish");
            rla.fail(self.now());
        }
    }

    fn process_lease_request(
        &mut self,
        rla: &mut RemoteLeaseAgent,
        message: &LeaseMessage,
        reply_to: &ListenEndpoint,
    ) {
        let response_type = if message.message_type == MessageType::RelayRequest {
            MessageType::ForwardResponse
        } else {
            MessageType::LeaseResponse
        };
        if AgentContext::either_side_expired(rla) {
            debug!(rla = %rla.instance, "dropping request while relationship is expired");
            return;
        }
        let mut granted = LeaseDurations {
            duration: message.duration,
            suspend: message.lease_suspend_duration,
            arbitration: message.arbitration_duration,
        };
        let mut expiration = message.expiration;
        let config = self.durations.clone();

        if rla.monitor_state() == OneWayState::Inactive {
            if message.is_termination() {
                rla.relationship.monitor_identifier = message.lease_instance;
                self.send_lease_response(
                    rla,
                    response_type,
                    PendingLists::default(),
                    LeaseDurations::UNSET,
                    INFINITE,
                    reply_to,
                );
                if rla.subject_state() != OneWayState::Active {
                    rla.fail(self.now());
                }
                return;
            }

            let is_renew = message.lists.subject_pending.is_empty();
            let reverse = if rla.subject_state() == OneWayState::Active {
                None
            } else {
                message
                    .lists
                    .subject_pending
                    .iter()
                    .next()
                    .map(crate::identifier::LeaseRelationshipIdentifier::swapped)
            };
            let out = self.lease_request_change_state(rla, message);
            if rla.is_suspended() && rla.is_in_two_way_termination && is_renew {
                debug!(rla = %rla.instance, "dropping renew during two-way termination");
                return;
            }
            rla.set_monitor_state(OneWayState::Active);
            rla.relationship.monitor_identifier = message.lease_instance;
            rla.relationship
                .grant_larger_durations(&config, &mut granted, &mut expiration);

            if rla.subject_state() == OneWayState::Active {
                let durations = rla.relationship.durations;
                let subject_expire = rla.relationship.subject_expire_time;
                rla.relationship
                    .set_subject_expire_time(subject_expire, durations.suspend, durations.arbitration);
                rla.timers.cancel(RlaTimer::Subject);
                rla.timers.cancel(RlaTimer::PreArbitrationSubject);
                self.set_renew_timer(rla, false, 0);
            }
            self.send_lease_response(rla, response_type, out, granted, expiration, reply_to);

            if rla.subject_state() == OneWayState::Inactive {
                if let Some(reverse) = reverse {
                    self.establish_reverse_lease(rla, &reverse);
                }
            }
        } else {
            if message.lease_instance < rla.relationship.monitor_identifier {
                debug!(rla = %rla.instance, "dropping request for an older monitor lease");
                return;
            }
            if rla.subject_state() == OneWayState::Active
                && !message.lists.subject_terminate_pending.is_empty()
                && message.is_termination()
            {
                self.terminate_reverse_lease(rla, &message.lists.subject_terminate_pending);
            }
            let out = self.lease_request_change_state(rla, message);
            rla.relationship.monitor_identifier = message.lease_instance;
            rla.relationship
                .grant_larger_durations(&config, &mut granted, &mut expiration);
            self.send_lease_response(rla, response_type, out, granted, expiration, reply_to);
        }

        if rla.monitor_state() != OneWayState::Active {
            return;
        }
        let now = self.now();
        if message.is_termination() {
            Self::update_monitor_timer_for_termination(rla);
            if rla.subject_state() == OneWayState::Active {
                if message.is_two_way_termination && rla.subject.is_empty() {
                    self.update_subject_timer_for_termination(rla);
                    rla.fail(now);
                } else {
                    let durations = rla.relationship.durations;
                    let subject_expire = rla.relationship.subject_expire_time;
                    rla.relationship
                        .set_subject_expire_time(subject_expire, durations.suspend, durations.arbitration);
                    self.arm(rla, RlaTimer::Subject, subject_expire);
                }
            } else {
                rla.fail(now);
            }
        } else {
            let monitor_expire = add_duration(now, granted.duration);
            rla.relationship.monitor_expire_time = monitor_expire;
            self.arm(rla, RlaTimer::Monitor, monitor_expire);
            let pre_arbitration = if monitor_expire == INFINITE {
                INFINITE
            } else {
                monitor_expire - self.engine.pre_arbitration_ms
            };
            self.arm(rla, RlaTimer::PreArbitrationMonitor, pre_arbitration);
        }
    }

    /// Applies the subject-side lists of a request to the monitor tables and returns the
    /// lists the response carries.
    fn lease_request_change_state(&mut self, rla: &mut RemoteLeaseAgent, message: &LeaseMessage) -> PendingLists {
        let mut out = PendingLists::default();
        for id in &message.lists.subject_pending {
            if rla.monitor.contains(id) {
                out.subject_pending_accepted.insert(id.clone());
            } else if self.apps.contains_key(&id.remote_app) {
                rla.monitor.insert(id.clone());
                out.subject_pending_accepted.insert(id.clone());
            } else {
                debug!(lease = %id, "rejecting lease for unknown application");
                out.subject_pending_rejected.insert(id.clone());
            }
        }
        for id in &message.lists.subject_terminate_pending {
            rla.monitor.remove(id);
            out.subject_terminate_accepted.insert(id.clone());
        }
        for id in &message.lists.subject_failed_pending {
            if rla.monitor.remove(id) {
                self.deliver_to(
                    &id.remote_app,
                    LeaseEvent::RemoteLeasingApplicationExpired {
                        remote_app: id.local_app.clone(),
                    },
                );
            }
            out.subject_failed_accepted.insert(id.clone());
        }
        self.process_monitor_failed_pending(
            rla,
            &message.lists.monitor_failed_pending,
            &mut out.monitor_failed_accepted,
        );
        out.monitor_failed_pending = rla.monitor_failed_pending.clone();
        out
    }

    /// The peer gave up monitoring these ids: our subject entries for them are gone.
    fn process_monitor_failed_pending(
        &mut self,
        rla: &mut RemoteLeaseAgent,
        failed: &IdentifierSet,
        accepted: &mut IdentifierSet,
    ) {
        for id in failed {
            if rla.subject.remove(id).is_some() {
                rla.subject_failed_pending.insert(id.clone());
                self.deliver_to(
                    &id.local_app,
                    LeaseEvent::RemoteLeasingApplicationExpired {
                        remote_app: id.remote_app.clone(),
                    },
                );
            }
            accepted.insert(id.clone());
        }
    }

    fn process_lease_response(&mut self, rla: &mut RemoteLeaseAgent, message: &LeaseMessage) {
        if message.lease_instance != rla.relationship.subject_identifier
            || rla.relationship.subject_expire_time > message.expiration
        {
            debug!(rla = %rla.instance, message_id = message.message_id, "dropping out-of-date response");
            return;
        }
        rla.renewed_before = true;
        if rla.subject_state() != OneWayState::Active {
            return;
        }
        if rla.relationship.indirect_lease_count != 0 && message.message_type == MessageType::LeaseResponse {
            rla.relationship.indirect_lease_count = 0;
        }
        self.lease_response_change_state(rla, message);

        if message.is_termination() {
            self.update_subject_timer_for_termination(rla);
            return;
        }
        let granted = LeaseDurations {
            duration: message.duration,
            suspend: message.lease_suspend_duration,
            arbitration: message.arbitration_duration,
        };
        rla.relationship.record_granted_durations(granted);
        rla.relationship
            .set_subject_expire_time(message.expiration, granted.suspend, granted.arbitration);
        if rla.monitor_state() == OneWayState::Inactive {
            let subject_expire = rla.relationship.subject_expire_time;
            self.arm(rla, RlaTimer::Subject, subject_expire);
        }
        self.set_renew_timer(rla, false, 0);
        rla.timers.cancel(RlaTimer::PreArbitrationSubject);
    }

    fn lease_response_change_state(&mut self, rla: &mut RemoteLeaseAgent, message: &LeaseMessage) {
        for id in &message.lists.subject_pending_accepted {
            if !rla.subject_establish_pending.contains(id) {
                continue;
            }
            if let Some(handle) = rla.subject.get(id).copied() {
                self.deliver_to(
                    &id.local_app,
                    LeaseEvent::LeaseEstablished {
                        remote_app: id.remote_app.clone(),
                        lease: handle,
                    },
                );
                rla.subject_establish_pending.remove(id);
            }
        }
        for id in &message.lists.subject_pending_rejected {
            if rla.subject_establish_pending.contains(id) && rla.subject.contains_key(id) {
                self.deliver_to(
                    &id.local_app,
                    LeaseEvent::RemoteLeasingApplicationExpired {
                        remote_app: id.remote_app.clone(),
                    },
                );
                rla.subject_establish_pending.remove(id);
                rla.subject.remove(id);
            }
        }
        for id in &message.lists.subject_failed_accepted {
            rla.subject_failed_pending.remove(id);
        }
        for id in &message.lists.subject_terminate_accepted {
            rla.subject_terminate_pending.remove(id);
        }
        for id in &message.lists.monitor_failed_accepted {
            rla.monitor_failed_pending.remove(id);
        }
        let mut discarded = IdentifierSet::new();
        self.process_monitor_failed_pending(rla, &message.lists.monitor_failed_pending, &mut discarded);
    }
}

/// A message from an older incarnation of the peer or of this relationship.
fn is_stale(rla: &RemoteLeaseAgent, message: &LeaseMessage, now: i64) -> bool {
    if message.remote_lease_agent_instance < rla.remote_instance {
        return true;
    }
    if message.remote_lease_agent_instance > rla.remote_instance {
        return false;
    }
    let relationship = &rla.relationship;
    if message.message_type.is_received_request() {
        if message.lease_instance < relationship.monitor_identifier {
            return true;
        }
        if message.lease_instance > relationship.monitor_identifier {
            return false;
        }
        if AgentContext::either_side_expired(rla) {
            return true;
        }
        return !message.is_termination() && (rla.is_orphaned(now) || rla.is_failed());
    }
    if message.message_type.is_received_response() {
        return message.lease_instance != relationship.subject_identifier
            || relationship.subject_state != OneWayState::Active;
    }
    false
}

impl AgentInner {
    pub(crate) fn process_frame(&mut self, peer: &ListenEndpoint, frame: &[u8]) {
        if self.ctx.is_blocked || self.ctx.is_failed() {
            debug!(agent = %self.ctx.instance, %peer, "dropping inbound frame");
            return;
        }
        let expected_major = self.ctx.engine.protocol_major_version;
        if let Some((major, minor)) = peek_version(frame) {
            if major != expected_major {
                let error = Error::RevisionMismatch {
                    expected_major,
                    expected_minor: self.ctx.engine.protocol_minor_version,
                };
                warn!(%peer, major, minor, %error, "dropping lease message");
                return;
            }
        }
        let message = match LeaseMessage::decode(frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(%peer, %error, "aborting connection after malformed lease message");
                self.ctx.outbox.abort(peer);
                return;
            }
        };
        debug!(
            agent = %self.ctx.instance,
            sender = %message.sender,
            message_type = ?message.message_type,
            message_id = message.message_id,
            lease_instance = %message.lease_instance,
            "received lease message"
        );

        if self
            .ctx
            .behaviors
            .is_blocked(&message.sender, &self.ctx.endpoint, message.message_type)
        {
            debug!(sender = %message.sender, message_type = ?message.message_type, "message blocked by transport behavior");
            return;
        }
        if message.message_type.is_forward() {
            self.process_forward_message(message);
            return;
        }
        if message.msg_lease_agent_instance.is_set() && message.msg_lease_agent_instance < self.ctx.instance {
            debug!(
                sender = %message.sender,
                addressed_to = %message.msg_lease_agent_instance,
                "dropping message for an older agent incarnation"
            );
            return;
        }

        let (lease_endpoint, reply_to) = if message.message_type.is_relay() {
            let Some(relay) = self.active_open_rla_endpoint(&message.sender) else {
                debug!(relay = %message.sender, "no open relationship with relaying agent");
                return;
            };
            let Some(lease_endpoint) = message.lease_endpoint.clone() else {
                return;
            };
            (lease_endpoint, relay)
        } else {
            (message.sender.clone(), message.sender.clone())
        };

        let Some(rla_instance) = self.get_or_create_rla(&message, &lease_endpoint) else {
            return;
        };
        let AgentInner { ctx, rlas } = self;
        if let Some(rla) = rlas.get_mut(&rla_instance) {
            ctx.process_lease_message(rla, &message, &reply_to);
        }
    }

    fn active_open_rla_endpoint(&self, endpoint: &ListenEndpoint) -> Option<ListenEndpoint> {
        self.rlas
            .values()
            .find(|rla| rla.is_active && rla.is_open() && &rla.remote_endpoint == endpoint)
            .map(|rla| rla.remote_endpoint.clone())
    }

    /// Intermediary side of indirect leasing: re-tag and pass the message on.
    fn process_forward_message(&mut self, mut message: LeaseMessage) {
        let Some(target) = message.lease_endpoint.clone() else {
            return;
        };
        let Some(target_rla) = self
            .rlas
            .values()
            .find(|rla| rla.is_active && rla.is_open() && rla.remote_endpoint == target)
            .map(|rla| rla.instance)
        else {
            debug!(%target, "no open relationship to relay to");
            return;
        };
        message.message_type = match message.message_type {
            MessageType::ForwardRequest => MessageType::RelayRequest,
            MessageType::ForwardResponse => MessageType::RelayResponse,
            _ => return,
        };
        message.lease_endpoint = Some(std::mem::replace(&mut message.sender, self.ctx.endpoint.clone()));
        let AgentInner { ctx, rlas } = self;
        if let Some(rla) = rlas.get(&target_rla) {
            debug!(%target, message_type = ?message.message_type, "relaying lease message");
            ctx.send_message(rla, &message);
        }
    }

    /// Finds the RLA an inbound message belongs to, replacing stale incarnations.
    fn get_or_create_rla(&mut self, message: &LeaseMessage, endpoint: &ListenEndpoint) -> Option<Instance> {
        if self.ctx.is_failed() {
            return None;
        }
        let now = self.ctx.now();
        let mut ping_send_time = None;

        if let Some(active) = self.active_rla_for(endpoint) {
            let received_request = message.message_type.is_received_request();
            let monitor_inactive = self
                .rlas
                .get(&active)
                .is_some_and(|rla| rla.monitor_state() == OneWayState::Inactive);
            if received_request && monitor_inactive {
                let from_neutral = self.rlas.values().any(|rla| {
                    rla.is_in_arbitration_neutral
                        && &rla.remote_endpoint == endpoint
                        && rla.relationship.monitor_identifier == message.lease_instance
                });
                if from_neutral {
                    debug!(%endpoint, lease_instance = %message.lease_instance, "dropping request from arbitration-neutral relationship");
                    return None;
                }
            }

            let rla = self.rlas.get_mut(&active)?;
            if !rla.remote_instance.is_set() {
                rla.remote_instance = message.remote_lease_agent_instance;
            }
            if is_stale(rla, message, now) {
                debug!(rla = %rla.instance, message_type = ?message.message_type, message_id = message.message_id, "dropping stale message");
                return None;
            }
            if message.remote_lease_agent_instance > rla.remote_instance {
                if rla.is_in_arbitration() {
                    debug!(rla = %rla.instance, "remote restarted during arbitration, dropping message");
                    return None;
                }
                debug!(rla = %rla.instance, old = %rla.remote_instance, new = %message.remote_lease_agent_instance, "remote agent restarted");
                self.disconnect(active, true);
            } else if rla.is_orphaned(now) {
                ping_send_time = rla.ping_send_time;
                self.disconnect(active, false);
            } else if rla.is_failed() {
                self.disconnect(active, false);
            } else {
                rla.remote_version = remote_version(message);
                return Some(active);
            }
        }

        let mut rla = RemoteLeaseAgent::new(endpoint.clone(), message.remote_lease_agent_instance);
        rla.ping_send_time = ping_send_time;
        rla.remote_version = remote_version(message);
        let instance = rla.instance;
        debug!(agent = %self.ctx.instance, rla = %instance, remote = %endpoint, "remote lease agent created for inbound message");
        self.rlas.insert(instance, rla);
        Some(instance)
    }
}

fn remote_version(message: &LeaseMessage) -> u16 {
    (u16::from(message.major_version) << 8) | u16::from(message.minor_version)
}
