//! Lease agent: one local listen endpoint, its leasing applications and remote lease agents.
//!
//! All mutable agent state sits behind a single mutex. Protocol code runs as methods on
//! [`AgentContext`] taking the RLA it works on as a separate `&mut`, so the RLA table and the
//! rest of the agent can be borrowed independently. Work that touches every RLA (lease failure,
//! indirect forwarding) is queued as [`Deferred`] and run before the lock is released.

use crate::{
    application::{EventRegistration, LeaseEvent, LeasingApplication},
    config::{DurationConfig, EngineConfig, SecurityProvider, SecuritySettings},
    endpoint::ListenEndpoint,
    message::{LeaseMessage, APP_IDENTIFIER_MAX},
    relationship::OneWayState,
    remote::{AgentState, RemoteLeaseAgent, RemoteLeaseAgentSnapshot},
    time::{next_instance, Instance},
    timer::{RlaTimer, ScheduledTask, Scheduler},
    transport::{InboundHandler, Transport, TransportBehaviorTable},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Agent-wide work requested while a single RLA was borrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deferred {
    LeaseFailure,
    IndirectForward(Instance),
}

#[derive(Debug)]
struct OutboundFrame {
    frame: Bytes,
    rla: Option<Instance>,
    is_lease_request: bool,
    _inflight: Option<Arc<()>>,
}

#[derive(Debug)]
struct SendQueue {
    sender: mpsc::UnboundedSender<OutboundFrame>,
    task: JoinHandle<()>,
}

/// Per-destination ordered send queues drained by one task each.
#[derive(Debug)]
pub(crate) struct Outbox {
    local: ListenEndpoint,
    transport: Arc<dyn Transport>,
    agent: Weak<LeaseAgent>,
    scheduler: Scheduler,
    queues: HashMap<ListenEndpoint, SendQueue>,
    closed: bool,
}

impl Outbox {
    fn new(
        local: ListenEndpoint,
        transport: Arc<dyn Transport>,
        agent: Weak<LeaseAgent>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            local,
            transport,
            agent,
            scheduler,
            queues: HashMap::new(),
            closed: false,
        }
    }

    /// Queues `message` for `to`. `rla` is the RLA that owns the send; its inflight guard
    /// travels with the frame until the transport reports completion.
    pub(crate) fn send(&mut self, to: &ListenEndpoint, message: &LeaseMessage, rla: Option<&RemoteLeaseAgent>) {
        if self.closed {
            return;
        }
        let frame = OutboundFrame {
            frame: message.encode(),
            rla: rla.map(|rla| rla.instance),
            is_lease_request: message.message_type == crate::message::MessageType::LeaseRequest,
            _inflight: rla.map(RemoteLeaseAgent::inflight_guard),
        };
        debug!(
            local = %self.local,
            remote = %to,
            message_type = ?message.message_type,
            message_id = message.message_id,
            lease_instance = %message.lease_instance,
            "sending lease message"
        );
        let queue = self
            .queues
            .entry(to.clone())
            .or_insert_with(|| spawn_send_queue(&self.scheduler, &self.local, to, &self.transport, &self.agent));
        if queue.sender.send(frame).is_err() {
            warn!(local = %self.local, remote = %to, "send queue closed, dropping frame");
        }
    }

    /// Discards queued frames for `to` and drops the connection.
    pub(crate) fn abort(&mut self, to: &ListenEndpoint) {
        if let Some(queue) = self.queues.remove(to) {
            queue.task.abort();
        }
        self.transport.abort(&self.local, to);
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (_, queue) in self.queues.drain() {
            queue.task.abort();
        }
        self.transport.close(&self.local);
    }
}

fn spawn_send_queue(
    scheduler: &Scheduler,
    local: &ListenEndpoint,
    to: &ListenEndpoint,
    transport: &Arc<dyn Transport>,
    agent: &Weak<LeaseAgent>,
) -> SendQueue {
    let (sender, mut receiver) = mpsc::unbounded_channel::<OutboundFrame>();
    let local = local.clone();
    let to = to.clone();
    let transport = transport.clone();
    let agent = agent.clone();
    let task = scheduler.spawn(async move {
        while let Some(OutboundFrame {
            frame,
            rla,
            is_lease_request,
            _inflight,
        }) = receiver.recv().await
        {
            let result = transport.send(&local, &to, frame).await;
            if let Some(agent) = agent.upgrade() {
                agent.on_send_complete(rla, is_lease_request, result);
            }
        }
    });
    SendQueue { sender, task }
}

#[derive(Debug)]
pub(crate) struct PendingVerification {
    thumbprint: blake3::Hash,
    sender: oneshot::Sender<bool>,
}

enum Verification {
    Decided(bool),
    Pending {
        operation: Uuid,
        receiver: oneshot::Receiver<bool>,
        timeout_ms: i32,
    },
}

/// Everything an agent owns except its RLA table.
#[derive(Debug)]
pub(crate) struct AgentContext {
    pub instance: Instance,
    pub endpoint: ListenEndpoint,
    pub state: AgentState,
    pub durations: DurationConfig,
    pub security: SecuritySettings,
    pub engine: EngineConfig,
    pub apps: BTreeMap<String, LeasingApplication>,
    pub unregister_list: Vec<LeasingApplication>,
    /// Latched deadline after which an idle agent is failed by maintenance.
    pub time_to_be_failed: Option<i64>,
    pub is_in_delay_timer: bool,
    pub delayed_failure_timer: ScheduledTask,
    pub is_blocked: bool,
    pub cert_cache: HashMap<blake3::Hash, bool>,
    pub cert_pending: HashMap<Uuid, PendingVerification>,
    pub scheduler: Scheduler,
    pub weak: Weak<LeaseAgent>,
    pub outbox: Outbox,
    pub behaviors: Arc<TransportBehaviorTable>,
    deferred: Vec<Deferred>,
}

impl AgentContext {
    pub(crate) fn now(&self) -> i64 {
        self.scheduler.now()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state == AgentState::Failed
    }

    pub(crate) fn defer(&mut self, action: Deferred) {
        if !self.deferred.contains(&action) {
            self.deferred.push(action);
        }
    }

    /// Arms one of `rla`'s timers; the fire re-enters the agent through its weak handle.
    pub(crate) fn arm(&self, rla: &mut RemoteLeaseAgent, kind: RlaTimer, at: i64) {
        let agent = self.weak.clone();
        let rla_instance = rla.instance;
        debug!(rla = %rla_instance, timer = ?kind, at, "arming timer");
        rla.timers.get_mut(kind).arm(&self.scheduler, at, move |generation| {
            if let Some(agent) = agent.upgrade() {
                agent.fire_rla_timer(rla_instance, kind, generation);
            }
        });
    }

    pub(crate) fn deliver_to(&mut self, app: &str, event: LeaseEvent) {
        match self.apps.get_mut(app) {
            Some(app) => app.deliver(event),
            None => debug!(app, ?event, "no application for event"),
        }
    }

    pub(crate) fn first_arbitration_app(&self) -> Option<String> {
        self.apps
            .values()
            .find(|app| app.is_arbitration_enabled && !app.is_being_unregistered)
            .map(|app| app.identifier.clone())
    }

    fn app_by_instance(&self, instance: Instance) -> Option<&LeasingApplication> {
        self.apps.values().find(|app| app.instance == instance)
    }

    pub(crate) fn app_identifier(&self, instance: Instance) -> Result<String> {
        self.app_by_instance(instance)
            .map(|app| app.identifier.clone())
            .ok_or_else(|| Error::NotFound(format!("leasing application {instance}")))
    }

    fn begin_certificate_verification(
        &mut self,
        remote: &ListenEndpoint,
        certificate: Bytes,
    ) -> Verification {
        if self.is_failed() {
            return Verification::Decided(false);
        }
        let thumbprint = blake3::hash(&certificate);
        if let Some(verdict) = self.cert_cache.get(&thumbprint) {
            return Verification::Decided(*verdict);
        }
        let Some(app) = self.apps.values_mut().find(|app| !app.is_being_unregistered) else {
            warn!(agent = %self.instance, %remote, "no application to verify remote certificate");
            return Verification::Decided(false);
        };
        let operation = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        app.deliver(LeaseEvent::RemoteCertVerify {
            operation,
            remote_endpoint: remote.clone(),
            certificate,
            thumbprint: thumbprint.to_hex().to_string(),
        });
        self.cert_pending
            .insert(operation, PendingVerification { thumbprint, sender });
        Verification::Pending {
            operation,
            receiver,
            timeout_ms: self.durations.lease_duration,
        }
    }
}

pub(crate) struct AgentInner {
    pub ctx: AgentContext,
    pub rlas: BTreeMap<Instance, RemoteLeaseAgent>,
}

impl AgentInner {
    fn run_deferred(&mut self) {
        loop {
            let batch = std::mem::take(&mut self.ctx.deferred);
            if batch.is_empty() {
                return;
            }
            for action in batch {
                match action {
                    Deferred::LeaseFailure => self.on_lease_failure(),
                    Deferred::IndirectForward(rla) => self.send_indirect_lease_forward_messages(rla),
                }
            }
        }
    }

    /// Fails the agent and every RLA, and closes its transport. Idempotent.
    pub(crate) fn fail_agent(&mut self) {
        if self.ctx.is_failed() {
            return;
        }
        info!(agent = %self.ctx.instance, endpoint = %self.ctx.endpoint, "lease agent failed");
        self.ctx.state = AgentState::Failed;
        let now = self.ctx.now();
        for rla in self.rlas.values_mut() {
            rla.fail(now);
        }
        self.ctx.delayed_failure_timer.cancel();
        self.ctx.is_in_delay_timer = false;
        self.ctx.outbox.close();
        for (_, pending) in self.ctx.cert_pending.drain() {
            let _ = pending.sender.send(false);
        }
    }

    pub(crate) fn active_rla_for(&self, endpoint: &ListenEndpoint) -> Option<Instance> {
        self.rlas
            .values()
            .find(|rla| rla.is_active && &rla.remote_endpoint == endpoint)
            .map(|rla| rla.instance)
    }

    /// Marks `rla` failed and inactive; an abort also drops its connection.
    pub(crate) fn disconnect(&mut self, rla: Instance, abort: bool) {
        let now = self.ctx.now();
        let Some(rla) = self.rlas.get_mut(&rla) else {
            return;
        };
        rla.fail(now);
        rla.is_active = false;
        if abort {
            self.ctx.outbox.abort(&rla.remote_endpoint);
        }
    }

    fn create_application(
        &mut self,
        identifier: &str,
        is_arbitration_enabled: bool,
        process_id: u32,
    ) -> Result<Instance> {
        if self.ctx.is_failed() {
            return Err(Error::Retry(format!("lease agent {} is failed", self.ctx.instance)));
        }
        if identifier.is_empty() || identifier.len() > APP_IDENTIFIER_MAX {
            return Err(Error::InvalidParameter(format!(
                "application identifier must be 1..={APP_IDENTIFIER_MAX} bytes"
            )));
        }
        if self.ctx.apps.contains_key(identifier) {
            return Err(Error::ObjectIdExists(identifier.to_string()));
        }
        let app = LeasingApplication::new(
            identifier,
            process_id,
            is_arbitration_enabled,
            self.ctx.durations.app_expiry_timeout,
            self.ctx.engine.event_queue_capacity,
        );
        let instance = app.instance;
        info!(agent = %self.ctx.instance, app = identifier, %instance, "leasing application created");
        self.ctx.apps.insert(identifier.to_string(), app);
        self.ctx.time_to_be_failed = None;
        Ok(instance)
    }

    fn register_application(&mut self, instance: Instance) -> Result<EventRegistration> {
        let identifier = self.ctx.app_identifier(instance)?;
        match self.ctx.apps.get_mut(&identifier) {
            Some(app) if !app.is_being_unregistered => app.register(),
            _ => Err(Error::NotFound(format!("leasing application {instance}"))),
        }
    }

    fn unregister_application(&mut self, instance: Instance, delayed: bool) -> Result<()> {
        let identifier = self.ctx.app_identifier(instance)?;
        let already = self
            .ctx
            .apps
            .get(&identifier)
            .is_some_and(|app| app.is_being_unregistered);
        if already {
            return Ok(());
        }
        let delay = if delayed && !self.ctx.is_failed() {
            self.application_ttl(&identifier, 0).max(0)
        } else {
            0
        };
        let now = self.ctx.now();
        let agent = self.ctx.weak.clone();
        let scheduler = self.ctx.scheduler.clone();
        let Some(app) = self.ctx.apps.get_mut(&identifier) else {
            return Err(Error::NotFound(identifier));
        };
        info!(app = %identifier, delay, "unregistering leasing application");
        app.is_being_unregistered = true;
        let name = identifier.clone();
        app.unregister_timer
            .arm(&scheduler, now + i64::from(delay), move |generation| {
                if let Some(agent) = agent.upgrade() {
                    agent.fire_unregister_timer(&name, generation);
                }
            });
        Ok(())
    }

    /// Terminates every relationship of `identifier` and moves it to the unregister list.
    pub(crate) fn finish_unregister(&mut self, identifier: &str) {
        let AgentInner { ctx, rlas } = self;
        for rla in rlas.values_mut() {
            if rla.is_in_arbitration() && rla.arbitration_app.as_deref() == Some(identifier) {
                ctx.defer(Deferred::LeaseFailure);
            }
            if rla.is_failed() || rla.is_suspended() {
                continue;
            }
            ctx.terminate_all(rla, identifier, true);
        }
        if let Some(mut app) = ctx.apps.remove(identifier) {
            app.unregister_timer.cancel();
            app.cancel_registration();
            info!(agent = %ctx.instance, app = identifier, "leasing application unregistered");
            ctx.unregister_list.push(app);
        }
    }

    fn update_durations(&mut self, durations: DurationConfig) -> Result<()> {
        durations.validate()?;
        info!(agent = %self.ctx.instance, lease_duration = durations.lease_duration, "lease durations updated");
        self.ctx.durations = durations;
        for rla in self.rlas.values_mut() {
            rla.relationship.is_duration_updated = true;
        }
        Ok(())
    }

    fn query_lease_duration(&self, remote: &ListenEndpoint) -> Result<i32> {
        let rla = self
            .rlas
            .values()
            .find(|rla| rla.is_active && !rla.is_failed() && &rla.remote_endpoint == remote)
            .ok_or_else(|| Error::NotFound(format!("no active relationship with {remote}")))?;
        let durations = rla.relationship.durations;
        if durations.any_unset() {
            Ok(self
                .ctx
                .durations
                .lease_duration_for(rla.relationship.establish_duration_type))
        } else {
            Ok(durations.duration)
        }
    }

    fn complete_certificate_verification(&mut self, operation: Uuid, verified: bool) -> Result<()> {
        let pending = self
            .ctx
            .cert_pending
            .remove(&operation)
            .ok_or_else(|| Error::NotFound(format!("certificate verification {operation}")))?;
        info!(agent = %self.ctx.instance, %operation, verified, "remote certificate verified");
        self.ctx.cert_cache.insert(pending.thumbprint, verified);
        let _ = pending.sender.send(verified);
        Ok(())
    }
}

/// A lease agent bound to one local listen endpoint.
pub struct LeaseAgent {
    pub instance: Instance,
    pub endpoint: ListenEndpoint,
    inner: Mutex<AgentInner>,
}

impl std::fmt::Debug for LeaseAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseAgent")
            .field("instance", &self.instance)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl LeaseAgent {
    pub(crate) fn new(
        endpoint: ListenEndpoint,
        durations: DurationConfig,
        security: SecuritySettings,
        engine: EngineConfig,
        transport: Arc<dyn Transport>,
        behaviors: Arc<TransportBehaviorTable>,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        let instance = next_instance();
        Arc::new_cyclic(|weak: &Weak<LeaseAgent>| {
            let outbox = Outbox::new(endpoint.clone(), transport, weak.clone(), scheduler.clone());
            LeaseAgent {
                instance,
                endpoint: endpoint.clone(),
                inner: Mutex::new(AgentInner {
                    ctx: AgentContext {
                        instance,
                        endpoint,
                        state: AgentState::Open,
                        durations,
                        security,
                        engine,
                        apps: BTreeMap::new(),
                        unregister_list: Vec::new(),
                        time_to_be_failed: None,
                        is_in_delay_timer: false,
                        delayed_failure_timer: ScheduledTask::default(),
                        is_blocked: false,
                        cert_cache: HashMap::new(),
                        cert_pending: HashMap::new(),
                        scheduler,
                        weak: weak.clone(),
                        outbox,
                        behaviors,
                        deferred: Vec::new(),
                    },
                    rlas: BTreeMap::new(),
                }),
            }
        })
    }

    /// Runs `f` under the agent lock, then any agent-wide work it deferred.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut AgentInner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        inner.run_deferred();
        result
    }

    pub(crate) fn inbound_handler(self: &Arc<Self>) -> Arc<dyn InboundHandler> {
        Arc::new(AgentInbound {
            agent: Arc::downgrade(self),
        })
    }

    pub fn state(&self) -> AgentState {
        self.inner.lock().ctx.state
    }

    pub fn is_failed(&self) -> bool {
        self.state() == AgentState::Failed
    }

    pub fn security(&self) -> SecuritySettings {
        self.inner.lock().ctx.security.clone()
    }

    pub fn durations(&self) -> DurationConfig {
        self.inner.lock().ctx.durations.clone()
    }

    pub fn has_application(&self, instance: Instance) -> bool {
        self.inner.lock().ctx.app_by_instance(instance).is_some()
    }

    pub fn remote_lease_agents(&self) -> Vec<RemoteLeaseAgentSnapshot> {
        self.inner
            .lock()
            .rlas
            .values()
            .map(RemoteLeaseAgent::snapshot)
            .collect()
    }

    pub(crate) fn has_open_relationship(&self) -> bool {
        self.inner.lock().rlas.values().any(RemoteLeaseAgent::is_open)
    }

    /// Re-use by a new create request: adopt its durations and cancel a pending idle failure.
    pub(crate) fn reuse(&self, durations: DurationConfig) {
        self.with_inner(|inner| {
            if inner.can_be_failed() {
                inner.ctx.time_to_be_failed = None;
            }
            inner.ctx.durations = durations;
        });
    }

    /// Fails a freshly created agent whose listener could not be started.
    pub(crate) fn abandon(&self) {
        self.with_inner(AgentInner::fail_agent);
    }

    pub fn close(&self) {
        info!(agent = %self.instance, endpoint = %self.endpoint, "closing lease agent");
        self.with_inner(AgentInner::fail_agent);
    }

    /// Drops all inbound and outbound lease traffic from now on.
    pub fn block(&self) {
        info!(agent = %self.instance, endpoint = %self.endpoint, "blocking lease agent");
        self.with_inner(|inner| inner.ctx.is_blocked = true);
    }

    pub fn create_application(
        &self,
        identifier: &str,
        is_arbitration_enabled: bool,
        process_id: u32,
    ) -> Result<Instance> {
        self.with_inner(|inner| inner.create_application(identifier, is_arbitration_enabled, process_id))
    }

    pub fn register_application(&self, instance: Instance) -> Result<EventRegistration> {
        self.with_inner(|inner| inner.register_application(instance))
    }

    pub fn unregister_application(&self, instance: Instance, delayed: bool) -> Result<()> {
        self.with_inner(|inner| inner.unregister_application(instance, delayed))
    }

    /// Unregisters, with delay, every application owned by `process_id`.
    pub fn on_process_exit(&self, process_id: u32) {
        self.with_inner(|inner| {
            let now = inner.ctx.now();
            let exited = inner
                .ctx
                .apps
                .values_mut()
                .chain(inner.ctx.unregister_list.iter_mut())
                .filter(|app| app.process_id == process_id);
            for app in exited {
                if let Some(asserted_at) = app.process_assert_time.take() {
                    info!(app = %app.identifier, process_id, elapsed_ms = now - asserted_at, "asserted process exited");
                }
            }
            let owned: Vec<Instance> = inner
                .ctx
                .apps
                .values()
                .filter(|app| app.process_id == process_id && !app.is_being_unregistered)
                .map(|app| app.instance)
                .collect();
            for instance in owned {
                if let Err(error) = inner.unregister_application(instance, true) {
                    warn!(%instance, %error, "unregister on process exit failed");
                }
            }
        });
    }

    /// The process asserted: its applications are unregistered at once and kept on the
    /// unregister list until the process exits.
    pub fn on_process_assert(&self, process_id: u32) {
        self.with_inner(|inner| {
            if inner.ctx.is_failed() {
                return;
            }
            let now = inner.ctx.now();
            let owned: Vec<Instance> = inner
                .ctx
                .apps
                .values_mut()
                .filter(|app| app.process_id == process_id)
                .map(|app| {
                    app.process_assert_time = Some(now);
                    app.instance
                })
                .collect();
            for instance in owned {
                if let Err(error) = inner.unregister_application(instance, false) {
                    warn!(%instance, %error, "unregister on process assert failed");
                }
            }
        });
    }

    pub fn update_durations(&self, durations: DurationConfig) -> Result<()> {
        self.with_inner(|inner| inner.update_durations(durations))
    }

    pub fn update_global_config(
        &self,
        unresponsive_duration: i32,
        app_expiry_timeout: i32,
        process_assert_exit_timeout_ms: i64,
    ) {
        self.with_inner(|inner| {
            inner.ctx.durations.unresponsive_duration = unresponsive_duration;
            inner.ctx.durations.app_expiry_timeout = app_expiry_timeout;
            inner.ctx.engine.process_assert_exit_timeout_ms = process_assert_exit_timeout_ms;
            for app in inner.ctx.apps.values_mut() {
                app.expiry_timeout = app_expiry_timeout;
            }
        });
    }

    pub fn query_lease_duration(&self, remote: &ListenEndpoint) -> Result<i32> {
        self.with_inner(|inner| inner.query_lease_duration(remote))
    }

    pub fn update_certificate(&self, thumbprint: &str) {
        self.with_inner(|inner| {
            inner.ctx.security.provider = SecurityProvider::Certificate {
                thumbprint: thumbprint.to_string(),
            };
            inner.ctx.cert_cache.clear();
            let security = inner.ctx.security.clone();
            inner.ctx.outbox.transport.update_security(&inner.ctx.endpoint, &security);
        });
    }

    pub fn complete_certificate_verification(&self, operation: Uuid, verified: bool) -> Result<()> {
        self.with_inner(|inner| inner.complete_certificate_verification(operation, verified))
    }

    async fn verify_certificate(&self, remote: &ListenEndpoint, certificate: Bytes) -> bool {
        let verification =
            self.with_inner(|inner| inner.ctx.begin_certificate_verification(remote, certificate));
        let (operation, receiver, timeout_ms) = match verification {
            Verification::Decided(verdict) => return verdict,
            Verification::Pending {
                operation,
                receiver,
                timeout_ms,
            } => (operation, receiver, timeout_ms),
        };
        let timeout = Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(verdict)) => verdict,
            _ => {
                warn!(agent = %self.instance, %remote, %operation, "certificate verification timed out");
                self.with_inner(|inner| inner.ctx.cert_pending.remove(&operation));
                false
            }
        }
    }

    fn on_send_complete(&self, rla: Option<Instance>, is_lease_request: bool, result: Result<()>) {
        let Some(rla_instance) = rla else {
            if let Err(error) = result {
                debug!(agent = %self.instance, %error, "send failed");
            }
            return;
        };
        self.with_inner(|inner| {
            let AgentInner { ctx, rlas } = inner;
            let Some(rla) = rlas.get_mut(&rla_instance) else {
                return;
            };
            match result {
                Ok(()) => {
                    if is_lease_request {
                        rla.relationship.lease_message_sent = true;
                    }
                }
                Err(error) => {
                    if ctx.is_failed() || rla.is_failed() {
                        return;
                    }
                    warn!(rla = %rla.instance, remote = %rla.remote_endpoint, %error, "send failed");
                    ctx.inform_remote_failed(rla, true);
                    ctx.inform_remote_failed(rla, false);
                    rla.fail(ctx.now());
                }
            }
        });
    }

    pub(crate) fn fire_rla_timer(&self, rla_instance: Instance, kind: RlaTimer, generation: u64) {
        self.with_inner(|inner| {
            let AgentInner { ctx, rlas } = inner;
            let Some(rla) = rlas.get_mut(&rla_instance) else {
                return;
            };
            if !rla.timers.get_mut(kind).take_fire(generation) {
                return;
            }
            debug!(rla = %rla_instance, timer = ?kind, subject = %rla.subject_state(), monitor = %rla.monitor_state(), "timer fired");
            match kind {
                RlaTimer::Subject => ctx.on_subject_timer(rla),
                RlaTimer::Monitor => ctx.on_monitor_timer(rla),
                RlaTimer::RenewOrArbitrate => ctx.on_renew_or_arbitrate_timer(rla),
                RlaTimer::PreArbitrationSubject | RlaTimer::PreArbitrationMonitor => {
                    ctx.on_pre_arbitration_timer(rla);
                }
                RlaTimer::PostArbitration => ctx.on_monitor_expired(rla),
                RlaTimer::PingRetry => ctx.on_ping_retry_timer(rla),
            }
        });
    }

    fn fire_unregister_timer(&self, identifier: &str, generation: u64) {
        self.with_inner(|inner| {
            let fired = inner
                .ctx
                .apps
                .get_mut(identifier)
                .is_some_and(|app| app.unregister_timer.take_fire(generation));
            if fired {
                inner.finish_unregister(identifier);
            }
        });
    }

    pub(crate) fn fire_delayed_failure(&self, generation: u64) {
        self.with_inner(|inner| {
            if inner.ctx.delayed_failure_timer.take_fire(generation) {
                inner.on_delayed_lease_failure();
            }
        });
    }

    pub(crate) fn process_frame(&self, peer: &ListenEndpoint, frame: &[u8]) {
        self.with_inner(|inner| inner.process_frame(peer, frame));
    }

    fn accepts_connections(&self) -> bool {
        let inner = self.inner.lock();
        !inner.ctx.is_failed() && !inner.ctx.is_blocked
    }
}

struct AgentInbound {
    agent: Weak<LeaseAgent>,
}

#[async_trait]
impl InboundHandler for AgentInbound {
    fn accept(&self, _local: &ListenEndpoint, remote: &ListenEndpoint) -> bool {
        let accepted = self
            .agent
            .upgrade()
            .is_some_and(|agent| agent.accepts_connections());
        if !accepted {
            debug!(%remote, "rejecting inbound connection");
        }
        accepted
    }

    fn deliver(&self, remote: &ListenEndpoint, frame: Bytes) {
        if let Some(agent) = self.agent.upgrade() {
            agent.process_frame(remote, &frame);
        }
    }

    async fn verify_certificate(&self, remote: &ListenEndpoint, certificate: Bytes) -> bool {
        match self.agent.upgrade() {
            Some(agent) => agent.verify_certificate(remote, certificate).await,
            None => false,
        }
    }
}

impl AgentContext {
    /// Raises `RemoteLeasingApplicationExpired` for the subject or monitor entries of `rla`.
    pub(crate) fn inform_remote_failed(&mut self, rla: &RemoteLeaseAgent, subject: bool) {
        if subject {
            for id in rla.subject.keys() {
                self.deliver_to(
                    &id.local_app,
                    LeaseEvent::RemoteLeasingApplicationExpired {
                        remote_app: id.remote_app.clone(),
                    },
                );
            }
        } else {
            for id in &rla.monitor {
                self.deliver_to(
                    &id.remote_app,
                    LeaseEvent::RemoteLeasingApplicationExpired {
                        remote_app: id.local_app.clone(),
                    },
                );
            }
        }
    }

    pub(crate) fn either_side_expired(rla: &RemoteLeaseAgent) -> bool {
        rla.subject_state() >= OneWayState::Expired || rla.monitor_state() >= OneWayState::Expired
    }
}

