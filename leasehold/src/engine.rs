//! The lease engine: registry of lease agents and the operations the host surface calls.
//!
//! Lock order is registry first, then an agent. Agent locks are never held while the registry
//! lock is taken.

use crate::{
    agent::LeaseAgent,
    application::EventRegistration,
    arbitration::ArbitrationResult,
    config::{DurationConfig, DurationType, EngineConfig, SecuritySettings},
    endpoint::ListenEndpoint,
    identifier::LeaseHandle,
    lease::EstablishedLease,
    maintenance::{AbortOnFatal, FatalHandler, HeartbeatMonitor},
    time::{Instance, MonotonicClock},
    timer::Scheduler,
    transport::{Transport, TransportBehavior, TransportBehaviorTable},
    ttl::RemoteLeaseExpiration,
    Error, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct LeaseEngine {
    config: RwLock<EngineConfig>,
    transport: Arc<dyn Transport>,
    behaviors: Arc<TransportBehaviorTable>,
    scheduler: Scheduler,
    agents: Mutex<BTreeMap<Instance, Arc<LeaseAgent>>>,
    heartbeat: Mutex<HeartbeatMonitor>,
    fatal: Arc<dyn FatalHandler>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LeaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseEngine")
            .field("agents", &self.agents.lock().len())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl LeaseEngine {
    /// Creates an engine on the current tokio runtime. Unresponsive hosts abort the process.
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_fatal_handler(config, transport, Arc::new(AbortOnFatal))
    }

    pub fn with_fatal_handler(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        fatal: Arc<dyn FatalHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            transport,
            behaviors: Arc::new(TransportBehaviorTable::default()),
            scheduler: Scheduler::current(MonotonicClock::new()),
            agents: Mutex::new(BTreeMap::new()),
            heartbeat: Mutex::new(HeartbeatMonitor::default()),
            fatal,
            maintenance: Mutex::new(None),
        })
    }

    /// Starts the periodic maintenance sweep.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let period = Duration::from_millis(self.config.read().maintenance_interval_ms);
        let engine: Weak<LeaseEngine> = Arc::downgrade(self);
        info!(interval_ms = period.as_millis(), "starting lease maintenance");
        *slot = Some(self.scheduler.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.run_maintenance();
            }
        }));
    }

    /// Stops maintenance and fails every agent.
    pub fn shutdown(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        let agents: Vec<_> = self.agents.lock().values().cloned().collect();
        for agent in agents {
            agent.close();
        }
    }

    /// Engine time in milliseconds.
    pub fn now(&self) -> i64 {
        self.scheduler.now()
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn agents(&self) -> Vec<Arc<LeaseAgent>> {
        self.agents.lock().values().cloned().collect()
    }

    pub fn agent(&self, instance: Instance) -> Option<Arc<LeaseAgent>> {
        self.agents.lock().get(&instance).cloned()
    }

    fn open_agent_for(&self, endpoint: &ListenEndpoint) -> Result<Arc<LeaseAgent>> {
        self.agents
            .lock()
            .values()
            .find(|agent| &agent.endpoint == endpoint && !agent.is_failed())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("lease agent on {endpoint}")))
    }

    fn agent_for_app(&self, app_instance: Instance) -> Result<Arc<LeaseAgent>> {
        self.agents
            .lock()
            .values()
            .find(|agent| !agent.is_failed() && agent.has_application(app_instance))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("leasing application {app_instance}")))
    }

    /// Creates a lease agent on `endpoint`, or reuses the open one already there.
    pub async fn create_lease_agent(
        &self,
        endpoint: ListenEndpoint,
        durations: DurationConfig,
        security: SecuritySettings,
    ) -> Result<Arc<LeaseAgent>> {
        endpoint.validate()?;
        durations.validate()?;
        let agent = {
            let mut agents = self.agents.lock();
            if let Some(existing) = agents
                .values()
                .find(|agent| agent.endpoint == endpoint && !agent.is_failed())
            {
                if !existing.security().same_provider(&security) {
                    return Err(Error::Retry(format!(
                        "lease agent on {endpoint} runs a different security provider"
                    )));
                }
                debug!(agent = %existing.instance, %endpoint, "reusing lease agent");
                existing.reuse(durations);
                return Ok(existing.clone());
            }
            let engine_config = self.config.read().clone();
            let agent = LeaseAgent::new(
                endpoint.clone(),
                durations,
                security.clone(),
                engine_config,
                self.transport.clone(),
                self.behaviors.clone(),
                self.scheduler.clone(),
            );
            agents.insert(agent.instance, agent.clone());
            agent
        };

        if let Err(error) = self
            .transport
            .listen(&endpoint, &security, agent.inbound_handler())
            .await
        {
            warn!(agent = %agent.instance, %endpoint, %error, "failed to listen, abandoning lease agent");
            agent.abandon();
            return Err(match error {
                Error::Transport(message) => Error::Retry(message),
                other => other,
            });
        }
        info!(agent = %agent.instance, %endpoint, "lease agent created");
        Ok(agent)
    }

    pub fn close_lease_agent(&self, endpoint: &ListenEndpoint) -> Result<()> {
        self.open_agent_for(endpoint)?.close();
        Ok(())
    }

    pub fn block_lease_agent(&self, endpoint: &ListenEndpoint) -> Result<()> {
        self.open_agent_for(endpoint)?.block();
        Ok(())
    }

    pub fn create_leasing_application(
        &self,
        agent_instance: Instance,
        identifier: &str,
        is_arbitration_enabled: bool,
        process_id: u32,
    ) -> Result<Instance> {
        let agent = self
            .agent(agent_instance)
            .ok_or_else(|| Error::NotFound(format!("lease agent {agent_instance}")))?;
        agent.create_application(identifier, is_arbitration_enabled, process_id)
    }

    /// The agent hosting `app_instance`, failed or not, so expiry events can still be drained.
    fn hosting_agent(&self, app_instance: Instance) -> Result<Arc<LeaseAgent>> {
        self.agents
            .lock()
            .values()
            .find(|agent| agent.has_application(app_instance))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("leasing application {app_instance}")))
    }

    /// Resolves with the next event for the application. Cancel through the returned handle.
    pub fn register_leasing_application(&self, app_instance: Instance) -> Result<EventRegistration> {
        self.hosting_agent(app_instance)?
            .register_application(app_instance)
    }

    pub fn unregister_leasing_application(&self, app_instance: Instance, delayed: bool) -> Result<()> {
        self.hosting_agent(app_instance)?
            .unregister_application(app_instance, delayed)
    }

    /// Unregisters, after their TTL, every application the exited process owned.
    pub fn on_process_exit(&self, process_id: u32) {
        info!(process_id, "process exited");
        for agent in self.agents() {
            agent.on_process_exit(process_id);
        }
    }

    /// The process is going down: its applications are unregistered now, and it must exit
    /// within the process-assert exit timeout.
    pub fn on_process_assert(&self, process_id: u32) {
        warn!(process_id, "process asserted");
        for agent in self.agents() {
            agent.on_process_assert(process_id);
        }
    }

    pub fn establish_lease(
        &self,
        app_instance: Instance,
        remote_endpoint: &ListenEndpoint,
        remote_app: &str,
        duration_type: DurationType,
    ) -> Result<EstablishedLease> {
        self.establish_lease_with_instance(app_instance, remote_endpoint, remote_app, duration_type, Instance::NONE)
    }

    /// Establish against a known incarnation of the remote agent; older RLAs to it are replaced.
    pub fn establish_lease_with_instance(
        &self,
        app_instance: Instance,
        remote_endpoint: &ListenEndpoint,
        remote_app: &str,
        duration_type: DurationType,
        remote_instance: Instance,
    ) -> Result<EstablishedLease> {
        let agent = self.agent_for_app(app_instance)?;
        agent.with_inner(|inner| {
            inner.establish_lease_relationship(
                app_instance,
                remote_endpoint,
                remote_app,
                duration_type,
                remote_instance,
            )
        })
    }

    pub fn terminate_lease(&self, app_instance: Instance, lease: LeaseHandle, remote_app: &str) -> Result<()> {
        let agent = self.agent_for_app(app_instance)?;
        agent.with_inner(|inner| inner.terminate_lease_relationship(app_instance, lease, remote_app))
    }

    /// Zero once the hosting agent has failed.
    pub fn get_leasing_application_expiration_time(&self, app_instance: Instance, request_ttl: i32) -> Result<i32> {
        let agent = self.hosting_agent(app_instance)?;
        agent.with_inner(|inner| {
            let identifier = inner.ctx.app_identifier(app_instance)?;
            Ok(inner.application_ttl(&identifier, request_ttl))
        })
    }

    pub fn get_remote_lease_expiration_time(
        &self,
        app_instance: Instance,
        remote_app: &str,
    ) -> Result<RemoteLeaseExpiration> {
        let agent = self.agent_for_app(app_instance)?;
        agent.with_inner(|inner| inner.remote_expiration(app_instance, remote_app))
    }

    pub fn set_global_lease_expiration_time(&self, app_instance: Instance, expire_time: i64) -> Result<()> {
        let agent = self.agent_for_app(app_instance)?;
        agent.with_inner(|inner| inner.set_global_lease_expiration_time(app_instance, expire_time))
    }

    pub fn process_arbitration_result(&self, result: &ArbitrationResult) -> Result<()> {
        let agent = self
            .agents
            .lock()
            .get(&result.agent_instance)
            .filter(|agent| !agent.is_failed() && agent.has_application(result.app_instance))
            .cloned()
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "no open lease agent {} with application {}",
                    result.agent_instance, result.app_instance
                ))
            })?;
        agent.with_inner(|inner| inner.process_arbitration_result(result))
    }

    pub fn update_certificate(&self, endpoint: &ListenEndpoint, thumbprint: &str) -> Result<()> {
        self.open_agent_for(endpoint)?.update_certificate(thumbprint);
        Ok(())
    }

    pub fn process_remote_cert_verify_result(
        &self,
        app_instance: Instance,
        operation: Uuid,
        verified: bool,
    ) -> Result<()> {
        self.agent_for_app(app_instance)?
            .complete_certificate_verification(operation, verified)
    }

    pub fn update_config_lease_duration(&self, endpoint: &ListenEndpoint, durations: DurationConfig) -> Result<()> {
        self.open_agent_for(endpoint)?.update_durations(durations)
    }

    pub fn update_lease_global_config(
        &self,
        unresponsive_duration: i32,
        app_expiry_timeout: i32,
        process_assert_exit_timeout_ms: i64,
    ) -> Result<()> {
        if unresponsive_duration < 0 {
            return Err(Error::InvalidDuration {
                name: "unresponsive_duration",
                value: unresponsive_duration,
            });
        }
        if process_assert_exit_timeout_ms <= 0 {
            return Err(Error::InvalidParameter(format!(
                "process assert exit timeout must be > 0, got {process_assert_exit_timeout_ms}"
            )));
        }
        {
            let mut config = self.config.write();
            config.durations.unresponsive_duration = unresponsive_duration;
            config.durations.app_expiry_timeout = app_expiry_timeout;
            config.process_assert_exit_timeout_ms = process_assert_exit_timeout_ms;
        }
        info!(unresponsive_duration, app_expiry_timeout, process_assert_exit_timeout_ms, "global lease config updated");
        for agent in self.agents() {
            agent.update_global_config(unresponsive_duration, app_expiry_timeout, process_assert_exit_timeout_ms);
        }
        Ok(())
    }

    pub fn query_lease_duration(&self, local: &ListenEndpoint, remote: &ListenEndpoint) -> Result<i32> {
        self.open_agent_for(local)?.query_lease_duration(remote)
    }

    pub fn heartbeat(&self, error_code: i32) {
        let now = self.now();
        self.heartbeat.lock().record(now, error_code);
    }

    pub fn add_transport_behavior(&self, rule: TransportBehavior) {
        self.behaviors.add(rule);
    }

    pub fn clear_transport_behavior(&self, alias: &str) {
        self.behaviors.clear(alias);
    }

    /// One maintenance sweep; holds the registry lock throughout.
    pub fn run_maintenance(&self) {
        let mut agents = self.agents.lock();
        let mut released = Vec::new();
        let mut hung_process = None;
        for (instance, agent) in agents.iter() {
            let outcome = agent.maintain();
            if outcome.deallocate {
                released.push(*instance);
            }
            hung_process = hung_process.or(outcome.hung_process);
        }
        if let Some((process_id, elapsed)) = hung_process {
            self.fatal.on_process_assert_exit_timeout(process_id, elapsed);
        }
        for instance in released {
            if let Some(agent) = agents.remove(&instance) {
                info!(agent = %instance, endpoint = %agent.endpoint, "lease agent deallocated");
            }
        }

        let unresponsive_duration = self.config.read().durations.unresponsive_duration;
        let elapsed = self
            .heartbeat
            .lock()
            .unresponsive_for(self.now(), unresponsive_duration);
        if let Some(elapsed) = elapsed {
            if agents.values().any(|agent| agent.has_open_relationship()) {
                self.fatal.on_unresponsive(elapsed);
            } else {
                debug!(elapsed, "heartbeat overdue with no open relationships");
            }
        }
    }
}

impl Drop for LeaseEngine {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance.get_mut().take() {
            task.abort();
        }
    }
}
