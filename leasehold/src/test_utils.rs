use crate::{
    agent::LeaseAgent,
    application::LeaseEvent,
    config::{DurationConfig, EngineConfig, SecurityProvider, SecuritySettings},
    endpoint::ListenEndpoint,
    engine::LeaseEngine,
    maintenance::FatalHandler,
    time::Instance,
    transport::{InboundHandler, Transport},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySimulator {
    pub base_ms: u64,
    pub jitter_ms: u64,
}

impl LatencySimulator {
    pub fn fixed(base_ms: u64) -> Self {
        Self { base_ms, jitter_ms: 0 }
    }

    pub async fn simulate(&self) {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        let delay = self.base_ms + jitter;
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
    }
}

struct Listener {
    handler: Arc<dyn InboundHandler>,
    security: SecuritySettings,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("security", &self.security).finish_non_exhaustive()
    }
}

/// In-process [`Transport`] connecting lease agents by listen endpoint.
///
/// A partitioned link drops frames silently, like a black-holed route; a severed link fails
/// sends, like a reset connection.
#[derive(Debug, Default)]
pub struct SimulatedNetwork {
    listeners: DashMap<ListenEndpoint, Listener>,
    connections: DashSet<(ListenEndpoint, ListenEndpoint)>,
    partition_map: DashSet<(ListenEndpoint, ListenEndpoint)>,
    severed: DashSet<(ListenEndpoint, ListenEndpoint)>,
    delivered: DashMap<(ListenEndpoint, ListenEndpoint), u64>,
    dropped: AtomicU64,
    latency: LatencySimulator,
}

impl SimulatedNetwork {
    pub fn new(latency: LatencySimulator) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    pub fn partition(&self, a: &ListenEndpoint, b: &ListenEndpoint) {
        self.partition_map.insert((a.clone(), b.clone()));
        self.partition_map.insert((b.clone(), a.clone()));
    }

    /// Drops traffic from `from` to `to` only.
    pub fn partition_one_way(&self, from: &ListenEndpoint, to: &ListenEndpoint) {
        self.partition_map.insert((from.clone(), to.clone()));
    }

    pub fn heal_partition(&self, a: &ListenEndpoint, b: &ListenEndpoint) {
        self.partition_map.remove(&(a.clone(), b.clone()));
        self.partition_map.remove(&(b.clone(), a.clone()));
    }

    pub fn sever(&self, a: &ListenEndpoint, b: &ListenEndpoint) {
        self.severed.insert((a.clone(), b.clone()));
        self.severed.insert((b.clone(), a.clone()));
    }

    pub fn is_partitioned(&self, from: &ListenEndpoint, to: &ListenEndpoint) -> bool {
        self.partition_map.contains(&(from.clone(), to.clone()))
    }

    /// An open connection from `from` to `to` exists.
    pub fn is_connected(&self, from: &ListenEndpoint, to: &ListenEndpoint) -> bool {
        self.connections.contains(&(from.clone(), to.clone()))
    }

    /// Frames delivered from `from` to `to` so far.
    pub fn delivered(&self, from: &ListenEndpoint, to: &ListenEndpoint) -> u64 {
        self.delivered
            .get(&(from.clone(), to.clone()))
            .map_or(0, |count| *count)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn certificate_of(&self, endpoint: &ListenEndpoint) -> Option<Bytes> {
        let listener = self.listeners.get(endpoint)?;
        match &listener.security.provider {
            SecurityProvider::None => None,
            SecurityProvider::Certificate { thumbprint } => Some(Bytes::from(thumbprint.clone().into_bytes())),
        }
    }

    /// Runs the accept and certificate checks the first time `from` reaches `to`.
    async fn open(&self, from: &ListenEndpoint, to: &ListenEndpoint, handler: &Arc<dyn InboundHandler>) -> Result<()> {
        let key = (from.clone(), to.clone());
        if self.connections.contains(&key) {
            return Ok(());
        }
        if !handler.accept(to, from) {
            return Err(Error::Transport(format!("{to} refused connection from {from}")));
        }
        let requires_certificate = self
            .listeners
            .get(to)
            .is_some_and(|listener| matches!(listener.security.provider, SecurityProvider::Certificate { .. }));
        if requires_certificate {
            let certificate = self
                .certificate_of(from)
                .ok_or_else(|| Error::Transport(format!("{from} presented no certificate")))?;
            if !handler.verify_certificate(from, certificate).await {
                return Err(Error::Transport(format!("{to} rejected the certificate of {from}")));
            }
        }
        self.connections.insert(key);
        Ok(())
    }
}

#[async_trait]
impl Transport for SimulatedNetwork {
    async fn listen(
        &self,
        local: &ListenEndpoint,
        security: &SecuritySettings,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<()> {
        if self.listeners.contains_key(local) {
            return Err(Error::Transport(format!("{local} is already in use")));
        }
        self.listeners.insert(
            local.clone(),
            Listener {
                handler,
                security: security.clone(),
            },
        );
        Ok(())
    }

    async fn send(&self, local: &ListenEndpoint, remote: &ListenEndpoint, frame: Bytes) -> Result<()> {
        if self.severed.contains(&(local.clone(), remote.clone())) {
            return Err(Error::Transport(format!("connection {local} -> {remote} reset")));
        }
        let handler = self
            .listeners
            .get(remote)
            .map(|listener| listener.handler.clone())
            .ok_or_else(|| Error::Transport(format!("{remote} is not listening")))?;
        self.open(local, remote, &handler).await?;
        self.latency.simulate().await;
        if self.is_partitioned(local, remote) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        *self
            .delivered
            .entry((local.clone(), remote.clone()))
            .or_insert(0) += 1;
        handler.deliver(local, frame);
        Ok(())
    }

    fn abort(&self, local: &ListenEndpoint, remote: &ListenEndpoint) {
        self.connections.remove(&(local.clone(), remote.clone()));
    }

    fn close(&self, local: &ListenEndpoint) {
        self.listeners.remove(local);
        self.connections.retain(|(from, to)| from != local && to != local);
    }

    fn update_security(&self, local: &ListenEndpoint, security: &SecuritySettings) {
        if let Some(mut listener) = self.listeners.get_mut(local) {
            listener.security = security.clone();
        }
        self.connections.retain(|(_, to)| to != local);
    }
}

/// Counts fatal reports instead of aborting.
#[derive(Debug, Default)]
pub struct RecordingFatalHandler {
    /// Unresponsive-host reports.
    pub calls: AtomicU64,
    pub hung_processes: parking_lot::Mutex<Vec<u32>>,
}

impl FatalHandler for RecordingFatalHandler {
    fn on_unresponsive(&self, _elapsed_ms: i64) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn on_process_assert_exit_timeout(&self, process_id: u32, _elapsed_ms: i64) {
        self.hung_processes.lock().push(process_id);
    }
}

/// One engine with one agent, as a node in a simulated cluster.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub engine: Arc<LeaseEngine>,
    pub agent: Arc<LeaseAgent>,
    pub endpoint: ListenEndpoint,
}

pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        maintenance_interval_ms: 1_000,
        agent_fail_grace_ms: 2_000,
        ping_retry_interval_ms: 500,
        pre_arbitration_ms: 200,
        ..EngineConfig::default()
    }
}

pub fn test_durations(lease_duration: i32) -> DurationConfig {
    DurationConfig {
        lease_suspend_duration: lease_duration,
        arbitration_duration: lease_duration,
        ..DurationConfig::default().with_lease_duration(lease_duration)
    }
}

pub async fn create_test_node(
    network: &Arc<SimulatedNetwork>,
    port: u16,
    durations: DurationConfig,
) -> Result<TestNode> {
    let engine = LeaseEngine::with_fatal_handler(
        test_engine_config(),
        network.clone(),
        Arc::new(RecordingFatalHandler::default()),
    );
    let endpoint = ListenEndpoint::new("10.0.0.1", port);
    let agent = engine
        .create_lease_agent(endpoint.clone(), durations, SecuritySettings::default())
        .await?;
    Ok(TestNode {
        engine,
        agent,
        endpoint,
    })
}

/// `durations.len()` nodes on ports 9001.. sharing one simulated network.
pub async fn create_test_cluster(
    durations: &[DurationConfig],
    latency: LatencySimulator,
) -> Result<(Vec<TestNode>, Arc<SimulatedNetwork>)> {
    let network = SimulatedNetwork::new(latency);
    let mut nodes = Vec::with_capacity(durations.len());
    for (port, durations) in (9001u16..).zip(durations) {
        nodes.push(create_test_node(&network, port, durations.clone()).await?);
    }
    Ok((nodes, network))
}

pub async fn create_test_pair(lease_duration: i32) -> Result<(TestNode, TestNode, Arc<SimulatedNetwork>)> {
    let (mut nodes, network) = create_test_cluster(
        &[test_durations(lease_duration), test_durations(lease_duration)],
        LatencySimulator::fixed(1),
    )
    .await?;
    let b = nodes.pop().ok_or_else(|| Error::Config("cluster too small".into()))?;
    let a = nodes.pop().ok_or_else(|| Error::Config("cluster too small".into()))?;
    Ok((a, b, network))
}

/// Lets paused time run forward by `ms`.
pub async fn settle(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

/// Next event for `app`, or `None` when nothing arrives within `within_ms`.
pub async fn next_event(engine: &LeaseEngine, app: Instance, within_ms: u64) -> Result<Option<LeaseEvent>> {
    let registration = engine.register_leasing_application(app)?;
    match timeout(Duration::from_millis(within_ms), registration.recv()).await {
        Ok(event) => event.map(Some),
        Err(_) => Ok(None),
    }
}

/// Skips events until one matches `predicate`, giving up after `within_ms` in total.
pub async fn wait_for_event(
    engine: &LeaseEngine,
    app: Instance,
    within_ms: u64,
    predicate: impl Fn(&LeaseEvent) -> bool,
) -> Result<Option<LeaseEvent>> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(within_ms);
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if left.is_zero() {
            return Ok(None);
        }
        let millis = u64::try_from(left.as_millis()).unwrap_or(u64::MAX);
        match next_event(engine, app, millis).await? {
            Some(event) if predicate(&event) => return Ok(Some(event)),
            Some(_) => {}
            None => return Ok(None),
        }
    }
}
