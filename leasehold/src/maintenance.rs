//! Periodic reclamation of failed and orphaned state, and the heartbeat self-check.

use crate::{
    agent::{AgentInner, LeaseAgent},
    remote::RemoteLeaseAgent,
    time::{add_duration, Instance},
};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Liveness violations of the host that cannot be recovered in-process.
///
/// The default aborts the process. Tests install a handler that records the calls instead.
pub trait FatalHandler: Send + Sync + fmt::Debug {
    /// The host stopped heartbeating while it still holds leases.
    fn on_unresponsive(&self, elapsed_ms: i64);

    /// A process asserted and did not exit within the configured timeout.
    fn on_process_assert_exit_timeout(&self, process_id: u32, elapsed_ms: i64);
}

#[derive(Debug, Default)]
pub struct AbortOnFatal;

impl FatalHandler for AbortOnFatal {
    fn on_unresponsive(&self, elapsed_ms: i64) {
        error!(elapsed_ms, "host unresponsive while holding leases, aborting");
        std::process::abort();
    }

    fn on_process_assert_exit_timeout(&self, process_id: u32, elapsed_ms: i64) {
        error!(process_id, elapsed_ms, "asserted process did not exit in time, aborting");
        std::process::abort();
    }
}

/// What one sweep over an agent found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepOutcome {
    /// The agent is failed and quiesced and can leave the registry.
    pub deallocate: bool,
    /// A process whose assert outlived the exit timeout, with the time since the assert.
    pub hung_process: Option<(u32, i64)>,
}

/// Last successful heartbeat from the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatMonitor {
    last_heartbeat: Option<i64>,
}

impl HeartbeatMonitor {
    /// Records a heartbeat. A non-zero error code is logged and does not count as progress.
    pub fn record(&mut self, now: i64, error_code: i32) {
        if error_code != 0 {
            warn!(error_code, "heartbeat reported an error");
            return;
        }
        self.last_heartbeat = Some(now);
    }

    /// Milliseconds since the last heartbeat once that exceeds `unresponsive_duration`.
    pub fn unresponsive_for(&self, now: i64, unresponsive_duration: i32) -> Option<i64> {
        if unresponsive_duration <= 0 {
            return None;
        }
        let elapsed = now - self.last_heartbeat?;
        (elapsed > i64::from(unresponsive_duration)).then_some(elapsed)
    }
}

impl AgentInner {
    /// No applications and no live RLA left.
    pub(crate) fn can_be_failed(&self) -> bool {
        self.ctx.apps.is_empty() && self.rlas.values().all(RemoteLeaseAgent::is_failed)
    }

    pub(crate) fn is_ready_for_deallocation(&self) -> bool {
        self.ctx.is_failed()
            && self.ctx.apps.is_empty()
            && self.ctx.unregister_list.is_empty()
            && self.rlas.values().all(RemoteLeaseAgent::is_ready_for_deallocation)
    }

    /// One sweep over this agent.
    pub(crate) fn maintain(&mut self) -> SweepOutcome {
        let now = self.ctx.now();
        // applications of an asserted process stay until it exits
        self.ctx
            .unregister_list
            .retain(|app| app.process_assert_time.is_some());
        let hung_process = self.check_hung_processes(now);

        self.reconcile_neutral_rlas();

        let AgentInner { ctx, rlas } = self;
        for rla in rlas.values_mut() {
            if !rla.is_failed() && rla.is_orphaned(now) {
                debug!(rla = %rla.instance, remote = %rla.remote_endpoint, "failing orphaned remote lease agent");
                rla.fail(now);
            }
        }
        let default_arbitration = ctx.durations.arbitration_duration;
        let reclaim: Vec<Instance> = rlas
            .values()
            .filter(|rla| {
                let grace = if rla.relationship.durations.any_unset() {
                    default_arbitration
                } else {
                    rla.relationship.durations.arbitration
                };
                rla.is_ready_for_deallocation()
                    && !rla.is_in_arbitration_neutral
                    && rla.failed_at.is_some_and(|at| now >= add_duration(at, grace))
            })
            .map(|rla| rla.instance)
            .collect();
        for instance in reclaim {
            if let Some(rla) = rlas.remove(&instance) {
                info!(agent = %ctx.instance, rla = %instance, remote = %rla.remote_endpoint, "remote lease agent reclaimed");
                let shares_endpoint = rlas
                    .values()
                    .any(|other| other.remote_endpoint == rla.remote_endpoint && !other.is_failed());
                if !shares_endpoint {
                    ctx.outbox.abort(&rla.remote_endpoint);
                }
            }
        }

        if !self.ctx.is_failed() {
            if self.can_be_failed() {
                let deadline = *self
                    .ctx
                    .time_to_be_failed
                    .get_or_insert(now + self.ctx.engine.agent_fail_grace_ms);
                if now >= deadline {
                    info!(agent = %self.ctx.instance, "idle lease agent failed by maintenance");
                    self.fail_agent();
                }
            } else {
                self.ctx.time_to_be_failed = None;
            }
        }
        SweepOutcome {
            deallocate: self.is_ready_for_deallocation(),
            hung_process,
        }
    }

    /// First unregistered application whose process asserted longer ago than the exit timeout.
    fn check_hung_processes(&self, now: i64) -> Option<(u32, i64)> {
        let timeout = self.ctx.engine.process_assert_exit_timeout_ms;
        let mut hung = None;
        for app in &self.ctx.unregister_list {
            let Some(asserted_at) = app.process_assert_time else {
                continue;
            };
            let elapsed = now - asserted_at;
            if elapsed < timeout {
                debug!(app = %app.identifier, process_id = app.process_id, elapsed_ms = elapsed, "asserted process exit pending");
            } else {
                warn!(app = %app.identifier, process_id = app.process_id, elapsed_ms = elapsed, "asserted process exit timed out");
                hung.get_or_insert((app.process_id, elapsed));
            }
        }
        hung
    }

    /// A neutral RLA is kept until a replacement to the same remote is open in both directions.
    fn reconcile_neutral_rlas(&mut self) {
        let replaced: Vec<Instance> = self
            .rlas
            .values()
            .filter(|rla| rla.is_failed() && rla.is_in_arbitration_neutral)
            .filter(|neutral| {
                self.rlas.values().any(|other| {
                    other.instance != neutral.instance
                        && other.remote_endpoint == neutral.remote_endpoint
                        && other.is_open_two_way()
                })
            })
            .map(|rla| rla.instance)
            .collect();
        for instance in replaced {
            if let Some(rla) = self.rlas.get_mut(&instance) {
                debug!(rla = %instance, "arbitration-neutral relationship replaced");
                rla.is_in_arbitration_neutral = false;
            }
        }
    }
}

impl LeaseAgent {
    pub(crate) fn maintain(&self) -> SweepOutcome {
        self.with_inner(AgentInner::maintain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{EngineConfig, SecuritySettings},
        endpoint::ListenEndpoint,
        test_utils::{settle, test_durations, LatencySimulator, SimulatedNetwork},
        time::MonotonicClock,
        timer::Scheduler,
        transport::{Transport, TransportBehaviorTable},
    };
    use bytes::Bytes;
    use std::sync::Arc;

    fn test_agent(network: &Arc<SimulatedNetwork>, port: u16) -> Arc<LeaseAgent> {
        LeaseAgent::new(
            ListenEndpoint::new("10.0.0.1", port),
            test_durations(2_000),
            SecuritySettings::default(),
            EngineConfig::default(),
            network.clone(),
            Arc::new(TransportBehaviorTable::default()),
            Scheduler::current(MonotonicClock::new()),
        )
    }

    fn failed_rla(inner: &mut AgentInner, remote: &ListenEndpoint, neutral: bool) -> Instance {
        let mut rla = RemoteLeaseAgent::new(remote.clone(), Instance::NONE);
        rla.is_in_arbitration_neutral = neutral;
        rla.fail(inner.ctx.now());
        let instance = rla.instance;
        inner.rlas.insert(instance, rla);
        instance
    }

    fn rla_instances(agent: &LeaseAgent) -> Vec<Instance> {
        agent.remote_lease_agents().iter().map(|rla| rla.instance).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rla_kept_for_arbitration_grace() {
        let network = SimulatedNetwork::new(LatencySimulator::default());
        let agent = test_agent(&network, 9401);
        let peer = test_agent(&network, 9402);
        network
            .listen(&peer.endpoint, &SecuritySettings::default(), peer.inbound_handler())
            .await
            .unwrap();
        network
            .send(&agent.endpoint, &peer.endpoint, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(network.is_connected(&agent.endpoint, &peer.endpoint));

        agent.create_application("alpha", false, 1).unwrap();
        let busy_remote = ListenEndpoint::new("10.0.0.7", 7);
        let neutral_remote = ListenEndpoint::new("10.0.0.8", 8);
        let (plain, busy, neutral, guard) = agent.with_inner(|inner| {
            let plain = failed_rla(inner, &peer.endpoint, false);
            let busy = failed_rla(inner, &busy_remote, false);
            let guard = inner.rlas[&busy].inflight_guard();
            let neutral = failed_rla(inner, &neutral_remote, true);
            (plain, busy, neutral, guard)
        });

        settle(1_999).await;
        assert!(!agent.maintain().deallocate);
        assert_eq!(rla_instances(&agent).len(), 3);
        assert!(network.is_connected(&agent.endpoint, &peer.endpoint));

        settle(1).await;
        agent.maintain();
        let left = rla_instances(&agent);
        assert!(!left.contains(&plain));
        assert!(left.contains(&busy) && left.contains(&neutral));
        assert!(!network.is_connected(&agent.endpoint, &peer.endpoint));

        drop(guard);
        agent.maintain();
        assert_eq!(rla_instances(&agent), vec![neutral]);

        settle(60_000).await;
        agent.maintain();
        assert_eq!(rla_instances(&agent), vec![neutral]);
        assert!(!agent.is_failed());
    }

    #[test]
    fn test_heartbeat_error_does_not_refresh() {
        let mut monitor = HeartbeatMonitor::default();
        assert_eq!(monitor.unresponsive_for(10_000, 1_000), None);
        monitor.record(0, 0);
        monitor.record(900, 5);
        assert_eq!(monitor.unresponsive_for(1_500, 1_000), Some(1_500));
        monitor.record(1_600, 0);
        assert_eq!(monitor.unresponsive_for(2_000, 1_000), None);
    }

    #[test]
    fn test_heartbeat_check_disabled() {
        let mut monitor = HeartbeatMonitor::default();
        monitor.record(0, 0);
        assert_eq!(monitor.unresponsive_for(i64::from(i32::MAX), 0), None);
    }
}
