use leasehold::{
    remote::AgentState,
    test_utils::{
        create_test_node, create_test_pair, init_tracing, settle, test_durations, test_engine_config, wait_for_event,
        LatencySimulator, RecordingFatalHandler, SimulatedNetwork,
    },
    DurationType, Error, LeaseEngine, LeaseEvent, ListenEndpoint, SecuritySettings,
};
use std::sync::{atomic::Ordering, Arc};

#[tokio::test(start_paused = true)]
async fn test_idle_agent_fails_after_grace() {
    init_tracing();
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let node = create_test_node(&network, 9201, test_durations(10_000)).await.unwrap();

    node.engine.run_maintenance();
    settle(1_000).await;
    node.engine.run_maintenance();
    assert!(!node.agent.is_failed());

    settle(1_500).await;
    node.engine.run_maintenance();
    assert!(node.agent.is_failed());
    assert!(node.engine.agent(node.agent.instance).is_none());

    // the handle outlives its registry entry
    assert_eq!(node.agent.state(), AgentState::Failed);
    assert!(node.agent.remote_lease_agents().is_empty());

    let replacement = node
        .engine
        .create_lease_agent(node.endpoint.clone(), test_durations(10_000), SecuritySettings::default())
        .await
        .unwrap();
    assert_ne!(replacement.instance, node.agent.instance);
}

#[tokio::test(start_paused = true)]
async fn test_application_keeps_agent_alive() {
    init_tracing();
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let node = create_test_node(&network, 9202, test_durations(10_000)).await.unwrap();

    node.engine.run_maintenance();
    node.engine
        .create_leasing_application(node.agent.instance, "alpha", false, 1)
        .unwrap();
    settle(5_000).await;
    node.engine.run_maintenance();
    assert!(!node.agent.is_failed());
    assert!(node.engine.agent(node.agent.instance).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_create_reuses_open_agent() {
    init_tracing();
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let node = create_test_node(&network, 9203, test_durations(10_000)).await.unwrap();

    let again = node
        .engine
        .create_lease_agent(node.endpoint.clone(), test_durations(20_000), SecuritySettings::default())
        .await
        .unwrap();
    assert_eq!(again.instance, node.agent.instance);
    assert_eq!(node.agent.durations().lease_duration, 20_000);

    let secured = SecuritySettings {
        provider: leasehold::SecurityProvider::Certificate {
            thumbprint: "abc".into(),
        },
    };
    assert!(matches!(
        node.engine
            .create_lease_agent(node.endpoint.clone(), test_durations(10_000), secured)
            .await,
        Err(Error::Retry(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_process_exit_unregisters_applications() {
    init_tracing();
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let node = create_test_node(&network, 9204, test_durations(10_000)).await.unwrap();
    let owned = node
        .engine
        .create_leasing_application(node.agent.instance, "owned", false, 42)
        .unwrap();
    let other = node
        .engine
        .create_leasing_application(node.agent.instance, "other", false, 7)
        .unwrap();

    node.engine.on_process_exit(42);
    settle(10).await;
    assert!(!node.agent.has_application(owned));
    assert!(node.agent.has_application(other));
}

#[tokio::test(start_paused = true)]
async fn test_unregister_informs_the_remote_side() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    let beta = b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();
    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    let established = |event: &LeaseEvent| matches!(event, LeaseEvent::LeaseEstablished { .. });
    wait_for_event(&a.engine, alpha, 5_000, established).await.unwrap().unwrap();
    wait_for_event(&b.engine, beta, 5_000, established).await.unwrap().unwrap();

    let pending = a.engine.register_leasing_application(alpha).unwrap();
    a.engine.unregister_leasing_application(alpha, false).unwrap();
    assert!(matches!(pending.recv().await, Err(Error::Canceled)));

    let event = wait_for_event(&b.engine, beta, 5_000, |event| {
        matches!(event, LeaseEvent::RemoteLeasingApplicationExpired { .. })
    })
    .await
    .unwrap();
    assert_eq!(
        event,
        Some(LeaseEvent::RemoteLeasingApplicationExpired {
            remote_app: "alpha".into()
        })
    );
    assert!(!a.agent.has_application(alpha));
    assert!(matches!(
        a.engine.register_leasing_application(alpha),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_host_reported_while_leasing() {
    init_tracing();
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let fatal = Arc::new(RecordingFatalHandler::default());
    let engine = LeaseEngine::with_fatal_handler(test_engine_config(), network.clone(), fatal.clone());
    let endpoint = ListenEndpoint::new("10.0.0.2", 9301);
    let agent = engine
        .create_lease_agent(endpoint, test_durations(10_000), SecuritySettings::default())
        .await
        .unwrap();
    let remote = create_test_node(&network, 9302, test_durations(10_000)).await.unwrap();
    let alpha = engine.create_leasing_application(agent.instance, "alpha", true, 1).unwrap();
    remote
        .engine
        .create_leasing_application(remote.agent.instance, "beta", true, 2)
        .unwrap();

    engine.update_lease_global_config(3_000, 1_000, 300_000).unwrap();
    engine.heartbeat(0);
    engine.establish_lease(alpha, &remote.endpoint, "beta", DurationType::Regular).unwrap();
    wait_for_event(&engine, alpha, 1_000, |event| matches!(event, LeaseEvent::LeaseEstablished { .. }))
        .await
        .unwrap()
        .unwrap();

    settle(1_500).await;
    engine.run_maintenance();
    assert_eq!(fatal.calls.load(Ordering::SeqCst), 0);

    // an error code is not progress
    engine.heartbeat(5);
    settle(2_000).await;
    engine.run_maintenance();
    assert_eq!(fatal.calls.load(Ordering::SeqCst), 1);

    engine.heartbeat(0);
    engine.run_maintenance();
    assert_eq!(fatal.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_host_without_leases_is_tolerated() {
    init_tracing();
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let fatal = Arc::new(RecordingFatalHandler::default());
    let engine = LeaseEngine::with_fatal_handler(test_engine_config(), network.clone(), fatal.clone());
    engine
        .create_lease_agent(ListenEndpoint::new("10.0.0.2", 9303), test_durations(10_000), SecuritySettings::default())
        .await
        .unwrap();

    engine.update_lease_global_config(1_000, 1_000, 300_000).unwrap();
    engine.heartbeat(0);
    settle(5_000).await;
    engine.run_maintenance();
    assert_eq!(fatal.calls.load(Ordering::SeqCst), 0);
}

async fn recording_engine(port: u16) -> (Arc<LeaseEngine>, Arc<RecordingFatalHandler>, Arc<leasehold::LeaseAgent>) {
    let network = SimulatedNetwork::new(LatencySimulator::fixed(1));
    let fatal = Arc::new(RecordingFatalHandler::default());
    let engine = LeaseEngine::with_fatal_handler(test_engine_config(), network, fatal.clone());
    let agent = engine
        .create_lease_agent(ListenEndpoint::new("10.0.0.3", port), test_durations(10_000), SecuritySettings::default())
        .await
        .unwrap();
    (engine, fatal, agent)
}

#[tokio::test(start_paused = true)]
async fn test_asserted_process_must_exit_in_time() {
    init_tracing();
    let (engine, fatal, agent) = recording_engine(9304).await;
    engine.update_lease_global_config(0, 1_000, 5_000).unwrap();
    let hung = engine.create_leasing_application(agent.instance, "hung", false, 42).unwrap();
    let bystander = engine.create_leasing_application(agent.instance, "bystander", false, 7).unwrap();

    engine.on_process_assert(42);
    settle(10).await;
    assert!(!agent.has_application(hung));
    assert!(agent.has_application(bystander));

    settle(4_000).await;
    engine.run_maintenance();
    assert!(fatal.hung_processes.lock().is_empty());

    settle(1_000).await;
    engine.run_maintenance();
    assert_eq!(*fatal.hung_processes.lock(), vec![42]);
}

#[tokio::test(start_paused = true)]
async fn test_asserted_process_that_exits_is_released() {
    init_tracing();
    let (engine, fatal, agent) = recording_engine(9305).await;
    engine.update_lease_global_config(0, 1_000, 5_000).unwrap();
    engine.create_leasing_application(agent.instance, "quick", false, 42).unwrap();

    engine.on_process_assert(42);
    settle(1_000).await;
    engine.run_maintenance();
    engine.on_process_exit(42);

    settle(10_000).await;
    engine.run_maintenance();
    assert!(fatal.hung_processes.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_process_assert_timeout_must_be_positive() {
    init_tracing();
    let (engine, _fatal, _agent) = recording_engine(9306).await;
    assert!(matches!(
        engine.update_lease_global_config(0, 1_000, 0),
        Err(Error::InvalidParameter(_))
    ));
}
