use leasehold::{
    application::ArbitrationRequest,
    relationship::OneWayState,
    test_utils::{create_test_pair, init_tracing, settle, wait_for_event, TestNode},
    ArbitrationResult, DurationType, Error, Instance, LeaseEvent,
};
use std::sync::Arc;

const LEASE_DURATION: i32 = 2_000;

/// Two nodes with a two-way lease, then cut off from each other.
async fn partitioned_pair() -> (TestNode, TestNode, Instance, Arc<leasehold::test_utils::SimulatedNetwork>) {
    init_tracing();
    let (a, b, network) = create_test_pair(LEASE_DURATION).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();
    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    wait_for_event(&a.engine, alpha, 5_000, |event| matches!(event, LeaseEvent::LeaseEstablished { .. }))
        .await
        .unwrap()
        .unwrap();
    settle(100).await;
    network.partition(&a.endpoint, &b.endpoint);
    (a, b, alpha, network)
}

async fn arbitration_request(node: &TestNode, app: Instance) -> ArbitrationRequest {
    let event = wait_for_event(&node.engine, app, 10_000, |event| {
        matches!(event, LeaseEvent::Arbitrate(request) if !request.is_pre_arbitration)
    })
    .await
    .unwrap();
    match event {
        Some(LeaseEvent::Arbitrate(request)) => request,
        other => panic!("expected an arbitration request, got {other:?}"),
    }
}

fn result_for(request: &ArbitrationRequest, app: Instance, local_ttl: i32, remote_ttl: i32) -> ArbitrationResult {
    ArbitrationResult {
        agent_instance: request.agent_instance,
        app_instance: app,
        local_ttl,
        remote_endpoint: request.remote_endpoint.clone(),
        remote_instance: request.remote_agent_instance,
        remote_ttl,
        is_delayed: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_partition_raises_arbitration() {
    let (a, b, alpha, network) = partitioned_pair().await;
    let request = arbitration_request(&a, alpha).await;

    assert_eq!(request.agent_instance, a.agent.instance);
    assert_eq!(request.remote_endpoint, b.endpoint);
    assert_eq!(request.remote_agent_instance, b.agent.instance);
    assert_eq!(request.remote_app.as_deref(), Some("beta"));
    assert!(request.local_ttl >= 0);
    assert!(request.remote_ttl >= 0);
    assert!(network.dropped() > 0);

    let rla = a
        .agent
        .remote_lease_agents()
        .into_iter()
        .find(|rla| rla.remote_endpoint == b.endpoint && rla.is_active)
        .unwrap();
    assert_eq!(rla.subject_state, OneWayState::Expired);
    assert_eq!(rla.monitor_state, OneWayState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_winning_arbitration_keeps_local_agent() {
    let (a, _b, alpha, _network) = partitioned_pair().await;
    let request = arbitration_request(&a, alpha).await;

    a.engine
        .process_arbitration_result(&result_for(&request, alpha, i32::MAX, 0))
        .unwrap();
    let event = wait_for_event(&a.engine, alpha, 1_000, |event| {
        matches!(event, LeaseEvent::RemoteLeasingApplicationExpired { .. })
    })
    .await
    .unwrap();
    assert_eq!(
        event,
        Some(LeaseEvent::RemoteLeasingApplicationExpired {
            remote_app: "beta".into()
        })
    );

    settle(10_000).await;
    assert!(!a.agent.is_failed());
    assert_eq!(
        a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap(),
        i32::MAX
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_arbitration_result_fails_the_lease() {
    let (a, _b, alpha, _network) = partitioned_pair().await;
    let request = arbitration_request(&a, alpha).await;

    // with equal suspend and arbitration durations the remote TTL ends at the subject fail time
    settle(u64::try_from(request.remote_ttl).unwrap() + 1).await;
    let _ = a
        .engine
        .process_arbitration_result(&result_for(&request, alpha, i32::MAX, 0));

    let expired = wait_for_event(&a.engine, alpha, 5_000, |event| {
        matches!(event, LeaseEvent::LeasingApplicationExpired)
    })
    .await
    .unwrap();
    assert_eq!(expired, Some(LeaseEvent::LeasingApplicationExpired));
    settle(100).await;
    assert!(a.agent.is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_losing_arbitration_fails_the_agent() {
    let (a, _b, alpha, _network) = partitioned_pair().await;
    let request = arbitration_request(&a, alpha).await;

    a.engine
        .process_arbitration_result(&result_for(&request, alpha, 0, i32::MAX))
        .unwrap();
    let expired = wait_for_event(&a.engine, alpha, 5_000, |event| {
        matches!(event, LeaseEvent::LeasingApplicationExpired)
    })
    .await
    .unwrap();
    assert!(expired.is_some());
    settle(100).await;
    assert!(a.agent.is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_neutral_arbitration_marks_relationship() {
    let (a, b, alpha, _network) = partitioned_pair().await;
    let request = arbitration_request(&a, alpha).await;

    a.engine
        .process_arbitration_result(&result_for(&request, alpha, i32::MAX, i32::MAX))
        .unwrap();
    let rla = a
        .agent
        .remote_lease_agents()
        .into_iter()
        .find(|rla| rla.remote_endpoint == b.endpoint)
        .unwrap();
    assert!(rla.is_in_arbitration_neutral);
    assert_eq!(rla.monitor_state, OneWayState::Failed);
    assert!(!a.agent.is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_arbitration_result_validation() {
    let (a, _b, alpha, _network) = partitioned_pair().await;
    let request = arbitration_request(&a, alpha).await;

    assert!(matches!(
        a.engine
            .process_arbitration_result(&result_for(&request, alpha, -1, i32::MAX)),
        Err(Error::InvalidParameter(_))
    ));
    let mut unknown = result_for(&request, alpha, i32::MAX, 0);
    unknown.remote_instance = Instance(unknown.remote_instance.0 + 1_000_000);
    assert!(matches!(
        a.engine.process_arbitration_result(&unknown),
        Err(Error::InvalidParameter(_))
    ));
}
