use futures::future::join_all;
use leasehold::{
    relationship::OneWayState,
    remote::AgentState,
    test_utils::{create_test_cluster, create_test_pair, init_tracing, settle, test_durations, wait_for_event, LatencySimulator},
    DurationType, Error, LeaseEvent, LeaseRelationshipIdentifier, ListenEndpoint,
};

fn is_established(event: &LeaseEvent) -> bool {
    matches!(event, LeaseEvent::LeaseEstablished { .. })
}

#[tokio::test(start_paused = true)]
async fn test_establish_is_idempotent() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    let first = a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    assert!(!first.is_established);
    let again = a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    assert_eq!(again.lease, first.lease);
    assert!(!again.is_established);

    let event = wait_for_event(&a.engine, alpha, 5_000, is_established).await.unwrap();
    assert_eq!(
        event,
        Some(LeaseEvent::LeaseEstablished {
            remote_app: "beta".into(),
            lease: first.lease,
        })
    );

    let established = a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    assert_eq!(established.lease, first.lease);
    assert!(established.is_established);
}

#[tokio::test(start_paused = true)]
async fn test_first_contact_pings_then_leases_both_ways() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    let beta = b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    let pinging = a.agent.remote_lease_agents();
    assert_eq!(pinging.len(), 1);
    assert!(pinging[0].in_ping);
    assert_eq!(pinging[0].subject_state, OneWayState::Inactive);

    // the monitor side leases back to the application that asked
    let reverse = wait_for_event(&b.engine, beta, 5_000, is_established).await.unwrap();
    assert!(matches!(reverse, Some(LeaseEvent::LeaseEstablished { remote_app, .. }) if remote_app == "alpha"));
    settle(100).await;

    let rla = a
        .agent
        .remote_lease_agents()
        .into_iter()
        .find(|rla| rla.is_active)
        .unwrap();
    assert!(!rla.in_ping);
    assert_eq!(rla.subject_state, OneWayState::Active);
    assert_eq!(rla.monitor_state, OneWayState::Active);
    assert_eq!(rla.remote_instance, b.agent.instance);
}

#[tokio::test(start_paused = true)]
async fn test_single_active_remote_lease_agent_per_endpoint() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    wait_for_event(&a.engine, alpha, 5_000, is_established).await.unwrap().unwrap();
    settle(30_000).await;

    let active_on = |rlas: Vec<leasehold::remote::RemoteLeaseAgentSnapshot>, remote: &ListenEndpoint| {
        rlas.into_iter()
            .filter(|rla| rla.is_active && &rla.remote_endpoint == remote)
            .count()
    };
    assert_eq!(active_on(a.agent.remote_lease_agents(), &b.endpoint), 1);
    assert_eq!(active_on(b.agent.remote_lease_agents(), &a.endpoint), 1);
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_takes_the_longer_duration() {
    init_tracing();
    let (nodes, _network) =
        create_test_cluster(&[test_durations(1_000), test_durations(2_000)], LatencySimulator::fixed(1))
            .await
            .unwrap();
    let (a, b) = (&nodes[0], &nodes[1]);
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    wait_for_event(&a.engine, alpha, 5_000, is_established).await.unwrap().unwrap();
    settle(300).await;

    assert_eq!(a.engine.query_lease_duration(&a.endpoint, &b.endpoint).unwrap(), 2_000);
    assert_eq!(b.engine.query_lease_duration(&b.endpoint, &a.endpoint).unwrap(), 2_000);

    // renewals keep the agreed duration
    settle(5_000).await;
    assert_eq!(a.engine.query_lease_duration(&a.endpoint, &b.endpoint).unwrap(), 2_000);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_before_response() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    let lease = a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    a.engine.terminate_lease(alpha, lease.lease, "beta").unwrap();
    assert!(matches!(
        a.engine.terminate_lease(alpha, lease.lease, "beta"),
        Err(Error::NotFound(_))
    ));

    assert_eq!(wait_for_event(&a.engine, alpha, 3_000, is_established).await.unwrap(), None);
    assert!(b.agent.remote_lease_agents().iter().all(|rla| rla.monitor.is_empty()));
    assert!(a
        .agent
        .remote_lease_agents()
        .iter()
        .all(|rla| rla.state == AgentState::Failed && rla.subject.is_empty()));

    // a fresh establish gets a fresh relationship
    let again = a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    assert_ne!(again.lease, lease.lease);
    assert!(wait_for_event(&a.engine, alpha, 5_000, is_established).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_terminate_active_lease_before_response() {
    init_tracing();
    let (a, b, network) = create_test_pair(10_000).await.unwrap();
    let first = a.engine.create_leasing_application(a.agent.instance, "alpha-1", true, 1).unwrap();
    let second = a.engine.create_leasing_application(a.agent.instance, "alpha-2", false, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();
    let lease = a.engine.establish_lease(first, &b.endpoint, "beta", DurationType::Regular).unwrap();
    a.engine.establish_lease(second, &b.endpoint, "beta", DurationType::Regular).unwrap();
    for app in [first, second] {
        assert!(wait_for_event(&a.engine, app, 5_000, is_established).await.unwrap().is_some());
    }
    settle(100).await;

    let terminated = LeaseRelationshipIdentifier::new("alpha-1", "beta");
    let kept = LeaseRelationshipIdentifier::new("alpha-2", "beta");
    let active_rla = |node: &leasehold::test_utils::TestNode, remote: &ListenEndpoint| {
        node.agent
            .remote_lease_agents()
            .into_iter()
            .find(|rla| rla.is_active && &rla.remote_endpoint == remote)
            .unwrap()
    };

    // the request gets through, its response does not
    network.partition_one_way(&b.endpoint, &a.endpoint);
    a.engine.terminate_lease(first, lease.lease, "beta").unwrap();
    settle(50).await;
    let rla = active_rla(&a, &b.endpoint);
    assert_eq!(rla.subject_state, OneWayState::Active);
    assert_eq!(rla.subject, vec![kept.clone()]);
    assert_eq!(rla.subject_terminate_pending, vec![terminated.clone()]);
    assert!(!active_rla(&b, &a.endpoint).monitor.contains(&terminated));

    // the next renew carries the termination again and its response acknowledges it
    network.heal_partition(&a.endpoint, &b.endpoint);
    let mut acknowledged = false;
    for _ in 0..100 {
        settle(100).await;
        if active_rla(&a, &b.endpoint).subject_terminate_pending.is_empty() {
            acknowledged = true;
            break;
        }
    }
    assert!(acknowledged);
    let rla = active_rla(&a, &b.endpoint);
    assert_eq!(rla.subject, vec![kept]);
    assert_eq!(rla.subject_state, OneWayState::Active);
    assert!(matches!(
        a.engine.terminate_lease(first, lease.lease, "beta"),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_establish_shares_one_remote_lease_agent() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let first = a.engine.create_leasing_application(a.agent.instance, "alpha-1", true, 1).unwrap();
    let second = a.engine.create_leasing_application(a.agent.instance, "alpha-2", false, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    let tasks = [first, second].map(|app| {
        let engine = a.engine.clone();
        let remote = b.endpoint.clone();
        tokio::spawn(async move { engine.establish_lease(app, &remote, "beta", DurationType::Regular) })
    });
    let leases: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().lease)
        .collect();
    assert_ne!(leases[0], leases[1]);

    for app in [first, second] {
        assert!(wait_for_event(&a.engine, app, 5_000, is_established).await.unwrap().is_some());
    }
    let rlas = a.agent.remote_lease_agents();
    assert_eq!(rlas.len(), 1);
    assert_eq!(rlas[0].subject.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_request_keeps_one_active_remote_lease_agent() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();
    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    assert!(wait_for_event(&a.engine, alpha, 5_000, is_established).await.unwrap().is_some());

    let active = |node: &leasehold::test_utils::TestNode| -> Vec<_> {
        node.agent
            .remote_lease_agents()
            .into_iter()
            .filter(|rla| rla.is_active)
            .collect()
    };

    // the receiving side created its agent from inbound traffic alone
    let rlas = active(&b);
    assert_eq!(rlas.len(), 1);
    assert_eq!(rlas[0].remote_endpoint, a.endpoint);
    let created = rlas[0].instance;

    // renewals keep landing on it
    settle(30_000).await;
    let rlas = active(&b);
    assert_eq!(rlas.len(), 1);
    assert_eq!(rlas[0].instance, created);
    assert_eq!(rlas[0].monitor, vec![LeaseRelationshipIdentifier::new("alpha", "beta")]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_remote_application_is_rejected() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();

    a.engine.establish_lease(alpha, &b.endpoint, "nobody", DurationType::Regular).unwrap();
    let event = wait_for_event(&a.engine, alpha, 5_000, |_| true).await.unwrap();
    assert_eq!(
        event,
        Some(LeaseEvent::RemoteLeasingApplicationExpired {
            remote_app: "nobody".into()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_remote_expires_the_lease() {
    init_tracing();
    let (a, _b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    let nowhere = ListenEndpoint::new("10.0.0.9", 9999);

    a.engine.establish_lease(alpha, &nowhere, "ghost", DurationType::Regular).unwrap();
    let event = wait_for_event(&a.engine, alpha, 5_000, |_| true).await.unwrap();
    assert_eq!(
        event,
        Some(LeaseEvent::RemoteLeasingApplicationExpired {
            remote_app: "ghost".into()
        })
    );
    assert!(a.agent.remote_lease_agents().iter().all(|rla| rla.state == AgentState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_establish_validates_arguments() {
    init_tracing();
    let (a, b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();

    assert!(matches!(
        a.engine.establish_lease(alpha, &b.endpoint, "", DurationType::Regular),
        Err(Error::InvalidParameter(_))
    ));
    assert!(matches!(
        a.engine.establish_lease(alpha, &ListenEndpoint::new("", 1), "beta", DurationType::Regular),
        Err(Error::InvalidEndpoint { .. })
    ));
    assert!(matches!(
        a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1),
        Err(Error::ObjectIdExists(_))
    ));
}
