use leasehold::{
    test_utils::{create_test_pair, init_tracing, settle, wait_for_event, TestNode},
    DurationType, Error, Instance, LeaseEvent,
};

async fn leased_pair(lease_duration: i32) -> (TestNode, TestNode, Instance) {
    init_tracing();
    let (a, b, _network) = create_test_pair(lease_duration).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    b.engine.create_leasing_application(b.agent.instance, "beta", true, 2).unwrap();
    a.engine.establish_lease(alpha, &b.endpoint, "beta", DurationType::Regular).unwrap();
    wait_for_event(&a.engine, alpha, 5_000, |event| matches!(event, LeaseEvent::LeaseEstablished { .. }))
        .await
        .unwrap()
        .unwrap();
    settle(100).await;
    (a, b, alpha)
}

#[tokio::test(start_paused = true)]
async fn test_ttl_without_subject_leases_is_unbounded() {
    init_tracing();
    let (a, _b, _network) = create_test_pair(10_000).await.unwrap();
    let alpha = a.engine.create_leasing_application(a.agent.instance, "alpha", true, 1).unwrap();
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap(), i32::MAX);
    // nothing was granted, so a failure report has nothing left
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 0).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_reports_never_extend_the_last_grant() {
    let (a, _b, alpha) = leased_pair(10_000).await;

    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap(), 5_000);
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 0).unwrap(), 5_000);

    settle(1_000).await;
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, -1).unwrap(), 4_000);

    // a shorter grant does not pull the latched expiry back in
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 3_000).unwrap(), 3_000);
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 0).unwrap(), 4_000);

    settle(5_000).await;
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 0).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_global_expiration_caps_ttl() {
    let (a, _b, alpha) = leased_pair(10_000).await;

    let cap = a.engine.now() + 300;
    a.engine.set_global_lease_expiration_time(alpha, cap).unwrap();
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap(), 300);

    settle(400).await;
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_lease_expiration() {
    let (a, _b, alpha) = leased_pair(10_000).await;

    let expiration = a.engine.get_remote_lease_expiration_time(alpha, "beta").unwrap();
    assert!(expiration.subject_ttl > 0 && expiration.subject_ttl <= 10_000);
    assert!(expiration.monitor_ttl > 0 && expiration.monitor_ttl <= 10_000);
    assert!(matches!(
        a.engine.get_remote_lease_expiration_time(alpha, "nobody"),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_ttl_is_zero_once_agent_fails() {
    let (a, _b, alpha) = leased_pair(10_000).await;
    assert!(a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap() > 0);

    a.engine.close_lease_agent(&a.endpoint).unwrap();
    assert!(a.agent.is_failed());
    assert_eq!(a.engine.get_leasing_application_expiration_time(alpha, 5_000).unwrap(), 0);
}
