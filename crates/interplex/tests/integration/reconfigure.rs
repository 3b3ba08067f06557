use interplex::{ConfigError, ErrorCode, HostError, IsolationPolicy, JobStatus};

use super::{calc_binding, ctx, run_text, test_host, wait_until_running};

#[tokio::test]
async fn test_reconfigure_replaces_processes() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "x = 1\npid").await;

    host.reconfigure("calc", calc_binding(IsolationPolicy::ScopedPerCollection, &[]))
        .await
        .expect("Failed to reconfigure");
    assert!(host.list_active_processes("calc").is_empty());

    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    let processes = host.list_active_processes("calc");
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].key.group.as_str(), "collection:n1");

    let bindings = host.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].1.policy, IsolationPolicy::ScopedPerCollection);

    host.shutdown().await;
}

#[tokio::test]
async fn test_reconfigure_aborts_outstanding_jobs() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");

    let running = host.submit("calc", &context, "sleep 10000").unwrap();
    let queued = host.submit("calc", &context, "1").unwrap();
    wait_until_running(&host, running.job_id()).await;

    host.reconfigure("calc", calc_binding(IsolationPolicy::Shared, &[]))
        .await
        .unwrap();

    for ticket in [running, queued] {
        let result = ticket.wait().await;
        assert_eq!(result.status, JobStatus::Aborted);
        assert_eq!(result.error_code(), Some(ErrorCode::Teardown));
    }

    // The binding keeps working with its new definition
    assert_eq!(run_text(&host, "calc", &context, "6 * 7").await, "42");
    host.shutdown().await;
}

#[tokio::test]
async fn test_reconfigure_rejects_invalid_binding() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    let mut invalid = calc_binding(IsolationPolicy::Shared, &[]);
    invalid.launch.command.clear();
    let result = host.reconfigure("calc", invalid).await;
    assert!(matches!(result, Err(HostError::Config(ConfigError::Invalid(_)))));

    // The old definition and its process are untouched
    assert_eq!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}
