use std::time::Duration;

use interplex::{Config, EngineState, ErrorCode, InterpreterHost, IsolationPolicy, JobStatus};

use super::{calc_binding, ctx, run_text, test_host, test_limits, wait_until_running};

#[tokio::test]
async fn test_crash_aborts_job_and_next_job_restarts_engine() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "x = 5\npid").await;

    let result = host.submit("calc", &context, "exit 3").unwrap().wait().await;
    assert_eq!(result.status, JobStatus::Aborted);
    assert_eq!(result.error_code(), Some(ErrorCode::EngineCrash));
    let error = result.error.unwrap();
    assert_eq!(error.exit_code, Some(3));
    assert!(
        error
            .stderr_tail
            .iter()
            .any(|line| line.contains("calc engine exiting with code 3")),
        "stderr tail: {:?}",
        error.stderr_tail
    );

    // The next job gets a fresh process without the old state
    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    let lost = host.submit("calc", &context, "x").unwrap().wait().await;
    assert_eq!(lost.error_code(), Some(ErrorCode::EngineError));

    host.shutdown().await;
}

#[tokio::test]
async fn test_idle_engine_is_reaped() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_idle_timeout(0.2));
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(host.reap_idle().await, 1);
    assert!(host.list_active_processes("calc").is_empty());

    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_background_reaper_stops_idle_engine() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_idle_timeout(0.2));
    let config = Config {
        reap_interval: 0.1,
        ..Config::empty().with_binding("calc", binding)
    };
    let host = InterpreterHost::new(config).expect("Failed to create host");
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;
    assert_eq!(host.list_active_processes("calc").len(), 1);

    let mut reaped = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if host.list_active_processes("calc").is_empty() {
            reaped = true;
            break;
        }
    }
    assert!(reaped, "idle engine was never reaped");

    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_reaping_forgets_cached_proxies() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_idle_timeout(0.1));
    let host = test_host(vec![("calc", binding)]);
    let alice = ctx("alice", "n1", "p1");
    let bob = ctx("bob", "n2", "p1");

    let held = host.proxy("calc", &alice).unwrap();
    assert_eq!(held.execute("1").await.unwrap().text(), "1");
    run_text(&host, "calc", &bob, "2").await;
    assert!(held.group().is_some());
    assert!(host.proxy("calc", &bob).unwrap().group().is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(host.reap_idle().await, 1);

    // Cached proxies are gone, so a fresh proxy has not joined any group yet
    assert!(held.group().is_none());
    assert!(host.proxy("calc", &bob).unwrap().group().is_none());

    // A proxy handed out before the reap keeps working on a new process
    let result = held.execute("1 + 1").await.unwrap();
    assert_eq!(result.text(), "2");
    assert!(held.group().is_some());
    assert_eq!(host.list_active_processes("calc").len(), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_close_context_tears_down_its_groups() {
    let host = test_host(vec![
        ("calc", calc_binding(IsolationPolicy::ScopedPerCollection, &[])),
        ("calc-owner", calc_binding(IsolationPolicy::IsolatedPerOwner, &[])),
    ]);
    let alice = ctx("alice", "n1", "p1");
    let bob = ctx("bob", "n2", "p1");

    run_text(&host, "calc", &alice, "1").await;
    run_text(&host, "calc-owner", &alice, "1").await;
    run_text(&host, "calc", &bob, "1").await;
    let proxy = host.proxy("calc", &alice).unwrap();

    host.close_context(&alice).await;

    assert!(proxy.is_closed());
    assert!(proxy.execute("1").await.is_err());
    assert!(host.list_active_processes("calc-owner").is_empty());
    let remaining = host.list_active_processes("calc");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key.group.as_str(), "collection:n2");

    host.shutdown().await;
}

#[tokio::test]
async fn test_busy_engine_is_not_reaped() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_idle_timeout(0.1));
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");

    let ticket = host.submit("calc", &context, "sleep 800\n7").unwrap();
    wait_until_running(&host, ticket.job_id()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(host.reap_idle().await, 0);
    assert_eq!(ticket.wait().await.text(), "7");
    host.shutdown().await;
}

#[tokio::test]
async fn test_reaping_disabled_without_idle_timeout() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_idle_timeout(0.0));
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");
    run_text(&host, "calc", &context, "1").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.reap_idle().await, 0);
    assert_eq!(host.list_active_processes("calc").len(), 1);
    host.shutdown().await;
}

#[tokio::test]
async fn test_list_active_processes() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    assert!(host.list_active_processes("calc").is_empty());

    let pid: u32 = run_text(&host, "calc", &context, "pid").await.parse().unwrap();
    let processes = host.list_active_processes("calc");
    assert_eq!(processes.len(), 1);
    let process = &processes[0];
    assert_eq!(process.pid, Some(pid));
    assert_eq!(process.state, EngineState::Ready);
    assert_eq!(process.active_jobs, 0);
    assert!(process.handle.is_some());
    assert!(process.endpoint.is_some_and(|addr| addr.ip().is_loopback()));
    assert!(host.list_active_processes("other").is_empty());

    host.shutdown().await;
    assert!(host.list_active_processes("calc").is_empty());
}

#[tokio::test]
async fn test_open_starts_engine_once() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let proxy = host.proxy("calc", &ctx("alice", "n1", "p1")).unwrap();

    let first = proxy.open().await.unwrap();
    let second = proxy.open().await.unwrap();
    assert_eq!(first, second);

    let other = host.proxy("calc", &ctx("bob", "n2", "p1")).unwrap();
    assert_eq!(other.open().await.unwrap(), first);
    assert_eq!(host.list_active_processes("calc").len(), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_aborts_outstanding_jobs() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");

    let running = host.submit("calc", &context, "sleep 10000").unwrap();
    let queued = host.submit("calc", &context, "1").unwrap();
    wait_until_running(&host, running.job_id()).await;

    host.shutdown().await;

    let running = running.wait().await;
    assert_eq!(running.status, JobStatus::Aborted);
    assert_eq!(running.error_code(), Some(ErrorCode::Teardown));
    let queued = queued.wait().await;
    assert_eq!(queued.status, JobStatus::Aborted);
    assert_eq!(queued.error_code(), Some(ErrorCode::Teardown));
    assert!(host.list_active_processes("calc").is_empty());
}
