use std::time::{Duration, Instant};

use interplex::{CancelOutcome, ErrorCode, HostError, IsolationPolicy, JobStatus};

use super::{calc_binding, ctx, run_text, test_host, test_limits, wait_until_running};

#[tokio::test]
async fn test_cancel_queued_then_running_job() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    let running = host.submit("calc", &context, "sleep 5000").unwrap();
    let queued = host.submit("calc", &context, "1 + 1").unwrap();
    wait_until_running(&host, running.job_id()).await;

    assert_eq!(host.cancel(queued.job_id()).unwrap(), CancelOutcome::Dequeued);
    let result = queued.wait().await;
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(result.handle.is_none());

    assert_eq!(host.cancel(running.job_id()).unwrap(), CancelOutcome::Signalled);
    let result = running.wait().await;
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));
    assert_eq!(result.error.unwrap().message, "job cancelled");

    // Cooperative cancel leaves the process in place
    assert_eq!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_job_recycles_engine() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    let spinning = host.submit("calc", &context, "spin 10000").unwrap();
    wait_until_running(&host, spinning.job_id()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    host.cancel(spinning.job_id()).unwrap();

    let result = spinning.wait().await;
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(result.error.unwrap().message.contains("recycled"));
    assert!(result.elapsed < Duration::from_secs(3));

    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_cancel_result_arrives_within_grace_when_engine_is_stuck() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_cancel_grace(1.0).with_shutdown_grace(4.0));
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    let spinning = host.submit("calc", &context, "spin 30000").unwrap();
    wait_until_running(&host, spinning.job_id()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled_at = Instant::now();
    host.cancel(spinning.job_id()).unwrap();
    let result = spinning.wait().await;
    let latency = cancelled_at.elapsed();

    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(result.error.unwrap().message.contains("recycled"));
    assert!(
        latency < Duration::from_millis(1500),
        "cancel took {latency:?} with a 1s grace"
    );

    // The stuck process is out of service even while it is still stopping
    let started_at = Instant::now();
    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    assert!(started_at.elapsed() < Duration::from_secs(4));
    assert_eq!(host.list_active_processes("calc").len(), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_engine_without_cancel_support_is_recycled() {
    let host = test_host(vec![(
        "calc",
        calc_binding(IsolationPolicy::Shared, &["--no-cancel"]),
    )]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    let sleeping = host.submit("calc", &context, "sleep 10000").unwrap();
    wait_until_running(&host, sleeping.job_id()).await;
    host.cancel(sleeping.job_id()).unwrap();

    let result = sleeping.wait().await;
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(result.error.unwrap().message.contains("recycled"));

    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_cancel_while_engine_starts() {
    let host = test_host(vec![(
        "calc",
        calc_binding(IsolationPolicy::Shared, &["--startup-delay-ms", "5000"]),
    )]);
    let context = ctx("alice", "n1", "p1");

    let ticket = host.submit("calc", &context, "1").unwrap();
    wait_until_running(&host, ticket.job_id()).await;
    host.cancel(ticket.job_id()).unwrap();

    let result = ticket.wait().await;
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(result.elapsed < Duration::from_secs(4));
    assert!(host.list_active_processes("calc").is_empty());

    host.shutdown().await;
}

#[tokio::test]
async fn test_cancel_finished_job_is_not_found() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");

    let ticket = host.submit("calc", &context, "1").unwrap();
    let job_id = ticket.job_id();
    assert!(ticket.wait().await.is_success());

    assert!(matches!(host.cancel(job_id), Err(HostError::JobNotFound(id)) if id == job_id));
    host.shutdown().await;
}
