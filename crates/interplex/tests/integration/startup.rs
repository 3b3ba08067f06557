use std::time::Duration;

use interplex::{
    Binding, EngineKind, ErrorCode, HostError, IsolationPolicy, JobStatus, LaunchSpec,
};

use super::{calc_binding, ctx, run_text, test_host, test_limits};

#[tokio::test]
async fn test_slow_engine_times_out_and_later_jobs_retry() {
    let binding = calc_binding(IsolationPolicy::Shared, &["--startup-delay-ms", "3000"])
        .with_limits(test_limits().with_startup_timeout(0.5));
    let host = test_host(vec![("slow", binding)]);
    let context = ctx("alice", "n1", "p1");

    let result = host.submit("slow", &context, "1").unwrap().wait().await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_code(), Some(ErrorCode::StartupTimeout));
    assert!(result.elapsed < Duration::from_secs(2));
    assert!(host.list_active_processes("slow").is_empty());

    // Nothing is cached: the next job launches again and times out again
    let again = host.submit("slow", &context, "1").unwrap().wait().await;
    assert_eq!(again.error_code(), Some(ErrorCode::StartupTimeout));

    host.shutdown().await;
}

#[tokio::test]
async fn test_wrong_token_fails_startup() {
    let binding = calc_binding(IsolationPolicy::Shared, &["--token", "forged"]);
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");

    let result = host.submit("calc", &context, "1").unwrap().wait().await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_code(), Some(ErrorCode::StartupFailure));
    assert!(host.list_active_processes("calc").is_empty());

    host.shutdown().await;
}

#[tokio::test]
async fn test_missing_engine_binary_fails_startup() {
    let binding = Binding::new(
        "Missing",
        EngineKind::new("calc").unwrap(),
        IsolationPolicy::Shared,
        LaunchSpec::new(vec!["/nonexistent/interplex-engine".to_string()]),
    );
    let host = test_host(vec![("missing", binding)]);
    let context = ctx("alice", "n1", "p1");

    let result = host.submit("missing", &context, "1").unwrap().wait().await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_code(), Some(ErrorCode::StartupFailure));

    let proxy = host.proxy("missing", &context).unwrap();
    assert!(matches!(proxy.open().await, Err(HostError::Startup(_))));

    host.shutdown().await;
}

#[tokio::test]
async fn test_engine_exiting_before_handshake_reports_stderr() {
    let binding = Binding::new(
        "Broken",
        EngineKind::new("sh").unwrap(),
        IsolationPolicy::Shared,
        LaunchSpec::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo \"cannot start {binding} for {owner}\" >&2; exit 2".to_string(),
        ]),
    );
    let host = test_host(vec![("broken", binding)]);

    let result = host
        .submit("broken", &ctx("alice", "n1", "p1"), "1")
        .unwrap()
        .wait()
        .await;
    let error = result.error.unwrap();
    assert_eq!(error.code, ErrorCode::StartupFailure);
    assert_eq!(error.exit_code, Some(2));
    assert_eq!(error.stderr_tail, vec!["cannot start broken for alice".to_string()]);

    host.shutdown().await;
}

#[tokio::test]
async fn test_startup_failure_does_not_affect_other_bindings() {
    let slow = calc_binding(IsolationPolicy::Shared, &["--startup-delay-ms", "3000"])
        .with_limits(test_limits().with_startup_timeout(0.3));
    let host = test_host(vec![
        ("slow", slow),
        ("calc", calc_binding(IsolationPolicy::Shared, &[])),
    ]);
    let context = ctx("alice", "n1", "p1");

    let failing = host.submit("slow", &context, "1").unwrap();
    assert_eq!(run_text(&host, "calc", &context, "40 + 2").await, "42");
    assert_eq!(failing.wait().await.error_code(), Some(ErrorCode::StartupTimeout));

    host.shutdown().await;
}
