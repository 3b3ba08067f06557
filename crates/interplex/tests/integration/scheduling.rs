use std::time::Duration;

use interplex::protocol::StatusReply;
use interplex::{ErrorCode, Fragment, IsolationPolicy, JobEventKind, JobStatus};

use super::{calc_binding, ctx, run_text, test_host, test_limits, wait_until_running};

#[tokio::test]
async fn test_jobs_run_in_submission_order() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let contexts = [ctx("alice", "n1", "p1"), ctx("bob", "n2", "p1"), ctx("carol", "n3", "p1")];

    run_text(&host, "calc", &contexts[0], "log = 0").await;
    let tickets: Vec<_> = (1..=6)
        .map(|k| {
            let context = &contexts[k % contexts.len()];
            host.submit("calc", context, format!("sleep 10\nlog = log * 10 + {k}"))
                .expect("Failed to submit job")
        })
        .collect();
    for ticket in tickets {
        assert!(ticket.wait().await.is_success());
    }

    assert_eq!(run_text(&host, "calc", &contexts[0], "log").await, "123456");
    host.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_rejects_with_backpressure() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_queue_depth(1));
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");

    let running = host.submit("calc", &context, "sleep 500\n1").unwrap();
    wait_until_running(&host, running.job_id()).await;
    let queued = host.submit("calc", &context, "2").unwrap();
    let rejected = host.submit("calc", &context, "3").unwrap().wait().await;

    assert_eq!(rejected.status, JobStatus::Failed);
    assert_eq!(rejected.error_code(), Some(ErrorCode::Backpressure));
    assert_eq!(running.wait().await.text(), "1");
    assert_eq!(queued.wait().await.text(), "2");

    host.shutdown().await;
}

#[tokio::test]
async fn test_job_timeout_fails_job_but_keeps_engine() {
    let binding = calc_binding(IsolationPolicy::Shared, &[])
        .with_limits(test_limits().with_job_timeout(0.3));
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");

    let pid = run_text(&host, "calc", &context, "pid").await;
    let result = host
        .submit("calc", &context, "print started\nsleep 5000")
        .unwrap()
        .wait()
        .await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_code(), Some(ErrorCode::JobTimeout));
    assert_eq!(result.fragments, vec![Fragment::text("started")]);
    assert!(result.elapsed < Duration::from_secs(3));

    // The engine honoured the cancel, so it is still the same process
    assert_eq!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_stuck_job_times_out_within_grace() {
    let binding = calc_binding(IsolationPolicy::Shared, &[]).with_limits(
        test_limits()
            .with_job_timeout(0.3)
            .with_cancel_grace(0.5)
            .with_shutdown_grace(4.0),
    );
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "n1", "p1");
    let pid = run_text(&host, "calc", &context, "pid").await;

    let result = host.submit("calc", &context, "spin 30000").unwrap().wait().await;
    assert_eq!(result.error_code(), Some(ErrorCode::JobTimeout));
    assert!(result.elapsed < Duration::from_millis(1300), "took {:?}", result.elapsed);

    assert_ne!(run_text(&host, "calc", &context, "pid").await, pid);
    host.shutdown().await;
}

#[tokio::test]
async fn test_output_is_streamed_and_collected() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let mut events = host.subscribe();

    let result = host
        .submit("calc", &context, "print hello\nprogress 50\nhtml <b>bold</b>\nx = 3\nx * 2\nvars")
        .unwrap()
        .wait()
        .await;

    assert!(result.is_success());
    assert_eq!(result.fragments.len(), 4);
    assert_eq!(result.fragments[0], Fragment::text("hello"));
    assert_eq!(result.fragments[1], Fragment::Html("<b>bold</b>".to_string()));
    assert_eq!(result.fragments[2], Fragment::text("6"));
    assert!(matches!(&result.fragments[3], Fragment::Table(table) if table.rows == vec![vec!["x".to_string(), "3".to_string()]]));
    assert_eq!(result.payload, Some(serde_json::json!({ "value": 6 })));
    assert!(result.handle.is_some());

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, result.job_id);
        assert_eq!(event.context, context);
        assert_eq!(event.binding, "calc");
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&JobEventKind::Queued));
    assert!(matches!(kinds.get(1), Some(JobEventKind::Started { .. })));
    assert!(kinds.contains(&JobEventKind::Progress(50)));
    assert!(kinds.contains(&JobEventKind::Output(Fragment::text("hello"))));
    assert!(kinds.contains(&JobEventKind::Output(Fragment::text("6"))));
    assert_eq!(
        kinds.last(),
        Some(&JobEventKind::Finished { status: JobStatus::Succeeded })
    );

    host.shutdown().await;
}

#[tokio::test]
async fn test_engine_error_keeps_earlier_output() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");

    let result = host
        .submit("calc", &context, "print before\nfail something broke")
        .unwrap()
        .wait()
        .await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_code(), Some(ErrorCode::EngineError));
    assert_eq!(
        result.fragments,
        vec![
            Fragment::text("before"),
            Fragment::Error("something broke".to_string())
        ]
    );

    // Engine errors do not affect the process
    assert_eq!(run_text(&host, "calc", &context, "1 + 1").await, "2");
    host.shutdown().await;
}

#[tokio::test]
async fn test_proxy_execute_and_remote_status() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "n1", "p1");
    let proxy = host.proxy("calc", &context).unwrap();

    assert_eq!(proxy.execute("1").await.unwrap().text(), "1");

    let ticket = proxy.submit("sleep 1000\n5").unwrap();
    wait_until_running(&host, ticket.job_id()).await;
    // Dispatch happens before the engine receives the call
    let mut status = None;
    for _ in 0..100 {
        status = host.remote_status(ticket.job_id()).await.ok();
        if status == Some(StatusReply::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, Some(StatusReply::Running));

    let job_id = ticket.job_id();
    assert_eq!(ticket.wait().await.text(), "5");
    assert!(host.job_status(job_id).is_none());
    assert!(host.remote_status(job_id).await.is_err());

    host.shutdown().await;
}
