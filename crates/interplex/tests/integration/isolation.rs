use interplex::{ErrorCode, IsolationPolicy, JobStatus};

use super::{calc_binding, ctx, run_text, test_host};

#[tokio::test]
async fn test_shared_binding_shares_one_process() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let alice = ctx("alice", "note1", "p1");
    let bob = ctx("bob", "note2", "p7");

    run_text(&host, "calc", &alice, "x = 41").await;
    assert_eq!(run_text(&host, "calc", &bob, "x + 1").await, "42");
    assert_eq!(
        run_text(&host, "calc", &alice, "pid").await,
        run_text(&host, "calc", &bob, "pid").await
    );

    let processes = host.list_active_processes("calc");
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].key.group.as_str(), "shared");

    host.shutdown().await;
}

#[tokio::test]
async fn test_same_owner_collections_share_handle_when_shared() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let note_x = ctx("ownerA", "noteX", "p1");
    let note_y = ctx("ownerA", "noteY", "p1");

    let first = host.submit("calc", &note_x, "1+1").unwrap();
    let second = host.submit("calc", &note_y, "1+1").unwrap();
    let (first, second) = (first.wait().await, second.wait().await);

    assert_eq!(first.status, JobStatus::Succeeded);
    assert_eq!(second.status, JobStatus::Succeeded);
    assert_eq!(first.text(), "2");
    assert_eq!(second.text(), "2");
    assert!(first.handle.is_some());
    assert_eq!(first.handle, second.handle);

    host.shutdown().await;
}

#[tokio::test]
async fn test_scoped_binding_separates_collections() {
    let host = test_host(vec![(
        "calc",
        calc_binding(IsolationPolicy::ScopedPerCollection, &[]),
    )]);
    let x1 = ctx("alice", "noteX", "p1");
    let x2 = ctx("alice", "noteX", "p2");
    let y1 = ctx("alice", "noteY", "p1");

    run_text(&host, "calc", &x1, "x = 1").await;
    assert_eq!(run_text(&host, "calc", &x2, "x").await, "1");

    let other = host.submit("calc", &y1, "x").unwrap().wait().await;
    assert_eq!(other.status, JobStatus::Failed);
    assert_eq!(other.error_code(), Some(ErrorCode::EngineError));
    assert_eq!(other.error.unwrap().message, "undefined variable 'x'");

    assert_eq!(host.list_active_processes("calc").len(), 2);

    // Closing every context of noteX tears its process down; noteY keeps its own
    host.proxy("calc", &x1).unwrap().close().await;
    assert_eq!(host.list_active_processes("calc").len(), 2);
    host.proxy("calc", &x2).unwrap().close().await;

    let remaining = host.list_active_processes("calc");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].key.group.as_str(), "collection:noteY");

    // A new context on noteX gets a fresh process with empty state
    let fresh = host.submit("calc", &ctx("alice", "noteX", "p3"), "x").unwrap().wait().await;
    assert_eq!(fresh.error_code(), Some(ErrorCode::EngineError));

    host.shutdown().await;
}

#[tokio::test]
async fn test_isolated_binding_separates_owners() {
    let binding = calc_binding(IsolationPolicy::IsolatedPerOwner, &["--require-property", "user"])
        .with_property("user", "{owner}");
    let host = test_host(vec![("calc", binding)]);
    let alice_a = ctx("alice", "noteA", "p1");
    let alice_b = ctx("alice", "noteB", "p1");
    let bob = ctx("bob", "noteA", "p1");

    run_text(&host, "calc", &alice_a, "secret = 7").await;
    assert_eq!(run_text(&host, "calc", &alice_b, "secret").await, "7");
    assert_eq!(run_text(&host, "calc", &alice_b, "prop user").await, "alice");
    assert_eq!(run_text(&host, "calc", &bob, "prop user").await, "bob");

    let result = host.submit("calc", &bob, "secret").unwrap().wait().await;
    assert_eq!(result.error_code(), Some(ErrorCode::EngineError));

    let groups: Vec<String> = host
        .list_active_processes("calc")
        .into_iter()
        .map(|p| p.key.group.to_string())
        .collect();
    assert_eq!(groups, vec!["owner:alice".to_string(), "owner:bob".to_string()]);

    host.shutdown().await;
}

#[tokio::test]
async fn test_shared_process_survives_its_members() {
    let host = test_host(vec![("calc", calc_binding(IsolationPolicy::Shared, &[]))]);
    let context = ctx("alice", "note1", "p1");

    let proxy = host.proxy("calc", &context).unwrap();
    assert_eq!(proxy.execute("2 * 21").await.unwrap().text(), "42");
    proxy.close().await;
    assert!(proxy.is_closed());
    assert!(proxy.execute("1").await.is_err());

    assert_eq!(host.list_active_processes("calc").len(), 1);

    // A new proxy for the same context reaches the same process
    let again = host.proxy("calc", &context).unwrap();
    assert!(!again.is_closed());
    assert_eq!(again.execute("3").await.unwrap().text(), "3");

    host.shutdown().await;
}

#[tokio::test]
async fn test_engine_sees_launch_environment() {
    let binding = calc_binding(IsolationPolicy::ScopedPerCollection, &[]);
    let binding = interplex::Binding {
        launch: binding.launch.clone().with_env("NOTE_ID", "{collection}"),
        ..binding
    };
    let host = test_host(vec![("calc", binding)]);
    let context = ctx("alice", "note9", "p1");

    assert_eq!(run_text(&host, "calc", &context, "env NOTE_ID").await, "note9");
    assert_eq!(run_text(&host, "calc", &context, "env INTERPLEX_BINDING").await, "calc");
    assert_eq!(
        run_text(&host, "calc", &context, "env INTERPLEX_GROUP").await,
        "collection:note9"
    );

    host.shutdown().await;
}
