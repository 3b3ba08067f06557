//! Integration tests for interplex
//!
//! These tests launch the `interplex-calc-engine` binary built from this
//! crate as the engine process.
//! Run with: cargo test -p interplex --test integration

use std::time::Duration;

use interplex::{
    Binding, Config, EngineKind, EngineLimits, ExecutionContext, InterpreterHost, IsolationPolicy,
    JobId, JobPhase, LaunchSpec,
};

mod cancellation;
mod isolation;
mod lifecycle;
mod reconfigure;
mod scheduling;
mod startup;

const CALC_ENGINE: &str = env!("CARGO_BIN_EXE_interplex-calc-engine");

/// Limits that keep the tests fast
pub(crate) fn test_limits() -> EngineLimits {
    EngineLimits::unset()
        .with_startup_timeout(10.0)
        .with_cancel_grace(1.0)
        .with_shutdown_grace(1.0)
}

/// Calculator binding with extra engine arguments
pub(crate) fn calc_binding(policy: IsolationPolicy, args: &[&str]) -> Binding {
    let mut command = vec![CALC_ENGINE.to_string()];
    command.extend(args.iter().map(|arg| arg.to_string()));
    Binding::new(
        "Calculator",
        EngineKind::new("calc").expect("valid engine kind"),
        policy,
        LaunchSpec::new(command),
    )
    .with_limits(test_limits())
}

pub(crate) fn test_host(bindings: Vec<(&str, Binding)>) -> InterpreterHost {
    let config = bindings
        .into_iter()
        .fold(Config::empty(), |config, (id, binding)| config.with_binding(id, binding));
    InterpreterHost::new(config).expect("Failed to create host")
}

pub(crate) fn ctx(owner: &str, collection: &str, scope: &str) -> ExecutionContext {
    ExecutionContext::new(owner, collection, scope)
}

/// Wait until the scheduler has dispatched `job_id`
pub(crate) async fn wait_until_running(host: &InterpreterHost, job_id: JobId) {
    for _ in 0..500 {
        if host.job_status(job_id) == Some(JobPhase::Running) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never started running");
}

/// Run `code` and return the text it produced, failing the test otherwise
pub(crate) async fn run_text(host: &InterpreterHost, binding: &str, context: &ExecutionContext, code: &str) -> String {
    let result = host
        .submit(binding, context, code)
        .expect("Failed to submit job")
        .wait()
        .await;
    assert!(result.is_success(), "job `{code}` failed: {result:?}");
    result.text()
}
