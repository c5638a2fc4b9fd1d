//! Workflow queries
//!
//! Queries are answered by replaying the run's history on a fresh decider,
//! so they see the state as of the last completed decision task.
//!
//! ```bash
//! cargo test -p cadence-testsuite --test query
//! ```

use std::sync::Arc;
use std::time::Duration;

use cadence_core::WorkflowExecution;
use cadence_testsuite::TestWorkflowEnvironment;
use cadence_worker::{QueryResultType, WorkflowQueryResult};
use cadence_workflow::{WorkflowContext, WorkflowFuture, STACK_TRACE_QUERY_NAME};
use parking_lot::Mutex;

fn approval(ctx: WorkflowContext, _input: Option<Vec<u8>>) -> WorkflowFuture {
    Box::pin(async move {
        let status = Arc::new(Mutex::new("waiting".to_string()));
        let reported = status.clone();
        ctx.register_query("status", move |_args: &[u8]| {
            Ok(reported.lock().clone().into_bytes())
        });

        let decision = ctx.signal_channel("decide").recv(&ctx).await?;
        *status.lock() = String::from_utf8_lossy(&decision.unwrap_or_default()).into_owned();
        ctx.sleep(Duration::from_secs(10)).await?;
        let value = status.lock().clone();
        Ok(value.into_bytes())
    })
}

/// Queues a query, lets the worker answer it and returns the answer.
async fn ask(env: &TestWorkflowEnvironment, query_type: &str) -> anyhow::Result<WorkflowQueryResult> {
    let execution = WorkflowExecution::new("approval-1", "");
    let query_id = env.service().query_workflow(&execution, query_type, None)?;
    assert_eq!(env.run_decision_tasks().await?, 1);
    env.service()
        .query_result(&query_id)
        .ok_or_else(|| anyhow::anyhow!("query {} was not answered", query_id))
}

#[tokio::test]
async fn test_query_sees_state_of_last_decision() -> anyhow::Result<()> {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("approval", approval);
    let execution = env.start_workflow("approval-1", "approval", None)?;
    assert_eq!(env.run_decision_tasks().await?, 1);

    let answer = ask(&env, "status").await?;
    assert_eq!(answer.result_type, QueryResultType::Answered);
    assert_eq!(answer.answer, Some(b"waiting".to_vec()));

    env.service()
        .signal_workflow(&execution, "decide", Some(b"approved".to_vec()))?;
    assert_eq!(env.run_decision_tasks().await?, 1);
    let answer = ask(&env, "status").await?;
    assert_eq!(answer.answer, Some(b"approved".to_vec()));

    // queries leave no trace in history
    let events = env.service().history(&execution)?.len();
    ask(&env, "status").await?;
    assert_eq!(env.service().history(&execution)?.len(), events);
    Ok(())
}

#[tokio::test]
async fn test_unknown_query_type_fails() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("approval", approval);
    env.start_workflow("approval-1", "approval", None).unwrap();
    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);

    let answer = ask(&env, "no-such-query").await.unwrap();
    assert_eq!(answer.result_type, QueryResultType::Failed);
    assert!(answer.answer.is_none());
    assert!(answer
        .error_message
        .unwrap_or_default()
        .contains("no-such-query"));
}

#[tokio::test]
async fn test_stack_trace_query_lists_blocked_threads() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("approval", approval);
    env.start_workflow("approval-1", "approval", None).unwrap();
    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);

    let answer = ask(&env, STACK_TRACE_QUERY_NAME).await.unwrap();
    assert_eq!(answer.result_type, QueryResultType::Answered);
    let trace = String::from_utf8(answer.answer.unwrap_or_default()).unwrap();
    assert!(trace.contains("workflow-root"), "unexpected trace {}", trace);
}
