//! End-to-end workflow test
//!
//! Drives one workflow through an activity, a durable timer, a side effect and
//! a signal against the in-memory service, with sticky execution enabled.
//!
//! ```bash
//! cargo test -p cadence-testsuite --test end_to_end
//! ```

use std::time::Duration;

use cadence_core::{
    ActivityOptions, CustomError, EventAttributes, EventType, MarkerRecordedEventAttributes,
};
use cadence_testsuite::{init_test_tracing, ActivityAddress, TestWorkflowEnvironment};
use cadence_workflow::state_machine::State;
use cadence_workflow::{decode_side_effect_details, WorkflowContext, WorkflowError, WorkflowFuture};

fn greeter(ctx: WorkflowContext, input: Option<Vec<u8>>) -> WorkflowFuture {
    Box::pin(async move {
        let greeting = ctx
            .execute_activity("greet", input, ActivityOptions::default())
            .await?;
        ctx.sleep(Duration::from_secs(60)).await?;
        let lucky: u32 = ctx.side_effect(|| 7)?;
        let approval = ctx
            .signal_channel("approve")
            .recv(&ctx)
            .await?
            .unwrap_or_default();
        Ok(format!(
            "{}|{}|{}",
            String::from_utf8_lossy(&greeting),
            lucky,
            String::from_utf8_lossy(&approval)
        )
        .into_bytes())
    })
}

#[tokio::test]
async fn test_activity_timer_side_effect_and_signal() {
    init_test_tracing();
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("greeter", greeter);
    let service = env.service();
    let execution = env.start_workflow("greet-1", "greeter", Some(b"bob")).unwrap();

    // first round schedules the activity on the workflow's task list
    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);
    let task = service
        .poll_for_activity_task(env.task_list(), "activity-worker")
        .unwrap()
        .expect("activity task");
    assert_eq!(task.activity_type.name, "greet");
    assert_eq!(task.input.as_deref(), Some(&b"bob"[..]));
    service
        .respond_activity_task_completed(
            &ActivityAddress::Token(task.task_token),
            Some(b"hello bob".to_vec()),
            "activity-worker",
        )
        .unwrap();

    // second round starts the 60s timer
    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);
    assert_eq!(service.advance_time(Duration::from_secs(59)).unwrap(), 0);
    assert_eq!(env.run_decision_tasks().await.unwrap(), 0);
    assert_eq!(service.advance_time(Duration::from_secs(1)).unwrap(), 1);

    // third round records the side effect and waits for the signal
    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);
    assert_eq!(service.workflow_state(&execution).unwrap(), State::Started);

    service
        .signal_workflow(&execution, "approve", Some(b"yes".to_vec()))
        .unwrap();
    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);
    assert_eq!(service.workflow_state(&execution).unwrap(), State::Completed);
    assert_eq!(
        service.workflow_result(&execution).unwrap(),
        Some(b"hello bob|7|yes".to_vec())
    );

    let history = service.history(&execution).unwrap();
    let markers: Vec<&MarkerRecordedEventAttributes> =
        history.iter().filter_map(|e| e.marker_attributes()).collect();
    assert_eq!(markers.len(), 1);
    let recorded = decode_side_effect_details(&markers[0].details).unwrap();
    assert_eq!(recorded.side_effect_id, 1);
    assert_eq!(recorded.result, b"7".to_vec());
    assert_eq!(
        history.last().map(|e| e.event_type),
        Some(EventType::WorkflowExecutionCompleted)
    );

    // every round after the first continued the warm decider
    let stats = env.worker().cache().stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 0);
    assert_eq!(env.worker().cache().size(), 0);
}

#[tokio::test]
async fn test_signal_before_first_round_is_delivered() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("echo-signal", |ctx: WorkflowContext, _input: Option<Vec<u8>>| async move {
        let value = ctx.signal_channel("value").recv(&ctx).await?;
        Ok::<_, WorkflowError>(value.unwrap_or_default())
    });
    let execution = env.start_workflow("echo-1", "echo-signal", None).unwrap();
    env.service()
        .signal_workflow(&execution, "value", Some(b"early".to_vec()))
        .unwrap();

    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);
    assert_eq!(
        env.service().workflow_result(&execution).unwrap(),
        Some(b"early".to_vec())
    );
}

#[tokio::test]
async fn test_failing_workflow_records_reason_and_details() {
    let env = TestWorkflowEnvironment::new();
    env.register_workflow("broken", |_ctx: WorkflowContext, _input: Option<Vec<u8>>| async move {
        Err::<Vec<u8>, _>(WorkflowError::from(CustomError::new(
            "bad-input",
            b"no name".to_vec(),
        )))
    });
    let execution = env.start_workflow("broken-1", "broken", None).unwrap();

    assert_eq!(env.run_decision_tasks().await.unwrap(), 1);
    assert_eq!(
        env.service().workflow_state(&execution).unwrap(),
        State::Failed
    );
    let history = env.service().history(&execution).unwrap();
    match history.last().and_then(|e| e.attributes.as_ref()) {
        Some(EventAttributes::WorkflowExecutionFailedEventAttributes(a)) => {
            assert_eq!(a.reason.as_deref(), Some("bad-input"));
            assert_eq!(a.details.as_deref(), Some(&b"no name"[..]));
        }
        other => panic!("expected a failed workflow, got {:?}", other),
    }
}
