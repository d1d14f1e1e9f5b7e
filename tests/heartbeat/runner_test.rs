//! Tests for the assistant-backed heartbeat runner.

use std::sync::atomic::Ordering;

use hearth::heartbeat::runner::{AssistantTaskRunner, HEARTBEAT_SESSION};
use hearth::heartbeat::{TaskRunner, NO_REPLY_MARKER};

use crate::support::FakeAssistant;

#[tokio::test]
async fn empty_task_list_skips_the_assistant() {
    let assistant = FakeAssistant::new();
    let runner = AssistantTaskRunner::new(assistant.clone());

    let summary = runner.run(&[]).await.expect("run");
    assert_eq!(summary, NO_REPLY_MARKER);
    assert!(assistant.replies().is_empty());
}

#[tokio::test]
async fn tasks_run_in_a_throwaway_session() {
    let assistant = FakeAssistant::new();
    let runner = AssistantTaskRunner::new(assistant.clone());

    let summary = runner
        .run(&["check the weather".to_owned()])
        .await
        .expect("run");

    assert!(summary.starts_with("echo: "));
    let replies = assistant.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, HEARTBEAT_SESSION);
    assert!(replies[0].1.contains("- check the weather"));
    assert_eq!(
        assistant.resets.lock().expect("lock").clone(),
        vec![HEARTBEAT_SESSION.to_owned()]
    );
}

#[tokio::test]
async fn assistant_errors_fail_the_heartbeat_and_still_reset() {
    let assistant = FakeAssistant::new();
    assistant.fail.store(true, Ordering::SeqCst);
    let runner = AssistantTaskRunner::new(assistant.clone());

    let err = runner
        .run(&["check the weather".to_owned()])
        .await
        .expect_err("should fail");
    assert!(format!("{err:#}").contains("offline"));
    assert_eq!(assistant.resets.lock().expect("lock").len(), 1);
}
