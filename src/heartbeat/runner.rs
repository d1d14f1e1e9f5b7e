//! Task runner backed by the assistant.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use super::{TaskRunner, NO_REPLY_MARKER};
use crate::assistant::Assistant;

/// Session id the heartbeat talks to the assistant under.
pub const HEARTBEAT_SESSION: &str = "heartbeat";

/// Build the prompt for one heartbeat.
pub fn heartbeat_prompt(tasks: &[String]) -> String {
    let mut prompt = String::from(
        "This is a scheduled heartbeat, not a message from the user. \
         Work through these checks:",
    );
    for task in tasks {
        prompt.push_str("\n- ");
        prompt.push_str(task);
    }
    prompt.push_str(&format!(
        "\n\nReply with a short summary for the user, or exactly {NO_REPLY_MARKER} \
         if nothing needs their attention."
    ));
    prompt
}

/// Runs heartbeat tasks as one stateless assistant turn.
pub struct AssistantTaskRunner {
    assistant: Arc<dyn Assistant>,
}

impl std::fmt::Debug for AssistantTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantTaskRunner").finish_non_exhaustive()
    }
}

impl AssistantTaskRunner {
    /// Wrap an assistant.
    pub fn new(assistant: Arc<dyn Assistant>) -> Self {
        Self { assistant }
    }
}

#[async_trait]
impl TaskRunner for AssistantTaskRunner {
    async fn run(&self, tasks: &[String]) -> anyhow::Result<String> {
        if tasks.is_empty() {
            return Ok(NO_REPLY_MARKER.to_owned());
        }
        let result = self
            .assistant
            .reply(HEARTBEAT_SESSION, &heartbeat_prompt(tasks))
            .await;
        self.assistant.reset_session(HEARTBEAT_SESSION).await;
        result.context("assistant failed to run heartbeat tasks")
    }
}
