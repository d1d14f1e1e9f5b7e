//! Assistant over an OpenAI-compatible `/v1/chat/completions` API.
//!
//! Keeps a bounded per-user history in memory. Recent `/remember` notes are
//! appended to the system prompt on every turn.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{check_http_response, Assistant, AssistantError, ChatTurn, Role};
use crate::config::AssistantConfig;
use crate::store::NoteRepository;

/// Completions path appended to the configured base URL.
const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Notes injected into the system prompt.
const NOTES_IN_PROMPT: usize = 10;

/// Request timeout for completions.
const REQUEST_TIMEOUT_SECS: u64 = 120;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a concise personal assistant \
reachable over WhatsApp. Answer in plain text suitable for a chat message.";

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Chat completions request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
}

/// A message in chat-completions format.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: &'static str,
    /// Text content.
    pub content: String,
}

/// Chat completions response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    /// Response choices.
    pub choices: Vec<ChatChoice>,
}

/// A response choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    /// The assistant message.
    pub message: ChatResponseMessage,
}

/// Assistant message in a response.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatResponseMessage {
    /// Text content; absent for tool-only replies.
    pub content: Option<String>,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Build a request from a system prompt, prior turns, and the new user text.
#[doc(hidden)]
pub fn build_request(model: &str, system: &str, history: &[ChatTurn], text: &str) -> ChatRequest {
    let mut messages = Vec::with_capacity(history.len().saturating_add(2));
    messages.push(ChatMessage {
        role: role_name(Role::System),
        content: system.to_owned(),
    });
    messages.extend(history.iter().map(|turn| ChatMessage {
        role: role_name(turn.role),
        content: turn.content.clone(),
    }));
    messages.push(ChatMessage {
        role: role_name(Role::User),
        content: text.to_owned(),
    });
    ChatRequest {
        model: model.to_owned(),
        messages,
    }
}

/// Extract the reply text from a response body.
///
/// # Errors
///
/// Returns [`AssistantError::Parse`] when the body is not a completions
/// response or the first choice has no text.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<String, AssistantError> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| AssistantError::Parse(e.to_string()))?;
    resp.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| AssistantError::Parse("missing choices[0].message.content".to_owned()))
}

/// Render the system prompt with the user's notes appended.
#[doc(hidden)]
pub fn system_prompt_with_notes(base: &str, notes: &[String]) -> String {
    if notes.is_empty() {
        return base.to_owned();
    }
    let mut prompt = format!("{base}\n\nThings the user asked you to remember:");
    for note in notes {
        prompt.push_str("\n- ");
        prompt.push_str(note);
    }
    prompt
}

/// Append one exchange, dropping the oldest turns beyond `max_turns`.
fn push_exchange(history: &mut VecDeque<ChatTurn>, user: &str, reply: &str, max_turns: usize) {
    history.push_back(ChatTurn::user(user));
    history.push_back(ChatTurn::assistant(reply));
    while history.len() > max_turns {
        history.pop_front();
    }
}

/// OpenAI-compatible chat assistant.
pub struct ChatAssistant {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
    max_history: usize,
    notes: Arc<dyn NoteRepository>,
    sessions: Mutex<HashMap<String, VecDeque<ChatTurn>>>,
}

impl std::fmt::Debug for ChatAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatAssistant")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "__REDACTED__"))
            .finish_non_exhaustive()
    }
}

impl ChatAssistant {
    /// Create an assistant from config. The API key is read from the env var
    /// named by `api_key_env` through `env`.
    pub fn from_config(
        config: &AssistantConfig,
        notes: Arc<dyn NoteRepository>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let api_key = env(&config.api_key_env).filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(var = %config.api_key_env, "no assistant API key set; requests are unauthenticated");
        }
        Self {
            client,
            endpoint: format!("{}{COMPLETIONS_PATH}", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned()),
            max_history: config.max_history,
            notes,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn history(&self, user_id: &str) -> Vec<ChatTurn> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn recent_notes(&self, user_id: &str) -> Vec<String> {
        match self.notes.recent_notes(user_id, NOTES_IN_PROMPT).await {
            Ok(notes) => notes.into_iter().rev().map(|n| n.content).collect(),
            Err(e) => {
                warn!(error = %e, "failed to load notes for prompt");
                Vec::new()
            }
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, AssistantError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        let response = builder.send().await?;
        let payload = check_http_response(response).await?;
        parse_response(&payload)
    }
}

#[async_trait]
impl Assistant for ChatAssistant {
    async fn reply(&self, user_id: &str, text: &str) -> Result<String, AssistantError> {
        let notes = self.recent_notes(user_id).await;
        let system = system_prompt_with_notes(&self.system_prompt, &notes);
        let request = build_request(&self.model, &system, &self.history(user_id), text);

        let reply = self.complete(&request).await?;
        debug!(user_id, reply_len = reply.len(), "assistant replied");

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let history = sessions.entry(user_id.to_owned()).or_default();
        push_exchange(history, text, &reply, self.max_history);
        Ok(reply)
    }

    async fn reset_session(&self, user_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
        debug!(user_id, "assistant session reset");
    }

    async fn remember(&self, user_id: &str, note: &str) -> Result<(), AssistantError> {
        let id = self.notes.save_note(user_id, note).await?;
        debug!(user_id, note_id = id, "note saved");
        Ok(())
    }
}
