//! LLM backend seam.
//!
//! The [`Assistant`] trait is everything the channel adapter and heartbeat
//! need from the model: a reply per turn, a session reset, and a place to
//! save notes. [`openai::ChatAssistant`] implements it over any
//! OpenAI-compatible `/v1/chat/completions` endpoint.

pub mod openai;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Errors from the assistant backend.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// HTTP transport failure.
    #[error("assistant request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response did not match the expected schema.
    #[error("assistant response parse error: {0}")]
    Parse(String),

    /// Backend responded with an error status.
    #[error("assistant returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },

    /// Backend cannot serve requests with the current configuration.
    #[error("assistant unavailable: {0}")]
    Unavailable(String),

    /// Note persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt.
    System,
    /// The human.
    User,
    /// The model.
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
}

impl ChatTurn {
    /// A user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The conversational backend.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Answer `text` from `user_id`, continuing that user's session.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError`] on API, network, or parse failure.
    async fn reply(&self, user_id: &str, text: &str) -> Result<String, AssistantError>;

    /// Forget `user_id`'s conversation history.
    async fn reset_session(&self, user_id: &str);

    /// Persist a note for `user_id`; recent notes are shown to the model.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Store`] when the note cannot be saved.
    async fn remember(&self, user_id: &str, note: &str) -> Result<(), AssistantError>;
}

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns [`AssistantError::Request`] on transport failure and
/// [`AssistantError::HttpStatus`] on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, AssistantError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AssistantError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace, redact anything that looks like an API key, and
/// truncate, so error bodies are safe to log.
pub fn sanitize_http_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 256;

    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    for pattern in [r"sk-[A-Za-z0-9_\-]{20,}", r"Bearer [A-Za-z0-9_\-\.]{10,}"] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}
