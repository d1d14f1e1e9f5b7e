//! HTTP client for the hearth-whatsapp bridge sidecar.
//!
//! All WhatsApp operations go through this client, which talks to the
//! baileys-based Node.js bridge over HTTP (default port 3001).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::WhatsAppError;

/// Default port the WhatsApp bridge listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 3001;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Number of health-check retries before giving up.
const HEALTH_CHECK_RETRIES: u32 = 5;

/// Delay between health-check attempts in milliseconds.
const HEALTH_CHECK_DELAY_MS: u64 = 2000;

/// Client for the bridge HTTP API.
#[derive(Debug, Clone)]
pub struct WhatsAppClient {
    client: reqwest::Client,
    base_url: String,
}

/// Connection status reported by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppStatus {
    /// Whether the bridge holds an open WhatsApp socket.
    pub connected: bool,
    /// The linked phone number, if any.
    pub phone_number: Option<String>,
}

/// Response envelope from the bridge HTTP API.
///
/// The bridge also sends a `success` flag; `data` being present carries the
/// same information, so the flag is not read.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    data: Option<T>,
    error: Option<String>,
}

impl WhatsAppClient {
    /// Create a client for the given base URL. A trailing slash is ignored.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Whether the bridge answers `/status` at all, regardless of link state.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/status", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    /// Wait for the bridge to answer, retrying with a fixed delay.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError::SidecarNotRunning`] once all retries fail.
    pub async fn wait_reachable(&self) -> Result<(), WhatsAppError> {
        for attempt in 0..HEALTH_CHECK_RETRIES {
            if self.is_reachable().await {
                return Ok(());
            }
            if attempt < HEALTH_CHECK_RETRIES.saturating_sub(1) {
                tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_DELAY_MS)).await;
            }
        }
        Err(WhatsAppError::SidecarNotRunning)
    }

    /// Get the current connection status.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge is unreachable or sends no status.
    pub async fn status(&self) -> Result<WhatsAppStatus, WhatsAppError> {
        let url = format!("{}/status", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: BridgeResponse<WhatsAppStatus> = resp.json().await?;
        body.data.ok_or(WhatsAppError::SidecarNotRunning)
    }

    /// Get a QR code for device linking (base64 PNG).
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError::SetupFailed`] when the bridge has no QR code
    /// (usually because the device is already linked).
    pub async fn get_qr(&self) -> Result<String, WhatsAppError> {
        let url = format!("{}/qr", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: BridgeResponse<String> = resp.json().await?;
        body.data.ok_or_else(|| {
            WhatsAppError::SetupFailed(
                body.error
                    .unwrap_or_else(|| "no QR code available".to_owned()),
            )
        })
    }

    /// Send a text message to a full JID.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError::Rejected`] with the bridge status and body on
    /// a non-2xx response, or [`WhatsAppError::Http`] on network failure.
    pub async fn send_text(&self, jid: &str, text: &str) -> Result<(), WhatsAppError> {
        let url = format!("{}/send", self.base_url);
        let body = serde_json::json!({ "jid": jid, "text": text });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body_text = resp.text().await.unwrap_or_default();
            warn!(status, jid, "WhatsApp send rejected: {body_text}");
            return Err(WhatsAppError::Rejected {
                status,
                body: body_text,
            });
        }
        debug!(jid, "message sent via WhatsApp");
        Ok(())
    }

    /// Send a typing indicator (composing) to the given JID.
    ///
    /// Fire and forget: typing indicators are cosmetic.
    pub async fn send_typing(&self, jid: &str) {
        let url = format!("{}/typing", self.base_url);
        let body = serde_json::json!({ "jid": jid });
        let _ = self.client.post(&url).json(&body).send().await;
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
