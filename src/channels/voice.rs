//! Voice gateway — asks an HTTP voice-agent provider to place an outbound call.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{SendReceipt, VoiceGateway};
use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Full URL of the provider's "create call" endpoint.
    pub endpoint: String,
    pub api_key: SecretString,
    /// Provider-side agent/assistant that runs the call.
    pub agent_id: Option<String>,
}

impl VoiceConfig {
    /// Returns `None` if `VOICE_API_URL` is not set (voice disabled).
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("VOICE_API_URL").ok()?;
        let api_key = std::env::var("VOICE_API_KEY").unwrap_or_default();
        Some(Self {
            endpoint,
            api_key: SecretString::from(api_key),
            agent_id: std::env::var("VOICE_AGENT_ID").ok(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CallCreated {
    #[serde(alias = "call_id")]
    id: String,
    #[serde(default)]
    status: Option<String>,
}

pub struct HttpVoiceGateway {
    config: VoiceConfig,
    client: reqwest::Client,
}

impl HttpVoiceGateway {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, to: &str, metadata: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "to_number": to,
            "agent_id": self.config.agent_id,
            "metadata": metadata,
        })
    }
}

#[async_trait]
impl VoiceGateway for HttpVoiceGateway {
    async fn initiate_call(
        &self,
        to: &str,
        metadata: &serde_json::Value,
    ) -> Result<SendReceipt, GatewayError> {
        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&self.request_body(to, metadata))
            .send()
            .await
            .map_err(|e| GatewayError::SendFailed {
                name: "voice".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::SendFailed {
                name: "voice".into(),
                reason: format!("voice provider returned {status}: {text}"),
            });
        }

        let call: CallCreated = resp.json().await.map_err(|e| GatewayError::SendFailed {
            name: "voice".into(),
            reason: format!("unreadable voice provider response: {e}"),
        })?;

        Ok(SendReceipt {
            id: call.id,
            status: call.status.unwrap_or_else(|| "initiated".to_string()),
        })
    }
}
