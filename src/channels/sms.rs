//! SMS gateway over the Twilio Messages REST API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{SendReceipt, SmsGateway};
use crate::error::GatewayError;

/// Twilio credentials, built from environment variables.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    /// Overridable for tests and regional edges.
    pub api_base: String,
}

impl TwilioConfig {
    /// Returns `None` if `TWILIO_ACCOUNT_SID` is not set (SMS disabled).
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID").ok()?;
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN").unwrap_or_default();
        let from_number = std::env::var("TWILIO_FROM_NUMBER").unwrap_or_default();
        let api_base = std::env::var("TWILIO_API_BASE")
            .unwrap_or_else(|_| "https://api.twilio.com".to_string());

        Some(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            from_number,
            api_base,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

pub struct TwilioSmsGateway {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioSmsGateway {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsGateway for TwilioSmsGateway {
    async fn send_sms(&self, to: &str, body: &str) -> Result<SendReceipt, GatewayError> {
        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&[
                ("To", to),
                ("From", self.config.from_number.as_str()),
                ("Body", body),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::SendFailed {
                name: "sms".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::SendFailed {
                name: "sms".into(),
                reason: format!("Twilio returned {status}: {text}"),
            });
        }

        let msg: TwilioMessage = resp.json().await.map_err(|e| GatewayError::SendFailed {
            name: "sms".into(),
            reason: format!("unreadable Twilio response: {e}"),
        })?;

        tracing::debug!(sid = %msg.sid, "SMS accepted by Twilio");
        Ok(SendReceipt {
            id: msg.sid,
            status: msg.status.unwrap_or_else(|| "queued".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_url_uses_account() {
        let gw = TwilioSmsGateway::new(TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: SecretString::from("tok"),
            from_number: "+15550000".into(),
            api_base: "https://api.twilio.com/".into(),
        });
        assert_eq!(
            gw.messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn parses_twilio_message() {
        let msg: TwilioMessage =
            serde_json::from_str(r#"{"sid":"SM9","status":"accepted","to":"+1"}"#).unwrap();
        assert_eq!(msg.sid, "SM9");
        assert_eq!(msg.status.as_deref(), Some("accepted"));
    }
}
