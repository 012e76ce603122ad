//! Email gateway — SMTP via lettre.

use async_trait::async_trait;
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::{EmailGateway, SendReceipt};
use crate::error::GatewayError;

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (email disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("EMAIL_SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

pub struct SmtpEmailGateway {
    config: SmtpConfig,
}

impl SmtpEmailGateway {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

fn send_failed(reason: impl Into<String>) -> GatewayError {
    GatewayError::SendFailed {
        name: "email".into(),
        reason: reason.into(),
    }
}

/// Build the MIME message. Plain-text alternative is included when given.
fn build_message(
    from: &str,
    to: &str,
    subject: &str,
    html: &str,
    text: Option<&str>,
    message_id: &str,
) -> Result<Message, GatewayError> {
    let builder = Message::builder()
        .from(
            from.parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to.parse().map_err(|e| GatewayError::InvalidRecipient {
            name: "email".into(),
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(subject)
        .message_id(Some(message_id.to_string()));

    let built = match text {
        Some(text) => builder.multipart(MultiPart::alternative_plain_html(
            text.to_string(),
            html.to_string(),
        )),
        None => builder
            .header(lettre::message::header::ContentType::TEXT_HTML)
            .body(html.to_string()),
    };
    built.map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

#[async_trait]
impl EmailGateway for SmtpEmailGateway {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<SendReceipt, GatewayError> {
        let domain = self
            .config
            .from_address
            .rsplit('@')
            .next()
            .unwrap_or("localhost")
            .to_string();
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);
        let email = build_message(
            &self.config.from_address,
            to,
            subject,
            html,
            text,
            &message_id,
        )?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let host = self.config.smtp_host.clone();
        let port = self.config.smtp_port;

        // lettre's SmtpTransport is blocking.
        let result = tokio::task::spawn_blocking(move || {
            let transport = SmtpTransport::relay(&host)
                .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
                .port(port)
                .credentials(creds)
                .build();
            transport
                .send(&email)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;

        tracing::debug!(message_id = %message_id, code = %result.code(), "Email accepted by SMTP relay");
        Ok(SendReceipt {
            id: message_id,
            status: "sent".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_returns_none_without_host() {
        // SAFETY: test-only env mutation, no other test reads this key.
        unsafe { std::env::remove_var("EMAIL_SMTP_HOST") };
        assert!(SmtpConfig::from_env().is_none());
    }

    #[test]
    fn builds_multipart_message() {
        let msg = build_message(
            "loans@broker.example",
            "lead@example.com",
            "Your rate quote",
            "<p>Hello</p>",
            Some("Hello"),
            "<abc@broker.example>",
        )
        .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("Subject: Your rate quote"));
        assert!(raw.contains("multipart/alternative"));
    }

    #[test]
    fn bad_recipient_is_rejected() {
        let err = build_message(
            "loans@broker.example",
            "not an address",
            "s",
            "<p>x</p>",
            None,
            "<id@broker.example>",
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRecipient { .. }));
    }
}
