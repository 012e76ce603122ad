//! Outbound channel gateways and the operator notification sink.
//!
//! Every gateway makes a single attempt per call; retries belong to the
//! cadence engine's re-arm logic, not to the transport.

pub mod email;
pub mod notify;
pub mod sms;
pub mod voice;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use email::{SmtpConfig, SmtpEmailGateway};
pub use notify::{
    Notification, NotificationCategory, NotificationSink, QueuedNotifier, Severity,
    TelegramNotifier, TelegramNotifyConfig, TracingNotifier,
};
pub use sms::{TwilioConfig, TwilioSmsGateway};
pub use voice::{HttpVoiceGateway, VoiceConfig};

use crate::error::GatewayError;
use crate::leads::{ChannelKind, Lead};

/// Provider acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: String,
    pub status: String,
}

/// A message ready to go out on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: ChannelKind,
    pub subject: Option<String>,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(channel: ChannelKind, content: impl Into<String>) -> Self {
        Self {
            channel,
            subject: None,
            content: content.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<SendReceipt, GatewayError>;
}

#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<SendReceipt, GatewayError>;
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn initiate_call(
        &self,
        to: &str,
        metadata: &serde_json::Value,
    ) -> Result<SendReceipt, GatewayError>;
}

/// The configured gateways. A missing gateway makes its channel unusable.
#[derive(Clone, Default)]
pub struct Gateways {
    pub sms: Option<Arc<dyn SmsGateway>>,
    pub email: Option<Arc<dyn EmailGateway>>,
    pub voice: Option<Arc<dyn VoiceGateway>>,
}

/// Subject used when an email has none.
const DEFAULT_EMAIL_SUBJECT: &str = "Following up on your home loan";

impl Gateways {
    pub fn with_sms(mut self, gw: Arc<dyn SmsGateway>) -> Self {
        self.sms = Some(gw);
        self
    }

    pub fn with_email(mut self, gw: Arc<dyn EmailGateway>) -> Self {
        self.email = Some(gw);
        self
    }

    pub fn with_voice(mut self, gw: Arc<dyn VoiceGateway>) -> Self {
        self.voice = Some(gw);
        self
    }

    pub fn supports(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Sms => self.sms.is_some(),
            ChannelKind::Email => self.email.is_some(),
            ChannelKind::Voice => self.voice.is_some(),
        }
    }

    /// Send through the channel's gateway, bounded by `timeout`.
    pub async fn send(
        &self,
        lead: &Lead,
        message: &OutboundMessage,
        timeout: Duration,
    ) -> Result<SendReceipt, GatewayError> {
        let name = message.channel.as_str();
        let fut = async {
            match message.channel {
                ChannelKind::Sms => {
                    let gw = self.sms.as_ref().ok_or_else(|| not_configured(name))?;
                    let to = recipient(lead.phone.as_deref(), name)?;
                    gw.send_sms(to, &message.content).await
                }
                ChannelKind::Email => {
                    let gw = self.email.as_ref().ok_or_else(|| not_configured(name))?;
                    let to = recipient(lead.email.as_deref(), name)?;
                    let subject = message.subject.as_deref().unwrap_or(DEFAULT_EMAIL_SUBJECT);
                    let html = text_to_html(&message.content);
                    gw.send_email(to, subject, &html, Some(&message.content)).await
                }
                ChannelKind::Voice => {
                    let gw = self.voice.as_ref().ok_or_else(|| not_configured(name))?;
                    let to = recipient(lead.phone.as_deref(), name)?;
                    let metadata = serde_json::json!({
                        "lead_id": lead.id,
                        "lead_name": lead.name,
                        "script": message.content,
                    });
                    gw.initiate_call(to, &metadata).await
                }
            }
        };

        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| GatewayError::Timeout {
                name: name.to_string(),
                timeout,
            })?
    }
}

fn not_configured(name: &str) -> GatewayError {
    GatewayError::NotConfigured {
        name: name.to_string(),
    }
}

fn recipient<'a>(addr: Option<&'a str>, name: &str) -> Result<&'a str, GatewayError> {
    match addr.map(str::trim) {
        Some(a) if !a.is_empty() => Ok(a),
        _ => Err(GatewayError::InvalidRecipient {
            name: name.to_string(),
            reason: "no address on file".to_string(),
        }),
    }
}

/// Minimal HTML body from plain text: escaped, one `<p>` per paragraph.
pub fn text_to_html(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let escaped = p
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('\n', "<br>");
            format!("<p>{escaped}</p>")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
