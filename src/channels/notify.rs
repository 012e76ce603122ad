//! Operator notifications.
//!
//! Callers go through `QueuedNotifier`, which never blocks: notifications
//! are pushed onto a bounded channel and a forwarder task delivers them to
//! the real sink (Telegram, or the log when nothing is configured).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::GatewayError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    ProcessingFailure,
    Milestone,
    StaleLead,
    Escalation,
    CallOutcome,
    Application,
    OptOut,
    Archived,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessingFailure => "processing_failure",
            Self::Milestone => "milestone",
            Self::StaleLead => "stale_lead",
            Self::Escalation => "escalation",
            Self::CallOutcome => "call_outcome",
            Self::Application => "application",
            Self::OptOut => "opt_out",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub category: NotificationCategory,
    pub severity: Severity,
    pub lead_name: String,
    pub lead_id: Option<Uuid>,
    pub details: String,
}

impl Notification {
    pub fn new(
        category: NotificationCategory,
        severity: Severity,
        lead_name: impl Into<String>,
        lead_id: Option<Uuid>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            lead_name: lead_name.into(),
            lead_id,
            details: details.into(),
        }
    }

    /// One-message rendering for chat-style sinks.
    pub fn render(&self) -> String {
        let icon = match self.severity {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Critical => "🚨",
        };
        let mut text = format!(
            "{icon} [{}] {}",
            self.category.as_str(),
            self.lead_name
        );
        if let Some(id) = self.lead_id {
            text.push_str(&format!(" ({id})"));
        }
        text.push('\n');
        text.push_str(&self.details);
        truncate(&text, TELEGRAM_MAX_MESSAGE_LENGTH)
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), GatewayError>;
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Writes notifications to the log. Used when no chat sink is configured.
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, n: Notification) -> Result<(), GatewayError> {
        match n.severity {
            Severity::Info => tracing::info!(
                category = n.category.as_str(),
                lead = %n.lead_name,
                lead_id = ?n.lead_id,
                "{}", n.details
            ),
            Severity::Warning | Severity::Critical => tracing::warn!(
                category = n.category.as_str(),
                severity = n.severity.as_str(),
                lead = %n.lead_name,
                lead_id = ?n.lead_id,
                "{}", n.details
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TelegramNotifyConfig {
    pub bot_token: SecretString,
    pub chat_id: String,
}

impl TelegramNotifyConfig {
    /// Returns `None` unless both `TELEGRAM_BOT_TOKEN` and
    /// `TELEGRAM_NOTIFY_CHAT_ID` are set.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_NOTIFY_CHAT_ID").ok()?;
        Some(Self {
            bot_token: SecretString::from(bot_token),
            chat_id,
        })
    }
}

/// Posts notifications to a Telegram chat via the Bot API.
pub struct TelegramNotifier {
    config: TelegramNotifyConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramNotifyConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.config.bot_token.expose_secret()
        )
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify(&self, n: Notification) -> Result<(), GatewayError> {
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": n.render(),
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::SendFailed {
                name: "telegram".into(),
                reason: format!("sendMessage failed ({status}): {text}"),
            });
        }
        Ok(())
    }
}

// ── Non-blocking front ──────────────────────────────────────────────

/// Enqueues notifications without waiting for delivery.
#[derive(Clone)]
pub struct QueuedNotifier {
    tx: mpsc::Sender<Notification>,
}

impl QueuedNotifier {
    /// Create the queue and spawn its forwarder. Each delivery is bounded by
    /// `timeout`; failures are logged and dropped.
    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        capacity: usize,
        timeout: Duration,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                let category = n.category.as_str();
                match tokio::time::timeout(timeout, sink.notify(n)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(category, error = %e, "Notification delivery failed"),
                    Err(_) => tracing::warn!(category, ?timeout, "Notification delivery timed out"),
                }
            }
            tracing::debug!("Notification forwarder stopped");
        });
        (Self { tx }, handle)
    }
}

#[async_trait]
impl NotificationSink for QueuedNotifier {
    async fn notify(&self, n: Notification) -> Result<(), GatewayError> {
        self.tx.try_send(n).map_err(|e| {
            tracing::warn!(error = %e, "Notification queue full or closed; dropping");
            GatewayError::SendFailed {
                name: "notify_queue".into(),
                reason: e.to_string(),
            }
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max.saturating_sub(3);
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for Collect {
        async fn notify(&self, n: Notification) -> Result<(), GatewayError> {
            self.seen.lock().unwrap().push(n);
            Ok(())
        }
    }

    fn sample() -> Notification {
        Notification::new(
            NotificationCategory::Milestone,
            Severity::Info,
            "Pat Lee",
            Some(Uuid::nil()),
            "day 7",
        )
    }

    #[test]
    fn render_includes_category_and_lead() {
        let text = sample().render();
        assert!(text.contains("[milestone] Pat Lee"));
        assert!(text.ends_with("day 7"));
    }

    #[test]
    fn render_truncates_long_details() {
        let mut n = sample();
        n.details = "x".repeat(5000);
        assert!(n.render().len() <= TELEGRAM_MAX_MESSAGE_LENGTH);
    }

    #[tokio::test]
    async fn queued_notifier_forwards() {
        let sink = Arc::new(Collect::default());
        let (queue, handle) = QueuedNotifier::spawn(sink.clone(), 8, Duration::from_secs(1));
        queue.notify(sample()).await.unwrap();
        drop(queue);
        handle.await.unwrap();
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        struct Stuck;
        #[async_trait]
        impl NotificationSink for Stuck {
            async fn notify(&self, _n: Notification) -> Result<(), GatewayError> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
        let (queue, _handle) = QueuedNotifier::spawn(Arc::new(Stuck), 1, Duration::from_secs(60));
        // First is taken by the forwarder or fills the slot; eventually one must fail.
        let mut failures = 0;
        for _ in 0..4 {
            if queue.notify(sample()).await.is_err() {
                failures += 1;
            }
        }
        assert!(failures >= 2);
    }
}
