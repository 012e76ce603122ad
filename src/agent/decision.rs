//! Decision service: chooses whether, how and what to send to a lead.
//!
//! The LLM-backed implementation sends one tight prompt with the lead's
//! history and asks for a single JSON object back. Anything it returns still
//! goes through the guardrail validator before a gateway sees it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::agent::LeadContext;
use crate::channels::OutboundMessage;
use crate::error::DecisionError;
use crate::leads::{ChannelKind, Direction};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Max tokens for a decision call.
const DECISION_MAX_TOKENS: u32 = 700;

/// Temperature for message drafting.
const DECISION_TEMPERATURE: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Send,
    Wait,
    Escalate,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Wait => "wait",
            Self::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub channel: Option<ChannelKind>,
    pub content: String,
    pub subject: Option<String>,
    pub confidence: f32,
    /// Requested delay before the next review when waiting.
    pub wait_hours: Option<f64>,
    pub reason: Option<String>,
}

impl Decision {
    /// A send decision.
    pub fn send(channel: ChannelKind, content: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Send,
            channel: Some(channel),
            content: content.into(),
            subject: None,
            confidence: 1.0,
            wait_hours: None,
            reason: None,
        }
    }

    pub fn wait(wait_hours: Option<f64>, reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Wait,
            channel: None,
            content: String::new(),
            subject: None,
            confidence: 1.0,
            wait_hours,
            reason: Some(reason.into()),
        }
    }

    pub fn escalate(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Escalate,
            channel: None,
            content: String::new(),
            subject: None,
            confidence: 1.0,
            wait_hours: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// The message to validate and send, if this is a send decision.
    pub fn outbound(&self) -> Option<OutboundMessage> {
        if self.action != DecisionAction::Send {
            return None;
        }
        let mut msg = OutboundMessage::new(self.channel?, self.content.clone());
        msg.subject = self.subject.clone();
        Some(msg)
    }
}

#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Decide the next action for a lead. `trigger_message` is the inbound
    /// text that caused this call, if any.
    async fn decide(
        &self,
        ctx: &LeadContext,
        trigger_message: Option<&str>,
    ) -> Result<Decision, DecisionError>;
}

pub struct LlmDecisionService {
    llm: Arc<dyn LlmProvider>,
}

impl LlmDecisionService {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl DecisionService for LlmDecisionService {
    async fn decide(
        &self,
        ctx: &LeadContext,
        trigger_message: Option<&str>,
    ) -> Result<Decision, DecisionError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_decision_system_prompt()),
            ChatMessage::user(build_decision_user_prompt(ctx, trigger_message)),
        ])
        .with_temperature(DECISION_TEMPERATURE)
        .with_max_tokens(DECISION_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        debug!(
            lead_id = %ctx.lead.id,
            model = self.llm.model_name(),
            "Decision response received"
        );

        parse_decision_response(&response.content).map_err(|e| {
            warn!(
                lead_id = %ctx.lead.id,
                raw_response = %response.content,
                error = %e,
                "Unusable decision response"
            );
            DecisionError::Malformed(e)
        })
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_decision_system_prompt() -> String {
    "You are the follow-up assistant for a mortgage brokerage. You decide the next \
     touch for one lead and write it.\n\n\
     Actions:\n\
     - \"send\": write the next message. Provide channel (sms, email or voice), content, \
     and a subject for email.\n\
     - \"wait\": nothing useful to say yet. Provide wait_hours and reason.\n\
     - \"escalate\": a loan officer must step in (complaint, legal question, rate lock, \
     anything you cannot answer). Provide reason.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"action\": \"...\", \"channel\": \"...\", \"subject\": \"...\", \"content\": \"...\", \
     \"confidence\": 0.0, \"wait_hours\": 0, \"reason\": \"...\"}\n\n\
     Rules:\n\
     - Only use channels listed as available\n\
     - SMS under 300 characters, plain and friendly\n\
     - Never repeat an earlier message\n\
     - Never promise a call or a callback at a time that is not a booked appointment\n\
     - Never quote rates or approve anything\n\
     - Reply directly to the lead's latest message when there is one"
        .to_string()
}

fn build_decision_user_prompt(ctx: &LeadContext, trigger_message: Option<&str>) -> String {
    let lead = &ctx.lead;
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(&format!("Lead: {}\n", lead.name));
    prompt.push_str(&format!("Status: {}\n", lead.status));
    prompt.push_str(&format!("Age: {} days\n", ctx.age_days()));
    if let Some(amount) = lead.loan_amount {
        prompt.push_str(&format!("Loan amount: {amount}\n"));
    }

    let channels: Vec<&str> = [ChannelKind::Sms, ChannelKind::Email, ChannelKind::Voice]
        .into_iter()
        .filter(|c| lead.can_use(*c))
        .map(|c| c.as_str())
        .collect();
    prompt.push_str(&format!("Available channels: {}\n", channels.join(", ")));
    prompt.push_str(&format!(
        "Messages sent: {} total, {} in the last 24h\n",
        ctx.cadence.outbound_count, ctx.cadence.outbound_last_24h
    ));
    prompt.push_str(&format!(
        "Local time: {}\n",
        ctx.local_time(ctx.now).format("%a %Y-%m-%d %H:%M")
    ));

    if !ctx.upcoming_appointments.is_empty() {
        prompt.push_str("\nBooked appointments (lead local time):\n");
        for appt in &ctx.upcoming_appointments {
            prompt.push_str(&format!(
                "  - {}\n",
                ctx.local_time(appt.scheduled_at).format("%a %Y-%m-%d %H:%M")
            ));
        }
    }

    if !ctx.history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for c in &ctx.history {
            let who = match c.direction {
                Direction::Outbound => "us",
                Direction::Inbound => "lead",
            };
            let preview: String = c.content.chars().take(300).collect();
            prompt.push_str(&format!(
                "  [{} {} {}] {}\n",
                c.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                c.channel,
                who,
                preview
            ));
        }
    }

    if let Some(text) = trigger_message {
        let preview: String = text.chars().take(1000).collect();
        prompt.push_str(&format!("\nThe lead just wrote:\n{preview}"));
    }

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    action: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    wait_hours: Option<f64>,
    #[serde(default)]
    reason: String,
}

fn parse_decision_response(raw: &str) -> Result<Decision, String> {
    let json_str = extract_json_object(raw);
    let response: DecisionResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let reason = (!response.reason.is_empty()).then_some(response.reason);
    match response.action.as_str() {
        "send" => {
            let channel: ChannelKind = response.channel.parse()?;
            if response.content.trim().is_empty() {
                return Err("send action requires content".into());
            }
            Ok(Decision {
                action: DecisionAction::Send,
                channel: Some(channel),
                content: response.content,
                subject: (!response.subject.is_empty()).then_some(response.subject),
                confidence: response.confidence.clamp(0.0, 1.0),
                wait_hours: None,
                reason,
            })
        }
        "wait" => Ok(Decision {
            wait_hours: response.wait_hours.filter(|h| h.is_finite() && *h > 0.0),
            confidence: response.confidence.clamp(0.0, 1.0),
            ..Decision::wait(None, reason.unwrap_or_else(|| "no reason given".into()))
        }),
        "escalate" => Ok(Decision {
            confidence: response.confidence.clamp(0.0, 1.0),
            ..Decision::escalate(reason.unwrap_or_else(|| "escalation requested".into()))
        }),
        other => Err(format!("unknown decision action: '{other}'")),
    }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{Duration, Utc};

    use crate::cadence::CadenceInput;
    use crate::error::LlmError;
    use crate::leads::{Communication, Consent, Lead};
    use crate::llm::{CompletionResponse, FinishReason};

    struct CannedLlm {
        reply: String,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl CannedLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            Ok(CompletionResponse {
                content: self.reply.clone(),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn context() -> LeadContext {
        let now = Utc::now();
        let lead = Lead::new("Jordan Avery", now - Duration::days(3))
            .with_phone("+15550140")
            .with_consent(Consent {
                sms: true,
                email: false,
                voice: false,
            });
        let history = vec![
            Communication::outbound(lead.id, ChannelKind::Sms, "Hi Jordan!", now - Duration::days(2)),
            Communication::inbound(lead.id, ChannelKind::Sms, "What docs do I need?", now - Duration::hours(1)),
        ];
        LeadContext {
            cadence: CadenceInput {
                created_at: lead.created_at,
                outbound_count: 1,
                outbound_last_24h: 0,
                last_outbound_at: Some(now - Duration::days(2)),
                has_replied: true,
            },
            lead,
            history,
            recent_outbound: vec![],
            upcoming_appointments: vec![],
            last_inbound_at: Some(now - Duration::hours(1)),
            now,
        }
    }

    #[test]
    fn parse_send_in_fence() {
        let raw = "Here you go:\n```json\n{\"action\":\"send\",\"channel\":\"sms\",\"content\":\"Pay stubs and W-2s.\",\"confidence\":1.7}\n```";
        let d = parse_decision_response(raw).unwrap();
        assert_eq!(d.action, DecisionAction::Send);
        assert_eq!(d.channel, Some(ChannelKind::Sms));
        assert_eq!(d.confidence, 1.0);
        assert!(d.subject.is_none());
    }

    #[test]
    fn parse_wait_and_escalate() {
        let d = parse_decision_response(r#"{"action":"wait","wait_hours":6,"reason":"asked for time"}"#)
            .unwrap();
        assert_eq!(d.action, DecisionAction::Wait);
        assert_eq!(d.wait_hours, Some(6.0));
        assert_eq!(d.reason.as_deref(), Some("asked for time"));
        assert!(d.outbound().is_none());

        let d = parse_decision_response(r#"{"action":"escalate"}"#).unwrap();
        assert_eq!(d.action, DecisionAction::Escalate);
    }

    #[test]
    fn parse_rejects_bad_output() {
        assert!(parse_decision_response("not json").is_err());
        assert!(parse_decision_response(r#"{"action":"send","channel":"fax","content":"x"}"#).is_err());
        assert!(parse_decision_response(r#"{"action":"send","channel":"sms","content":"  "}"#).is_err());
        assert!(parse_decision_response(r#"{"action":"dance"}"#).is_err());
    }

    #[test]
    fn user_prompt_lists_channels_and_trigger() {
        let ctx = context();
        let prompt = build_decision_user_prompt(&ctx, Some("Is 3pm ok?"));
        assert!(prompt.contains("Lead: Jordan Avery"));
        assert!(prompt.contains("Available channels: sms\n"));
        assert!(prompt.contains("lead] What docs do I need?"));
        assert!(prompt.ends_with("Is 3pm ok?"));
    }

    #[tokio::test]
    async fn llm_service_round_trip() {
        let llm = CannedLlm::new(
            r#"{"action":"send","channel":"sms","content":"Two recent pay stubs and last year's W-2.","confidence":0.9}"#,
        );
        let service = LlmDecisionService::new(llm.clone());
        let decision = service.decide(&context(), None).await.unwrap();
        let out = decision.outbound().unwrap();
        assert_eq!(out.channel, ChannelKind::Sms);
        assert!(out.content.contains("W-2"));

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].max_tokens, Some(DECISION_MAX_TOKENS));
        assert!(seen[0].system_prompt().unwrap().contains("mortgage"));
    }

    #[tokio::test]
    async fn malformed_reply_is_a_decision_error() {
        let service = LlmDecisionService::new(CannedLlm::new("I think you should text them"));
        let err = service.decide(&context(), None).await.unwrap_err();
        assert!(matches!(err, DecisionError::Malformed(_)));
    }
}
