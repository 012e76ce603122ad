//! Lead pipeline records: leads, communications, appointments, deferred
//! messages and the activity audit log.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::state::LeadStatus;

/// Outbound/inbound communication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Sms,
    Email,
    Voice,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Voice => "voice",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            "voice" => Ok(Self::Voice),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Direction of a logged communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Per-channel contact consent. Each flag is independently revocable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub email: bool,
    #[serde(default)]
    pub voice: bool,
}

impl Consent {
    /// Consent to every channel.
    pub fn all() -> Self {
        Self {
            sms: true,
            email: true,
            voice: true,
        }
    }

    pub fn allows(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Sms => self.sms,
            ChannelKind::Email => self.email,
            ChannelKind::Voice => self.voice,
        }
    }

    pub fn any(&self) -> bool {
        self.sms || self.email || self.voice
    }

    pub fn revoke(&mut self, channel: ChannelKind) {
        match channel {
            ChannelKind::Sms => self.sms = false,
            ChannelKind::Email => self.email = false,
            ChannelKind::Voice => self.voice = false,
        }
    }
}

/// A prospective borrower tracked through the pipeline.
///
/// The fields are a materialized view over the communication and activity
/// logs; history-derived facts (reply count, outbound count) are never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub status: LeadStatus,
    pub consent: Consent,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub next_review_at: Option<DateTime<Utc>>,
    pub managed_by_autonomous: bool,
    pub agent_disabled: bool,
    /// Lead-local clock offset, used to read clock times in message text.
    pub utc_offset_minutes: i32,
    pub loan_amount: Option<Decimal>,
    pub application_started_at: Option<DateTime<Utc>>,
    pub call_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// A freshly captured lead: `NEW`, autonomously managed, due immediately.
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            phone: None,
            email: None,
            status: LeadStatus::New,
            consent: Consent::default(),
            last_contacted_at: None,
            next_review_at: None,
            managed_by_autonomous: true,
            agent_disabled: false,
            utc_offset_minutes: 0,
            loan_amount: None,
            application_started_at: None,
            call_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_consent(mut self, consent: Consent) -> Self {
        self.consent = consent;
        self
    }

    /// Whether a channel is usable: consent given and an address on file.
    pub fn can_use(&self, channel: ChannelKind) -> bool {
        if !self.consent.allows(channel) {
            return false;
        }
        match channel {
            ChannelKind::Sms | ChannelKind::Voice => self.phone.is_some(),
            ChannelKind::Email => self.email.is_some(),
        }
    }

    /// Eligible for autonomous scheduling at all (ignores timing).
    pub fn is_schedulable(&self) -> bool {
        self.managed_by_autonomous
            && !self.agent_disabled
            && !self.status.is_terminal()
            && [ChannelKind::Sms, ChannelKind::Email, ChannelKind::Voice]
                .into_iter()
                .any(|c| self.can_use(c))
    }

    /// Whole days since the lead was captured.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_days().max(0)
    }
}

/// One immutable send/receive event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Communication {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub channel: ChannelKind,
    pub direction: Direction,
    pub content: String,
    pub provider_id: Option<String>,
    pub provider_status: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Communication {
    pub fn outbound(
        lead_id: Uuid,
        channel: ChannelKind,
        content: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(lead_id, channel, Direction::Outbound, content, at)
    }

    pub fn inbound(
        lead_id: Uuid,
        channel: ChannelKind,
        content: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(lead_id, channel, Direction::Inbound, content, at)
    }

    fn new(
        lead_id: Uuid,
        channel: ChannelKind,
        direction: Direction,
        content: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            channel,
            direction,
            content: content.into(),
            provider_id: None,
            provider_status: None,
            metadata: serde_json::Value::Null,
            created_at: at,
        }
    }

    pub fn with_provider(mut self, id: Option<String>, status: Option<String>) -> Self {
        self.provider_id = id;
        self.provider_status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Appointment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "no_show" => Ok(Self::NoShow),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

/// Which one-shot appointment reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderSlot {
    DayBefore,
    HourBefore,
}

impl ReminderSlot {
    /// Column holding this slot's sent flag.
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::DayBefore => "reminder_24h_sent",
            Self::HourBefore => "reminder_1h_sent",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::DayBefore => "24h",
            Self::HourBefore => "1h",
        }
    }
}

/// A scheduled meeting with a loan officer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub external_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub reminder_24h_sent: bool,
    pub reminder_1h_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn new(lead_id: Uuid, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            external_id: None,
            scheduled_at,
            status: AppointmentStatus::Scheduled,
            reminder_24h_sent: false,
            reminder_1h_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn reminder_sent(&self, slot: ReminderSlot) -> bool {
        match slot {
            ReminderSlot::DayBefore => self.reminder_24h_sent,
            ReminderSlot::HourBefore => self.reminder_1h_sent,
        }
    }
}

/// Kind of deferred message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledKind {
    PostCallFollowUp,
    Manual,
}

impl ScheduledKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostCallFollowUp => "post_call_follow_up",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ScheduledKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post_call_follow_up" => Ok(Self::PostCallFollowUp),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown scheduled message kind: {other}")),
        }
    }
}

/// A send queued for a later pass. Cancellation deletes the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: ScheduledKind,
    pub channel: ChannelKind,
    pub subject: Option<String>,
    pub content: String,
    pub execute_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        lead_id: Uuid,
        kind: ScheduledKind,
        channel: ChannelKind,
        content: impl Into<String>,
        execute_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            kind,
            channel,
            subject: None,
            content: content.into(),
            execute_at,
            created_at: now,
        }
    }
}

/// Audit note kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    StatusChange,
    GuardrailRejected,
    DuplicateSuppressed,
    ProcessingFailed,
    DecisionWait,
    Milestone,
    Nudge,
    Reminder,
    CallOutcome,
    ApplicationLink,
    ConsentChange,
    Note,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::GuardrailRejected => "guardrail_rejected",
            Self::DuplicateSuppressed => "duplicate_suppressed",
            Self::ProcessingFailed => "processing_failed",
            Self::DecisionWait => "decision_wait",
            Self::Milestone => "milestone",
            Self::Nudge => "nudge",
            Self::Reminder => "reminder",
            Self::CallOutcome => "call_outcome",
            Self::ApplicationLink => "application_link",
            Self::ConsentChange => "consent_change",
            Self::Note => "note",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "status_change" => Self::StatusChange,
            "guardrail_rejected" => Self::GuardrailRejected,
            "duplicate_suppressed" => Self::DuplicateSuppressed,
            "processing_failed" => Self::ProcessingFailed,
            "decision_wait" => Self::DecisionWait,
            "milestone" => Self::Milestone,
            "nudge" => Self::Nudge,
            "reminder" => Self::Reminder,
            "call_outcome" => Self::CallOutcome,
            "application_link" => Self::ApplicationLink,
            "consent_change" => Self::ConsentChange,
            "note" => Self::Note,
            other => return Err(format!("unknown activity kind: {other}")),
        })
    }
}

/// Append-only audit note attached to a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: ActivityKind,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(
        lead_id: Uuid,
        kind: ActivityKind,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            kind,
            detail: detail.into(),
            created_at: at,
        }
    }
}
