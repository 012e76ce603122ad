//! Event triggers: lead capture, inbound replies, booking changes, call
//! outcomes and application progress.
//!
//! Each handler updates the lead's records first, then hands the lead to
//! the shared processor when a message may be warranted.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{
    LeadProcessor, PreparedAction, PreparedKind, ProcessOutcome, Trigger, transition_lead,
};
use crate::cadence::sweeps::{complete_call, preferred_channel};
use crate::channels::notify::{Notification, NotificationCategory, Severity};
use crate::config::chrono_duration;
use crate::crm::{CrmClient, create_deal_in_background};
use crate::error::{Error, LeadError};
use crate::leads::{
    Activity, ActivityKind, Appointment, AppointmentStatus, ChannelKind, Communication, Consent,
    Lead, LeadStatus, ScheduledKind,
};

/// SMS keywords that revoke SMS consent.
const OPT_OUT_KEYWORDS: &[&str] = &["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureLead {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub consent_sms: bool,
    #[serde(default = "default_true")]
    pub consent_email: bool,
    #[serde(default)]
    pub consent_voice: bool,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub loan_amount: Option<Decimal>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Twilio-style inbound SMS form.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "MessageSid", default)]
    pub message_sid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingEventKind {
    Created,
    Rescheduled,
    Cancelled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingEvent {
    pub event: BookingEventKind,
    pub external_id: String,
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    NoShow,
    Cancelled,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NoShow => "no_show",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallOutcomeEvent {
    pub outcome: CallOutcome,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationEventKind {
    Started,
    Completed,
    Funded,
}

impl ApplicationEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Funded => "funded",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationEvent {
    pub event: ApplicationEventKind,
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// What an event did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventOutcome {
    pub lead_id: Option<Uuid>,
    pub status: Option<LeadStatus>,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<ProcessOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl EventOutcome {
    fn for_lead(lead: &Lead) -> Self {
        Self {
            lead_id: Some(lead.id),
            status: Some(lead.status),
            ..Default::default()
        }
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    fn with_processed(mut self, outcome: ProcessOutcome) -> Self {
        self.processed = Some(outcome);
        self
    }

    fn duplicate(lead: &Lead) -> Self {
        Self {
            duplicate: true,
            ..Self::for_lead(lead)
        }
    }
}

pub struct EventHandler {
    processor: Arc<LeadProcessor>,
    crm: Option<Arc<dyn CrmClient>>,
}

impl EventHandler {
    pub fn new(processor: Arc<LeadProcessor>) -> Self {
        Self {
            processor,
            crm: None,
        }
    }

    pub fn with_crm(mut self, crm: Arc<dyn CrmClient>) -> Self {
        self.crm = Some(crm);
        self
    }

    pub fn processor(&self) -> &Arc<LeadProcessor> {
        &self.processor
    }

    // ── Lead capture ────────────────────────────────────────────────

    /// Store a new lead. A lead already on file with the same phone or email
    /// is returned unchanged. The bool is `true` when a lead was created.
    pub async fn capture_lead(
        &self,
        input: CaptureLead,
        now: DateTime<Utc>,
    ) -> Result<(Lead, bool), Error> {
        let store = self.processor.store();
        let phone = input.phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        let email = input.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());

        if let Some(p) = phone.as_deref()
            && let Some(existing) = store.find_lead_by_phone(p).await?
        {
            return Ok((existing, false));
        }
        if let Some(e) = email.as_deref()
            && let Some(existing) = store.find_lead_by_email(e).await?
        {
            return Ok((existing, false));
        }

        let mut lead = Lead::new(input.name.trim(), now).with_consent(Consent {
            sms: input.consent_sms,
            email: input.consent_email,
            voice: input.consent_voice,
        });
        lead.phone = phone;
        lead.email = email;
        lead.loan_amount = input.loan_amount;
        lead.utc_offset_minutes = input.utc_offset_minutes;

        store.insert_lead(&lead).await?;
        store
            .append_activity(&Activity::new(lead.id, ActivityKind::Note, "lead captured", now))
            .await?;
        info!(lead_id = %lead.id, "Lead captured");
        Ok((lead, true))
    }

    // ── Inbound SMS ─────────────────────────────────────────────────

    pub async fn inbound_sms(&self, sms: InboundSms, now: DateTime<Utc>) -> Result<EventOutcome, Error> {
        let store = self.processor.store();
        let Some(mut lead) = store.find_lead_by_phone(sms.from.trim()).await? else {
            info!(from = %sms.from, "Inbound SMS from unknown number");
            return Ok(EventOutcome::default().with_note("unknown_sender"));
        };

        let comm = Communication::inbound(lead.id, ChannelKind::Sms, sms.body.clone(), now)
            .with_provider(sms.message_sid.clone(), Some("received".to_string()));
        store.append_communication(&comm).await?;

        if is_opt_out(&sms.body) {
            return self.opt_out(&mut lead, ChannelKind::Sms, &sms.body, now).await;
        }

        if matches!(
            lead.status,
            LeadStatus::New | LeadStatus::Contacted | LeadStatus::Nurturing
        ) {
            transition_lead(store.as_ref(), &mut lead, LeadStatus::Engaged, "inbound_reply", now)
                .await?;
        }

        let processed = self
            .processor
            .process_at(lead.id, Trigger::InboundReply { message: sms.body }, now)
            .await;
        if processed.reason.as_deref() == Some("in_flight") {
            // Another pass holds the lead; the next sweep picks the reply up.
            self.processor.requeue_reply(lead.id, now).await?;
        }
        Ok(EventOutcome::for_lead(&lead).with_processed(processed))
    }

    async fn opt_out(
        &self,
        lead: &mut Lead,
        channel: ChannelKind,
        keyword: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, Error> {
        let store = self.processor.store();
        lead.consent.revoke(channel);
        store.update_lead_consent(lead.id, lead.consent, now).await?;
        store
            .append_activity(&Activity::new(
                lead.id,
                ActivityKind::ConsentChange,
                format!("{channel} consent revoked ({})", keyword.trim()),
                now,
            ))
            .await?;

        if !lead.status.is_terminal() {
            transition_lead(store.as_ref(), lead, LeadStatus::Lost, "opt_out", now).await?;
        }
        self.notify(
            NotificationCategory::OptOut,
            Severity::Warning,
            lead,
            format!("Lead opted out via {channel}"),
        )
        .await;
        info!(lead_id = %lead.id, %channel, "Lead opted out");
        Ok(EventOutcome::for_lead(lead).with_note("opt_out"))
    }

    // ── Booking ─────────────────────────────────────────────────────

    pub async fn booking(&self, event: BookingEvent, now: DateTime<Utc>) -> Result<EventOutcome, Error> {
        let store = self.processor.store();
        let existing = store.get_appointment_by_external_id(&event.external_id).await?;

        match event.event {
            BookingEventKind::Created => {
                let scheduled_at = require_time(event.scheduled_at)?;
                if let Some(appt) = existing {
                    let lead = self.lead(appt.lead_id).await?;
                    if appt.scheduled_at == scheduled_at {
                        return Ok(EventOutcome::duplicate(&lead));
                    }
                    return self.reschedule(appt, scheduled_at, now).await;
                }

                let mut lead = self
                    .resolve_lead(event.lead_id, event.email.as_deref(), event.phone.as_deref())
                    .await?;
                let appt = Appointment::new(lead.id, scheduled_at, now)
                    .with_external_id(event.external_id.clone());
                store.insert_appointment(&appt).await?;
                self.try_transition(&mut lead, LeadStatus::CallScheduled, "booking_created", now)
                    .await?;
                info!(lead_id = %lead.id, appointment_id = %appt.id, %scheduled_at, "Call booked");

                let processed = self.confirm_booking(&lead, scheduled_at, now).await;
                Ok(EventOutcome::for_lead(&lead).with_processed(processed))
            }
            BookingEventKind::Rescheduled => {
                let scheduled_at = require_time(event.scheduled_at)?;
                let appt = existing.ok_or_else(|| unknown_booking(&event.external_id))?;
                self.reschedule(appt, scheduled_at, now).await
            }
            BookingEventKind::Cancelled => {
                let appt = existing.ok_or_else(|| unknown_booking(&event.external_id))?;
                let mut lead = self.lead(appt.lead_id).await?;
                if appt.status == AppointmentStatus::Cancelled {
                    return Ok(EventOutcome::duplicate(&lead));
                }
                store
                    .update_appointment_status(appt.id, AppointmentStatus::Cancelled, now)
                    .await?;
                if lead.status == LeadStatus::CallScheduled {
                    transition_lead(store.as_ref(), &mut lead, LeadStatus::Nurturing, "booking_cancelled", now)
                        .await?;
                }
                store.set_next_review(lead.id, Some(now)).await?;
                info!(lead_id = %lead.id, appointment_id = %appt.id, "Booking cancelled");

                let processed = self.processor.process_at(lead.id, Trigger::Manual, now).await;
                Ok(EventOutcome::for_lead(&lead).with_processed(processed))
            }
        }
    }

    async fn reschedule(
        &self,
        appt: Appointment,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, Error> {
        let store = self.processor.store();
        store.reschedule_appointment(appt.id, scheduled_at, now).await?;
        // A reschedule supersedes any follow-up queued for the old slot.
        store
            .cancel_scheduled_messages(appt.lead_id, ScheduledKind::PostCallFollowUp)
            .await?;

        let mut lead = self.lead(appt.lead_id).await?;
        self.try_transition(&mut lead, LeadStatus::CallScheduled, "booking_rescheduled", now)
            .await?;
        info!(lead_id = %lead.id, appointment_id = %appt.id, %scheduled_at, "Call rescheduled");

        let processed = self.confirm_booking(&lead, scheduled_at, now).await;
        Ok(EventOutcome::for_lead(&lead).with_processed(processed))
    }

    async fn confirm_booking(
        &self,
        lead: &Lead,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ProcessOutcome {
        let Some(channel) = preferred_channel(lead) else {
            return ProcessOutcome::skipped("no_channel");
        };
        let local = (scheduled_at + Duration::minutes(lead.utc_offset_minutes as i64)).naive_utc();
        let first = lead.name.split_whitespace().next().unwrap_or(&lead.name);
        let content = format!(
            "You're all set, {first}! Your call with our loan officer is booked for {}. Reply here if anything changes.",
            local.format("%A, %B %-d at %-I:%M %p")
        );
        let prepared = PreparedAction::new(PreparedKind::Confirmation, channel, content)
            .with_subject(Some("Your mortgage consultation is booked".to_string()));
        self.processor
            .process_at(lead.id, Trigger::Prepared(prepared), now)
            .await
    }

    // ── Call outcomes ───────────────────────────────────────────────

    pub async fn call_outcome(
        &self,
        appointment_id: Uuid,
        event: CallOutcomeEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, Error> {
        let store = self.processor.store();
        let appt = store
            .get_appointment(appointment_id)
            .await?
            .ok_or(LeadError::AppointmentNotFound(appointment_id))?;
        let lead = self.lead(appt.lead_id).await?;

        let marker = format!("{appointment_id}:{}", event.outcome.as_str());
        let window = now - chrono_duration(self.processor.config().duplicate_window);
        if store
            .has_activity(lead.id, ActivityKind::CallOutcome, Some(&marker), Some(window))
            .await?
        {
            info!(lead_id = %lead.id, %appointment_id, outcome = event.outcome.as_str(), "Duplicate call outcome ignored");
            return Ok(EventOutcome::duplicate(&lead));
        }
        store
            .append_activity(&Activity::new(lead.id, ActivityKind::CallOutcome, &marker, now))
            .await?;
        if let Some(notes) = event.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            store
                .append_activity(&Activity::new(lead.id, ActivityKind::Note, notes, now))
                .await?;
        }

        match event.outcome {
            CallOutcome::Completed => {
                complete_call(&self.processor, &appt, "call_completed", now).await?;
            }
            CallOutcome::NoShow => {
                store
                    .update_appointment_status(appt.id, AppointmentStatus::NoShow, now)
                    .await?;
                let cancelled = store
                    .cancel_scheduled_messages(lead.id, ScheduledKind::PostCallFollowUp)
                    .await?;
                let mut lead = lead.clone();
                self.try_transition(&mut lead, LeadStatus::Engaged, "no_show", now)
                    .await?;
                store.set_next_review(lead.id, Some(now)).await?;
                info!(lead_id = %lead.id, %appointment_id, cancelled, "No-show recorded");
            }
            CallOutcome::Cancelled => {
                store
                    .update_appointment_status(appt.id, AppointmentStatus::Cancelled, now)
                    .await?;
                store
                    .cancel_scheduled_messages(lead.id, ScheduledKind::PostCallFollowUp)
                    .await?;
                let mut lead = lead.clone();
                self.try_transition(&mut lead, LeadStatus::Nurturing, "call_cancelled", now)
                    .await?;
                store.set_next_review(lead.id, Some(now)).await?;
            }
        }

        let severity = match event.outcome {
            CallOutcome::Completed => Severity::Info,
            _ => Severity::Warning,
        };
        self.notify(
            NotificationCategory::CallOutcome,
            severity,
            &lead,
            format!("Call {}", event.outcome.as_str().replace('_', "-")),
        )
        .await;

        let lead = self.lead(lead.id).await?;
        Ok(EventOutcome::for_lead(&lead))
    }

    // ── Application ─────────────────────────────────────────────────

    pub async fn application(
        &self,
        event: ApplicationEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, Error> {
        let store = self.processor.store();
        let mut lead = self
            .resolve_lead(event.lead_id, event.email.as_deref(), event.phone.as_deref())
            .await?;

        let marker = event.event.as_str();
        let window = now - chrono_duration(self.processor.config().duplicate_window);
        if store
            .has_activity(lead.id, ActivityKind::ApplicationLink, Some(marker), Some(window))
            .await?
        {
            info!(lead_id = %lead.id, event = marker, "Duplicate application event ignored");
            return Ok(EventOutcome::duplicate(&lead));
        }
        store
            .append_activity(&Activity::new(lead.id, ActivityKind::ApplicationLink, marker, now))
            .await?;

        let outcome = match event.event {
            ApplicationEventKind::Started => {
                let moved = self
                    .try_transition(&mut lead, LeadStatus::ApplicationStarted, "application_started", now)
                    .await?;
                if moved || lead.status == LeadStatus::ApplicationStarted {
                    store.set_application_started(lead.id, now).await?;
                }
                moved
            }
            ApplicationEventKind::Completed => {
                if lead.status != LeadStatus::ApplicationStarted
                    && lead.status.can_transition_to(LeadStatus::ApplicationStarted)
                {
                    transition_lead(store.as_ref(), &mut lead, LeadStatus::ApplicationStarted, "application_completed", now)
                        .await?;
                    store.set_application_started(lead.id, now).await?;
                }
                let moved = self
                    .try_transition(&mut lead, LeadStatus::Converted, "application_completed", now)
                    .await?;
                if moved && let Some(crm) = &self.crm {
                    create_deal_in_background(Arc::clone(crm), lead.clone());
                }
                moved
            }
            ApplicationEventKind::Funded => {
                self.try_transition(&mut lead, LeadStatus::DealsWon, "loan_funded", now)
                    .await?
            }
        };

        if outcome {
            self.notify(
                NotificationCategory::Application,
                Severity::Info,
                &lead,
                format!("Application {marker}, now {}", lead.status),
            )
            .await;
        }
        let result = EventOutcome::for_lead(&lead);
        Ok(if outcome {
            result
        } else {
            result.with_note("transition_skipped")
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn lead(&self, id: Uuid) -> Result<Lead, Error> {
        self.processor
            .store()
            .get_lead(id)
            .await?
            .ok_or_else(|| LeadError::NotFound(id).into())
    }

    async fn resolve_lead(
        &self,
        lead_id: Option<Uuid>,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Lead, Error> {
        let store = self.processor.store();
        if let Some(id) = lead_id {
            return self.lead(id).await;
        }
        if let Some(email) = email
            && let Some(lead) = store.find_lead_by_email(email.trim()).await?
        {
            return Ok(lead);
        }
        if let Some(phone) = phone
            && let Some(lead) = store.find_lead_by_phone(phone.trim()).await?
        {
            return Ok(lead);
        }
        Err(LeadError::NotFound(Uuid::nil()).into())
    }

    /// Transition if the state machine allows it; otherwise log and leave the
    /// lead where it is. Returns whether the status changed.
    async fn try_transition(
        &self,
        lead: &mut Lead,
        target: LeadStatus,
        trigger: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        if lead.status == target {
            return Ok(false);
        }
        if !lead.status.can_transition_to(target) {
            warn!(lead_id = %lead.id, from = %lead.status, to = %target, trigger, "Transition not allowed, skipping");
            return Ok(false);
        }
        transition_lead(self.processor.store().as_ref(), lead, target, trigger, now).await?;
        Ok(true)
    }

    async fn notify(&self, category: NotificationCategory, severity: Severity, lead: &Lead, details: String) {
        let _ = self
            .processor
            .notifier()
            .notify(Notification::new(category, severity, &lead.name, Some(lead.id), details))
            .await;
    }
}

fn is_opt_out(body: &str) -> bool {
    let word = body.trim().trim_end_matches(['.', '!']).to_ascii_uppercase();
    OPT_OUT_KEYWORDS.contains(&word.as_str())
}

fn require_time(at: Option<DateTime<Utc>>) -> Result<DateTime<Utc>, Error> {
    at.ok_or_else(|| {
        LeadError::InvalidEvent("scheduled_at is required for created and rescheduled bookings".into())
            .into()
    })
}

fn unknown_booking(external_id: &str) -> Error {
    LeadError::UnknownBooking(external_id.to_string()).into()
}
