//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::{
    Activity, ActivityKind, Appointment, AppointmentStatus, Communication, Consent, Direction,
    Lead, LeadStatus, ReminderSlot, ScheduledKind, ScheduledMessage,
};

/// Backend-agnostic database trait covering leads and their logs.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a newly captured lead.
    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    /// Fetch a lead fresh from storage.
    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Look up a lead by phone number (inbound SMS routing).
    async fn find_lead_by_phone(&self, phone: &str) -> Result<Option<Lead>, DatabaseError>;

    /// Look up a lead by email address (booking webhooks).
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError>;

    /// Persist a status change.
    async fn update_lead_status(
        &self,
        id: Uuid,
        status: LeadStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Persist the consent flags.
    async fn update_lead_consent(
        &self,
        id: Uuid,
        consent: Consent,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Toggle the autonomous-management gates.
    async fn update_lead_gates(
        &self,
        id: Uuid,
        managed_by_autonomous: bool,
        agent_disabled: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Record an outbound contact: sets `last_contacted_at` and `next_review_at`.
    async fn record_contact(
        &self,
        id: Uuid,
        contacted_at: DateTime<Utc>,
        next_review_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Set `next_review_at` only. Contact timestamps and `updated_at` are
    /// left alone, so a lead that is only ever re-armed still goes stale.
    async fn set_next_review(
        &self,
        id: Uuid,
        next_review_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Set the application-started anchor.
    async fn set_application_started(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Set the call-completed anchor.
    async fn set_call_completed(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Leads that satisfy the due predicate at `now`.
    ///
    /// `contact_cutoff` is `now - GRACE`: leads contacted after it are skipped.
    async fn list_due_leads(
        &self,
        now: DateTime<Utc>,
        contact_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// Autonomously managed, non-terminal leads regardless of timing.
    async fn list_active_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    /// Non-terminal leads whose row has not changed since `cutoff`.
    async fn list_stale_leads(&self, cutoff: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads currently in `status`.
    async fn list_leads_by_status(&self, status: LeadStatus) -> Result<Vec<Lead>, DatabaseError>;

    // ── Communications ──────────────────────────────────────────────

    /// Append one entry to the communication log.
    async fn append_communication(&self, comm: &Communication) -> Result<(), DatabaseError>;

    /// The most recent `limit` communications, oldest first.
    async fn list_communications(
        &self,
        lead_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Communication>, DatabaseError>;

    /// Outbound communications at or after `since`, oldest first.
    async fn list_outbound_since(
        &self,
        lead_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Communication>, DatabaseError>;

    /// Count communications in a direction, optionally since a timestamp.
    async fn count_communications(
        &self,
        lead_id: Uuid,
        direction: Direction,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, DatabaseError>;

    /// Timestamp of the latest communication in a direction.
    async fn latest_communication_at(
        &self,
        lead_id: Uuid,
        direction: Direction,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    // ── Activities ──────────────────────────────────────────────────

    /// Append an audit note.
    async fn append_activity(&self, activity: &Activity) -> Result<(), DatabaseError>;

    /// All audit notes for a lead, oldest first.
    async fn list_activities(&self, lead_id: Uuid) -> Result<Vec<Activity>, DatabaseError>;

    /// Whether an activity of `kind` exists, optionally with an exact detail
    /// and/or at or after `since`.
    async fn has_activity(
        &self,
        lead_id: Uuid,
        kind: ActivityKind,
        detail: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    // ── Appointments ────────────────────────────────────────────────

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), DatabaseError>;

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>, DatabaseError>;

    async fn get_appointment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Appointment>, DatabaseError>;

    async fn list_appointments(&self, lead_id: Uuid) -> Result<Vec<Appointment>, DatabaseError>;

    async fn update_appointment_status(
        &self,
        id: Uuid,
        status: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Move an appointment and re-arm both reminders.
    async fn reschedule_appointment(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Scheduled appointments with `from <= scheduled_at < to`.
    async fn list_scheduled_appointments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, DatabaseError>;

    /// Atomically flip a reminder flag from unsent to sent.
    ///
    /// Returns `true` only for the caller that performed the flip.
    async fn claim_reminder(&self, id: Uuid, slot: ReminderSlot) -> Result<bool, DatabaseError>;

    /// Undo a claim after a failed send so a later pass can retry.
    async fn release_reminder(&self, id: Uuid, slot: ReminderSlot) -> Result<(), DatabaseError>;

    // ── Scheduled messages ──────────────────────────────────────────

    async fn insert_scheduled_message(&self, msg: &ScheduledMessage) -> Result<(), DatabaseError>;

    async fn list_scheduled_messages(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// Deferred messages whose `execute_at` has passed.
    async fn list_due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// Claim a deferred message by deleting it. `None` means another path
    /// (cancellation or a concurrent sweep) got there first.
    async fn claim_scheduled_message(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduledMessage>, DatabaseError>;

    /// Cancel one deferred message. Returns whether a row was removed.
    async fn cancel_scheduled_message(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Cancel every pending deferred message of `kind` for a lead.
    async fn cancel_scheduled_messages(
        &self,
        lead_id: Uuid,
        kind: ScheduledKind,
    ) -> Result<usize, DatabaseError>;

    // ── Scheduler checkpoints ───────────────────────────────────────

    async fn get_checkpoint(&self, name: &str) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    async fn set_checkpoint(&self, name: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;
}
