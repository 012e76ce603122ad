//! History context for a single lead, assembled fresh from the store.

use chrono::{DateTime, Duration, Utc};

use crate::cadence::CadenceInput;
use crate::error::DatabaseError;
use crate::leads::{Appointment, AppointmentStatus, Communication, Direction, Lead};
use crate::store::Database;

/// Everything the decision and guardrail steps need to know about a lead.
#[derive(Debug, Clone)]
pub struct LeadContext {
    pub lead: Lead,
    /// Most recent communications, oldest first.
    pub history: Vec<Communication>,
    /// Outbound messages inside the repetition lookback window.
    pub recent_outbound: Vec<Communication>,
    /// Scheduled appointments that have not started yet.
    pub upcoming_appointments: Vec<Appointment>,
    pub cadence: CadenceInput,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl LeadContext {
    pub async fn load(
        store: &dyn Database,
        lead: Lead,
        now: DateTime<Utc>,
        history_limit: usize,
        lookback: Duration,
    ) -> Result<Self, DatabaseError> {
        let id = lead.id;
        let history = store.list_communications(id, history_limit).await?;
        let recent_outbound = store.list_outbound_since(id, now - lookback).await?;
        let upcoming_appointments = store
            .list_appointments(id)
            .await?
            .into_iter()
            .filter(|a| a.status == AppointmentStatus::Scheduled && a.scheduled_at > now)
            .collect();

        let outbound_count = store
            .count_communications(id, Direction::Outbound, None)
            .await?;
        let outbound_last_24h = store
            .count_communications(id, Direction::Outbound, Some(now - Duration::hours(24)))
            .await?;
        let last_outbound_at = store.latest_communication_at(id, Direction::Outbound).await?;
        let last_inbound_at = store.latest_communication_at(id, Direction::Inbound).await?;

        let cadence = CadenceInput {
            created_at: lead.created_at,
            outbound_count,
            outbound_last_24h,
            last_outbound_at,
            has_replied: last_inbound_at.is_some(),
        };

        Ok(Self {
            lead,
            history,
            recent_outbound,
            upcoming_appointments,
            cadence,
            last_inbound_at,
            now,
        })
    }

    /// The latest inbound message, if nothing has gone out since it arrived.
    pub fn unanswered_reply(&self) -> Option<&Communication> {
        let inbound_at = self.last_inbound_at?;
        if self.cadence.last_outbound_at.is_some_and(|out| out >= inbound_at) {
            return None;
        }
        self.history
            .iter()
            .rev()
            .find(|c| c.direction == Direction::Inbound)
    }

    pub fn has_replied(&self) -> bool {
        self.cadence.has_replied
    }

    pub fn outbound_last_24h(&self) -> i64 {
        self.cadence.outbound_last_24h
    }

    pub fn age_days(&self) -> i64 {
        self.lead.age_days(self.now)
    }

    /// Convert an instant to the lead's local wall clock.
    pub fn local_time(&self, at: DateTime<Utc>) -> chrono::NaiveDateTime {
        (at + Duration::minutes(self.lead.utc_offset_minutes as i64)).naive_utc()
    }
}
