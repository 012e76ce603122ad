//! Lead pipeline state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LeadError;

use super::model::Lead;

/// Pipeline status of a lead.
///
/// The graph is not a line: `CALL_SCHEDULED` can fall back to `NURTURING`
/// (cancellation) or `ENGAGED` (no-show), and most states can end in `LOST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Contacted,
    Engaged,
    Nurturing,
    CallScheduled,
    CallCompleted,
    ApplicationStarted,
    Converted,
    DealsWon,
    Lost,
}

impl LeadStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: LeadStatus) -> bool {
        use LeadStatus::*;

        if target == Lost {
            return !matches!(self, Lost | Converted | DealsWon);
        }

        matches!(
            (self, target),
            (New, Contacted) | (New, Engaged) | (New, CallScheduled) |
            (Contacted, Engaged) | (Contacted, CallScheduled) | (Contacted, Nurturing) |
            (Engaged, CallScheduled) | (Engaged, Nurturing) | (Engaged, ApplicationStarted) |
            (Nurturing, Engaged) | (Nurturing, CallScheduled) |
            (CallScheduled, CallCompleted) | (CallScheduled, Nurturing) |
            (CallScheduled, Engaged) |
            // A no-show correction can land after the call was auto-completed.
            (CallCompleted, Engaged) | (CallCompleted, Nurturing) |
            (CallCompleted, CallScheduled) | (CallCompleted, ApplicationStarted) |
            (ApplicationStarted, Converted) |
            (Converted, DealsWon)
        )
    }

    /// Terminal statuses are permanently excluded from scheduling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Lost | Self::Converted | Self::DealsWon)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Contacted => "CONTACTED",
            Self::Engaged => "ENGAGED",
            Self::Nurturing => "NURTURING",
            Self::CallScheduled => "CALL_SCHEDULED",
            Self::CallCompleted => "CALL_COMPLETED",
            Self::ApplicationStarted => "APPLICATION_STARTED",
            Self::Converted => "CONVERTED",
            Self::DealsWon => "DEALS_WON",
            Self::Lost => "LOST",
        }
    }

    /// All statuses that are excluded from scheduling.
    pub fn terminal_set() -> [LeadStatus; 3] {
        [Self::Lost, Self::Converted, Self::DealsWon]
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => Self::New,
            "CONTACTED" => Self::Contacted,
            "ENGAGED" => Self::Engaged,
            "NURTURING" => Self::Nurturing,
            "CALL_SCHEDULED" => Self::CallScheduled,
            "CALL_COMPLETED" => Self::CallCompleted,
            "APPLICATION_STARTED" => Self::ApplicationStarted,
            "CONVERTED" => Self::Converted,
            "DEALS_WON" => Self::DealsWon,
            "LOST" => Self::Lost,
            other => return Err(format!("unknown lead status: {other}")),
        })
    }
}

/// A status transition, destined for the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: LeadStatus,
    pub to: LeadStatus,
    pub timestamp: DateTime<Utc>,
    /// What caused the transition (e.g. `inbound_reply`, `no_show`).
    pub trigger: String,
}

impl StatusTransition {
    /// Human-readable detail for the activity note.
    pub fn describe(&self) -> String {
        format!("{} -> {} ({})", self.from, self.to, self.trigger)
    }
}

impl Lead {
    /// Move the lead to a new status.
    ///
    /// Returns `Ok(None)` when the lead is already in `target`.
    pub fn transition_to(
        &mut self,
        target: LeadStatus,
        trigger: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, LeadError> {
        if self.status == target {
            return Ok(None);
        }
        if !self.status.can_transition_to(target) {
            return Err(LeadError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        let transition = StatusTransition {
            from: self.status,
            to: target,
            timestamp: now,
            trigger: trigger.to_string(),
        };
        self.status = target;
        self.updated_at = now;
        if target.is_terminal() {
            self.next_review_at = None;
        }
        Ok(Some(transition))
    }
}
