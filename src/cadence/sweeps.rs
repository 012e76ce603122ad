//! Secondary sweeps run after the due-lead pass: appointment reminders,
//! post-call completion, deferred messages, nudges, milestones and the
//! stale-lead alert.
//!
//! Each sweep returns how many items it acted on. Per-item failures are
//! logged and skipped; only a failure to list candidates is returned.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::agent::{LeadProcessor, PreparedAction, PreparedKind, Trigger, transition_lead};
use crate::channels::notify::{Notification, NotificationCategory, Severity};
use crate::config::chrono_duration;
use crate::error::{ConfigError, DatabaseError, Error};
use crate::leads::{
    Activity, ActivityKind, Appointment, AppointmentStatus, ChannelKind, Direction, Lead,
    LeadStatus, ReminderSlot, ScheduledKind, ScheduledMessage,
};

/// Checkpoint name for the stale-lead alert.
pub const STALE_ALERT_CHECKPOINT: &str = "stale_lead_alert";

/// How far back the post-call sweep looks for appointments left `scheduled`.
const POST_CALL_LOOKBACK_DAYS: i64 = 30;

/// Preferred channel for system-prepared messages: SMS, then email.
pub fn preferred_channel(lead: &Lead) -> Option<ChannelKind> {
    [ChannelKind::Sms, ChannelKind::Email]
        .into_iter()
        .find(|c| lead.can_use(*c))
}

fn first_name(lead: &Lead) -> &str {
    lead.name.split_whitespace().next().unwrap_or(&lead.name)
}

// ── Appointment reminders ───────────────────────────────────────────

pub async fn reminder_sweep(
    processor: &LeadProcessor,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let cfg = processor.config();
    let hour = chrono_duration(cfg.reminder_hour_before);
    let day = chrono_duration(cfg.reminder_day_before);

    let mut sent = 0;
    for (slot, from, to) in [
        (ReminderSlot::HourBefore, now, now + hour),
        (ReminderSlot::DayBefore, now + hour, now + day),
    ] {
        let appointments = processor
            .store()
            .list_scheduled_appointments_between(from, to)
            .await?;
        for appt in appointments.into_iter().filter(|a| !a.reminder_sent(slot)) {
            match send_reminder(processor, &appt, slot, now).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(appointment_id = %appt.id, slot = slot.label(), error = %e, "Reminder failed")
                }
            }
        }
    }
    Ok(sent)
}

async fn send_reminder(
    processor: &LeadProcessor,
    appt: &Appointment,
    slot: ReminderSlot,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let store = processor.store();
    let Some(lead) = store.get_lead(appt.lead_id).await? else {
        return Ok(false);
    };
    let Some(channel) = preferred_channel(&lead) else {
        debug!(lead_id = %lead.id, "No usable channel for reminder");
        return Ok(false);
    };
    if !store.claim_reminder(appt.id, slot).await? {
        return Ok(false);
    }

    let local = (appt.scheduled_at + Duration::minutes(lead.utc_offset_minutes as i64)).naive_utc();
    let when = match slot {
        ReminderSlot::DayBefore => format!("tomorrow at {}", local.format("%-I:%M %p")),
        ReminderSlot::HourBefore => format!("in about an hour, at {}", local.format("%-I:%M %p")),
    };
    let content = format!(
        "Hi {}, a quick reminder that your call with our loan officer is {when}. Reply here if you need to reschedule.",
        first_name(&lead)
    );
    let prepared = PreparedAction::new(PreparedKind::Reminder, channel, content)
        .with_subject(Some("Reminder: your mortgage consultation".to_string()));

    let outcome = processor
        .process_at(lead.id, Trigger::Prepared(prepared), now)
        .await;
    if !outcome.acted {
        store.release_reminder(appt.id, slot).await?;
        return Ok(false);
    }
    store
        .append_activity(&Activity::new(
            lead.id,
            ActivityKind::Reminder,
            format!("{} reminder for appointment {}", slot.label(), appt.id),
            now,
        ))
        .await?;
    Ok(true)
}

// ── Post-call completion ────────────────────────────────────────────

/// Appointments still `scheduled` after their expected end are assumed held.
pub async fn post_call_sweep(
    processor: &LeadProcessor,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let ended_before = now - chrono_duration(processor.config().call_duration);
    let appointments = processor
        .store()
        .list_scheduled_appointments_between(
            ended_before - Duration::days(POST_CALL_LOOKBACK_DAYS),
            ended_before,
        )
        .await?;

    let mut completed = 0;
    for appt in appointments {
        match complete_call(processor, &appt, "call_auto_completed", now).await {
            Ok(()) => completed += 1,
            Err(e) => warn!(appointment_id = %appt.id, error = %e, "Auto-completion failed"),
        }
    }
    Ok(completed)
}

/// Mark a call held: appointment completed, lead to `CALL_COMPLETED`, and a
/// post-call follow-up queued unless one is already pending.
pub async fn complete_call(
    processor: &LeadProcessor,
    appt: &Appointment,
    trigger: &str,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let store = processor.store();
    store
        .update_appointment_status(appt.id, AppointmentStatus::Completed, now)
        .await?;

    let Some(mut lead) = store.get_lead(appt.lead_id).await? else {
        return Ok(());
    };
    if lead.status == LeadStatus::CallScheduled {
        transition_lead(store.as_ref(), &mut lead, LeadStatus::CallCompleted, trigger, now).await?;
    }
    if lead.status != LeadStatus::CallCompleted {
        return Ok(());
    }
    store.set_call_completed(lead.id, now).await?;

    let pending = store
        .list_scheduled_messages(lead.id)
        .await?
        .into_iter()
        .any(|m| m.kind == ScheduledKind::PostCallFollowUp);
    let Some(channel) = preferred_channel(&lead) else {
        return Ok(());
    };
    if !pending {
        let execute_at = (appt.scheduled_at + chrono_duration(processor.config().follow_up_delay)).max(now);
        let mut msg = ScheduledMessage::new(
            lead.id,
            ScheduledKind::PostCallFollowUp,
            channel,
            format!(
                "Thanks for taking the time to talk today, {}! The next step is your application. Any questions, just reply here.",
                first_name(&lead)
            ),
            execute_at,
            now,
        );
        msg.subject = Some("Thanks for speaking with us".to_string());
        store.insert_scheduled_message(&msg).await?;
        info!(lead_id = %lead.id, %execute_at, "Post-call follow-up queued");
    }
    Ok(())
}

// ── Deferred messages ───────────────────────────────────────────────

pub async fn deferred_sweep(
    processor: &LeadProcessor,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let store = processor.store();
    let due = store.list_due_scheduled_messages(now).await?;

    let mut sent = 0;
    for msg in due {
        // Deleting first makes the claim exclusive.
        let Some(msg) = store.claim_scheduled_message(msg.id).await? else {
            continue;
        };
        let prepared = PreparedAction::new(PreparedKind::Deferred, msg.channel, msg.content.clone())
            .with_subject(msg.subject.clone());
        let outcome = processor
            .process_at(msg.lead_id, Trigger::Prepared(prepared), now)
            .await;

        if outcome.acted {
            sent += 1;
            continue;
        }
        match outcome.reason.as_deref() {
            Some("in_flight") | Some("duplicate_suppressed") => {
                let retry = ScheduledMessage {
                    execute_at: now + chrono_duration(processor.cadence().config().grace),
                    ..msg
                };
                store.insert_scheduled_message(&retry).await?;
                debug!(lead_id = %retry.lead_id, "Deferred message pushed back");
            }
            reason => {
                info!(
                    lead_id = %msg.lead_id,
                    kind = msg.kind.as_str(),
                    reason = reason.unwrap_or("-"),
                    "Deferred message dropped"
                );
            }
        }
    }
    Ok(sent)
}

// ── Nudges ──────────────────────────────────────────────────────────

pub async fn nudge_sweep(
    processor: &LeadProcessor,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let store = processor.store();
    let cfg = processor.config();
    let mut sent = 0;

    for lead in store
        .list_leads_by_status(LeadStatus::ApplicationStarted)
        .await?
    {
        let Some(started) = lead.application_started_at else {
            continue;
        };
        let due = cfg
            .application_nudges
            .iter()
            .enumerate()
            .filter(|(_, offset)| started + chrono_duration(**offset) <= now)
            .max_by_key(|(_, offset)| **offset);
        let Some((idx, offset)) = due else {
            continue;
        };
        let marker = format!("application_{}h", offset.as_secs() / 3600);
        let content = if idx == 0 {
            format!(
                "Hi {}, just checking in on your loan application. Anything I can help with to get it finished?",
                first_name(&lead)
            )
        } else {
            format!(
                "{}, your application is nearly there. If a document or question is holding it up, reply and we can sort it out together.",
                first_name(&lead)
            )
        };
        if nudge(processor, &lead, &marker, content, now).await? {
            sent += 1;
        }
    }

    for lead in store.list_leads_by_status(LeadStatus::CallCompleted).await? {
        let Some(completed) = lead.call_completed_at else {
            continue;
        };
        if lead.application_started_at.is_some()
            || completed + chrono_duration(cfg.call_nudge_after) > now
        {
            continue;
        }
        let marker = format!("call_{}h", cfg.call_nudge_after.as_secs() / 3600);
        let content = format!(
            "Hi {}, great speaking with you the other day. Whenever you're ready, the application is the next step. Want me to resend the link?",
            first_name(&lead)
        );
        if nudge(processor, &lead, &marker, content, now).await? {
            sent += 1;
        }
    }

    Ok(sent)
}

/// Send one nudge unless it already went out or the lead heard from us recently.
async fn nudge(
    processor: &LeadProcessor,
    lead: &Lead,
    marker: &str,
    content: String,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let store = processor.store();
    if store
        .has_activity(lead.id, ActivityKind::Nudge, Some(marker), None)
        .await?
    {
        return Ok(false);
    }
    let quiet_since = now - chrono_duration(processor.config().nudge_quiet_window);
    if store
        .count_communications(lead.id, Direction::Outbound, Some(quiet_since))
        .await?
        > 0
    {
        return Ok(false);
    }
    let Some(channel) = preferred_channel(lead) else {
        return Ok(false);
    };

    let prepared = PreparedAction::new(PreparedKind::Nudge, channel, content)
        .with_subject(Some("Your home loan application".to_string()));
    let outcome = processor
        .process_at(lead.id, Trigger::Prepared(prepared), now)
        .await;
    if !outcome.acted {
        return Ok(false);
    }
    store
        .append_activity(&Activity::new(lead.id, ActivityKind::Nudge, marker, now))
        .await?;
    Ok(true)
}

// ── Milestones ──────────────────────────────────────────────────────

/// Notify once per lead for the milestone it is currently at. Milestones
/// passed while the service was down are not replayed.
pub async fn milestone_sweep(
    processor: &LeadProcessor,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let store = processor.store();
    let mut fired = 0;

    for lead in store.list_active_leads().await? {
        let age = lead.age_days(now);
        let Some(day) = processor.cadence().current_milestone(age) else {
            continue;
        };
        let marker = format!("day {day}");
        if store
            .has_activity(lead.id, ActivityKind::Milestone, Some(&marker), None)
            .await?
        {
            continue;
        }
        store
            .append_activity(&Activity::new(lead.id, ActivityKind::Milestone, &marker, now))
            .await?;
        let _ = processor
            .notifier()
            .notify(Notification::new(
                NotificationCategory::Milestone,
                Severity::Info,
                &lead.name,
                Some(lead.id),
                format!("Day {day} in pipeline, status {}", lead.status),
            ))
            .await;
        fired += 1;
    }
    Ok(fired)
}

// ── Stale-lead alert ────────────────────────────────────────────────

pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "stale_alert_schedule".to_string(),
        message: format!("invalid cron: {e}"),
    })
}

/// Alert on leads with no recorded change for a while. Runs at most once per
/// schedule occurrence, tracked by a persisted checkpoint.
pub async fn stale_alert_sweep(
    processor: &LeadProcessor,
    schedule: &cron::Schedule,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let store = processor.store();
    let cfg = processor.config();

    let Some(last) = store.get_checkpoint(STALE_ALERT_CHECKPOINT).await? else {
        // First run establishes the baseline.
        store.set_checkpoint(STALE_ALERT_CHECKPOINT, now).await?;
        return Ok(0);
    };
    let fire = schedule.after(&last).next().is_some_and(|at| at <= now);
    if !fire {
        return Ok(0);
    }
    store.set_checkpoint(STALE_ALERT_CHECKPOINT, now).await?;

    let stale = store
        .list_stale_leads(now - Duration::days(cfg.stale_warning_days))
        .await?;
    for lead in &stale {
        let idle = now.signed_duration_since(lead.updated_at).num_days();
        let severity = if idle >= cfg.stale_critical_days {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let _ = processor
            .notifier()
            .notify(Notification::new(
                NotificationCategory::StaleLead,
                severity,
                &lead.name,
                Some(lead.id),
                format!("No activity for {idle} days, status {}", lead.status),
            ))
            .await;
    }
    info!(count = stale.len(), "Stale-lead alert sent");
    Ok(stale.len())
}
