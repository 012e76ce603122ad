//! Per-lead processing: the one path every trigger goes through.
//!
//! Flow:
//! 1. In-flight guard (one pass per lead at a time in this process)
//! 2. Re-fetch and eligibility
//! 3. Debounce against the last outbound
//! 4. Cadence gating (sweep triggers only)
//! 5. Decision service, unless the trigger carries a prepared message
//! 6. Guardrail validation
//! 7. Gateway send, then persist the communication and the next review
//!
//! `process` never returns an error. Failures at the decision, send or
//! persist stage notify the operator and re-arm the lead for a retry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::context::LeadContext;
use crate::agent::decision::{DecisionAction, DecisionService};
use crate::cadence::{ActionClass, CadenceTable};
use crate::channels::notify::{Notification, NotificationCategory, NotificationSink, Severity};
use crate::channels::{Gateways, OutboundMessage};
use crate::config::{EngineConfig, chrono_duration};
use crate::error::{DatabaseError, DecisionError, Error, ProcessError, ProcessStage};
use crate::leads::{
    Activity, ActivityKind, ChannelKind, Communication, Direction, Lead, LeadStatus,
};
use crate::safety::GuardrailValidator;
use crate::store::Database;

/// What started a processing pass.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Periodic cadence sweep. Subject to `next_review_at` and the cadence table.
    Sweep,
    /// Operator request through the admin API.
    Manual,
    /// The lead just replied.
    InboundReply { message: String },
    /// A reminder, nudge, confirmation or deferred message whose content is
    /// already known.
    Prepared(PreparedAction),
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sweep => "sweep",
            Self::Manual => "manual",
            Self::InboundReply { .. } => "inbound_reply",
            Self::Prepared(p) => p.kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparedKind {
    Reminder,
    Nudge,
    Deferred,
    Confirmation,
}

impl PreparedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::Nudge => "nudge",
            Self::Deferred => "deferred",
            Self::Confirmation => "confirmation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedAction {
    pub kind: PreparedKind,
    pub channel: ChannelKind,
    pub subject: Option<String>,
    pub content: String,
}

impl PreparedAction {
    pub fn new(kind: PreparedKind, channel: ChannelKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            channel,
            subject: None,
            content: content.into(),
        }
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    fn outbound(&self) -> OutboundMessage {
        let mut msg = OutboundMessage::new(self.channel, self.content.clone());
        msg.subject = self.subject.clone();
        msg
    }
}

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub acted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProcessOutcome {
    pub fn acted(action: impl Into<String>) -> Self {
        Self {
            acted: true,
            action: Some(action.into()),
            reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            acted: false,
            action: None,
            reason: Some(reason.into()),
        }
    }

    fn waited(action: &str, reason: impl Into<String>) -> Self {
        Self {
            acted: false,
            action: Some(action.to_string()),
            reason: Some(reason.into()),
        }
    }
}

/// Marks lead ids with a pass in progress. Released on drop.
#[derive(Default)]
struct InFlight {
    leads: Mutex<HashSet<Uuid>>,
}

struct InFlightGuard<'a> {
    set: &'a InFlight,
    id: Uuid,
}

impl InFlight {
    fn try_acquire(&self, id: Uuid) -> Option<InFlightGuard<'_>> {
        let mut leads = self.leads.lock().unwrap_or_else(|e| e.into_inner());
        // Lazily: a guard built for a rejected id would unlock the holder's id on drop.
        if leads.insert(id) {
            Some(InFlightGuard { set: self, id })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut leads = self.set.leads.lock().unwrap_or_else(|e| e.into_inner());
        leads.remove(&self.id);
    }
}

pub struct LeadProcessor {
    store: Arc<dyn Database>,
    decision: Arc<dyn DecisionService>,
    gateways: Gateways,
    guardrail: GuardrailValidator,
    notifier: Arc<dyn NotificationSink>,
    cadence: CadenceTable,
    config: EngineConfig,
    in_flight: InFlight,
}

impl LeadProcessor {
    pub fn new(
        store: Arc<dyn Database>,
        decision: Arc<dyn DecisionService>,
        gateways: Gateways,
        guardrail: GuardrailValidator,
        notifier: Arc<dyn NotificationSink>,
        cadence: CadenceTable,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            decision,
            gateways,
            guardrail,
            notifier,
            cadence,
            config,
            in_flight: InFlight::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.notifier
    }

    pub fn cadence(&self) -> &CadenceTable {
        &self.cadence
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn process(&self, lead_id: Uuid, trigger: Trigger) -> ProcessOutcome {
        self.process_at(lead_id, trigger, Utc::now()).await
    }

    /// Process a lead as of `now`.
    pub async fn process_at(
        &self,
        lead_id: Uuid,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> ProcessOutcome {
        let Some(_guard) = self.in_flight.try_acquire(lead_id) else {
            debug!(%lead_id, trigger = trigger.as_str(), "Lead already in flight");
            return ProcessOutcome::skipped("in_flight");
        };

        let inbound_before = self.latest_inbound(lead_id).await;
        let outcome = match self.run(lead_id, &trigger, now).await {
            Ok(outcome) => {
                debug!(
                    %lead_id,
                    trigger = trigger.as_str(),
                    acted = outcome.acted,
                    action = outcome.action.as_deref().unwrap_or("-"),
                    reason = outcome.reason.as_deref().unwrap_or("-"),
                    "Lead processed"
                );
                outcome
            }
            Err(e) => self.handle_failure(lead_id, &trigger, e, now).await,
        };

        // A reply that landed while this pass held the lead was not seen by it.
        if let Some(inbound) = self.latest_inbound(lead_id).await
            && inbound_before.is_none_or(|before| inbound > before)
        {
            let answered = matches!(
                self.store.latest_communication_at(lead_id, Direction::Outbound).await,
                Ok(Some(out)) if out >= inbound
            );
            if !answered && let Err(e) = self.requeue_reply(lead_id, now).await {
                warn!(%lead_id, error = %e, "Could not re-queue reply received mid-pass");
            }
        }
        outcome
    }

    async fn latest_inbound(&self, lead_id: Uuid) -> Option<DateTime<Utc>> {
        self.store
            .latest_communication_at(lead_id, Direction::Inbound)
            .await
            .ok()
            .flatten()
    }

    /// Bring the next review forward to `now + grace` so the next sweep
    /// answers a reply that could not be processed immediately.
    pub async fn requeue_reply(&self, lead_id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let target = now + chrono_duration(self.cadence.config().grace);
        let Some(lead) = self.store.get_lead(lead_id).await? else {
            return Ok(());
        };
        if !lead.is_schedulable() || lead.next_review_at.is_some_and(|at| at <= target) {
            return Ok(());
        }
        self.store.set_next_review(lead_id, Some(target)).await?;
        debug!(%lead_id, %target, "Reply re-queued for the next sweep");
        Ok(())
    }

    async fn run(
        &self,
        lead_id: Uuid,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let stage = |stage: ProcessStage| move |e: DatabaseError| ProcessError::new(lead_id, stage, e);

        let Some(mut lead) = self
            .store
            .get_lead(lead_id)
            .await
            .map_err(stage(ProcessStage::Fetch))?
        else {
            return Ok(ProcessOutcome::skipped("not_found"));
        };

        if !lead.is_schedulable() {
            return Ok(ProcessOutcome::skipped("ineligible"));
        }
        if matches!(trigger, Trigger::Sweep) && lead.next_review_at.is_some_and(|t| t > now) {
            return Ok(ProcessOutcome::skipped("not_due"));
        }

        let lookback = chrono_duration(self.guardrail.config().repetition_lookback);
        let ctx = LeadContext::load(
            self.store.as_ref(),
            lead.clone(),
            now,
            self.config.history_limit,
            lookback,
        )
        .await
        .map_err(stage(ProcessStage::Context))?;

        if let Some(outcome) = self.debounce(&ctx, trigger, now).await? {
            return Ok(outcome);
        }

        let pending_reply = match trigger {
            Trigger::Sweep | Trigger::Manual => ctx.unanswered_reply().map(|c| c.content.clone()),
            _ => None,
        };

        // An unanswered reply is worked now, whatever the cadence slot says.
        if matches!(trigger, Trigger::Sweep) && pending_reply.is_none() {
            let gate = self.cadence.evaluate(&ctx.cadence, now);
            match gate.action {
                ActionClass::Archive => return self.archive(&mut lead, now).await,
                ActionClass::Wait => {
                    let at = gate.next_review_at.unwrap_or_else(|| self.cadence.rearm(now));
                    self.reschedule(
                        lead_id,
                        at,
                        ActivityKind::DecisionWait,
                        format!("cadence {}: next touch due", gate.phase.as_str()),
                        now,
                    )
                    .await?;
                    return Ok(ProcessOutcome::waited("wait", "cadence"));
                }
                _ => {}
            }
        }

        let proposed = match trigger {
            Trigger::Prepared(prepared) => prepared.outbound(),
            Trigger::InboundReply { message } => match self.decide(&ctx, Some(message.as_str())).await? {
                Decided::Send(msg) => msg,
                Decided::Done(outcome) => return Ok(outcome),
            },
            Trigger::Sweep | Trigger::Manual => match self.decide(&ctx, pending_reply.as_deref()).await? {
                Decided::Send(msg) => msg,
                Decided::Done(outcome) => return Ok(outcome),
            },
        };

        let validation = self.guardrail.validate(&proposed, &ctx);
        for warning in &validation.warnings {
            warn!(%lead_id, channel = %proposed.channel, warning = %warning, "Guardrail warning");
        }
        if !validation.valid {
            let summary = validation.summary();
            info!(%lead_id, channel = %proposed.channel, errors = %summary, "Guardrail rejected message");
            let retry = now + chrono_duration(self.cadence.config().retry_delay);
            self.reschedule(lead_id, retry, ActivityKind::GuardrailRejected, summary, now)
                .await?;
            return Ok(ProcessOutcome::waited("rejected", "guardrail_rejected"));
        }

        let receipt = self
            .gateways
            .send(&lead, &proposed, self.config.gateway_timeout)
            .await
            .map_err(|e| ProcessError::new(lead_id, ProcessStage::Send, e))?;

        self.persist_send(&mut lead, &ctx, trigger, &proposed, receipt, now)
            .await?;

        Ok(ProcessOutcome::acted(format!("sent_{}", proposed.channel)))
    }

    /// A lead contacted within the grace window is left alone, unless it has
    /// replied since.
    async fn debounce(
        &self,
        ctx: &LeadContext,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessOutcome>, ProcessError> {
        let grace = chrono_duration(self.cadence.config().grace);
        let Some(last_out) = ctx.cadence.last_outbound_at else {
            return Ok(None);
        };
        if now - last_out >= grace {
            return Ok(None);
        }
        if ctx.last_inbound_at.is_some_and(|inbound| inbound > last_out) {
            return Ok(None);
        }

        self.store
            .append_activity(&Activity::new(
                ctx.lead.id,
                ActivityKind::DuplicateSuppressed,
                format!("{} trigger within grace window", trigger.as_str()),
                now,
            ))
            .await
            .map_err(|e| ProcessError::new(ctx.lead.id, ProcessStage::Persist, e))?;
        Ok(Some(ProcessOutcome::skipped("duplicate_suppressed")))
    }

    async fn decide(
        &self,
        ctx: &LeadContext,
        trigger_message: Option<&str>,
    ) -> Result<Decided, ProcessError> {
        let lead_id = ctx.lead.id;
        let decision = tokio::time::timeout(
            self.config.decision_timeout,
            self.decision.decide(ctx, trigger_message),
        )
        .await
        .map_err(|_| DecisionError::Timeout(self.config.decision_timeout))
        .and_then(|r| r)
        .map_err(|e| ProcessError::new(lead_id, ProcessStage::Decision, e))?;

        match decision.action {
            DecisionAction::Send => decision
                .outbound()
                .map(Decided::Send)
                .ok_or_else(|| ProcessError::new(lead_id, ProcessStage::Decision, "send without channel")),
            DecisionAction::Wait => {
                let max = chrono_duration(self.config.decision_wait_max);
                let requested = decision
                    .wait_hours
                    .and_then(|h| Duration::try_minutes((h * 60.0).round() as i64))
                    .map(|d| d.min(max))
                    .unwrap_or_else(|| chrono_duration(self.config.decision_wait_default).min(max));
                let at = now_plus_at_least(
                    ctx.now,
                    requested,
                    chrono_duration(self.cadence.config().min_reschedule),
                )
                .ok_or_else(|| ProcessError::new(lead_id, ProcessStage::Decision, "wait out of range"))?;
                let reason = decision.reason.unwrap_or_else(|| "decision: wait".into());
                self.reschedule(lead_id, at, ActivityKind::DecisionWait, reason.clone(), ctx.now)
                    .await?;
                Ok(Decided::Done(ProcessOutcome::waited("wait", reason)))
            }
            DecisionAction::Escalate => {
                let reason = decision.reason.unwrap_or_else(|| "escalation requested".into());
                let _ = self
                    .notifier
                    .notify(Notification::new(
                        NotificationCategory::Escalation,
                        Severity::Warning,
                        &ctx.lead.name,
                        Some(lead_id),
                        reason.clone(),
                    ))
                    .await;
                let at = now_plus_at_least(
                    ctx.now,
                    chrono_duration(self.config.decision_wait_default),
                    chrono_duration(self.cadence.config().min_reschedule),
                )
                .ok_or_else(|| ProcessError::new(lead_id, ProcessStage::Decision, "wait out of range"))?;
                self.reschedule(lead_id, at, ActivityKind::Note, format!("escalated: {reason}"), ctx.now)
                    .await?;
                Ok(Decided::Done(ProcessOutcome::waited("escalate", reason)))
            }
        }
    }

    async fn persist_send(
        &self,
        lead: &mut Lead,
        ctx: &LeadContext,
        trigger: &Trigger,
        sent: &OutboundMessage,
        receipt: crate::channels::SendReceipt,
        now: DateTime<Utc>,
    ) -> Result<(), ProcessError> {
        let lead_id = lead.id;
        let persist = |e: Error| ProcessError::new(lead_id, ProcessStage::Persist, e);

        let comm = Communication::outbound(lead_id, sent.channel, sent.content.clone(), now)
            .with_provider(Some(receipt.id.clone()), Some(receipt.status.clone()))
            .with_metadata(serde_json::json!({
                "trigger": trigger.as_str(),
                "subject": sent.subject,
            }));
        self.store
            .append_communication(&comm)
            .await
            .map_err(|e| persist(e.into()))?;

        let next_review = self.cadence.next_review_after_send(&ctx.cadence, now);
        self.store
            .record_contact(lead_id, now, next_review)
            .await
            .map_err(|e| persist(e.into()))?;
        lead.last_contacted_at = Some(now);
        lead.next_review_at = Some(next_review);

        // Re-read: an inbound event may have moved the lead during the send.
        if lead.status == LeadStatus::New
            && let Some(mut current) = self
                .store
                .get_lead(lead_id)
                .await
                .map_err(|e| persist(e.into()))?
                .filter(|l| l.status == LeadStatus::New)
        {
            transition_lead(self.store.as_ref(), &mut current, LeadStatus::Contacted, "first_contact", now)
                .await
                .map_err(persist)?;
            lead.status = current.status;
        }

        info!(
            %lead_id,
            channel = %sent.channel,
            trigger = trigger.as_str(),
            provider_id = %receipt.id,
            next_review = %next_review,
            "Message sent"
        );
        Ok(())
    }

    /// Never-replied lead past its archive age: close it out.
    async fn archive(
        &self,
        lead: &mut Lead,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let lead_id = lead.id;
        transition_lead(self.store.as_ref(), lead, LeadStatus::Lost, "archive", now)
            .await
            .map_err(|e| ProcessError::new(lead_id, ProcessStage::Persist, e))?;

        let _ = self
            .notifier
            .notify(Notification::new(
                NotificationCategory::Archived,
                Severity::Info,
                &lead.name,
                Some(lead_id),
                format!(
                    "No reply after {} days; moved to LOST",
                    lead.age_days(now)
                ),
            ))
            .await;
        info!(%lead_id, "Lead archived");
        Ok(ProcessOutcome::acted("archive"))
    }

    async fn reschedule(
        &self,
        lead_id: Uuid,
        at: DateTime<Utc>,
        kind: ActivityKind,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ProcessError> {
        let persist = |e: DatabaseError| ProcessError::new(lead_id, ProcessStage::Persist, e);
        self.store
            .set_next_review(lead_id, Some(at))
            .await
            .map_err(persist)?;
        self.store
            .append_activity(&Activity::new(lead_id, kind, detail, now))
            .await
            .map_err(persist)?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        lead_id: Uuid,
        trigger: &Trigger,
        err: ProcessError,
        now: DateTime<Utc>,
    ) -> ProcessOutcome {
        error!(
            %lead_id,
            stage = %err.stage,
            trigger = trigger.as_str(),
            error = %err.reason,
            "Lead processing failed"
        );

        let lead_name = match self.store.get_lead(lead_id).await {
            Ok(Some(lead)) => lead.name,
            _ => lead_id.to_string(),
        };
        let severity = match err.stage {
            ProcessStage::Persist => Severity::Critical,
            _ => Severity::Warning,
        };
        let _ = self
            .notifier
            .notify(Notification::new(
                NotificationCategory::ProcessingFailure,
                severity,
                lead_name,
                Some(lead_id),
                format!("stage: {}\n{}", err.stage, err.reason),
            ))
            .await;

        let cfg = self.cadence.config();
        let jitter_secs = cfg.retry_jitter.as_secs();
        let jitter = if jitter_secs > 0 {
            rand::thread_rng().gen_range(0..=jitter_secs)
        } else {
            0
        };
        let retry_at = now + chrono_duration(cfg.retry_delay) + Duration::seconds(jitter as i64);

        if let Err(e) = self.store.set_next_review(lead_id, Some(retry_at)).await {
            warn!(%lead_id, error = %e, "Could not re-arm lead after failure");
        }
        if let Err(e) = self
            .store
            .append_activity(&Activity::new(
                lead_id,
                ActivityKind::ProcessingFailed,
                format!("{}: {}", err.stage, err.reason),
                now,
            ))
            .await
        {
            warn!(%lead_id, error = %e, "Could not record failure activity");
        }

        ProcessOutcome::skipped(format!("{}_failed", err.stage))
    }
}

enum Decided {
    Send(OutboundMessage),
    Done(ProcessOutcome),
}

fn now_plus_at_least(now: DateTime<Utc>, wanted: Duration, floor: Duration) -> Option<DateTime<Utc>> {
    now.checked_add_signed(wanted.max(floor))
}

/// Move a lead to `target`, persisting the status and a status-change note.
///
/// No-op when the lead is already in `target`.
pub async fn transition_lead(
    store: &dyn Database,
    lead: &mut Lead,
    target: LeadStatus,
    trigger: &str,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let Some(transition) = lead.transition_to(target, trigger, now)? else {
        return Ok(());
    };
    store.update_lead_status(lead.id, target, now).await?;
    store
        .append_activity(&Activity::new(
            lead.id,
            ActivityKind::StatusChange,
            transition.describe(),
            now,
        ))
        .await?;
    info!(lead_id = %lead.id, from = %transition.from, to = %transition.to, trigger, "Lead status changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    use crate::leads::Consent;
    use crate::testing::{Harness, StubDecision};

    fn lead(now: DateTime<Utc>) -> Lead {
        Lead::new("Riley", now)
            .with_phone("+15550150")
            .with_email("riley@example.com")
            .with_consent(Consent::all())
    }

    #[tokio::test]
    async fn first_touch_sends_and_marks_contacted() {
        let h = Harness::new(StubDecision::send(ChannelKind::Sms, "Hi Riley, thanks for reaching out!")).await;
        let now = Utc::now().trunc_subsecs(6);
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        let out = h.processor.process_at(l.id, Trigger::Sweep, now).await;
        assert!(out.acted, "{out:?}");
        assert_eq!(out.action.as_deref(), Some("sent_sms"));
        assert_eq!(h.sms.sent().len(), 1);

        let stored = h.store.get_lead(l.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Contacted);
        assert_eq!(stored.last_contacted_at, Some(now));
        assert!(stored.next_review_at.unwrap() > now);
    }

    #[tokio::test]
    async fn second_trigger_within_grace_is_suppressed() {
        let h = Harness::new(StubDecision::send(ChannelKind::Sms, "Hello there")).await;
        let now = Utc::now();
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        assert!(h.processor.process_at(l.id, Trigger::Manual, now).await.acted);
        let again = h
            .processor
            .process_at(l.id, Trigger::Manual, now + Duration::seconds(30))
            .await;
        assert_eq!(again.reason.as_deref(), Some("duplicate_suppressed"));
        assert_eq!(h.sms.sent().len(), 1);
        assert!(
            h.store
                .has_activity(l.id, ActivityKind::DuplicateSuppressed, None, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn decision_failure_rearms_and_notifies() {
        let h = Harness::new(StubDecision::fail()).await;
        let now = Utc::now().trunc_subsecs(6);
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        let out = h.processor.process_at(l.id, Trigger::Manual, now).await;
        assert!(!out.acted);
        assert_eq!(out.reason.as_deref(), Some("decision_failed"));

        let stored = h.store.get_lead(l.id).await.unwrap().unwrap();
        let retry = stored.next_review_at.unwrap();
        assert!(retry >= now + Duration::minutes(30));
        assert!(retry <= now + Duration::minutes(35));
        assert_eq!(h.sink.categories(), vec![NotificationCategory::ProcessingFailure]);
    }

    #[tokio::test]
    async fn decision_wait_reschedules_without_sending() {
        let h = Harness::new(StubDecision::wait(Some(6.0))).await;
        let now = Utc::now().trunc_subsecs(6);
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        let out = h.processor.process_at(l.id, Trigger::Manual, now).await;
        assert_eq!(out.action.as_deref(), Some("wait"));
        let stored = h.store.get_lead(l.id).await.unwrap().unwrap();
        assert_eq!(stored.next_review_at, Some(now + Duration::hours(6)));
        assert!(h.sms.sent().is_empty());
    }

    #[tokio::test]
    async fn ineligible_lead_has_no_side_effects() {
        let h = Harness::new(StubDecision::send(ChannelKind::Sms, "Hi")).await;
        let now = Utc::now();
        let mut l = lead(now);
        l.agent_disabled = true;
        h.store.insert_lead(&l).await.unwrap();

        let out = h.processor.process_at(l.id, Trigger::Manual, now).await;
        assert_eq!(out, ProcessOutcome::skipped("ineligible"));
        assert!(h.store.list_activities(l.id).await.unwrap().is_empty());
        assert_eq!(h.decision.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_trigger_for_busy_lead_returns_in_flight() {
        let decision = StubDecision::send(ChannelKind::Sms, "Hi Riley, checking in.")
            .with_delay(std::time::Duration::from_millis(300));
        let h = Harness::new(decision).await;
        let now = Utc::now();
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(3), async {
            let first = {
                let processor = Arc::clone(&h.processor);
                tokio::spawn(async move { processor.process_at(l.id, Trigger::Manual, now).await })
            };
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            let second = h.processor.process_at(l.id, Trigger::Manual, now).await;
            assert_eq!(second.reason.as_deref(), Some("in_flight"));

            let first = first.await.unwrap();
            assert!(first.acted, "{first:?}");
        })
        .await
        .expect("concurrent processing deadlocked");

        assert_eq!(h.sms.sent().len(), 1);
        // The rejected call must not have released the first holder's slot.
        let later = h
            .processor
            .process_at(l.id, Trigger::Manual, now + Duration::seconds(10))
            .await;
        assert_eq!(later.reason.as_deref(), Some("duplicate_suppressed"));
    }

    #[tokio::test]
    async fn huge_wait_request_is_clamped() {
        let h = Harness::new(StubDecision::wait(Some(1.0e10))).await;
        let now = Utc::now();
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        let out = h.processor.process_at(l.id, Trigger::Manual, now).await;
        assert_eq!(out.action.as_deref(), Some("wait"));

        let stored = h.store.get_lead(l.id).await.unwrap().unwrap();
        let at = stored.next_review_at.unwrap();
        assert!(at > now + Duration::days(29));
        assert!(at <= now + Duration::days(30) + Duration::seconds(1));
    }

    #[tokio::test]
    async fn sweep_respects_next_review() {
        let h = Harness::new(StubDecision::send(ChannelKind::Sms, "Hi")).await;
        let now = Utc::now();
        let mut l = lead(now);
        l.next_review_at = Some(now + Duration::hours(1));
        h.store.insert_lead(&l).await.unwrap();

        let out = h.processor.process_at(l.id, Trigger::Sweep, now).await;
        assert_eq!(out.reason.as_deref(), Some("not_due"));
    }

    #[tokio::test]
    async fn prepared_action_skips_decision() {
        let h = Harness::new(StubDecision::fail()).await;
        let now = Utc::now();
        let l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        let prepared = PreparedAction::new(
            PreparedKind::Reminder,
            ChannelKind::Email,
            "Reminder: your call with our loan officer is tomorrow.",
        )
        .with_subject(Some("Your call tomorrow".into()));
        let out = h
            .processor
            .process_at(l.id, Trigger::Prepared(prepared), now)
            .await;
        assert!(out.acted);
        assert_eq!(h.decision.calls(), 0);
        let sent = h.email.sent();
        assert_eq!(sent[0].1.as_deref(), Some("Your call tomorrow"));
    }

    #[tokio::test]
    async fn transition_lead_records_activity() {
        let h = Harness::new(StubDecision::fail()).await;
        let now = Utc::now();
        let mut l = lead(now);
        h.store.insert_lead(&l).await.unwrap();

        transition_lead(h.store.as_ref(), &mut l, LeadStatus::Engaged, "inbound_reply", now)
            .await
            .unwrap();
        transition_lead(h.store.as_ref(), &mut l, LeadStatus::Engaged, "inbound_reply", now)
            .await
            .unwrap();
        let acts = h.store.list_activities(l.id).await.unwrap();
        assert_eq!(acts.len(), 1);
        assert_eq!(acts[0].detail, "NEW -> ENGAGED (inbound_reply)");

        let err = transition_lead(h.store.as_ref(), &mut l, LeadStatus::DealsWon, "x", now).await;
        assert!(err.is_err());
    }
}
