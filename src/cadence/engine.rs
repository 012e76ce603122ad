//! Periodic cadence engine.
//!
//! One pass selects every due lead, processes them with bounded
//! concurrency, then runs the secondary sweeps. A failing sweep is logged
//! and does not stop the others.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::agent::{LeadProcessor, Trigger};
use crate::cadence::sweeps;
use crate::config::chrono_duration;
use crate::error::{ConfigError, DatabaseError};

/// Counts from one engine pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub due: usize,
    pub acted: usize,
    pub reminders: usize,
    pub calls_completed: usize,
    pub deferred: usize,
    pub nudges: usize,
    pub milestones: usize,
    pub stale_alerts: usize,
    /// Sweeps that failed to run this pass.
    pub failed_sweeps: Vec<&'static str>,
}

pub struct CadenceEngine {
    processor: Arc<LeadProcessor>,
    stale_schedule: cron::Schedule,
}

impl CadenceEngine {
    pub fn new(processor: Arc<LeadProcessor>) -> Result<Self, ConfigError> {
        let stale_schedule = sweeps::parse_schedule(&processor.config().stale_alert_schedule)?;
        Ok(Self {
            processor,
            stale_schedule,
        })
    }

    pub fn processor(&self) -> &Arc<LeadProcessor> {
        &self.processor
    }

    /// Run one full pass as of `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();

        match self.sweep_due(now).await {
            Ok((due, acted)) => {
                report.due = due;
                report.acted = acted;
            }
            Err(e) => {
                error!(error = %e, "Due-lead sweep failed");
                report.failed_sweeps.push("due");
            }
        }

        let p = self.processor.as_ref();
        report.reminders = isolate(&mut report.failed_sweeps, "reminders", sweeps::reminder_sweep(p, now).await);
        report.calls_completed = isolate(&mut report.failed_sweeps, "post_call", sweeps::post_call_sweep(p, now).await);
        report.deferred = isolate(&mut report.failed_sweeps, "deferred", sweeps::deferred_sweep(p, now).await);
        report.nudges = isolate(&mut report.failed_sweeps, "nudges", sweeps::nudge_sweep(p, now).await);
        report.milestones = isolate(&mut report.failed_sweeps, "milestones", sweeps::milestone_sweep(p, now).await);
        report.stale_alerts = isolate(
            &mut report.failed_sweeps,
            "stale_alert",
            sweeps::stale_alert_sweep(p, &self.stale_schedule, now).await,
        );

        if report.due > 0 || report.reminders + report.deferred + report.nudges > 0 {
            info!(
                due = report.due,
                acted = report.acted,
                reminders = report.reminders,
                calls_completed = report.calls_completed,
                deferred = report.deferred,
                nudges = report.nudges,
                milestones = report.milestones,
                "Cadence pass complete"
            );
        } else {
            debug!("Cadence pass complete, nothing due");
        }
        report
    }

    /// Process every due lead. Returns `(due, acted)`.
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<(usize, usize), DatabaseError> {
        let grace = chrono_duration(self.processor.cadence().config().grace);
        let leads = self
            .processor
            .store()
            .list_due_leads(now, now - grace)
            .await?;

        let mut seen = HashSet::new();
        let ids: Vec<_> = leads
            .into_iter()
            .map(|l| l.id)
            .filter(|id| seen.insert(*id))
            .collect();
        let due = ids.len();

        let max_concurrent = self.processor.config().max_concurrent.max(1);
        let acted = futures::stream::iter(ids)
            .map(|id| {
                let processor = Arc::clone(&self.processor);
                async move { processor.process_at(id, Trigger::Sweep, now).await }
            })
            .buffer_unordered(max_concurrent)
            .filter(|outcome| futures::future::ready(outcome.acted))
            .count()
            .await;

        Ok((due, acted))
    }
}

fn isolate(failed: &mut Vec<&'static str>, name: &'static str, result: Result<usize, DatabaseError>) -> usize {
    match result {
        Ok(n) => n,
        Err(e) => {
            error!(sweep = name, error = %e, "Sweep failed");
            failed.push(name);
            0
        }
    }
}

/// Spawn the periodic pass. The first pass runs one interval after start.
pub fn spawn_ticker(engine: Arc<CadenceEngine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            engine.run_pass(Utc::now()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use crate::leads::{ChannelKind, Consent, Lead, LeadStatus};
    use crate::store::Database;
    use crate::testing::{Harness, StubDecision};

    #[tokio::test]
    async fn pass_processes_due_leads_once() {
        let h = Harness::new(StubDecision::send(ChannelKind::Sms, "Hi, this is Ava from the mortgage team.")).await;
        let now = Utc::now();
        for i in 0..5 {
            let lead = Lead::new(format!("Lead {i}"), now - ChronoDuration::minutes(5))
                .with_phone(format!("+1555017{i}"))
                .with_consent(Consent::all());
            h.store.insert_lead(&lead).await.unwrap();
        }
        let mut future = Lead::new("Later", now).with_phone("+15550179").with_consent(Consent::all());
        future.next_review_at = Some(now + ChronoDuration::hours(2));
        h.store.insert_lead(&future).await.unwrap();

        let engine = CadenceEngine::new(h.processor.clone()).unwrap();
        let report = engine.run_pass(now).await;
        assert_eq!(report.due, 5);
        assert_eq!(report.acted, 5);
        assert!(report.failed_sweeps.is_empty());
        assert_eq!(h.sms.sent().len(), 5);

        // Everyone was just contacted, so nothing is due a moment later.
        let report = engine.run_pass(now + ChronoDuration::minutes(1)).await;
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn old_silent_lead_is_archived() {
        let h = Harness::new(StubDecision::send(ChannelKind::Sms, "unused")).await;
        let now = Utc::now();
        let lead = Lead::new("Gone Quiet", now - ChronoDuration::days(65))
            .with_phone("+15550180")
            .with_consent(Consent::all());
        h.store.insert_lead(&lead).await.unwrap();

        let engine = CadenceEngine::new(h.processor.clone()).unwrap();
        engine.run_pass(now).await;
        let stored = h.store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Lost);
        assert!(stored.next_review_at.is_none());
        assert!(h.sms.sent().is_empty());
    }
}
