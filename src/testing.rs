//! In-process stand-ins for the external collaborators, shared by unit and
//! integration tests: a scripted decision service, recording gateways, a
//! collecting notification sink, a recording CRM and a wired-up harness on
//! an in-memory database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::{Decision, DecisionService, LeadContext, LeadProcessor};
use crate::cadence::CadenceTable;
use crate::channels::notify::{Notification, NotificationCategory, NotificationSink};
use crate::channels::{EmailGateway, Gateways, SendReceipt, SmsGateway};
use crate::config::{CadenceConfig, EngineConfig, GuardrailConfig};
use crate::crm::CrmClient;
use crate::error::{DecisionError, GatewayError, LlmError};
use crate::leads::{ChannelKind, Lead};
use crate::safety::GuardrailValidator;
use crate::store::LibSqlBackend;
use crate::webhooks::{AppState, EventHandler};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Decision service ────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Script {
    Send(ChannelKind, String),
    Wait(Option<f64>),
    Escalate,
    Fail,
}

/// Returns the same scripted decision on every call.
pub struct StubDecision {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_trigger: Mutex<Option<String>>,
}

impl StubDecision {
    fn scripted(script: Script) -> Self {
        Self {
            script,
            delay: None,
            calls: AtomicUsize::new(0),
            last_trigger: Mutex::new(None),
        }
    }

    pub fn send(channel: ChannelKind, content: &str) -> Self {
        Self::scripted(Script::Send(channel, content.to_string()))
    }

    pub fn wait(hours: Option<f64>) -> Self {
        Self::scripted(Script::Wait(hours))
    }

    pub fn escalate() -> Self {
        Self::scripted(Script::Escalate)
    }

    pub fn fail() -> Self {
        Self::scripted(Script::Fail)
    }

    /// Sleep before answering, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_trigger(&self) -> Option<String> {
        lock(&self.last_trigger).clone()
    }
}

#[async_trait]
impl DecisionService for StubDecision {
    async fn decide(
        &self,
        _ctx: &LeadContext,
        trigger_message: Option<&str>,
    ) -> Result<Decision, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_trigger) = trigger_message.map(str::to_string);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            Script::Send(channel, content) => Ok(Decision::send(*channel, content.clone())),
            Script::Wait(hours) => Ok(Decision::wait(*hours, "stub wait")),
            Script::Escalate => Ok(Decision::escalate("stub escalation")),
            Script::Fail => Err(DecisionError::Llm(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "scripted failure".into(),
            })),
        }
    }
}

// ── Gateways ────────────────────────────────────────────────────────

/// Records every SMS. `fail_next` makes the next N sends fail.
#[derive(Default)]
pub struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
    failures: AtomicUsize,
}

impl RecordingSms {
    /// `(to, body)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SmsGateway for RecordingSms {
    async fn send_sms(&self, to: &str, body: &str) -> Result<SendReceipt, GatewayError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GatewayError::SendFailed {
                name: "sms".into(),
                reason: "scripted failure".into(),
            });
        }
        let mut sent = lock(&self.sent);
        sent.push((to.to_string(), body.to_string()));
        Ok(SendReceipt {
            id: format!("SM{}", sent.len()),
            status: "queued".into(),
        })
    }
}

#[derive(Default)]
pub struct RecordingEmail {
    sent: Mutex<Vec<(String, Option<String>, String)>>,
}

impl RecordingEmail {
    /// `(to, subject, text)` triples in send order.
    pub fn sent(&self) -> Vec<(String, Option<String>, String)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl EmailGateway for RecordingEmail {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<SendReceipt, GatewayError> {
        let mut sent = lock(&self.sent);
        sent.push((
            to.to_string(),
            Some(subject.to_string()),
            text.unwrap_or(html).to_string(),
        ));
        Ok(SendReceipt {
            id: format!("<{}@test>", sent.len()),
            status: "sent".into(),
        })
    }
}

// ── Notification sink ───────────────────────────────────────────────

#[derive(Default)]
pub struct CollectingSink {
    seen: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.seen).clone()
    }

    pub fn categories(&self) -> Vec<NotificationCategory> {
        lock(&self.seen).iter().map(|n| n.category).collect()
    }
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn notify(&self, notification: Notification) -> Result<(), GatewayError> {
        lock(&self.seen).push(notification);
        Ok(())
    }
}

// ── CRM ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingCrm {
    deals: Mutex<Vec<Uuid>>,
}

impl RecordingCrm {
    pub fn deals(&self) -> Vec<Uuid> {
        lock(&self.deals).clone()
    }
}

#[async_trait]
impl CrmClient for RecordingCrm {
    async fn create_deal(&self, lead: &Lead) -> Result<(), GatewayError> {
        lock(&self.deals).push(lead.id);
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// A fully wired service on an in-memory database with default policy.
pub struct Harness {
    pub store: Arc<LibSqlBackend>,
    pub processor: Arc<LeadProcessor>,
    pub events: Arc<EventHandler>,
    pub decision: Arc<StubDecision>,
    pub sms: Arc<RecordingSms>,
    pub email: Arc<RecordingEmail>,
    pub sink: Arc<CollectingSink>,
    pub crm: Arc<RecordingCrm>,
}

impl Harness {
    pub async fn new(decision: StubDecision) -> Self {
        Self::with_config(decision, CadenceConfig::default(), EngineConfig::default()).await
    }

    pub async fn with_config(
        decision: StubDecision,
        cadence: CadenceConfig,
        engine: EngineConfig,
    ) -> Self {
        let store = Arc::new(
            LibSqlBackend::new_memory()
                .await
                .expect("in-memory database should open"),
        );
        let decision = Arc::new(decision);
        let sms = Arc::new(RecordingSms::default());
        let email = Arc::new(RecordingEmail::default());
        let sink = Arc::new(CollectingSink::default());
        let crm = Arc::new(RecordingCrm::default());

        let gateways = Gateways::default()
            .with_sms(sms.clone())
            .with_email(email.clone());
        let processor = Arc::new(LeadProcessor::new(
            store.clone(),
            decision.clone(),
            gateways,
            GuardrailValidator::new(GuardrailConfig::default()),
            sink.clone(),
            CadenceTable::new(cadence),
            engine,
        ));
        let events = Arc::new(EventHandler::new(processor.clone()).with_crm(crm.clone()));

        Self {
            store,
            processor,
            events,
            decision,
            sms,
            email,
            sink,
            crm,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            processor: self.processor.clone(),
            events: self.events.clone(),
        }
    }
}
