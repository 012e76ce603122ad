//! Integration tests for the HTTP surface.
//!
//! Each test spins up the Axum router on a random port over an in-memory
//! database and exercises the real REST and webhook contract with reqwest.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;

use lead_cadence::leads::{Appointment, ChannelKind, Consent, Lead, LeadStatus};
use lead_cadence::store::Database;
use lead_cadence::testing::{Harness, StubDecision};
use lead_cadence::webhooks;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the router on a random port, return (base url, harness).
async fn start_server(decision: StubDecision) -> (String, Harness) {
    let harness = Harness::new(decision).await;
    let app = webhooks::router(harness.app_state());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), harness)
}

fn greeting() -> StubDecision {
    StubDecision::send(ChannelKind::Sms, "Hi! Thanks for your interest in a home loan.")
}

#[tokio::test]
async fn health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let (base, _h) = start_server(greeting()).await;

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn capture_creates_then_returns_existing() {
    timeout(TEST_TIMEOUT, async {
        let (base, h) = start_server(greeting()).await;
        let client = reqwest::Client::new();
        let payload = json!({
            "name": "Jordan Lee",
            "phone": "+15550200",
            "email": "jordan@example.com",
            "loan_amount": "425000.00",
            "utc_offset_minutes": -300
        });

        let resp = client
            .post(format!("{base}/api/leads"))
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let created: Value = resp.json().await.unwrap();
        assert_eq!(created["status"], "NEW");
        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

        let resp = client
            .post(format!("{base}/api/leads"))
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let again: Value = resp.json().await.unwrap();
        assert_eq!(again["id"], id.to_string());

        // The first touch runs in the background.
        for _ in 0..50 {
            if !h.sms.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.sms.sent().len(), 1);
        let stored = h.store.get_lead(id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Contacted);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manual_process_runs_and_unknown_lead_is_404() {
    timeout(TEST_TIMEOUT, async {
        let (base, h) = start_server(greeting()).await;
        let client = reqwest::Client::new();
        let now = Utc::now();
        let lead = Lead::new("Casey", now)
            .with_phone("+15550201")
            .with_consent(Consent::all());
        h.store.insert_lead(&lead).await.unwrap();

        let resp = client
            .post(format!("{base}/api/leads/{}/process", lead.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["acted"], true);
        assert_eq!(body["action"], "sent_sms");
        assert_eq!(h.decision.calls(), 1);

        let resp = client
            .post(format!("{base}/api/leads/{}/process", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sms_webhook_handles_stop() {
    timeout(TEST_TIMEOUT, async {
        let (base, h) = start_server(greeting()).await;
        let now = Utc::now();
        let lead = Lead::new("Morgan", now)
            .with_phone("+15550202")
            .with_consent(Consent::all());
        h.store.insert_lead(&lead).await.unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{base}/webhooks/sms"))
            .form(&[("From", "+15550202"), ("Body", "Stop"), ("MessageSid", "SM42")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["note"], "opt_out");
        assert_eq!(body["status"], "LOST");
        assert!(h.sms.sent().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn booking_webhook_validates_input() {
    timeout(TEST_TIMEOUT, async {
        let (base, _h) = start_server(greeting()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/webhooks/booking"))
            .json(&json!({ "event": "created", "external_id": "cal-9", "phone": "+15550203" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{base}/webhooks/booking"))
            .json(&json!({ "event": "cancelled", "external_id": "never-booked" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn call_outcome_webhook() {
    timeout(TEST_TIMEOUT, async {
        let (base, h) = start_server(greeting()).await;
        let client = reqwest::Client::new();
        let now = Utc::now();
        let mut lead = Lead::new("Taylor", now - chrono::Duration::days(2))
            .with_phone("+15550204")
            .with_consent(Consent::all());
        lead.status = LeadStatus::CallScheduled;
        h.store.insert_lead(&lead).await.unwrap();
        let appt = Appointment::new(lead.id, now - chrono::Duration::minutes(10), now);
        h.store.insert_appointment(&appt).await.unwrap();

        let resp = client
            .post(format!("{base}/webhooks/calls/{}/outcome", appt.id))
            .json(&json!({ "outcome": "no_show" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ENGAGED");
        assert_eq!(body["duplicate"], false);

        let resp = client
            .post(format!("{base}/webhooks/calls/{}/outcome", Uuid::new_v4()))
            .json(&json!({ "outcome": "completed" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn application_webhook_converts() {
    timeout(TEST_TIMEOUT, async {
        let (base, h) = start_server(greeting()).await;
        let now = Utc::now();
        let mut lead = Lead::new("Jamie", now - chrono::Duration::days(6))
            .with_email("jamie@example.com")
            .with_consent(Consent::all());
        lead.status = LeadStatus::ApplicationStarted;
        h.store.insert_lead(&lead).await.unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{base}/webhooks/application"))
            .json(&json!({ "event": "completed", "email": "jamie@example.com" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "CONVERTED");
    })
    .await
    .expect("test timed out");
}
