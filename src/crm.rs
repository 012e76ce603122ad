//! CRM deal creation. Fire-and-forget: failures are logged, never surfaced.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::leads::Lead;

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn create_deal(&self, lead: &Lead) -> Result<(), GatewayError>;
}

/// Spawn `create_deal` in the background and log the outcome.
pub fn create_deal_in_background(crm: Arc<dyn CrmClient>, lead: Lead) {
    tokio::spawn(async move {
        match crm.create_deal(&lead).await {
            Ok(()) => tracing::info!(lead_id = %lead.id, "CRM deal created"),
            Err(e) => tracing::warn!(lead_id = %lead.id, error = %e, "CRM deal creation failed"),
        }
    });
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub deals_url: String,
    pub api_key: SecretString,
}

impl CrmConfig {
    /// Returns `None` if `CRM_DEALS_URL` is not set (deal sync disabled).
    pub fn from_env() -> Option<Self> {
        let deals_url = std::env::var("CRM_DEALS_URL").ok()?;
        let api_key = std::env::var("CRM_API_KEY").unwrap_or_default();
        Some(Self {
            deals_url,
            api_key: SecretString::from(api_key),
        })
    }
}

#[derive(Debug, Serialize)]
struct DealPayload<'a> {
    external_lead_id: Uuid,
    title: String,
    contact_name: &'a str,
    contact_email: Option<&'a str>,
    contact_phone: Option<&'a str>,
    #[serde(with = "rust_decimal::serde::str_option")]
    amount: Option<Decimal>,
    stage: &'a str,
}

impl<'a> DealPayload<'a> {
    fn from_lead(lead: &'a Lead) -> Self {
        Self {
            external_lead_id: lead.id,
            title: format!("{} - mortgage", lead.name),
            contact_name: &lead.name,
            contact_email: lead.email.as_deref(),
            contact_phone: lead.phone.as_deref(),
            amount: lead.loan_amount,
            stage: lead.status.as_str(),
        }
    }
}

pub struct HttpCrmClient {
    config: CrmConfig,
    client: reqwest::Client,
}

impl HttpCrmClient {
    pub fn new(config: CrmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn create_deal(&self, lead: &Lead) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(&self.config.deals_url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&DealPayload::from_lead(lead))
            .send()
            .await
            .map_err(|e| GatewayError::SendFailed {
                name: "crm".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::SendFailed {
                name: "crm".into(),
                reason: format!("CRM returned {status}: {text}"),
            });
        }
        Ok(())
    }
}
