//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z`) so range predicates can compare
//! the TEXT columns directly.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::{
    Activity, ActivityKind, Appointment, AppointmentStatus, ChannelKind, Communication, Consent,
    Direction, Lead, LeadStatus, ReminderSlot, ScheduledKind, ScheduledMessage,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_leads(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut leads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            leads.push(row_to_lead(&row)?);
        }
        Ok(leads)
    }

    async fn query_communications(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Communication>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut comms = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            comms.push(row_to_communication(&row)?);
        }
        Ok(comms)
    }

    async fn query_appointments(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Appointment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            out.push(row_to_appointment(&row)?);
        }
        Ok(out)
    }

    async fn query_scheduled(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            out.push(row_to_scheduled(&row)?);
        }
        Ok(out)
    }

    /// Run a single-value `SELECT COUNT(*)`-style query.
    async fn query_count(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn execute(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("{field}: invalid uuid {s:?}: {e}")))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(ts))
}

fn flag(b: bool) -> i64 {
    b as i64
}

const LEAD_COLUMNS: &str = "id, name, phone, email, status, consent_sms, consent_email, \
     consent_voice, last_contacted_at, next_review_at, managed_by_autonomous, agent_disabled, \
     utc_offset_minutes, loan_amount, application_started_at, call_completed_at, created_at, \
     updated_at";

const COMMUNICATION_COLUMNS: &str =
    "id, lead_id, channel, direction, content, provider_id, provider_status, metadata, created_at";

const APPOINTMENT_COLUMNS: &str = "id, lead_id, external_id, scheduled_at, status, \
     reminder_24h_sent, reminder_1h_sent, created_at, updated_at";

const SCHEDULED_COLUMNS: &str =
    "id, lead_id, kind, channel, subject, content, execute_at, created_at";

/// Terminal statuses as an SQL list literal.
const TERMINAL_SQL: &str = "('LOST', 'CONVERTED', 'DEALS_WON')";

/// A lead with at least one consented channel that has an address on file.
const USABLE_CHANNEL_SQL: &str = "(((consent_sms = 1 OR consent_voice = 1) AND phone IS NOT NULL) \
     OR (consent_email = 1 AND email IS NOT NULL))";

/// Map a libsql Row to a Lead. Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_lead: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let status_str: String = row.get(4).map_err(get_err)?;
    let status = LeadStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?;
    let loan_amount = match row.get::<String>(13).ok() {
        Some(s) => Some(Decimal::from_str(&s).map_err(|e| {
            DatabaseError::Serialization(format!("loan_amount {s:?}: {e}"))
        })?),
        None => None,
    };
    let created_str: String = row.get(16).map_err(get_err)?;
    let updated_str: String = row.get(17).map_err(get_err)?;

    Ok(Lead {
        id: parse_uuid(&id_str, "leads.id")?,
        name: row.get(1).map_err(get_err)?,
        phone: row.get::<String>(2).ok(),
        email: row.get::<String>(3).ok(),
        status,
        consent: Consent {
            sms: row.get::<i64>(5).unwrap_or(0) != 0,
            email: row.get::<i64>(6).unwrap_or(0) != 0,
            voice: row.get::<i64>(7).unwrap_or(0) != 0,
        },
        last_contacted_at: parse_optional_datetime(&row.get::<String>(8).ok()),
        next_review_at: parse_optional_datetime(&row.get::<String>(9).ok()),
        managed_by_autonomous: row.get::<i64>(10).unwrap_or(0) != 0,
        agent_disabled: row.get::<i64>(11).unwrap_or(0) != 0,
        utc_offset_minutes: row.get::<i64>(12).unwrap_or(0) as i32,
        loan_amount,
        application_started_at: parse_optional_datetime(&row.get::<String>(14).ok()),
        call_completed_at: parse_optional_datetime(&row.get::<String>(15).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_communication(row: &libsql::Row) -> Result<Communication, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_communication: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let lead_str: String = row.get(1).map_err(get_err)?;
    let channel_str: String = row.get(2).map_err(get_err)?;
    let direction_str: String = row.get(3).map_err(get_err)?;
    let metadata_str: String = row.get(7).unwrap_or_else(|_| "null".to_string());
    let created_str: String = row.get(8).map_err(get_err)?;

    Ok(Communication {
        id: parse_uuid(&id_str, "communications.id")?,
        lead_id: parse_uuid(&lead_str, "communications.lead_id")?,
        channel: channel_str.parse().map_err(DatabaseError::Serialization)?,
        direction: direction_str.parse().map_err(DatabaseError::Serialization)?,
        content: row.get(4).map_err(get_err)?,
        provider_id: row.get::<String>(5).ok(),
        provider_status: row.get::<String>(6).ok(),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_appointment(row: &libsql::Row) -> Result<Appointment, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_appointment: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let lead_str: String = row.get(1).map_err(get_err)?;
    let scheduled_str: String = row.get(3).map_err(get_err)?;
    let status_str: String = row.get(4).map_err(get_err)?;
    let created_str: String = row.get(7).map_err(get_err)?;
    let updated_str: String = row.get(8).map_err(get_err)?;

    Ok(Appointment {
        id: parse_uuid(&id_str, "appointments.id")?,
        lead_id: parse_uuid(&lead_str, "appointments.lead_id")?,
        external_id: row.get::<String>(2).ok(),
        scheduled_at: parse_datetime(&scheduled_str),
        status: AppointmentStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?,
        reminder_24h_sent: row.get::<i64>(5).unwrap_or(0) != 0,
        reminder_1h_sent: row.get::<i64>(6).unwrap_or(0) != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_scheduled(row: &libsql::Row) -> Result<ScheduledMessage, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_scheduled: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let lead_str: String = row.get(1).map_err(get_err)?;
    let kind_str: String = row.get(2).map_err(get_err)?;
    let channel_str: String = row.get(3).map_err(get_err)?;
    let execute_str: String = row.get(6).map_err(get_err)?;
    let created_str: String = row.get(7).map_err(get_err)?;

    Ok(ScheduledMessage {
        id: parse_uuid(&id_str, "scheduled_messages.id")?,
        lead_id: parse_uuid(&lead_str, "scheduled_messages.lead_id")?,
        kind: ScheduledKind::from_str(&kind_str).map_err(DatabaseError::Serialization)?,
        channel: ChannelKind::from_str(&channel_str).map_err(DatabaseError::Serialization)?,
        subject: row.get::<String>(4).ok(),
        content: row.get(5).map_err(get_err)?,
        execute_at: parse_datetime(&execute_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_activity(row: &libsql::Row) -> Result<Activity, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row_to_activity: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let lead_str: String = row.get(1).map_err(get_err)?;
    let kind_str: String = row.get(2).map_err(get_err)?;
    let created_str: String = row.get(4).map_err(get_err)?;

    Ok(Activity {
        id: parse_uuid(&id_str, "activities.id")?,
        lead_id: parse_uuid(&lead_str, "activities.lead_id")?,
        kind: ActivityKind::from_str(&kind_str).map_err(DatabaseError::Serialization)?,
        detail: row.get(3).map_err(get_err)?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        self.execute(
            "insert_lead",
            &format!(
                "INSERT INTO leads ({LEAD_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            params![
                lead.id.to_string(),
                lead.name.clone(),
                opt_text_owned(lead.phone.clone()),
                opt_text_owned(lead.email.clone()),
                lead.status.as_str(),
                flag(lead.consent.sms),
                flag(lead.consent.email),
                flag(lead.consent.voice),
                opt_ts(lead.last_contacted_at),
                opt_ts(lead.next_review_at),
                flag(lead.managed_by_autonomous),
                flag(lead.agent_disabled),
                lead.utc_offset_minutes as i64,
                opt_text_owned(lead.loan_amount.map(|d| d.to_string())),
                opt_ts(lead.application_started_at),
                opt_ts(lead.call_completed_at),
                ts(lead.created_at),
                ts(lead.updated_at),
            ],
        )
        .await?;

        debug!(lead_id = %lead.id, "Lead inserted into DB");
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut leads = self
            .query_leads(
                "get_lead",
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn find_lead_by_phone(&self, phone: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut leads = self
            .query_leads(
                "find_lead_by_phone",
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE phone = ?1 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![phone],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut leads = self
            .query_leads(
                "find_lead_by_email",
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE lower(email) = lower(?1) \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![email],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn update_lead_status(
        &self,
        id: Uuid,
        status: LeadStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // Terminal statuses leave scheduling for good.
        let sql = if status.is_terminal() {
            "UPDATE leads SET status = ?1, next_review_at = NULL, updated_at = ?2 WHERE id = ?3"
        } else {
            "UPDATE leads SET status = ?1, updated_at = ?2 WHERE id = ?3"
        };
        let n = self
            .execute(
                "update_lead_status",
                sql,
                params![status.as_str(), ts(at), id.to_string()],
            )
            .await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: id.to_string(),
            });
        }
        debug!(lead_id = %id, status = %status, "Lead status updated in DB");
        Ok(())
    }

    async fn update_lead_consent(
        &self,
        id: Uuid,
        consent: Consent,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "update_lead_consent",
            "UPDATE leads SET consent_sms = ?1, consent_email = ?2, consent_voice = ?3, \
             updated_at = ?4 WHERE id = ?5",
            params![
                flag(consent.sms),
                flag(consent.email),
                flag(consent.voice),
                ts(at),
                id.to_string()
            ],
        )
        .await?;
        Ok(())
    }

    async fn update_lead_gates(
        &self,
        id: Uuid,
        managed_by_autonomous: bool,
        agent_disabled: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "update_lead_gates",
            "UPDATE leads SET managed_by_autonomous = ?1, agent_disabled = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![
                flag(managed_by_autonomous),
                flag(agent_disabled),
                ts(at),
                id.to_string()
            ],
        )
        .await?;
        Ok(())
    }

    async fn record_contact(
        &self,
        id: Uuid,
        contacted_at: DateTime<Utc>,
        next_review_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "record_contact",
            "UPDATE leads SET last_contacted_at = ?1, next_review_at = ?2, updated_at = ?1 \
             WHERE id = ?3",
            params![ts(contacted_at), ts(next_review_at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn set_next_review(
        &self,
        id: Uuid,
        next_review_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "set_next_review",
            "UPDATE leads SET next_review_at = ?1 WHERE id = ?2",
            params![opt_ts(next_review_at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn set_application_started(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "set_application_started",
            "UPDATE leads SET application_started_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![ts(started_at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn set_call_completed(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "set_call_completed",
            "UPDATE leads SET call_completed_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![ts(completed_at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn list_due_leads(
        &self,
        now: DateTime<Utc>,
        contact_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_due_leads",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads \
                 WHERE managed_by_autonomous = 1 AND agent_disabled = 0 \
                   AND status NOT IN {TERMINAL_SQL} \
                   AND {USABLE_CHANNEL_SQL} \
                   AND (next_review_at IS NULL OR next_review_at <= ?1) \
                   AND (last_contacted_at IS NULL OR last_contacted_at <= ?2) \
                 ORDER BY next_review_at IS NOT NULL, next_review_at, created_at"
            ),
            params![ts(now), ts(contact_cutoff)],
        )
        .await
    }

    async fn list_active_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_active_leads",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads \
                 WHERE managed_by_autonomous = 1 AND agent_disabled = 0 \
                   AND status NOT IN {TERMINAL_SQL} \
                 ORDER BY created_at"
            ),
            (),
        )
        .await
    }

    async fn list_stale_leads(&self, cutoff: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_stale_leads",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads \
                 WHERE status NOT IN {TERMINAL_SQL} AND updated_at <= ?1 \
                 ORDER BY updated_at"
            ),
            params![ts(cutoff)],
        )
        .await
    }

    async fn list_leads_by_status(&self, status: LeadStatus) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_leads_by_status",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE status = ?1 ORDER BY created_at"),
            params![status.as_str()],
        )
        .await
    }

    // ── Communications ──────────────────────────────────────────────

    async fn append_communication(&self, comm: &Communication) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&comm.metadata)
            .map_err(|e| DatabaseError::Serialization(format!("communication metadata: {e}")))?;
        self.execute(
            "append_communication",
            &format!(
                "INSERT INTO communications ({COMMUNICATION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                comm.id.to_string(),
                comm.lead_id.to_string(),
                comm.channel.as_str(),
                comm.direction.as_str(),
                comm.content.clone(),
                opt_text_owned(comm.provider_id.clone()),
                opt_text_owned(comm.provider_status.clone()),
                metadata,
                ts(comm.created_at),
            ],
        )
        .await?;

        debug!(
            lead_id = %comm.lead_id,
            channel = %comm.channel,
            direction = comm.direction.as_str(),
            "Communication appended"
        );
        Ok(())
    }

    async fn list_communications(
        &self,
        lead_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Communication>, DatabaseError> {
        let mut comms = self
            .query_communications(
                "list_communications",
                &format!(
                    "SELECT {COMMUNICATION_COLUMNS} FROM communications WHERE lead_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![lead_id.to_string(), limit as i64],
            )
            .await?;
        comms.reverse();
        Ok(comms)
    }

    async fn list_outbound_since(
        &self,
        lead_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Communication>, DatabaseError> {
        self.query_communications(
            "list_outbound_since",
            &format!(
                "SELECT {COMMUNICATION_COLUMNS} FROM communications \
                 WHERE lead_id = ?1 AND direction = 'outbound' AND created_at >= ?2 \
                 ORDER BY created_at, rowid"
            ),
            params![lead_id.to_string(), ts(since)],
        )
        .await
    }

    async fn count_communications(
        &self,
        lead_id: Uuid,
        direction: Direction,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, DatabaseError> {
        self.query_count(
            "count_communications",
            "SELECT COUNT(*) FROM communications \
             WHERE lead_id = ?1 AND direction = ?2 AND (?3 IS NULL OR created_at >= ?3)",
            params![lead_id.to_string(), direction.as_str(), opt_ts(since)],
        )
        .await
    }

    async fn latest_communication_at(
        &self,
        lead_id: Uuid,
        direction: Direction,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(created_at) FROM communications WHERE lead_id = ?1 AND direction = ?2",
                params![lead_id.to_string(), direction.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_communication_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(parse_optional_datetime(&row.get::<String>(0).ok())),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_communication_at: {e}"))),
        }
    }

    // ── Activities ──────────────────────────────────────────────────

    async fn append_activity(&self, activity: &Activity) -> Result<(), DatabaseError> {
        self.execute(
            "append_activity",
            "INSERT INTO activities (id, lead_id, kind, detail, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                activity.id.to_string(),
                activity.lead_id.to_string(),
                activity.kind.as_str(),
                activity.detail.clone(),
                ts(activity.created_at),
            ],
        )
        .await?;
        debug!(lead_id = %activity.lead_id, kind = activity.kind.as_str(), "Activity recorded");
        Ok(())
    }

    async fn list_activities(&self, lead_id: Uuid) -> Result<Vec<Activity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, lead_id, kind, detail, created_at FROM activities \
                 WHERE lead_id = ?1 ORDER BY created_at, rowid",
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_activities: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_activities: {e}")))?
        {
            out.push(row_to_activity(&row)?);
        }
        Ok(out)
    }

    async fn has_activity(
        &self,
        lead_id: Uuid,
        kind: ActivityKind,
        detail: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .query_count(
                "has_activity",
                "SELECT COUNT(*) FROM activities \
                 WHERE lead_id = ?1 AND kind = ?2 \
                   AND (?3 IS NULL OR detail = ?3) \
                   AND (?4 IS NULL OR created_at >= ?4)",
                params![
                    lead_id.to_string(),
                    kind.as_str(),
                    opt_text_owned(detail.map(str::to_string)),
                    opt_ts(since),
                ],
            )
            .await?;
        Ok(count > 0)
    }

    // ── Appointments ────────────────────────────────────────────────

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), DatabaseError> {
        self.execute(
            "insert_appointment",
            &format!(
                "INSERT INTO appointments ({APPOINTMENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                appointment.id.to_string(),
                appointment.lead_id.to_string(),
                opt_text_owned(appointment.external_id.clone()),
                ts(appointment.scheduled_at),
                appointment.status.as_str(),
                flag(appointment.reminder_24h_sent),
                flag(appointment.reminder_1h_sent),
                ts(appointment.created_at),
                ts(appointment.updated_at),
            ],
        )
        .await?;
        debug!(appointment_id = %appointment.id, lead_id = %appointment.lead_id, "Appointment inserted");
        Ok(())
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>, DatabaseError> {
        let mut out = self
            .query_appointments(
                "get_appointment",
                &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(out.pop())
    }

    async fn get_appointment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Appointment>, DatabaseError> {
        let mut out = self
            .query_appointments(
                "get_appointment_by_external_id",
                &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE external_id = ?1"),
                params![external_id],
            )
            .await?;
        Ok(out.pop())
    }

    async fn list_appointments(&self, lead_id: Uuid) -> Result<Vec<Appointment>, DatabaseError> {
        self.query_appointments(
            "list_appointments",
            &format!(
                "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE lead_id = ?1 \
                 ORDER BY scheduled_at"
            ),
            params![lead_id.to_string()],
        )
        .await
    }

    async fn update_appointment_status(
        &self,
        id: Uuid,
        status: AppointmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let n = self
            .execute(
                "update_appointment_status",
                "UPDATE appointments SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(at), id.to_string()],
            )
            .await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "appointment".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn reschedule_appointment(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "reschedule_appointment",
            "UPDATE appointments SET scheduled_at = ?1, status = 'scheduled', \
             reminder_24h_sent = 0, reminder_1h_sent = 0, updated_at = ?2 WHERE id = ?3",
            params![ts(scheduled_at), ts(at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn list_scheduled_appointments_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, DatabaseError> {
        self.query_appointments(
            "list_scheduled_appointments_between",
            &format!(
                "SELECT {APPOINTMENT_COLUMNS} FROM appointments \
                 WHERE status = 'scheduled' AND scheduled_at >= ?1 AND scheduled_at < ?2 \
                 ORDER BY scheduled_at"
            ),
            params![ts(from), ts(to)],
        )
        .await
    }

    async fn claim_reminder(&self, id: Uuid, slot: ReminderSlot) -> Result<bool, DatabaseError> {
        let col = slot.column();
        let n = self
            .execute(
                "claim_reminder",
                &format!(
                    "UPDATE appointments SET {col} = 1 \
                     WHERE id = ?1 AND {col} = 0 AND status = 'scheduled'"
                ),
                params![id.to_string()],
            )
            .await?;
        Ok(n == 1)
    }

    async fn release_reminder(&self, id: Uuid, slot: ReminderSlot) -> Result<(), DatabaseError> {
        let col = slot.column();
        self.execute(
            "release_reminder",
            &format!("UPDATE appointments SET {col} = 0 WHERE id = ?1"),
            params![id.to_string()],
        )
        .await?;
        Ok(())
    }

    // ── Scheduled messages ──────────────────────────────────────────

    async fn insert_scheduled_message(&self, msg: &ScheduledMessage) -> Result<(), DatabaseError> {
        self.execute(
            "insert_scheduled_message",
            &format!(
                "INSERT INTO scheduled_messages ({SCHEDULED_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                msg.id.to_string(),
                msg.lead_id.to_string(),
                msg.kind.as_str(),
                msg.channel.as_str(),
                opt_text_owned(msg.subject.clone()),
                msg.content.clone(),
                ts(msg.execute_at),
                ts(msg.created_at),
            ],
        )
        .await?;
        debug!(message_id = %msg.id, lead_id = %msg.lead_id, kind = msg.kind.as_str(), "Deferred message queued");
        Ok(())
    }

    async fn list_scheduled_messages(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.query_scheduled(
            "list_scheduled_messages",
            &format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE lead_id = ?1 \
                 ORDER BY execute_at"
            ),
            params![lead_id.to_string()],
        )
        .await
    }

    async fn list_due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        self.query_scheduled(
            "list_due_scheduled_messages",
            &format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE execute_at <= ?1 \
                 ORDER BY execute_at"
            ),
            params![ts(now)],
        )
        .await
    }

    async fn claim_scheduled_message(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduledMessage>, DatabaseError> {
        let Some(msg) = self
            .query_scheduled(
                "claim_scheduled_message",
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?
            .pop()
        else {
            return Ok(None);
        };

        // Whoever deletes the row owns the send.
        let n = self
            .execute(
                "claim_scheduled_message",
                "DELETE FROM scheduled_messages WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok((n == 1).then_some(msg))
    }

    async fn cancel_scheduled_message(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let n = self
            .execute(
                "cancel_scheduled_message",
                "DELETE FROM scheduled_messages WHERE id = ?1",
                params![id.to_string()],
            )
            .await?;
        Ok(n > 0)
    }

    async fn cancel_scheduled_messages(
        &self,
        lead_id: Uuid,
        kind: ScheduledKind,
    ) -> Result<usize, DatabaseError> {
        let n = self
            .execute(
                "cancel_scheduled_messages",
                "DELETE FROM scheduled_messages WHERE lead_id = ?1 AND kind = ?2",
                params![lead_id.to_string(), kind.as_str()],
            )
            .await?;
        if n > 0 {
            info!(lead_id = %lead_id, kind = kind.as_str(), count = n, "Cancelled deferred messages");
        }
        Ok(n as usize)
    }

    // ── Scheduler checkpoints ───────────────────────────────────────

    async fn get_checkpoint(&self, name: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_run_at FROM scheduler_checkpoints WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(parse_optional_datetime(&row.get::<String>(0).ok())),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_checkpoint: {e}"))),
        }
    }

    async fn set_checkpoint(&self, name: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.execute(
            "set_checkpoint",
            "INSERT INTO scheduler_checkpoints (name, last_run_at) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET last_run_at = excluded.last_run_at",
            params![name, ts(at)],
        )
        .await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_lead(now: DateTime<Utc>) -> Lead {
        Lead::new("Alex Rivera", now)
            .with_phone("+15550101")
            .with_email("alex@example.com")
            .with_consent(Consent::all())
    }

    // ── Lead tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_lead() {
        let db = test_db().await;
        let now = Utc::now();
        let mut lead = make_lead(now);
        lead.loan_amount = Some(dec!(425000.50));
        lead.utc_offset_minutes = -300;
        db.insert_lead(&lead).await.unwrap();

        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Alex Rivera");
        assert_eq!(fetched.status, LeadStatus::New);
        assert_eq!(fetched.consent, Consent::all());
        assert_eq!(fetched.loan_amount, Some(dec!(425000.50)));
        assert_eq!(fetched.utc_offset_minutes, -300);
        assert!(fetched.next_review_at.is_none());
    }

    #[tokio::test]
    async fn get_missing_lead_is_none() {
        let db = test_db().await;
        assert!(db.get_lead(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_lead_by_phone_and_email() {
        let db = test_db().await;
        let lead = make_lead(Utc::now());
        db.insert_lead(&lead).await.unwrap();

        let by_phone = db.find_lead_by_phone("+15550101").await.unwrap().unwrap();
        assert_eq!(by_phone.id, lead.id);
        let by_email = db.find_lead_by_email("ALEX@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, lead.id);
        assert!(db.find_lead_by_phone("+15559999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_status_clears_next_review() {
        let db = test_db().await;
        let now = Utc::now();
        let mut lead = make_lead(now);
        lead.next_review_at = Some(now + Duration::hours(2));
        db.insert_lead(&lead).await.unwrap();

        db.update_lead_status(lead.id, LeadStatus::Lost, now).await.unwrap();
        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LeadStatus::Lost);
        assert!(fetched.next_review_at.is_none());
    }

    #[tokio::test]
    async fn update_status_of_missing_lead_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_lead_status(Uuid::new_v4(), LeadStatus::Engaged, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn due_predicate_filters_ineligible_leads() {
        let db = test_db().await;
        let now = Utc::now();
        let grace = Duration::minutes(5);

        let due = make_lead(now - Duration::days(1));
        db.insert_lead(&due).await.unwrap();

        let mut future = make_lead(now);
        future.next_review_at = Some(now + Duration::hours(1));
        db.insert_lead(&future).await.unwrap();

        let mut just_contacted = make_lead(now);
        just_contacted.last_contacted_at = Some(now - Duration::minutes(1));
        db.insert_lead(&just_contacted).await.unwrap();

        let mut disabled = make_lead(now);
        disabled.agent_disabled = true;
        db.insert_lead(&disabled).await.unwrap();

        let no_consent = Lead::new("No Consent", now).with_phone("+15550102");
        db.insert_lead(&no_consent).await.unwrap();

        let mut lost = make_lead(now);
        lost.status = LeadStatus::Lost;
        db.insert_lead(&lost).await.unwrap();

        let listed = db.list_due_leads(now, now - grace).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![due.id]);
    }

    #[tokio::test]
    async fn stale_leads_by_updated_at() {
        let db = test_db().await;
        let now = Utc::now();
        let old = make_lead(now - Duration::days(6));
        let fresh = make_lead(now);
        db.insert_lead(&old).await.unwrap();
        db.insert_lead(&fresh).await.unwrap();

        let stale = db.list_stale_leads(now - Duration::days(3)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);

        // Re-arming alone does not count as progress.
        db.set_next_review(old.id, Some(now + Duration::minutes(30)))
            .await
            .unwrap();
        let stale = db.list_stale_leads(now - Duration::days(3)).await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn record_contact_sets_both_timestamps() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();

        let next = now + Duration::hours(1);
        db.record_contact(lead.id, now, next).await.unwrap();
        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(
            fetched.last_contacted_at.map(|t| t.timestamp_micros()),
            Some(now.timestamp_micros())
        );
        assert_eq!(
            fetched.next_review_at.map(|t| t.timestamp_micros()),
            Some(next.timestamp_micros())
        );
    }

    // ── Communication tests ─────────────────────────────────────────

    #[tokio::test]
    async fn communications_are_chronological() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();

        for (i, text) in ["first", "second", "third"].iter().enumerate() {
            let at = now + Duration::seconds(i as i64);
            db.append_communication(&Communication::outbound(lead.id, ChannelKind::Sms, *text, at))
                .await
                .unwrap();
        }
        db.append_communication(&Communication::inbound(
            lead.id,
            ChannelKind::Sms,
            "reply",
            now + Duration::seconds(10),
        ))
        .await
        .unwrap();

        let last_two = db.list_communications(lead.id, 2).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "third");
        assert_eq!(last_two[1].content, "reply");

        let out = db
            .count_communications(lead.id, Direction::Outbound, None)
            .await
            .unwrap();
        assert_eq!(out, 3);
        let recent = db
            .count_communications(lead.id, Direction::Outbound, Some(now + Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(recent, 2);

        let latest_in = db
            .latest_communication_at(lead.id, Direction::Inbound)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            latest_in.timestamp_micros(),
            (now + Duration::seconds(10)).timestamp_micros()
        );
    }

    #[tokio::test]
    async fn communication_metadata_survives() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();

        let comm = Communication::outbound(lead.id, ChannelKind::Email, "hello", now)
            .with_provider(Some("msg-1".into()), Some("queued".into()))
            .with_metadata(serde_json::json!({"subject": "Rates"}));
        db.append_communication(&comm).await.unwrap();

        let listed = db.list_outbound_since(lead.id, now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].provider_id.as_deref(), Some("msg-1"));
        assert_eq!(listed[0].metadata["subject"], "Rates");
    }

    // ── Activity tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn has_activity_filters_detail_and_window() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();

        db.append_activity(&Activity::new(lead.id, ActivityKind::Milestone, "day 3", now))
            .await
            .unwrap();

        assert!(db
            .has_activity(lead.id, ActivityKind::Milestone, Some("day 3"), None)
            .await
            .unwrap());
        assert!(!db
            .has_activity(lead.id, ActivityKind::Milestone, Some("day 7"), None)
            .await
            .unwrap());
        assert!(!db
            .has_activity(lead.id, ActivityKind::Milestone, None, Some(now + Duration::seconds(1)))
            .await
            .unwrap());
        assert_eq!(db.list_activities(lead.id).await.unwrap().len(), 1);
    }

    // ── Appointment tests ───────────────────────────────────────────

    #[tokio::test]
    async fn reminder_claim_is_single_shot() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();
        let appt = Appointment::new(lead.id, now + Duration::hours(20), now).with_external_id("cal-1");
        db.insert_appointment(&appt).await.unwrap();

        assert!(db.claim_reminder(appt.id, ReminderSlot::DayBefore).await.unwrap());
        assert!(!db.claim_reminder(appt.id, ReminderSlot::DayBefore).await.unwrap());
        assert!(db.claim_reminder(appt.id, ReminderSlot::HourBefore).await.unwrap());

        db.release_reminder(appt.id, ReminderSlot::DayBefore).await.unwrap();
        let fetched = db.get_appointment_by_external_id("cal-1").await.unwrap().unwrap();
        assert!(!fetched.reminder_24h_sent);
        assert!(fetched.reminder_1h_sent);
    }

    #[tokio::test]
    async fn reschedule_rearms_reminders() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();
        let appt = Appointment::new(lead.id, now + Duration::hours(2), now);
        db.insert_appointment(&appt).await.unwrap();
        db.claim_reminder(appt.id, ReminderSlot::DayBefore).await.unwrap();

        db.reschedule_appointment(appt.id, now + Duration::days(2), now)
            .await
            .unwrap();
        let fetched = db.get_appointment(appt.id).await.unwrap().unwrap();
        assert!(!fetched.reminder_24h_sent);
        assert_eq!(fetched.status, AppointmentStatus::Scheduled);

        let window = db
            .list_scheduled_appointments_between(now, now + Duration::days(3))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
    }

    // ── Scheduled message tests ─────────────────────────────────────

    #[tokio::test]
    async fn scheduled_message_claim_and_cancel() {
        let db = test_db().await;
        let now = Utc::now();
        let lead = make_lead(now);
        db.insert_lead(&lead).await.unwrap();

        let due = ScheduledMessage::new(
            lead.id,
            ScheduledKind::PostCallFollowUp,
            ChannelKind::Sms,
            "Thanks for the call",
            now - Duration::minutes(1),
            now,
        );
        let later = ScheduledMessage::new(
            lead.id,
            ScheduledKind::Manual,
            ChannelKind::Email,
            "Checking in",
            now + Duration::hours(3),
            now,
        );
        db.insert_scheduled_message(&due).await.unwrap();
        db.insert_scheduled_message(&later).await.unwrap();

        let listed = db.list_due_scheduled_messages(now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, due.id);

        let claimed = db.claim_scheduled_message(due.id).await.unwrap();
        assert!(claimed.is_some());
        assert!(db.claim_scheduled_message(due.id).await.unwrap().is_none());

        assert_eq!(
            db.cancel_scheduled_messages(lead.id, ScheduledKind::PostCallFollowUp)
                .await
                .unwrap(),
            0
        );
        assert!(db.cancel_scheduled_message(later.id).await.unwrap());
        assert!(db.list_scheduled_messages(lead.id).await.unwrap().is_empty());
    }

    // ── Checkpoint tests ────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_upsert() {
        let db = test_db().await;
        assert!(db.get_checkpoint("stale_lead_alert").await.unwrap().is_none());

        let first = Utc::now();
        db.set_checkpoint("stale_lead_alert", first).await.unwrap();
        let second = first + Duration::days(1);
        db.set_checkpoint("stale_lead_alert", second).await.unwrap();

        let got = db.get_checkpoint("stale_lead_alert").await.unwrap().unwrap();
        assert_eq!(got.timestamp_micros(), second.timestamp_micros());
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("leads.db");
        let lead = make_lead(Utc::now());
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_lead(&lead).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_lead(lead.id).await.unwrap().is_some());
    }
}
