use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::experiments::{
    format_experiment_id, Archetype, ExperimentRecord, ExperimentStatus, LeadStatus,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Uniqueness constraints the store can report as domain conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    ExperimentId,
    ExperimentSlug,
    LeadEmail,
    PaymentIntent,
    MetricsDay,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("uniqueness conflict")]
    Conflict(Conflict),
    #[error("status transition {current} -> {requested} is not allowed")]
    InvalidTransition {
        current: ExperimentStatus,
        requested: ExperimentStatus,
    },
    #[error("storage failure: {0}")]
    Sqlite(rusqlite::Error),
    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store mutex poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match classify_conflict(&error) {
            Some(conflict) => Self::Conflict(conflict),
            None => Self::Sqlite(error),
        }
    }
}

/// Translate SQLite's uniqueness-violation signal into the domain
/// conflict it represents. Conflicts are detected here rather than
/// pre-checked with a SELECT so concurrent submissions cannot race
/// past each other.
fn classify_conflict(error: &rusqlite::Error) -> Option<Conflict> {
    let rusqlite::Error::SqliteFailure(code, Some(message)) = error else {
        return None;
    };
    if code.code != rusqlite::ErrorCode::ConstraintViolation {
        return None;
    }
    if message.contains("leads.experiment_id") && message.contains("leads.email") {
        return Some(Conflict::LeadEmail);
    }
    if message.contains("experiments.slug") {
        return Some(Conflict::ExperimentSlug);
    }
    if message.contains("experiments.id") {
        return Some(Conflict::ExperimentId);
    }
    if message.contains("payments.stripe_payment_intent_id") {
        return Some(Conflict::PaymentIntent);
    }
    if message.contains("metrics_daily") {
        return Some(Conflict::MetricsDay);
    }
    None
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadRecord {
    pub id: i64,
    pub experiment_id: String,
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub custom_fields: Option<Value>,
    pub status: String,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub referrer: Option<String>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub ip_country: Option<String>,
    pub user_agent: Option<String>,
    pub stripe_payment_id: Option<String>,
    pub payment_amount_cents: Option<i64>,
    pub payment_status: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewLead {
    pub experiment_id: String,
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub custom_fields: Option<Value>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub referrer: Option<String>,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub ip_country: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub id: i64,
    pub experiment_id: Option<String>,
    pub lead_id: Option<i64>,
    pub stripe_payment_intent_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_method_type: Option<String>,
    pub receipt_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub experiment_id: Option<String>,
    pub lead_id: Option<i64>,
    pub stripe_payment_intent_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method_type: Option<String>,
    pub receipt_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsDailyRecord {
    pub id: i64,
    pub experiment_id: String,
    pub date: String,
    pub source: Option<String>,
    pub impressions: i64,
    pub clicks: i64,
    pub sessions: i64,
    pub conversions: i64,
    pub spend_cents: i64,
    pub revenue_cents: i64,
    pub ctr_bp: Option<i64>,
    pub cvr_bp: Option<i64>,
    pub cpl_cents: Option<i64>,
    pub roas_bp: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct MetricsDailyUpsert {
    pub experiment_id: String,
    pub date: String,
    pub source: Option<String>,
    pub impressions: i64,
    pub clicks: i64,
    pub sessions: i64,
    pub conversions: i64,
    pub spend_cents: i64,
    pub revenue_cents: i64,
    pub ctr_bp: Option<i64>,
    pub cvr_bp: Option<i64>,
    pub cpl_cents: Option<i64>,
    pub roas_bp: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub experiment_id: Option<String>,
    pub event_type: String,
    pub event_data: Option<String>,
    pub event_hash: String,
    pub session_id: Option<String>,
    pub visitor_id: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub ip_country: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoRecord {
    pub id: i64,
    pub experiment_id: String,
    pub title: String,
    pub body: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub enum MemoKind {
    Decision,
    Learning,
}

impl MemoKind {
    const fn table(self) -> &'static str {
        match self {
            Self::Decision => "decision_memos",
            Self::Learning => "learning_memos",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub name: String,
    pub slug: String,
    pub archetype: Archetype,
    pub problem_statement: Option<String>,
    pub target_audience: Option<String>,
    pub value_proposition: Option<String>,
    pub market_size_estimate: Option<String>,
    pub min_signups: Option<i64>,
    pub max_spend_cents: Option<i64>,
    pub max_duration_days: Option<i64>,
    pub kill_criteria: Option<String>,
    pub copy_pack: Option<String>,
    pub creative_brief: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_product_id: Option<String>,
    pub price_cents: Option<i64>,
}

/// Validated experiment mutation produced by the state-machine layer.
/// Blob fields arrive pre-serialized; status arrives pre-checked
/// against the transition table by the caller's fetch-validate step.
#[derive(Debug, Clone, Default)]
pub struct ExperimentUpdate {
    pub status: Option<ExperimentStatus>,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub problem_statement: Option<String>,
    pub target_audience: Option<String>,
    pub value_proposition: Option<String>,
    pub market_size_estimate: Option<String>,
    pub min_signups: Option<i64>,
    pub max_spend_cents: Option<i64>,
    pub max_duration_days: Option<i64>,
    pub kill_criteria: Option<String>,
    pub copy_pack: Option<String>,
    pub creative_brief: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_product_id: Option<String>,
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_at(path: Option<&PathBuf>) -> Result<Self, StoreError> {
        Self::open(path.map(PathBuf::as_path))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ─── Experiments ─────────────────────────────────────────────────

    pub fn create_experiment(&self, input: NewExperiment) -> Result<ExperimentRecord, StoreError> {
        let now = now_ms();
        let year = Utc::now().year();
        let conn = self.lock()?;

        // Two near-simultaneous creates can pick the same sequence; the
        // primary key rejects the loser and we take the next slot.
        for _ in 0..3 {
            let sequence = next_experiment_sequence(&conn, year)?;
            let id = format_experiment_id(year, sequence);
            let inserted = conn.execute(
                "INSERT INTO experiments (
                   id, name, slug, status, archetype,
                   problem_statement, target_audience, value_proposition, market_size_estimate,
                   min_signups, max_spend_cents, max_duration_days,
                   kill_criteria, copy_pack, creative_brief,
                   stripe_price_id, stripe_product_id, price_cents,
                   created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19)",
                params![
                    id,
                    input.name,
                    input.slug,
                    ExperimentStatus::Draft.as_str(),
                    input.archetype.as_str(),
                    input.problem_statement,
                    input.target_audience,
                    input.value_proposition,
                    input.market_size_estimate,
                    input.min_signups,
                    input.max_spend_cents,
                    input.max_duration_days,
                    input.kill_criteria,
                    input.copy_pack,
                    input.creative_brief,
                    input.stripe_price_id,
                    input.stripe_product_id,
                    input.price_cents,
                    now,
                ],
            );
            match inserted {
                Ok(_) => {
                    return fetch_experiment(&conn, &id)?.ok_or(StoreError::NotFound);
                }
                Err(error) => match classify_conflict(&error) {
                    Some(Conflict::ExperimentId) => continue,
                    Some(conflict) => return Err(StoreError::Conflict(conflict)),
                    None => return Err(StoreError::Sqlite(error)),
                },
            }
        }
        Err(StoreError::Conflict(Conflict::ExperimentId))
    }

    pub fn get_experiment(&self, id: &str) -> Result<Option<ExperimentRecord>, StoreError> {
        let conn = self.lock()?;
        fetch_experiment(&conn, id)
    }

    pub fn get_experiment_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<ExperimentRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{EXPERIMENT_SELECT} WHERE slug = ?1"),
            [slug],
            parse_experiment_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_experiments(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page<ExperimentRecord>, StoreError> {
        let conn = self.lock()?;
        let anchor = match cursor {
            Some(id) => {
                let row: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT created_at, id FROM experiments WHERE id = ?1",
                        [id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                // An unknown cursor restarts from the beginning rather
                // than erroring; cursors are opaque hints, not state.
                row
            }
            None => None,
        };

        let fetch = i64::from(limit) + 1;
        let mut items = match anchor {
            Some((created_at, id)) => {
                let mut stmt = conn.prepare(&format!(
                    "{EXPERIMENT_SELECT}
                     WHERE (created_at > ?1) OR (created_at = ?1 AND id > ?2)
                     ORDER BY created_at ASC, id ASC LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![created_at, id, fetch], parse_experiment_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{EXPERIMENT_SELECT} ORDER BY created_at ASC, id ASC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![fetch], parse_experiment_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
        let next_cursor = if has_more {
            items.last().map(|record| record.id.clone())
        } else {
            None
        };
        Ok(Page {
            items,
            next_cursor,
            has_more,
        })
    }

    /// Apply a validated patch. Status transitions are re-checked here
    /// against the freshly fetched row so a stale caller cannot bypass
    /// the table, and lifecycle timestamps are stamped exactly once.
    pub fn update_experiment(
        &self,
        id: &str,
        update: ExperimentUpdate,
    ) -> Result<ExperimentRecord, StoreError> {
        let now = now_ms();
        let conn = self.lock()?;
        let current = fetch_experiment(&conn, id)?.ok_or(StoreError::NotFound)?;

        let mut launched_at = current.launched_at;
        let mut decided_at = current.decided_at;
        let status = match update.status {
            Some(requested) if requested != current.status => {
                if !current.status.can_transition_to(requested) {
                    return Err(StoreError::InvalidTransition {
                        current: current.status,
                        requested,
                    });
                }
                if requested == ExperimentStatus::Launch && launched_at.is_none() {
                    launched_at = Some(now);
                }
                if requested == ExperimentStatus::Decide && decided_at.is_none() {
                    decided_at = Some(now);
                }
                requested
            }
            _ => current.status,
        };

        conn.execute(
            "UPDATE experiments SET
               name = ?1, slug = ?2, status = ?3,
               problem_statement = ?4, target_audience = ?5, value_proposition = ?6,
               market_size_estimate = ?7, min_signups = ?8, max_spend_cents = ?9,
               max_duration_days = ?10, kill_criteria = ?11, copy_pack = ?12,
               creative_brief = ?13, stripe_price_id = ?14, stripe_product_id = ?15,
               price_cents = ?16, launched_at = ?17, decided_at = ?18, updated_at = ?19
             WHERE id = ?20",
            params![
                update.name.unwrap_or(current.name),
                update.slug.unwrap_or(current.slug),
                status.as_str(),
                update.problem_statement.or(current.problem_statement),
                update.target_audience.or(current.target_audience),
                update.value_proposition.or(current.value_proposition),
                update.market_size_estimate.or(current.market_size_estimate),
                update.min_signups.or(current.min_signups),
                update.max_spend_cents.or(current.max_spend_cents),
                update.max_duration_days.or(current.max_duration_days),
                update
                    .kill_criteria
                    .or(current.kill_criteria.map(|v| v.to_string())),
                update.copy_pack.or(current.copy_pack.map(|v| v.to_string())),
                update
                    .creative_brief
                    .or(current.creative_brief.map(|v| v.to_string())),
                update.stripe_price_id.or(current.stripe_price_id),
                update.stripe_product_id.or(current.stripe_product_id),
                update.price_cents.or(current.price_cents),
                launched_at,
                decided_at,
                now,
                id,
            ],
        )?;

        fetch_experiment(&conn, id)?.ok_or(StoreError::NotFound)
    }

    // ─── Leads ───────────────────────────────────────────────────────

    pub fn insert_lead(&self, input: NewLead) -> Result<LeadRecord, StoreError> {
        let now = now_ms();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO leads (
               experiment_id, email, name, company, phone, custom_fields, status,
               utm_source, utm_medium, utm_campaign, utm_term, utm_content,
               referrer, session_id, visitor_id, ip_country, user_agent,
               created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)",
            params![
                input.experiment_id,
                input.email,
                input.name,
                input.company,
                input.phone,
                input
                    .custom_fields
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                LeadStatus::New.as_str(),
                input.utm_source,
                input.utm_medium,
                input.utm_campaign,
                input.utm_term,
                input.utm_content,
                input.referrer,
                input.session_id,
                input.visitor_id,
                input.ip_country,
                input.user_agent,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        fetch_lead(&conn, id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_lead(&self, id: i64) -> Result<Option<LeadRecord>, StoreError> {
        let conn = self.lock()?;
        fetch_lead(&conn, id)
    }

    pub fn find_latest_lead_by_email(
        &self,
        email: &str,
    ) -> Result<Option<LeadRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{LEAD_SELECT} WHERE email = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"),
            [email],
            parse_lead_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_leads(
        &self,
        experiment_id: &str,
        cursor: Option<i64>,
        limit: u32,
    ) -> Result<Page<LeadRecord>, StoreError> {
        let conn = self.lock()?;
        let fetch = i64::from(limit) + 1;
        let mut stmt = conn.prepare(&format!(
            "{LEAD_SELECT} WHERE experiment_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3"
        ))?;
        let mut items = stmt
            .query_map(
                params![experiment_id, cursor.unwrap_or(0), fetch],
                parse_lead_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
        let next_cursor = if has_more {
            items.last().map(|lead| lead.id.to_string())
        } else {
            None
        };
        Ok(Page {
            items,
            next_cursor,
            has_more,
        })
    }

    pub fn record_lead_payment(
        &self,
        lead_id: i64,
        stripe_payment_id: &str,
        amount_cents: i64,
        payment_status: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE leads SET stripe_payment_id = ?1, payment_amount_cents = ?2,
               payment_status = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                stripe_payment_id,
                amount_cents,
                payment_status,
                now_ms(),
                lead_id
            ],
        )?;
        Ok(())
    }

    pub fn propagate_payment_status_to_leads(
        &self,
        stripe_payment_intent_id: &str,
        payment_status: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE leads SET payment_status = ?1, updated_at = ?2
             WHERE stripe_payment_id = ?3",
            params![payment_status, now_ms(), stripe_payment_intent_id],
        )?;
        Ok(changed)
    }

    // ─── Payments ────────────────────────────────────────────────────

    pub fn get_payment_by_intent(
        &self,
        stripe_payment_intent_id: &str,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{PAYMENT_SELECT} WHERE stripe_payment_intent_id = ?1"),
            [stripe_payment_intent_id],
            parse_payment_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn insert_payment(&self, input: NewPayment) -> Result<PaymentRecord, StoreError> {
        let now = now_ms();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO payments (
               experiment_id, lead_id, stripe_payment_intent_id, stripe_customer_id,
               stripe_charge_id, amount_cents, currency, status, payment_method_type,
               receipt_url, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'succeeded', ?8, ?9, ?10, ?10)",
            params![
                input.experiment_id,
                input.lead_id,
                input.stripe_payment_intent_id,
                input.stripe_customer_id,
                input.stripe_charge_id,
                input.amount_cents,
                input.currency,
                input.payment_method_type,
                input.receipt_url,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("{PAYMENT_SELECT} WHERE id = ?1"),
            [id],
            parse_payment_row,
        )
        .map_err(StoreError::from)
    }

    pub fn update_payment_status_by_intent(
        &self,
        stripe_payment_intent_id: &str,
        status: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE payments SET status = ?1, updated_at = ?2
             WHERE stripe_payment_intent_id = ?3",
            params![status, now_ms(), stripe_payment_intent_id],
        )?;
        Ok(changed > 0)
    }

    // ─── Event log ───────────────────────────────────────────────────

    /// Most recent event with this hash created at or after `since_ms`.
    pub fn find_recent_event_by_hash(
        &self,
        event_hash: &str,
        since_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id FROM event_log
             WHERE event_hash = ?1 AND created_at >= ?2
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![event_hash, since_ms],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn insert_event(&self, input: NewEvent) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO event_log (
               experiment_id, event_type, event_data, event_hash, session_id, visitor_id,
               utm_source, utm_medium, utm_campaign, referrer, user_agent, ip_country,
               created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                input.experiment_id,
                input.event_type,
                input.event_data,
                input.event_hash,
                input.session_id,
                input.visitor_id,
                input.utm_source,
                input.utm_medium,
                input.utm_campaign,
                input.referrer,
                input.user_agent,
                input.ip_country,
                now_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_events_by_hash(&self, event_hash: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(1) FROM event_log WHERE event_hash = ?1",
            [event_hash],
            |row| row.get(0),
        )
        .map_err(StoreError::from)
    }

    // ─── Metrics ─────────────────────────────────────────────────────

    pub fn upsert_metrics_daily(
        &self,
        input: MetricsDailyUpsert,
    ) -> Result<MetricsDailyRecord, StoreError> {
        let now = now_ms();
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO metrics_daily (
               experiment_id, date, source, impressions, clicks, sessions, conversions,
               spend_cents, revenue_cents, ctr_bp, cvr_bp, cpl_cents, roas_bp,
               created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                input.experiment_id,
                input.date,
                input.source,
                input.impressions,
                input.clicks,
                input.sessions,
                input.conversions,
                input.spend_cents,
                input.revenue_cents,
                input.ctr_bp,
                input.cvr_bp,
                input.cpl_cents,
                input.roas_bp,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(error) => match classify_conflict(&error) {
                // Re-import of the same (experiment, day, source)
                // replaces raw counters and derived rates in place.
                Some(Conflict::MetricsDay) => {
                    conn.execute(
                        "UPDATE metrics_daily SET
                           impressions = ?1, clicks = ?2, sessions = ?3, conversions = ?4,
                           spend_cents = ?5, revenue_cents = ?6,
                           ctr_bp = ?7, cvr_bp = ?8, cpl_cents = ?9, roas_bp = ?10,
                           updated_at = ?11
                         WHERE experiment_id = ?12 AND date = ?13
                           AND COALESCE(source, '') = COALESCE(?14, '')",
                        params![
                            input.impressions,
                            input.clicks,
                            input.sessions,
                            input.conversions,
                            input.spend_cents,
                            input.revenue_cents,
                            input.ctr_bp,
                            input.cvr_bp,
                            input.cpl_cents,
                            input.roas_bp,
                            now,
                            input.experiment_id,
                            input.date,
                            input.source,
                        ],
                    )?;
                }
                Some(conflict) => return Err(StoreError::Conflict(conflict)),
                None => return Err(StoreError::Sqlite(error)),
            },
        }

        conn.query_row(
            &format!(
                "{METRICS_SELECT} WHERE experiment_id = ?1 AND date = ?2
                 AND COALESCE(source, '') = COALESCE(?3, '')"
            ),
            params![input.experiment_id, input.date, input.source],
            parse_metrics_row,
        )
        .map_err(StoreError::from)
    }

    pub fn list_metrics_daily(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<MetricsDailyRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{METRICS_SELECT} WHERE experiment_id = ?1 ORDER BY date DESC, COALESCE(source, '') ASC"
        ))?;
        let rows = stmt
            .query_map([experiment_id], parse_metrics_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Memos ───────────────────────────────────────────────────────

    pub fn insert_memo(
        &self,
        kind: MemoKind,
        experiment_id: &str,
        title: &str,
        body: &str,
    ) -> Result<MemoRecord, StoreError> {
        let now = now_ms();
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (experiment_id, title, body, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                kind.table()
            ),
            params![experiment_id, title, body, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(MemoRecord {
            id,
            experiment_id: experiment_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            created_at: now,
        })
    }

    pub fn list_memos(
        &self,
        kind: MemoKind,
        experiment_id: &str,
    ) -> Result<Vec<MemoRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, experiment_id, title, body, created_at
             FROM {} WHERE experiment_id = ?1 ORDER BY created_at DESC, id DESC",
            kind.table()
        ))?;
        let rows = stmt
            .query_map([experiment_id], |row| {
                Ok(MemoRecord {
                    id: row.get(0)?,
                    experiment_id: row.get(1)?,
                    title: row.get(2)?,
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn next_experiment_sequence(conn: &Connection, year: i32) -> Result<u32, StoreError> {
    let prefix = format!("SC-{year}-");
    let max_id: Option<String> = conn
        .query_row(
            "SELECT id FROM experiments WHERE id LIKE ?1 || '%'
             ORDER BY LENGTH(id) DESC, id DESC LIMIT 1",
            [&prefix],
            |row| row.get(0),
        )
        .optional()?;
    let next = max_id
        .and_then(|id| id.rsplit('-').next().and_then(|seq| seq.parse::<u32>().ok()))
        .map_or(1, |seq| seq + 1);
    Ok(next)
}

const EXPERIMENT_SELECT: &str = "SELECT id, name, slug, status, archetype,
    problem_statement, target_audience, value_proposition, market_size_estimate,
    min_signups, max_spend_cents, max_duration_days,
    kill_criteria, copy_pack, creative_brief,
    stripe_price_id, stripe_product_id, price_cents,
    created_at, updated_at, launched_at, decided_at
  FROM experiments";

fn fetch_experiment(
    conn: &Connection,
    id: &str,
) -> Result<Option<ExperimentRecord>, StoreError> {
    conn.query_row(
        &format!("{EXPERIMENT_SELECT} WHERE id = ?1"),
        [id],
        parse_experiment_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn parse_experiment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentRecord> {
    let status_raw: String = row.get(3)?;
    let archetype_raw: String = row.get(4)?;
    Ok(ExperimentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        status: ExperimentStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown experiment status '{status_raw}'").into(),
            )
        })?,
        archetype: Archetype::parse(&archetype_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown archetype '{archetype_raw}'").into(),
            )
        })?,
        problem_statement: row.get(5)?,
        target_audience: row.get(6)?,
        value_proposition: row.get(7)?,
        market_size_estimate: row.get(8)?,
        min_signups: row.get(9)?,
        max_spend_cents: row.get(10)?,
        max_duration_days: row.get(11)?,
        kill_criteria: parse_json_column(row, 12)?,
        copy_pack: parse_json_column(row, 13)?,
        creative_brief: parse_json_column(row, 14)?,
        stripe_price_id: row.get(15)?,
        stripe_product_id: row.get(16)?,
        price_cents: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
        launched_at: row.get(20)?,
        decided_at: row.get(21)?,
    })
}

fn parse_json_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(index)?;
    Ok(raw.and_then(|text| serde_json::from_str(&text).ok()))
}

const LEAD_SELECT: &str = "SELECT id, experiment_id, email, name, company, phone,
    custom_fields, status, utm_source, utm_medium, utm_campaign, utm_term, utm_content,
    referrer, session_id, visitor_id, ip_country, user_agent,
    stripe_payment_id, payment_amount_cents, payment_status, created_at, updated_at
  FROM leads";

fn fetch_lead(conn: &Connection, id: i64) -> Result<Option<LeadRecord>, StoreError> {
    conn.query_row(&format!("{LEAD_SELECT} WHERE id = ?1"), [id], parse_lead_row)
        .optional()
        .map_err(StoreError::from)
}

fn parse_lead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeadRecord> {
    Ok(LeadRecord {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        company: row.get(4)?,
        phone: row.get(5)?,
        custom_fields: parse_json_column(row, 6)?,
        status: row.get(7)?,
        utm_source: row.get(8)?,
        utm_medium: row.get(9)?,
        utm_campaign: row.get(10)?,
        utm_term: row.get(11)?,
        utm_content: row.get(12)?,
        referrer: row.get(13)?,
        session_id: row.get(14)?,
        visitor_id: row.get(15)?,
        ip_country: row.get(16)?,
        user_agent: row.get(17)?,
        stripe_payment_id: row.get(18)?,
        payment_amount_cents: row.get(19)?,
        payment_status: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

const PAYMENT_SELECT: &str = "SELECT id, experiment_id, lead_id, stripe_payment_intent_id,
    stripe_customer_id, stripe_charge_id, amount_cents, currency, status,
    payment_method_type, receipt_url, created_at, updated_at
  FROM payments";

fn parse_payment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRecord> {
    Ok(PaymentRecord {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        lead_id: row.get(2)?,
        stripe_payment_intent_id: row.get(3)?,
        stripe_customer_id: row.get(4)?,
        stripe_charge_id: row.get(5)?,
        amount_cents: row.get(6)?,
        currency: row.get(7)?,
        status: row.get(8)?,
        payment_method_type: row.get(9)?,
        receipt_url: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

const METRICS_SELECT: &str = "SELECT id, experiment_id, date, source, impressions, clicks,
    sessions, conversions, spend_cents, revenue_cents, ctr_bp, cvr_bp, cpl_cents, roas_bp,
    created_at, updated_at
  FROM metrics_daily";

fn parse_metrics_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricsDailyRecord> {
    Ok(MetricsDailyRecord {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        date: row.get(2)?,
        source: row.get(3)?,
        impressions: row.get(4)?,
        clicks: row.get(5)?,
        sessions: row.get(6)?,
        conversions: row.get(7)?,
        spend_cents: row.get(8)?,
        revenue_cents: row.get(9)?,
        ctr_bp: row.get(10)?,
        cvr_bp: row.get(11)?,
        cpl_cents: row.get(12)?,
        roas_bp: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open(None).expect("open in-memory store")
    }

    fn seed_experiment(store: &Store, slug: &str) -> ExperimentRecord {
        store
            .create_experiment(NewExperiment {
                name: format!("Experiment {slug}"),
                slug: slug.to_string(),
                archetype: Archetype::Waitlist,
                problem_statement: None,
                target_audience: None,
                value_proposition: None,
                market_size_estimate: None,
                min_signups: None,
                max_spend_cents: None,
                max_duration_days: None,
                kill_criteria: None,
                copy_pack: None,
                creative_brief: None,
                stripe_price_id: None,
                stripe_product_id: None,
                price_cents: None,
            })
            .expect("create experiment")
    }

    fn advance_to(store: &Store, id: &str, path: &[ExperimentStatus]) -> ExperimentRecord {
        let mut record = store.get_experiment(id).unwrap().unwrap();
        for status in path {
            record = store
                .update_experiment(
                    id,
                    ExperimentUpdate {
                        status: Some(*status),
                        ..Default::default()
                    },
                )
                .expect("transition");
        }
        record
    }

    #[test]
    fn experiment_ids_are_sequential_within_a_year() {
        let store = test_store();
        let first = seed_experiment(&store, "one");
        let second = seed_experiment(&store, "two");
        let year = Utc::now().year();
        assert_eq!(first.id, format!("SC-{year}-001"));
        assert_eq!(second.id, format!("SC-{year}-002"));
    }

    #[test]
    fn duplicate_slug_is_reported_as_slug_conflict() {
        let store = test_store();
        seed_experiment(&store, "same-slug");
        let result = store.create_experiment(NewExperiment {
            name: "Another".to_string(),
            slug: "same-slug".to_string(),
            archetype: Archetype::Presale,
            problem_statement: None,
            target_audience: None,
            value_proposition: None,
            market_size_estimate: None,
            min_signups: None,
            max_spend_cents: None,
            max_duration_days: None,
            kill_criteria: None,
            copy_pack: None,
            creative_brief: None,
            stripe_price_id: None,
            stripe_product_id: None,
            price_cents: None,
        });
        assert!(matches!(
            result,
            Err(StoreError::Conflict(Conflict::ExperimentSlug))
        ));
    }

    #[test]
    fn launched_at_is_stamped_once() {
        let store = test_store();
        let record = seed_experiment(&store, "stamping");
        use ExperimentStatus::*;
        let launched = advance_to(&store, &record.id, &[Preflight, Build, Launch]);
        let stamped = launched.launched_at.expect("launched_at set");

        // Same-status no-op must not re-stamp.
        let noop = store
            .update_experiment(
                &record.id,
                ExperimentUpdate {
                    status: Some(Launch),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(noop.launched_at, Some(stamped));
    }

    #[test]
    fn decided_at_is_stamped_on_decide() {
        let store = test_store();
        let record = seed_experiment(&store, "deciding");
        use ExperimentStatus::*;
        let decided = advance_to(&store, &record.id, &[Preflight, Build, Launch, Run, Decide]);
        assert!(decided.decided_at.is_some());
        assert!(decided.launched_at.is_some());
    }

    #[test]
    fn invalid_transition_is_rejected_with_context() {
        let store = test_store();
        let record = seed_experiment(&store, "guarded");
        let result = store.update_experiment(
            &record.id,
            ExperimentUpdate {
                status: Some(ExperimentStatus::Run),
                ..Default::default()
            },
        );
        let error = result.expect_err("transition must be rejected");
        assert_eq!(
            error.to_string(),
            "status transition draft -> run is not allowed"
        );
        match error {
            StoreError::InvalidTransition { current, requested } => {
                assert_eq!(current, ExperimentStatus::Draft);
                assert_eq!(requested, ExperimentStatus::Run);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_lead_email_is_a_lead_conflict() {
        let store = test_store();
        let record = seed_experiment(&store, "leads");
        let lead = NewLead {
            experiment_id: record.id.clone(),
            email: "test@example.com".to_string(),
            ..Default::default()
        };
        store.insert_lead(lead.clone()).expect("first insert");
        assert!(matches!(
            store.insert_lead(lead),
            Err(StoreError::Conflict(Conflict::LeadEmail))
        ));
    }

    #[test]
    fn payment_intent_uniqueness_is_enforced() {
        let store = test_store();
        let payment = NewPayment {
            experiment_id: None,
            lead_id: None,
            stripe_payment_intent_id: "pi_123".to_string(),
            stripe_customer_id: None,
            stripe_charge_id: None,
            amount_cents: 4900,
            currency: "usd".to_string(),
            payment_method_type: None,
            receipt_url: None,
        };
        store.insert_payment(payment.clone()).expect("first insert");
        assert!(matches!(
            store.insert_payment(payment),
            Err(StoreError::Conflict(Conflict::PaymentIntent))
        ));
    }

    #[test]
    fn metrics_upsert_replaces_existing_day() {
        let store = test_store();
        let record = seed_experiment(&store, "metrics");
        let base = MetricsDailyUpsert {
            experiment_id: record.id.clone(),
            date: "2026-08-01".to_string(),
            source: Some("meta".to_string()),
            impressions: 1000,
            clicks: 50,
            sessions: 40,
            conversions: 5,
            spend_cents: 2000,
            revenue_cents: 9800,
            ctr_bp: Some(500),
            cvr_bp: Some(1000),
            cpl_cents: Some(400),
            roas_bp: Some(49_000),
        };
        store.upsert_metrics_daily(base.clone()).expect("insert");
        let updated = store
            .upsert_metrics_daily(MetricsDailyUpsert {
                impressions: 2000,
                ..base
            })
            .expect("upsert");
        assert_eq!(updated.impressions, 2000);
        assert_eq!(store.list_metrics_daily(&record.id).unwrap().len(), 1);
    }

    #[test]
    fn lead_pagination_follows_cursor() {
        let store = test_store();
        let record = seed_experiment(&store, "paging");
        for index in 0..5 {
            store
                .insert_lead(NewLead {
                    experiment_id: record.id.clone(),
                    email: format!("lead{index}@example.com"),
                    ..Default::default()
                })
                .expect("insert lead");
        }
        let first = store.list_leads(&record.id, None, 2).unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        let cursor: i64 = first.next_cursor.as_deref().unwrap().parse().unwrap();
        let second = store.list_leads(&record.id, Some(cursor), 2).unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.items[0].id > cursor);
    }
}
