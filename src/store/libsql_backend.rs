//! libSQL backend: async `LeadStore` implementation.
//!
//! Supports local file and in-memory databases. All reads share one
//! connection; multi-statement writes hold `write_lock` and run inside an
//! explicit transaction so they never interleave on that connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::lead::{
    ActionStatus, ConversationMessage, ConversationState, Lead, OutboundAction,
    ReplyClassification, StaleReason, TimerCommand, TransitionRecord,
};
use crate::store::migrations;
use crate::store::traits::{
    LeadFilter, LeadStore, ReplyTimer, ScoreChangeKind, TransitionWrite,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    /// Keeps the database open for as long as `conn` is in use.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes writers; a transaction on the shared connection must not
    /// pick up statements from other tasks.
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
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

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self, op: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))?;
        Ok(())
    }

    /// Commit on success, roll back on error. Returns the body's result.
    async fn finish<T>(
        &self,
        op: &str,
        result: Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        match result {
            Ok(value) => {
                self.conn()
                    .execute("COMMIT", ())
                    .await
                    .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn().execute("ROLLBACK", ()).await {
                    warn!(op, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn write_transition(&self, write: &TransitionWrite) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let lead = &write.lead;

        let updated = conn
            .execute(
                "UPDATE leads SET state = ?1, current_step = ?2, last_action_at = ?3, opted_out = ?4, stale_reason = ?5, updated_at = ?6 WHERE id = ?7",
                params![
                    lead.state.to_string(),
                    lead.current_step as i64,
                    opt_ts(lead.last_action_at),
                    lead.opted_out as i64,
                    opt_text(lead.stale_reason.as_ref().map(|r| r.as_str())),
                    ts(lead.updated_at),
                    lead.id.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition lead: {e}")))?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: lead.id.clone(),
            });
        }

        if let Some(action_id) = write.resolve_action {
            conn.execute(
                "DELETE FROM outbound_actions WHERE id = ?1",
                params![action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition resolve: {e}")))?;
        }

        if let Some((action_id, at)) = write.reschedule_action {
            conn.execute(
                "UPDATE outbound_actions SET status = 'queued', scheduled_at = ?1 WHERE id = ?2",
                params![ts(at), action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition reschedule: {e}")))?;
        }

        if let Some(action) = &write.new_action {
            insert_action(conn, action).await?;
        }

        match &write.timer {
            TimerCommand::Keep => {}
            TimerCommand::CancelAll => {
                conn.execute(
                    "DELETE FROM timers WHERE lead_id = ?1",
                    params![lead.id.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_transition timers: {e}")))?;
            }
            TimerCommand::Arm { step, due_at } => {
                conn.execute(
                    "DELETE FROM timers WHERE lead_id = ?1",
                    params![lead.id.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_transition timers: {e}")))?;
                conn.execute(
                    "INSERT INTO timers (lead_id, step, due_at) VALUES (?1, ?2, ?3)",
                    params![lead.id.clone(), *step as i64, ts(*due_at)],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("apply_transition arm: {e}")))?;
            }
        }

        let record = &write.record;
        conn.execute(
            "INSERT INTO transitions (lead_id, from_state, to_state, step, trigger, classification, reply_latency_secs, reason, occurred_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.lead_id.clone(),
                record.from.to_string(),
                record.to.to_string(),
                record.step as i64,
                record.trigger.clone(),
                opt_text(record.classification.as_ref().map(|c| c.as_str())),
                opt_int(record.reply_latency_secs),
                opt_text(record.reason.as_deref()),
                ts(record.occurred_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_transition history: {e}")))?;

        Ok(conn.last_insert_rowid())
    }

    async fn read_score(&self, op: &str, lead_id: &str) -> Result<Option<f64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT score FROM leads WHERE id = ?1", params![lead_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} read: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<f64>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("{op} parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op} read: {e}"))),
        }
    }

    async fn log_score_change(
        &self,
        lead_id: &str,
        kind: ScoreChangeKind,
        delta: f64,
        score_after: f64,
        at: DateTime<Utc>,
        transition_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO score_changes (lead_id, kind, delta, score_after, changed_at, transition_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![lead_id, kind.as_str(), delta, score_after, ts(at), opt_int(transition_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("score history: {e}")))?;
        Ok(())
    }

    async fn transition_scored(&self, transition_id: i64) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM score_changes WHERE transition_id = ?1",
                params![transition_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_score lookup: {e}")))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("add_score lookup: {e}"))),
        }
    }

    async fn increment_score(
        &self,
        lead_id: &str,
        delta: f64,
        kind: ScoreChangeKind,
        at: DateTime<Utc>,
        transition_id: Option<i64>,
    ) -> Result<Option<f64>, DatabaseError> {
        if let Some(id) = transition_id {
            if self.transition_scored(id).await? {
                return Ok(None);
            }
        }
        let updated = self
            .conn()
            .execute(
                "UPDATE leads SET score = score + ?1 WHERE id = ?2",
                params![delta, lead_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_score: {e}")))?;
        if updated == 0 {
            return Ok(None);
        }
        let Some(score) = self.read_score("add_score", lead_id).await? else {
            return Ok(None);
        };
        self.log_score_change(lead_id, kind, delta, score, at, transition_id)
            .await?;
        Ok(Some(score))
    }

    async fn decay_score(
        &self,
        lead_id: &str,
        penalty: f64,
        decayed_since: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, DatabaseError> {
        let Some(before) = self.read_score("apply_decay", lead_id).await? else {
            return Ok(None);
        };
        let updated = self
            .conn()
            .execute(
                "UPDATE leads SET score = MAX(0.0, score - ?1), score_decayed_at = ?2 WHERE id = ?3 AND score_decayed_at IS ?4",
                params![penalty, ts(at), lead_id, opt_ts(decayed_since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_decay: {e}")))?;
        if updated == 0 {
            return Ok(None);
        }
        let Some(after) = self.read_score("apply_decay", lead_id).await? else {
            return Ok(None);
        };
        self.log_score_change(lead_id, ScoreChangeKind::Decay, after - before, after, at, None)
            .await?;
        Ok(Some(after))
    }

    async fn query_leads(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => warn!("Skipping lead row: {e}"),
            }
        }
        Ok(leads)
    }

    async fn query_actions(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<OutboundAction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut actions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_action(&row) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping action row: {e}"),
            }
        }
        Ok(actions)
    }

    async fn action_counter(
        &self,
        op: &str,
        column: &str,
        action_id: Uuid,
    ) -> Result<Option<u32>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {column} FROM outbound_actions WHERE id = ?1"),
                params![action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{op} parse: {e}")))?;
                Ok(Some(n as u32))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps text comparison ordered.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn text(row: &libsql::Row, idx: i32, what: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{what}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, what: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{what}: {e}")))
}

const LEAD_COLUMNS: &str = "id, name, address, email, campaign_id, variant_id, state, current_step, score, last_action_at, score_decayed_at, opted_out, stale_reason, context, created_at, updated_at";

const ACTION_COLUMNS: &str = "id, lead_id, campaign_id, step, variant_id, rendered_text, attempts, render_attempts, status, attempt_id, scheduled_at, created_at, last_attempt_at";

const TRANSITION_COLUMNS: &str = "lead_id, from_state, to_state, step, trigger, classification, reply_latency_secs, reason, occurred_at, id";

/// Map a libsql Row to a Lead. Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let state_str: String = text(row, 6, "lead.state")?;
    let state: ConversationState = state_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let step: i64 = int(row, 7, "lead.current_step")?;
    let last_action: Option<String> = row.get(9).ok();
    let decayed: Option<String> = row.get(10).ok();
    let opted_out: i64 = row.get(11).unwrap_or(0);
    let stale_reason: Option<StaleReason> = row
        .get::<String>(12)
        .ok()
        .and_then(|s| s.parse().ok());
    let context_str: String = row.get(13).unwrap_or_default();
    let created_str: String = text(row, 14, "lead.created_at")?;
    let updated_str: String = text(row, 15, "lead.updated_at")?;

    Ok(Lead {
        id: text(row, 0, "lead.id")?,
        name: text(row, 1, "lead.name")?,
        address: text(row, 2, "lead.address")?,
        email: row.get(3).ok(),
        campaign_id: text(row, 4, "lead.campaign_id")?,
        variant_id: text(row, 5, "lead.variant_id")?,
        state,
        current_step: step as u32,
        score: row.get(8).unwrap_or(0.0),
        last_action_at: parse_optional_datetime(&last_action),
        score_decayed_at: parse_optional_datetime(&decayed),
        opted_out: opted_out != 0,
        stale_reason,
        context: serde_json::from_str(&context_str).unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an OutboundAction. Column order matches ACTION_COLUMNS.
fn row_to_action(row: &libsql::Row) -> Result<OutboundAction, DatabaseError> {
    let id_str: String = text(row, 0, "action.id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("action.id parse: {e}")))?;
    let step: i64 = int(row, 3, "action.step")?;
    let attempts: i64 = row.get(6).unwrap_or(0);
    let render_attempts: i64 = row.get(7).unwrap_or(0);
    let status_str: String = text(row, 8, "action.status")?;
    let status: ActionStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let scheduled_str: String = text(row, 10, "action.scheduled_at")?;
    let created_str: String = text(row, 11, "action.created_at")?;
    let last_attempt: Option<String> = row.get(12).ok();

    Ok(OutboundAction {
        id,
        lead_id: text(row, 1, "action.lead_id")?,
        campaign_id: text(row, 2, "action.campaign_id")?,
        step: step as u32,
        variant_id: text(row, 4, "action.variant_id")?,
        rendered_text: row.get(5).ok(),
        attempts: attempts as u32,
        render_attempts: render_attempts as u32,
        status,
        attempt_id: row.get(9).ok(),
        scheduled_at: parse_datetime(&scheduled_str),
        created_at: parse_datetime(&created_str),
        last_attempt_at: parse_optional_datetime(&last_attempt),
    })
}

fn row_to_timer(row: &libsql::Row) -> Result<ReplyTimer, DatabaseError> {
    let step: i64 = int(row, 1, "timer.step")?;
    let due_str: String = text(row, 2, "timer.due_at")?;
    Ok(ReplyTimer {
        lead_id: text(row, 0, "timer.lead_id")?,
        step: step as u32,
        due_at: parse_datetime(&due_str),
    })
}

fn row_to_transition(row: &libsql::Row) -> Result<TransitionRecord, DatabaseError> {
    let from_str: String = text(row, 1, "transition.from_state")?;
    let to_str: String = text(row, 2, "transition.to_state")?;
    let step: i64 = int(row, 3, "transition.step")?;
    let classification: Option<ReplyClassification> = row
        .get::<String>(5)
        .ok()
        .and_then(|s| s.parse().ok());
    let occurred_str: String = text(row, 8, "transition.occurred_at")?;

    Ok(TransitionRecord {
        lead_id: text(row, 0, "transition.lead_id")?,
        from: from_str.parse().map_err(DatabaseError::Serialization)?,
        to: to_str.parse().map_err(DatabaseError::Serialization)?,
        step: step as u32,
        trigger: text(row, 4, "transition.trigger")?,
        classification,
        reply_latency_secs: row.get::<i64>(6).ok(),
        reason: row.get(7).ok(),
        occurred_at: parse_datetime(&occurred_str),
        id: row.get::<i64>(9).ok(),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<ConversationMessage, DatabaseError> {
    let direction: String = text(row, 1, "message.direction")?;
    let at: String = text(row, 5, "message.sent_at")?;
    Ok(ConversationMessage {
        lead_id: text(row, 0, "message.lead_id")?,
        direction: direction.parse().map_err(DatabaseError::Serialization)?,
        body: text(row, 2, "message.body")?,
        message_id: row.get(3).ok(),
        step: row.get::<i64>(4).ok().map(|n| n as u32),
        at: parse_datetime(&at),
    })
}

async fn insert_action(conn: &Connection, action: &OutboundAction) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO outbound_actions ({ACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            action.id.to_string(),
            action.lead_id.clone(),
            action.campaign_id.clone(),
            action.step as i64,
            action.variant_id.clone(),
            opt_text(action.rendered_text.as_deref()),
            action.attempts as i64,
            action.render_attempts as i64,
            action.status.as_str(),
            opt_text(action.attempt_id.as_deref()),
            ts(action.scheduled_at),
            ts(action.created_at),
            opt_ts(action.last_attempt_at),
        ],
    )
    .await
    .map_err(|e| {
        let msg = e.to_string();
        if msg.contains("UNIQUE") {
            DatabaseError::Constraint(format!(
                "lead {} already has an unresolved action",
                action.lead_id
            ))
        } else {
            DatabaseError::Query(format!("insert_action: {msg}"))
        }
    })?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl LeadStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::init_schema(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    lead.id.clone(),
                    lead.name.clone(),
                    lead.address.clone(),
                    opt_text(lead.email.as_deref()),
                    lead.campaign_id.clone(),
                    lead.variant_id.clone(),
                    lead.state.to_string(),
                    lead.current_step as i64,
                    lead.score,
                    opt_ts(lead.last_action_at),
                    opt_ts(lead.score_decayed_at),
                    lead.opted_out as i64,
                    opt_text(lead.stale_reason.as_ref().map(|r| r.as_str())),
                    lead.context.to_string(),
                    ts(lead.created_at),
                    ts(lead.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_lead: {e}")))?;

        debug!(lead_id = %lead.id, inserted = inserted > 0, "Lead insert");
        Ok(inserted > 0)
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut leads = self
            .query_leads(
                "get_lead",
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                vec![libsql::Value::Text(id.to_string())],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn find_lead_by_address(&self, address: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut leads = self
            .query_leads(
                "find_lead_by_address",
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE address = ?1 ORDER BY (state IN ('converted', 'opted_out')) ASC, updated_at DESC LIMIT 1"
                ),
                vec![libsql::Value::Text(address.to_string())],
            )
            .await?;
        Ok(leads.pop())
    }

    async fn list_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(state) = &filter.state {
            if state == "sent" {
                clauses.push("state LIKE 'sent:%'".to_string());
            } else {
                values.push(libsql::Value::Text(state.clone()));
                clauses.push(format!("state = ?{}", values.len()));
            }
        }
        if let Some(campaign) = &filter.campaign_id {
            values.push(libsql::Value::Text(campaign.clone()));
            clauses.push(format!("campaign_id = ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        values.push(libsql::Value::Integer(filter.limit.unwrap_or(100) as i64));
        let sql = format!(
            "SELECT {LEAD_COLUMNS} FROM leads{where_clause} ORDER BY created_at DESC LIMIT ?{}",
            values.len()
        );

        self.query_leads("list_leads", &sql, values).await
    }

    async fn list_live_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_live_leads",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE state NOT IN ('converted', 'opted_out') ORDER BY created_at ASC"
            ),
            Vec::new(),
        )
        .await
    }

    async fn state_counts(&self) -> Result<Vec<(String, i64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT state, COUNT(*) FROM leads GROUP BY state ORDER BY state",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("state_counts: {e}")))?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let state: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("state_counts parse: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("state_counts parse: {e}")))?;
            counts.push((state, count));
        }
        Ok(counts)
    }

    async fn apply_transition(&self, write: &TransitionWrite) -> Result<i64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.begin("apply_transition").await?;
        let result = self.write_transition(write).await;
        let id = self.finish("apply_transition", result).await?;

        debug!(
            lead_id = %write.lead.id,
            from = %write.record.from,
            to = %write.record.to,
            transition_id = id,
            "Transition persisted"
        );
        Ok(id)
    }

    // ── Outbound actions ────────────────────────────────────────────

    async fn get_pending_action(
        &self,
        lead_id: &str,
    ) -> Result<Option<OutboundAction>, DatabaseError> {
        let mut actions = self
            .query_actions(
                "get_pending_action",
                &format!("SELECT {ACTION_COLUMNS} FROM outbound_actions WHERE lead_id = ?1"),
                vec![libsql::Value::Text(lead_id.to_string())],
            )
            .await?;
        Ok(actions.pop())
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<OutboundAction>, DatabaseError> {
        let mut actions = self
            .query_actions(
                "get_action",
                &format!("SELECT {ACTION_COLUMNS} FROM outbound_actions WHERE id = ?1"),
                vec![libsql::Value::Text(id.to_string())],
            )
            .await?;
        Ok(actions.pop())
    }

    async fn find_action_by_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<OutboundAction>, DatabaseError> {
        let mut actions = self
            .query_actions(
                "find_action_by_attempt",
                &format!("SELECT {ACTION_COLUMNS} FROM outbound_actions WHERE attempt_id = ?1"),
                vec![libsql::Value::Text(attempt_id.to_string())],
            )
            .await?;
        Ok(actions.pop())
    }

    async fn list_unresolved_actions(&self) -> Result<Vec<OutboundAction>, DatabaseError> {
        self.query_actions(
            "list_unresolved_actions",
            &format!("SELECT {ACTION_COLUMNS} FROM outbound_actions ORDER BY scheduled_at ASC"),
            Vec::new(),
        )
        .await
    }

    async fn save_render(&self, action_id: Uuid, text: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE outbound_actions SET rendered_text = ?1 WHERE id = ?2",
                params![text, action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_render: {e}")))?;
        Ok(updated > 0)
    }

    async fn record_render_failure(
        &self,
        action_id: Uuid,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE outbound_actions SET render_attempts = render_attempts + 1, scheduled_at = ?1 WHERE id = ?2",
                params![ts(retry_at), action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_render_failure: {e}")))?;
        if updated == 0 {
            return Ok(None);
        }
        self.action_counter("record_render_failure", "render_attempts", action_id)
            .await
    }

    async fn record_attempt(
        &self,
        action_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE outbound_actions SET attempts = attempts + 1, status = 'sending', attempt_id = NULL, last_attempt_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![ts(at), action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_attempt: {e}")))?;
        if updated == 0 {
            return Ok(None);
        }
        self.action_counter("record_attempt", "attempts", action_id)
            .await
    }

    async fn mark_sent(&self, action_id: Uuid, attempt_id: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE outbound_actions SET status = 'sent', attempt_id = ?1 WHERE id = ?2",
                params![attempt_id, action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_sent: {e}")))?;
        Ok(updated > 0)
    }

    async fn requeue_action(&self, action_id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE outbound_actions SET status = 'queued', attempt_id = NULL WHERE id = ?1",
                params![action_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_action: {e}")))?;
        Ok(updated > 0)
    }

    // ── Timers ──────────────────────────────────────────────────────

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<ReplyTimer>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT lead_id, step, due_at FROM timers WHERE due_at <= ?1 ORDER BY due_at ASC",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_timers: {e}")))?;

        let mut timers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_timer(&row) {
                Ok(timer) => timers.push(timer),
                Err(e) => warn!("Skipping timer row: {e}"),
            }
        }
        Ok(timers)
    }

    async fn timers_for_lead(&self, lead_id: &str) -> Result<Vec<ReplyTimer>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT lead_id, step, due_at FROM timers WHERE lead_id = ?1 ORDER BY step ASC",
                params![lead_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("timers_for_lead: {e}")))?;

        let mut timers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_timer(&row) {
                Ok(timer) => timers.push(timer),
                Err(e) => warn!("Skipping timer row: {e}"),
            }
        }
        Ok(timers)
    }

    async fn arm_timer(&self, timer: &ReplyTimer) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO timers (lead_id, step, due_at) VALUES (?1, ?2, ?3)",
                params![timer.lead_id.clone(), timer.step as i64, ts(timer.due_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("arm_timer: {e}")))?;
        Ok(())
    }

    async fn delete_timer(&self, lead_id: &str, step: u32) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "DELETE FROM timers WHERE lead_id = ?1 AND step = ?2",
                params![lead_id, step as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_timer: {e}")))?;
        Ok(())
    }

    // ── History & scoring ───────────────────────────────────────────

    async fn list_transitions(
        &self,
        lead_id: &str,
        limit: usize,
    ) -> Result<Vec<TransitionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TRANSITION_COLUMNS} FROM transitions WHERE lead_id = ?1 ORDER BY id ASC LIMIT ?2"),
                params![lead_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_transition(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping transition row: {e}"),
            }
        }
        Ok(records)
    }

    async fn transitions_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TransitionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TRANSITION_COLUMNS} FROM transitions WHERE id > ?1 ORDER BY id ASC LIMIT ?2"),
                params![after_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transitions_after: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_transition(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping transition row: {e}"),
            }
        }
        Ok(records)
    }

    async fn latest_transition_id(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COALESCE(MAX(id), 0) FROM transitions", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_transition_id: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("latest_transition_id parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("latest_transition_id: {e}"))),
        }
    }

    async fn add_score(
        &self,
        lead_id: &str,
        delta: f64,
        kind: ScoreChangeKind,
        at: DateTime<Utc>,
        transition_id: Option<i64>,
    ) -> Result<Option<f64>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.begin("add_score").await?;
        let result = self
            .increment_score(lead_id, delta, kind, at, transition_id)
            .await;
        self.finish("add_score", result).await
    }

    async fn apply_decay(
        &self,
        lead_id: &str,
        penalty: f64,
        decayed_since: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.begin("apply_decay").await?;
        let result = self.decay_score(lead_id, penalty, decayed_since, at).await;
        self.finish("apply_decay", result).await
    }

    // ── Conversation log ────────────────────────────────────────────

    async fn append_message(&self, message: &ConversationMessage) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages (lead_id, direction, body, message_id, step, sent_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.lead_id.clone(),
                    message.direction.as_str(),
                    message.body.clone(),
                    opt_text(message.message_id.as_deref()),
                    opt_int(message.step.map(i64::from)),
                    ts(message.at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;
        Ok(inserted > 0)
    }

    async fn conversation(
        &self,
        lead_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT lead_id, direction, body, message_id, step, sent_at FROM (SELECT * FROM messages WHERE lead_id = ?1 ORDER BY id DESC LIMIT ?2) ORDER BY id ASC",
                params![lead_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conversation: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    // ── Event idempotency ───────────────────────────────────────────

    async fn has_event_key(&self, key: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM processed_events WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("has_event_key: {e}")))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("has_event_key: {e}"))),
        }
    }

    async fn record_event_key(&self, key: &str, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processed_events (key, processed_at) VALUES (?1, ?2)",
                params![key, ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_event_key: {e}")))?;
        Ok(inserted > 0)
    }

    async fn release_event_key(&self, key: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute("DELETE FROM processed_events WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("release_event_key: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::{MessageDirection, NewLead};
    use chrono::Duration;

    fn lead(id: &str) -> Lead {
        Lead::new(
            NewLead {
                id: id.into(),
                name: "Ana".into(),
                address: "15550001111".into(),
                email: Some("ana@example.com".into()),
                campaign_id: "spring".into(),
                context: serde_json::json!({ "interest": "solar" }),
            },
            "control".into(),
            Utc::now(),
        )
    }

    fn record(lead: &Lead, to: ConversationState) -> TransitionRecord {
        TransitionRecord {
            lead_id: lead.id.clone(),
            from: lead.state,
            to,
            step: lead.current_step,
            trigger: "ingested".into(),
            classification: None,
            reply_latency_secs: None,
            reason: None,
            occurred_at: Utc::now(),
            id: None,
        }
    }

    async fn transition_to(db: &LibSqlBackend, l: &mut Lead, to: ConversationState) -> i64 {
        let rec = record(l, to);
        l.state = to;
        db.apply_transition(&TransitionWrite {
            lead: l.clone(),
            resolve_action: None,
            reschedule_action: None,
            new_action: None,
            timer: TimerCommand::Keep,
            record: rec,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn insert_lead_is_idempotent() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let l = lead("l1");
        assert!(db.insert_lead(&l).await.unwrap());
        assert!(!db.insert_lead(&l).await.unwrap());

        let loaded = db.get_lead("l1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ConversationState::New);
        assert_eq!(loaded.email.as_deref(), Some("ana@example.com"));
        assert_eq!(loaded.context["interest"], "solar");
        assert!(db.get_lead("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_transition_writes_everything() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut l = lead("l1");
        db.insert_lead(&l).await.unwrap();

        let rec = record(&l, ConversationState::AwaitingFirstSend);
        l.state = ConversationState::AwaitingFirstSend;
        let action = OutboundAction::new(&l, 0, Utc::now());
        let due = Utc::now() + Duration::hours(1);
        db.apply_transition(&TransitionWrite {
            lead: l.clone(),
            resolve_action: None,
            reschedule_action: None,
            new_action: Some(action.clone()),
            timer: TimerCommand::Arm { step: 0, due_at: due },
            record: rec,
        })
        .await
        .unwrap();

        let loaded = db.get_lead("l1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ConversationState::AwaitingFirstSend);
        let pending = db.get_pending_action("l1").await.unwrap().unwrap();
        assert_eq!(pending.id, action.id);
        assert_eq!(pending.status, ActionStatus::Queued);
        assert_eq!(db.timers_for_lead("l1").await.unwrap().len(), 1);
        assert_eq!(db.list_transitions("l1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_unresolved_action_is_rejected_atomically() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut l = lead("l1");
        db.insert_lead(&l).await.unwrap();
        l.state = ConversationState::AwaitingFirstSend;

        let first = TransitionWrite {
            lead: l.clone(),
            resolve_action: None,
            reschedule_action: None,
            new_action: Some(OutboundAction::new(&l, 0, Utc::now())),
            timer: TimerCommand::Keep,
            record: record(&l, ConversationState::AwaitingFirstSend),
        };
        db.apply_transition(&first).await.unwrap();

        let mut again = first.clone();
        again.new_action = Some(OutboundAction::new(&l, 1, Utc::now()));
        again.lead.current_step = 1;
        let err = db.apply_transition(&again).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));

        // Rolled back: lead step and history untouched.
        let loaded = db.get_lead("l1").await.unwrap().unwrap();
        assert_eq!(loaded.current_step, 0);
        assert_eq!(db.list_transitions("l1", 10).await.unwrap().len(), 1);
        assert_eq!(db.list_unresolved_actions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attempts_only_start_from_queued() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut l = lead("l1");
        db.insert_lead(&l).await.unwrap();
        l.state = ConversationState::AwaitingFirstSend;
        let action = OutboundAction::new(&l, 0, Utc::now());
        db.apply_transition(&TransitionWrite {
            lead: l.clone(),
            resolve_action: None,
            reschedule_action: None,
            new_action: Some(action.clone()),
            timer: TimerCommand::Keep,
            record: record(&l, ConversationState::AwaitingFirstSend),
        })
        .await
        .unwrap();

        assert_eq!(db.record_attempt(action.id, Utc::now()).await.unwrap(), Some(1));
        assert_eq!(db.record_attempt(action.id, Utc::now()).await.unwrap(), None);
        assert!(db.mark_sent(action.id, "SM123").await.unwrap());

        let found = db.find_action_by_attempt("SM123").await.unwrap().unwrap();
        assert_eq!(found.id, action.id);
        assert_eq!(found.status, ActionStatus::Sent);
    }

    #[tokio::test]
    async fn due_timers_respect_time() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_lead(&lead("l1")).await.unwrap();
        let now = Utc::now();
        db.arm_timer(&ReplyTimer {
            lead_id: "l1".into(),
            step: 0,
            due_at: now + Duration::minutes(5),
        })
        .await
        .unwrap();

        assert!(db.due_timers(now).await.unwrap().is_empty());
        assert_eq!(db.due_timers(now + Duration::minutes(5)).await.unwrap().len(), 1);

        db.delete_timer("l1", 0).await.unwrap();
        assert!(db.due_timers(now + Duration::days(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn score_changes_accumulate_and_decay() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_lead(&lead("l1")).await.unwrap();
        let now = Utc::now();

        let score = db
            .add_score("l1", 1.5, ScoreChangeKind::Delivered, now, None)
            .await
            .unwrap();
        assert_eq!(score, Some(1.5));
        assert_eq!(db.apply_decay("l1", 1.0, None, now).await.unwrap(), Some(0.5));

        let loaded = db.get_lead("l1").await.unwrap().unwrap();
        assert!((loaded.score - 0.5).abs() < 1e-9);
        assert!(loaded.score_decayed_at.is_some());

        // Floored at zero.
        let later = now + Duration::days(1);
        assert_eq!(
            db.apply_decay("l1", 5.0, loaded.score_decayed_at, later)
                .await
                .unwrap(),
            Some(0.0)
        );
        assert_eq!(
            db.add_score("ghost", 1.0, ScoreChangeKind::Delivered, now, None)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn decay_keeps_concurrent_increments() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_lead(&lead("l1")).await.unwrap();
        let now = Utc::now();
        db.add_score("l1", 10.0, ScoreChangeKind::PositiveReply, now, None)
            .await
            .unwrap();

        // A reader snapshots the lead, then an increment lands before it decays.
        let snapshot = db.get_lead("l1").await.unwrap().unwrap();
        db.add_score("l1", 5.0, ScoreChangeKind::PositiveReply, now, None)
            .await
            .unwrap();
        let decayed = db
            .apply_decay("l1", 2.0, snapshot.score_decayed_at, now)
            .await
            .unwrap();
        assert_eq!(decayed, Some(13.0));

        // A second reader holding the same stale anchor does not decay again.
        assert_eq!(
            db.apply_decay("l1", 2.0, snapshot.score_decayed_at, now)
                .await
                .unwrap(),
            None
        );
        assert!((db.get_lead("l1").await.unwrap().unwrap().score - 13.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn transition_is_scored_once() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut l = lead("l1");
        db.insert_lead(&l).await.unwrap();
        let id = transition_to(&db, &mut l, ConversationState::AwaitingFirstSend).await;
        let now = Utc::now();

        assert_eq!(
            db.add_score("l1", 1.0, ScoreChangeKind::Delivered, now, Some(id))
                .await
                .unwrap(),
            Some(1.0)
        );
        assert_eq!(
            db.add_score("l1", 1.0, ScoreChangeKind::Delivered, now, Some(id))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn transitions_page_by_row_id() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert_eq!(db.latest_transition_id().await.unwrap(), 0);

        let mut l = lead("l1");
        db.insert_lead(&l).await.unwrap();
        let first = transition_to(&db, &mut l, ConversationState::AwaitingFirstSend).await;
        let second = transition_to(&db, &mut l, ConversationState::Sent(0)).await;
        assert!(second > first);
        assert_eq!(db.latest_transition_id().await.unwrap(), second);

        let page = db.transitions_after(first, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, Some(second));
        assert_eq!(page[0].to, ConversationState::Sent(0));
        assert_eq!(db.transitions_after(0, 1).await.unwrap()[0].id, Some(first));
    }

    #[tokio::test]
    async fn conversation_keeps_latest_messages_in_order() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_lead(&lead("l1")).await.unwrap();
        let start = Utc::now();
        for n in 0..4 {
            let direction = if n % 2 == 0 {
                MessageDirection::Outbound
            } else {
                MessageDirection::Inbound
            };
            let stored = db
                .append_message(&ConversationMessage {
                    lead_id: "l1".into(),
                    direction,
                    body: format!("message {n}"),
                    message_id: Some(format!("SM{n}")),
                    step: (direction == MessageDirection::Outbound).then_some(n),
                    at: start + Duration::minutes(n as i64),
                })
                .await
                .unwrap();
            assert!(stored);
        }

        let redelivered = ConversationMessage {
            lead_id: "l1".into(),
            direction: MessageDirection::Inbound,
            body: "message 3".into(),
            message_id: Some("SM3".into()),
            step: None,
            at: start,
        };
        assert!(!db.append_message(&redelivered).await.unwrap());

        let recent = db.conversation("l1", 3).await.unwrap();
        let bodies: Vec<&str> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["message 1", "message 2", "message 3"]);
        assert_eq!(recent[1].step, Some(2));
        assert_eq!(recent[2].prompt_line(), "inbound: message 3");
    }

    #[tokio::test]
    async fn event_keys_dedupe_and_release() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        assert!(!db.has_event_key("SM1:delivered").await.unwrap());
        assert!(db.record_event_key("SM1:delivered", now).await.unwrap());
        assert!(db.has_event_key("SM1:delivered").await.unwrap());
        assert!(!db.record_event_key("SM1:delivered", now).await.unwrap());
        db.release_event_key("SM1:delivered").await.unwrap();
        assert!(db.record_event_key("SM1:delivered", now).await.unwrap());
    }

    #[tokio::test]
    async fn list_leads_filters_sent_states() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut a = lead("a");
        db.insert_lead(&a).await.unwrap();
        db.insert_lead(&lead("b")).await.unwrap();

        let rec = record(&a, ConversationState::Sent(1));
        a.state = ConversationState::Sent(1);
        db.apply_transition(&TransitionWrite {
            lead: a,
            resolve_action: None,
            reschedule_action: None,
            new_action: None,
            timer: TimerCommand::Keep,
            record: rec,
        })
        .await
        .unwrap();

        let sent = db
            .list_leads(&LeadFilter {
                state: Some("sent".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, "a");

        let fresh = db
            .list_leads(&LeadFilter {
                state: Some("new".into()),
                campaign_id: Some("spring".into()),
                limit: Some(10),
            })
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }
}
