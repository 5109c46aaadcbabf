//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `init_schema()` checks the
//! current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                email TEXT,
                campaign_id TEXT NOT NULL,
                variant_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'new',
                current_step INTEGER NOT NULL DEFAULT 0,
                score REAL NOT NULL DEFAULT 0,
                last_action_at TEXT,
                score_decayed_at TEXT,
                opted_out INTEGER NOT NULL DEFAULT 0,
                stale_reason TEXT,
                context TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_state ON leads(state);
            CREATE INDEX IF NOT EXISTS idx_leads_campaign ON leads(campaign_id);
            CREATE INDEX IF NOT EXISTS idx_leads_address ON leads(address);

            CREATE TABLE IF NOT EXISTS outbound_actions (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL UNIQUE REFERENCES leads(id),
                campaign_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                variant_id TEXT NOT NULL,
                rendered_text TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                render_attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt_id TEXT,
                scheduled_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_actions_attempt ON outbound_actions(attempt_id);

            CREATE TABLE IF NOT EXISTS timers (
                lead_id TEXT NOT NULL REFERENCES leads(id),
                step INTEGER NOT NULL,
                due_at TEXT NOT NULL,
                PRIMARY KEY (lead_id, step)
            );
            CREATE INDEX IF NOT EXISTS idx_timers_due ON timers(due_at);

            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                step INTEGER NOT NULL,
                trigger TEXT NOT NULL,
                classification TEXT,
                reply_latency_secs INTEGER,
                reason TEXT,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_lead ON transitions(lead_id);
        "#,
    },
    Migration {
        version: 2,
        name: "scoring_and_idempotency",
        sql: r#"
            CREATE TABLE IF NOT EXISTS score_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                kind TEXT NOT NULL,
                delta REAL NOT NULL,
                score_after REAL NOT NULL,
                changed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_score_changes_lead ON score_changes(lead_id);

            CREATE TABLE IF NOT EXISTS processed_events (
                key TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "scored_transitions_and_messages",
        sql: r#"
            ALTER TABLE score_changes ADD COLUMN transition_id INTEGER;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_score_changes_transition
                ON score_changes(transition_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                direction TEXT NOT NULL,
                body TEXT NOT NULL,
                message_id TEXT UNIQUE,
                step INTEGER,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_lead ON messages(lead_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
