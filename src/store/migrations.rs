//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_name TEXT,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                body_html TEXT,
                attachments TEXT NOT NULL DEFAULT '[]',
                received_at TEXT NOT NULL,
                category TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                ai_response TEXT,
                processed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
            CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);

            CREATE TABLE IF NOT EXISTS drafts (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id),
                provider_draft_id TEXT NOT NULL,
                response_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_drafts_message ON drafts(message_id);
            CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts(status);

            CREATE TABLE IF NOT EXISTS retry_queue (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                last_error TEXT NOT NULL DEFAULT '',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                next_retry_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_retry_status ON retry_queue(status);
            CREATE INDEX IF NOT EXISTS idx_retry_next ON retry_queue(next_retry_at);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT OR IGNORE INTO settings (key, value)
                VALUES ('polling_interval', '3'),
                       ('auto_reply_enabled', 'true');
        "#,
    },
    Migration {
        version: 2,
        name: "message_fts",
        // External-content FTS index over the searchable message columns.
        // The triggers fire inside the same transaction as the row write,
        // so the index can never drift from the table.
        sql: r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                sender, sender_name, subject, body,
                content='messages',
                content_rowid='rowid'
            );
            INSERT INTO messages_fts(rowid, sender, sender_name, subject, body)
                SELECT rowid, sender, COALESCE(sender_name, ''), subject, body FROM messages;

            CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, sender, sender_name, subject, body)
                VALUES (new.rowid, new.sender, COALESCE(new.sender_name, ''), new.subject, new.body);
            END;
            CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, sender, sender_name, subject, body)
                VALUES ('delete', old.rowid, old.sender, COALESCE(old.sender_name, ''), old.subject, old.body);
            END;
            CREATE TRIGGER IF NOT EXISTS messages_fts_update AFTER UPDATE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, sender, sender_name, subject, body)
                VALUES ('delete', old.rowid, old.sender, COALESCE(old.sender_name, ''), old.subject, old.body);
                INSERT INTO messages_fts(rowid, sender, sender_name, subject, body)
                VALUES (new.rowid, new.sender, COALESCE(new.sender_name, ''), new.subject, new.body);
            END;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` tracking table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
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
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

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
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Record a migration as applied.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
