use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            title       TEXT NOT NULL,
            body        TEXT NOT NULL,
            data        TEXT NOT NULL DEFAULT '{}',
            sent_at     TEXT NOT NULL,
            read_at     TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON notifications(user_id, sent_at);

        CREATE TABLE IF NOT EXISTS emergency_alerts (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'active',
            message     TEXT,
            latitude    REAL,
            longitude   REAL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_helpers (
            id          TEXT PRIMARY KEY,
            alert_id    TEXT NOT NULL REFERENCES emergency_alerts(id),
            helper_id   TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'responding',
            latitude    REAL,
            longitude   REAL,
            accuracy    REAL,
            updated_at  TEXT NOT NULL,
            UNIQUE(alert_id, helper_id)
        );

        CREATE TABLE IF NOT EXISTS questions (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            title       TEXT NOT NULL,
            body        TEXT NOT NULL,
            ai_insight  TEXT,
            created_at  TEXT NOT NULL
        );

        -- Device-local key/value flags (e.g. permission prompt already shown)
        CREATE TABLE IF NOT EXISTS local_flags (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
