use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;

use nest_types::models::{AlertHelper, EmergencyAlert, Notification, Question};

use crate::Database;
use crate::models::{
    self, ALERT_COLUMNS, HELPER_COLUMNS, NOTIFICATION_COLUMNS, QUESTION_COLUMNS,
};

impl Database {
    // -- Notifications --

    pub fn insert_notification(
        &self,
        id: Uuid,
        user_id: Uuid,
        title: &str,
        body: &str,
        data: &Value,
    ) -> Result<Notification> {
        self.with_conn(|conn| Ok(insert_notification_row(conn, id, user_id, title, body, data)?))
    }

    /// One notification per recipient, all or nothing.
    pub fn insert_notifications(
        &self,
        user_ids: &[Uuid],
        title: &str,
        body: &str,
        data: &Value,
    ) -> Result<Vec<Notification>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let rows = user_ids
                .iter()
                .map(|user_id| insert_notification_row(&tx, Uuid::new_v4(), *user_id, title, body, data))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            tx.commit()?;
            Ok(rows)
        })
    }

    /// Newest first.
    pub fn list_notifications(&self, user_id: Uuid, limit: u32) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                 WHERE user_id = ?1
                 ORDER BY sent_at DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![user_id.to_string(), limit], models::notification)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Set `read_at` on one of the user's notifications. An already-read
    /// notification keeps its first read time. Returns `None` when the row
    /// doesn't exist or belongs to someone else.
    pub fn mark_notification_read(&self, user_id: Uuid, id: Uuid) -> Result<Option<Notification>> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE notifications SET read_at = COALESCE(read_at, ?3)
                 WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id.to_string(), Utc::now()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            let row = conn.query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                [id.to_string()],
                models::notification,
            )?;
            Ok(Some(row))
        })
    }

    /// Mark every unread notification of the user read and return the rows
    /// that changed.
    pub fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE notifications SET read_at = ?2
                 WHERE user_id = ?1 AND read_at IS NULL
                 RETURNING {NOTIFICATION_COLUMNS}"
            ))?;
            let rows = stmt
                .query_map(params![user_id.to_string(), Utc::now()], models::notification)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Emergency alerts --

    pub fn create_alert(
        &self,
        id: Uuid,
        user_id: Uuid,
        latitude: Option<f64>,
        longitude: Option<f64>,
        message: Option<&str>,
    ) -> Result<EmergencyAlert> {
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO emergency_alerts (id, user_id, message, latitude, longitude, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id.to_string(), user_id.to_string(), message, latitude, longitude, now],
            )?;
            let row = conn.query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM emergency_alerts WHERE id = ?1"),
                [id.to_string()],
                models::alert,
            )?;
            Ok(row)
        })
    }

    pub fn get_alert(&self, id: Uuid) -> Result<Option<EmergencyAlert>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {ALERT_COLUMNS} FROM emergency_alerts WHERE id = ?1"),
                    [id.to_string()],
                    models::alert,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Register `helper_id` as responding to an alert. Idempotent: responding
    /// twice returns the existing row.
    pub fn add_alert_helper(&self, id: Uuid, alert_id: Uuid, helper_id: Uuid) -> Result<AlertHelper> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_helpers (id, alert_id, helper_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(alert_id, helper_id) DO NOTHING",
                params![id.to_string(), alert_id.to_string(), helper_id.to_string(), Utc::now()],
            )?;
            let row = conn.query_row(
                &format!(
                    "SELECT {HELPER_COLUMNS} FROM alert_helpers WHERE alert_id = ?1 AND helper_id = ?2"
                ),
                params![alert_id.to_string(), helper_id.to_string()],
                models::helper,
            )?;
            Ok(row)
        })
    }

    pub fn list_alert_helpers(&self, alert_id: Uuid) -> Result<Vec<AlertHelper>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HELPER_COLUMNS} FROM alert_helpers WHERE alert_id = ?1 ORDER BY updated_at"
            ))?;
            let rows = stmt
                .query_map([alert_id.to_string()], models::helper)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Requester position lives on the alert row itself, scoped to its owner.
    pub fn update_requester_location(
        &self,
        alert_id: Uuid,
        user_id: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<EmergencyAlert>> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE emergency_alerts SET latitude = ?3, longitude = ?4, updated_at = ?5
                 WHERE id = ?1 AND user_id = ?2",
                params![alert_id.to_string(), user_id.to_string(), latitude, longitude, Utc::now()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            let row = conn.query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM emergency_alerts WHERE id = ?1"),
                [alert_id.to_string()],
                models::alert,
            )?;
            Ok(Some(row))
        })
    }

    /// Helper position lives on the helper's own response row for the alert.
    pub fn update_helper_location(
        &self,
        alert_id: Uuid,
        helper_id: Uuid,
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
    ) -> Result<Option<AlertHelper>> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE alert_helpers SET latitude = ?3, longitude = ?4, accuracy = ?5, updated_at = ?6
                 WHERE alert_id = ?1 AND helper_id = ?2",
                params![
                    alert_id.to_string(),
                    helper_id.to_string(),
                    latitude,
                    longitude,
                    accuracy,
                    Utc::now()
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            let row = conn.query_row(
                &format!(
                    "SELECT {HELPER_COLUMNS} FROM alert_helpers WHERE alert_id = ?1 AND helper_id = ?2"
                ),
                params![alert_id.to_string(), helper_id.to_string()],
                models::helper,
            )?;
            Ok(Some(row))
        })
    }

    // -- Questions --

    pub fn insert_question(&self, id: Uuid, user_id: Uuid, title: &str, body: &str) -> Result<Question> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO questions (id, user_id, title, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), user_id.to_string(), title, body, Utc::now()],
            )?;
            let row = conn.query_row(
                &format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?1"),
                [id.to_string()],
                models::question,
            )?;
            Ok(row)
        })
    }

    pub fn get_question(&self, id: Uuid) -> Result<Option<Question>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?1"),
                    [id.to_string()],
                    models::question,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn set_question_insight(&self, id: Uuid, insight: &str) -> Result<Option<Question>> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE questions SET ai_insight = ?2 WHERE id = ?1",
                params![id.to_string(), insight],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            let row = conn.query_row(
                &format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?1"),
                [id.to_string()],
                models::question,
            )?;
            Ok(Some(row))
        })
    }

    // -- Local flags --

    pub fn get_flag(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM local_flags WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    pub fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO local_flags (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now()],
            )?;
            Ok(())
        })
    }
}

fn insert_notification_row(
    conn: &Connection,
    id: Uuid,
    user_id: Uuid,
    title: &str,
    body: &str,
    data: &Value,
) -> rusqlite::Result<Notification> {
    conn.execute(
        "INSERT INTO notifications (id, user_id, title, body, data, sent_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id.to_string(), user_id.to_string(), title, body, data, Utc::now()],
    )?;
    conn.query_row(
        &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
        [id.to_string()],
        models::notification,
    )
}
