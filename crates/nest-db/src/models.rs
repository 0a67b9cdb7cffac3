//! Row mappers: SQLite rows -> nest-types models.
//!
//! Ids are stored as TEXT, timestamps through rusqlite's chrono support and
//! JSON payloads through its serde_json support.

use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use nest_types::models::{AlertHelper, EmergencyAlert, Notification, Question};

pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, user_id, title, body, data, sent_at, read_at";

pub(crate) const ALERT_COLUMNS: &str =
    "id, user_id, status, message, latitude, longitude, created_at, updated_at";

pub(crate) const HELPER_COLUMNS: &str =
    "id, alert_id, helper_id, status, latitude, longitude, accuracy, updated_at";

pub(crate) const QUESTION_COLUMNS: &str = "id, user_id, title, body, ai_insight, created_at";

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        data: row.get(4)?,
        sent_at: row.get(5)?,
        read_at: row.get(6)?,
    })
}

pub(crate) fn alert(row: &Row<'_>) -> rusqlite::Result<EmergencyAlert> {
    Ok(EmergencyAlert {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        status: row.get(2)?,
        message: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn helper(row: &Row<'_>) -> rusqlite::Result<AlertHelper> {
    Ok(AlertHelper {
        id: uuid_at(row, 0)?,
        alert_id: uuid_at(row, 1)?,
        helper_id: uuid_at(row, 2)?,
        status: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        accuracy: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn question(row: &Row<'_>) -> rusqlite::Result<Question> {
    Ok(Question {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        ai_insight: row.get(4)?,
        created_at: row.get(5)?,
    })
}
