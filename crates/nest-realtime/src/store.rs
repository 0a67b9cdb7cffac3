use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use nest_db::Database;
use nest_types::events::RowChange;
use nest_types::models::{AlertRole, LocationSample, Notification};

use crate::error::RealtimeError;
use crate::hub::Hub;

/// Notification rows of the signed-in user.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn list_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>, RealtimeError>;

    async fn mark_read(&self, user_id: Uuid, id: Uuid) -> Result<Option<Notification>, RealtimeError>;

    /// Returns the number of rows that changed.
    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, RealtimeError>;
}

/// The row a live-location write lands on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationTarget {
    pub alert_id: Uuid,
    pub role: AlertRole,
    pub actor_id: Uuid,
}

#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn write_location(&self, target: &LocationTarget, sample: &LocationSample) -> Result<(), RealtimeError>;
}

/// Small persisted key/value flags local to the device.
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get_flag(&self, key: &str) -> Result<Option<String>, RealtimeError>;

    async fn set_flag(&self, key: &str, value: &str) -> Result<(), RealtimeError>;
}

pub const NOTIFICATIONS_PAGE: u32 = 50;

/// All three stores on top of the SQLite database. When a hub is attached,
/// every write is published as a row change.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
    feed: Option<Hub>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, feed: None }
    }

    pub fn with_feed(mut self, hub: Hub) -> Self {
        self.feed = Some(hub);
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RealtimeError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(RealtimeError::store)?
            .map_err(RealtimeError::store)
    }

    fn publish_update<T: serde::Serialize>(&self, table: &str, row: &T) {
        let Some(hub) = &self.feed else {
            return;
        };
        match serde_json::to_value(row) {
            Ok(value) => {
                hub.publish_change(RowChange::update(table, value));
            }
            Err(e) => debug!("could not encode {} row for the change feed: {}", table, e),
        }
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn list_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>, RealtimeError> {
        self.blocking(move |db| db.list_notifications(user_id, NOTIFICATIONS_PAGE))
            .await
    }

    async fn mark_read(&self, user_id: Uuid, id: Uuid) -> Result<Option<Notification>, RealtimeError> {
        let row = self
            .blocking(move |db| db.mark_notification_read(user_id, id))
            .await?;
        if let Some(row) = &row {
            self.publish_update("notifications", row);
        }
        Ok(row)
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, RealtimeError> {
        let rows = self
            .blocking(move |db| db.mark_all_notifications_read(user_id))
            .await?;
        for row in &rows {
            self.publish_update("notifications", row);
        }
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl LocationStore for SqliteStore {
    async fn write_location(&self, target: &LocationTarget, sample: &LocationSample) -> Result<(), RealtimeError> {
        let LocationTarget { alert_id, role, actor_id } = target.clone();
        let sample = *sample;

        match role {
            AlertRole::Requester => {
                let row = self
                    .blocking(move |db| {
                        db.update_requester_location(alert_id, actor_id, sample.latitude, sample.longitude)
                    })
                    .await?
                    .ok_or_else(|| RealtimeError::store(format!("no alert {alert_id} owned by {actor_id}")))?;
                self.publish_update("emergency_alerts", &row);
            }
            AlertRole::Helper => {
                let row = self
                    .blocking(move |db| {
                        db.update_helper_location(
                            alert_id,
                            actor_id,
                            sample.latitude,
                            sample.longitude,
                            sample.accuracy,
                        )
                    })
                    .await?
                    .ok_or_else(|| {
                        RealtimeError::store(format!("{actor_id} is not helping with alert {alert_id}"))
                    })?;
                self.publish_update("alert_helpers", &row);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlagStore for SqliteStore {
    async fn get_flag(&self, key: &str) -> Result<Option<String>, RealtimeError> {
        let key = key.to_string();
        self.blocking(move |db| db.get_flag(&key)).await
    }

    async fn set_flag(&self, key: &str, value: &str) -> Result<(), RealtimeError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |db| db.set_flag(&key, &value)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use nest_types::events::{ChangeBinding, ChangeFilter, RealtimeMessage};
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn helper_write_lands_on_helper_row_and_is_published() {
        let hub = Hub::default();
        let store = store().with_feed(hub.clone());
        let db = store.database().clone();

        let requester = Uuid::new_v4();
        let helper = Uuid::new_v4();
        let alert = db
            .create_alert(Uuid::new_v4(), requester, Some(10.0), Some(20.0), None)
            .unwrap();
        db.add_alert_helper(Uuid::new_v4(), alert.id, helper).unwrap();

        let (_channel, mut events) = hub
            .open(
                ChannelConfig::new("alert")
                    .with_binding(ChangeBinding::new("alert_helpers", ChangeFilter::Update)),
            )
            .unwrap();
        events.next().await; // Subscribed

        let target = LocationTarget {
            alert_id: alert.id,
            role: AlertRole::Helper,
            actor_id: helper,
        };
        store
            .write_location(&target, &LocationSample::new(11.0, 21.0).with_accuracy(5.0))
            .await
            .unwrap();

        let helpers = db.list_alert_helpers(alert.id).unwrap();
        assert_eq!(helpers[0].latitude, Some(11.0));
        assert_eq!(helpers[0].accuracy, Some(5.0));
        let alert_row = db.get_alert(alert.id).unwrap().unwrap();
        assert_eq!(alert_row.latitude, Some(10.0));

        match events.next().await {
            Some(RealtimeMessage::RowChange(change)) => {
                assert_eq!(change.new.unwrap()["helper_id"], json!(helper.to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_for_unknown_helper_is_a_store_error() {
        let store = store();
        let target = LocationTarget {
            alert_id: Uuid::new_v4(),
            role: AlertRole::Helper,
            actor_id: Uuid::new_v4(),
        };
        let err = store
            .write_location(&target, &LocationSample::new(0.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Store(_)));
    }

    #[tokio::test]
    async fn flags_persist() {
        let store = store();
        assert_eq!(store.get_flag("seen").await.unwrap(), None);
        store.set_flag("seen", "true").await.unwrap();
        store.set_flag("seen", "yes").await.unwrap();
        assert_eq!(store.get_flag("seen").await.unwrap().as_deref(), Some("yes"));
    }
}
