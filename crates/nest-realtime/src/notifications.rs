use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nest_types::events::{ChangeFilter, RowChange};
use nest_types::filter::RowFilter;
use nest_types::models::Notification;

use crate::cache::{QueryCache, QueryKey};
use crate::error::RealtimeError;
use crate::registry::{ChannelRegistry, FeedGuard, Subscription};
use crate::store::{FlagStore, NotificationStore};

/// Persisted once the OS permission prompt has been offered.
pub const PROMPT_FLAG: &str = "notification_prompt_shown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// Not asked yet.
    Undetermined,
}

/// A system notification raised on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAlert {
    pub id: Uuid,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Info,
    Error,
}

/// Transient in-app banner.
#[derive(Debug, Clone, PartialEq)]
pub struct Toast {
    pub kind: ToastKind,
    pub title: String,
    pub body: String,
}

impl Toast {
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Info,
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn error(body: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            title: "Error".to_string(),
            body: body.into(),
        }
    }
}

/// Device-side notification surface.
#[async_trait]
pub trait LocalNotifier: Send + Sync {
    fn permission(&self) -> NotificationPermission;

    /// Show the OS permission prompt.
    async fn request_permission(&self) -> NotificationPermission;

    fn show_alert(&self, alert: LocalAlert);

    fn toast(&self, toast: Toast);
}

pub fn notifications_key(user_id: Uuid) -> QueryKey {
    QueryKey::new(["notifications".to_string(), user_id.to_string()])
}

/// Count of notifications without `read_at`.
pub fn unread_count(notifications: &[Notification]) -> usize {
    notifications.iter().filter(|n| n.is_unread()).count()
}

/// Surfaces new notification rows for the signed-in user and owns the
/// read-state writes.
pub struct NotificationRelay {
    user_id: Uuid,
    key: QueryKey,
    cache: QueryCache,
    store: Arc<dyn NotificationStore>,
    notifier: Arc<dyn LocalNotifier>,
    _feed: FeedGuard,
}

impl NotificationRelay {
    pub fn start(
        registry: &ChannelRegistry,
        store: Arc<dyn NotificationStore>,
        notifier: Arc<dyn LocalNotifier>,
        user_id: Option<Uuid>,
    ) -> Result<Self, RealtimeError> {
        let user_id = user_id.ok_or(RealtimeError::AuthRequired)?;
        let key = notifications_key(user_id);

        let on_insert = notifier.clone();
        let subscription = Subscription::new("notifications", ChangeFilter::Insert)
            .filter(RowFilter::eq("user_id", user_id))
            .invalidate(key.clone())
            .on_change(move |change| announce(on_insert.as_ref(), change));
        let feed = registry.mount(&format!("notifications:{user_id}"), vec![subscription])?;

        info!("notification relay started for {}", user_id);
        Ok(Self {
            user_id,
            key,
            cache: registry.cache().clone(),
            store,
            notifier,
            _feed: feed,
        })
    }

    pub fn cache_key(&self) -> &QueryKey {
        &self.key
    }

    /// The user's notifications, newest first, through the query cache.
    pub async fn notifications(&self) -> Result<Vec<Notification>, RealtimeError> {
        let result = self
            .cache
            .fetch(&self.key, || self.store.list_notifications(self.user_id))
            .await;
        self.surface(result)
    }

    /// Recomputed from the latest fetch every time.
    pub async fn unread_count(&self) -> Result<usize, RealtimeError> {
        Ok(unread_count(&self.notifications().await?))
    }

    pub async fn mark_read(&self, id: Uuid) -> Result<Option<Notification>, RealtimeError> {
        let result = self.store.mark_read(self.user_id, id).await;
        let row = self.surface(result)?;
        self.cache.invalidate(&self.key);
        Ok(row)
    }

    pub async fn mark_all_read(&self) -> Result<u64, RealtimeError> {
        let result = self.store.mark_all_read(self.user_id).await;
        let updated = self.surface(result)?;
        debug!("marked {} notifications read for {}", updated, self.user_id);
        self.cache.invalidate(&self.key);
        Ok(updated)
    }

    fn surface<T>(&self, result: Result<T, RealtimeError>) -> Result<T, RealtimeError> {
        result.inspect_err(|e| {
            warn!("notification request for {} failed: {}", self.user_id, e);
            self.notifier.toast(Toast::error(e.user_message()));
        })
    }
}

fn announce(notifier: &dyn LocalNotifier, change: &RowChange) {
    let Some(row) = change.new.clone() else {
        return;
    };
    let notification: Notification = match serde_json::from_value(row) {
        Ok(notification) => notification,
        Err(e) => {
            warn!("ignoring malformed notification row: {}", e);
            return;
        }
    };

    if notifier.permission() == NotificationPermission::Granted {
        notifier.show_alert(LocalAlert {
            id: notification.id,
            title: notification.title.clone(),
            body: notification.body.clone(),
        });
    }
    notifier.toast(Toast::info(notification.title, notification.body));
}

/// Offer the OS permission prompt at most once per device. Returns the
/// outcome when the prompt was shown.
pub async fn offer_permission_prompt(
    flags: &dyn FlagStore,
    notifier: &dyn LocalNotifier,
) -> Result<Option<NotificationPermission>, RealtimeError> {
    if flags.get_flag(PROMPT_FLAG).await?.is_some() {
        return Ok(None);
    }
    if notifier.permission() != NotificationPermission::Undetermined {
        return Ok(None);
    }

    flags.set_flag(PROMPT_FLAG, "true").await?;
    let outcome = notifier.request_permission().await;
    info!("notification permission prompt answered: {:?}", outcome);
    Ok(Some(outcome))
}
