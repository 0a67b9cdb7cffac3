//! Realtime sync layer: an in-process realtime transport ([`Hub`]) and the
//! client-side components built on it: feed registry, presence, typing,
//! live location, notifications and the query cache bridge.

pub mod bridge;
pub mod cache;
pub mod channel;
pub mod error;
pub mod hub;
pub mod location;
pub mod notifications;
pub mod presence;
pub mod registry;
pub mod store;
pub mod token;
pub mod typing;

pub use bridge::CacheBridge;
pub use cache::{QueryCache, QueryKey};
pub use channel::{Channel, ChannelConfig, ChannelEvents, ChannelHandle};
pub use error::RealtimeError;
pub use hub::{Hub, HubConfig};
pub use location::{
    LocationError, LocationProvider, LocationUpdater, ManualLocationProvider, TrackingRequest,
    TrackingState, TrackingStatus, WatchOptions, current_position,
};
pub use notifications::{
    LocalAlert, LocalNotifier, NotificationPermission, NotificationRelay, Toast, ToastKind,
    offer_permission_prompt, unread_count,
};
pub use presence::{PresenceSet, PresenceStatus, PresenceTracker};
pub use registry::{ChannelRegistry, FeedGuard, Subscription};
pub use store::{FlagStore, LocationStore, LocationTarget, NotificationStore, SqliteStore};
pub use token::{CallTokenClient, RetryPolicy, with_retry};
pub use typing::{TypingConfig, TypingIndicator, TypingSignal, TypingState};
