use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use nest_realtime::{Channel, ChannelConfig, Hub, RealtimeError};
use nest_types::events::{ChangeBinding, GatewayCommand, GatewayEvent};
use nest_types::filter::RowFilter;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("already joined {0}")]
    AlreadyJoined(String),

    #[error("not joined to {0}")]
    NotJoined(String),

    #[error("notification feeds must filter on your own user_id")]
    Forbidden,

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

/// Tables whose rows are private to `user_id`.
const OWNER_SCOPED_TABLES: &[&str] = &["notifications"];

struct Joined {
    channel: Channel,
    forward: JoinHandle<()>,
    /// Set before the session releases the channel, so the forwarder does
    /// not report a second `Left`.
    released: Arc<AtomicBool>,
}

impl Drop for Joined {
    fn drop(&mut self) {
        self.released.store(true, Ordering::Release);
        self.forward.abort();
    }
}

/// Topics joined by one websocket connection. Dropping the session
/// releases every channel it opened.
pub struct Session {
    hub: Hub,
    user_id: Uuid,
    username: String,
    outbound: mpsc::UnboundedSender<GatewayEvent>,
    joined: HashMap<String, Joined>,
}

impl Session {
    pub fn new(
        hub: Hub,
        user_id: Uuid,
        username: impl Into<String>,
        outbound: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Self {
        Self {
            hub,
            user_id,
            username: username.into(),
            outbound,
            joined: HashMap::new(),
        }
    }

    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.joined.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Run one command; failures are reported to the client as `Error` events.
    pub fn handle(&mut self, cmd: GatewayCommand) {
        let topic = command_topic(&cmd).to_string();
        if let Err(e) = self.apply(cmd) {
            debug!("{} ({}) command on {} failed: {}", self.username, self.user_id, topic, e);
            let _ = self.outbound.send(GatewayEvent::Error {
                topic: Some(topic),
                message: e.to_string(),
            });
        }
    }

    fn apply(&mut self, cmd: GatewayCommand) -> Result<(), CommandError> {
        match cmd {
            GatewayCommand::Join {
                topic,
                changes,
                presence,
                self_broadcast,
            } => self.join(topic, changes, presence, self_broadcast),

            GatewayCommand::Leave { topic } => {
                if self.joined.remove(&topic).is_none() {
                    return Err(CommandError::NotJoined(topic));
                }
                debug!("{} ({}) left {}", self.username, self.user_id, topic);
                let _ = self.outbound.send(GatewayEvent::Left { topic });
                Ok(())
            }

            GatewayCommand::Broadcast {
                topic,
                event,
                payload,
            } => {
                self.channel(&topic)?.broadcast(&event, payload)?;
                Ok(())
            }

            GatewayCommand::Track { topic } => {
                let key = self.user_id.to_string();
                self.channel(&topic)?.track(&key)?;
                Ok(())
            }

            GatewayCommand::Untrack { topic } => {
                self.channel(&topic)?.untrack()?;
                Ok(())
            }
        }
    }

    fn join(
        &mut self,
        topic: String,
        changes: Vec<ChangeBinding>,
        presence: bool,
        self_broadcast: bool,
    ) -> Result<(), CommandError> {
        if self.joined.contains_key(&topic) {
            return Err(CommandError::AlreadyJoined(topic));
        }
        for binding in &changes {
            authorize(binding, self.user_id)?;
        }

        let mut config = ChannelConfig::new(topic.clone()).with_bindings(changes);
        if presence {
            config = config.with_presence();
        }
        if self_broadcast {
            config = config.with_self_broadcast();
        }
        let (channel, mut events) = self.hub.open(config)?;

        let _ = self.outbound.send(GatewayEvent::Joined { topic: topic.clone() });

        let outbound = self.outbound.clone();
        let forward_topic = topic.clone();
        let released = Arc::new(AtomicBool::new(false));
        let released_by_session = released.clone();
        let forward = tokio::spawn(async move {
            while let Some(message) = events.next().await {
                let event = GatewayEvent::Message {
                    topic: forward_topic.clone(),
                    message,
                };
                if outbound.send(event).is_err() {
                    return;
                }
            }
            // Channel ended without a Leave (hub shutdown)
            if !released_by_session.load(Ordering::Acquire) {
                let _ = outbound.send(GatewayEvent::Left { topic: forward_topic });
            }
        });

        info!("{} ({}) joined {}", self.username, self.user_id, topic);
        self.joined.insert(
            topic,
            Joined {
                channel,
                forward,
                released,
            },
        );
        Ok(())
    }

    fn channel(&self, topic: &str) -> Result<&Channel, CommandError> {
        self.joined
            .get(topic)
            .map(|joined| &joined.channel)
            .ok_or_else(|| CommandError::NotJoined(topic.to_string()))
    }
}

fn command_topic(cmd: &GatewayCommand) -> &str {
    match cmd {
        GatewayCommand::Join { topic, .. }
        | GatewayCommand::Leave { topic }
        | GatewayCommand::Broadcast { topic, .. }
        | GatewayCommand::Track { topic }
        | GatewayCommand::Untrack { topic } => topic,
    }
}

/// Row changes of owner-scoped tables are only streamed with a filter
/// pinning `user_id` to the caller.
pub fn authorize(binding: &ChangeBinding, user_id: Uuid) -> Result<(), CommandError> {
    if !OWNER_SCOPED_TABLES.contains(&binding.table.as_str()) {
        return Ok(());
    }
    let own = RowFilter::eq("user_id", user_id);
    match &binding.filter {
        Some(filter) if *filter == own => Ok(()),
        _ => Err(CommandError::Forbidden),
    }
}
