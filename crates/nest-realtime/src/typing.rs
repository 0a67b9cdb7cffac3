use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use nest_types::events::RealtimeMessage;

use crate::channel::{Channel, ChannelConfig, ChannelEvents, ChannelHandle};
use crate::error::RealtimeError;
use crate::hub::Hub;

/// Broadcast event name carrying [`TypingSignal`] payloads.
pub const TYPING_EVENT: &str = "typing";

#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Quiet time after the last keystroke before `stop` goes out.
    pub debounce: Duration,
    /// How long a peer's `start` is shown without a follow-up.
    pub expiry: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            expiry: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingState {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub user_id: Uuid,
    pub display_name: String,
    pub state: TypingState,
}

pub fn typing_topic(conversation_id: Uuid) -> String {
    format!("typing:{conversation_id}")
}

/// Local typing state: whether we announced `start` and when the debounce
/// runs out.
#[derive(Debug, Default)]
pub struct OutgoingTyping {
    deadline: Option<Instant>,
}

impl OutgoingTyping {
    /// Re-arm the debounce. Returns `true` when a `start` should go out.
    pub fn keystroke(&mut self, now: Instant, debounce: Duration) -> bool {
        let starting = self.deadline.is_none();
        self.deadline = Some(now + debounce);
        starting
    }

    /// Returns `true` when the debounce ran out and `stop` should go out.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if we were typing.
    pub fn stop(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[derive(Debug)]
struct TypingPeer {
    name: String,
    expires_at: Instant,
}

/// Peers currently shown as typing.
#[derive(Debug, Default)]
pub struct TypingRoster {
    peers: HashMap<Uuid, TypingPeer>,
}

impl TypingRoster {
    /// Apply a peer's signal. Returns whether the displayed names changed.
    pub fn on_signal(&mut self, signal: &TypingSignal, now: Instant, expiry: Duration) -> bool {
        match signal.state {
            TypingState::Start => {
                let expires_at = now + expiry;
                match self.peers.insert(
                    signal.user_id,
                    TypingPeer {
                        name: signal.display_name.clone(),
                        expires_at,
                    },
                ) {
                    Some(previous) => previous.name != signal.display_name,
                    None => true,
                }
            }
            TypingState::Stop => self.peers.remove(&signal.user_id).is_some(),
        }
    }

    /// Drop every peer whose expiry has passed and return their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers.values().map(|peer| peer.expires_at).min()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.values().map(|peer| peer.name.clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

enum Command {
    Keystroke,
    Stop,
}

/// "X is typing" for one conversation, both directions.
pub struct TypingIndicator {
    _channel: Channel,
    commands: mpsc::UnboundedSender<Command>,
    names: watch::Receiver<Vec<String>>,
    task: JoinHandle<()>,
}

impl TypingIndicator {
    pub fn start(
        hub: &Hub,
        conversation_id: Uuid,
        me: Uuid,
        display_name: impl Into<String>,
        config: TypingConfig,
    ) -> Result<Self, RealtimeError> {
        let (channel, events) = hub.open(ChannelConfig::new(typing_topic(conversation_id)))?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (names_tx, names) = watch::channel(Vec::new());

        let local = Local {
            handle: channel.handle(),
            me,
            display_name: display_name.into(),
        };
        let task = tokio::spawn(run(local, events, commands_rx, names_tx, config));

        Ok(Self {
            _channel: channel,
            commands,
            names,
            task,
        })
    }

    /// Call on every keystroke in the composer.
    pub fn keystroke(&self) {
        let _ = self.commands.send(Command::Keystroke);
    }

    /// Call when the message is sent.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Display names of peers currently typing.
    pub fn typing_names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<String>> {
        self.names.clone()
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Local {
    handle: ChannelHandle,
    me: Uuid,
    display_name: String,
}

impl Local {
    fn send(&self, state: TypingState) {
        let signal = TypingSignal {
            user_id: self.me,
            display_name: self.display_name.clone(),
            state,
        };
        let payload = match serde_json::to_value(&signal) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode typing signal: {}", e);
                return;
            }
        };
        match self.handle.broadcast(TYPING_EVENT, payload) {
            Ok(_) => trace!("typing {:?} sent on {}", state, self.handle.topic()),
            Err(e) => warn!("typing {:?} on {} failed: {}", state, self.handle.topic(), e),
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn run(
    local: Local,
    mut events: ChannelEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
    names_tx: watch::Sender<Vec<String>>,
    config: TypingConfig,
) {
    let mut outgoing = OutgoingTyping::default();
    let mut roster = TypingRoster::default();

    loop {
        let deadline = earliest(outgoing.deadline(), roster.next_deadline());
        let timer = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Keystroke) => {
                    if outgoing.keystroke(Instant::now(), config.debounce) {
                        local.send(TypingState::Start);
                    }
                }
                Some(Command::Stop) => {
                    if outgoing.stop() {
                        local.send(TypingState::Stop);
                    }
                }
                None => break,
            },
            message = events.next() => match message {
                Some(RealtimeMessage::Broadcast(msg)) if msg.event == TYPING_EVENT => {
                    match serde_json::from_value::<TypingSignal>(msg.payload) {
                        Ok(signal) if signal.user_id == local.me => {}
                        Ok(signal) => {
                            if roster.on_signal(&signal, Instant::now(), config.expiry) {
                                names_tx.send_replace(roster.names());
                            }
                        }
                        Err(e) => debug!("ignoring malformed typing signal: {}", e),
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = timer => {
                let now = Instant::now();
                if outgoing.expire(now) {
                    local.send(TypingState::Stop);
                }
                let expired = roster.expire(now);
                if !expired.is_empty() {
                    trace!("{} typing peers expired", expired.len());
                    names_tx.send_replace(roster.names());
                }
            }
        }
    }
    debug!("typing indicator on {} stopped", local.handle.topic());
}
