//! Per-topic subscription lifecycle and cached state.

use std::{collections::HashMap, fmt};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    error::ChatError,
    message::{Data, Envelope, Meta, Presence, Subscription, TopicDescription},
};

/// Lagging listeners skip events beyond this many.
const LISTENER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Leaving,
}

impl SubscriptionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a topic's listeners receive.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicEvent {
    Message(Data),
    Presence(Presence),
    Metadata(Meta),
    StateChanged(SubscriptionState),
}

/// Outcome of asking a topic to start subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStep {
    /// Send a subscribe request.
    Send,
    /// Already subscribed; nothing to do.
    AlreadySubscribed,
}

/// Read-only copy of a topic handed across tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSnapshot {
    pub name: String,
    pub state: SubscriptionState,
    pub last_seq_id: u64,
    pub description: Option<TopicDescription>,
    pub subscribers: Vec<Subscription>,
}

pub struct Topic {
    name: String,
    state: SubscriptionState,
    last_seq_id: u64,
    description: Option<TopicDescription>,
    subscribers: Vec<Subscription>,
    resubscribe: bool,
    listeners: broadcast::Sender<TopicEvent>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Self {
            name: name.into(),
            state: SubscriptionState::Unsubscribed,
            last_seq_id: 0,
            description: None,
            subscribers: Vec::new(),
            resubscribe: false,
            listeners,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn last_seq_id(&self) -> u64 {
        self.last_seq_id
    }

    pub fn needs_resubscribe(&self) -> bool {
        self.resubscribe
    }

    pub fn listen(&self) -> broadcast::Receiver<TopicEvent> {
        self.listeners.subscribe()
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        TopicSnapshot {
            name: self.name.clone(),
            state: self.state,
            last_seq_id: self.last_seq_id,
            description: self.description.clone(),
            subscribers: self.subscribers.clone(),
        }
    }

    fn transition(&mut self, next: SubscriptionState) {
        if self.state == next {
            return;
        }
        debug!(topic = %self.name, from = %self.state, to = %next, "topic state");
        self.state = next;
        self.emit(TopicEvent::StateChanged(next));
    }

    fn emit(&self, event: TopicEvent) {
        // No receivers is normal: nobody is watching this topic.
        let _ = self.listeners.send(event);
    }

    pub fn begin_subscribe(&mut self) -> Result<SubscribeStep, ChatError> {
        match self.state {
            SubscriptionState::Unsubscribed => {
                self.transition(SubscriptionState::Subscribing);
                Ok(SubscribeStep::Send)
            }
            SubscriptionState::Subscribed => Ok(SubscribeStep::AlreadySubscribed),
            busy => Err(ChatError::TopicBusy {
                topic: self.name.clone(),
                state: busy.as_str(),
            }),
        }
    }

    /// Applies the server's answer to a subscribe request. Ignored unless the
    /// topic is still subscribing, since a disconnect may have demoted it.
    pub fn complete_subscribe(&mut self, accepted: bool) {
        if self.state != SubscriptionState::Subscribing {
            return;
        }
        self.resubscribe = false;
        if accepted {
            self.transition(SubscriptionState::Subscribed);
        } else {
            self.transition(SubscriptionState::Unsubscribed);
        }
    }

    pub fn begin_leave(&mut self) -> Result<(), ChatError> {
        match self.state {
            SubscriptionState::Subscribed => {
                self.transition(SubscriptionState::Leaving);
                Ok(())
            }
            SubscriptionState::Unsubscribed => Err(ChatError::NotSubscribed(self.name.clone())),
            busy => Err(ChatError::TopicBusy {
                topic: self.name.clone(),
                state: busy.as_str(),
            }),
        }
    }

    pub fn complete_leave(&mut self, accepted: bool) {
        if self.state != SubscriptionState::Leaving {
            return;
        }
        if accepted {
            self.transition(SubscriptionState::Unsubscribed);
        } else {
            self.transition(SubscriptionState::Subscribed);
        }
    }

    pub fn ensure_subscribed(&self) -> Result<(), ChatError> {
        if self.state == SubscriptionState::Subscribed {
            Ok(())
        } else {
            Err(ChatError::NotSubscribed(self.name.clone()))
        }
    }

    /// Drops the subscription after a lost connection, remembering whether
    /// it should be restored.
    ///
    /// A topic caught mid-resubscribe by a second drop keeps its flag.
    pub fn demote(&mut self) {
        if self.state == SubscriptionState::Subscribed {
            self.resubscribe = true;
        }
        self.transition(SubscriptionState::Unsubscribed);
    }

    /// Updates cached state from a server push and forwards it to listeners.
    /// The subscription state is never changed by a push.
    pub fn apply_push(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Data(data) => {
                self.last_seq_id = self.last_seq_id.max(data.seq_id);
                self.emit(TopicEvent::Message(data));
            }
            Envelope::Presence(presence) => {
                if let Some(seq_id) = presence.seq_id {
                    self.last_seq_id = self.last_seq_id.max(seq_id);
                }
                self.emit(TopicEvent::Presence(presence));
            }
            Envelope::Meta(meta) => {
                self.apply_meta(&meta);
                self.emit(TopicEvent::Metadata(meta));
            }
            other => {
                warn!(topic = %self.name, kind = other.kind(), "not a topic push, ignored");
            }
        }
    }

    /// Caches description and subscriber rows from a `meta` envelope.
    pub fn apply_meta(&mut self, meta: &Meta) {
        if let Some(desc) = &meta.desc {
            self.last_seq_id = self.last_seq_id.max(desc.seq_id);
            self.description = Some(desc.clone());
        }
        if !meta.sub.is_empty() {
            self.subscribers = meta.sub.clone();
        }
    }
}

/// All topics known to a session, keyed by name.
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Topic> {
        self.topics.get_mut(name)
    }

    /// Returns the named topic, materializing it as unsubscribed if unknown.
    pub fn entry(&mut self, name: &str) -> &mut Topic {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<Topic> {
        self.topics.remove(name)
    }

    pub fn state_of(&self, name: &str) -> SubscriptionState {
        self.topics
            .get(name)
            .map_or(SubscriptionState::Unsubscribed, Topic::state)
    }

    pub fn demote_all(&mut self) {
        for topic in self.topics.values_mut() {
            topic.demote();
        }
    }

    pub fn pending_resubscribe(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .topics
            .values()
            .filter(|topic| topic.needs_resubscribe())
            .map(|topic| topic.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn snapshots(&self) -> Vec<TopicSnapshot> {
        let mut snapshots: Vec<TopicSnapshot> =
            self.topics.values().map(Topic::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
