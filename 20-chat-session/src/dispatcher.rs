//! Routing of server pushes.
//!
//! Only envelopes classified as [`Route::Push`](crate::message::Route::Push)
//! reach the dispatcher. Topic pushes update that topic's cache and its
//! listeners; everything else goes to the session-wide listener.

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    message::{Ctrl, Data, Envelope},
    topic::TopicRegistry,
};

/// Session-wide notifications that do not belong to one topic.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An untagged `ctrl` sent on the server's own initiative.
    Notice(Ctrl),
    /// A push named a topic this session had not seen before.
    TopicDiscovered(String),
    /// Every `data` push, whichever topic it belongs to. Sent after
    /// `TopicDiscovered` for the same push.
    Message(Data),
}

pub struct Dispatcher {
    events: broadcast::Sender<SessionEvent>,
    routed: u64,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events, routed: 0 }
    }

    pub fn listen(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Lets session handles add listeners without going through the worker.
    pub fn sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    /// Pushes delivered so far.
    pub fn routed(&self) -> u64 {
        self.routed
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn route_push(&mut self, envelope: Envelope, topics: &mut TopicRegistry) {
        self.routed += 1;
        match envelope {
            Envelope::Ctrl(ctrl) => {
                debug!(code = ctrl.code, text = %ctrl.text, "server notice");
                self.emit(SessionEvent::Notice(ctrl));
            }
            push @ (Envelope::Data(_) | Envelope::Presence(_) | Envelope::Meta(_)) => {
                let Some(name) = push.topic().map(str::to_string) else {
                    return;
                };
                if topics.get(&name).is_none() {
                    debug!(topic = %name, "materializing topic from push");
                    self.emit(SessionEvent::TopicDiscovered(name.clone()));
                }
                trace!(topic = %name, kind = push.kind(), "push routed");
                if let Envelope::Data(data) = &push {
                    self.emit(SessionEvent::Message(data.clone()));
                }
                topics.entry(&name).apply_push(push);
            }
            other => {
                debug!(kind = other.kind(), "not a push kind, ignored");
            }
        }
    }
}
