//! The caller-facing session API.
//!
//! A [`Session`] is a cheap, cloneable handle. Every operation is a command
//! to the dispatch worker followed by a bounded wait for its answer, so no
//! call can hang: it resolves with the server's reply, an error, or
//! `Timeout`.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    config::SessionConfig,
    correlator::{PendingResponse, Responder},
    dispatcher::SessionEvent,
    error::ChatError,
    message::{
        time_to_millis, Account, AuthScheme, Data, Delete, Envelope, Expect, Get, GetQuery,
        GetWhat, Login, Note, NoteWhat, Publish, SeqRange, Set, SetDesc, SetQuery, Subscription,
        TopicDescription,
    },
    runtime::{self, Command, ConnectionState, SessionSnapshot, SWEEP_INTERVAL},
    topic::{SubscriptionState, TopicEvent, TopicSnapshot},
    transport::{Connector, TcpConnector},
};

/// The current user's own topic; its subscriptions are the user's topics.
pub const ME_TOPIC: &str = "me";

/// Topic used for searching users and topics by tag.
pub const FIND_TOPIC: &str = "fnd";

/// Username and password for the `basic` scheme.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }

    fn secret(&self) -> Result<String, ChatError> {
        if self.user.is_empty() || self.pass.is_empty() {
            return Err(ChatError::InvalidArgument(
                "user and password must not be empty".into(),
            ));
        }
        if self.user.contains(':') {
            return Err(ChatError::InvalidArgument(
                "user must not contain ':'".into(),
            ));
        }
        Ok(format!("{}:{}", self.user, self.pass))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// Optional profile sent along with a registration.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub tags: Vec<String>,
    pub public: Option<Value>,
    pub private: Option<Value>,
}

#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    user_id: watch::Receiver<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl Session {
    /// Creates a session that dials the configured server over TCP. The
    /// connection is not opened until [`connect`](Self::connect).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }

    pub fn with_connector(config: SessionConfig, connector: impl Connector) -> Self {
        let request_timeout = config.request_timeout;
        let connect_timeout = config.connect_timeout;
        let handles = runtime::spawn(config, Arc::new(connector));
        Self {
            commands: handles.commands,
            state: handles.state,
            user_id: handles.user_id,
            events: handles.events,
            request_timeout,
            connect_timeout,
        }
    }

    fn send(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::SessionClosed)
    }

    /// Sends a request-bearing command and waits for the server's answer.
    async fn call(&self, build: impl FnOnce(Responder) -> Command) -> Result<Envelope, ChatError> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(build(respond_to))?;
        // The worker reports its own timeout first; this bound only guards
        // against a worker that stopped answering.
        PendingResponse::new(receiver, self.request_timeout + SWEEP_INTERVAL * 2)
            .await_response()
            .await
    }

    /// Sends a local command the worker answers immediately.
    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(build(respond_to))?;
        receiver.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Opens the connection and performs the handshake.
    ///
    /// A failed first attempt is reported and not retried. Once a session
    /// has been established, later drops are recovered automatically.
    pub async fn connect(&self) -> Result<(), ChatError> {
        let (respond_to, receiver) = oneshot::channel();
        self.send(Command::Connect { respond_to })?;
        let bound = self.connect_timeout * 2 + SWEEP_INTERVAL * 2;
        match tokio::time::timeout(bound, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::SessionClosed),
            Err(_) => Err(ChatError::Timeout(bound)),
        }
    }

    /// Closes the connection and forgets the session: token, user, and
    /// topics. Pending requests fail with `ConnectionLost`.
    pub async fn disconnect(&self) -> Result<(), ChatError> {
        self.ask(|respond_to| Command::Disconnect { respond_to }).await
    }

    /// Creates an account and logs into it. Returns the session token.
    pub async fn register(&self, credentials: &Credentials) -> Result<String, ChatError> {
        self.register_with_profile(credentials, Profile::default())
            .await
    }

    pub async fn register_with_profile(
        &self,
        credentials: &Credentials,
        profile: Profile,
    ) -> Result<String, ChatError> {
        let desc = (profile.public.is_some() || profile.private.is_some()).then(|| SetDesc {
            public: profile.public,
            private: profile.private,
        });
        let envelope = Envelope::Account(Account {
            tag: None,
            user_id: "new".into(),
            scheme: AuthScheme::Basic,
            secret: Some(credentials.secret()?),
            login: true,
            tags: profile.tags,
            desc,
        });
        let reply = self
            .call(|respond_to| Command::Authenticate {
                envelope,
                token: None,
                respond_to,
            })
            .await?;
        token_from(reply, None)
    }

    /// Logs in with a token from an earlier login or registration.
    pub async fn login(&self, token: &str) -> Result<String, ChatError> {
        if token.is_empty() {
            return Err(ChatError::InvalidArgument("token must not be empty".into()));
        }
        let envelope = Envelope::Login(Login {
            tag: None,
            scheme: AuthScheme::Token,
            secret: token.to_string(),
        });
        let reply = self
            .call(|respond_to| Command::Authenticate {
                envelope,
                token: Some(token.to_string()),
                respond_to,
            })
            .await?;
        token_from(reply, Some(token))
    }

    pub async fn login_basic(&self, credentials: &Credentials) -> Result<String, ChatError> {
        let envelope = Envelope::Login(Login {
            tag: None,
            scheme: AuthScheme::Basic,
            secret: credentials.secret()?,
        });
        let reply = self
            .call(|respond_to| Command::Authenticate {
                envelope,
                token: None,
                respond_to,
            })
            .await?;
        token_from(reply, None)
    }

    /// Asks the server to create a group topic, which the session is then
    /// subscribed to. Returns the new topic's name.
    pub async fn new_topic(&self) -> Result<String, ChatError> {
        self.new_topic_with(SetQuery::default()).await
    }

    pub async fn new_topic_with(&self, set: SetQuery) -> Result<String, ChatError> {
        let set = (!set.tags.is_empty() || set.desc.is_some()).then_some(set);
        match self
            .call(|respond_to| Command::NewTopic { set, respond_to })
            .await?
        {
            Envelope::Ctrl(ctrl) => ctrl
                .topic
                .ok_or_else(|| ChatError::UnexpectedResponse("no topic name in reply".into())),
            other => Err(unexpected(&other)),
        }
    }

    /// Subscribes to a topic. Subscribing again to a subscribed topic
    /// succeeds without contacting the server.
    pub async fn subscribe(&self, topic: &str) -> Result<(), ChatError> {
        let topic = topic.to_string();
        self.call(|respond_to| Command::Subscribe { topic, respond_to })
            .await
            .map(drop)
    }

    /// Publishes to a subscribed topic and returns the message's sequence id.
    ///
    /// A `Timeout` or `ConnectionLost` result is ambiguous: the server may
    /// have stored the message. It is never retried automatically.
    pub async fn publish(&self, topic: &str, content: impl Into<Value>) -> Result<u64, ChatError> {
        self.publish_message(Publish::new(topic, content)).await
    }

    /// Like [`publish`](Self::publish), with headers or `no_echo` set.
    pub async fn publish_message(&self, publish: Publish) -> Result<u64, ChatError> {
        match self
            .call(|respond_to| Command::Publish {
                publish,
                respond_to,
            })
            .await?
        {
            Envelope::Ctrl(ctrl) => ctrl
                .param_u64("seq")
                .ok_or_else(|| ChatError::UnexpectedResponse("publish reply has no seq".into())),
            other => Err(unexpected(&other)),
        }
    }

    /// Leaves a topic. With `unsubscribe` the subscription is also deleted
    /// on the server, not just detached from this session.
    pub async fn leave(&self, topic: &str, unsubscribe: bool) -> Result<(), ChatError> {
        let topic = topic.to_string();
        self.call(|respond_to| Command::Leave {
            topic,
            unsub: unsubscribe,
            respond_to,
        })
        .await
        .map(drop)
    }

    async fn query(&self, envelope: Envelope, expect: Expect) -> Result<Envelope, ChatError> {
        self.call(|respond_to| Command::Query {
            envelope,
            expect,
            respond_to,
        })
        .await
    }

    /// Fetches a topic's description. `None` means the server had nothing
    /// newer than `if_modified_since`.
    pub async fn get_topic_description(
        &self,
        topic: &str,
        if_modified_since: Option<SystemTime>,
    ) -> Result<Option<TopicDescription>, ChatError> {
        let query = GetQuery {
            if_modified_since: if_modified_since.map(time_to_millis),
            ..GetQuery::new(GetWhat::Desc)
        };
        let envelope = Envelope::Get(Get {
            tag: None,
            topic: topic.to_string(),
            query,
        });
        match self.query(envelope, Expect::CtrlOrMeta).await? {
            Envelope::Meta(meta) => Ok(meta.desc),
            Envelope::Ctrl(_) => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    /// Lists a topic's subscribers, or for `me`, the user's topics.
    pub async fn get_subscriptions(
        &self,
        topic: &str,
        limit: Option<u32>,
        if_modified_since: Option<SystemTime>,
    ) -> Result<Vec<Subscription>, ChatError> {
        let query = GetQuery {
            if_modified_since: if_modified_since.map(time_to_millis),
            limit,
            ..GetQuery::new(GetWhat::Sub)
        };
        let envelope = Envelope::Get(Get {
            tag: None,
            topic: topic.to_string(),
            query,
        });
        match self.query(envelope, Expect::CtrlOrMeta).await? {
            Envelope::Meta(meta) => Ok(meta.sub),
            // A bare ctrl means the request succeeded with no rows.
            Envelope::Ctrl(_) => Ok(Vec::new()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_subscribed_topics(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<Subscription>, ChatError> {
        self.subscribe(ME_TOPIC).await?;
        self.get_subscriptions(ME_TOPIC, limit, None).await
    }

    /// Fetches stored messages with `since <= seq_id < before`.
    ///
    /// The server streams history as `data` pushes ahead of its reply. The
    /// worker collects them for this call; they also reach the topic's
    /// listeners as usual.
    pub async fn get_message_history(
        &self,
        topic: &str,
        since: Option<u64>,
        before: Option<u64>,
        limit: Option<u32>,
    ) -> Result<Vec<Data>, ChatError> {
        let query = GetQuery {
            since_id: since,
            before_id: before,
            limit,
            ..GetQuery::new(GetWhat::Data)
        };
        let topic = topic.to_string();
        let bound = self.request_timeout + SWEEP_INTERVAL * 2;
        let (respond_to, receiver) = oneshot::channel();
        self.send(Command::History {
            topic,
            query,
            respond_to,
        })?;
        match tokio::time::timeout(bound, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::SessionClosed),
            Err(_) => Err(ChatError::Timeout(bound)),
        }
    }

    pub async fn set_topic_description(
        &self,
        topic: &str,
        tags: Vec<String>,
        public: Option<Value>,
        private: Option<Value>,
    ) -> Result<(), ChatError> {
        let desc = (public.is_some() || private.is_some()).then_some(SetDesc { public, private });
        let envelope = Envelope::Set(Set {
            tag: None,
            topic: topic.to_string(),
            query: SetQuery { tags, desc },
        });
        self.query(envelope, Expect::Ctrl).await.map(drop)
    }

    /// Deletes messages by inclusive-exclusive sequence ranges. `hard`
    /// removes them for everyone rather than hiding them for this user.
    pub async fn delete_messages(
        &self,
        topic: &str,
        ranges: Vec<SeqRange>,
        hard: bool,
    ) -> Result<(), ChatError> {
        if ranges.is_empty() {
            return Err(ChatError::InvalidArgument("no messages to delete".into()));
        }
        if let Some(bad) = ranges.iter().find(|range| range.low >= range.hi) {
            return Err(ChatError::InvalidArgument(format!(
                "empty range {}..{}",
                bad.low, bad.hi
            )));
        }
        let envelope = Envelope::Delete(Delete {
            tag: None,
            topic: topic.to_string(),
            ranges,
            hard,
        });
        self.query(envelope, Expect::Ctrl).await.map(drop)
    }

    async fn find(&self, query: &str) -> Result<Vec<Subscription>, ChatError> {
        self.subscribe(FIND_TOPIC).await?;
        self.set_topic_description(FIND_TOPIC, Vec::new(), Some(Value::from(query)), None)
            .await?;
        self.get_subscriptions(FIND_TOPIC, None, None).await
    }

    /// Searches users by tag query, e.g. `"email:alice@example.com"`.
    pub async fn find_users(&self, query: &str) -> Result<Vec<Subscription>, ChatError> {
        let mut found = self.find(query).await?;
        found.retain(|row| row.user_id.is_some());
        Ok(found)
    }

    pub async fn find_topics(&self, query: &str) -> Result<Vec<Subscription>, ChatError> {
        let mut found = self.find(query).await?;
        found.retain(|row| row.topic.is_some());
        Ok(found)
    }

    async fn note(
        &self,
        topic: &str,
        what: NoteWhat,
        seq_id: Option<u64>,
    ) -> Result<(), ChatError> {
        let note = Note {
            topic: topic.to_string(),
            what,
            seq_id,
        };
        self.ask(|respond_to| Command::Note { note, respond_to })
            .await?
    }

    /// Tells other subscribers the user is typing. Not acknowledged.
    pub async fn notify_key_press(&self, topic: &str) -> Result<(), ChatError> {
        self.note(topic, NoteWhat::KeyPress, None).await
    }

    pub async fn notify_received(&self, topic: &str, seq_id: u64) -> Result<(), ChatError> {
        self.note(topic, NoteWhat::Recv, Some(seq_id)).await
    }

    pub async fn notify_read(&self, topic: &str, seq_id: u64) -> Result<(), ChatError> {
        self.note(topic, NoteWhat::Read, Some(seq_id)).await
    }

    /// Id of the logged-in user, once the server has reported it.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits up to `limit` for the connection to reach `target`.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        limit: Duration,
    ) -> Result<(), ChatError> {
        let mut changes = self.state.clone();
        let waited = tokio::time::timeout(limit, changes.wait_for(|state| *state == target))
            .await
            .map(|reached| reached.map(drop));
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ChatError::SessionClosed),
            Err(_) => Err(ChatError::Timeout(limit)),
        }
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ChatError> {
        self.ask(|respond_to| Command::Snapshot { respond_to }).await
    }

    pub fn topic(&self, name: &str) -> TopicHandle {
        TopicHandle {
            session: self.clone(),
            name: name.to_string(),
        }
    }

    pub async fn topic_snapshot(&self, name: &str) -> Result<Option<TopicSnapshot>, ChatError> {
        let name = name.to_string();
        self.ask(|respond_to| Command::Topic { name, respond_to })
            .await
    }

    /// Listens to one topic's pushes and state changes. Listening before
    /// subscribing is allowed and misses nothing.
    pub async fn topic_events(
        &self,
        name: &str,
    ) -> Result<broadcast::Receiver<TopicEvent>, ChatError> {
        let name = name.to_string();
        self.ask(|respond_to| Command::Listen { name, respond_to })
            .await
    }

    /// Listens to session-wide events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// A topic bound to its session.
#[derive(Clone)]
pub struct TopicHandle {
    session: Session,
    name: String,
}

impl TopicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn subscribe(&self) -> Result<(), ChatError> {
        self.session.subscribe(&self.name).await
    }

    pub async fn publish(&self, content: impl Into<Value>) -> Result<u64, ChatError> {
        self.session.publish(&self.name, content).await
    }

    pub async fn leave(&self, unsubscribe: bool) -> Result<(), ChatError> {
        self.session.leave(&self.name, unsubscribe).await
    }

    pub async fn description(&self) -> Result<Option<TopicDescription>, ChatError> {
        self.session.get_topic_description(&self.name, None).await
    }

    pub async fn subscribers(&self) -> Result<Vec<Subscription>, ChatError> {
        self.session.get_subscriptions(&self.name, None, None).await
    }

    pub async fn history(
        &self,
        since: Option<u64>,
        before: Option<u64>,
        limit: Option<u32>,
    ) -> Result<Vec<Data>, ChatError> {
        self.session
            .get_message_history(&self.name, since, before, limit)
            .await
    }

    pub async fn events(&self) -> Result<broadcast::Receiver<TopicEvent>, ChatError> {
        self.session.topic_events(&self.name).await
    }

    pub async fn state(&self) -> Result<SubscriptionState, ChatError> {
        Ok(self
            .session
            .topic_snapshot(&self.name)
            .await?
            .map_or(SubscriptionState::Unsubscribed, |topic| topic.state))
    }
}

impl fmt::Debug for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicHandle").field("name", &self.name).finish()
    }
}

fn token_from(reply: Envelope, fallback: Option<&str>) -> Result<String, ChatError> {
    match reply {
        Envelope::Ctrl(ctrl) => ctrl
            .param_str("token")
            .or(fallback)
            .map(str::to_string)
            .ok_or_else(|| {
                ChatError::UnexpectedResponse("authentication reply has no token".into())
            }),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(envelope: &Envelope) -> ChatError {
    ChatError::UnexpectedResponse(format!("{} reply", envelope.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_join_into_basic_secret() {
        let credentials = Credentials::new("alice", "hunter2");
        assert_eq!(credentials.secret().expect("secret"), "alice:hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn unusable_credentials_are_rejected_locally() {
        assert!(matches!(
            Credentials::new("", "pw").secret(),
            Err(ChatError::InvalidArgument(_))
        ));
        assert!(matches!(
            Credentials::new("a:b", "pw").secret(),
            Err(ChatError::InvalidArgument(_))
        ));
    }

    #[test]
    fn token_falls_back_to_the_one_presented() {
        let reply = Envelope::Ctrl(crate::message::Ctrl {
            tag: Some("101".into()),
            topic: None,
            code: 200,
            text: "ok".into(),
            params: Default::default(),
        });
        assert_eq!(token_from(reply.clone(), Some("tok")).expect("token"), "tok");
        assert!(matches!(
            token_from(reply, None),
            Err(ChatError::UnexpectedResponse(_))
        ));
    }
}
