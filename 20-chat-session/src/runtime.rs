//! The session's dispatch worker.
//!
//! One task owns the connection, the correlator, and the topic registry, so
//! none of them need locks. [`Session`](crate::Session) handles send it
//! [`Command`]s over an unbounded channel and get answers back on oneshot
//! channels. The worker reacts to four sources:
//!
//! - commands from session handles
//! - envelopes and close notices from the current connection
//! - results of dial attempts, which run in their own task
//! - a 100ms sweep that expires overdue requests and forgets cancelled ones
//!
//! It never awaits a caller's request, so a slow caller cannot stall
//! routing. Reconnection is a small state machine driven from here:
//! `Disconnected -> Connecting -> Reauthenticating -> Resubscribing ->
//! Connected`.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    backoff::Backoff,
    codec,
    config::SessionConfig,
    correlator::{Correlator, Outcome, Resolved, Responder},
    dispatcher::{Dispatcher, SessionEvent},
    error::ChatError,
    message::{
        AuthScheme, Ctrl, Data, Envelope, Expect, Get, GetQuery, Leave, Login, Note, Publish,
        Route, SetQuery, Subscribe, Tag,
    },
    topic::{SubscribeStep, SubscriptionState, TopicEvent, TopicRegistry, TopicSnapshot},
    transport::{BoxedStream, Connection, Connector, TransportEvent},
};

/// How often overdue and abandoned requests are swept.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Subscribing to this name asks the server to create a topic.
pub(crate) const NEW_TOPIC: &str = "new";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Reauthenticating,
    Resubscribing,
    Connected,
    /// The server refused the cached token. Nothing is retried until the
    /// caller logs in again.
    Unauthenticated,
    /// Every session handle is gone and the worker has stopped.
    Closed,
}

/// Point-in-time view of the worker's state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub generation: u64,
    pub pending_requests: usize,
    pub anomalies: u64,
    pub pushes_routed: u64,
    pub reconnect_attempt: u32,
    pub topics: Vec<TopicSnapshot>,
}

pub(crate) enum Command {
    Connect {
        respond_to: oneshot::Sender<Result<(), ChatError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    /// `Login` or `Account`; allowed while unauthenticated.
    Authenticate {
        envelope: Envelope,
        token: Option<String>,
        respond_to: Responder,
    },
    Subscribe {
        topic: String,
        respond_to: Responder,
    },
    NewTopic {
        set: Option<SetQuery>,
        respond_to: Responder,
    },
    Leave {
        topic: String,
        unsub: bool,
        respond_to: Responder,
    },
    Publish {
        publish: Publish,
        respond_to: Responder,
    },
    /// A `data` query; the pushes it triggers are collected by the worker.
    History {
        topic: String,
        query: GetQuery,
        respond_to: HistoryResponder,
    },
    /// `Get`, `Set`, or `Delete` with no topic state attached.
    Query {
        envelope: Envelope,
        expect: Expect,
        respond_to: Responder,
    },
    Note {
        note: Note,
        respond_to: oneshot::Sender<Result<(), ChatError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
    Topic {
        name: String,
        respond_to: oneshot::Sender<Option<TopicSnapshot>>,
    },
    Listen {
        name: String,
        respond_to: oneshot::Sender<broadcast::Receiver<TopicEvent>>,
    },
}

pub(crate) type HistoryResponder = oneshot::Sender<Result<Vec<Data>, ChatError>>;

/// What the worker does to its own state when a request ends.
#[derive(Debug)]
enum Followup {
    None,
    Handshake,
    Authenticated { reauth: bool, token: Option<String> },
    Subscribed { topic: String, resubscribe: bool },
    Created,
    Left { topic: String },
    Query { topic: Option<String> },
    History,
}

/// Messages gathered for one in-flight history query.
struct HistoryBuffer {
    tag: Tag,
    topic: String,
    since: Option<u64>,
    before: Option<u64>,
    messages: Vec<Data>,
    respond_to: HistoryResponder,
}

impl HistoryBuffer {
    fn wants(&self, data: &Data) -> bool {
        data.topic == self.topic
            && self.since.map_or(true, |low| data.seq_id >= low)
            && self.before.map_or(true, |hi| data.seq_id < hi)
    }
}

struct Dialed {
    generation: u64,
    result: io::Result<BoxedStream>,
}

/// Channels a session handle uses to reach the worker.
pub(crate) struct WorkerHandles {
    pub commands: mpsc::UnboundedSender<Command>,
    pub state: watch::Receiver<ConnectionState>,
    pub user_id: watch::Receiver<Option<String>>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Starts the dispatch worker. Must be called inside a Tokio runtime.
pub(crate) fn spawn(config: SessionConfig, connector: Arc<dyn Connector>) -> WorkerHandles {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (dial_tx, dial_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (user_tx, user_rx) = watch::channel(None);
    let dispatcher = Dispatcher::new(EVENT_CAPACITY);
    let events = dispatcher.sender();

    let worker = Worker {
        backoff: Backoff::new(
            config.initial_reconnect_backoff,
            config.max_reconnect_backoff,
        ),
        config,
        connector,
        commands: command_rx,
        transport_tx,
        transport_rx,
        dial_tx,
        dial_rx,
        connection: None,
        generation: 0,
        dialing: None,
        correlator: Correlator::new(),
        topics: TopicRegistry::new(),
        dispatcher,
        state: state_tx,
        user_id: user_tx,
        token: None,
        needs_login: false,
        reconnecting: false,
        resubscribing: 0,
        retry_at: None,
        connect_waiters: Vec::new(),
        histories: Vec::new(),
    };
    tokio::spawn(worker.run());

    WorkerHandles {
        commands: command_tx,
        state: state_rx,
        user_id: user_rx,
        events,
    }
}

struct Worker {
    config: SessionConfig,
    backoff: Backoff,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    dial_tx: mpsc::UnboundedSender<Dialed>,
    dial_rx: mpsc::UnboundedReceiver<Dialed>,
    connection: Option<Connection>,
    generation: u64,
    /// Generation of the dial attempt in flight, if any.
    dialing: Option<u64>,
    correlator: Correlator<Followup>,
    topics: TopicRegistry,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    user_id: watch::Sender<Option<String>>,
    token: Option<String>,
    /// Set when the server refused the cached token.
    needs_login: bool,
    /// Set once an established session dropped; cleared when it is back.
    reconnecting: bool,
    resubscribing: usize,
    retry_at: Option<Instant>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ChatError>>>,
    histories: Vec<HistoryBuffer>,
}

impl Worker {
    async fn run(mut self) {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.transport_rx.recv() => self.on_transport(event),
                Some(dialed) = self.dial_rx.recv() => self.on_dialed(dialed),
                _ = sweep.tick() => self.sweep(),
                () = wait_until(retry_at) => {
                    self.retry_at = None;
                    self.start_attempt();
                }
            }
        }

        self.shut_down();
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, generation = self.generation, "connection state");
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { respond_to } => self.connect(respond_to),
            Command::Disconnect { respond_to } => {
                self.disconnect();
                let _ = respond_to.send(());
            }
            Command::Authenticate {
                envelope,
                token,
                respond_to,
            } => {
                if let Err(error) = self.ensure_ready(true) {
                    let _ = respond_to.send(Err(error));
                    return;
                }
                let followup = Followup::Authenticated {
                    reauth: false,
                    token,
                };
                self.issue(envelope, Expect::Ctrl, followup, Some(respond_to));
            }
            Command::Subscribe { topic, respond_to } => self.subscribe(topic, respond_to),
            Command::NewTopic { set, respond_to } => {
                if let Err(error) = self.ensure_ready(false) {
                    let _ = respond_to.send(Err(error));
                    return;
                }
                let envelope = Envelope::Subscribe(Subscribe {
                    tag: None,
                    topic: NEW_TOPIC.into(),
                    set,
                    get: None,
                });
                self.issue(envelope, Expect::Ctrl, Followup::Created, Some(respond_to));
            }
            Command::Leave {
                topic,
                unsub,
                respond_to,
            } => self.leave(topic, unsub, respond_to),
            Command::Publish {
                publish,
                respond_to,
            } => {
                let ready = self
                    .ensure_ready(false)
                    .and_then(|()| self.ensure_subscribed(&publish.topic));
                if let Err(error) = ready {
                    let _ = respond_to.send(Err(error));
                    return;
                }
                self.issue(
                    Envelope::Publish(publish),
                    Expect::Ctrl,
                    Followup::None,
                    Some(respond_to),
                );
            }
            Command::History {
                topic,
                query,
                respond_to,
            } => self.history(topic, query, respond_to),
            Command::Query {
                envelope,
                expect,
                respond_to,
            } => {
                if let Err(error) = self.ensure_ready(false) {
                    let _ = respond_to.send(Err(error));
                    return;
                }
                let topic = envelope.topic().map(str::to_string);
                self.issue(envelope, expect, Followup::Query { topic }, Some(respond_to));
            }
            Command::Note { note, respond_to } => {
                let _ = respond_to.send(self.send_note(note));
            }
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            Command::Topic { name, respond_to } => {
                let _ = respond_to.send(self.topics.get(&name).map(|topic| topic.snapshot()));
            }
            Command::Listen { name, respond_to } => {
                let _ = respond_to.send(self.topics.entry(&name).listen());
            }
        }
    }

    /// Checks that user requests may go out now.
    fn ensure_ready(&self, allow_unauthenticated: bool) -> Result<(), ChatError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Unauthenticated if allow_unauthenticated => {}
            ConnectionState::Unauthenticated => return Err(ChatError::Unauthenticated),
            ConnectionState::Closed => return Err(ChatError::SessionClosed),
            _ => return Err(ChatError::NotConnected),
        }
        match &self.connection {
            Some(connection) if connection.is_open() => Ok(()),
            _ => Err(ChatError::NotConnected),
        }
    }

    fn ensure_subscribed(&self, topic: &str) -> Result<(), ChatError> {
        self.topics
            .get(topic)
            .ok_or_else(|| ChatError::NotSubscribed(topic.to_string()))?
            .ensure_subscribed()
    }

    fn issue(
        &mut self,
        envelope: Envelope,
        expect: Expect,
        followup: Followup,
        responder: Option<Responder>,
    ) -> Option<Tag> {
        let timeout = match followup {
            Followup::Handshake => self.config.connect_timeout,
            _ => self.config.request_timeout,
        };
        let unsent = match self.connection.as_ref() {
            Some(connection) => {
                match self
                    .correlator
                    .issue(envelope, timeout, expect, followup, responder, connection)
                {
                    Ok(tag) => return Some(tag),
                    Err(unsent) => unsent,
                }
            }
            None => Resolved {
                tag: String::new(),
                context: followup,
                responder,
                outcome: Err(ChatError::NotConnected),
            },
        };
        self.finish(unsent);
        None
    }

    fn finish(&mut self, resolved: Resolved<Followup>) {
        let Resolved {
            tag,
            context,
            responder,
            outcome,
        } = resolved;
        let outcome = self.apply_followup(&tag, context, outcome);
        self.reply(&tag, responder, outcome);
    }

    fn reply(&mut self, tag: &str, responder: Option<Responder>, outcome: Outcome) {
        if let Some(responder) = responder {
            if responder.send(outcome).is_err() {
                self.correlator.record_orphan(tag);
            }
        }
    }

    fn apply_followup(&mut self, tag: &str, followup: Followup, outcome: Outcome) -> Outcome {
        match followup {
            Followup::None => outcome,
            Followup::Handshake => {
                match &outcome {
                    Ok(_) => self.after_handshake(),
                    Err(error) => {
                        warn!(%error, "handshake failed");
                        self.abandon_connection(error.replicate());
                    }
                }
                outcome
            }
            Followup::Authenticated { reauth, token } => {
                match &outcome {
                    Ok(Envelope::Ctrl(ctrl)) => {
                        let resume = reauth || self.state() == ConnectionState::Unauthenticated;
                        self.authenticated(ctrl, token);
                        if resume {
                            self.begin_resubscribe();
                        }
                    }
                    Ok(_) => {}
                    Err(error @ ChatError::ServerError { .. }) if reauth => {
                        warn!(%error, "cached token refused; waiting for an explicit login");
                        self.token = None;
                        self.needs_login = true;
                        self.reconnecting = false;
                        self.set_state(ConnectionState::Unauthenticated);
                        self.fail_waiters(&ChatError::Unauthenticated);
                    }
                    Err(error) if reauth => {
                        warn!(%error, "re-authentication did not complete");
                        self.abandon_connection(error.replicate());
                    }
                    Err(_) => {}
                }
                outcome
            }
            Followup::Subscribed { topic, resubscribe } => {
                if let Some(entry) = self.topics.get_mut(&topic) {
                    entry.complete_subscribe(outcome.is_ok());
                }
                if resubscribe {
                    if let Err(error) = &outcome {
                        warn!(%topic, %error, "resubscribe failed");
                    }
                    self.resubscribe_settled();
                }
                outcome
            }
            Followup::Created => match outcome {
                Ok(Envelope::Ctrl(ctrl)) => {
                    let name = ctrl
                        .topic
                        .clone()
                        .or_else(|| ctrl.param_str("topic").map(str::to_string));
                    match name {
                        Some(name) if name != NEW_TOPIC => {
                            info!(topic = %name, "topic created");
                            let created = self.topics.entry(&name);
                            match created.begin_subscribe() {
                                Ok(SubscribeStep::Send) => created.complete_subscribe(true),
                                Ok(SubscribeStep::AlreadySubscribed) => {}
                                Err(error) => warn!(topic = %name, %error, "created topic is busy"),
                            }
                            Ok(Envelope::Ctrl(Ctrl {
                                topic: Some(name),
                                ..ctrl
                            }))
                        }
                        _ => Err(ChatError::UnexpectedResponse(
                            "topic creation reply names no topic".into(),
                        )),
                    }
                }
                other => other,
            },
            Followup::Left { topic } => {
                let accepted = outcome.is_ok();
                if let Some(entry) = self.topics.get_mut(&topic) {
                    entry.complete_leave(accepted);
                    if accepted && entry.state() == SubscriptionState::Unsubscribed {
                        self.topics.remove(&topic);
                        debug!(%topic, "topic left and forgotten");
                    }
                }
                outcome
            }
            Followup::Query { topic } => {
                if let (Ok(Envelope::Meta(meta)), Some(topic)) = (&outcome, topic) {
                    if let Some(entry) = self.topics.get_mut(&topic) {
                        entry.apply_meta(meta);
                    }
                }
                outcome
            }
            Followup::History => {
                if let Some(index) = self.histories.iter().position(|buffer| buffer.tag == tag) {
                    let buffer = self.histories.swap_remove(index);
                    let result = match &outcome {
                        Ok(_) => Ok(buffer.messages),
                        Err(error) => Err(error.replicate()),
                    };
                    if buffer.respond_to.send(result).is_err() {
                        self.correlator.record_orphan(tag);
                    }
                }
                outcome
            }
        }
    }

    /// Undoes the topic transition a cancelled request had started.
    fn abandon_followup(&mut self, tag: &str, followup: Followup) {
        debug!(%tag, ?followup, "caller cancelled request");
        match followup {
            Followup::Subscribed { topic, .. } => {
                if let Some(entry) = self.topics.get_mut(&topic) {
                    entry.complete_subscribe(false);
                }
            }
            Followup::Left { topic } => {
                if let Some(entry) = self.topics.get_mut(&topic) {
                    entry.complete_leave(false);
                }
            }
            _ => {}
        }
    }

    fn authenticated(&mut self, ctrl: &Ctrl, token: Option<String>) {
        if let Some(token) = ctrl.param_str("token").map(str::to_string).or(token) {
            self.token = Some(token);
        }
        if let Some(user) = ctrl.param_str("user") {
            info!(user, "authenticated");
            self.user_id.send_replace(Some(user.to_string()));
        }
        self.needs_login = false;
    }

    fn subscribe(&mut self, name: String, respond_to: Responder) {
        if let Err(error) = self.ensure_ready(false) {
            let _ = respond_to.send(Err(error));
            return;
        }
        if name.is_empty() || name == NEW_TOPIC {
            let _ = respond_to.send(Err(ChatError::InvalidArgument(format!(
                "'{name}' is not a topic name"
            ))));
            return;
        }
        match self.topics.entry(&name).begin_subscribe() {
            Ok(SubscribeStep::AlreadySubscribed) => {
                let _ = respond_to.send(Ok(already_subscribed(name)));
            }
            Ok(SubscribeStep::Send) => {
                let envelope = Envelope::Subscribe(Subscribe {
                    tag: None,
                    topic: name.clone(),
                    set: None,
                    get: None,
                });
                let followup = Followup::Subscribed {
                    topic: name,
                    resubscribe: false,
                };
                self.issue(envelope, Expect::Ctrl, followup, Some(respond_to));
            }
            Err(error) => {
                let _ = respond_to.send(Err(error));
            }
        }
    }

    fn leave(&mut self, name: String, unsub: bool, respond_to: Responder) {
        if let Err(error) = self.ensure_ready(false) {
            let _ = respond_to.send(Err(error));
            return;
        }
        let begun = match self.topics.get_mut(&name) {
            Some(topic) => topic.begin_leave(),
            None => Err(ChatError::NotSubscribed(name.clone())),
        };
        if let Err(error) = begun {
            let _ = respond_to.send(Err(error));
            return;
        }
        let envelope = Envelope::Leave(Leave {
            tag: None,
            topic: name.clone(),
            unsub,
        });
        self.issue(
            envelope,
            Expect::Ctrl,
            Followup::Left { topic: name },
            Some(respond_to),
        );
    }

    fn history(&mut self, topic: String, query: GetQuery, respond_to: HistoryResponder) {
        if let Err(error) = self.ensure_ready(false) {
            let _ = respond_to.send(Err(error));
            return;
        }
        let (since, before) = (query.since_id, query.before_id);
        let envelope = Envelope::Get(Get {
            tag: None,
            topic: topic.clone(),
            query,
        });
        match self.issue(envelope, Expect::Ctrl, Followup::History, None) {
            Some(tag) => self.histories.push(HistoryBuffer {
                tag,
                topic,
                since,
                before,
                messages: Vec::new(),
                respond_to,
            }),
            None => {
                let _ = respond_to.send(Err(ChatError::NotConnected));
            }
        }
    }

    fn fail_histories(&mut self, error: &ChatError) {
        for buffer in self.histories.drain(..) {
            let _ = buffer.respond_to.send(Err(error.replicate()));
        }
    }

    fn send_note(&self, note: Note) -> Result<(), ChatError> {
        self.ensure_ready(false)?;
        let connection = self.connection.as_ref().ok_or(ChatError::NotConnected)?;
        connection.send(codec::encode(&Envelope::Note(note)))
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            user_id: self.user_id.borrow().clone(),
            generation: self.generation,
            pending_requests: self.correlator.len(),
            anomalies: self.correlator.anomalies(),
            pushes_routed: self.dispatcher.routed(),
            reconnect_attempt: self.backoff.attempt(),
            topics: self.topics.snapshots(),
        }
    }

    fn connect(&mut self, respond_to: oneshot::Sender<Result<(), ChatError>>) {
        match self.state() {
            ConnectionState::Connected => {
                let _ = respond_to.send(Ok(()));
            }
            ConnectionState::Unauthenticated if self.connection.is_some() => {
                let _ = respond_to.send(Ok(()));
            }
            ConnectionState::Connecting
            | ConnectionState::Reauthenticating
            | ConnectionState::Resubscribing => self.connect_waiters.push(respond_to),
            ConnectionState::Closed => {
                let _ = respond_to.send(Err(ChatError::SessionClosed));
            }
            ConnectionState::Disconnected | ConnectionState::Unauthenticated => {
                if let Err(error) = self.config.validate() {
                    let _ = respond_to.send(Err(error));
                    return;
                }
                self.connect_waiters.push(respond_to);
                self.retry_at = None;
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.dialing = Some(generation);
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let addr = self.config.addr();
        let limit = self.config.connect_timeout;
        let dials = self.dial_tx.clone();
        info!(%addr, generation, attempt = self.backoff.attempt(), "dialing");

        tokio::spawn(async move {
            let result = match time::timeout(limit, connector.connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection within {limit:?}"),
                )),
            };
            let _ = dials.send(Dialed { generation, result });
        });
    }

    fn on_dialed(&mut self, dialed: Dialed) {
        if self.dialing != Some(dialed.generation) {
            debug!(generation = dialed.generation, "stale dial result dropped");
            return;
        }
        self.dialing = None;

        match dialed.result {
            Ok(stream) => {
                self.connection = Some(Connection::open(
                    stream,
                    dialed.generation,
                    self.transport_tx.clone(),
                    self.config.connection_options(),
                ));
                let hello = Envelope::Hello(self.config.hello());
                self.issue(hello, Expect::Ctrl, Followup::Handshake, None);
            }
            Err(source) => {
                let addr = self.config.addr();
                warn!(%addr, error = %source, "dial failed");
                self.abandon_connection(ChatError::Connect { addr, source });
            }
        }
    }

    fn after_handshake(&mut self) {
        debug!(generation = self.generation, "handshake complete");
        match self.token.clone() {
            Some(token) if self.reconnecting => {
                self.set_state(ConnectionState::Reauthenticating);
                let login = Envelope::Login(Login {
                    tag: None,
                    scheme: AuthScheme::Token,
                    secret: token,
                });
                let followup = Followup::Authenticated {
                    reauth: true,
                    token: None,
                };
                self.issue(login, Expect::Ctrl, followup, None);
            }
            _ if self.needs_login => {
                self.set_state(ConnectionState::Unauthenticated);
                self.backoff.reset();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            _ => self.begin_resubscribe(),
        }
    }

    fn begin_resubscribe(&mut self) {
        let names = self.topics.pending_resubscribe();
        if names.is_empty() {
            self.session_ready();
            return;
        }

        info!(topics = names.len(), "resubscribing");
        self.set_state(ConnectionState::Resubscribing);
        self.resubscribing = names.len();
        for name in names {
            match self.topics.entry(&name).begin_subscribe() {
                Ok(SubscribeStep::Send) => {
                    let envelope = Envelope::Subscribe(Subscribe {
                        tag: None,
                        topic: name.clone(),
                        set: None,
                        get: None,
                    });
                    let followup = Followup::Subscribed {
                        topic: name,
                        resubscribe: true,
                    };
                    self.issue(envelope, Expect::Ctrl, followup, None);
                }
                Ok(SubscribeStep::AlreadySubscribed) | Err(_) => self.resubscribe_settled(),
            }
        }
    }

    fn resubscribe_settled(&mut self) {
        self.resubscribing = self.resubscribing.saturating_sub(1);
        if self.resubscribing == 0 && self.state() == ConnectionState::Resubscribing {
            self.session_ready();
        }
    }

    fn session_ready(&mut self) {
        self.reconnecting = false;
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);
        info!(generation = self.generation, "session ready");
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_waiters(&mut self, error: &ChatError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.replicate()));
        }
    }

    /// Tears down the current connection or attempt after a failure.
    ///
    /// Topics are demoted before pending requests fail, so a subscribe reply
    /// that lost the race cannot revive a topic. An established session
    /// schedules a reconnect; a first attempt reports to its waiters and
    /// stops.
    fn abandon_connection(&mut self, error: ChatError) {
        let was_up = matches!(
            self.state(),
            ConnectionState::Connected
                | ConnectionState::Reauthenticating
                | ConnectionState::Resubscribing
        );
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.resubscribing = 0;
        self.topics.demote_all();
        for resolved in self.correlator.fail_all(|| ChatError::ConnectionLost) {
            // Follow-ups are moot once the connection is gone.
            self.reply(&resolved.tag, resolved.responder, resolved.outcome);
        }
        self.fail_histories(&ChatError::ConnectionLost);
        if was_up {
            self.reconnecting = true;
        }
        self.fail_waiters(&error);

        if self.reconnecting {
            self.schedule_retry();
        } else if self.needs_login {
            self.set_state(ConnectionState::Unauthenticated);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
        info!(?delay, attempt = self.backoff.attempt(), "reconnect scheduled");
    }

    fn disconnect(&mut self) {
        info!(generation = self.generation, "disconnecting");
        self.retry_at = None;
        self.dialing = None;
        self.reconnecting = false;
        self.resubscribing = 0;
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        for resolved in self.correlator.fail_all(|| ChatError::ConnectionLost) {
            self.reply(&resolved.tag, resolved.responder, resolved.outcome);
        }
        self.fail_histories(&ChatError::ConnectionLost);
        self.fail_waiters(&ChatError::NotConnected);

        self.topics = TopicRegistry::new();
        self.token = None;
        self.needs_login = false;
        self.user_id.send_replace(None);
        self.backoff.reset();
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let current = self.connection.as_ref().map(Connection::generation);
        match event {
            TransportEvent::Envelope {
                generation,
                envelope,
            } => {
                if current != Some(generation) {
                    debug!(
                        generation,
                        kind = envelope.kind(),
                        "envelope from old connection dropped"
                    );
                    return;
                }
                self.route(envelope);
            }
            TransportEvent::Closed { generation, reason } => {
                if current != Some(generation) {
                    debug!(generation, ?reason, "close of old connection ignored");
                    return;
                }
                warn!(generation, ?reason, "connection lost");
                self.abandon_connection(ChatError::ConnectionLost);
            }
        }
    }

    fn route(&mut self, envelope: Envelope) {
        match envelope.route() {
            Route::Response(tag) => {
                if let Some(resolved) = self.correlator.resolve(&tag, envelope) {
                    self.finish(resolved);
                }
            }
            Route::Push => {
                if let Envelope::Data(data) = &envelope {
                    for buffer in self.histories.iter_mut().filter(|buffer| buffer.wants(data)) {
                        buffer.messages.push(data.clone());
                    }
                }
                self.dispatcher.route_push(envelope, &mut self.topics);
            }
            Route::Unexpected => {
                warn!(kind = envelope.kind(), "server sent a client-side envelope, dropped");
            }
        }
    }

    fn sweep(&mut self) {
        for resolved in self.correlator.expire(std::time::Instant::now()) {
            self.finish(resolved);
        }
        for (tag, followup) in self.correlator.prune_cancelled() {
            self.abandon_followup(&tag, followup);
        }
        // History waiters hold their own responder, so the correlator cannot
        // see them go away.
        let (gone, kept): (Vec<_>, Vec<_>) = self
            .histories
            .drain(..)
            .partition(|buffer| buffer.respond_to.is_closed());
        self.histories = kept;
        for buffer in gone {
            self.correlator.cancel(&buffer.tag);
        }
    }

    fn shut_down(&mut self) {
        debug!("all session handles dropped, worker stopping");
        self.retry_at = None;
        self.dialing = None;
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        for resolved in self.correlator.fail_all(|| ChatError::SessionClosed) {
            self.reply(&resolved.tag, resolved.responder, resolved.outcome);
        }
        self.fail_histories(&ChatError::SessionClosed);
        self.fail_waiters(&ChatError::SessionClosed);
        self.set_state(ConnectionState::Closed);
    }
}

/// Synthesized reply for a subscribe that needed no round trip.
fn already_subscribed(topic: String) -> Envelope {
    Envelope::Ctrl(Ctrl {
        tag: None,
        topic: Some(topic),
        code: 304,
        text: "already subscribed".into(),
        params: Default::default(),
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
