//! Envelopes exchanged with the chat server.
//!
//! Every envelope is one JSON object with a `kind` discriminator. Requests
//! carry a `tag` chosen by the client; `ctrl` and `meta` replies echo it.
//! Anything else the server sends is a push.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation tag linking a request to its reply.
pub type Tag = String;

pub type Headers = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Hello(Hello),
    Account(Account),
    Login(Login),
    Subscribe(Subscribe),
    Leave(Leave),
    Publish(Publish),
    Get(Get),
    Set(Set),
    Delete(Delete),
    Note(Note),
    Data(Data),
    Ctrl(Ctrl),
    Meta(Meta),
    Presence(Presence),
}

/// Where an inbound envelope belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Reply to the pending request with this tag.
    Response(Tag),
    /// Server-initiated; goes to the event dispatcher.
    Push,
    /// A client-to-server kind; the server should never send these.
    Unexpected,
}

/// Reply kinds a pending request will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Ctrl,
    CtrlOrMeta,
}

impl Expect {
    pub fn accepts(self, envelope: &Envelope) -> bool {
        match (self, envelope) {
            (_, Envelope::Ctrl(_)) => true,
            (Expect::CtrlOrMeta, Envelope::Meta(_)) => true,
            _ => false,
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => "hello",
            Envelope::Account(_) => "account",
            Envelope::Login(_) => "login",
            Envelope::Subscribe(_) => "subscribe",
            Envelope::Leave(_) => "leave",
            Envelope::Publish(_) => "publish",
            Envelope::Get(_) => "get",
            Envelope::Set(_) => "set",
            Envelope::Delete(_) => "delete",
            Envelope::Note(_) => "note",
            Envelope::Data(_) => "data",
            Envelope::Ctrl(_) => "ctrl",
            Envelope::Meta(_) => "meta",
            Envelope::Presence(_) => "presence",
        }
    }

    pub fn tag(&self) -> Option<&str> {
        let tag = match self {
            Envelope::Hello(m) => &m.tag,
            Envelope::Account(m) => &m.tag,
            Envelope::Login(m) => &m.tag,
            Envelope::Subscribe(m) => &m.tag,
            Envelope::Leave(m) => &m.tag,
            Envelope::Publish(m) => &m.tag,
            Envelope::Get(m) => &m.tag,
            Envelope::Set(m) => &m.tag,
            Envelope::Delete(m) => &m.tag,
            Envelope::Ctrl(m) => &m.tag,
            Envelope::Meta(m) => &m.tag,
            Envelope::Note(_) | Envelope::Data(_) | Envelope::Presence(_) => return None,
        };
        tag.as_deref()
    }

    /// Stamps a correlation tag on a request. Returns false for kinds that
    /// never carry one.
    pub fn set_tag(&mut self, tag: Tag) -> bool {
        let slot = match self {
            Envelope::Hello(m) => &mut m.tag,
            Envelope::Account(m) => &mut m.tag,
            Envelope::Login(m) => &mut m.tag,
            Envelope::Subscribe(m) => &mut m.tag,
            Envelope::Leave(m) => &mut m.tag,
            Envelope::Publish(m) => &mut m.tag,
            Envelope::Get(m) => &mut m.tag,
            Envelope::Set(m) => &mut m.tag,
            Envelope::Delete(m) => &mut m.tag,
            _ => return false,
        };
        *slot = Some(tag);
        true
    }

    pub fn is_request(&self) -> bool {
        !matches!(
            self,
            Envelope::Data(_) | Envelope::Ctrl(_) | Envelope::Meta(_) | Envelope::Presence(_)
        )
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Envelope::Subscribe(m) => Some(&m.topic),
            Envelope::Leave(m) => Some(&m.topic),
            Envelope::Publish(m) => Some(&m.topic),
            Envelope::Get(m) => Some(&m.topic),
            Envelope::Set(m) => Some(&m.topic),
            Envelope::Delete(m) => Some(&m.topic),
            Envelope::Note(m) => Some(&m.topic),
            Envelope::Data(m) => Some(&m.topic),
            Envelope::Meta(m) => Some(&m.topic),
            Envelope::Presence(m) => Some(&m.topic),
            Envelope::Ctrl(m) => m.topic.as_deref(),
            Envelope::Hello(_) | Envelope::Account(_) | Envelope::Login(_) => None,
        }
    }

    /// Classifies an envelope received from the server.
    pub fn route(&self) -> Route {
        match self {
            Envelope::Ctrl(Ctrl { tag: Some(tag), .. })
            | Envelope::Meta(Meta { tag: Some(tag), .. }) => Route::Response(tag.clone()),
            Envelope::Ctrl(_) | Envelope::Meta(_) | Envelope::Data(_) | Envelope::Presence(_) => {
                Route::Push
            }
            _ => Route::Unexpected,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    Basic,
    Token,
    Anonymous,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub user_agent: String,
    pub ver: String,
    pub device_id: String,
    pub lang: String,
    pub platform: String,
}

/// Account creation; `user_id` is `"new"` for registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub user_id: String,
    pub scheme: AuthScheme,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub login: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Login {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub scheme: AuthScheme,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscribe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<SetQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<GetQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Leave {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    #[serde(default)]
    pub unsub: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Publish {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    #[serde(default)]
    pub no_echo: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub head: Headers,
    pub content: Value,
}

impl Publish {
    pub fn new(topic: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            tag: None,
            topic: topic.into(),
            no_echo: false,
            head: Headers::new(),
            content: content.into(),
        }
    }

    pub fn no_echo(mut self, no_echo: bool) -> Self {
        self.no_echo = no_echo;
        self
    }

    /// Adds a header such as `mime`, `reply`, `thread`, or `mentions`.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.head.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GetWhat {
    Desc,
    Sub,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetQuery {
    pub what: GetWhat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl GetQuery {
    pub fn new(what: GetWhat) -> Self {
        Self {
            what,
            if_modified_since: None,
            since_id: None,
            before_id: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Get {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    pub query: GetQuery,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetDesc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Set {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    pub query: SetQuery,
}

/// Inclusive-exclusive range of message sequence ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeqRange {
    pub low: u64,
    pub hi: u64,
}

impl SeqRange {
    pub fn single(seq_id: u64) -> Self {
        Self {
            low: seq_id,
            hi: seq_id + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    pub ranges: Vec<SeqRange>,
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoteWhat {
    KeyPress,
    Recv,
    Read,
}

/// Ephemeral notification. Not acknowledged by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub topic: String,
    pub what: NoteWhat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Data {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    pub seq_id: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub head: Headers,
    #[serde(default)]
    pub content: Value,
}

impl Data {
    pub fn sent_at(&self) -> SystemTime {
        millis_to_time(self.timestamp)
    }

    pub fn deleted_at(&self) -> Option<SystemTime> {
        self.deleted_at.filter(|ms| *ms != 0).map(millis_to_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ctrl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub code: u16,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl Ctrl {
    /// 1xx-3xx. A 304 "not modified" or "already subscribed" is a success.
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    pub fn param_u64(&self, name: &str) -> Option<u64> {
        self.params.get(name).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultAccess {
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub anon: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessMode {
    #[serde(default)]
    pub want: String,
    #[serde(default)]
    pub given: String,
}

/// Topic metadata as reported by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicDescription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defacs: Option<DefaultAccess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acs: Option<AccessMode>,
    pub seq_id: u64,
    pub read_id: u64,
    pub recv_id: u64,
    pub del_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// One row of a subscription listing: a user subscribed to a topic, or a
/// topic the current user is subscribed to (when querying `me`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Subscription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touched_at: Option<u64>,
    pub seq_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<TopicDescription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub: Vec<Subscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Presence {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub what: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<u64>,
}

fn millis_to_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Milliseconds since the Unix epoch, as the server expects in queries.
pub fn time_to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
