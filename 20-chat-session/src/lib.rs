//! Async client for a tagged request/response chat protocol.
//!
//! A [`Session`] keeps one persistent connection to a chat server and
//! multiplexes many concurrent requests over it. Every request carries a
//! tag, replies are matched back by tag in whatever order they arrive, and
//! server pushes are routed to the topic they name. When the connection
//! drops, in-flight requests fail with `ConnectionLost` and the session
//! reconnects with backoff, logs in again with its cached token, and
//! restores its subscriptions.
//!
//! Modules, leaf first:
//!
//! - [`message`] defines the envelopes and how inbound ones are classified.
//! - [`codec`] frames envelopes as newline-delimited JSON.
//! - [`transport`] owns the byte stream and its reader and writer tasks.
//! - [`correlator`] hands out tags and matches replies to requests.
//! - [`topic`] tracks each topic's subscription state and cached metadata.
//! - [`dispatcher`] routes pushes to topics or the session-wide listener.
//! - [`runtime`] is the single worker task that owns all of the above.
//! - [`session`] is the public handle callers hold.
//!
//! ```no_run
//! use chat_session::{Credentials, Session, SessionConfig};
//!
//! # async fn demo() -> Result<(), chat_session::ChatError> {
//! let session = Session::new(SessionConfig::default().with_server("localhost", 16060));
//! session.connect().await?;
//! session.register(&Credentials::new("alice", "secret")).await?;
//! let topic = session.new_topic().await?;
//! let seq = session.publish(&topic, "hello").await?;
//! println!("published as #{seq}");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod runtime;
pub mod session;
pub mod topic;
pub mod transport;

pub use config::SessionConfig;
pub use dispatcher::SessionEvent;
pub use error::{ChatError, DecodeError, Delivery};
pub use runtime::{ConnectionState, SessionSnapshot};
pub use session::{Credentials, Profile, Session, TopicHandle};
pub use topic::{SubscriptionState, TopicEvent, TopicSnapshot};
