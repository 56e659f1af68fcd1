use std::io;

use thiserror::Error;

/// Failure to turn one frame into an [`Envelope`](crate::message::Envelope).
///
/// Decode errors never close the connection: the reader logs them, drops the
/// offending frame, and keeps reading.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("stream ended in the middle of a frame ({len} bytes buffered)")]
    Truncated { len: usize },
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
}

/// Whether the server could have observed a failed request.
///
/// Callers use this to decide if a retry is safe. Publishing after an
/// `Ambiguous` failure may duplicate the message, so it needs an
/// application-level deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The request never left the client.
    NotSent,
    /// The request was written, but no answer arrived.
    Ambiguous,
    /// The server answered (with an error).
    Observed,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("not connected")]
    NotConnected,
    #[error("connection lost while the request was in flight")]
    ConnectionLost,
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("topic '{0}' is not subscribed")]
    NotSubscribed(String),
    #[error("topic '{topic}' is busy ({state})")]
    TopicBusy { topic: String, state: &'static str },
    #[error("session is not authenticated; log in again")]
    Unauthenticated,
    #[error("server rejected the request: {code} {text}")]
    ServerError { code: u16, text: String },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session worker has shut down")]
    SessionClosed,
}

impl ChatError {
    pub fn delivery(&self) -> Delivery {
        match self {
            ChatError::ConnectionLost | ChatError::Timeout(_) => Delivery::Ambiguous,
            ChatError::ServerError { .. } | ChatError::UnexpectedResponse(_) => Delivery::Observed,
            _ => Delivery::NotSent,
        }
    }

    /// True when retrying cannot apply the request twice.
    pub fn is_retry_safe(&self) -> bool {
        self.delivery() == Delivery::NotSent
    }

    /// Server codes in the 4xx range mean the request itself was refused.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ChatError::ServerError { code, .. } if (400..500).contains(code))
    }

    /// Copies an error for fan-out to several waiters. Sources that cannot
    /// be cloned are flattened to their message.
    pub(crate) fn replicate(&self) -> ChatError {
        match self {
            ChatError::Connect { addr, source } => ChatError::Connect {
                addr: addr.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            ChatError::NotConnected => ChatError::NotConnected,
            ChatError::ConnectionLost => ChatError::ConnectionLost,
            ChatError::Timeout(limit) => ChatError::Timeout(*limit),
            ChatError::NotSubscribed(topic) => ChatError::NotSubscribed(topic.clone()),
            ChatError::TopicBusy { topic, state } => ChatError::TopicBusy {
                topic: topic.clone(),
                state: *state,
            },
            ChatError::Unauthenticated => ChatError::Unauthenticated,
            ChatError::ServerError { code, text } => ChatError::ServerError {
                code: *code,
                text: text.clone(),
            },
            ChatError::UnexpectedResponse(what) => ChatError::UnexpectedResponse(what.clone()),
            ChatError::InvalidArgument(what) => ChatError::InvalidArgument(what.clone()),
            ChatError::SessionClosed => ChatError::SessionClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivery_classification() {
        assert_eq!(ChatError::NotConnected.delivery(), Delivery::NotSent);
        assert_eq!(
            ChatError::NotSubscribed("grp1".into()).delivery(),
            Delivery::NotSent
        );
        assert_eq!(ChatError::ConnectionLost.delivery(), Delivery::Ambiguous);
        assert_eq!(
            ChatError::Timeout(Duration::from_secs(1)).delivery(),
            Delivery::Ambiguous
        );
        assert_eq!(
            ChatError::ServerError {
                code: 409,
                text: "conflict".into()
            }
            .delivery(),
            Delivery::Observed
        );
    }

    #[test]
    fn rejection_covers_client_errors_only() {
        let rejected = ChatError::ServerError {
            code: 401,
            text: "authentication failed".into(),
        };
        let crashed = ChatError::ServerError {
            code: 500,
            text: "internal error".into(),
        };
        assert!(rejected.is_rejection());
        assert!(!crashed.is_rejection());
        assert!(!rejected.is_retry_safe());
    }

    #[test]
    fn replicated_errors_keep_their_delivery() {
        let dial = ChatError::Connect {
            addr: "localhost:16060".into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        let copy = dial.replicate();
        assert_eq!(copy.to_string(), dial.to_string());
        assert_eq!(copy.delivery(), Delivery::NotSent);

        let denied = ChatError::ServerError {
            code: 401,
            text: "authentication failed".into(),
        };
        assert!(denied.replicate().is_rejection());
    }
}
