//! Matching replies to the requests that caused them.
//!
//! The correlator is owned by the session worker and never shared, so it
//! needs no locking. Each pending request carries a worker-defined `context`
//! (what to do to session state when the reply lands) and an optional
//! responder for the caller that is waiting on it.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    codec,
    error::ChatError,
    message::{Envelope, Expect, Tag},
    transport::Connection,
};

pub type Outcome = Result<Envelope, ChatError>;

pub type Responder = oneshot::Sender<Outcome>;

/// First tag handed out on a fresh session.
const FIRST_TAG: u64 = 101;

pub struct PendingRequest<C> {
    pub tag: Tag,
    pub kind: &'static str,
    pub expect: Expect,
    pub timeout: Duration,
    pub deadline: Instant,
    pub context: C,
    pub responder: Option<Responder>,
}

/// A pending request that has reached its end.
#[derive(Debug)]
pub struct Resolved<C> {
    pub tag: Tag,
    pub context: C,
    pub responder: Option<Responder>,
    pub outcome: Outcome,
}

impl<C> Resolved<C> {
    /// Hands the outcome to the waiting caller, if any. Returns false when
    /// the caller stopped waiting.
    pub fn respond(self) -> bool {
        match self.responder {
            Some(responder) => responder.send(self.outcome).is_ok(),
            None => true,
        }
    }
}

pub struct Correlator<C> {
    pending: HashMap<Tag, PendingRequest<C>>,
    next_tag: u64,
    anomalies: u64,
}

impl<C> Default for Correlator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Correlator<C> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_tag: FIRST_TAG,
            anomalies: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, tag: &str) -> bool {
        self.pending.contains_key(tag)
    }

    /// Replies that matched nothing: late, duplicated, or foreign tags.
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    fn allocate_tag(&mut self) -> Tag {
        loop {
            let tag = self.next_tag.to_string();
            self.next_tag = self.next_tag.wrapping_add(1);
            if !self.pending.contains_key(&tag) {
                return tag;
            }
        }
    }

    /// Tags the envelope, registers it as pending, and sends it.
    ///
    /// Nothing is registered when the send fails: the request comes back
    /// already resolved with the error, so its caller sees it as not-sent.
    pub fn issue(
        &mut self,
        mut envelope: Envelope,
        timeout: Duration,
        expect: Expect,
        context: C,
        responder: Option<Responder>,
        connection: &Connection,
    ) -> Result<Tag, Resolved<C>> {
        let tag = self.allocate_tag();
        let sent = if envelope.set_tag(tag.clone()) {
            connection.send(codec::encode(&envelope))
        } else {
            Err(ChatError::InvalidArgument(format!(
                "{} envelopes do not take a tag",
                envelope.kind()
            )))
        };
        if let Err(error) = sent {
            return Err(Resolved {
                tag,
                context,
                responder,
                outcome: Err(error),
            });
        }
        debug!(%tag, kind = envelope.kind(), "request issued");

        self.pending.insert(
            tag.clone(),
            PendingRequest {
                tag: tag.clone(),
                kind: envelope.kind(),
                expect,
                timeout,
                deadline: Instant::now() + timeout,
                context,
                responder,
            },
        );
        Ok(tag)
    }

    /// Completes the request with `tag`.
    ///
    /// Unknown tags and unexpected reply kinds are dropped and counted.
    pub fn resolve(&mut self, tag: &str, envelope: Envelope) -> Option<Resolved<C>> {
        let Some(pending) = self.pending.get(tag) else {
            self.anomalies += 1;
            warn!(%tag, kind = envelope.kind(), "reply for unknown tag dropped");
            return None;
        };

        if !pending.expect.accepts(&envelope) {
            self.anomalies += 1;
            warn!(
                %tag,
                request = pending.kind,
                reply = envelope.kind(),
                "reply kind not expected for request, dropped"
            );
            return None;
        }

        let pending = self.pending.remove(tag)?;
        Some(Resolved {
            outcome: reply_outcome(envelope),
            tag: pending.tag,
            context: pending.context,
            responder: pending.responder,
        })
    }

    /// Counts a reply whose caller had already gone away.
    pub fn record_orphan(&mut self, tag: &str) {
        self.anomalies += 1;
        debug!(%tag, "caller stopped waiting before the reply arrived");
    }

    /// Resolves every request whose deadline has passed with `Timeout`.
    pub fn expire(&mut self, now: Instant) -> Vec<Resolved<C>> {
        let overdue: Vec<Tag> = self
            .pending
            .values()
            .filter(|pending| pending.deadline <= now)
            .map(|pending| pending.tag.clone())
            .collect();

        overdue
            .into_iter()
            .filter_map(|tag| self.pending.remove(&tag))
            .map(|pending| {
                warn!(tag = %pending.tag, kind = pending.kind, "request timed out");
                Resolved {
                    tag: pending.tag,
                    context: pending.context,
                    responder: pending.responder,
                    outcome: Err(ChatError::Timeout(pending.timeout)),
                }
            })
            .collect()
    }

    /// Drops requests whose caller has cancelled by dropping its receiver.
    ///
    /// Requests without a responder belong to the worker and are kept.
    pub fn prune_cancelled(&mut self) -> Vec<(Tag, C)> {
        let cancelled: Vec<Tag> = self
            .pending
            .values()
            .filter(|pending| {
                pending
                    .responder
                    .as_ref()
                    .is_some_and(|responder| responder.is_closed())
            })
            .map(|pending| pending.tag.clone())
            .collect();

        cancelled
            .into_iter()
            .filter_map(|tag| self.cancel(&tag))
            .map(|pending| (pending.tag, pending.context))
            .collect()
    }

    pub fn cancel(&mut self, tag: &str) -> Option<PendingRequest<C>> {
        let pending = self.pending.remove(tag)?;
        debug!(%tag, kind = pending.kind, "pending request cancelled");
        Some(pending)
    }

    /// Empties the pending map, resolving everything with `error()`.
    pub fn fail_all(&mut self, error: impl Fn() -> ChatError) -> Vec<Resolved<C>> {
        self.pending
            .drain()
            .map(|(tag, pending)| Resolved {
                tag,
                context: pending.context,
                responder: pending.responder,
                outcome: Err(error()),
            })
            .collect()
    }
}

fn reply_outcome(envelope: Envelope) -> Outcome {
    match envelope {
        Envelope::Ctrl(ctrl) if !ctrl.is_success() => Err(ChatError::ServerError {
            code: ctrl.code,
            text: ctrl.text,
        }),
        other => Ok(other),
    }
}

/// The caller's side of a pending request.
///
/// Dropping it before completion cancels the wait; the worker forgets the
/// request on its next sweep and a late reply is discarded.
pub struct PendingResponse {
    receiver: oneshot::Receiver<Outcome>,
    limit: Duration,
}

impl PendingResponse {
    pub fn new(receiver: oneshot::Receiver<Outcome>, limit: Duration) -> Self {
        Self { receiver, limit }
    }

    pub async fn await_response(self) -> Outcome {
        let limit = self.limit;
        self.await_within(limit).await
    }

    /// Like [`await_response`](Self::await_response) with a caller-chosen
    /// bound, typically shorter than the request timeout.
    pub async fn await_within(self, limit: Duration) -> Outcome {
        match tokio::time::timeout(limit, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChatError::SessionClosed),
            Err(_) => Err(ChatError::Timeout(limit)),
        }
    }
}
