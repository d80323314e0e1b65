//! The event router (C5): subscription-set bookkeeping and the filtering
//! primitives the application executor (C6) builds on.
//!
//! Subscription mutation always goes through [`crate::command::CommandPipeline`]
//! so it shares the same wire-ordering guarantee as every other command;
//! this module adds only the monotonic-set bookkeeping spec.md §4.5
//! requires on top of that. Grounded in shape on `rust-billing-engine`'s
//! one-shot `event plain CHANNEL_CREATE CHANNEL_ANSWER
//! CHANNEL_HANGUP_COMPLETE` subscribe call in `esl::connection::connect`,
//! generalized here into an incremental, monotonic set rather than one
//! fixed command issued once at connect time.

use crate::command::CommandPipeline;
use crate::error::Result;
use crate::message::{EventMessage, EventName, Message};
use crate::stream::{MessageStream, StreamEvent, Subscription};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Drains an already-armed subscription until `predicate` matches an
/// event, or the feed closes. Standalone (rather than a method) so
/// callers can call [`EventRouter::watch`] synchronously to arm the
/// subscription at the right moment and only `.await` this afterward.
pub async fn wait_for<F>(mut sub: Subscription, predicate: F) -> Option<EventMessage>
where
    F: Fn(&EventMessage) -> bool,
{
    loop {
        match sub.next().await {
            Some(StreamEvent::Message(msg)) => {
                if let Message::Event(event) = msg.as_ref() {
                    if predicate(event) {
                        return Some(event.clone());
                    }
                }
            }
            Some(StreamEvent::Error(_)) | None => return None,
        }
    }
}

#[derive(Default)]
struct SubscriptionState {
    events: BTreeSet<String>,
    custom: BTreeSet<String>,
}

/// Owns the connection's subscribed-events set and exposes the event
/// filtering primitives §4.6 needs.
pub struct EventRouter {
    pipeline: Arc<CommandPipeline>,
    stream: Arc<MessageStream>,
    subscription: Mutex<SubscriptionState>,
}

impl EventRouter {
    pub fn new(pipeline: Arc<CommandPipeline>, stream: Arc<MessageStream>) -> Self {
        Self { pipeline, stream, subscription: Mutex::new(SubscriptionState::default()) }
    }

    /// Union `names` into the subscribed-events set. Issues `event plain
    /// ...` only if at least one name was new; holding the subscription
    /// lock across the send keeps two concurrent callers from both
    /// observing a stale "nothing new" view.
    pub async fn subscribe_events(&self, names: &[&str]) -> Result<()> {
        let mut state = self.subscription.lock().await;
        let before = state.events.len();
        for name in names {
            state.events.insert(name.to_string());
        }
        if state.events.len() == before {
            return Ok(());
        }
        self.issue_event_plain(&state).await
    }

    /// Union `subclasses` into the custom-events set. `CUSTOM` is emitted
    /// once, followed by every custom subclass ever subscribed.
    pub async fn subscribe_custom_events(&self, subclasses: &[&str]) -> Result<()> {
        let mut state = self.subscription.lock().await;
        let before = state.custom.len();
        for subclass in subclasses {
            state.custom.insert(subclass.to_string());
        }
        if state.custom.len() == before {
            return Ok(());
        }
        self.issue_event_plain(&state).await
    }

    async fn issue_event_plain(&self, state: &SubscriptionState) -> Result<()> {
        let mut parts: Vec<&str> = state.events.iter().map(String::as_str).collect();
        if !state.custom.is_empty() {
            parts.push("CUSTOM");
            parts.extend(state.custom.iter().map(String::as_str));
        }
        let command = format!("event plain {}", parts.join(" "));
        let reply = self.pipeline.send_command(&command).await?;
        if !reply.success() {
            return Err(crate::error::EslError::ProtocolViolation(format!(
                "event plain rejected: {}",
                reply.error_message().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Await the first event satisfying `predicate`. Returns `None` if the
    /// connection terminates (cleanly or not) before a match arrives —
    /// per spec.md §4.6, a dead connection resolves app-execution waits
    /// with an absent result, not an error.
    pub async fn first_matching<F>(&self, predicate: F) -> Option<EventMessage>
    where
        F: Fn(&EventMessage) -> bool,
    {
        wait_for(self.stream.subscribe(), predicate).await
    }

    /// Subscribe to the live feed immediately (no `await`). Callers that
    /// need their observer armed before writing a command — see
    /// [`crate::application::ApplicationExecutor`] — must call this
    /// *before* sending, since an `async fn`'s body, including whatever
    /// subscribe call it contains, doesn't run until first polled.
    pub fn watch(&self) -> crate::stream::Subscription {
        self.stream.subscribe()
    }

    /// The first `CHANNEL_HANGUP` for `unique_id`.
    pub async fn on_hangup(&self, unique_id: &str) -> Option<EventMessage> {
        self.first_matching(|event| {
            event.event_name() == EventName::ChannelHangup && event.unique_id() == Some(unique_id)
        })
        .await
    }

    /// A fresh cursor over every event message, regardless of scope.
    pub fn events(&self) -> EventStream {
        EventStream { inner: self.stream.subscribe(), channel_scoped: false }
    }

    /// A fresh cursor over events carrying a `Unique-ID` — i.e. events
    /// tied to a specific call leg, excluding connection-wide events like
    /// `HEARTBEAT` or a `BACKGROUND_JOB` result.
    pub fn channel_events(&self) -> EventStream {
        EventStream { inner: self.stream.subscribe(), channel_scoped: true }
    }
}

/// A live cursor over [`EventMessage`]s.
pub struct EventStream {
    inner: crate::stream::Subscription,
    channel_scoped: bool,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<EventMessage> {
        loop {
            match self.inner.next().await {
                Some(StreamEvent::Message(msg)) => {
                    if let Message::Event(event) = msg.as_ref() {
                        if self.channel_scoped && event.unique_id().is_none() {
                            continue;
                        }
                        return Some(event.clone());
                    }
                }
                Some(StreamEvent::Error(_)) | None => return None,
            }
        }
    }
}
