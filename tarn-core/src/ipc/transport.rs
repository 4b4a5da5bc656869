//! The seam between this crate and the native host process.
//!
//! The host is an external collaborator: it executes commands and emits
//! stream events. Everything we require of it is captured by
//! [`IpcTransport`], so tests (and alternative hosts) can provide an
//! in-memory implementation.

use std::fmt;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use serde_json::Value;

/// Raw, untranslated error payload produced by the native host.
///
/// Translate with [`parse_host_error`][crate::error::parse_host_error]
/// before surfacing.
#[derive(Debug, Clone)]
pub struct HostError(pub String);

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HostError {}

/// Kind tag of one stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    Schema,
    Batch,
    Complete,
    Error,
}

/// One event on a `stream-binary-<streamId>` topic.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub data: Bytes,
    /// Backend-side ordinal, when the host includes one. Acknowledgements
    /// are keyed off the reader's own monotonic counter.
    pub batch_index: Option<u64>,
}

impl StreamEvent {
    pub fn schema(data: impl Into<Bytes>) -> Self {
        StreamEvent {
            kind: StreamEventKind::Schema,
            data: data.into(),
            batch_index: None,
        }
    }

    pub fn batch(data: impl Into<Bytes>) -> Self {
        StreamEvent {
            kind: StreamEventKind::Batch,
            data: data.into(),
            batch_index: None,
        }
    }

    /// A completion marker carrying the emitted batch count.
    pub fn complete(count: u32) -> Self {
        StreamEvent {
            kind: StreamEventKind::Complete,
            data: Bytes::copy_from_slice(&count.to_le_bytes()),
            batch_index: None,
        }
    }

    pub fn error(message: impl AsRef<str>) -> Self {
        StreamEvent {
            kind: StreamEventKind::Error,
            data: Bytes::copy_from_slice(message.as_ref().as_bytes()),
            batch_index: None,
        }
    }
}

/// A live subscription to one event topic.
///
/// Dropping the subscription (or calling [`unsubscribe`][Self::unsubscribe])
/// runs the transport's unsubscribe hook exactly once.
pub struct EventSubscription {
    topic: String,
    receiver: flume::Receiver<StreamEvent>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl EventSubscription {
    pub fn new(
        topic: impl Into<String>,
        receiver: flume::Receiver<StreamEvent>,
        on_unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        EventSubscription {
            topic: topic.into(),
            receiver,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn receiver(&self) -> flume::Receiver<StreamEvent> {
        self.receiver.clone()
    }

    pub fn unsubscribe(mut self) {
        if let Some(hook) = self.on_unsubscribe.take() {
            hook();
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_unsubscribe.take() {
            hook();
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("topic", &self.topic)
            .finish()
    }
}

/// The IPC channel to the native host.
///
/// All requests are `(command, args) → result`; argument records use
/// snake_case keys and are forwarded unchanged. `subscribe` resolves only
/// once the subscription is ready to receive events — callers rely on this
/// to order subscription before query dispatch.
pub trait IpcTransport: Send + Sync + 'static {
    fn invoke<'a>(&'a self, command: &'a str, args: Value) -> BoxFuture<'a, Result<Value, HostError>>;

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<EventSubscription, HostError>>;
}
