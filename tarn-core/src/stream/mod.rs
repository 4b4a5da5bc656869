//! Lazy, cancellable sequences of record batches.
//!
//! [`QueryStream`] is the uniform consumer contract: a single-pass,
//! non-restartable sequence of [`RecordBatch`]es with explicit cancellation.
//! The in-process engine backs it with an already-materialized result
//! (exactly one yield); the IPC engine backs it with the event-channel
//! reader and its acknowledgement window.

#[cfg(feature = "ipc")]
mod ack;
mod attach;

pub use attach::AttachSpec;
pub(crate) use attach::{attach_statements, quote_ident, quote_literal};

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::error::Result;
use crate::result_set::BatchSet;

#[cfg(feature = "ipc")]
use reader::BatchStream;

/// Open an IPC-backed stream and wrap it in the uniform consumer type.
#[cfg(feature = "ipc")]
pub(crate) async fn open_ipc_stream(
    transport: Arc<dyn crate::ipc::transport::IpcTransport>,
    stream_id: String,
    sql: &str,
    attach: &[AttachSpec],
) -> Result<QueryStream> {
    let reader = BatchStream::open(transport, stream_id, sql, attach).await?;
    Ok(QueryStream::from_reader(reader))
}

/// A lazy, single-pass sequence of record batches.
pub struct QueryStream(Inner);

enum Inner {
    /// The whole result was materialized up front; batches are yielded from
    /// memory. This is how the in-process engine streams.
    Once {
        schema: SchemaRef,
        batches: VecDeque<RecordBatch>,
        cancelled: bool,
    },

    #[cfg(feature = "ipc")]
    Reader(BatchStream),
}

impl QueryStream {
    /// A stream over an already-materialized result.
    pub fn from_batch_set(set: BatchSet) -> Self {
        QueryStream(Inner::Once {
            schema: set.schema,
            batches: set.batches.into(),
            cancelled: false,
        })
    }

    #[cfg(feature = "ipc")]
    pub(crate) fn from_reader(reader: BatchStream) -> Self {
        QueryStream(Inner::Reader(reader))
    }

    /// The next batch, or `None` once the stream is done.
    ///
    /// After an error is returned once, subsequent calls return `None`.
    pub async fn next(&mut self) -> Option<Result<RecordBatch>> {
        match &mut self.0 {
            Inner::Once {
                batches, cancelled, ..
            } => {
                if *cancelled {
                    return None;
                }
                batches.pop_front().map(Ok)
            }

            #[cfg(feature = "ipc")]
            Inner::Reader(reader) => reader.next().await,
        }
    }

    /// Await completion and return every remaining batch.
    ///
    /// On an IPC stream this switches to unbounded prefetch and immediately
    /// flushes acknowledgements for anything queued but unacknowledged.
    pub async fn get_table(&mut self) -> Result<BatchSet> {
        match &mut self.0 {
            Inner::Once {
                schema,
                batches,
                cancelled,
            } => {
                let remaining = if *cancelled {
                    Vec::new()
                } else {
                    batches.drain(..).collect()
                };
                Ok(BatchSet::new(Arc::clone(schema), remaining))
            }

            #[cfg(feature = "ipc")]
            Inner::Reader(reader) => reader.get_table().await,
        }
    }

    /// Mark the stream cancelled and release client resources immediately.
    ///
    /// On an IPC stream the event subscription is removed synchronously and
    /// the backend cancel is fired without waiting for it. Subsequent
    /// `next()` calls return `None`.
    pub fn cancel(&mut self) {
        match &mut self.0 {
            Inner::Once {
                batches, cancelled, ..
            } => {
                batches.clear();
                *cancelled = true;
            }

            #[cfg(feature = "ipc")]
            Inner::Reader(reader) => reader.cancel(),
        }
    }

    /// The result schema, once known.
    pub fn schema(&self) -> Option<SchemaRef> {
        match &self.0 {
            Inner::Once { schema, .. } => Some(Arc::clone(schema)),

            #[cfg(feature = "ipc")]
            Inner::Reader(reader) => reader.schema(),
        }
    }

    /// True only after an error or a cancellation. A stream that ran to
    /// natural completion is done but not closed.
    pub fn is_closed(&self) -> bool {
        match &self.0 {
            Inner::Once { cancelled, .. } => *cancelled,

            #[cfg(feature = "ipc")]
            Inner::Reader(reader) => reader.is_closed(),
        }
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Inner::Once { batches, .. } => f
                .debug_struct("QueryStream")
                .field("backing", &"materialized")
                .field("pending", &batches.len())
                .finish(),

            #[cfg(feature = "ipc")]
            Inner::Reader(_) => f
                .debug_struct("QueryStream")
                .field("backing", &"ipc")
                .finish(),
        }
    }
}

#[cfg(feature = "ipc")]
mod reader {
    use super::ack::{AckWindow, DEFAULT_PREFETCH_WINDOW};
    use super::AttachSpec;

    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use arrow::datatypes::SchemaRef;
    use arrow::ipc::reader::StreamReader;
    use arrow::record_batch::RecordBatch;
    use bytes::Bytes;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use crate::error::{parse_engine_error, parse_host_error, Error, Result};
    use crate::ipc::transport::{EventSubscription, IpcTransport, StreamEvent, StreamEventKind};
    use crate::result_set::BatchSet;

    /// The IPC-backed record batch reader.
    pub(crate) struct BatchStream {
        shared: Arc<StreamShared>,
        transport: Arc<dyn IpcTransport>,
        stream_id: String,
    }

    struct StreamShared {
        state: Mutex<StreamState>,
        notify: Notify,
        cancel: CancellationToken,
        subscription: Mutex<Option<EventSubscription>>,
    }

    impl StreamShared {
        /// Drop the event subscription, running its unsubscribe hook.
        /// Idempotent; called from every exit path.
        fn drop_subscription(&self) {
            if let Ok(mut slot) = self.subscription.lock() {
                slot.take();
            }
        }
    }

    struct StreamState {
        schema_bytes: Option<Bytes>,
        schema: Option<SchemaRef>,
        queue: VecDeque<(u64, RecordBatch)>,
        acks: AckWindow,
        next_batch_id: u64,
        received: u64,
        complete: bool,
        cancelled: bool,
        failed: bool,
        error: Option<Error>,
    }

    impl BatchStream {
        /// Open a stream against the native backend.
        ///
        /// The order here is load-bearing: the event channel must be
        /// subscribed (and ready) before `stream_query` is dispatched, or
        /// the first events are lost.
        pub(crate) async fn open(
            transport: Arc<dyn IpcTransport>,
            stream_id: String,
            sql: &str,
            attach: &[AttachSpec],
        ) -> Result<BatchStream> {
            let topic = format!("stream-binary-{stream_id}");
            let subscription = transport
                .subscribe(&topic)
                .await
                .map_err(|e| parse_host_error(&e.0))?;
            let events = subscription.receiver();

            let shared = Arc::new(StreamShared {
                state: Mutex::new(StreamState {
                    schema_bytes: None,
                    schema: None,
                    queue: VecDeque::new(),
                    acks: AckWindow::new(DEFAULT_PREFETCH_WINDOW),
                    next_batch_id: 0,
                    received: 0,
                    complete: false,
                    cancelled: false,
                    failed: false,
                    error: None,
                }),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                subscription: Mutex::new(Some(subscription)),
            });

            tokio::spawn(receive_loop(
                Arc::clone(&shared),
                events,
                Arc::clone(&transport),
                stream_id.clone(),
            ));

            let args = serde_json::json!({
                "stream_id": stream_id,
                "sql": sql,
                "attach": attach,
            });
            if let Err(raw) = transport.invoke("stream_query", args).await {
                shared.cancel.cancel();
                shared.drop_subscription();
                return Err(parse_host_error(&raw.0));
            }

            Ok(BatchStream {
                shared,
                transport,
                stream_id,
            })
        }

        pub(crate) async fn next(&mut self) -> Option<Result<RecordBatch>> {
            loop {
                // register for wakeups before inspecting state, or a
                // notification landing in between is lost
                let mut notified = std::pin::pin!(self.shared.notify.notified());
                notified.as_mut().enable();

                enum Step {
                    Yield(RecordBatch, Option<u64>),
                    Fail(Error),
                    Done,
                    Wait,
                }

                let step = {
                    let mut state = self.shared.state.lock().expect("stream state poisoned");

                    if state.cancelled {
                        Step::Done
                    } else if state.failed {
                        match state.error.take() {
                            Some(error) => Step::Fail(error),
                            None => Step::Done,
                        }
                    } else if let Some((id, batch)) = state.queue.pop_front() {
                        let ack = state.acks.on_consume(id).then_some(id);
                        Step::Yield(batch, ack)
                    } else if state.complete {
                        Step::Done
                    } else {
                        Step::Wait
                    }
                };

                match step {
                    Step::Yield(batch, ack) => {
                        if let Some(id) = ack {
                            acknowledge(&*self.transport, &self.stream_id, id).await;
                        }
                        return Some(Ok(batch));
                    }
                    Step::Fail(error) => return Some(Err(error)),
                    Step::Done => return None,
                    Step::Wait => notified.await,
                }
            }
        }

        pub(crate) async fn get_table(&mut self) -> Result<BatchSet> {
            let flush: Vec<u64> = {
                let mut state = self.shared.state.lock().expect("stream state poisoned");
                let queued: Vec<u64> = state.queue.iter().map(|(id, _)| *id).collect();
                state.acks.set_unbounded(queued)
            };
            for id in flush {
                acknowledge(&*self.transport, &self.stream_id, id).await;
            }

            let mut batches = Vec::new();
            while let Some(item) = self.next().await {
                batches.push(item?);
            }

            let schema = self.schema().unwrap_or_else(|| {
                Arc::new(arrow::datatypes::Schema::empty())
            });
            Ok(BatchSet::new(schema, batches))
        }

        pub(crate) fn cancel(&mut self) {
            {
                let mut state = self.shared.state.lock().expect("stream state poisoned");
                if state.cancelled {
                    return;
                }
                state.cancelled = true;
                state.queue.clear();
            }

            self.shared.cancel.cancel();
            // unsubscribe synchronously, before the backend cancel lands
            self.shared.drop_subscription();
            self.shared.notify.notify_waiters();

            // fire-and-forget: client resources are already released
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = Arc::clone(&self.transport);
                let stream_id = self.stream_id.clone();
                handle.spawn(async move {
                    let args = serde_json::json!({ "stream_id": stream_id });
                    if let Err(raw) = transport.invoke("cancel_stream", args).await {
                        log::debug!("backend stream cancel failed: {}", raw.0);
                    }
                });
            }
        }

        pub(crate) fn schema(&self) -> Option<SchemaRef> {
            self.shared
                .state
                .lock()
                .expect("stream state poisoned")
                .schema
                .clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            let state = self.shared.state.lock().expect("stream state poisoned");
            state.failed || state.cancelled
        }
    }

    impl Drop for BatchStream {
        fn drop(&mut self) {
            let active = {
                let state = self.shared.state.lock().expect("stream state poisoned");
                !(state.cancelled || state.complete || state.failed)
            };

            self.shared.cancel.cancel();
            self.shared.drop_subscription();

            if active {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let transport = Arc::clone(&self.transport);
                    let stream_id = self.stream_id.clone();
                    handle.spawn(async move {
                        let args = serde_json::json!({ "stream_id": stream_id });
                        let _ = transport.invoke("cancel_stream", args).await;
                    });
                }
            }
        }
    }

    async fn receive_loop(
        shared: Arc<StreamShared>,
        events: flume::Receiver<StreamEvent>,
        transport: Arc<dyn IpcTransport>,
        stream_id: String,
    ) {
        loop {
            let event = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    // the subscription sender is gone; nothing more will arrive
                    Err(_) => break,
                },
            };

            match event.kind {
                StreamEventKind::Schema => match decode_schema(&event.data) {
                    Ok(schema) => {
                        let mut state = shared.state.lock().expect("stream state poisoned");
                        state.schema_bytes = Some(event.data.clone());
                        state.schema = Some(schema);
                        drop(state);
                        shared.notify.notify_waiters();
                    }
                    Err(error) => {
                        fail(&shared, error);
                        break;
                    }
                },

                StreamEventKind::Batch => {
                    let schema_bytes = {
                        let state = shared.state.lock().expect("stream state poisoned");
                        state.schema_bytes.clone()
                    };
                    let Some(schema_bytes) = schema_bytes else {
                        fail(
                            &shared,
                            Error::protocol("received a record batch before the stream schema"),
                        );
                        break;
                    };

                    match decode_batch(&schema_bytes, &event.data) {
                        Ok(batch) => {
                            let (id, ack_now) = {
                                let mut state =
                                    shared.state.lock().expect("stream state poisoned");
                                let id = state.next_batch_id;
                                state.next_batch_id += 1;
                                state.received += 1;
                                let ack_now = state.acks.on_arrival(id);
                                state.queue.push_back((id, batch));
                                (id, ack_now)
                            };
                            shared.notify.notify_waiters();

                            if ack_now {
                                acknowledge(&*transport, &stream_id, id).await;
                            }
                        }
                        Err(error) => {
                            fail(&shared, error);
                            break;
                        }
                    }
                }

                StreamEventKind::Complete => {
                    let expected = decode_complete(&event.data);
                    let mut state = shared.state.lock().expect("stream state poisoned");
                    state.complete = true;
                    if let Some(expected) = expected {
                        if u64::from(expected) != state.received {
                            log::warn!(
                                "stream {stream_id} completed with {} batches, backend reported {expected}",
                                state.received
                            );
                        }
                    }
                    drop(state);
                    shared.notify.notify_waiters();
                    break;
                }

                StreamEventKind::Error => {
                    let message = String::from_utf8_lossy(&event.data).into_owned();
                    fail(&shared, parse_engine_error(&message));
                    break;
                }
            }
        }

        // every subscribe has a matching unsubscribe on every exit path
        shared.drop_subscription();
        shared.notify.notify_waiters();
    }

    fn fail(shared: &StreamShared, error: Error) {
        let mut state = shared.state.lock().expect("stream state poisoned");
        state.failed = true;
        state.error = Some(error);
        state.queue.clear();
        drop(state);
        shared.notify.notify_waiters();
    }

    async fn acknowledge(transport: &dyn IpcTransport, stream_id: &str, batch_id: u64) {
        let args = serde_json::json!({
            "stream_id": stream_id,
            "batch_index": batch_id,
        });
        if let Err(raw) = transport.invoke("acknowledge_stream_batch", args).await {
            log::warn!("failed to acknowledge stream batch {batch_id}: {}", raw.0);
        }
    }

    fn decode_schema(data: &[u8]) -> Result<SchemaRef> {
        let reader = StreamReader::try_new(Cursor::new(data.to_vec()), None)
            .map_err(|e| Error::protocol(format!("decoding stream schema: {e}")))?;
        Ok(reader.schema())
    }

    fn decode_batch(schema_bytes: &[u8], data: &[u8]) -> Result<RecordBatch> {
        // hosts frame batches either as self-contained stream fragments or
        // as bare batch messages; try standalone first, then prepend the
        // remembered schema message
        if let Ok(mut reader) = StreamReader::try_new(Cursor::new(data.to_vec()), None) {
            if let Some(Ok(batch)) = reader.next() {
                return Ok(batch);
            }
        }

        let mut framed = Vec::with_capacity(schema_bytes.len() + data.len());
        framed.extend_from_slice(schema_bytes);
        framed.extend_from_slice(data);

        let mut reader = StreamReader::try_new(Cursor::new(framed), None)
            .map_err(|e| Error::protocol(format!("decoding record batch: {e}")))?;

        match reader.next() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(e)) => Err(Error::protocol(format!("decoding record batch: {e}"))),
            None => Err(Error::protocol("record batch frame contained no batch")),
        }
    }

    fn decode_complete(data: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}
