//! Streaming transport: init order, flow control, cancellation, errors.

mod support;

use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int32Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use serde_json::json;

use support::MockHost;
use tarn_core::{
    AttachSpec, Engine, EngineConfig, ErrorKind, IpcEngine, IpcTransport, StreamEvent,
};

fn test_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]))
}

fn test_batch(schema: &Arc<Schema>, start: i32, rows: i32) -> RecordBatch {
    let values: Vec<i32> = (start..start + rows).collect();
    RecordBatch::try_new(Arc::clone(schema), vec![Arc::new(Int32Array::from(values))]).unwrap()
}

/// A self-contained IPC stream fragment: schema message, the given batches,
/// and the end marker.
fn stream_bytes(schema: &Arc<Schema>, batches: &[RecordBatch]) -> Vec<u8> {
    let mut writer = StreamWriter::try_new(Vec::new(), schema).unwrap();
    for batch in batches {
        writer.write(batch).unwrap();
    }
    writer.finish().unwrap();
    writer.into_inner().unwrap()
}

fn engine(host: &Arc<MockHost>) -> IpcEngine {
    IpcEngine::new(EngineConfig::ipc(), Arc::clone(host) as Arc<dyn IpcTransport>)
}

// Backend emits 7 batches of 10 rows and completes; the client consumes one
// batch at a time. The first three are acknowledged on arrival (prefetch
// window), the rest on consumption — exactly seven acks in total.
#[tokio::test(start_paused = true)]
async fn prefetch_window_acks_on_arrival_then_per_consumption() {
    let host = MockHost::new();
    let mut stream = engine(&host)
        .stream("SELECT * FROM trips", &[])
        .await
        .unwrap();

    let schema = test_schema();
    let sender = host.sender();
    sender
        .send(StreamEvent::schema(stream_bytes(&schema, &[])))
        .unwrap();
    for i in 0..7 {
        let batch = test_batch(&schema, i * 10, 10);
        sender
            .send(StreamEvent::batch(stream_bytes(&schema, &[batch])))
            .unwrap();
    }
    sender.send(StreamEvent::complete(7)).unwrap();

    // let arrivals drain before any consumption
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(host.invocations_of("acknowledge_stream_batch").len(), 3);

    let mut total_rows = 0;
    while let Some(batch) = stream.next().await {
        total_rows += batch.unwrap().num_rows();
    }
    assert_eq!(total_rows, 70);

    // naturally completed: done, but not closed
    assert!(!stream.is_closed());
    assert!(stream.schema().is_some());

    let acks = host.invocations_of("acknowledge_stream_batch");
    assert_eq!(acks.len(), 7);
    let mut acked: Vec<u64> = acks
        .iter()
        .map(|args| args["batch_index"].as_u64().unwrap())
        .collect();
    acked.sort_unstable();
    assert_eq!(acked, (0..7).collect::<Vec<u64>>());

    assert!(host.was_unsubscribed());
}

#[tokio::test(start_paused = true)]
async fn subscription_is_established_before_the_query_is_dispatched() {
    let host = MockHost::new();
    let _stream = engine(&host).stream("SELECT 1", &[]).await.unwrap();

    let log = host.log_entries();
    let subscribe = log
        .iter()
        .position(|entry| entry.starts_with("subscribe:stream-binary-"))
        .unwrap();
    let dispatch = log
        .iter()
        .position(|entry| entry == "invoke:stream_query")
        .unwrap();
    assert!(subscribe < dispatch);

    // the topic embeds the stream id that was dispatched
    let args = &host.invocations_of("stream_query")[0];
    let stream_id = args["stream_id"].as_str().unwrap();
    assert!(log[subscribe].ends_with(stream_id));
}

// After two consumed batches, cancel: the subscription is removed
// synchronously, the backend cancel fires, and the stream reads as done.
#[tokio::test(start_paused = true)]
async fn cancel_mid_stream_tears_down_and_notifies_the_backend() {
    let host = MockHost::new();
    let mut stream = engine(&host).stream("SELECT * FROM t", &[]).await.unwrap();

    let schema = test_schema();
    let sender = host.sender();
    sender
        .send(StreamEvent::schema(stream_bytes(&schema, &[])))
        .unwrap();
    for i in 0..4 {
        let batch = test_batch(&schema, i * 10, 10);
        sender
            .send(StreamEvent::batch(stream_bytes(&schema, &[batch])))
            .unwrap();
    }

    for _ in 0..2 {
        stream.next().await.unwrap().unwrap();
    }

    stream.cancel();
    // unsubscribed synchronously, before the backend acknowledges anything
    assert!(host.was_unsubscribed());
    assert!(stream.is_closed());

    assert!(stream.next().await.is_none());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(host.invocations_of("cancel_stream").len(), 1);

    // a late event lands nowhere
    let _ = sender.send(StreamEvent::batch(stream_bytes(
        &schema,
        &[test_batch(&schema, 100, 10)],
    )));
    assert!(stream.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_first_batch_still_cancels_the_backend() {
    let host = MockHost::new();
    let mut stream = engine(&host).stream("SELECT * FROM t", &[]).await.unwrap();

    stream.cancel();

    assert!(stream.next().await.is_none());
    assert!(stream.is_closed());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(host.invocations_of("cancel_stream").len(), 1);
    assert!(host.was_unsubscribed());
}

#[tokio::test(start_paused = true)]
async fn error_event_aborts_the_stream_and_surfaces_once() {
    let host = MockHost::new();
    let mut stream = engine(&host).stream("SELECT * FROM t", &[]).await.unwrap();

    let schema = test_schema();
    let sender = host.sender();
    sender
        .send(StreamEvent::schema(stream_bytes(&schema, &[])))
        .unwrap();
    sender
        .send(StreamEvent::batch(stream_bytes(
            &schema,
            &[test_batch(&schema, 0, 10)],
        )))
        .unwrap();
    sender
        .send(StreamEvent::error("Parser Error: near `FROMM`"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1)).await;

    // the error preempts any still-queued batches
    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Query);
    assert!(error.to_string().contains("Parser Error"));

    assert!(stream.next().await.is_none());
    assert!(stream.is_closed());
    assert!(host.was_unsubscribed());
}

#[tokio::test(start_paused = true)]
async fn get_table_switches_to_unbounded_prefetch_and_concatenates() {
    let host = MockHost::new();
    let mut stream = engine(&host).stream("SELECT * FROM t", &[]).await.unwrap();

    let schema = test_schema();
    let sender = host.sender();
    sender
        .send(StreamEvent::schema(stream_bytes(&schema, &[])))
        .unwrap();
    for i in 0..5 {
        let batch = test_batch(&schema, i * 10, 10);
        sender
            .send(StreamEvent::batch(stream_bytes(&schema, &[batch])))
            .unwrap();
    }
    sender.send(StreamEvent::complete(5)).unwrap();

    let table = stream.get_table().await.unwrap();
    assert_eq!(table.row_count(), 50);
    assert_eq!(table.batches.len(), 5);
    assert_eq!(table.concat().unwrap().num_rows(), 50);

    // every batch acknowledged exactly once
    let acks = host.invocations_of("acknowledge_stream_batch");
    assert_eq!(acks.len(), 5);
    let mut acked: Vec<u64> = acks
        .iter()
        .map(|args| args["batch_index"].as_u64().unwrap())
        .collect();
    acked.sort_unstable();
    assert_eq!(acked, (0..5).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn attach_specs_are_forwarded_with_the_dispatch() {
    let host = MockHost::new();
    let attach = [
        AttachSpec::new("lake", "s3://bucket/lake.db").read_only(),
        AttachSpec::raw("secure", "ATTACH 'managed' AS secure"),
    ];

    let _stream = engine(&host)
        .stream("SELECT * FROM lake.events", &attach)
        .await
        .unwrap();

    let args = &host.invocations_of("stream_query")[0];
    assert_eq!(args["attach"][0]["db_name"], json!("lake"));
    assert_eq!(args["attach"][0]["url"], json!("s3://bucket/lake.db"));
    assert_eq!(args["attach"][0]["read_only"], json!(true));
    assert_eq!(args["attach"][1]["raw_sql"], json!("ATTACH 'managed' AS secure"));
}
