//! Stub connections for exercising the pool and the wrappers.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::future::BoxFuture;
use serde_json::Value;

use tarn_core::{
    Connection, ConnectionId, Error, PreparedStatement, QueryStream, Result, RowSet,
    StatementBackend,
};

/// Shared bookkeeping for every connection a stub connector hands out.
#[derive(Default)]
pub struct StubState {
    pub created: AtomicU64,
    pub closed: AtomicU64,
    pub fail_ping: Mutex<HashSet<String>>,
    /// Connector failures remaining before connects succeed again.
    pub connect_failures: AtomicU64,
    /// Artificial latency applied to `execute`.
    pub execute_delay_ms: AtomicU64,
}

impl StubState {
    pub fn fail_ping_for(&self, id: &str) {
        self.fail_ping
            .lock()
            .unwrap()
            .insert(id.to_owned());
    }
}

pub struct StubConnection {
    id: ConnectionId,
    state: Arc<StubState>,
    open: Arc<AtomicBool>,
}

impl StubConnection {
    /// Flip the open flag so the pool sees a dead session on release.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }
}

/// A connector producing `stub-0`, `stub-1`, … and counting lifecycle
/// events in the shared state.
pub fn stub_connector(
    state: Arc<StubState>,
) -> impl Fn() -> BoxFuture<'static, Result<StubConnection>> + Send + Sync + 'static {
    move || {
        let state = Arc::clone(&state);
        Box::pin(async move {
            if state.connect_failures.load(Ordering::SeqCst) > 0 {
                state.connect_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Unknown {
                    message: "stub connect refused".into(),
                });
            }

            let n = state.created.fetch_add(1, Ordering::SeqCst);
            Ok(StubConnection {
                id: ConnectionId::new(format!("stub-{n}")),
                state,
                open: Arc::new(AtomicBool::new(true)),
            })
        })
    }
}

impl Connection for StubConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn execute<'c>(&'c mut self, sql: &'c str, _params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>> {
        let delay = self.state.execute_delay_ms.load(Ordering::SeqCst);
        Box::pin(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let mut row = serde_json::Map::new();
            row.insert("sql".into(), Value::String(sql.to_owned()));
            Ok(RowSet {
                rows: vec![row],
                columns: vec![],
                row_count: 1,
                query_time_ms: Some(delay),
            })
        })
    }

    fn stream<'c>(&'c mut self, _sql: &'c str, _params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>> {
        Box::pin(async move {
            let set = RowSet::empty().to_batch_set()?;
            Ok(QueryStream::from_batch_set(set))
        })
    }

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>> {
        let delay = self.state.execute_delay_ms.load(Ordering::SeqCst);
        Box::pin(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(PreparedStatement::new(
                format!("stub-stmt-{sql}"),
                Box::new(NoopStatement),
            ))
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let failing = self
                .state
                .fail_ping
                .lock()
                .unwrap()
                .contains(self.id.as_str());
            if failing {
                Err(Error::Unknown {
                    message: format!("{} is unreachable", self.id),
                })
            } else {
                Ok(())
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(self) -> BoxFuture<'static, Result<()>> {
        let state = self.state;
        Box::pin(async move {
            state.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

pub struct NoopStatement;

impl StatementBackend for NoopStatement {
    fn query<'s>(&'s self, _params: &'s [Value]) -> BoxFuture<'s, Result<RowSet>> {
        Box::pin(async { Ok(RowSet::empty()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

use std::collections::HashMap;

use serde_json::json;
use tarn_core::{EventSubscription, HostError, IpcTransport, StreamEvent};

/// An in-memory native host: records every invocation, answers the command
/// surface with canned responses, and hands out event-channel senders.
#[derive(Default)]
pub struct MockHost {
    pub log: Arc<Mutex<Vec<String>>>,
    pub invocations: Arc<Mutex<Vec<(String, Value)>>>,
    pub topics: Arc<Mutex<HashMap<String, flume::Sender<StreamEvent>>>>,
    connections: AtomicU64,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(MockHost::default())
    }

    /// The sender side of the single live subscription.
    pub fn sender(&self) -> flume::Sender<StreamEvent> {
        self.topics
            .lock()
            .unwrap()
            .values()
            .next()
            .expect("no live subscription")
            .clone()
    }

    pub fn invocations_of(&self, command: &str) -> Vec<Value> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == command)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn was_unsubscribed(&self) -> bool {
        self.log_entries()
            .iter()
            .any(|entry| entry.starts_with("unsubscribe:"))
    }
}

impl IpcTransport for MockHost {
    fn invoke<'a>(&'a self, command: &'a str, args: Value) -> BoxFuture<'a, std::result::Result<Value, HostError>> {
        self.log.lock().unwrap().push(format!("invoke:{command}"));
        self.invocations
            .lock()
            .unwrap()
            .push((command.to_owned(), args));

        let response = match command {
            "create_connection" => {
                let n = self.connections.fetch_add(1, Ordering::SeqCst);
                json!(format!("conn-{n}"))
            }
            "connection_execute" => json!({
                "rows": [{"ok": true}],
                "columns": [{"name": "ok", "logical_type": "BOOLEAN"}],
                "row_count": 1,
            }),
            "prepare_statement" => json!("stmt-0"),
            "get_databases" => json!(["workspace"]),
            "get_tables" => json!(["trips"]),
            "get_columns" => json!([
                {"name": "id", "logical_type": "BIGINT", "nullable": false},
                {"name": "fare", "logical_type": "DOUBLE", "nullable": true},
            ]),
            "get_catalog" => json!({
                "workspace": {
                    "schemas": [{
                        "name": "main",
                        "objects": [{
                            "name": "trips",
                            "kind": "table",
                            "columns": [{"name": "id", "logical_type": "BIGINT"}],
                        }],
                    }],
                },
            }),
            _ => Value::Null,
        };

        Box::pin(async move { Ok(response) })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, std::result::Result<EventSubscription, HostError>> {
        self.log.lock().unwrap().push(format!("subscribe:{topic}"));

        let (tx, rx) = flume::unbounded();
        self.topics.lock().unwrap().insert(topic.to_owned(), tx);

        let topics = Arc::clone(&self.topics);
        let log = Arc::clone(&self.log);
        let topic_owned = topic.to_owned();
        let subscription = EventSubscription::new(topic, rx, move || {
            topics.lock().unwrap().remove(&topic_owned);
            log.lock().unwrap().push(format!("unsubscribe:{topic_owned}"));
        });

        Box::pin(async move { Ok(subscription) })
    }
}
