//! The worker thread that owns a database connection.
//!
//! The embedded engine's C API is synchronous, so every connection gets a
//! dedicated thread; callers talk to it over a bounded command channel and
//! receive results over oneshot replies.

use std::collections::HashMap;
use std::thread;
use std::time::Instant;

use futures_channel::oneshot;
use serde_json::Value;

use duckdb::arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use duckdb::arrow::datatypes::{DataType, SchemaRef};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::arrow::util::display::array_value_to_string;

use crate::config::Persistence;
use crate::error::{parse_engine_error, Error, Result};
use crate::result_set::{ColumnInfo, Row, RowSet};

const COMMAND_CHANNEL_SIZE: usize = 64;

#[derive(Clone)]
pub(crate) struct Worker {
    command_tx: flume::Sender<Command>,
}

enum Command {
    Execute {
        sql: Box<str>,
        params: Vec<Value>,
        tx: oneshot::Sender<Result<RowSet>>,
    },
    ExecuteBatch {
        sql: Box<str>,
        tx: oneshot::Sender<Result<()>>,
    },
    Prepare {
        sql: Box<str>,
        tx: oneshot::Sender<Result<u64>>,
    },
    StatementQuery {
        statement: u64,
        params: Vec<Value>,
        tx: oneshot::Sender<Result<RowSet>>,
    },
    StatementClose {
        statement: u64,
        tx: oneshot::Sender<()>,
    },
    CloneConnection {
        tx: oneshot::Sender<Result<duckdb::Connection>>,
    },
    Ping {
        tx: oneshot::Sender<()>,
    },
    Shutdown {
        tx: oneshot::Sender<()>,
    },
}

impl Worker {
    /// Spawn a worker thread that opens its own database handle.
    pub(crate) async fn establish(thread_name: String, persistence: Persistence) -> Result<Worker> {
        let (establish_tx, establish_rx) = oneshot::channel();

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let conn = match open_database(&persistence) {
                    Ok(conn) => conn,
                    Err(e) => {
                        establish_tx.send(Err(e)).ok();
                        return;
                    }
                };

                let (command_tx, command_rx) = flume::bounded(COMMAND_CHANNEL_SIZE);
                if establish_tx.send(Ok(Worker { command_tx })).is_err() {
                    return;
                }

                run(conn, command_rx);
            })
            .map_err(|e| Error::init_with("spawning engine worker thread failed", e))?;

        establish_rx.await.map_err(|_| Error::WorkerCrashed)?
    }

    /// Spawn a worker thread around an already-open connection (a clone of
    /// the root session).
    pub(crate) fn adopt(thread_name: String, conn: duckdb::Connection) -> Result<Worker> {
        let (command_tx, command_rx) = flume::bounded(COMMAND_CHANNEL_SIZE);

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(conn, command_rx))
            .map_err(|e| Error::Acquire {
                message: "spawning connection worker thread failed".into(),
                source: Some(Box::new(e)),
            })?;

        Ok(Worker { command_tx })
    }

    pub(crate) async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<RowSet> {
        self.oneshot_cmd(|tx| Command::Execute {
            sql: sql.into(),
            params,
            tx,
        })
        .await?
    }

    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.oneshot_cmd(|tx| Command::ExecuteBatch { sql: sql.into(), tx })
            .await?
    }

    pub(crate) async fn prepare(&self, sql: &str) -> Result<u64> {
        self.oneshot_cmd(|tx| Command::Prepare { sql: sql.into(), tx })
            .await?
    }

    pub(crate) async fn statement_query(&self, statement: u64, params: Vec<Value>) -> Result<RowSet> {
        self.oneshot_cmd(|tx| Command::StatementQuery {
            statement,
            params,
            tx,
        })
        .await?
    }

    pub(crate) async fn statement_close(&self, statement: u64) -> Result<()> {
        self.oneshot_cmd(|tx| Command::StatementClose { statement, tx })
            .await
    }

    pub(crate) async fn clone_connection(&self) -> Result<duckdb::Connection> {
        self.oneshot_cmd(|tx| Command::CloneConnection { tx }).await?
    }

    pub(crate) async fn ping(&self) -> Result<()> {
        self.oneshot_cmd(|tx| Command::Ping { tx }).await
    }

    /// Ask the worker thread to finish its queue and exit.
    pub(crate) fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> {
        let (tx, rx) = oneshot::channel();

        let send_result = self
            .command_tx
            .send(Command::Shutdown { tx })
            .map_err(|_| Error::WorkerCrashed);

        async move {
            send_result?;
            rx.await.map_err(|_| Error::WorkerCrashed)
        }
    }

    async fn oneshot_cmd<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();

        self.command_tx
            .send_async(command(tx))
            .await
            .map_err(|_| Error::WorkerCrashed)?;

        rx.await.map_err(|_| Error::WorkerCrashed)
    }
}

fn run(conn: duckdb::Connection, commands: flume::Receiver<Command>) {
    // prepared statements are kept as SQL text and re-prepared per
    // execution; statement handles borrow the connection and cannot be
    // parked next to it
    let mut statements: HashMap<u64, Box<str>> = HashMap::new();
    let mut next_statement: u64 = 0;

    for command in commands {
        match command {
            Command::Execute { sql, params, tx } => {
                tx.send(execute(&conn, &sql, &params)).ok();
            }

            Command::ExecuteBatch { sql, tx } => {
                tx.send(conn.execute_batch(&sql).map_err(translate)).ok();
            }

            Command::Prepare { sql, tx } => {
                let result = match conn.prepare(&sql) {
                    Ok(_) => {
                        let id = next_statement;
                        next_statement += 1;
                        statements.insert(id, sql);
                        Ok(id)
                    }
                    Err(e) => Err(translate(e)),
                };
                tx.send(result).ok();
            }

            Command::StatementQuery {
                statement,
                params,
                tx,
            } => {
                let result = match statements.get(&statement) {
                    Some(sql) => execute(&conn, sql, &params),
                    None => Err(Error::query("prepared statement is closed")),
                };
                tx.send(result).ok();
            }

            Command::StatementClose { statement, tx } => {
                // double-close tolerated: removing a missing id is a no-op
                statements.remove(&statement);
                tx.send(()).ok();
            }

            Command::CloneConnection { tx } => {
                tx.send(conn.try_clone().map_err(translate)).ok();
            }

            Command::Ping { tx } => {
                tx.send(()).ok();
            }

            Command::Shutdown { tx } => {
                tx.send(()).ok();
                return;
            }
        }
    }
}

fn execute(conn: &duckdb::Connection, sql: &str, params: &[Value]) -> Result<RowSet> {
    let started = Instant::now();

    let mut stmt = conn.prepare(sql).map_err(translate)?;
    let bound: Vec<duckdb::types::Value> = params.iter().map(bind_value).collect();

    let arrow = stmt
        .query_arrow(duckdb::params_from_iter(bound))
        .map_err(translate)?;
    let schema = arrow.get_schema();
    let batches: Vec<RecordBatch> = arrow.collect();

    let mut set = rows_from_batches(&schema, &batches);
    set.query_time_ms = Some(started.elapsed().as_millis() as u64);
    Ok(set)
}

fn open_database(persistence: &Persistence) -> Result<duckdb::Connection> {
    match persistence {
        Persistence::InMemory => {
            duckdb::Connection::open_in_memory().map_err(|e| Error::init_with("opening in-memory database failed", e))
        }
        Persistence::File { path } => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::file_at(format!("creating database directory: {e}"), parent))?;
                }
            }
            duckdb::Connection::open(path).map_err(|e| Error::init_with("opening database failed", e))
        }
    }
}

fn translate(error: duckdb::Error) -> Error {
    parse_engine_error(&error.to_string())
}

fn bind_value(value: &Value) -> duckdb::types::Value {
    use duckdb::types::Value as Sql;

    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::BigInt(i)
            } else if let Some(u) = n.as_u64() {
                Sql::UBigInt(u)
            } else {
                Sql::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn rows_from_batches(schema: &SchemaRef, batches: &[RecordBatch]) -> RowSet {
    let columns: Vec<ColumnInfo> = schema
        .fields()
        .iter()
        .map(|field| ColumnInfo {
            name: field.name().clone(),
            logical_type: logical_name(field.data_type()),
            nullable: Some(field.is_nullable()),
        })
        .collect();

    let mut rows = Vec::new();
    for batch in batches {
        for row_index in 0..batch.num_rows() {
            let mut row = Row::new();
            for (col_index, field) in schema.fields().iter().enumerate() {
                row.insert(
                    field.name().clone(),
                    cell(batch.column(col_index).as_ref(), row_index),
                );
            }
            rows.push(row);
        }
    }

    RowSet {
        row_count: rows.len() as u64,
        rows,
        columns,
        query_time_ms: None,
    }
}

fn cell(column: &dyn Array, row: usize) -> Value {
    if column.is_null(row) {
        return Value::Null;
    }

    fn get<'a, A: 'static>(column: &'a dyn Array) -> Option<&'a A> {
        column.as_any().downcast_ref::<A>()
    }

    match column.data_type() {
        DataType::Boolean => get::<BooleanArray>(column)
            .map(|a| Value::Bool(a.value(row)))
            .unwrap_or(Value::Null),
        DataType::Int8 => get::<Int8Array>(column)
            .map(|a| Value::from(i64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::Int16 => get::<Int16Array>(column)
            .map(|a| Value::from(i64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::Int32 => get::<Int32Array>(column)
            .map(|a| Value::from(i64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::Int64 => get::<Int64Array>(column)
            .map(|a| Value::from(a.value(row)))
            .unwrap_or(Value::Null),
        DataType::UInt8 => get::<UInt8Array>(column)
            .map(|a| Value::from(u64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::UInt16 => get::<UInt16Array>(column)
            .map(|a| Value::from(u64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::UInt32 => get::<UInt32Array>(column)
            .map(|a| Value::from(u64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::UInt64 => get::<UInt64Array>(column)
            .map(|a| Value::from(a.value(row)))
            .unwrap_or(Value::Null),
        DataType::Float32 => get::<Float32Array>(column)
            .map(|a| Value::from(f64::from(a.value(row))))
            .unwrap_or(Value::Null),
        DataType::Float64 => get::<Float64Array>(column)
            .map(|a| Value::from(a.value(row)))
            .unwrap_or(Value::Null),
        DataType::Utf8 => get::<StringArray>(column)
            .map(|a| Value::String(a.value(row).to_owned()))
            .unwrap_or(Value::Null),
        DataType::LargeUtf8 => get::<LargeStringArray>(column)
            .map(|a| Value::String(a.value(row).to_owned()))
            .unwrap_or(Value::Null),
        // dates, timestamps, decimals, nested types: string rendition
        _ => array_value_to_string(column, row)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Engine logical type names for the worker's own arrow types. The crate's
/// public mapping in `result_set` targets our direct arrow dependency;
/// these types come from the engine's re-export and must stay separate.
fn logical_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "NULL".into(),
        DataType::Boolean => "BOOLEAN".into(),
        DataType::Int8 => "TINYINT".into(),
        DataType::Int16 => "SMALLINT".into(),
        DataType::Int32 => "INTEGER".into(),
        DataType::Int64 => "BIGINT".into(),
        DataType::UInt8 => "UTINYINT".into(),
        DataType::UInt16 => "USMALLINT".into(),
        DataType::UInt32 => "UINTEGER".into(),
        DataType::UInt64 => "UBIGINT".into(),
        DataType::Float16 | DataType::Float32 => "FLOAT".into(),
        DataType::Float64 => "DOUBLE".into(),
        DataType::Utf8 | DataType::LargeUtf8 => "VARCHAR".into(),
        DataType::Binary | DataType::LargeBinary => "BLOB".into(),
        DataType::Date32 | DataType::Date64 => "DATE".into(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".into(),
        DataType::Timestamp(_, _) => "TIMESTAMP".into(),
        DataType::Interval(_) => "INTERVAL".into(),
        DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
            format!("DECIMAL({precision},{scale})")
        }
        other => format!("{other}"),
    }
}
