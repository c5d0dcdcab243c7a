//! Streaming result rows
//!
//! A query response is decoded by a background task that pushes one row at
//! a time through a channel of capacity one, so an unread stream holds at
//! most one decoded row besides the one being decoded. The consumer drives
//! it with [`Rows::next`] and reads the current row with [`Rows::scan`].

use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{serialize_errors, Error, Result};
use crate::types::{FromRow, Row, Value};

/// Column name used when the service returns no signature
pub const NULL_COLUMN: &str = "null";
/// Column name used for a signature that is neither an object nor a string
pub const WILDCARD_COLUMN: &str = "*";

/// Number of synthetic rows that lead a passthrough stream
const PASSTHROUGH_LEADING_ROWS: usize = 2;

/// The top-level fields of a query-service response
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub results: Option<Box<RawValue>>,
    #[serde(default)]
    pub signature: Option<Value>,
    #[serde(default)]
    pub errors: Option<Value>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default, rename = "requestID")]
    pub request_id: Option<Value>,
}

impl Envelope {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(Error::decode)
    }

    /// Merged server errors, if the response carried any
    pub fn server_error(&self) -> Option<String> {
        match &self.errors {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) if items.is_empty() => None,
            Some(errors) => Some(serialize_errors(errors)),
        }
    }
}

/// Derive sorted column names from a signature.
///
/// There is always at least one column; an empty object counts as `*`.
pub(crate) fn signature_columns(signature: Option<&Value>) -> Vec<String> {
    let mut columns: Vec<String> = match signature {
        Some(Value::Object(fields)) if !fields.is_empty() => fields.keys().cloned().collect(),
        Some(Value::String(name)) => vec![name.clone()],
        Some(_) => vec![WILDCARD_COLUMN.to_string()],
        None => vec![NULL_COLUMN.to_string()],
    };
    columns.sort();
    columns
}

fn wildcard_signature() -> Value {
    Value::Object(BTreeMap::from([(
        WILDCARD_COLUMN.to_string(),
        Value::String(WILDCARD_COLUMN.to_string()),
    )]))
}

/// Lifecycle of a result stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Streaming,
    Exhausted,
    Errored,
    Closed,
}

enum Received {
    Row(Option<Value>),
    Error(Option<Error>),
}

/// Rows of a query, decoded while they are read
pub struct Rows {
    columns: Vec<String>,
    passthrough: bool,
    state: StreamState,
    rows_rx: mpsc::Receiver<Value>,
    err_rx: Option<oneshot::Receiver<Error>>,
    stop: Arc<AtomicBool>,
    current: Option<Vec<Value>>,
    error: Option<Error>,
    rows_sent: usize,
    connection_closed: Arc<AtomicBool>,
}

impl Rows {
    /// Decode a response body and start streaming its rows.
    ///
    /// In passthrough mode the response's request id, status and signature
    /// come first as one row, then the metrics, then the data rows, and the
    /// `errors` payload last. Otherwise server errors are reported through
    /// [`Rows::err`] once the data rows are read.
    ///
    /// The stream closes itself once `connection_closed` is set.
    pub(crate) fn from_body(
        body: &[u8],
        passthrough: bool,
        connection_closed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let envelope = Envelope::parse(body)?;
        let server_error = envelope.server_error();

        let signature = match envelope.signature {
            None if passthrough => Some(wildcard_signature()),
            None => None,
            Some(sig @ (Value::Object(_) | Value::String(_))) => Some(sig),
            Some(_) => Some(wildcard_signature()),
        };
        let columns = signature_columns(signature.as_ref());

        let mut leading = Vec::new();
        let mut trailing = None;
        let mut terminal = None;
        if passthrough {
            leading.push(Value::Object(BTreeMap::from([
                ("requestID".to_string(), envelope.request_id.unwrap_or_default()),
                ("status".to_string(), envelope.status.unwrap_or_default()),
                ("signature".to_string(), signature.unwrap_or_default()),
            ])));
            if let Some(metrics) = envelope.metrics {
                leading.push(metrics);
            }
            trailing = Some(Value::Object(BTreeMap::from([(
                "errors".to_string(),
                envelope.errors.unwrap_or_default(),
            )])));
        } else if let Some(message) = server_error {
            terminal = Some(Error::Server(message));
        }

        let (rows_tx, rows_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            results: envelope.results,
            leading,
            trailing,
            terminal,
            stop: Arc::clone(&stop),
            rows_tx,
            err_tx,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            columns,
            passthrough,
            state: StreamState::Opening,
            rows_rx,
            err_rx: Some(err_rx),
            stop,
            current: None,
            error: None,
            rows_sent: 0,
            connection_closed,
        })
    }

    /// Column names, sorted
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Advance to the next row.
    ///
    /// Returns false once the rows are exhausted, the stream is closed, or
    /// decoding failed; check [`Rows::err`] to tell these apart.
    pub async fn next(&mut self) -> bool {
        if self.state != StreamState::Closed && self.connection_closed.load(Ordering::Acquire) {
            debug!("Connection closed, stopping result stream");
            let _ = self.close();
        }
        if matches!(
            self.state,
            StreamState::Exhausted | StreamState::Errored | StreamState::Closed
        ) {
            self.current = None;
            return false;
        }
        self.state = StreamState::Streaming;

        loop {
            let received = match &mut self.err_rx {
                Some(err_rx) => tokio::select! {
                    biased;
                    row = self.rows_rx.recv() => Received::Row(row),
                    err = err_rx => Received::Error(err.ok()),
                },
                None => Received::Row(self.rows_rx.recv().await),
            };

            match received {
                Received::Row(Some(row)) => return self.accept(row),
                Received::Row(None) => {
                    let late = self.err_rx.take().and_then(|mut rx| rx.try_recv().ok());
                    self.current = None;
                    return match late {
                        Some(e) => self.fail(e),
                        None => {
                            self.state = StreamState::Exhausted;
                            false
                        }
                    };
                }
                Received::Error(Some(e)) => {
                    self.err_rx = None;
                    self.current = None;
                    return self.fail(e);
                }
                // The worker finished without an error; keep reading rows
                Received::Error(None) => self.err_rx = None,
            }
        }
    }

    fn fail(&mut self, error: Error) -> bool {
        debug!("Result stream terminated: {}", error);
        self.error = Some(error);
        self.state = StreamState::Errored;
        false
    }

    /// Spread a decoded row over the columns
    fn accept(&mut self, row: Value) -> bool {
        let width = self.columns.len();
        let mut dest = vec![Value::Null; width];

        let leading = self.passthrough && self.rows_sent < PASSTHROUGH_LEADING_ROWS;

        if width == 1 {
            // `select name ...` yields {"name": v}; anything else is the value itself
            dest[0] = match row {
                Value::Object(mut fields)
                    if !leading && fields.len() == 1 && fields.contains_key(&self.columns[0]) =>
                {
                    fields.remove(&self.columns[0]).unwrap_or_default()
                }
                other => other,
            };
        } else if leading {
            // status and metrics rows rarely match the projection
            dest[0] = row;
            for slot in dest.iter_mut().skip(1) {
                *slot = Value::String(String::new());
            }
        } else {
            match row {
                Value::Object(mut fields) => {
                    if fields.len() > width {
                        let err = Error::decode(format!(
                            "More columns than expected {} != {} r {}",
                            fields.len(),
                            width,
                            Value::Object(fields)
                        ));
                        self.current = None;
                        return self.fail(err);
                    }
                    for (slot, column) in dest.iter_mut().zip(&self.columns) {
                        *slot = fields
                            .remove(column)
                            .unwrap_or_else(|| Value::String(String::new()));
                    }
                }
                Value::Array(items) => {
                    for (slot, item) in dest.iter_mut().zip(items) {
                        *slot = item;
                    }
                }
                scalar => dest[0] = scalar,
            }
        }

        self.rows_sent += 1;
        self.current = Some(dest);
        true
    }

    /// Convert the current row into typed destinations, in column order
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use n1ql_client::Connection;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let conn = Connection::open("http://localhost:8093").await?;
    /// let mut rows = conn
    ///     .query("select name, abv, (ibu = 20) as is_twenty from `beer-sample` limit 5", &[])
    ///     .await?;
    /// while rows.next().await {
    ///     let (abv, is_twenty, name): (f64, bool, String) = rows.scan()?;
    ///     println!("{} {} {}", name, abv, is_twenty);
    /// }
    /// rows.close()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn scan<T: FromRow>(&self) -> Result<T> {
        match &self.current {
            Some(values) => T::from_row(values),
            None => Err(Error::NoCurrentRow),
        }
    }

    /// Values of the current row
    pub fn values(&self) -> Option<&[Value]> {
        self.current.as_deref()
    }

    /// The current row with its column names
    pub fn row(&self) -> Option<Row> {
        self.current
            .as_ref()
            .map(|values| Row::new(self.columns.clone(), values.clone()))
    }

    /// Error that ended the stream, if any
    pub fn err(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Take the error that ended the stream
    pub fn into_error(mut self) -> Option<Error> {
        self.error.take()
    }

    /// Drain the remaining rows.
    ///
    /// Fails with the stream's terminal error, discarding collected rows; use
    /// [`Rows::next`] directly to keep partial results.
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.next().await {
            if let Some(row) = self.row() {
                rows.push(row);
            }
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Stop the stream. The decoding task finishes at the next row boundary.
    ///
    /// Closing more than once, or after the rows are exhausted, does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        self.stop.store(true, Ordering::Release);
        self.rows_rx.close();
        self.current = None;
        self.state = StreamState::Closed;
        Ok(())
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Background decoder feeding a [`Rows`]
struct Worker {
    results: Option<Box<RawValue>>,
    leading: Vec<Value>,
    trailing: Option<Value>,
    terminal: Option<Error>,
    stop: Arc<AtomicBool>,
    rows_tx: mpsc::Sender<Value>,
    err_tx: oneshot::Sender<Error>,
}

impl Worker {
    async fn run(self) {
        let Worker {
            results,
            leading,
            trailing,
            terminal,
            stop,
            rows_tx,
            err_tx,
        } = self;

        for row in leading {
            if rows_tx.send(row).await.is_err() {
                return;
            }
        }

        let elements: Vec<&RawValue> = match results.as_deref() {
            Some(raw) => match serde_json::from_str(raw.get()) {
                Ok(elements) => elements,
                Err(e) => {
                    let _ = err_tx.send(Error::decode(e));
                    return;
                }
            },
            None => Vec::new(),
        };

        let mut sent = 0usize;
        for element in elements {
            if stop.load(Ordering::Acquire) {
                debug!("Result stream closed after {} rows", sent);
                return;
            }
            let row: Value = match serde_json::from_str(element.get()) {
                Ok(row) => row,
                Err(e) => {
                    let _ = err_tx.send(Error::decode(e));
                    return;
                }
            };
            if rows_tx.send(row).await.is_err() {
                return;
            }
            sent += 1;
        }

        if let Some(row) = trailing {
            if rows_tx.send(row).await.is_err() {
                return;
            }
        }
        if let Some(e) = terminal {
            let _ = err_tx.send(e);
        }
        debug!("Result stream decoded {} rows", sent);
    }
}
