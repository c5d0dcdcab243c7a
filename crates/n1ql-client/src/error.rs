//! Error types for the N1QL client library

use thiserror::Error;

use crate::redact::{mask_url_password, strip_url};
use crate::types::Value;

/// Result type alias for N1QL client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the N1QL client
#[derive(Debug, Error)]
pub enum Error {
    /// Every endpoint failed at the transport level
    #[error("N1QL: Query nodes not responding: {0}")]
    ConnectionExhausted(String),

    /// Opening the data source failed
    #[error("N1QL: Connection failed: {0}")]
    Connection(String),

    /// The server reported errors while preparing a statement
    #[error("N1QL: Error preparing statement {0}")]
    PrepareFailed(String),

    /// The server reported errors while running a statement
    #[error("N1QL: Error executing query {0}")]
    Server(String),

    /// Non-200 response from the query service
    #[error("N1QL: Request failed with status {code}: {body}")]
    Status { code: u16, body: String },

    /// Fewer arguments than placeholders
    #[error("Argument count mismatch {expected} != {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    /// A column value cannot be converted into the requested type
    #[error("Cannot assign to {target} at index {index} of scan() from value {value}")]
    ScanTypeMismatch {
        index: usize,
        target: &'static str,
        value: String,
    },

    /// The row has fewer values than the scan asked for
    #[error("scan() asked for {requested} values, but only {available} are available")]
    ScanInsufficientColumns { requested: usize, available: usize },

    /// `scan()` called without a current row
    #[error("No current row")]
    NoCurrentRow,

    /// The response body is not a valid query-service envelope
    #[error("N1QL: Failed to decode result: {0}")]
    DecodeMalformed(String),

    /// Commit or rollback without an open transaction
    #[error("N1QL: No active transaction")]
    NoActiveTransaction,

    /// A transaction is already open on this connection
    #[error("N1QL: Transaction {0} already in progress")]
    TransactionInProgress(String),

    /// The service cannot start a transaction here
    #[error("N1QL: Transactions are not supported: {0}")]
    TransactionsUnsupportedHere(String),

    /// Prepare succeeded but returned no usable plan
    #[error("N1QL: Internal Error: no prepared plan returned")]
    InternalNoPlanReturned,

    /// The prepared statement was closed or never prepared
    #[error("N1QL: Prepared statement not found")]
    StatementNotPrepared,

    /// The connection was already closed
    #[error("N1QL connection is already closed")]
    Closed,

    /// Invalid configuration or data source
    #[error("N1QL: Invalid configuration: {0}")]
    Config(String),

    /// HTTP client error, with the URL password masked
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// JSON error outside of result decoding
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transport-level exhaustion, with any embedded URL credentials masked
    pub fn exhausted(detail: impl AsRef<str>) -> Self {
        Error::ConnectionExhausted(strip_url(detail.as_ref()))
    }

    /// Open failure, with any embedded URL credentials masked
    pub fn connection(detail: impl AsRef<str>) -> Self {
        Error::Connection(strip_url(detail.as_ref()))
    }

    pub fn config(detail: impl AsRef<str>) -> Self {
        Error::Config(strip_url(detail.as_ref()))
    }

    pub fn decode(detail: impl std::fmt::Display) -> Self {
        Error::DecodeMalformed(strip_url(&detail.to_string()))
    }
}

impl From<reqwest::Error> for Error {
    fn from(mut err: reqwest::Error) -> Self {
        if let Some(url) = err.url_mut() {
            mask_url_password(url);
        }
        Error::Http(err)
    }
}

/// Merge a server `errors` payload into one readable message.
///
/// Entries look like `{"code": 4040, "msg": "..."}`; anything else falls back
/// to a dump of the payload.
pub fn serialize_errors(errors: &Value) -> String {
    let mut merged = String::new();

    if let Value::Array(entries) = errors {
        for entry in entries {
            let Value::Object(fields) = entry else {
                continue;
            };
            let code = fields.get("code").cloned().unwrap_or(Value::Null);
            let msg = fields.get("msg").cloned().unwrap_or(Value::Null);

            let code_set = !matches!(&code, Value::Null)
                && code.as_f64().map_or(true, |c| c != 0.0);
            let msg_set = !matches!(&msg, Value::Null) && msg.as_str() != Some("");
            if !(code_set && msg_set) {
                continue;
            }

            let msg = msg.as_str().map(str::to_string).unwrap_or_else(|| msg.to_string());
            if merged.is_empty() {
                merged = format!("Code : {} Message : {}", code, msg);
            } else {
                merged = format!("{} Code : {} Message : {}", merged, code, msg);
            }
        }
    }

    if merged.is_empty() {
        format!(" Error {}", errors)
    } else {
        strip_url(&merged)
    }
}
