//! Prepared statements
//!
//! `PREPARE` returns a plan name and the full plan body. Requests reference the
//! plan by name; when a named request fails (the plan may have been evicted,
//! or the node that cached it is gone) the name is dropped and the request is
//! sent once more with the inline plan body.

use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, info};

use crate::client::Connection;
use crate::encoder::{positional_arg_list, rewrite_placeholders};
use crate::error::{Error, Result};
use crate::executor::{RawResponse, ServiceRequest};
use crate::rows::{Envelope, Rows};
use crate::types::{Arg, ExecResult};

const PREPARE_PREFIX: &str = "PREPARE ";

/// A statement prepared on the query service
///
/// Use from one task at a time: a failed named request clears the cached
/// name, which needs `&mut self`.
///
/// # Example
///
/// ```no_run
/// # use n1ql_client::{Arg, Connection};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let conn = Connection::open("http://localhost:8093").await?;
/// let mut stmt = conn.prepare("select name from `beer-sample` where abv > ?").await?;
/// assert_eq!(stmt.num_input(), 1);
///
/// let mut rows = stmt.query(&[Arg::from(7.5)]).await?;
/// while rows.next().await {
///     let (name,): (String,) = rows.scan()?;
///     println!("{}", name);
/// }
/// # Ok(())
/// # }
/// ```
pub struct PreparedStatement<'a> {
    conn: &'a Connection,
    name: Option<String>,
    prepared: String,
    signature: Option<String>,
    arg_count: usize,
}

#[derive(Deserialize)]
struct PlanHeader {
    #[serde(default)]
    name: Option<String>,
}

impl<'a> PreparedStatement<'a> {
    /// Send `PREPARE <statement>` and keep the returned plan
    pub(crate) async fn prepare(conn: &'a Connection, statement: &str) -> Result<Self> {
        let (text, arg_count) = rewrite_placeholders(&format!("{}{}", PREPARE_PREFIX, statement));
        debug!("Preparing statement with {} placeholder(s)", arg_count);

        let reply = conn.executor().send(&ServiceRequest::statement(text, None)).await?;
        if !reply.is_success() {
            return Err(reply.into_status_error().await);
        }
        let body = reply.into_bytes().await?;
        let envelope = Envelope::parse(&body)?;

        if let Some(message) = envelope.server_error() {
            return Err(Error::PrepareFailed(message));
        }

        let results: Vec<Box<RawValue>> = match envelope.results.as_deref() {
            Some(raw) => serde_json::from_str(raw.get()).map_err(Error::decode)?,
            None => Vec::new(),
        };
        let plan = results.into_iter().next().ok_or(Error::InternalNoPlanReturned)?;
        let prepared = plan.get().trim().to_string();
        if prepared.is_empty() || prepared == "null" {
            return Err(Error::InternalNoPlanReturned);
        }

        let name = serde_json::from_str::<PlanHeader>(&prepared)
            .ok()
            .and_then(|header| header.name)
            .filter(|n| !n.is_empty());
        info!("Prepared statement {}", name.as_deref().unwrap_or("<unnamed>"));

        Ok(Self {
            conn,
            name,
            prepared,
            signature: envelope.signature.map(|s| s.to_json_string()),
            arg_count,
        })
    }

    /// Number of `?` placeholders in the prepared text
    pub fn num_input(&self) -> usize {
        self.arg_count
    }

    /// Server-side name of the plan, if it is still referenced by name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Signature returned by `PREPARE`, as JSON text
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.prepared.is_empty()
    }

    /// Forget the plan. Later calls fail with [`Error::StatementNotPrepared`].
    pub fn close(&mut self) {
        self.name = None;
        self.prepared.clear();
        self.signature = None;
        self.arg_count = 0;
    }

    fn request(&self, args: &[Arg]) -> Result<ServiceRequest> {
        if self.prepared.is_empty() {
            return Err(Error::StatementNotPrepared);
        }
        if args.len() < self.arg_count {
            return Err(Error::ArgumentCountMismatch {
                expected: self.arg_count,
                actual: args.len(),
            });
        }
        let prepared = match &self.name {
            Some(name) => format!("\"{}\"", name),
            None => self.prepared.clone(),
        };
        Ok(ServiceRequest::prepared(prepared, positional_arg_list(args)))
    }

    /// Drop the cached name after a failed named request.
    ///
    /// Returns true when the request should be sent again with the plan body.
    fn fall_back_to_plan(&mut self, err: &Error) -> bool {
        if matches!(err, Error::Closed) {
            return false;
        }
        match self.name.take() {
            Some(name) => {
                info!("Named plan {} failed ({}), retrying with the plan body", name, err);
                true
            }
            None => false,
        }
    }

    /// Run the statement and stream its rows
    pub async fn query(&mut self, args: &[Arg]) -> Result<Rows> {
        loop {
            let request = self.request(args)?;
            match self.conn.perform_query(&request).await {
                Err(e) if self.fall_back_to_plan(&e) => continue,
                result => return result,
            }
        }
    }

    /// Run the statement for its side effects
    pub async fn exec(&mut self, args: &[Arg]) -> Result<ExecResult> {
        loop {
            let request = self.request(args)?;
            match self.conn.perform_exec(&request).await {
                Err(e) if self.fall_back_to_plan(&e) => continue,
                result => return result,
            }
        }
    }

    /// Run the statement and return the undecoded response body
    pub async fn query_raw(&mut self, args: &[Arg]) -> Result<RawResponse> {
        loop {
            let request = self.request(args)?;
            match self.conn.perform_raw(&request).await {
                Err(e) if self.fall_back_to_plan(&e) => continue,
                result => return result,
            }
        }
    }

    pub async fn exec_raw(&mut self, args: &[Arg]) -> Result<RawResponse> {
        self.query_raw(args).await
    }
}

impl std::fmt::Debug for PreparedStatement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.name)
            .field("arg_count", &self.arg_count)
            .field("closed", &self.is_closed())
            .finish()
    }
}
