//! Transaction support for the N1QL client
//!
//! The query service keeps transaction state on the node that started it, so
//! a connection tracks the transaction id together with that node and routes
//! every statement there until commit or rollback.

use tracing::{info, warn};

use crate::client::Connection;
use crate::error::{Error, Result};
use crate::rows::Rows;
use crate::statement::PreparedStatement;
use crate::types::{Arg, ExecResult};

/// Statement sent by [`Connection::begin`]
pub const BEGIN_STATEMENT: &str = "BEGIN WORK";
pub const COMMIT_STATEMENT: &str = "COMMIT WORK";
pub const ROLLBACK_STATEMENT: &str = "ROLLBACK WORK";

/// Only this many leading characters are inspected when classifying.
const CLASSIFY_PREFIX: usize = 64;

/// Transaction role of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatement {
    Start,
    Commit,
    Rollback,
    None,
}

/// Classify a statement by its leading keyword.
///
/// `BEGIN`/`START` need a following token (`BEGIN WORK`, `START
/// TRANSACTION`). `ROLLBACK TO SAVEPOINT ...` only undoes part of the work and
/// is not a rollback of the transaction.
pub fn classify(statement: &str) -> TxStatement {
    let head: String = statement
        .trim_start()
        .chars()
        .take(CLASSIFY_PREFIX)
        .collect::<String>()
        .to_lowercase();
    let mut tokens = head
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|t| !t.is_empty());

    match tokens.next() {
        Some("begin") | Some("start") => {
            if tokens.next().is_some() {
                TxStatement::Start
            } else {
                TxStatement::None
            }
        }
        Some("commit") => TxStatement::Commit,
        Some("rollback") => {
            let rest: Vec<&str> = tokens.collect();
            match rest.as_slice() {
                [] | ["work"] | ["tran"] | ["transaction"] => TxStatement::Rollback,
                _ => TxStatement::None,
            }
        }
        _ => TxStatement::None,
    }
}

/// In-flight transaction id and the endpoint it is pinned to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    txid: String,
    endpoint: String,
}

impl TransactionContext {
    pub fn new(txid: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.txid.is_empty()
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    /// The sticky endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn clear(&mut self) {
        self.txid.clear();
        self.endpoint.clear();
    }
}

/// A database transaction
///
/// Statements run through the transaction (or directly on the connection
/// while it is open) go to the node that started it. Dropping the handle
/// without [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback) leaves the transaction open on the
/// server until its timeout expires.
pub struct Transaction<'a> {
    conn: &'a Connection,
    txid: String,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// Begin a new transaction
    pub(crate) async fn begin(conn: &'a Connection) -> Result<Self> {
        if let Some(txid) = conn.active_txid()? {
            return Err(Error::TransactionInProgress(txid));
        }

        info!("Beginning transaction");
        conn.exec(BEGIN_STATEMENT, &[]).await?;

        let txid = conn.active_txid()?.ok_or_else(|| {
            Error::TransactionsUnsupportedHere("no txid returned by the query service".to_string())
        })?;
        info!("Transaction {} started", txid);

        Ok(Self {
            conn,
            txid,
            finished: false,
        })
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    /// Execute a statement within the transaction
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use n1ql_client::Connection;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let conn = Connection::open("http://localhost:8093").await?;
    /// let mut tx = conn.begin().await?;
    /// tx.exec("UPSERT INTO default (KEY, VALUE) VALUES ('k1', {'a': 1})", &[]).await?;
    /// tx.commit().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn exec(&mut self, statement: &str, args: &[Arg]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.conn.exec(statement, args).await
    }

    /// Run a query within the transaction
    pub async fn query(&mut self, statement: &str, args: &[Arg]) -> Result<Rows> {
        self.ensure_open()?;
        self.conn.query(statement, args).await
    }

    /// Prepare a statement on the transaction's node
    pub async fn prepare(&mut self, statement: &str) -> Result<PreparedStatement<'a>> {
        self.ensure_open()?;
        self.conn.prepare(statement).await
    }

    /// Commit the transaction
    pub async fn commit(mut self) -> Result<()> {
        self.ensure_open()?;
        info!("Committing transaction {}", self.txid);
        self.finished = true;
        self.conn.exec(COMMIT_STATEMENT, &[]).await.map(|_| ())
    }

    /// Rollback the transaction
    pub async fn rollback(mut self) -> Result<()> {
        self.ensure_open()?;
        info!("Rolling back transaction {}", self.txid);
        self.finished = true;
        self.conn.exec(ROLLBACK_STATEMENT, &[]).await.map(|_| ())
    }

    /// The connection must still be tracking this transaction
    fn ensure_open(&self) -> Result<()> {
        match self.conn.active_txid()? {
            Some(txid) if txid == self.txid => Ok(()),
            _ => Err(Error::NoActiveTransaction),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Transaction {} dropped without commit or rollback",
                self.txid
            );
        }
    }
}
