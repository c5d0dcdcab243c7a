//! Request execution with endpoint failover
//!
//! A connection owns a flat set of query-service endpoints. Each request goes
//! to one endpoint picked at random (or to the transaction's node while a
//! transaction is open). Endpoints that fail at the transport level are
//! dropped from the set and the request is retried on another one, until the
//! set is down to its last member.

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, Credentials};
use crate::error::{Error, Result};
use crate::transaction::{classify, TransactionContext, TxStatement};

/// Bytes of a failed response body kept for error messages
pub(crate) const ERROR_BODY_LIMIT: usize = 512;

/// What a request carries in its statement slot
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    /// Statement text, sent as `statement`
    Statement(String),
    /// Quoted plan name or full plan body, sent as `prepared`
    Prepared(String),
}

/// One logical request to the query service
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceRequest {
    pub payload: Payload,
    /// Encoded `args` form value
    pub args: Option<String>,
}

impl ServiceRequest {
    pub fn statement(statement: impl Into<String>, args: Option<String>) -> Self {
        Self {
            payload: Payload::Statement(statement.into()),
            args,
        }
    }

    pub fn prepared(prepared: impl Into<String>, args: Option<String>) -> Self {
        Self {
            payload: Payload::Prepared(prepared.into()),
            args,
        }
    }

    fn tx_kind(&self) -> TxStatement {
        match &self.payload {
            Payload::Statement(text) => classify(text),
            Payload::Prepared(_) => TxStatement::None,
        }
    }
}

/// Body of a response that reached the client
pub(crate) enum ReplyBody {
    Streaming(reqwest::Response),
    Buffered(Bytes),
}

/// A response from whichever endpoint served the request
pub(crate) struct Reply {
    pub endpoint: String,
    pub status: u16,
    pub body: ReplyBody,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub async fn into_bytes(self) -> Result<Bytes> {
        match self.body {
            ReplyBody::Streaming(response) => Ok(response.bytes().await?),
            ReplyBody::Buffered(bytes) => Ok(bytes),
        }
    }

    /// Turn a non-200 reply into an error carrying the start of its body
    pub async fn into_status_error(self) -> Error {
        let code = self.status;
        let body = match self.into_bytes().await {
            Ok(bytes) => truncated_body(&bytes),
            Err(e) => e.to_string(),
        };
        Error::Status { code, body }
    }
}

pub(crate) fn truncated_body(bytes: &[u8]) -> String {
    let end = bytes.len().min(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Raw response stream returned by `query_raw` and `exec_raw`
pub struct RawResponse {
    endpoint: String,
    body: ReplyBody,
}

impl RawResponse {
    pub(crate) fn from_reply(reply: Reply) -> Self {
        Self {
            endpoint: reply.endpoint,
            body: reply.body,
        }
    }

    /// The endpoint that served the request
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next chunk of the body, `None` at the end
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            ReplyBody::Streaming(response) => Ok(response.chunk().await?),
            ReplyBody::Buffered(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
        }
    }

    /// The whole remaining body
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ReplyBody::Streaming(response) => Ok(response.bytes().await?),
            ReplyBody::Buffered(bytes) => Ok(bytes),
        }
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

struct State {
    endpoints: Vec<String>,
    tx: TransactionContext,
    closed: bool,
}

/// Where one attempt is sent
struct Route {
    endpoint: String,
    txid: Option<String>,
    live: usize,
}

/// Performs requests against the connection's endpoint set
pub(crate) struct Executor {
    http: reqwest::Client,
    config: ConnectionConfig,
    credentials: Option<Credentials>,
    state: RwLock<State>,
    shutdown: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        http: reqwest::Client,
        config: ConnectionConfig,
        credentials: Option<Credentials>,
        endpoints: Vec<String>,
    ) -> Self {
        Self {
            http,
            config,
            credentials,
            state: RwLock::new(State {
                endpoints,
                tx: TransactionContext::default(),
                closed: false,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Snapshot of the live endpoints
    pub fn endpoints(&self) -> Vec<String> {
        self.state.read().endpoints.clone()
    }

    pub fn transaction(&self) -> Result<TransactionContext> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state.tx.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Set once the executor is closed; result streams watch it
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Mark the executor closed; later requests fail with [`Error::Closed`]
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::Closed);
        }
        state.closed = true;
        state.endpoints.clear();
        state.tx.clear();
        self.shutdown.store(true, Ordering::Release);
        Ok(())
    }

    fn route(&self) -> Result<Route> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.tx.is_active() {
            return Ok(Route {
                endpoint: state.tx.endpoint().to_string(),
                txid: Some(state.tx.txid().to_string()),
                live: state.endpoints.len(),
            });
        }
        if state.endpoints.is_empty() {
            return Err(Error::exhausted("no query endpoints available"));
        }
        let idx = rand::thread_rng().gen_range(0..state.endpoints.len());
        Ok(Route {
            endpoint: state.endpoints[idx].clone(),
            txid: None,
            live: state.endpoints.len(),
        })
    }

    fn form(&self, request: &ServiceRequest, kind: TxStatement, txid: Option<&str>) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = self
            .config
            .query_params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut set = |key: &str, value: String| {
            fields.retain(|(k, _)| k != key);
            fields.push((key.to_string(), value));
        };

        match &request.payload {
            Payload::Statement(text) => set("statement", text.clone()),
            Payload::Prepared(prepared) => set("prepared", prepared.clone()),
        }
        if let Some(args) = &request.args {
            set("args", args.clone());
        }

        match txid {
            Some(txid) if !txid.is_empty() => set("txid", txid.to_string()),
            _ => {
                if self.config.implicit_tx && kind == TxStatement::None {
                    set("tximplicit", "true".to_string());
                }
            }
        }
        if kind == TxStatement::Start {
            if let Some(timeout) = self.config.tx_timeout.as_deref().filter(|t| !t.is_empty()) {
                set("txtimeout", timeout.to_string());
            }
        }

        fields
    }

    async fn post(&self, endpoint: &str, form: &[(String, String)]) -> reqwest::Result<reqwest::Response> {
        let mut builder = self.http.post(endpoint).form(form);
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        builder.send().await
    }

    /// Send a request, failing over between endpoints.
    ///
    /// Transport errors are retried on the remaining endpoints. While a
    /// transaction is open there is nowhere else to go: the transaction is
    /// abandoned and the error surfaced.
    pub async fn send(&self, request: &ServiceRequest) -> Result<Reply> {
        let kind = request.tx_kind();

        loop {
            let route = self.route()?;
            let form = self.form(request, kind, route.txid.as_deref());
            debug!("Sending request to {}", route.endpoint);

            let response = match self.post(&route.endpoint, &form).await {
                Ok(response) => response,
                Err(e) => {
                    if let Some(txid) = &route.txid {
                        warn!(
                            "Transaction {} lost: endpoint {} not responding",
                            txid, route.endpoint
                        );
                        self.state.write().tx.clear();
                        return Err(Error::exhausted(format!(
                            "transaction node {} failed: {}",
                            route.endpoint, e
                        )));
                    }
                    if route.live <= 1 || !self.remove_endpoint(&route.endpoint) {
                        return Err(Error::exhausted(e.to_string()));
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();
            let mut reply = Reply {
                endpoint: route.endpoint,
                status,
                body: ReplyBody::Streaming(response),
            };

            match kind {
                TxStatement::Start => reply = self.record_start(reply).await?,
                TxStatement::Commit | TxStatement::Rollback => {
                    let mut state = self.state.write();
                    if state.tx.is_active() {
                        info!("Transaction {} finished", state.tx.txid());
                    }
                    state.tx.clear();
                }
                TxStatement::None => {}
            }

            return Ok(reply);
        }
    }

    /// Send a request to the first endpoint only, without failover
    pub async fn probe(&self, request: &ServiceRequest) -> Result<Reply> {
        let endpoint = {
            let state = self.state.read();
            if state.closed {
                return Err(Error::Closed);
            }
            state
                .endpoints
                .first()
                .cloned()
                .ok_or_else(|| Error::connection("no query endpoints available"))?
        };
        let form = self.form(request, TxStatement::None, None);
        debug!("Probing {}", endpoint);

        let response = self.post(&endpoint, &form).await.map_err(|e| {
            Error::connection(format!("Unable to connect to endpoint {}. Error {}", endpoint, e))
        })?;
        let status = response.status().as_u16();
        Ok(Reply {
            endpoint,
            status,
            body: ReplyBody::Streaming(response),
        })
    }

    /// Drop a failed endpoint unless it is the last one left.
    ///
    /// Returns false when nothing is left to retry on.
    fn remove_endpoint(&self, endpoint: &str) -> bool {
        let mut state = self.state.write();
        if state.endpoints.len() <= 1 {
            return false;
        }
        if let Some(idx) = state.endpoints.iter().position(|e| e == endpoint) {
            state.endpoints.remove(idx);
            warn!(
                "Removed unresponsive endpoint {} ({} remaining)",
                endpoint,
                state.endpoints.len()
            );
        }
        true
    }

    /// Pull the `txid` out of a start reply and pin the transaction to the
    /// endpoint that served it.
    async fn record_start(&self, reply: Reply) -> Result<Reply> {
        let endpoint = reply.endpoint.clone();
        let status = reply.status;
        let bytes = reply.into_bytes().await?;

        if status == 200 {
            if let Some(txid) = extract_txid(&bytes) {
                info!("Transaction {} pinned to {}", txid, endpoint);
                self.state.write().tx = TransactionContext::new(txid, endpoint.clone());
            }
        }

        Ok(Reply {
            endpoint,
            status,
            body: ReplyBody::Buffered(bytes),
        })
    }
}

/// GET a JSON document; used by discovery
pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    credentials: Option<&Credentials>,
    url: &str,
) -> Result<T> {
    let mut builder = http.get(url);
    if let Some(creds) = credentials {
        builder = builder.basic_auth(&creds.username, Some(&creds.password));
    }
    let response = builder.send().await.map_err(|e| Error::connection(e.to_string()))?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    if status != 200 {
        return Err(Error::Status {
            code: status,
            body: truncated_body(&bytes),
        });
    }
    serde_json::from_slice(&bytes).map_err(Error::decode)
}

fn extract_txid(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct StartEnvelope<'a> {
        #[serde(borrow)]
        results: Option<Vec<&'a RawValue>>,
    }
    #[derive(Deserialize)]
    struct StartResult {
        txid: Option<String>,
    }

    let envelope: StartEnvelope<'_> = serde_json::from_slice(body).ok()?;
    let first = envelope.results?.into_iter().next()?;
    let result: StartResult = serde_json::from_str(first.get()).ok()?;
    result.txid.filter(|t| !t.is_empty())
}
