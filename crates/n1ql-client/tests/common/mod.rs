//! In-process stand-in for the query service
//!
//! Serves `/query/service` with canned responses, plus the cluster discovery
//! documents when a test configures them.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Fixture key used for every `prepared` request
pub const PREPARED: &str = "<prepared>";
/// Plan name handed out for every `PREPARE`
pub const PLAN_NAME: &str = "plan-1";

/// A request as the service received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub form: HashMap<String, String>,
    pub user_agent: Option<String>,
    pub authorization: Option<String>,
}

impl RecordedRequest {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
struct Fixture {
    status: u16,
    body: String,
}

#[derive(Default)]
pub struct MockState {
    requests: Mutex<Vec<RecordedRequest>>,
    fixtures: Mutex<HashMap<String, Fixture>>,
    cluster: Mutex<Option<Value>>,
    query_nodes: Mutex<Option<Value>>,
    reject_named: AtomicBool,
    reject_plans: AtomicBool,
    next_txid: AtomicUsize,
}

pub struct MockQueryService {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockQueryService {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/query/service", post(query_service))
            .route("/pools/default/nodeServices", get(node_services))
            .route("/admin/clusters/default/nodes", get(query_nodes))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `http://127.0.0.1:<port>`
    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/query/service", self.base())
    }

    /// Answer `statement` (or [`PREPARED`]) with a JSON body
    pub fn respond(&self, statement: &str, body: Value) {
        self.respond_raw(statement, 200, &body.to_string());
    }

    pub fn respond_raw(&self, statement: &str, status: u16, body: &str) {
        self.state.fixtures.lock().insert(
            statement.to_string(),
            Fixture {
                status,
                body: body.to_string(),
            },
        );
    }

    /// Serve a node/service map listing query nodes on `ports`
    pub fn serve_cluster(&self, ports: &[u16]) {
        let nodes: Vec<Value> = ports
            .iter()
            .map(|port| {
                json!({
                    "hostname": "127.0.0.1",
                    "services": {"mgmt": self.port(), "kv": 11210, "n1ql": port}
                })
            })
            .collect();
        *self.state.cluster.lock() = Some(json!({"rev": 1, "nodesExt": nodes}));
    }

    /// Serve the query service's own view of the cluster
    pub fn serve_query_nodes(&self, endpoints: &[String]) {
        let nodes: Vec<Value> = endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| json!({"name": format!("node-{}", i), "queryEndpoint": e}))
            .collect();
        *self.state.query_nodes.lock() = Some(Value::Array(nodes));
    }

    /// Fail requests that reference a plan by name
    pub fn reject_named_plans(&self, reject: bool) {
        self.state.reject_named.store(reject, Ordering::SeqCst);
    }

    /// Fail every prepared request, named or inline
    pub fn reject_all_plans(&self, reject: bool) {
        self.state.reject_plans.store(reject, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Requests whose `statement` field starts with `prefix`
    pub fn statements(&self, prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.field("statement").is_some_and(|s| s.starts_with(prefix)))
            .collect()
    }

    pub fn prepared_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.form.contains_key("prepared"))
            .collect()
    }
}

impl Drop for MockQueryService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A local port with nothing listening on it
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn dead_endpoint(port: u16) -> String {
    format!("http://127.0.0.1:{}/query/service", port)
}

/// `{"signature": ..., "results": [...]}` with a success status
pub fn results(signature: Value, rows: Vec<Value>) -> Value {
    json!({
        "requestID": "5c5a1e2f-0b1c-4d7e-9a53-2f1f0c4e8a11",
        "signature": signature,
        "results": rows,
        "status": "success",
        "metrics": {"resultCount": rows.len()}
    })
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn query_service(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    state.requests.lock().push(RecordedRequest {
        form: form.clone(),
        user_agent: header_value(&headers, "cb-user-agent"),
        authorization: header_value(&headers, "authorization"),
    });

    let (status, body) = answer(&state, &form);
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
}

fn answer(state: &MockState, form: &HashMap<String, String>) -> (u16, String) {
    if let Some(prepared) = form.get("prepared") {
        let named = prepared.starts_with('"');
        if state.reject_plans.load(Ordering::SeqCst)
            || (named && state.reject_named.load(Ordering::SeqCst))
        {
            let body = json!({
                "errors": [{"code": 4040, "msg": format!("No such prepared statement: {}", prepared)}],
                "status": "fatal"
            });
            return (404, body.to_string());
        }
        return fixture(state, PREPARED).unwrap_or_else(|| {
            (200, results(json!({"name": "json"}), vec![json!({"name": "Baltika 6"})]).to_string())
        });
    }

    let statement = form.get("statement").cloned().unwrap_or_default();
    if let Some(found) = fixture(state, &statement) {
        return found;
    }

    let body = match statement.as_str() {
        "SELECT RAW 1;" => results(json!("json"), vec![json!(1)]),
        "BEGIN WORK" => {
            let n = state.next_txid.fetch_add(1, Ordering::SeqCst) + 1;
            results(json!({"txid": "json"}), vec![json!({"txid": format!("tx-{}", n)})])
        }
        "COMMIT WORK" | "ROLLBACK WORK" => results(Value::Null, vec![]),
        s if s.starts_with("PREPARE ") => results(
            json!({"name": "json"}),
            vec![json!({
                "name": PLAN_NAME,
                "encoded_plan": "H4sIAAAAAAAA/wEAAP//AAAAAAAAAAA=",
                "operator": {"#operator": "Sequence", "~children": []},
                "text": s
            })],
        ),
        _ => json!({
            "errors": [{"code": 3000, "msg": format!("syntax error - at {}", statement)}],
            "status": "fatal"
        }),
    };
    (200, body.to_string())
}

fn fixture(state: &MockState, key: &str) -> Option<(u16, String)> {
    state
        .fixtures
        .lock()
        .get(key)
        .map(|f| (f.status, f.body.clone()))
}

async fn node_services(State(state): State<Arc<MockState>>) -> Result<Json<Value>, StatusCode> {
    state.cluster.lock().clone().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn query_nodes(State(state): State<Arc<MockState>>) -> Result<Json<Value>, StatusCode> {
    state.query_nodes.lock().clone().map(Json).ok_or(StatusCode::NOT_FOUND)
}
