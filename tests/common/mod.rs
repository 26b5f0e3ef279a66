//! Mock document database for integration tests: `_session`, a deployments
//! view honoring `If-None-Match`, versioned attachments and outage switches.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use camelback::deploy::{AppRequest, ContextFactory, WebApp};
use camelback::fabric::{FabricConfig, Grid};
use camelback::identity::RequestContext;
use camelback::{AppResult, CamelbackConfig, Node};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const VIEW: &str = "_design/apps/_view/deployments";

#[derive(Default)]
struct CouchState {
    users: HashMap<String, (String, Vec<String>)>,
    tokens: HashMap<String, String>,
    docs: BTreeMap<String, Value>,
    attachments: HashMap<(String, String, String), Vec<u8>>,
    seq: u64,
    next_token: u64,
    auth_down: bool,
    view_down: bool,
    view_hits: usize,
    attachment_hits: usize,
}

#[derive(Clone)]
pub struct MockCouch {
    pub addr: SocketAddr,
    state: Arc<Mutex<CouchState>>,
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(|p| p.trim()).find_map(|p| p.strip_prefix("AuthSession=")).map(|s| s.to_string())
}

async fn post_session(State(st): State<Arc<Mutex<CouchState>>>, Form(form): Form<HashMap<String, String>>) -> Response {
    let mut s = st.lock();
    if s.auth_down { return StatusCode::SERVICE_UNAVAILABLE.into_response(); }
    let name = form.get("name").cloned().unwrap_or_default();
    let password = form.get("password").cloned().unwrap_or_default();
    let roles = match s.users.get(&name) {
        Some((pw, roles)) if *pw == password => roles.clone(),
        _ => return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response(),
    };
    s.next_token += 1;
    let token = format!("tok{}-{}", s.next_token, name);
    s.tokens.insert(token.clone(), name.clone());
    let mut resp = Json(json!({"ok": true, "name": name, "roles": roles})).into_response();
    if let Ok(v) = HeaderValue::from_str(&format!("AuthSession={}; Version=1; Path=/; HttpOnly", token)) {
        resp.headers_mut().insert(header::SET_COOKIE, v);
    }
    resp
}

async fn get_session(State(st): State<Arc<Mutex<CouchState>>>, headers: HeaderMap) -> Response {
    let s = st.lock();
    if s.auth_down { return StatusCode::SERVICE_UNAVAILABLE.into_response(); }
    let user = session_cookie(&headers).and_then(|t| s.tokens.get(&t).cloned());
    match user {
        Some(name) => {
            let roles = s.users.get(&name).map(|u| u.1.clone()).unwrap_or_default();
            Json(json!({"ok": true, "userCtx": {"name": name, "roles": roles}})).into_response()
        }
        None => Json(json!({"ok": true, "userCtx": {"name": null, "roles": []}})).into_response(),
    }
}

async fn view(State(st): State<Arc<Mutex<CouchState>>>, headers: HeaderMap) -> Response {
    let mut s = st.lock();
    s.view_hits += 1;
    if s.view_down { return StatusCode::SERVICE_UNAVAILABLE.into_response(); }
    let seq = s.seq.to_string();
    let etag = format!("\"{}\"", seq);
    if headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag.as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    let rows: Vec<Value> = s.docs.iter().map(|(id, v)| json!({"id": id, "key": id, "value": v})).collect();
    Json(json!({"seq": seq, "total_rows": rows.len(), "rows": rows})).into_response()
}

async fn attachment(
    State(st): State<Arc<Mutex<CouchState>>>,
    Path((doc, name)): Path<(String, String)>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let mut s = st.lock();
    s.attachment_hits += 1;
    if s.view_down { return StatusCode::SERVICE_UNAVAILABLE.into_response(); }
    let rev = q.get("rev").cloned().unwrap_or_default();
    match s.attachments.get(&(doc, name, rev)) {
        Some(bytes) => ([(header::CONTENT_TYPE, "application/java-archive")], Bytes::from(bytes.clone())).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response(),
    }
}

impl MockCouch {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(CouchState::default()));
        let app = Router::new()
            .route("/_session", get(get_session).post(post_session))
            .route("/apps/_design/apps/_view/deployments", get(view))
            .route("/apps/{doc}/{attachment}", get(attachment))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String { format!("http://{}{}", self.addr, path) }

    pub fn add_user(&self, name: &str, password: &str, roles: &[&str]) {
        self.state.lock().users.insert(name.into(), (password.into(), roles.iter().map(|r| r.to_string()).collect()));
    }

    pub fn revoke_all_tokens(&self) { self.state.lock().tokens.clear(); }

    /// Publish (or republish) a deployment document with its artifact.
    pub fn publish(&self, doc: &str, value: Value, rev: &str, artifact: &[u8]) {
        let mut s = self.state.lock();
        let mut value = value;
        value["rev"] = json!(rev);
        let attachment = value.get("attachment").and_then(|v| v.as_str()).unwrap_or("app.war").to_string();
        value["attachment"] = json!(attachment);
        s.attachments.insert((doc.to_string(), attachment, rev.to_string()), artifact.to_vec());
        s.docs.insert(doc.to_string(), value);
        s.seq += 1;
    }

    /// Publish a row value verbatim, without an artifact.
    pub fn publish_raw(&self, doc: &str, value: Value) {
        let mut s = self.state.lock();
        s.docs.insert(doc.to_string(), value);
        s.seq += 1;
    }

    pub fn unpublish(&self, doc: &str) {
        let mut s = self.state.lock();
        s.docs.remove(doc);
        s.seq += 1;
    }

    pub fn set_auth_down(&self, down: bool) { self.state.lock().auth_down = down; }

    pub fn set_view_down(&self, down: bool) { self.state.lock().view_down = down; }

    pub fn view_hits(&self) -> usize { self.state.lock().view_hits }

    pub fn attachment_hits(&self) -> usize { self.state.lock().attachment_hits }

    pub fn config(&self, artifact_dir: &std::path::Path) -> CamelbackConfig {
        let text = json!({
            "loginConfig": {
                "authenticationUrl": self.url("/_session"),
                "validationTtlSecs": 60,
                "requestTimeoutMs": 1500
            },
            "deployerConfig": {
                "databaseUrl": self.url("/apps"),
                "view": VIEW,
                "pollInterval": 100,
                "artifactDir": artifact_dir,
                "drainGraceSecs": 2
            }
        });
        CamelbackConfig::from_json(&text.to_string()).unwrap()
    }
}

/// A cluster of nodes sharing one grid, each listening on 127.0.0.1.
pub struct Cluster {
    pub grid: Grid,
    pub nodes: Vec<Node>,
    pub urls: Vec<String>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    pub async fn start(couch: &MockCouch, n: usize, op_timeout: Duration) -> Self {
        Self::start_with(couch, n, op_timeout, |_| {}, None).await
    }

    pub async fn start_with(
        couch: &MockCouch,
        n: usize,
        op_timeout: Duration,
        tweak: impl Fn(&mut CamelbackConfig),
        factory: Option<Arc<dyn ContextFactory>>,
    ) -> Self {
        let grid = Grid::start(FabricConfig::default().with_operation_timeout(op_timeout));
        let mut nodes = Vec::new();
        let mut urls = Vec::new();
        let mut dirs = Vec::new();
        for _ in 0..n {
            let dir = tempfile::tempdir().unwrap();
            let mut config = couch.config(dir.path());
            tweak(&mut config);
            let store = camelback::identity::CouchDbAuthenticator::new(config.couchdb_settings().unwrap()).unwrap();
            let factory = factory.clone().unwrap_or_else(|| Arc::new(camelback::deploy::ArchiveContextFactory));
            let node = Node::build_with(config, grid.join(None).unwrap(), Arc::new(store), factory).unwrap();
            let addr = node.start_on("127.0.0.1:0".parse().unwrap()).await.unwrap();
            urls.push(format!("http://{}", addr));
            nodes.push(node);
            dirs.push(dir);
        }
        Self { grid, nodes, urls, _dirs: dirs }
    }

    pub async fn shutdown(&self) {
        for n in &self.nodes { n.shutdown().await; }
    }
}

/// Client that follows no redirects and keeps no cookies; tests pass cookies by hand.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap()
}

/// `name=value` of the first Set-Cookie with this name.
pub fn set_cookie(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers().get_all(reqwest::header::SET_COOKIE).iter().filter_map(|v| v.to_str().ok()).find_map(|v| {
        let nv = v.split(';').next()?.trim();
        let (k, val) = nv.split_once('=')?;
        (k == name && !val.is_empty()).then(|| nv.to_string())
    })
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await { return true; }
        if tokio::time::Instant::now() >= deadline { return false; }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Application whose start always fails.
pub struct Broken;

#[async_trait::async_trait]
impl WebApp for Broken {
    async fn start(&self) -> anyhow::Result<()> { anyhow::bail!("refusing to start") }
    async fn handle(&self, _req: AppRequest, _ctx: &mut RequestContext) -> AppResult<Response> { Ok(StatusCode::OK.into_response()) }
}

/// Fails to start apps whose `options.broken` is set; everything else is an archive app.
pub struct FlakyFactory;

#[async_trait::async_trait]
impl ContextFactory for FlakyFactory {
    async fn create(&self, app: &camelback::deploy::AppDescriptor, artifact: &std::path::Path) -> anyhow::Result<Arc<dyn WebApp>> {
        if app.options.contains_key("broken") { return Ok(Arc::new(Broken)); }
        camelback::deploy::ArchiveContextFactory.create(app, artifact).await
    }
}
