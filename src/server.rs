//!
//! camelback engine and node
//! -------------------------
//! `Engine` is the HTTP front: an axum router whose fallback hands every
//! request to the deployment table. `Node` is one cluster member's whole
//! stack, wired from a configuration and a fabric handle. A node either
//! hosts the grid (serving it to other processes when `listen` is set) or
//! joins one hosted elsewhere through the seed `members`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, request::Parts, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CamelbackConfig;
use crate::deploy::{AppProvider, AppRequest, ArchiveContextFactory, ArtifactFetcher, ContextFactory, DeploymentManager, LiveContext, ViewClient};
use crate::error::{AppError, AppResult};
use crate::fabric::{ClusterFabric, Grid, GridServer};
use crate::identity::{parse_cookie, AuthDecision, AuthRequest, AuthenticatorFactory, CouchDbAuthenticator, CredentialStore, LoginService, RequestContext};
use crate::session::{now_ms, ClusterSessionProvider, CommitOutcome, Session, SessionIdManager, SessionManager, AUTH_TOKEN_ATTRIBUTE};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct Engine {
    deployments: Arc<DeploymentManager>,
    session_cookie: Arc<str>,
    url_parameter: Arc<str>,
}

fn error_response(e: &AppError, request_id: &str) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(request_id = %request_id, code = e.code_str(), "{}", e);
    }
    (status, Json(serde_json::json!({"status": "error", "error": e.code_str(), "message": e.to_string()}))).into_response()
}

fn append_cookie(resp: &mut Response, cookie: &str) {
    if let Ok(v) = HeaderValue::from_str(cookie) {
        resp.headers_mut().append(header::SET_COOKIE, v);
    }
}

fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(v) => (status, [(header::LOCATION, v)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn is_secure(parts: &Parts) -> bool {
    parts.uri.scheme_str() == Some("https")
        || parts.headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()).map(|v| v.eq_ignore_ascii_case("https")).unwrap_or(false)
}

fn query_param(parts: &Parts, name: &str) -> Option<String> {
    parts.uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k != name || v.is_empty() { return None; }
        urlencoding::decode(v).ok().map(|s| s.into_owned())
    })
}

impl Engine {
    pub fn new(deployments: Arc<DeploymentManager>, session_cookie: &str, url_parameter: &str) -> Self {
        Self { deployments, session_cookie: Arc::from(session_cookie), url_parameter: Arc::from(url_parameter) }
    }

    pub fn deployments(&self) -> &Arc<DeploymentManager> { &self.deployments }

    pub fn router(&self) -> Router {
        Router::new().fallback(dispatch).with_state(self.clone())
    }

    fn session_cookie(&self, ctx: &LiveContext, value: &str, secure: bool, clear: bool) -> String {
        let path = if ctx.context_path().is_empty() { "/" } else { ctx.context_path() };
        let mut c = format!("{}={}; Path={}; HttpOnly; SameSite=Lax", self.session_cookie, value, path);
        if clear { c.push_str("; Max-Age=0"); }
        if secure { c.push_str("; Secure"); }
        c
    }

    fn session_id(&self, parts: &Parts) -> Option<String> {
        parse_cookie(&parts.headers, &self.session_cookie).or_else(|| query_param(parts, &self.url_parameter))
    }

    /// The caller's live session, if the id it presented still names one.
    async fn load_session(&self, sessions: &SessionManager, parts: &Parts) -> AppResult<Option<Session>> {
        let Some(id) = self.session_id(parts) else { return Ok(None); };
        let Some(mut s) = sessions.get_session(&id).await? else { return Ok(None); };
        if sessions.access(&mut s, now_ms()).await? { Ok(Some(s)) } else { Ok(None) }
    }

    /// Flush the session and add the cookie changes the outcome calls for.
    async fn commit(&self, ctx: &LiveContext, session: Session, secure: bool, resp: &mut Response) -> AppResult<()> {
        let id = session.id().to_string();
        match ctx.sessions.complete(session).await? {
            CommitOutcome::Created => append_cookie(resp, &self.session_cookie(ctx, &id, secure, false)),
            CommitOutcome::Invalidated | CommitOutcome::Gone => append_cookie(resp, &self.session_cookie(ctx, "", secure, true)),
            outcome => debug!(target: "sessions", session = %id, ?outcome, "session flushed"),
        }
        Ok(())
    }

    async fn serve(&self, ctx: Arc<LiveContext>, rest: String, req: Request, request_id: &str) -> AppResult<Response> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| AppError::internal(format!("request body: {}", e)))?;
        let secure = is_secure(&parts);
        let auth_req = AuthRequest { method: parts.method.clone(), path: rest.clone(), headers: parts.headers.clone(), body: body.clone(), secure };

        let principal = match ctx.authenticator.authenticate(&auth_req).await {
            AuthDecision::Admit(p) => p,
            AuthDecision::LoggedIn { principal, set_cookie, location } => {
                let mut resp = redirect(StatusCode::SEE_OTHER, &location);
                append_cookie(&mut resp, &set_cookie);
                // Tie the token to the caller's session so invalidating it logs them out.
                let mut session = match self.load_session(&ctx.sessions, &parts).await? {
                    Some(s) => s,
                    None => ctx.sessions.new_session().await?,
                };
                session.set_attribute(AUTH_TOKEN_ATTRIBUTE, principal.token.clone());
                self.commit(&ctx, session, secure, &mut resp).await?;
                info!(target: "login", request_id = %request_id, user = %principal.user_id, context = %ctx.context_path(), "logged in");
                return Ok(resp);
            }
            AuthDecision::LoggedOut { set_cookie, location } => {
                let mut resp = redirect(StatusCode::SEE_OTHER, &location);
                append_cookie(&mut resp, &set_cookie);
                if let Some(mut session) = self.load_session(&ctx.sessions, &parts).await? {
                    session.invalidate();
                    self.commit(&ctx, session, secure, &mut resp).await?;
                }
                return Ok(resp);
            }
            AuthDecision::Challenge => {
                let realm = format!("Cookie realm=\"{}\"", ctx.authenticator.login_service().realm());
                let mut resp = error_response(&AppError::AuthDenied(ctx.context_path().to_string()), request_id);
                if let Ok(v) = HeaderValue::from_str(&realm) { resp.headers_mut().insert(header::WWW_AUTHENTICATE, v); }
                return Ok(resp);
            }
            AuthDecision::RedirectToLogin(location) => {
                let original = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                return Ok(redirect(StatusCode::FOUND, &format!("{}?next={}", location, urlencoding::encode(original))));
            }
            AuthDecision::Unavailable => return Ok(error_response(&AppError::backend("credential store unreachable"), request_id)),
        };

        let mut rc = RequestContext::new(request_id.to_string(), ctx.context_path(), principal, secure, ctx.sessions.clone());
        if let Some(mut session) = self.load_session(&ctx.sessions, &parts).await? {
            if let Some(p) = &rc.principal {
                let bound = session.get_attribute(AUTH_TOKEN_ATTRIBUTE).and_then(|v| v.as_str()) == Some(p.token.as_str());
                if !bound { session.set_attribute(AUTH_TOKEN_ATTRIBUTE, p.token.clone()); }
            }
            rc.attach(session);
        }

        let app_req = AppRequest { method: parts.method, uri: parts.uri, path: rest, headers: parts.headers, body };
        let mut resp = match ctx.handler.handle(app_req, &mut rc).await {
            Ok(r) => r,
            Err(e) => error_response(&e, request_id),
        };
        if let Some(session) = rc.take_session() {
            self.commit(&ctx, session, secure, &mut resp).await?;
        }
        Ok(resp)
    }
}

async fn dispatch(State(engine): State<Engine>, req: Request<Body>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let host = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()).map(|s| s.to_string()).or_else(|| req.uri().host().map(|s| s.to_string()));
    let path = req.uri().path().to_string();

    let mut resp = match engine.deployments.route(host.as_deref(), &path) {
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({"status": "not_found", "path": path}))).into_response(),
        Some((ctx, rest)) => {
            let guard = ctx.enter();
            let resp = match engine.serve(guard.context().clone(), rest, req, &request_id).await {
                Ok(r) => r,
                Err(e) => error_response(&e, &request_id),
            };
            drop(guard);
            resp
        }
    };
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert("x-request-id", v);
    }
    resp
}

struct Listener {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One cluster member: fabric handle, login service, sessions, deployments and the poller.
pub struct Node {
    config: CamelbackConfig,
    fabric: ClusterFabric,
    login: Arc<LoginService>,
    ids: Arc<SessionIdManager>,
    sessions: Arc<ClusterSessionProvider>,
    deployments: Arc<DeploymentManager>,
    provider: Arc<AppProvider>,
    engine: Engine,
    listener: parking_lot::Mutex<Option<Listener>>,
    grid_server: parking_lot::Mutex<Option<GridServer>>,
}

impl Node {
    /// Production wiring: the configured fabric document and the document database's `_session` endpoint.
    /// Fails with `FabricUnavailable` when the seed members cannot be reached.
    pub async fn build(config: CamelbackConfig) -> AppResult<Self> {
        config.validate()?;
        let fc = config.fabric_config()?;
        let store = CouchDbAuthenticator::new(config.couchdb_settings()?)?;
        let (fabric, grid_server) = if fc.members.is_empty() {
            let grid = Grid::start(fc.clone());
            let server = match fc.listen_addr()? {
                Some(addr) => Some(GridServer::bind(&grid, addr).await?),
                None => {
                    info!(target: "startup", "no fabric members or listen address configured; sessions stay within this process");
                    None
                }
            };
            (grid.join(None)?, server)
        } else {
            (ClusterFabric::join_remote(&fc).await?, None)
        };
        match Self::build_with(config, fabric.clone(), Arc::new(store), Arc::new(ArchiveContextFactory)) {
            Ok(node) => {
                *node.grid_server.lock() = grid_server;
                Ok(node)
            }
            Err(e) => {
                fabric.leave().await;
                if let Some(s) = grid_server { s.stop(Duration::from_secs(1)).await; }
                Err(e)
            }
        }
    }

    /// Wire a node around a fabric handle that has already joined its grid.
    pub fn build_with(config: CamelbackConfig, fabric: ClusterFabric, store: Arc<dyn CredentialStore>, factory: Arc<dyn ContextFactory>) -> AppResult<Self> {
        config.validate()?;
        let login = Arc::new(LoginService::new(&fabric, store, config.login_settings()));
        let ids = Arc::new(SessionIdManager::new(&fabric, config.tombstone_ttl()));
        ids.add_listener(login.clone());
        let sessions = Arc::new(ClusterSessionProvider::new(ids.clone(), config.session_settings()));
        let deployments = Arc::new(DeploymentManager::new());

        let dc = &config.deployer_config;
        let view = ViewClient::new(config.database_url()?, &dc.view, Duration::from_millis(dc.connect_timeout_ms), Duration::from_millis(dc.read_timeout_ms))?;
        let fetcher = Arc::new(ArtifactFetcher::new(config.artifact_dir(), dc.max_artifact_bytes, Duration::from_millis(dc.connect_timeout_ms))?);
        let auth = AuthenticatorFactory::new(login.clone(), config.sso_settings());
        let provider = Arc::new(AppProvider::new(view, fetcher, factory, deployments.clone(), sessions.clone(), auth, config.provider_settings()));
        let engine = Engine::new(deployments.clone(), &config.session_config.cookie_name, &config.session_config.url_parameter);

        info!(target: "startup", member = %fabric.member().name, worker = %fabric.worker_suffix(), realm = %login.realm(), "node assembled");
        Ok(Self { config, fabric, login, ids, sessions, deployments, provider, engine, listener: parking_lot::Mutex::new(None), grid_server: parking_lot::Mutex::new(None) })
    }

    pub fn config(&self) -> &CamelbackConfig { &self.config }
    pub fn fabric(&self) -> &ClusterFabric { &self.fabric }
    pub fn login_service(&self) -> &Arc<LoginService> { &self.login }
    pub fn id_manager(&self) -> &Arc<SessionIdManager> { &self.ids }
    pub fn sessions(&self) -> &Arc<ClusterSessionProvider> { &self.sessions }
    pub fn deployments(&self) -> &Arc<DeploymentManager> { &self.deployments }
    pub fn provider(&self) -> &Arc<AppProvider> { &self.provider }
    pub fn engine(&self) -> &Engine { &self.engine }
    pub fn local_addr(&self) -> Option<SocketAddr> { self.listener.lock().as_ref().map(|l| l.addr) }
    /// Where this node serves its hosted grid, if it does.
    pub fn fabric_addr(&self) -> Option<SocketAddr> { self.grid_server.lock().as_ref().map(|g| g.local_addr()) }

    /// Bind the configured address and start polling.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| AppError::config(format!("bindAddress {}: {}", self.config.bind_address, e)))?;
        self.start_on(addr).await
    }

    pub async fn start_on(&self, addr: SocketAddr) -> AppResult<SocketAddr> {
        if let Some(addr) = self.local_addr() { return Ok(addr); }
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let app = self.engine.router();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app).with_graceful_shutdown(async move { let _ = stopped.await; }).await;
            if let Err(e) = served { error!("http listener error: {}", e); }
        });
        *self.listener.lock() = Some(Listener { addr: bound, stop, task });
        info!(target: "startup", "Starting server on {}", bound);
        if self.config.ssl_config.enabled() {
            info!(target: "startup", secure_port = ?self.config.secure_port, keystore = ?self.config.ssl_config.keystore, "TLS material configured; HTTPS is terminated in front of this node");
        }
        self.provider.spawn();
        Ok(bound)
    }

    /// Stop polling and accepting, drain the contexts, drop the memo, then leave the fabric.
    pub async fn shutdown(&self) {
        let listener = self.listener.lock().take();
        if let Some(l) = &listener { info!(target: "startup", "shutting down {}", l.addr); }
        self.provider.shutdown().await;
        self.sessions.stop_all().await;
        self.login.drop_memo();
        if let Some(l) = listener {
            let _ = l.stop.send(());
            if tokio::time::timeout(self.config.provider_settings().drain_grace, l.task).await.is_err() {
                warn!(target: "startup", "connections still open after the drain grace period");
            }
        }
        self.fabric.leave().await;
        let grid_server = self.grid_server.lock().take();
        if let Some(g) = grid_server {
            info!(target: "startup", "stopping hosted grid on {}", g.local_addr());
            g.stop(self.config.provider_settings().drain_grace).await;
        }
        info!(target: "startup", member = %self.fabric.member().name, "node stopped");
    }
}

/// Bootstrap used by the binary. Runs until ctrl-c.
pub async fn run(config: CamelbackConfig) -> AppResult<()> {
    let node = Node::build(config).await?;
    if node.config.login_config.startup_probe {
        node.login.probe().await?;
        info!(target: "startup", "credential store reachable");
    }
    node.start().await?;
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "startup", "signal handler failed: {}", e);
    }
    node.shutdown().await;
    Ok(())
}
