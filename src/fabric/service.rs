use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::grid::Grid;
use super::wire::{CounterReply, CounterRequest, EventsReply, EventsRequest, JoinReply, JoinRequest, MapReply, MapRequest, CLUSTER_HEADER};
use crate::error::{AppError, AppResult};

const MAX_EVENT_WAIT: Duration = Duration::from_secs(5);

fn refuse(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({"status": "error", "error": error}))).into_response()
}

/// Requests must name this grid's cluster, and the grid must still be running.
fn admitted(grid: &Grid, headers: &HeaderMap) -> Result<(), Response> {
    let cluster = headers.get(CLUSTER_HEADER).and_then(|v| v.to_str().ok());
    if cluster != Some(grid.config().cluster_name.as_str()) {
        return Err(refuse(StatusCode::CONFLICT, "cluster_mismatch"));
    }
    if !grid.is_running() {
        return Err(refuse(StatusCode::SERVICE_UNAVAILABLE, "fabric_unavailable"));
    }
    Ok(())
}

async fn join_member(State(grid): State<Grid>, headers: HeaderMap, Json(req): Json<JoinRequest>) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    match grid.admit_remote(&req.name) {
        Ok(member) => Json(JoinReply { member, seq: grid.event_seq() }).into_response(),
        Err(_) => refuse(StatusCode::SERVICE_UNAVAILABLE, "fabric_unavailable"),
    }
}

async fn list_members(State(grid): State<Grid>, headers: HeaderMap) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    Json(grid.members()).into_response()
}

async fn heartbeat(State(grid): State<Grid>, headers: HeaderMap, Path(member): Path<Uuid>) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    if grid.touch(&member) { StatusCode::NO_CONTENT.into_response() } else { refuse(StatusCode::NOT_FOUND, "unknown_member") }
}

async fn leave_member(State(grid): State<Grid>, headers: HeaderMap, Path(member): Path<Uuid>) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    grid.remove_member(&member);
    StatusCode::NO_CONTENT.into_response()
}

async fn map_op(State(grid): State<Grid>, headers: HeaderMap, Json(req): Json<MapRequest>) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    let result = grid.shard(&req.map).apply(req.op);
    Json(MapReply { result, seq: grid.event_seq() }).into_response()
}

async fn counter(State(grid): State<Grid>, headers: HeaderMap, Json(req): Json<CounterRequest>) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    Json(CounterReply { value: grid.next_counter(&req.name) }).into_response()
}

/// Buffered events newer than `after`, or the next one to arrive within `wait_ms`.
async fn events(State(grid): State<Grid>, headers: HeaderMap, Json(req): Json<EventsRequest>) -> Response {
    if let Err(r) = admitted(&grid, &headers) { return r; }
    let shard = grid.shard(&req.map);
    let mut rx = shard.subscribe_events();
    let backlog = shard.events_since(req.after);
    if !backlog.is_empty() { return Json(EventsReply { events: backlog }).into_response(); }

    let wait = Duration::from_millis(req.wait_ms).min(MAX_EVENT_WAIT);
    let events = match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Ok(first)) => {
            let mut out = vec![first];
            while let Ok(ev) = rx.try_recv() { out.push(ev); }
            out.retain(|e| e.seq > req.after);
            out
        }
        Ok(Err(broadcast::error::RecvError::Lagged(_))) => shard.events_since(req.after),
        _ => Vec::new(),
    };
    Json(EventsReply { events }).into_response()
}

/// Routes that let members in other processes use a grid hosted here.
pub fn router(grid: Grid) -> Router {
    Router::new()
        .route("/fabric/members", get(list_members).post(join_member))
        .route("/fabric/members/{member}", put(heartbeat).delete(leave_member))
        .route("/fabric/map", post(map_op))
        .route("/fabric/counter", post(counter))
        .route("/fabric/events", post(events))
        .with_state(grid)
}

/// A hosted grid served over HTTP.
pub struct GridServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl GridServer {
    pub async fn bind(grid: &Grid, addr: SocketAddr) -> AppResult<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::fabric(format!("cannot serve the grid on {}: {}", addr, e)))?;
        let bound = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let app = router(grid.clone());
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app).with_graceful_shutdown(async move { let _ = stopped.await; }).await;
            if let Err(e) = served { error!(target: "fabric", "grid listener error: {}", e); }
        });
        info!(target: "fabric", cluster = %grid.config().cluster_name, "serving grid on {}", bound);
        Ok(Self { addr: bound, stop, task })
    }

    pub fn local_addr(&self) -> SocketAddr { self.addr }

    pub async fn stop(self, grace: Duration) {
        let _ = self.stop.send(());
        if tokio::time::timeout(grace, self.task).await.is_err() {
            info!(target: "fabric", "grid listener did not stop within {:?}", grace);
        }
    }
}
