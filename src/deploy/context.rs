use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

use super::descriptor::AppDescriptor;
use crate::error::AppResult;
use crate::identity::{parse_form, RequestContext};

/// A request as delivered to an application.
#[derive(Debug, Clone)]
pub struct AppRequest {
    pub method: Method,
    pub uri: Uri,
    /// Path below the context path.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A running application inside a context.
#[async_trait]
pub trait WebApp: Send + Sync {
    async fn start(&self) -> anyhow::Result<()> { Ok(()) }
    async fn handle(&self, req: AppRequest, ctx: &mut RequestContext) -> AppResult<Response>;
    async fn stop(&self) {}
}

/// Turns a fetched artifact into an application.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn create(&self, app: &AppDescriptor, artifact: &Path) -> anyhow::Result<Arc<dyn WebApp>>;
}

/// Serves an artifact as an opaque archive: identity, caller and session endpoints.
#[derive(Debug, Default, Clone)]
pub struct ArchiveContextFactory;

#[async_trait]
impl ContextFactory for ArchiveContextFactory {
    async fn create(&self, app: &AppDescriptor, artifact: &Path) -> anyhow::Result<Arc<dyn WebApp>> {
        let bytes = tokio::fs::read(artifact).await?;
        if bytes.is_empty() {
            anyhow::bail!("artifact {} is empty", artifact.display());
        }
        Ok(Arc::new(ArchiveApp {
            app_id: app.app_id.clone(),
            revision: app.revision.to_string(),
            digest: format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes)),
            size: bytes.len(),
        }))
    }
}

struct ArchiveApp {
    app_id: String,
    revision: String,
    digest: String,
    size: usize,
}

fn form_or_json(req: &AppRequest) -> Map<String, Value> {
    let is_json = req.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(|v| v.starts_with("application/json")).unwrap_or(false);
    if is_json {
        return serde_json::from_slice::<Value>(&req.body).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default();
    }
    parse_form(&req.body).into_iter().map(|(k, v)| (k, Value::String(v))).collect()
}

#[async_trait]
impl WebApp for ArchiveApp {
    async fn handle(&self, req: AppRequest, ctx: &mut RequestContext) -> AppResult<Response> {
        let path = req.path.trim_end_matches('/');
        let resp = match (&req.method, path) {
            (&Method::GET, "") => Json(json!({
                "app": self.app_id,
                "revision": self.revision,
                "digest": self.digest,
                "bytes": self.size,
                "context": ctx.context_path,
            }))
            .into_response(),
            (&Method::GET, "/profile") => match &ctx.principal {
                Some(p) => Json(json!({"user": p.user_id, "roles": p.roles})).into_response(),
                None => (StatusCode::UNAUTHORIZED, Json(json!({"error": "not logged in"}))).into_response(),
            },
            (&Method::GET, "/session") => match ctx.session() {
                Some(s) => Json(json!({"id": s.id(), "attributes": s.attributes()})).into_response(),
                None => Json(json!({"id": null, "attributes": {}})).into_response(),
            },
            (&Method::POST, "/session") => {
                let fields = form_or_json(&req);
                let s = ctx.session_mut().await?;
                for (k, v) in fields { s.set_attribute(k, v); }
                Json(json!({"id": s.id(), "attributes": s.attributes()})).into_response()
            }
            (&Method::POST, "/session/invalidate") => {
                if let Some(s) = ctx.existing_session_mut() { s.invalidate(); }
                StatusCode::NO_CONTENT.into_response()
            }
            _ => (StatusCode::NOT_FOUND, "not found").into_response(),
        };
        Ok(resp)
    }
}
