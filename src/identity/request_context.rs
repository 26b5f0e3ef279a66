use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method};

use super::Principal;
use crate::error::{AppError, AppResult};
use crate::session::{Session, SessionManager};

/// What the authenticator sees of a request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub method: Method,
    /// Path below the context path, always starting with `/`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Arrived over TLS.
    pub secure: bool,
}

impl AuthRequest {
    pub fn cookie(&self, name: &str) -> Option<String> { parse_cookie(&self.headers, name) }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// XHR callers and non-browser clients get a 401 instead of a redirect.
    pub fn wants_challenge(&self) -> bool {
        let xhr = self.header("x-requested-with").map(|v| v.eq_ignore_ascii_case("xmlhttprequest")).unwrap_or(false);
        let html = self.header(header::ACCEPT.as_str()).map(|v| v.contains("text/html")).unwrap_or(false);
        xhr || !html
    }

    /// Decode an `application/x-www-form-urlencoded` body field.
    pub fn form_field(&self, name: &str) -> Option<String> {
        parse_form(&self.body).into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

/// Pairs of an `application/x-www-form-urlencoded` body, in order.
/// Pairs that do not decode are skipped.
pub fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(body)
        .split('&')
        .filter(|p| !p.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            Some((decode_form(k)?, decode_form(v)?))
        })
        .collect()
}

fn decode_form(s: &str) -> Option<String> {
    urlencoding::decode(&s.replace('+', " ")).ok().map(|c| c.into_owned())
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all(header::COOKIE).iter() {
        let Ok(s) = cookie.to_str() else { continue; };
        for part in s.split(';') {
            let p = part.trim();
            if let Some((k, v)) = p.split_once('=') {
                if k == name && !v.is_empty() { return Some(v.to_string()); }
            }
        }
    }
    None
}

/// Per-request state handed to an application.
pub struct RequestContext {
    pub request_id: String,
    pub context_path: String,
    pub principal: Option<Principal>,
    pub secure: bool,
    sessions: Arc<SessionManager>,
    session: Option<Session>,
}

impl RequestContext {
    pub fn new(request_id: String, context_path: &str, principal: Option<Principal>, secure: bool, sessions: Arc<SessionManager>) -> Self {
        Self { request_id, context_path: context_path.to_string(), principal, secure, sessions, session: None }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> { &self.sessions }

    pub fn session(&self) -> Option<&Session> { self.session.as_ref() }

    pub fn existing_session_mut(&mut self) -> Option<&mut Session> { self.session.as_mut() }

    /// The request's session, created on first use.
    pub async fn session_mut(&mut self) -> AppResult<&mut Session> {
        if self.session.is_none() {
            self.session = Some(self.sessions.new_session().await?);
        }
        self.session.as_mut().ok_or_else(|| AppError::internal("session vanished"))
    }

    pub(crate) fn attach(&mut self, session: Session) { self.session = Some(session); }

    pub(crate) fn take_session(&mut self) -> Option<Session> { self.session.take() }
}
