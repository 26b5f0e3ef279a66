use std::time::Duration;

use reqwest::{header, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use super::descriptor::AppDescriptor;
use crate::error::{AppError, AppResult};

/// Rows of one view response that parsed into descriptors.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub seq: String,
    pub apps: Vec<AppDescriptor>,
    /// Doc ids of rows that were present but could not be understood.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ViewPoll {
    Unchanged,
    Changed(ViewSnapshot),
}

/// Client for the deployments view.
pub struct ViewClient {
    db_url: Url,
    view_url: Url,
    client: reqwest::Client,
}

fn seq_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ViewClient {
    pub fn new(db_url: Url, view: &str, connect_timeout: Duration, read_timeout: Duration) -> AppResult<Self> {
        let base = db_url.as_str().trim_end_matches('/');
        let view_url = Url::parse(&format!("{}/{}", base, view.trim_start_matches('/')))
            .map_err(|e| AppError::config(format!("deployments view url: {}", e)))?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|e| AppError::config(format!("view client: {}", e)))?;
        Ok(Self { db_url, view_url, client })
    }

    pub fn db_url(&self) -> &Url { &self.db_url }

    pub fn view_url(&self) -> &Url { &self.view_url }

    /// Conditional GET keyed on the last seen sequence.
    pub async fn poll(&self, last_seq: Option<&str>) -> AppResult<ViewPoll> {
        let mut req = self.client.get(self.view_url.clone()).query(&[("update_seq", "true")]);
        if let Some(seq) = last_seq {
            req = req.header(header::IF_NONE_MATCH, format!("\"{}\"", seq));
        }
        let resp = req.send().await.map_err(|e| AppError::database(format!("{}: {}", self.view_url, e)))?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => return Ok(ViewPoll::Unchanged),
            s if s.is_success() => {}
            s => return Err(AppError::database(format!("{}: HTTP {}", self.view_url, s))),
        }
        let body: Value = resp.json().await.map_err(|e| AppError::database(format!("{}: {}", self.view_url, e)))?;
        let seq = body
            .get("seq")
            .and_then(seq_string)
            .or_else(|| body.get("update_seq").and_then(seq_string))
            .unwrap_or_default();
        if !seq.is_empty() && last_seq == Some(seq.as_str()) {
            return Ok(ViewPoll::Unchanged);
        }
        let rows = body
            .get("rows")
            .and_then(|r| r.as_array())
            .ok_or_else(|| AppError::database(format!("{}: response has no rows", self.view_url)))?;

        let mut apps = Vec::with_capacity(rows.len());
        let mut rejected = Vec::new();
        for row in rows {
            match AppDescriptor::from_row(&self.db_url, row) {
                Ok(d) => apps.push(d),
                Err(e) => {
                    rejected.push(row.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string());
                    warn!(target: "deploy", "skipping deployment row: {}", e);
                }
            }
        }
        debug!(target: "deploy", seq = %seq, rows = rows.len(), rejected = rejected.len(), "deployments view changed");
        Ok(ViewPoll::Changed(ViewSnapshot { seq, apps, rejected }))
    }
}
