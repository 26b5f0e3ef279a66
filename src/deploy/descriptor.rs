use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use reqwest::Url;
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Document revision of the form `<generation>-<hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    raw: String,
    generation: Option<u64>,
}

impl Revision {
    pub fn parse(raw: &str) -> Self {
        let generation = raw.split_once('-').and_then(|(g, _)| g.parse::<u64>().ok()).or_else(|| raw.parse::<u64>().ok());
        Self { raw: raw.to_string(), generation }
    }

    pub fn as_str(&self) -> &str { &self.raw }

    pub fn generation(&self) -> Option<u64> { self.generation }

    /// True if `self` is strictly older than `other` by generation.
    pub fn is_older_than(&self, other: &Revision) -> bool {
        matches!((self.generation, other.generation), (Some(a), Some(b)) if a.cmp(&b) == Ordering::Less)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.raw) }
}

/// Locator of an attachment in the document database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub db_url: Url,
    pub doc: String,
    pub attachment: String,
    pub revision: Revision,
}

impl ArtifactRef {
    /// `<db>/<doc>/<attachment>?rev=<rev>` with each segment percent-encoded.
    pub fn url(&self) -> AppResult<Url> {
        let base = self.db_url.as_str().trim_end_matches('/');
        let s = format!(
            "{}/{}/{}?rev={}",
            base,
            urlencoding::encode(&self.doc),
            urlencoding::encode(&self.attachment),
            urlencoding::encode(self.revision.as_str())
        );
        Url::parse(&s).map_err(|e| AppError::fetch(&self.doc, format!("bad artifact url {}: {}", s, e)))
    }
}

/// One app that should be live, derived from a deployments view row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub app_id: String,
    pub doc_id: String,
    pub revision: Revision,
    pub context_path: String,
    /// Empty means any host.
    pub hosts: BTreeSet<String>,
    pub artifact: ArtifactRef,
    pub options: BTreeMap<String, String>,
}

fn pick<'a>(v: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| v.get(*n)).filter(|v| !v.is_null())
}

fn pick_str(v: &Value, names: &[&str]) -> Option<String> {
    pick(v, names).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// `/wiki/` and `wiki` both become `/wiki`; the root stays `/`.
pub fn normalize_context_path(p: &str) -> String {
    let trimmed = p.trim().trim_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { format!("/{}", trimmed) }
}

impl AppDescriptor {
    /// Build from a view row `{id, value}`. Accepts camelCase and snake_case spellings.
    pub fn from_row(db_url: &Url, row: &Value) -> AppResult<Self> {
        let bad = |what: &str| AppError::database(format!("deployment row {}: {}", row.get("id").map(|v| v.to_string()).unwrap_or_default(), what));
        let value = row.get("value").filter(|v| v.is_object()).ok_or_else(|| bad("missing value object"))?;
        let doc_id = pick_str(row, &["id"]).or_else(|| pick_str(value, &["_id", "docId", "doc_id"])).ok_or_else(|| bad("missing id"))?;
        let app_id = pick_str(value, &["appId", "app_id", "app", "name"]).unwrap_or_else(|| doc_id.clone());
        let revision = pick_str(value, &["rev", "revision", "_rev"]).ok_or_else(|| bad("missing revision"))?;
        let context_path = pick_str(value, &["contextPath", "context_path", "path"]).unwrap_or_else(|| app_id.clone());

        let attachment = match pick_str(value, &["attachment", "attachmentName", "attachment_name"]) {
            Some(a) => a,
            None => match value.get("_attachments").and_then(|a| a.as_object()) {
                Some(m) if m.len() == 1 => m.keys().next().cloned().ok_or_else(|| bad("missing attachment"))?,
                _ => return Err(bad("missing attachment")),
            },
        };

        let hosts = match pick(value, &["hosts", "virtualHosts", "virtual_hosts"]) {
            Some(Value::Array(a)) => a.iter().filter_map(|h| h.as_str()).map(|h| h.trim().to_ascii_lowercase()).filter(|h| !h.is_empty()).collect(),
            Some(Value::String(s)) => s.split(',').map(|h| h.trim().to_ascii_lowercase()).filter(|h| !h.is_empty()).collect(),
            _ => BTreeSet::new(),
        };

        let options = match value.get("options").and_then(|o| o.as_object()) {
            Some(m) => m
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string())))
                .collect(),
            None => BTreeMap::new(),
        };

        let revision = Revision::parse(&revision);
        Ok(Self {
            artifact: ArtifactRef { db_url: db_url.clone(), doc: doc_id.clone(), attachment, revision: revision.clone() },
            app_id,
            doc_id,
            revision,
            context_path: normalize_context_path(&context_path),
            hosts,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Url { Url::parse("http://couch.local:5984/apps").unwrap() }

    #[test]
    fn revisions_order_by_generation() {
        let r1 = Revision::parse("1-abc");
        let r2 = Revision::parse("2-def");
        assert_eq!(r2.generation(), Some(2));
        assert!(r1.is_older_than(&r2));
        assert!(!r2.is_older_than(&r1));
        assert!(!Revision::parse("zz").is_older_than(&r2));
        assert_eq!(Revision::parse("7").generation(), Some(7));
    }

    #[test]
    fn camel_case_row() {
        let row = json!({"id": "wiki-doc", "value": {
            "appId": "wiki", "contextPath": "/wiki/", "virtualHosts": ["Wiki.Example.com"],
            "attachment": "wiki.war", "rev": "3-ff", "options": {"auth": "optional", "weight": 2}
        }});
        let d = AppDescriptor::from_row(&db(), &row).unwrap();
        assert_eq!(d.app_id, "wiki");
        assert_eq!(d.doc_id, "wiki-doc");
        assert_eq!(d.context_path, "/wiki");
        assert!(d.hosts.contains("wiki.example.com"));
        assert_eq!(d.options.get("auth").map(|s| s.as_str()), Some("optional"));
        assert_eq!(d.options.get("weight").map(|s| s.as_str()), Some("2"));
        assert_eq!(d.revision.generation(), Some(3));
    }

    #[test]
    fn snake_case_row_with_single_attachment() {
        let row = json!({"id": "blog", "value": {
            "app_id": "blog", "path": "blog", "_rev": "1-aa", "_attachments": {"blog.war": {}}
        }});
        let d = AppDescriptor::from_row(&db(), &row).unwrap();
        assert_eq!(d.context_path, "/blog");
        assert_eq!(d.artifact.attachment, "blog.war");
        assert!(d.hosts.is_empty());
    }

    #[test]
    fn rows_without_revision_or_attachment_are_rejected() {
        assert!(AppDescriptor::from_row(&db(), &json!({"id": "x", "value": {"attachment": "a"}})).is_err());
        assert!(AppDescriptor::from_row(&db(), &json!({"id": "x", "value": {"rev": "1-a"}})).is_err());
        assert!(AppDescriptor::from_row(&db(), &json!({"id": "x"})).is_err());
    }

    #[test]
    fn artifact_url_encodes_segments() {
        let a = ArtifactRef { db_url: db(), doc: "team/wiki".into(), attachment: "wiki app.war".into(), revision: Revision::parse("2-x") };
        assert_eq!(a.url().unwrap().as_str(), "http://couch.local:5984/apps/team%2Fwiki/wiki%20app.war?rev=2-x");
    }

    #[test]
    fn context_paths_are_normalized() {
        assert_eq!(normalize_context_path("/"), "/");
        assert_eq!(normalize_context_path(""), "/");
        assert_eq!(normalize_context_path("wiki/"), "/wiki");
        assert_eq!(normalize_context_path("/a/b/"), "/a/b");
    }
}
