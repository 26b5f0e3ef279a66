use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::descriptor::AppDescriptor;
use crate::error::{AppError, AppResult};

pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 256 * 1024 * 1024;

fn file_safe(s: &str) -> String {
    let out: String = s.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' }).collect();
    if out.chars().all(|c| c == '.') { "_".repeat(out.len().max(1)) } else { out }
}

/// Downloads attachments into the artifact cache: `<dir>/<app-id>/<revision>.war`.
pub struct ArtifactFetcher {
    dir: PathBuf,
    max_bytes: u64,
    client: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new(dir: PathBuf, max_bytes: u64, connect_timeout: Duration) -> AppResult<Self> {
        // Large archives: connect timeout only, no read timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AppError::config(format!("artifact client: {}", e)))?;
        Ok(Self { dir, max_bytes, client })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn max_bytes(&self) -> u64 { self.max_bytes }

    pub fn path_for(&self, app: &AppDescriptor) -> PathBuf {
        let name = if app.revision.as_str().is_empty() { "current".to_string() } else { file_safe(app.revision.as_str()) };
        self.dir.join(file_safe(&app.app_id)).join(format!("{}.war", name))
    }

    pub async fn fetch(&self, app: &AppDescriptor) -> AppResult<PathBuf> {
        let url = app.artifact.url()?;
        let target = self.path_for(app);
        let part = target.with_extension("war.part");
        let fail = |reason: String| AppError::fetch(&app.app_id, reason);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| fail(format!("{}: {}", parent.display(), e)))?;
        }
        let mut resp = self.client.get(url.clone()).send().await.map_err(|e| fail(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(fail(format!("{}: HTTP {}", url, resp.status())));
        }
        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(fail(format!("artifact is {} bytes, limit is {}", len, self.max_bytes)));
            }
        }

        let mut file = tokio::fs::File::create(&part).await.map_err(|e| fail(format!("{}: {}", part.display(), e)))?;
        let mut total: u64 = 0;
        let streamed: AppResult<()> = async {
            while let Some(chunk) = resp.chunk().await.map_err(|e| fail(format!("{}: {}", url, e)))? {
                total += chunk.len() as u64;
                if total > self.max_bytes {
                    return Err(fail(format!("artifact exceeds the {} byte limit", self.max_bytes)));
                }
                file.write_all(&chunk).await.map_err(|e| fail(format!("{}: {}", part.display(), e)))?;
            }
            file.flush().await.map_err(|e| fail(format!("{}: {}", part.display(), e)))?;
            Ok(())
        }
        .await;
        drop(file);
        if let Err(e) = streamed {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
        tokio::fs::rename(&part, &target).await.map_err(|e| fail(format!("{}: {}", target.display(), e)))?;
        info!(target: "deploy", app_id = %app.app_id, revision = %app.revision, bytes = total, "artifact fetched");
        Ok(target)
    }

    /// Delete one artifact and, if it was the last one, the app's directory.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(target: "deploy", path = %path.display(), "artifact not removed: {}", e);
        }
        if let Some(parent) = path.parent() {
            // Fails harmlessly while other revisions remain.
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }
}
