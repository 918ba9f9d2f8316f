//! HTTP(S) fetcher backed by a shared reqwest client.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::Fetcher;
use crate::errors::{VaultError, VaultResult};
use crate::image::{ProgressMonitor, ProgressPhase};

/// Streams URL contents to disk, reporting percent progress as chunks land.
pub struct UrlFetcher {
    client: reqwest::Client,
}

impl UrlFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for UrlFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for UrlFetcher {
    async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        size: i64,
        phase: ProgressPhase,
        monitor: &ProgressMonitor,
    ) -> VaultResult<()> {
        let failed = |reason: String| VaultError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        let total = if size > 0 {
            size as u64
        } else {
            response.content_length().unwrap_or(0)
        };

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| failed(format!("cannot create {}: {e}", dest.display())))?;

        let mut written: u64 = 0;
        let mut last_percent = i32::MIN;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| failed(e.to_string()))?;
            written += chunk.len() as u64;

            let percent = if total > 0 {
                ((written * 100) / total).min(100) as i32
            } else {
                -1
            };
            if percent != last_percent {
                last_percent = percent;
                if !monitor(phase, percent) {
                    return Err(failed("download aborted".to_string()));
                }
            }
        }

        file.flush().await.map_err(|e| failed(e.to_string()))?;
        Ok(())
    }

    async fn last_modified(&self, url: &str) -> VaultResult<Option<DateTime<Utc>>> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| VaultError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|value| value.with_timezone(&Utc)))
    }
}
