//! Subscription Fetcher: new uploads of one channel, oldest first.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::channel::channel_listing_url;
use crate::error::FailureKind;
use crate::executor::{DownloadExecutor, EffectiveConfig};
use crate::store::{Settings, Subscription};

#[derive(Debug, Clone, Serialize)]
pub struct VideoFailure {
    pub video_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub kind: FailureKind,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelFetchOutcome {
    /// False only when the channel listing itself could not be retrieved.
    pub success: bool,
    pub subscription_id: String,
    pub channel: String,
    /// Genuinely new downloads; archive hits are not counted.
    pub downloaded_count: usize,
    pub skipped_count: usize,
    pub failures: Vec<VideoFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

impl ChannelFetchOutcome {
    pub fn summary(&self) -> String {
        if !self.success {
            return format!(
                "{}: fetch failed: {}",
                self.channel,
                self.error.as_deref().unwrap_or("unknown error")
            );
        }
        let mut line = format!(
            "{}: {} new, {} already downloaded",
            self.channel, self.downloaded_count, self.skipped_count
        );
        if !self.failures.is_empty() {
            let ids: Vec<&str> = self
                .failures
                .iter()
                .map(|failure| failure.video_id.as_str())
                .collect();
            line.push_str(&format!(", {} failed ({})", self.failures.len(), ids.join(", ")));
        }
        line
    }
}

pub struct SubscriptionFetcher {
    executor: Arc<DownloadExecutor>,
    listing_limit: usize,
}

impl SubscriptionFetcher {
    pub fn new(executor: Arc<DownloadExecutor>, listing_limit: usize) -> Self {
        Self {
            executor,
            listing_limit: listing_limit.max(1),
        }
    }

    /// Downloads every listed upload that is not yet archived. Per-video
    /// failures are collected; they never stop the remaining videos.
    pub fn fetch(&self, subscription: &Subscription, settings: &Settings) -> ChannelFetchOutcome {
        let mut outcome = ChannelFetchOutcome {
            subscription_id: subscription.id.clone(),
            channel: subscription.display_name.clone(),
            ..ChannelFetchOutcome::default()
        };

        let listing_url = channel_listing_url(&subscription.source_url);
        let entries = match self
            .executor
            .extractor()
            .list_recent(&listing_url, self.listing_limit)
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(subscription = %subscription.id, "channel listing failed: {err}");
                outcome.error = Some(format!("channel listing failed: {err}"));
                outcome.error_kind = Some(err.failure_kind());
                return outcome;
            }
        };
        outcome.success = true;

        let config = EffectiveConfig::resolve(settings, subscription.audio_only);
        // Listings come newest first; drain the backlog chronologically.
        for entry in entries.iter().rev() {
            if self.executor.archive().contains(&entry.id) {
                outcome.skipped_count += 1;
                continue;
            }

            let url = match Url::parse(&entry.url) {
                Ok(url) => url,
                Err(err) => {
                    outcome.failures.push(VideoFailure {
                        video_id: entry.id.clone(),
                        title: entry.title.clone(),
                        kind: FailureKind::Extraction,
                        error: format!("listing returned an unusable URL: {err}"),
                    });
                    continue;
                }
            };

            let result = self.executor.download(&url, &config);
            match (result.success, result.skipped) {
                (true, false) => {
                    outcome.downloaded_count += 1;
                    if let Some(dir) = result.output_path.as_deref().and_then(|path| path.parent()) {
                        outcome.output_path = Some(dir.to_path_buf());
                    }
                }
                (true, true) => outcome.skipped_count += 1,
                (false, _) => outcome.failures.push(VideoFailure {
                    video_id: entry.id.clone(),
                    title: result.title.clone().or_else(|| entry.title.clone()),
                    kind: result.error_kind.unwrap_or(FailureKind::Extraction),
                    error: result.error.unwrap_or_else(|| "unknown error".to_string()),
                }),
            }
        }

        info!(
            subscription = %subscription.id,
            downloaded = outcome.downloaded_count,
            skipped = outcome.skipped_count,
            failed = outcome.failures.len(),
            "channel fetch finished"
        );
        outcome
    }
}
