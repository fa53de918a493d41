//! Orchestration Facade: the single surface the binaries call.
//!
//! The facade holds no state of its own beyond handles to the stores, the
//! executor and the scheduler. Validation-class problems come back as
//! `Err(CoreError)`; download and fetch problems come back inside outcomes.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tracing::info;

use crate::archive::{ArchiveLedger, FileArchive};
use crate::channel::{channel_id_from_url, validate_url, video_id_from_url};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, CoreResult};
use crate::executor::{DownloadExecutor, DownloadOutcome, EffectiveConfig};
use crate::extractor::{Extractor, VideoMetadata, YtDlp};
use crate::fetcher::{ChannelFetchOutcome, SubscriptionFetcher};
use crate::scheduler::{RunReport, RunTrigger, Scheduler};
use crate::store::{
    RUN_LOG_FILE, RunLog, SCHEDULE_FILE, SETTINGS_FILE, SUBSCRIPTIONS_FILE, Schedule,
    ScheduleStore, Settings, SettingsPatch, SettingsStore, Subscription, SubscriptionPatch,
    SubscriptionStore,
};

/// yt-dlp's archive lives beside the channel directories it describes.
pub const ARCHIVE_FILE: &str = "downloaded.txt";

/// Where things live and how hard to push the tool.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub data_dir: PathBuf,
    pub download_root: PathBuf,
    pub media_library: Option<PathBuf>,
    pub listing_limit: usize,
    pub workers: usize,
}

impl From<&RuntimeConfig> for OrchestratorOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            download_root: config.download_root.clone(),
            media_library: config.media_library.clone(),
            listing_limit: config.listing_limit,
            workers: config.workers,
        }
    }
}

pub struct Orchestrator {
    extractor: Arc<dyn Extractor>,
    executor: Arc<DownloadExecutor>,
    fetcher: Arc<SubscriptionFetcher>,
    scheduler: Scheduler,
    subscriptions: Arc<SubscriptionStore>,
    settings: Arc<SettingsStore>,
    schedule: Arc<ScheduleStore>,
    run_log: Arc<RunLog>,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        archive: Arc<dyn ArchiveLedger>,
        options: OrchestratorOptions,
    ) -> Self {
        let data_dir = &options.data_dir;
        let subscriptions = Arc::new(SubscriptionStore::load(data_dir.join(SUBSCRIPTIONS_FILE)));
        let settings = Arc::new(SettingsStore::load(data_dir.join(SETTINGS_FILE)));
        let schedule = Arc::new(ScheduleStore::load(data_dir.join(SCHEDULE_FILE)));
        let run_log = Arc::new(RunLog::new(data_dir.join(RUN_LOG_FILE)));

        let executor = Arc::new(
            DownloadExecutor::new(extractor.clone(), archive, options.download_root.clone())
                .with_media_library(options.media_library.clone())
                .with_run_log(run_log.clone()),
        );
        let fetcher = Arc::new(SubscriptionFetcher::new(
            executor.clone(),
            options.listing_limit,
        ));
        let scheduler = Scheduler::new(
            fetcher.clone(),
            subscriptions.clone(),
            settings.clone(),
            schedule.clone(),
            run_log.clone(),
            options.workers,
        );

        Self {
            extractor,
            executor,
            fetcher,
            scheduler,
            subscriptions,
            settings,
            schedule,
            run_log,
        }
    }

    /// Production wiring: yt-dlp plus the on-disk archive shared with it.
    pub fn from_config(config: &RuntimeConfig) -> CoreResult<Self> {
        let extractor = YtDlp::new(&config.ytdlp)
            .with_timeouts(config.probe_timeout, config.download_timeout);
        let archive = FileArchive::open(config.download_root.join(ARCHIVE_FILE))?;
        Ok(Self::new(
            Arc::new(extractor),
            Arc::new(archive),
            OrchestratorOptions::from(config),
        ))
    }

    pub fn download(&self, url: &str, audio_only: bool) -> CoreResult<DownloadOutcome> {
        let url = validate_url(url)?;
        let config = EffectiveConfig::resolve(&self.settings.get(), audio_only);
        let outcome = self.executor.download(&url, &config);
        if !outcome.skipped {
            self.run_log
                .note(&format!("Manual download: {}", outcome.summary()));
        }
        Ok(outcome)
    }

    /// Metadata probe only; nothing is downloaded.
    pub fn get_video_info(&self, url: &str) -> CoreResult<VideoMetadata> {
        let url = validate_url(url)?;
        Ok(self.extractor.probe(url.as_str())?)
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.list()
    }

    /// Subscribes to a channel. The id comes from the URL shape when possible,
    /// otherwise from a metadata probe. A video URL subscribes to its channel.
    pub fn add_subscription(
        &self,
        url: &str,
        name: Option<&str>,
        audio_only: Option<bool>,
    ) -> CoreResult<Subscription> {
        let parsed = validate_url(url)?;
        let name = name.map(str::trim).filter(|name| !name.is_empty());

        let (id, source_url, probed_name) = match channel_id_from_url(&parsed) {
            Some(id) => (id, parsed.to_string(), None),
            None => {
                let metadata = self.extractor.probe(parsed.as_str())?;
                let is_video = !metadata.is_collection() || video_id_from_url(&parsed).is_some();
                let id = metadata
                    .channel_id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .or_else(|| (!is_video).then(|| metadata.id.clone()))
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| {
                        CoreError::validation(format!("Could not resolve a channel for {parsed}"))
                    })?;
                let source_url = if is_video {
                    metadata
                        .channel_url
                        .clone()
                        .unwrap_or_else(|| format!("https://www.youtube.com/channel/{id}"))
                } else {
                    parsed.to_string()
                };
                (id, source_url, metadata.channel_name().map(str::to_string))
            }
        };

        let display_name = name
            .map(str::to_string)
            .or(probed_name)
            .unwrap_or_else(|| id.clone());
        let subscription = self.subscriptions.insert(Subscription {
            id,
            source_url,
            display_name,
            audio_only: audio_only.unwrap_or(false),
            created_at: Utc::now(),
        })?;

        info!(subscription = %subscription.id, "subscription added");
        self.run_log.note(&format!(
            "Subscribed to {} ({})",
            subscription.display_name, subscription.id
        ));
        Ok(subscription)
    }

    pub fn remove_subscription(&self, id: &str) -> CoreResult<Subscription> {
        let removed = self.subscriptions.remove(id)?;
        self.run_log.note(&format!(
            "Unsubscribed from {} ({})",
            removed.display_name, removed.id
        ));
        Ok(removed)
    }

    pub fn update_subscription(
        &self,
        id: &str,
        patch: &SubscriptionPatch,
    ) -> CoreResult<Subscription> {
        self.subscriptions.update(id, patch)
    }

    /// Runs one subscription now, synchronously.
    pub fn fetch_now(&self, id: &str) -> CoreResult<ChannelFetchOutcome> {
        let subscription = self.subscriptions.get(id)?;
        let outcome = self.fetcher.fetch(&subscription, &self.settings.get());
        self.run_log
            .note(&format!("[{}] fetch-now: {}", subscription.id, outcome.summary()));
        Ok(outcome)
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn update_settings(&self, patch: &SettingsPatch) -> CoreResult<Settings> {
        self.settings.update(patch)
    }

    pub fn get_schedule(&self) -> Schedule {
        self.schedule.get()
    }

    pub fn update_schedule(&self, enabled: bool, hour: i64, minute: i64) -> CoreResult<Schedule> {
        let schedule = self.schedule.update(enabled, hour, minute)?;
        self.run_log.note(&format!(
            "Schedule set to {:02}:{:02} ({})",
            schedule.hour,
            schedule.minute,
            if schedule.enabled { "enabled" } else { "disabled" }
        ));
        Ok(schedule)
    }

    /// Crontab line for the configured time; installing it is up to the operator.
    pub fn trigger_entry(&self, command: &str) -> String {
        self.schedule.get().trigger_entry(command)
    }

    pub fn get_logs(&self, tail: Option<usize>) -> CoreResult<Vec<String>> {
        self.run_log.read(tail)
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn run_now(&self) -> RunReport {
        self.scheduler.run_once(RunTrigger::Manual)
    }

    pub fn run_scheduled(&self, now: DateTime<Local>) -> RunReport {
        self.scheduler.run_once(RunTrigger::Scheduled(now))
    }

    pub fn self_update(&self) -> CoreResult<String> {
        let message = self.extractor.self_update()?;
        self.run_log.note(&format!("Extraction tool update: {message}"));
        Ok(message)
    }
}
