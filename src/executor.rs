//! Download Executor: one URL in, one classified outcome out.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::archive::{ArchiveLedger, DEFAULT_EXTRACTOR_TAG, VideoGates};
use crate::channel::{fallback_channel_dir, sanitize_channel_dir, video_id_from_url};
use crate::error::FailureKind;
use crate::extractor::{ExtractRequest, Extractor, FormatSelection, VideoMetadata};
use crate::store::{RunLog, Settings};

pub const OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

/// Per-video lock files shared by every process writing this download root.
pub const LOCK_DIR: &str = ".locks";

/// Settings after per-call overrides have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub format_expression: String,
    pub audio_only: bool,
    pub auto_hardlink: bool,
}

impl EffectiveConfig {
    pub fn resolve(settings: &Settings, audio_only: bool) -> Self {
        Self {
            format_expression: settings.format_expression.clone(),
            audio_only,
            auto_hardlink: settings.auto_hardlink,
        }
    }

    fn format(&self) -> FormatSelection {
        if self.audio_only {
            FormatSelection::AudioOnly
        } else {
            FormatSelection::Expression(self.format_expression.clone())
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    /// Already in the archive; nothing was downloaded.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub hardlinked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

impl DownloadOutcome {
    fn from_metadata(video_id: Option<String>, metadata: Option<&VideoMetadata>) -> Self {
        Self {
            video_id,
            title: metadata.and_then(|meta| meta.title.clone()),
            channel: metadata.and_then(|meta| meta.channel_name().map(str::to_string)),
            duration: metadata.and_then(|meta| meta.duration),
            filesize: metadata.and_then(VideoMetadata::size_hint),
            ..Self::default()
        }
    }

    fn skipped(video_id: String, metadata: Option<&VideoMetadata>) -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::from_metadata(Some(video_id), metadata)
        }
    }

    fn failed(self, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            skipped: false,
            error: Some(message.into()),
            error_kind: Some(kind),
            ..self
        }
    }

    /// One-line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        let subject = self
            .title
            .as_deref()
            .or(self.video_id.as_deref())
            .unwrap_or("video");
        match (self.success, self.skipped) {
            (true, true) => format!("skipped (already downloaded): {subject}"),
            (true, false) => match &self.output_path {
                Some(path) => format!("downloaded {subject} -> {}", path.display()),
                None => format!("downloaded {subject}"),
            },
            (false, _) => format!(
                "failed {subject} [{}]: {}",
                self.error_kind.map(FailureKind::as_str).unwrap_or("extraction"),
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

pub struct DownloadExecutor {
    extractor: Arc<dyn Extractor>,
    archive: Arc<dyn ArchiveLedger>,
    gates: VideoGates,
    download_root: PathBuf,
    media_library: Option<PathBuf>,
    run_log: Option<Arc<RunLog>>,
}

impl DownloadExecutor {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        archive: Arc<dyn ArchiveLedger>,
        download_root: impl Into<PathBuf>,
    ) -> Self {
        let download_root = download_root.into();
        Self {
            extractor,
            archive,
            gates: VideoGates::with_lock_dir(download_root.join(LOCK_DIR)),
            download_root,
            media_library: None,
            run_log: None,
        }
    }

    pub fn with_media_library(mut self, media_library: Option<PathBuf>) -> Self {
        self.media_library = media_library;
        self
    }

    pub fn with_run_log(mut self, run_log: Arc<RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn archive(&self) -> &dyn ArchiveLedger {
        self.archive.as_ref()
    }

    pub fn extractor(&self) -> &dyn Extractor {
        self.extractor.as_ref()
    }

    /// Downloads a single video. Never panics and never returns an error:
    /// every failure is folded into the outcome.
    pub fn download(&self, url: &Url, config: &EffectiveConfig) -> DownloadOutcome {
        let sniffed = video_id_from_url(url);
        if let Some(video_id) = &sniffed
            && self.archive.contains(video_id)
        {
            info!(video_id = %video_id, "already archived, skipping");
            return DownloadOutcome::skipped(video_id.clone(), None);
        }

        let metadata = match self.extractor.probe(url.as_str()) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(url = %url, "metadata probe failed: {err}");
                return DownloadOutcome::from_metadata(sniffed, None)
                    .failed(err.failure_kind(), format!("metadata probe failed: {err}"));
            }
        };

        if metadata.is_collection() {
            return DownloadOutcome::from_metadata(sniffed, Some(&metadata)).failed(
                FailureKind::Extraction,
                "URL resolves to a playlist or channel, not a single video",
            );
        }

        let probed_id = Some(metadata.id.trim().to_string()).filter(|id| !id.is_empty());
        let Some(video_id) = probed_id.or(sniffed) else {
            return DownloadOutcome::from_metadata(None, Some(&metadata))
                .failed(FailureKind::Extraction, "extraction tool reported no video id");
        };

        let _gate = match self.gates.acquire(&video_id) {
            Ok(gate) => gate,
            Err(err) => {
                warn!(video_id = %video_id, "could not lock video: {err}");
                return DownloadOutcome::from_metadata(Some(video_id), Some(&metadata))
                    .failed(FailureKind::Filesystem, err.to_string());
            }
        };
        // Another caller may have finished this video while we were probing.
        if self.archive.contains(&video_id) {
            info!(video_id = %video_id, "archived while waiting, skipping");
            return DownloadOutcome::skipped(video_id, Some(&metadata));
        }
        self.fetch_and_record(url, video_id, &metadata, config)
    }

    fn fetch_and_record(
        &self,
        url: &Url,
        video_id: String,
        metadata: &VideoMetadata,
        config: &EffectiveConfig,
    ) -> DownloadOutcome {
        let outcome = DownloadOutcome::from_metadata(Some(video_id.clone()), Some(metadata));
        let channel_dir = metadata
            .channel_name()
            .and_then(sanitize_channel_dir)
            .unwrap_or_else(|| fallback_channel_dir(url));
        let target_dir = self.download_root.join(&channel_dir);

        if let Err(err) = fs::create_dir_all(&target_dir) {
            warn!(video_id = %video_id, dir = %target_dir.display(), "destination not writable: {err}");
            return outcome.failed(
                FailureKind::Filesystem,
                format!("cannot create {}: {err}", target_dir.display()),
            );
        }

        let request = ExtractRequest {
            url: url.to_string(),
            format: config.format(),
            output_template: target_dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned(),
        };
        info!(video_id = %video_id, channel = %channel_dir, audio_only = config.audio_only, "downloading");

        let reported = match self.extractor.extract(&request) {
            Ok(output) => output.output_path,
            Err(err) => {
                warn!(video_id = %video_id, "download failed: {err}");
                return outcome.failed(err.failure_kind(), err.to_string());
            }
        };

        let Some(output_path) = confirm_output(reported, &target_dir, &video_id) else {
            warn!(video_id = %video_id, "tool reported success but no output file was found");
            return outcome.failed(
                FailureKind::Extraction,
                format!("no completed output file found for {video_id}"),
            );
        };

        let tag = metadata
            .extractor_key
            .as_deref()
            .unwrap_or(DEFAULT_EXTRACTOR_TAG);
        if let Err(err) = self.archive.record(&video_id, tag) {
            warn!(video_id = %video_id, "archive write failed: {err}");
            return outcome.failed(FailureKind::Filesystem, err.to_string());
        }

        let hardlinked = config.auto_hardlink && self.hardlink(&output_path, &channel_dir);
        let filesize = outcome
            .filesize
            .or_else(|| fs::metadata(&output_path).ok().map(|meta| meta.len()));
        info!(video_id = %video_id, path = %output_path.display(), "download complete");

        DownloadOutcome {
            success: true,
            filesize,
            output_path: Some(output_path),
            hardlinked,
            ..outcome
        }
    }

    /// Links the finished file into the media library. Failures are logged,
    /// never returned.
    fn hardlink(&self, output_path: &Path, channel_dir: &str) -> bool {
        let Some(library) = &self.media_library else {
            self.log_hardlink_failure(output_path, "no media library configured");
            return false;
        };
        let Some(file_name) = output_path.file_name() else {
            return false;
        };
        let target_dir = library.join(channel_dir);
        let target = target_dir.join(file_name);
        let linked = fs::create_dir_all(&target_dir).and_then(|_| {
            match fs::hard_link(output_path, &target) {
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                other => other,
            }
        });
        match linked {
            Ok(()) => true,
            Err(err) => {
                self.log_hardlink_failure(output_path, &err.to_string());
                false
            }
        }
    }

    fn log_hardlink_failure(&self, output_path: &Path, reason: &str) {
        let message = format!("hardlink failed for {}: {reason}", output_path.display());
        warn!("{message}");
        if let Some(run_log) = &self.run_log {
            run_log.note(&message);
        }
    }
}

fn is_partial(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("part" | "ytdl" | "temp" | "tmp")
    )
}

/// The path the tool printed if it exists, else the first finished file in
/// the channel directory carrying `[<id>]` in its name.
fn confirm_output(reported: Option<PathBuf>, dir: &Path, video_id: &str) -> Option<PathBuf> {
    if let Some(path) = reported
        && path.is_file()
        && !is_partial(&path)
    {
        return Some(path);
    }

    let marker = format!("[{video_id}]");
    WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .find(|path| {
            !is_partial(path)
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.contains(&marker))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{FileArchive, MemoryArchive};
    use crate::extractor::fake::FakeExtractor;
    #[cfg(unix)]
    use std::os::unix::fs::MetadataExt;

    struct Harness {
        dir: tempfile::TempDir,
        fake: Arc<FakeExtractor>,
        archive: Arc<MemoryArchive>,
        executor: DownloadExecutor,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExtractor::new());
        let archive = Arc::new(MemoryArchive::new());
        let executor = DownloadExecutor::new(fake.clone(), archive.clone(), dir.path().join("nas"));
        Harness {
            dir,
            fake,
            archive,
            executor,
        }
    }

    fn video_config() -> EffectiveConfig {
        EffectiveConfig::resolve(&Settings::default(), false)
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn second_download_is_skipped_without_tool_calls() {
        let h = harness();
        let target = h.fake.add_video("vid00000001", "First Clip", "Some Channel");

        let first = h.executor.download(&url(&target), &video_config());
        assert!(first.success && !first.skipped, "{first:?}");
        assert!(h.archive.contains("vid00000001"));
        let path = first.output_path.unwrap();
        assert_eq!(
            path,
            h.dir
                .path()
                .join("nas/Some_Channel/First Clip [vid00000001].mp4")
        );
        assert_eq!(first.channel.as_deref(), Some("Some Channel"));

        let probes = h.fake.probes();
        let extracts = h.fake.extracts();
        let second = h.executor.download(&url(&target), &video_config());
        assert!(second.success && second.skipped);
        assert_eq!(h.fake.probes(), probes);
        assert_eq!(h.fake.extracts(), extracts);
        assert_eq!(h.archive.entries().len(), 1);
    }

    #[test]
    fn audio_only_overrides_format_expression() {
        let h = harness();
        let target = h.fake.add_video("aud00000001", "Song", "Band");
        let config = EffectiveConfig::resolve(&Settings::default(), true);
        let outcome = h.executor.download(&url(&target), &config);
        assert!(outcome.success);
        assert_eq!(*h.fake.last_format.lock(), Some(FormatSelection::AudioOnly));
        assert_eq!(
            outcome.output_path.unwrap().extension().unwrap(),
            crate::extractor::AUDIO_CONTAINER
        );
    }

    #[test]
    fn extraction_failure_leaves_archive_untouched() {
        let h = harness();
        let target = h.fake.add_video("bad00000001", "Gone", "Chan");
        h.fake.fail_video("bad00000001");
        let outcome = h.executor.download(&url(&target), &video_config());
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(FailureKind::Extraction));
        assert!(outcome.error.is_some());
        assert!(!h.archive.contains("bad00000001"));
    }

    #[test]
    fn disk_full_is_reported_as_filesystem() {
        let h = harness();
        let target = h.fake.add_video("full0000001", "Big", "Chan");
        h.fake.fill_disk_for("full0000001");
        let outcome = h.executor.download(&url(&target), &video_config());
        assert_eq!(outcome.error_kind, Some(FailureKind::Filesystem));
        assert!(h.archive.entries().is_empty());
    }

    #[test]
    fn unwritable_destination_aborts_before_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("nas");
        fs::write(&blocker, "not a directory").unwrap();
        let fake = Arc::new(FakeExtractor::new());
        let archive = Arc::new(MemoryArchive::new());
        let executor = DownloadExecutor::new(fake.clone(), archive.clone(), &blocker);
        let target = fake.add_video("nowr0000001", "Clip", "Chan");

        let outcome = executor.download(&url(&target), &video_config());
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(FailureKind::Filesystem));
        assert_eq!(fake.extracts(), 0);
        assert!(archive.entries().is_empty());
    }

    #[test]
    fn missing_output_file_is_not_archived() {
        let h = harness();
        let target = h.fake.add_video("lost0000001", "Ghost", "Chan");
        h.fake.lose_output_for("lost0000001");
        let outcome = h.executor.download(&url(&target), &video_config());
        assert!(!outcome.success);
        assert!(!h.archive.contains("lost0000001"));
    }

    #[test]
    fn playlist_urls_are_refused() {
        let h = harness();
        let playlist = "https://www.youtube.com/playlist?list=PL1";
        h.fake.add_probe(
            playlist,
            VideoMetadata {
                id: "PL1".into(),
                kind: Some("playlist".into()),
                ..VideoMetadata::default()
            },
        );
        let outcome = h.executor.download(&url(playlist), &video_config());
        assert!(!outcome.success);
        assert_eq!(h.fake.extracts(), 0);
    }

    #[test]
    fn file_archive_records_confirmed_download() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExtractor::new());
        let archive = Arc::new(FileArchive::open(dir.path().join("downloaded.txt")).unwrap());
        let executor = DownloadExecutor::new(fake.clone(), archive.clone(), dir.path());
        let target = fake.add_video("file0000001", "Clip", "Chan");

        assert!(executor.download(&url(&target), &video_config()).success);
        assert_eq!(
            fs::read_to_string(dir.path().join("downloaded.txt")).unwrap(),
            "youtube file0000001\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn hardlink_lands_in_media_library() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeExtractor::new());
        let library = dir.path().join("library");
        let executor = DownloadExecutor::new(
            fake.clone(),
            Arc::new(MemoryArchive::new()),
            dir.path().join("nas"),
        )
        .with_media_library(Some(library.clone()));
        let target = fake.add_video("link0000001", "Linked", "Chan");
        let config = EffectiveConfig {
            auto_hardlink: true,
            ..video_config()
        };

        let outcome = executor.download(&url(&target), &config);
        assert!(outcome.hardlinked);
        let original = outcome.output_path.unwrap();
        let linked = library.join("Chan").join(original.file_name().unwrap());
        assert_eq!(
            fs::metadata(&original).unwrap().ino(),
            fs::metadata(&linked).unwrap().ino()
        );
    }

    #[test]
    fn hardlink_failure_does_not_fail_download() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library");
        fs::write(&library, "blocker").unwrap();
        let run_log = Arc::new(RunLog::new(dir.path().join("tubevault.log")));
        let fake = Arc::new(FakeExtractor::new());
        let executor = DownloadExecutor::new(
            fake.clone(),
            Arc::new(MemoryArchive::new()),
            dir.path().join("nas"),
        )
        .with_media_library(Some(library))
        .with_run_log(run_log.clone());
        let target = fake.add_video("link0000002", "Linked", "Chan");
        let config = EffectiveConfig {
            auto_hardlink: true,
            ..video_config()
        };

        let outcome = executor.download(&url(&target), &config);
        assert!(outcome.success);
        assert!(!outcome.hardlinked);
        let lines = run_log.read(None).unwrap();
        assert!(lines[0].contains("hardlink failed"));
    }

    #[test]
    fn concurrent_downloads_of_one_video_run_once() {
        let h = harness();
        let target = h.fake.add_video("race0000001", "Race", "Chan");
        h.fake.slow_down(std::time::Duration::from_millis(30));
        let config = video_config();

        let outcomes: Vec<DownloadOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| h.executor.download(&url(&target), &config)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert!(outcomes.iter().all(|outcome| outcome.success));
        assert_eq!(outcomes.iter().filter(|outcome| !outcome.skipped).count(), 1);
        assert_eq!(h.fake.extracts(), 1);
        assert_eq!(h.archive.entries().len(), 1);
    }

    #[test]
    fn separate_executors_on_one_ledger_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("downloaded.txt");
        let fake = Arc::new(FakeExtractor::new());
        let target = fake.add_video("xproc000001", "Shared", "Chan");
        fake.slow_down(std::time::Duration::from_millis(100));
        // One executor per process: the cron run and the API each open the
        // ledger themselves.
        let cron = DownloadExecutor::new(
            fake.clone(),
            Arc::new(FileArchive::open(&ledger).unwrap()),
            dir.path().join("nas"),
        );
        let api = DownloadExecutor::new(
            fake.clone(),
            Arc::new(FileArchive::open(&ledger).unwrap()),
            dir.path().join("nas"),
        );
        let config = video_config();

        let outcomes: Vec<DownloadOutcome> = std::thread::scope(|scope| {
            let first = scope.spawn(|| cron.download(&url(&target), &config));
            let second = scope.spawn(|| api.download(&url(&target), &config));
            vec![first.join().unwrap(), second.join().unwrap()]
        });

        assert!(outcomes.iter().all(|outcome| outcome.success));
        assert_eq!(outcomes.iter().filter(|outcome| outcome.skipped).count(), 1);
        assert_eq!(fake.extracts(), 1);
        assert_eq!(fs::read_to_string(&ledger).unwrap(), "youtube xproc000001\n");
    }

    #[test]
    fn confirm_output_ignores_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Clip [abc].mp4.part"), "x").unwrap();
        assert_eq!(confirm_output(None, dir.path(), "abc"), None);
        fs::write(dir.path().join("Clip [abc].mkv"), "x").unwrap();
        assert_eq!(
            confirm_output(Some(dir.path().join("missing.mp4")), dir.path(), "abc"),
            Some(dir.path().join("Clip [abc].mkv"))
        );
    }

    #[test]
    fn summary_describes_outcome() {
        let skipped = DownloadOutcome::skipped("abc".into(), None);
        assert_eq!(skipped.summary(), "skipped (already downloaded): abc");
        let failed = DownloadOutcome::from_metadata(Some("abc".into()), None)
            .failed(FailureKind::Filesystem, "disk full");
        assert_eq!(failed.summary(), "failed abc [filesystem]: disk full");
    }
}
