//! The extraction tool as a capability.
//!
//! [`Extractor`] is the only seam through which the orchestration core touches
//! the network. [`YtDlp`] implements it by shelling out; tests use the
//! scriptable fake from the test-only `fake` module.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::channel::video_id_from_url;
use crate::error::{CoreError, FailureKind};

/// Metadata returned by a probe. Everything is optional because channels,
/// playlists and old uploads all lack different fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub extractor_key: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_url: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "_type")]
    pub kind: Option<String>,
}

impl VideoMetadata {
    /// Channel display name: `channel` first, then `uploader`.
    pub fn channel_name(&self) -> Option<&str> {
        self.channel
            .as_deref()
            .or(self.uploader.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind.as_deref(), Some("playlist") | Some("multi_video"))
    }
}

/// One row of a flat channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelection {
    /// Pass-through selector such as `bestvideo+bestaudio`.
    Expression(String),
    /// Best audio stream converted into a fixed container.
    AudioOnly,
}

/// Audio container used for every audio-only download.
pub const AUDIO_CONTAINER: &str = "mp3";

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub url: String,
    pub format: FormatSelection,
    pub output_template: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOutput {
    /// Final path as reported by the tool after post-processing.
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("could not launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },

    #[error("{program} exited with {status}: {diagnostic}")]
    Failed {
        program: String,
        status: String,
        diagnostic: String,
    },

    #[error("unreadable tool output: {0}")]
    Parse(String),
}

const FILESYSTEM_MARKERS: &[&str] = &[
    "no space left on device",
    "permission denied",
    "read-only file system",
    "disk quota exceeded",
];

impl ExtractorError {
    /// Storage problems reported by the tool are surfaced as filesystem
    /// failures so operators can tell them apart from unavailable videos.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Failed { diagnostic, .. } => {
                let lowered = diagnostic.to_ascii_lowercase();
                if FILESYSTEM_MARKERS
                    .iter()
                    .any(|marker| lowered.contains(marker))
                {
                    FailureKind::Filesystem
                } else {
                    FailureKind::Extraction
                }
            }
            _ => FailureKind::Extraction,
        }
    }
}

impl From<ExtractorError> for CoreError {
    fn from(err: ExtractorError) -> Self {
        match err.failure_kind() {
            FailureKind::Filesystem => CoreError::Filesystem(err.to_string()),
            FailureKind::Extraction => CoreError::Extraction(err.to_string()),
        }
    }
}

pub trait Extractor: Send + Sync {
    /// Metadata probe only; never downloads media.
    fn probe(&self, url: &str) -> Result<VideoMetadata, ExtractorError>;

    /// The most recent `limit` uploads of a channel, newest first.
    fn list_recent(&self, channel_url: &str, limit: usize)
    -> Result<Vec<ChannelEntry>, ExtractorError>;

    fn extract(&self, request: &ExtractRequest) -> Result<ExtractOutput, ExtractorError>;

    /// Pass-through to the tool's own updater.
    fn self_update(&self) -> Result<String, ExtractorError>;
}

/// `yt-dlp` driven as a subprocess.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    probe_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            probe_timeout: Duration::from_secs(crate::config::DEFAULT_PROBE_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(crate::config::DEFAULT_DOWNLOAD_TIMEOUT_SECS),
        }
    }

    pub fn with_timeouts(mut self, probe: Duration, download: Duration) -> Self {
        self.probe_timeout = probe;
        self.download_timeout = download;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--no-warnings").arg("--no-progress");
        command
    }
}

impl Extractor for YtDlp {
    fn probe(&self, url: &str) -> Result<VideoMetadata, ExtractorError> {
        let mut command = self.command();
        // A watch URL carrying `&list=` must resolve to the video, matching
        // what `extract` downloads.
        if Url::parse(url).ok().as_ref().and_then(video_id_from_url).is_some() {
            command.arg("--no-playlist");
        }
        // A channel URL only needs its header, not every entry.
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--flat-playlist")
            .arg("--playlist-end")
            .arg("1")
            .arg(url);

        let output = run_with_timeout(command, self.probe_timeout)?;
        output.ensure_success()?;
        serde_json::from_str::<VideoMetadata>(output.stdout.trim())
            .map_err(|err| ExtractorError::Parse(format!("probe JSON for {url}: {err}")))
    }

    fn list_recent(
        &self,
        channel_url: &str,
        limit: usize,
    ) -> Result<Vec<ChannelEntry>, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-json")
            .arg("--ignore-errors")
            .arg("--playlist-end")
            .arg(limit.max(1).to_string())
            .arg(channel_url);

        let output = run_with_timeout(command, self.probe_timeout)?;
        let entries = parse_flat_entries(&output.stdout);
        // --ignore-errors still exits non-zero when single entries fail; only
        // treat it as fatal when nothing usable came back.
        if entries.is_empty() {
            output.ensure_success()?;
        }
        Ok(entries)
    }

    fn extract(&self, request: &ExtractRequest) -> Result<ExtractOutput, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--output")
            .arg(&request.output_template);
        // The executor writes the ledger entry once the output is confirmed.

        match &request.format {
            FormatSelection::AudioOnly => {
                command
                    .arg("--format")
                    .arg("bestaudio/best")
                    .arg("--extract-audio")
                    .arg("--audio-format")
                    .arg(AUDIO_CONTAINER)
                    .arg("--audio-quality")
                    .arg("0");
            }
            FormatSelection::Expression(expression) => {
                command.arg("--format").arg(expression);
            }
        }
        command.arg(&request.url);

        let output = run_with_timeout(command, self.download_timeout)?;
        output.ensure_success()?;

        let output_path = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .map(PathBuf::from);
        Ok(ExtractOutput { output_path })
    }

    fn self_update(&self) -> Result<String, ExtractorError> {
        let mut command = Command::new(&self.program);
        command.arg("-U");
        let output = run_with_timeout(command, self.probe_timeout)?;
        output.ensure_success()?;
        Ok(format!("{}{}", output.stdout, output.stderr).trim().to_string())
    }
}

/// Parses `--flat-playlist --dump-json` output, one JSON object per line.
/// Lines that fail to parse are skipped so one odd entry cannot sink a listing.
fn parse_flat_entries(stdout: &str) -> Vec<ChannelEntry> {
    #[derive(Deserialize)]
    struct FlatEntry {
        id: Option<String>,
        url: Option<String>,
        webpage_url: Option<String>,
        title: Option<String>,
        ie_key: Option<String>,
    }

    let mut entries = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Ok(entry) = serde_json::from_str::<FlatEntry>(line) else {
            tracing::debug!("skipping unparsable listing line");
            continue;
        };
        let Some(id) = entry.id.filter(|id| !id.trim().is_empty()) else {
            continue;
        };
        let url = entry
            .webpage_url
            .or(entry.url)
            .filter(|url| url.starts_with("http"))
            .unwrap_or_else(|| match entry.ie_key.as_deref() {
                Some(key) if !key.eq_ignore_ascii_case("youtube") => id.clone(),
                _ => format!("https://www.youtube.com/watch?v={id}"),
            });
        entries.push(ChannelEntry {
            id,
            url,
            title: entry.title,
        });
    }
    entries
}

struct ToolOutput {
    program: String,
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ToolOutput {
    fn ensure_success(&self) -> Result<(), ExtractorError> {
        if self.status.success() {
            return Ok(());
        }
        Err(ExtractorError::Failed {
            program: self.program.clone(),
            status: self.status.to_string(),
            diagnostic: diagnostic_excerpt(&self.stderr),
        })
    }
}

/// Keeps the `ERROR:` lines (or the tail) of the tool's stderr.
fn diagnostic_excerpt(stderr: &str) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("ERROR"))
        .collect();
    let lines: Vec<&str> = if errors.is_empty() {
        let all: Vec<&str> = stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let start = all.len().saturating_sub(5);
        all[start..].to_vec()
    } else {
        errors
    };
    if lines.is_empty() {
        "no diagnostic output".to_string()
    } else {
        lines.join(" | ")
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<String>> {
    source.map(|mut source| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = source.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

/// Runs a command, draining both pipes, and kills it once `timeout` passes.
fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ToolOutput, ExtractorError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child: Child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExtractorError::Launch {
            program: program.clone(),
            source,
        })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                tracing::warn!(%program, secs = timeout.as_secs(), "tool timed out, killing");
                let _ = child.kill();
                let _ = child.wait();
                // Readers are left detached: grandchildren such as ffmpeg may
                // still hold the pipes open.
                return Err(ExtractorError::TimedOut {
                    program,
                    secs: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(source) => {
                let _ = child.kill();
                return Err(ExtractorError::Launch { program, source });
            }
        }
    };

    let join = |reader: Option<JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };
    Ok(ToolOutput {
        program,
        status,
        stdout: join(stdout_reader),
        stderr: join(stderr_reader),
    })
}
