//! Archive Ledger: the authoritative "already downloaded" record.
//!
//! The on-disk form is exactly yt-dlp's `--download-archive` format
//! (`<extractor> <id>` per line) so manual tool runs and this crate share one
//! dedup record.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::{Flock, FlockArg};
use parking_lot::{Mutex, RawMutex, lock_api::ArcMutexGuard};

use crate::error::{CoreError, CoreResult};

/// Extractor tag used when the probe did not report one.
pub const DEFAULT_EXTRACTOR_TAG: &str = "youtube";

pub trait ArchiveLedger: Send + Sync {
    fn contains(&self, video_id: &str) -> bool;

    /// Idempotent: recording an id that is already present is a no-op.
    fn record(&self, video_id: &str, extractor_tag: &str) -> CoreResult<()>;
}

/// File-backed ledger shared with yt-dlp.
#[derive(Debug)]
pub struct FileArchive {
    path: PathBuf,
    entries: Mutex<HashSet<String>>,
}

impl FileArchive {
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let entries = load_archive(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-reads the file so entries appended by other processes are seen.
    fn refresh(&self, entries: &mut HashSet<String>) -> CoreResult<()> {
        entries.extend(load_archive(&self.path)?);
        Ok(())
    }
}

impl ArchiveLedger for FileArchive {
    fn contains(&self, video_id: &str) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains(video_id) {
            return true;
        }
        // Out-of-band tool runs may have appended since we loaded.
        if let Err(err) = self.refresh(&mut entries) {
            tracing::warn!(path = %self.path.display(), "could not re-read archive: {err}");
        }
        entries.contains(video_id)
    }

    fn record(&self, video_id: &str, extractor_tag: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains(video_id) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CoreError::filesystem("creating archive directory", err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .map_err(|err| CoreError::filesystem("opening archive", err))?;
        let mut locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CoreError::filesystem("locking archive", errno))?;

        // A manual tool run or another process may have written it meanwhile.
        self.refresh(&mut entries)?;
        if entries.contains(video_id) {
            return Ok(());
        }

        let tag = normalize_tag(extractor_tag);
        let line = format!("{tag} {video_id}\n");
        locked
            .write_all(line.as_bytes())
            .map_err(|err| CoreError::filesystem("writing archive entry", err))?;
        locked
            .flush()
            .map_err(|err| CoreError::filesystem("flushing archive", err))?;
        entries.insert(video_id.to_owned());
        Ok(())
    }
}

/// In-memory ledger for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    entries: Mutex<Vec<(String, String)>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries.lock().clone()
    }
}

impl ArchiveLedger for MemoryArchive {
    fn contains(&self, video_id: &str) -> bool {
        self.entries.lock().iter().any(|(_, id)| id == video_id)
    }

    fn record(&self, video_id: &str, extractor_tag: &str) -> CoreResult<()> {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|(_, id)| id == video_id) {
            entries.push((normalize_tag(extractor_tag), video_id.to_owned()));
        }
        Ok(())
    }
}

/// yt-dlp writes the lower-cased extractor key.
fn normalize_tag(tag: &str) -> String {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        DEFAULT_EXTRACTOR_TAG.to_string()
    } else {
        trimmed
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase()
    }
}

fn load_archive(path: &Path) -> CoreResult<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let file = File::open(path).map_err(|err| CoreError::filesystem("opening archive", err))?;
    let reader = BufReader::new(file);
    let mut entries = HashSet::new();

    for line in reader.lines() {
        let line = line.map_err(|err| CoreError::filesystem("reading archive", err))?;
        if let Some(id) = line.split_whitespace().last()
            && !id.is_empty()
        {
            entries.insert(id.to_owned());
        }
    }

    Ok(entries)
}

/// One mutual-exclusion gate per video id.
///
/// Holding a gate serialises check-download-record for that id only, so two
/// fetches racing on the same new upload download it once while unrelated
/// videos proceed in parallel. With a lock directory the gate also takes an
/// exclusive `flock` on `<dir>/<id>.lock`, which extends it to the cron run
/// and the API running as separate processes.
#[derive(Debug, Default)]
pub struct VideoGates {
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

pub struct VideoGateGuard<'a> {
    owner: &'a VideoGates,
    video_id: String,
    file_lock: Option<Flock<File>>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl VideoGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: Some(lock_dir.into()),
            ..Self::default()
        }
    }

    /// Blocks until this process and every other holder of the lock
    /// directory have released the id.
    pub fn acquire(&self, video_id: &str) -> CoreResult<VideoGateGuard<'_>> {
        let gate = {
            let mut gates = self.gates.lock();
            gates
                .entry(video_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let mut held = VideoGateGuard {
            owner: self,
            video_id: video_id.to_owned(),
            file_lock: None,
            guard: Some(gate.lock_arc()),
        };
        if let Some(dir) = &self.lock_dir {
            held.file_lock = Some(lock_file(dir, video_id)?);
        }
        Ok(held)
    }

    fn release(&self, video_id: &str) {
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get(video_id)
            && Arc::strong_count(gate) == 1
        {
            gates.remove(video_id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.gates.lock().len()
    }
}

/// Lock files are left in place; removing one would let a waiter and a
/// newcomer lock different inodes.
fn lock_file(dir: &Path, video_id: &str) -> CoreResult<Flock<File>> {
    std::fs::create_dir_all(dir)
        .map_err(|err| CoreError::filesystem(&format!("creating {}", dir.display()), err))?;
    let name: String = video_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{name}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|err| CoreError::filesystem(&format!("opening {}", path.display()), err))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| CoreError::filesystem("locking video", errno))
}

impl Drop for VideoGateGuard<'_> {
    fn drop(&mut self) {
        // File lock first, then the in-process lock and its Arc, then prune.
        self.file_lock.take();
        self.guard.take();
        self.owner.release(&self.video_id);
    }
}
