//! Durable configuration records.
//!
//! Each store owns one JSON document under the data directory. The API, the
//! CLI and the cron run all open the same files, so reads reload the document
//! when it changed on disk, and every write goes through [`JsonStore::update`]:
//! exclusive `flock` on a sidecar lock file, re-read, mutate, persist, and
//! only then publish the new value.

pub mod runlog;
pub mod schedule;
pub mod settings;
pub mod subscriptions;

pub use runlog::RunLog;
pub use schedule::{Schedule, ScheduleStore};
pub use settings::{QualityPreset, Settings, SettingsPatch, SettingsStore};
pub use subscriptions::{Subscription, SubscriptionPatch, SubscriptionStore};

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::fcntl::{Flock, FlockArg};
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{CoreError, CoreResult};

pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const SCHEDULE_FILE: &str = "schedule.json";
pub const RUN_LOG_FILE: &str = "tubevault.log";

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| CoreError::filesystem(&format!("creating {}", parent.display()), err))?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value)
        .map_err(|err| CoreError::filesystem("serializing record", err))?;
    fs::write(&tmp_path, payload)
        .map_err(|err| CoreError::filesystem(&format!("writing {}", tmp_path.display()), err))?;
    fs::rename(&tmp_path, path).map_err(|err| {
        let _ = fs::remove_file(&tmp_path);
        CoreError::filesystem(&format!("replacing {}", path.display()), err)
    })?;
    Ok(())
}

/// Missing files load as the default; unreadable ones too, with a warning.
fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), "ignoring unreadable store file: {err}");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// What the cached copy was read from. Writers replace the file by rename,
/// so every write produces a new inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    inode: u64,
    modified: SystemTime,
    len: u64,
}

fn file_stamp(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    Some(FileStamp {
        inode: meta.ino(),
        modified: meta.modified().ok()?,
        len: meta.len(),
    })
}

#[derive(Debug)]
struct Cached<T> {
    value: T,
    stamp: Option<FileStamp>,
}

/// A single JSON record shared between processes.
#[derive(Debug)]
pub struct JsonStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    cached: RwLock<Cached<T>>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Default,
{
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(".lock");
        let stamp = file_stamp(&path);
        let value = read_json_or_default(&path);
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            cached: RwLock::new(Cached { value, stamp }),
        }
    }

    /// Current record, reloaded first if another writer replaced the file.
    pub fn get(&self) -> T {
        let stamp = file_stamp(&self.path);
        {
            let cached = self.cached.read();
            if cached.stamp == stamp {
                return cached.value.clone();
            }
        }
        let mut cached = self.cached.write();
        if cached.stamp != stamp {
            cached.value = read_json_or_default(&self.path);
            cached.stamp = stamp;
        }
        cached.value.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `mutate` to the latest on-disk record. If it fails, or the
    /// write to disk fails, both the file and the cached value are left
    /// untouched.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> CoreResult<R>) -> CoreResult<R> {
        let mut cached = self.cached.write();
        let _lock = self.lock_exclusive()?;
        let mut next: T = read_json_or_default(&self.path);
        let result = mutate(&mut next)?;
        write_json_atomic(&self.path, &next)?;
        cached.stamp = file_stamp(&self.path);
        cached.value = next;
        Ok(result)
    }

    fn lock_exclusive(&self) -> CoreResult<Flock<File>> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                CoreError::filesystem(&format!("creating {}", parent.display()), err)
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| {
                CoreError::filesystem(&format!("opening {}", self.lock_path.display()), err)
            })?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CoreError::filesystem("locking store", errno))
    }
}
