//! Human-readable run log, retrievable through the facade.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one `[YYYY-MM-DD HH:MM:SS] message` line.
    pub fn append(&self, message: &str) -> CoreResult<()> {
        let flattened = message.replace(['\r', '\n'], " ");
        let line = format!(
            "[{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            flattened.trim()
        );

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| CoreError::filesystem("creating log directory", err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| CoreError::filesystem("opening run log", err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| CoreError::filesystem("writing run log", err))
    }

    /// Logging must never fail an operation; problems go to tracing instead.
    pub fn note(&self, message: &str) {
        if let Err(err) = self.append(message) {
            tracing::warn!(path = %self.path.display(), "run log append failed: {err}");
        }
    }

    /// Log lines, oldest first. `tail` keeps only the last N.
    pub fn read(&self, tail: Option<usize>) -> CoreResult<Vec<String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::filesystem("reading run log", err)),
        };
        let lines: Vec<String> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(match tail {
            Some(count) => lines[lines.len().saturating_sub(count)..].to_vec(),
            None => lines,
        })
    }
}
