use chrono::{DateTime, FixedOffset, Local, Utc};
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::lock::ProcessLock;
use super::maintenance::{Job, Maintenance, Reporter};
use super::path::{self, PathPattern};
use super::{Rotation, RotationPolicy};
use crate::error::{ConfigurationError, SinkError, SinkOp};

/// Owns the active file of one destination together with its rotation
/// state: the byte counter and the next scheduled rotation instant.
///
/// Every write goes through [`RotationManager::write`], which decides
/// whether to rotate first. In multiprocess mode the decision and the write
/// happen under an advisory lock shared with other processes.
pub struct RotationManager {
    pattern: PathPattern,
    policy: RotationPolicy,
    utc: bool,
    active: PathBuf,
    file: File,
    size: u64,
    next: Option<DateTime<FixedOffset>>,
    lock: Option<ProcessLock>,
    maintenance: Maintenance,
    report: Reporter,
}

impl RotationManager {
    /// Open (or create) the active file and seed the rotation state from it.
    ///
    /// **Parameters**
    /// - `pattern`: file path, possibly with a `{time}` placeholder.
    /// - `policy`: rotation, retention and compression rules.
    /// - `utc`: render names and compute daily instants in UTC instead of local time.
    /// - `multiprocess`: guard writes with an advisory lock on a sidecar file.
    /// - `report`: receives rotation and maintenance failures.
    ///
    /// **Returns**
    /// - `Err(ConfigurationError::Unwritable)` if the directory is missing or
    ///   the file cannot be opened for appending.
    pub fn open(
        pattern: PathPattern,
        policy: RotationPolicy,
        utc: bool,
        multiprocess: bool,
        report: Reporter,
    ) -> Result<Self, ConfigurationError> {
        let now = zoned(utc, Local::now().fixed_offset());
        let active = pattern.render(now);
        let unwritable = |path: &Path, source: io::Error| ConfigurationError::Unwritable {
            path: path.to_path_buf(),
            source,
        };

        let lock = if multiprocess {
            let lock_path = pattern.lock_path();
            Some(ProcessLock::open(&lock_path).map_err(|e| unwritable(&lock_path, e))?)
        } else {
            None
        };
        let file = open_append(&active).map_err(|e| unwritable(&active, e))?;
        let meta = file.metadata().map_err(|e| unwritable(&active, e))?;
        let next = policy
            .rotation
            .and_then(|rotation| first_instant(rotation, zoned(utc, created_at(&meta))));

        tracing::debug!(
            path = %active.display(),
            size = meta.len(),
            next_rotation = ?next,
            "opened log file"
        );

        Ok(Self {
            pattern,
            policy,
            utc,
            active,
            size: meta.len(),
            file,
            next,
            lock,
            maintenance: Maintenance::default(),
            report,
        })
    }

    /// Path of the file currently written to.
    pub fn path(&self) -> &Path {
        &self.active
    }

    /// Bytes in the active file, as tracked by the manager.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write `bytes` stamped at `time`, rotating first when the policy says so.
    ///
    /// **Returns**
    /// - `Ok(true)` if a rotation happened before the write.
    /// - `Err(..)` if the write itself failed. Rotation failures are reported
    ///   and the bytes go to the current file instead.
    pub fn write(&mut self, bytes: &[u8], time: DateTime<FixedOffset>) -> Result<bool, SinkError> {
        let time = zoned(self.utc, time);
        let lock = self.lock.take();
        let result = self.write_locked(lock.as_ref(), bytes, time);
        self.lock = lock;
        result
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.file
            .flush()
            .map_err(|e| SinkError::file(SinkOp::Flush, &self.active, e))
    }

    /// Flush the active file and wait for pending maintenance.
    pub fn close(&mut self) -> Result<(), SinkError> {
        let flushed = self.flush();
        self.maintenance.join();
        flushed
    }

    fn write_locked(
        &mut self,
        lock: Option<&ProcessLock>,
        bytes: &[u8],
        time: DateTime<FixedOffset>,
    ) -> Result<bool, SinkError> {
        let _guard = match lock {
            Some(lock) => {
                let guard = lock.acquire()?;
                self.resync()?;
                Some(guard)
            }
            None => None,
        };

        let mut rotated = false;
        if self.should_rotate(bytes.len() as u64, time) {
            match self.rotate(time) {
                Ok(()) => rotated = true,
                Err(e) => (self.report)(e),
            }
        }

        self.file
            .write_all(bytes)
            .map_err(|e| SinkError::file(SinkOp::Write, &self.active, e))?;
        self.size += bytes.len() as u64;
        Ok(rotated)
    }

    fn should_rotate(&self, len: u64, time: DateTime<FixedOffset>) -> bool {
        match self.policy.rotation {
            None => false,
            // An empty file never rotates, whatever the size of the record.
            Some(Rotation::Size(max)) => self.size > 0 && self.size + len > max,
            Some(Rotation::Daily(_)) | Some(Rotation::Interval(_)) => {
                self.next.is_some_and(|next| time >= next)
            }
        }
    }

    fn rotate(&mut self, time: DateTime<FixedOffset>) -> Result<(), SinkError> {
        let fresh = self.pattern.render(time);
        let rotated = if fresh == self.active {
            let target = path::rotated_path(&self.active, &PathPattern::stamp(time));
            fs::rename(&self.active, &target)
                .map_err(|e| SinkError::file(SinkOp::Rotate, &self.active, e))?;
            target
        } else {
            self.active.clone()
        };

        let file = match open_append(&fresh) {
            Ok(file) => file,
            Err(e) => {
                if rotated != self.active {
                    self.restore(rotated);
                }
                return Err(SinkError::file(SinkOp::Open, &fresh, e));
            }
        };
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let _ = self.file.flush();
        self.file = file;
        self.size = size;
        self.active = fresh;
        self.next = match (self.policy.rotation, self.next) {
            (Some(rotation), previous) => following_instant(rotation, previous, time),
            (None, _) => None,
        };

        tracing::info!(
            path = %self.active.display(),
            rotated = %rotated.display(),
            next_rotation = ?self.next,
            "rotated log file"
        );

        self.maintenance.schedule(
            Job {
                rotated: Some(rotated),
                compression: self.policy.compression,
                retention: self.policy.retention,
                pattern: self.pattern.clone(),
                active: self.active.clone(),
            },
            self.report.clone(),
        );
        Ok(())
    }

    /// The active file was renamed to `rotated` but no new file could be
    /// opened. Move it back, or keep writing under its new name.
    fn restore(&mut self, rotated: PathBuf) {
        match fs::rename(&rotated, &self.active) {
            Ok(()) => tracing::warn!(path = %self.active.display(), "rotation undone"),
            Err(e) => {
                tracing::warn!(
                    path = %rotated.display(),
                    error = %e,
                    "rotation cannot be undone, writing to the rotated file"
                );
                self.active = rotated;
            }
        }
    }

    /// Called under the process lock: pick up rotations done elsewhere and
    /// bytes appended by other writers.
    fn resync(&mut self) -> Result<(), SinkError> {
        let held = self
            .file
            .metadata()
            .map_err(|e| SinkError::file(SinkOp::Lock, &self.active, e))?;
        let replaced = match fs::metadata(&self.active) {
            Ok(on_disk) => !same_file(&held, &on_disk),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(SinkError::file(SinkOp::Lock, &self.active, e)),
        };

        if replaced {
            let file = open_append(&self.active)
                .map_err(|e| SinkError::file(SinkOp::Open, &self.active, e))?;
            let meta = file
                .metadata()
                .map_err(|e| SinkError::file(SinkOp::Open, &self.active, e))?;
            self.file = file;
            self.next = self
                .policy
                .rotation
                .and_then(|rotation| first_instant(rotation, zoned(self.utc, created_at(&meta))));
            self.size = meta.len();
            tracing::debug!(path = %self.active.display(), "log file rotated by another process");
        } else {
            self.size = held.len();
        }
        Ok(())
    }
}

impl Drop for RotationManager {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn zoned(utc: bool, time: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    if utc {
        time.with_timezone(&Utc).fixed_offset()
    } else {
        time.with_timezone(&Local).fixed_offset()
    }
}

fn created_at(meta: &Metadata) -> DateTime<FixedOffset> {
    let created = meta
        .created()
        .or_else(|_| meta.modified())
        .unwrap_or_else(|_| SystemTime::now());
    DateTime::<Utc>::from(created).fixed_offset()
}

/// First trigger instant for a file opened at `start`. DST shifts are not
/// tracked: the offset of `start` is kept.
fn first_instant(rotation: Rotation, start: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    match rotation {
        Rotation::Size(_) => None,
        Rotation::Daily(at) => {
            let candidate = start
                .date_naive()
                .and_time(at)
                .and_local_timezone(*start.offset())
                .single()?;
            if candidate <= start {
                candidate.checked_add_signed(chrono::Duration::days(1))
            } else {
                Some(candidate)
            }
        }
        Rotation::Interval(interval) => {
            if interval.is_zero() {
                return None;
            }
            start.checked_add_signed(chrono::Duration::from_std(interval).ok()?)
        }
    }
}

/// Next trigger after a rotation at `now`. Intervals keep their phase.
fn following_instant(
    rotation: Rotation,
    previous: Option<DateTime<FixedOffset>>,
    now: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    match (rotation, previous) {
        (Rotation::Interval(interval), Some(mut next)) => {
            let step = chrono::Duration::from_std(interval).ok()?;
            if step <= chrono::Duration::zero() {
                return None;
            }
            while next <= now {
                next = next.checked_add_signed(step)?;
            }
            Some(next)
        }
        _ => first_instant(rotation, now),
    }
}

#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_a: &Metadata, _b: &Metadata) -> bool {
    true
}
