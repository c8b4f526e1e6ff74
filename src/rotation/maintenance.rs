//! Post-rotation work: compression of the rotated file, then retention.
//!
//! Jobs run on one background thread per file destination, in the order
//! they were scheduled. Scheduling never waits for a running job.
//! Failures are reported and never stop logging.

use async_channel::{Receiver, Sender};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use super::path::PathPattern;
use super::{Compression, Retention};
use crate::error::{SinkError, SinkOp};

/// Receives non-fatal maintenance failures.
pub type Reporter = Arc<dyn Fn(SinkError) + Send + Sync>;

pub(crate) struct Job {
    pub(crate) rotated: Option<PathBuf>,
    pub(crate) compression: Option<Compression>,
    pub(crate) retention: Option<Retention>,
    pub(crate) pattern: PathPattern,
    pub(crate) active: PathBuf,
}

impl Job {
    pub(crate) fn is_empty(&self) -> bool {
        self.retention.is_none() && (self.rotated.is_none() || self.compression.is_none())
    }

    pub(crate) fn run(self, report: &Reporter) {
        if let (Some(rotated), Some(compression)) = (&self.rotated, self.compression) {
            if let Err(e) = compress(rotated, compression) {
                report(e);
            }
        }
        if let Some(retention) = self.retention {
            for e in apply_retention(&self.pattern, &self.active, retention) {
                report(e);
            }
        }
    }
}

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

/// Serializes maintenance jobs of one destination. The thread starts with
/// the first job and lives until [`Maintenance::join`].
#[derive(Default)]
pub(crate) struct Maintenance {
    worker: Option<Worker>,
}

impl Maintenance {
    pub(crate) fn schedule(&mut self, job: Job, report: Reporter) {
        if job.is_empty() {
            return;
        }
        if self.worker.is_none() {
            let (tx, rx) = async_channel::unbounded();
            let on_spawn_failure = report.clone();
            let spawned = thread::Builder::new()
                .name("log-pipeline-maintenance".to_string())
                .spawn(move || run_jobs(rx, report));
            match spawned {
                Ok(handle) => self.worker = Some(Worker { tx, handle }),
                Err(e) => {
                    on_spawn_failure(SinkError::stream(SinkOp::Rotate, e));
                    return;
                }
            }
        }
        if let Some(worker) = &self.worker {
            // Only closed by `join`, which also takes the worker.
            let _ = worker.tx.try_send(job);
        }
    }

    /// Run every scheduled job, then stop the thread.
    pub(crate) fn join(&mut self) {
        if let Some(Worker { tx, handle }) = self.worker.take() {
            tx.close();
            if handle.join().is_err() {
                tracing::error!("log file maintenance job panicked");
            }
        }
    }
}

fn run_jobs(rx: Receiver<Job>, report: Reporter) {
    while let Ok(job) = rx.recv_blocking() {
        job.run(&report);
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(feature = "compression")]
fn compress(path: &Path, compression: Compression) -> Result<(), SinkError> {
    let target = with_extension_appended(path, compression.extension());
    if let Err(e) = encode_into(path, &target) {
        let _ = fs::remove_file(&target);
        return Err(SinkError::file(SinkOp::Compress, path, e));
    }
    tracing::debug!(from = %path.display(), to = %target.display(), "compressed rotated log file");
    fs::remove_file(path).map_err(|e| SinkError::file(SinkOp::Delete, path, e))
}

#[cfg(feature = "compression")]
fn encode_into(source: &Path, target: &Path) -> std::io::Result<()> {
    use std::io::Write;

    let mut input = fs::File::open(source)?;
    let mut output = std::io::BufWriter::new(fs::File::create(target)?);
    zstd::stream::copy_encode(&mut input, &mut output, 0)?;
    output.flush()
}

// Registration rejects compression when the feature is off.
#[cfg(not(feature = "compression"))]
fn compress(_path: &Path, _compression: Compression) -> Result<(), SinkError> {
    Ok(())
}

#[cfg(feature = "compression")]
fn with_extension_appended(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

struct Sibling {
    path: PathBuf,
    modified: SystemTime,
    base: String,
    n: u32,
}

/// Orders rotated files oldest first. `app.STAMP.log` precedes `app.STAMP.2.log`.
fn compare(a: &Sibling, b: &Sibling) -> Ordering {
    a.modified
        .cmp(&b.modified)
        .then_with(|| a.base.cmp(&b.base))
        .then(a.n.cmp(&b.n))
}

fn split_collision_suffix(name: &str, ext: &str) -> (String, u32) {
    let name = name.strip_suffix(".zst").unwrap_or(name);
    let name = name.strip_suffix(ext).unwrap_or(name);
    if let Some((base, n)) = name.rsplit_once('.') {
        if !n.is_empty() && n.len() <= 6 && n.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = n.parse() {
                return (base.to_string(), n);
            }
        }
    }
    (name.to_string(), 1)
}

fn siblings(pattern: &PathPattern, active: &Path) -> Result<Vec<Sibling>, SinkError> {
    let dir = pattern.dir();
    let active_name = active
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let entries = fs::read_dir(dir).map_err(|e| SinkError::file(SinkOp::Delete, dir, e))?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !pattern.is_sibling(&name, active_name) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let (base, n) = split_collision_suffix(&name, pattern.family_ext());
        found.push(Sibling {
            path: entry.path(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            base,
            n,
        });
    }
    found.sort_by(compare);
    Ok(found)
}

/// Deletes rotated files outside the policy, oldest first.
fn apply_retention(pattern: &PathPattern, active: &Path, retention: Retention) -> Vec<SinkError> {
    let found = match siblings(pattern, active) {
        Ok(found) => found,
        Err(e) => return vec![e],
    };

    let expired: Vec<&Sibling> = match retention {
        Retention::MaxCount(keep) => {
            let excess = found.len().saturating_sub(keep);
            found.iter().take(excess).collect()
        }
        Retention::MaxAge(age) => match SystemTime::now().checked_sub(age) {
            Some(cutoff) => found.iter().filter(|s| s.modified < cutoff).collect(),
            None => Vec::new(),
        },
    };

    let mut errors = Vec::new();
    for sibling in expired {
        match fs::remove_file(&sibling.path) {
            Ok(()) => tracing::debug!(path = %sibling.path.display(), "removed expired log file"),
            Err(e) => errors.push(SinkError::file(SinkOp::Delete, &sibling.path, e)),
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age: Duration) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"old line\n").unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn count_retention_keeps_newest_files() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = PathPattern::new(dir.path().join("app.log")).unwrap();
        let active = dir.path().join("app.log");
        fs::write(&active, b"").unwrap();
        touch(dir.path(), "app.a.log", Duration::from_secs(400));
        touch(dir.path(), "app.b.log", Duration::from_secs(300));
        touch(dir.path(), "app.c.log.zst", Duration::from_secs(200));
        touch(dir.path(), "app.d.log", Duration::from_secs(100));
        touch(dir.path(), "other.log", Duration::from_secs(900));

        let errors = apply_retention(&pattern, &active, Retention::MaxCount(2));
        assert!(errors.is_empty());
        assert_eq!(
            names(dir.path()),
            vec!["app.c.log.zst", "app.d.log", "app.log", "other.log"]
        );
    }

    #[test]
    fn age_retention_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = PathPattern::new(dir.path().join("app.log")).unwrap();
        let active = dir.path().join("app.log");
        touch(dir.path(), "app.log", Duration::from_secs(7200));
        touch(dir.path(), "app.old.log", Duration::from_secs(7200));
        touch(dir.path(), "app.new.log", Duration::from_secs(60));

        apply_retention(&pattern, &active, Retention::MaxAge(Duration::from_secs(3600)));
        assert_eq!(names(dir.path()), vec!["app.log", "app.new.log"]);
    }

    #[test]
    fn collision_suffix_orders_after_base_name() {
        assert_eq!(
            split_collision_suffix("app.STAMP.2.log.zst", ".log"),
            ("app.STAMP".to_string(), 2)
        );
        assert_eq!(
            split_collision_suffix("app.STAMP.log", ".log"),
            ("app.STAMP".to_string(), 1)
        );
    }

    #[cfg(feature = "compression")]
    #[test]
    fn compression_replaces_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let rotated = dir.path().join("app.STAMP.log");
        fs::write(&rotated, b"hello compressed world\n").unwrap();

        compress(&rotated, Compression::Zstd).unwrap();
        assert!(!rotated.exists());
        let packed = fs::read(dir.path().join("app.STAMP.log.zst")).unwrap();
        assert_eq!(zstd::decode_all(&packed[..]).unwrap(), b"hello compressed world\n");
    }

    #[test]
    fn scheduled_jobs_run_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("app.log");
        fs::write(&active, b"").unwrap();
        touch(dir.path(), "app.1.log", Duration::from_secs(20));
        touch(dir.path(), "app.2.log", Duration::from_secs(10));

        let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = reported.clone();
        let report: Reporter = Arc::new(move |e| sink.lock().push(e.to_string()));

        let mut maintenance = Maintenance::default();
        maintenance.schedule(
            Job {
                rotated: None,
                compression: None,
                retention: Some(Retention::MaxCount(1)),
                pattern: PathPattern::new(&active).unwrap(),
                active: active.clone(),
            },
            report,
        );
        maintenance.join();
        assert!(reported.lock().is_empty());
        assert_eq!(names(dir.path()), vec!["app.2.log", "app.log"]);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn scheduling_does_not_wait_for_a_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("app.log");
        fs::write(&active, b"").unwrap();

        let gate = Arc::new(parking_lot::Mutex::new(()));
        let held = gate.lock();
        let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let report: Reporter = {
            let gate = gate.clone();
            let reported = reported.clone();
            Arc::new(move |e| {
                let _open = gate.lock();
                reported.lock().push(e.to_string());
            })
        };
        // Compressing a missing file fails, and the report blocks on the gate.
        let failing = |name: &str| Job {
            rotated: Some(dir.path().join(name)),
            compression: Some(Compression::Zstd),
            retention: None,
            pattern: PathPattern::new(&active).unwrap(),
            active: active.clone(),
        };

        let mut maintenance = Maintenance::default();
        maintenance.schedule(failing("app.1.log"), report.clone());
        maintenance.schedule(failing("app.2.log"), report);
        assert!(reported.lock().is_empty());

        drop(held);
        maintenance.join();
        let reported = reported.lock();
        assert_eq!(reported.len(), 2);
        assert!(reported[0].contains("app.1.log"));
        assert!(reported[1].contains("app.2.log"));
    }
}
