use chrono::{DateTime, FixedOffset};
use std::path::{Path, PathBuf};

use crate::error::ConfigurationError;

const DEFAULT_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%6f";

/// File path with an optional `{time}` / `{time:FORMAT}` placeholder in the
/// file name, substituted whenever a file is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    dir: PathBuf,
    file_name: String,
    prefix: String,
    suffix: String,
    stamp_format: Option<String>,
    family_prefix: String,
    family_ext: String,
}

impl PathPattern {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let invalid = |why: &str| {
            ConfigurationError::InvalidDestination(format!("{}: {why}", path.display()))
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("no file name"))?
            .to_string();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if dir.to_string_lossy().contains("{time") {
            return Err(invalid("placeholders are only allowed in the file name"));
        }

        let (prefix, suffix, stamp_format) = match file_name.find("{time") {
            Some(start) => {
                let end = file_name[start..]
                    .find('}')
                    .map(|i| start + i)
                    .ok_or_else(|| invalid("unclosed placeholder"))?;
                let spec = &file_name[start + "{time".len()..end];
                let format = match spec.strip_prefix(':') {
                    Some(format) if !format.is_empty() => format.to_string(),
                    None if spec.is_empty() => DEFAULT_STAMP_FORMAT.to_string(),
                    _ => return Err(invalid("malformed placeholder")),
                };
                (
                    file_name[..start].to_string(),
                    file_name[end + 1..].to_string(),
                    Some(format),
                )
            }
            None => (file_name.clone(), String::new(), None),
        };

        let (family_prefix, family_ext) = if stamp_format.is_some() {
            let ext = suffix.rfind('.').map(|i| suffix[i..].to_string()).unwrap_or_default();
            (prefix.clone(), ext)
        } else {
            match file_name.rfind('.') {
                Some(i) if i > 0 => (format!("{}.", &file_name[..i]), file_name[i..].to_string()),
                _ => (format!("{file_name}."), String::new()),
            }
        };

        Ok(Self {
            dir,
            file_name,
            prefix,
            suffix,
            stamp_format,
            family_prefix,
            family_ext,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn has_placeholder(&self) -> bool {
        self.stamp_format.is_some()
    }

    /// The concrete path of a file opened at `time`.
    pub fn render(&self, time: DateTime<FixedOffset>) -> PathBuf {
        match &self.stamp_format {
            Some(format) => self.dir.join(format!(
                "{}{}{}",
                self.prefix,
                time.format(format),
                self.suffix
            )),
            None => self.dir.join(&self.file_name),
        }
    }

    /// Sidecar file used for cross-process locking. Stable across rotations.
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.lock", self.file_name))
    }

    /// Whether `name` is a rotated (or older active) member of this family.
    pub(crate) fn is_sibling(&self, name: &str, active_name: &str) -> bool {
        if name == active_name || name.ends_with(".lock") || !name.starts_with(&self.family_prefix) {
            return false;
        }
        let name = name.strip_suffix(".zst").unwrap_or(name);
        name.ends_with(&self.family_ext)
    }

    pub(crate) fn family_ext(&self) -> &str {
        &self.family_ext
    }

    pub(crate) fn stamp(time: DateTime<FixedOffset>) -> String {
        time.format(DEFAULT_STAMP_FORMAT).to_string()
    }
}

/// `<stem>.<stamp><ext>`, or `<stem>.<stamp>.<n><ext>` when taken.
pub(crate) fn rotated_path(active: &Path, stamp: &str) -> PathBuf {
    let dir = active.parent().unwrap_or_else(|| Path::new("."));
    let stem = active
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = active
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let name = if n == 1 {
            format!("{stem}.{stamp}{ext}")
        } else {
            format!("{stem}.{stamp}.{n}{ext}")
        };
        let candidate = dir.join(&name);
        let compressed = dir.join(format!("{name}.zst"));
        if !candidate.exists() && !compressed.exists() {
            return candidate;
        }
        n += 1;
    }
}
