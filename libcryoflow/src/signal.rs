use std::path::{Path, PathBuf};

use super::error::SignalError;
use super::glob::glob_match;

/// A filesystem predicate reporting how many work items appear to be done.
///
/// Signals are polled by the runner. Observing must not change anything, so calling
/// `observe` twice without a filesystem change returns the same count.
pub trait CompletionSignal {
    fn observe(&self) -> Result<usize, SignalError>;

    /// Human readable description used in logs
    fn describe(&self) -> String;
}

/// Number of files in a directory whose name matches a glob pattern
#[derive(Debug, Clone, PartialEq)]
pub struct GlobCount {
    dir: PathBuf,
    pattern: String,
}

impl GlobCount {
    pub fn new(dir: &Path, pattern: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The matching paths themselves, sorted
    pub fn matches(&self) -> Result<Vec<PathBuf>, SignalError> {
        let entries = match self.dir.read_dir() {
            Ok(entries) => entries,
            // The tool may not have created its output directory yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SignalError::Unreadable {
                    dir: self.dir.clone(),
                    source,
                })
            }
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SignalError::Unreadable {
                dir: self.dir.clone(),
                source,
            })?;
            if glob_match(&self.pattern, &entry.file_name().to_string_lossy()) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}

impl CompletionSignal for GlobCount {
    fn observe(&self) -> Result<usize, SignalError> {
        Ok(self.matches()?.len())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.dir.display(), self.pattern)
    }
}

/// 1 once a single path exists, 0 before
#[derive(Debug, Clone, PartialEq)]
pub struct PathExists {
    path: PathBuf,
}

impl PathExists {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl CompletionSignal for PathExists {
    fn observe(&self) -> Result<usize, SignalError> {
        Ok(usize::from(self.path.exists()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_count_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_gctf.log", "b_gctf.log", "a.ctf", "gctf.log"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let signal = GlobCount::new(dir.path(), "*_gctf.log");
        let first = signal.observe().unwrap();
        let second = signal.observe().unwrap();
        assert_eq!(first, 2);
        assert_eq!(first, second);

        std::fs::write(dir.path().join("c_gctf.log"), "").unwrap();
        assert_eq!(signal.observe().unwrap(), 3);
    }

    #[test]
    fn missing_directory_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let signal = GlobCount::new(&dir.path().join("Particles"), "*_extract.star");
        assert_eq!(signal.observe().unwrap(), 0);
    }

    #[test]
    fn path_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("particles.star");
        let signal = PathExists::new(&path);
        assert_eq!(signal.observe().unwrap(), 0);
        std::fs::write(&path, "").unwrap();
        assert_eq!(signal.observe().unwrap(), 1);
        assert!(signal.describe().ends_with("particles.star"));
    }
}
