use std::path::{Path, PathBuf};

use super::config::Config;
use super::error::WorkListError;
use super::glob::glob_match;

/// One unit of work: a micrograph or movie file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem {
    path: PathBuf,
}

impl WorkItem {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without directory, e.g. `mic_001.mrc`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name without directory or final extension, e.g. `mic_001`
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// The ordered, immutable list of work items for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkList {
    items: Vec<WorkItem>,
}

impl WorkList {
    /// Build a WorkList from explicit items. An empty list is a missing-input error.
    pub fn from_items(items: Vec<WorkItem>) -> Result<Self, WorkListError> {
        if items.is_empty() {
            return Err(WorkListError::Empty);
        }
        Ok(Self { items })
    }

    /// Find the work items for this run, either from the list file or by scanning the data directory.
    /// The quick-look cap is applied after discovery.
    pub fn discover(config: &Config) -> Result<Self, WorkListError> {
        let list = match &config.list_file {
            Some(list_file) => Self::read_list_file(list_file)?,
            None => Self::scan_data_path(config)?,
        };
        let total = list.len();
        let list = match config.max_micrographs {
            Some(max) if max > 0 && max < total => {
                spdlog::info!("Keeping only the first {max} of {total} micrographs");
                list.truncate(max)
            }
            _ => list,
        };
        spdlog::info!(
            "Found {} micrographs with total size {}",
            list.len(),
            human_bytes::human_bytes(list.total_size_bytes() as f64)
        );
        Ok(list)
    }

    /// Scan the data directory with the configured glob. Movie stacks are often written as
    /// `.mrc`, so a `mrcs` suffix that matches nothing is retried as `mrc`.
    fn scan_data_path(config: &Config) -> Result<Self, WorkListError> {
        let pattern = config.micrograph_glob();
        match Self::scan(&config.data_path, &pattern, &config.exclude_pattern) {
            Err(WorkListError::NoMatchingFiles { .. }) if config.micrograph_suffix == "mrcs" => {
                let fallback = format!("*{}*mrc", config.micrograph_pattern);
                spdlog::warn!("No files match {pattern}, trying {fallback}");
                Self::scan(&config.data_path, &fallback, &config.exclude_pattern)
            }
            other => other,
        }
    }

    /// Scan a directory (non-recursively) for file names matching `pattern`.
    /// Names containing `exclude` are skipped. Results are sorted by name.
    pub fn scan(dir: &Path, pattern: &str, exclude: &str) -> Result<Self, WorkListError> {
        if !dir.exists() {
            return Err(WorkListError::BadDirectory(dir.to_path_buf()));
        }
        let mut items: Vec<WorkItem> = Vec::new();
        for entry in dir.read_dir()? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => continue,
            };
            if !exclude.is_empty() && name.contains(exclude) {
                continue;
            }
            if glob_match(pattern, &name) {
                items.push(WorkItem::new(path));
            }
        }
        if items.is_empty() {
            return Err(WorkListError::NoMatchingFiles {
                dir: dir.to_path_buf(),
                pattern: pattern.to_string(),
            });
        }
        items.sort();
        Ok(Self { items })
    }

    /// Read a list file with one path per line. Blank lines and `#` comments are ignored.
    /// Relative paths are resolved against the list file's directory.
    pub fn read_list_file(list_path: &Path) -> Result<Self, WorkListError> {
        if !list_path.exists() {
            return Err(WorkListError::BadListFile(list_path.to_path_buf()));
        }
        let parent = list_path.parent().unwrap_or(Path::new("."));
        let contents = std::fs::read_to_string(list_path)?;
        let items = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                let path = PathBuf::from(line);
                if path.is_absolute() {
                    WorkItem::new(path)
                } else {
                    WorkItem::new(parent.join(path))
                }
            })
            .collect();
        Self::from_items(items)
    }

    /// Keep only the first `max` items
    pub fn truncate(mut self, max: usize) -> Self {
        if max > 0 {
            self.items.truncate(max);
        }
        self
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WorkItem> {
        self.items.iter()
    }

    /// Sum of file sizes; files that cannot be stat'd count as zero
    pub fn total_size_bytes(&self) -> u64 {
        self.items
            .iter()
            .filter_map(|item| std::fs::metadata(item.path()).ok())
            .map(|meta| meta.len())
            .sum()
    }
}

impl<'a> IntoIterator for &'a WorkList {
    type Item = &'a WorkItem;
    type IntoIter = std::slice::Iter<'a, WorkItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
