//! The pipeline steps. Each one is a [`FanOutStage`](crate::runner::FanOutStage) describing how
//! to command one worker and how to tell the step is done, plus a `run_*` function that
//! does the step's preparation and result collection around the runner.
pub mod classify;
pub mod ctf;
pub mod extract;
pub mod motion;
pub mod picking;
pub mod reference;

use std::path::Path;

use super::work_list::WorkItem;

/// Symlink each item into `dir` (created if needed) and return the linked paths
pub fn link_items(items: &[WorkItem], dir: &Path) -> Result<Vec<WorkItem>, std::io::Error> {
    std::fs::create_dir_all(dir)?;
    let mut linked = Vec::with_capacity(items.len());
    for item in items {
        let source = std::fs::canonicalize(item.path())?;
        let link = dir.join(item.file_name());
        if !link.exists() {
            std::os::unix::fs::symlink(&source, &link)?;
        }
        linked.push(WorkItem::new(link));
    }
    Ok(linked)
}

/// Directory form of a path for tools that expect a trailing separator
pub(crate) fn dir_arg(dir: &Path) -> String {
    let mut arg = dir.to_string_lossy().into_owned();
    if !arg.ends_with('/') {
        arg.push('/');
    }
    arg
}
