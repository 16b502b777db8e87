use std::path::Path;

use super::constants::NVIDIA_GPU_DIR;
use super::error::PrerequisiteError;

/// What each worker of a stage is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Gpu,
    Cpu,
    /// A single worker that manages its own parallelism (e.g. an MPI job)
    Single,
}

impl ResourceKind {
    /// Short name used in log and per-worker file names, e.g. `gctf_gpu0.log`
    pub fn label(&self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Single => "job",
        }
    }
}

/// Count the GPUs known to the NVIDIA driver
pub fn detect_gpus() -> usize {
    count_gpus_in(Path::new(NVIDIA_GPU_DIR))
}

fn count_gpus_in(dir: &Path) -> usize {
    match dir.read_dir() {
        Ok(entries) => entries.filter_map(Result::ok).count(),
        Err(_) => 0,
    }
}

/// Number of CPUs this process may use
pub fn detect_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Decide how many workers a stage launches
///
/// A `requested` count of zero means "everything available". The result is clamped to the
/// number of work items so no worker is idle.
pub fn resolve_worker_count(
    kind: ResourceKind,
    requested: usize,
    available: usize,
    n_items: usize,
) -> Result<usize, PrerequisiteError> {
    let count = match kind {
        ResourceKind::Single => 1,
        _ if requested > 0 => requested,
        _ => available,
    };
    if count == 0 {
        return Err(PrerequisiteError::NoResources(match kind {
            ResourceKind::Gpu => "GPU",
            ResourceKind::Cpu => "CPU",
            ResourceKind::Single => "worker",
        }));
    }
    if requested > available && kind == ResourceKind::Gpu {
        spdlog::warn!("Requested {requested} GPUs but only {available} were detected");
    }
    Ok(count.min(n_items.max(1)))
}
