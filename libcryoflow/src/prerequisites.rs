use std::path::{Path, PathBuf};

use super::config::CtfEstimator;
use super::error::PrerequisiteError;

/// Locate an executable on the current `PATH`
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var("PATH").unwrap_or_default();
    find_executable_in(name, &path_var)
}

/// Locate an executable on the given `PATH`-style search string.
/// A name containing a `/` is checked directly instead of searched for.
pub fn find_executable_in(name: &str, path_var: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Check every executable at once so the user sees the full list of what is missing
pub fn require_executables(names: &[&str]) -> Result<(), PrerequisiteError> {
    let missing: Vec<String> = names
        .iter()
        .filter(|name| find_executable(name).is_none())
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PrerequisiteError::MissingExecutables(missing))
    }
}

/// Pick the CTF estimator to use given what is installed. Falls back to the other estimator
/// when the requested one is missing.
pub fn select_ctf_estimator(
    requested: CtfEstimator,
    gctf_available: bool,
    ctffind_available: bool,
) -> Result<CtfEstimator, PrerequisiteError> {
    match (requested, gctf_available, ctffind_available) {
        (CtfEstimator::Gctf, true, _) => Ok(CtfEstimator::Gctf),
        (CtfEstimator::Ctffind, _, true) => Ok(CtfEstimator::Ctffind),
        (CtfEstimator::Gctf, false, true) => {
            spdlog::warn!("Gctf was not found, falling back to ctffind");
            Ok(CtfEstimator::Ctffind)
        }
        (CtfEstimator::Ctffind, true, false) => {
            spdlog::warn!("ctffind was not found, falling back to Gctf");
            Ok(CtfEstimator::Gctf)
        }
        _ => Err(PrerequisiteError::NoCtfEstimator),
    }
}
