use std::path::PathBuf;
use thiserror::Error;

use super::stage_status::StageStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Config failed to format the run timestamp: {0}")]
    TimestampError(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum WorkListError {
    #[error("WorkList could not scan directory {0:?} as it does not exist")]
    BadDirectory(PathBuf),
    #[error("WorkList could not read list file {0:?} as it does not exist")]
    BadListFile(PathBuf),
    #[error("WorkList found no matching micrographs for pattern {pattern} in {dir:?}")]
    NoMatchingFiles { dir: PathBuf, pattern: String },
    #[error("WorkList was given an empty list of work items")]
    Empty,
    #[error("WorkList failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Cannot partition an empty work list")]
    NoWorkItems,
    #[error("Cannot partition work across zero workers")]
    NoWorkers,
}

#[derive(Debug, Error)]
pub enum PrerequisiteError {
    #[error("Required executables were not found in PATH: {}", .0.join(", "))]
    MissingExecutables(Vec<String>),
    #[error("Neither Gctf nor ctffind were found in PATH; cannot estimate CTF")]
    NoCtfEstimator,
    #[error("No usable {0} found on this machine")]
    NoResources(&'static str),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Command template for {program} references partition members but worker {worker} has none")]
    EmptyPartition { program: String, worker: usize },
    #[error("Command template failed to prepare worker files due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("CompletionSignal could not read directory {dir:?}: {source}")]
    Unreadable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {worker} could not create log file {path:?}: {source}")]
    LogFile {
        worker: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker {worker} failed to spawn {program}: {source}")]
    Spawn {
        worker: usize,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker {worker} failed while waiting on its process: {source}")]
    Wait {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker {worker} could not be signalled: {source}")]
    Signal {
        worker: usize,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Runner failed to plan partitions: {0}")]
    PartitionError(#[from] PartitionError),
    #[error("Runner failed to render a worker command: {0}")]
    TemplateError(#[from] TemplateError),
    #[error("Runner failed due to worker error: {0}")]
    WorkerError(#[from] WorkerError),
    #[error("Runner failed to observe completion: {0}")]
    SignalError(#[from] SignalError),
    #[error("Stage {stage}: worker {worker} exited with status {code:?}; see {log:?}")]
    WorkerFailed {
        stage: String,
        worker: usize,
        code: Option<i32>,
        log: PathBuf,
    },
    #[error("Stage {stage}: every worker exited but only {produced}/{expected} outputs were produced")]
    IncompleteOutput {
        stage: String,
        expected: usize,
        produced: usize,
    },
    #[error("Stage {stage} timed out after {elapsed_secs:.1}s with {produced}/{expected} outputs")]
    Timeout {
        stage: String,
        expected: usize,
        produced: usize,
        elapsed_secs: f64,
    },
    #[error("Stage {stage} was cancelled")]
    Cancelled { stage: String },
    #[error("Runner failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<StageStatus>),
}

#[derive(Debug, Error)]
pub enum LogParseError {
    #[error("Log {path:?} failed due to IO error: {source}")]
    IOError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Log {path:?} is missing the {marker} entry")]
    MissingEntry { path: PathBuf, marker: &'static str },
    #[error("Log {path:?} has a malformed {marker} entry: {line}")]
    Malformed {
        path: PathBuf,
        marker: &'static str,
        line: String,
    },
    #[error("No CTF results were found to summarize")]
    NoResults,
    #[error("Log parser failed to compile a pattern: {0}")]
    PatternError(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum StarError {
    #[error("STAR file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("STAR file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("STAR file {path:?} has no table named {table}")]
    MissingTable { path: PathBuf, table: String },
    #[error("STAR table {table} has no column {label}")]
    MissingColumn { table: String, label: String },
    #[error("STAR table {table} has a malformed value {value} in column {label}")]
    BadValue {
        table: String,
        label: String,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage failed due to Runner error: {0}")]
    RunnerError(#[from] RunnerError),
    #[error("Stage failed due to Prerequisite error: {0}")]
    PrerequisiteError(#[from] PrerequisiteError),
    #[error("Stage failed due to WorkList error: {0}")]
    WorkListError(#[from] WorkListError),
    #[error("Stage failed due to log parsing error: {0}")]
    LogParseError(#[from] LogParseError),
    #[error("Stage failed due to STAR error: {0}")]
    StarError(#[from] StarError),
    #[error("Stage failed to observe its outputs: {0}")]
    SignalError(#[from] SignalError),
    #[error("Stage found no micrographs with picked particles to extract")]
    NothingToExtract,
    #[error("Stage failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Pipeline failed due to Stage error: {0}")]
    StageError(#[from] StageError),
    #[error("Pipeline failed due to WorkList error: {0}")]
    WorkListError(#[from] WorkListError),
    #[error("Pipeline failed due to Prerequisite error: {0}")]
    PrerequisiteError(#[from] PrerequisiteError),
    #[error("Pipeline failed due to log parsing error: {0}")]
    LogParseError(#[from] LogParseError),
    #[error("Pipeline failed due to STAR error: {0}")]
    StarError(#[from] StarError),
    #[error("Pipeline cannot run 3D classification without a reference model")]
    MissingReference,
    #[error("Pipeline failed to write the run summary: {0}")]
    SummaryError(#[from] serde_yaml::Error),
    #[error("Pipeline failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
