use std::fs::File;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use super::command::{RenderedCommand, WorkerContext};
use super::error::WorkerError;
use super::resources::ResourceKind;

/// How long a terminated worker gets to exit after SIGTERM before it is SIGKILLed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const TERMINATE_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of one worker process:
/// `Created -> Running -> {Succeeded | Failed | Killed} -> Joined`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Succeeded,
    /// Non-zero exit, or `None` when a signal we did not send ended the process
    Failed(Option<i32>),
    Killed,
    Joined,
}

impl WorkerState {
    /// True once the process has exited (whether or not it has been joined)
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

/// What is left of a worker after it has been joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub index: usize,
    pub resource_id: usize,
    pub items: usize,
    pub exit_code: Option<i32>,
    /// The state the worker finished in before it was joined
    pub state: WorkerState,
    pub log_path: PathBuf,
}

/// One spawned external process and the partition it was handed
#[derive(Debug)]
pub struct Worker {
    pub index: usize,
    pub resource_id: usize,
    pub kind: ResourceKind,
    pub items: usize,
    log_path: PathBuf,
    child: Child,
    state: WorkerState,
    terminal: Option<WorkerState>,
    exit_code: Option<i32>,
}

impl Worker {
    /// Start the worker's process in its own process group, with stdout and stderr going to
    /// `log_path`. The command line is the first line of the log. Does not block.
    pub fn launch(
        ctx: &WorkerContext,
        command: &RenderedCommand,
        working_dir: &Path,
        log_path: PathBuf,
    ) -> Result<Self, WorkerError> {
        let log_err = |source| WorkerError::LogFile {
            worker: ctx.index,
            path: log_path.clone(),
            source,
        };
        let mut log = File::create(&log_path).map_err(log_err)?;
        writeln!(log, "# {}", command.display()).map_err(log_err)?;
        let stderr = log.try_clone().map_err(log_err)?;

        let mut cmd = command.to_command();
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        let child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            worker: ctx.index,
            program: command.program.clone(),
            source,
        })?;
        spdlog::info!(
            "Worker {} ({}) started pid {}: {}",
            ctx.index,
            ctx.worker_name(),
            child.id(),
            command.display()
        );

        let mut worker = Self {
            index: ctx.index,
            resource_id: ctx.resource_id,
            kind: ctx.kind,
            items: ctx.partition.len(),
            log_path,
            child,
            state: WorkerState::Created,
            terminal: None,
            exit_code: None,
        };
        worker.state = WorkerState::Running;
        Ok(worker)
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Check (without blocking) whether the process has exited
    pub fn poll(&mut self) -> Result<WorkerState, WorkerError> {
        if self.state == WorkerState::Running {
            let status = self.child.try_wait().map_err(|source| WorkerError::Wait {
                worker: self.index,
                source,
            })?;
            if let Some(status) = status {
                self.record_exit(status, false);
            }
        }
        Ok(self.state)
    }

    /// Send SIGTERM to the worker's whole process group, then SIGKILL if it lingers
    pub fn terminate(&mut self) -> Result<(), WorkerError> {
        if self.poll()? != WorkerState::Running {
            return Ok(());
        }
        spdlog::warn!("Terminating worker {} (pid {})", self.index, self.child.id());
        self.signal_group(Signal::SIGTERM)?;

        let start = Instant::now();
        while start.elapsed() < TERMINATE_GRACE {
            std::thread::sleep(TERMINATE_POLL);
            if let Some(status) = self.try_wait()? {
                self.record_exit(status, true);
                return Ok(());
            }
        }

        self.signal_group(Signal::SIGKILL)?;
        let status = self.child.wait().map_err(|source| WorkerError::Wait {
            worker: self.index,
            source,
        })?;
        self.record_exit(status, true);
        Ok(())
    }

    /// Wait for the process and record its exit status. Joining an already joined worker
    /// returns the recorded outcome immediately.
    pub fn join(&mut self) -> Result<WorkerOutcome, WorkerError> {
        if self.state == WorkerState::Running {
            let status = self.child.wait().map_err(|source| WorkerError::Wait {
                worker: self.index,
                source,
            })?;
            self.record_exit(status, false);
        }
        if self.state.is_finished() && self.state != WorkerState::Joined {
            self.terminal = Some(self.state);
            self.state = WorkerState::Joined;
        }
        Ok(WorkerOutcome {
            index: self.index,
            resource_id: self.resource_id,
            items: self.items,
            exit_code: self.exit_code,
            state: self.terminal.unwrap_or(self.state),
            log_path: self.log_path.clone(),
        })
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, WorkerError> {
        self.child.try_wait().map_err(|source| WorkerError::Wait {
            worker: self.index,
            source,
        })
    }

    fn signal_group(&self, signal: Signal) -> Result<(), WorkerError> {
        let pgid = Pid::from_raw(self.child.id() as i32);
        match killpg(pgid, signal) {
            // Group already gone
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(WorkerError::Signal {
                worker: self.index,
                source,
            }),
        }
    }

    fn record_exit(&mut self, status: ExitStatus, killed: bool) {
        self.exit_code = status.code();
        self.state = match status.code() {
            Some(0) => WorkerState::Succeeded,
            _ if killed => WorkerState::Killed,
            Some(code) => WorkerState::Failed(Some(code)),
            None => {
                spdlog::warn!(
                    "Worker {} was ended by signal {:?}",
                    self.index,
                    status.signal()
                );
                WorkerState::Failed(None)
            }
        };
    }
}
