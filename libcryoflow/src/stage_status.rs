#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// All workers for the stage were launched
    Launched { workers: usize, total: usize },
    /// The completion signal increased
    Progress { done: usize, total: usize },
    /// A worker process exited
    WorkerExited { worker: usize, code: Option<i32> },
    /// The stage met its completion condition and all workers were joined
    Finished { produced: usize, total: usize },
}

/// Message sent from the runner to whoever renders progress (typically the CLI)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: String,
    pub event: StageEvent,
}

impl StageStatus {
    pub fn new(stage: &str, event: StageEvent) -> Self {
        Self {
            stage: stage.to_string(),
            event,
        }
    }

    /// Fraction of the stage completed, if this message carries progress
    pub fn fraction(&self) -> Option<f32> {
        match self.event {
            StageEvent::Launched { .. } => Some(0.0),
            StageEvent::Progress { done, total } | StageEvent::Finished { produced: done, total } => {
                if total == 0 {
                    Some(1.0)
                } else {
                    Some((done as f32 / total as f32).min(1.0))
                }
            }
            StageEvent::WorkerExited { .. } => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.event {
            StageEvent::Launched { workers, total } => {
                write!(f, "{}: launched {workers} workers for {total} items", self.stage)
            }
            StageEvent::Progress { done, total } => write!(f, "{}: {done}/{total} done", self.stage),
            StageEvent::WorkerExited { worker, code } => match code {
                Some(c) => write!(f, "{}: worker {worker} exited with code {c}", self.stage),
                None => write!(f, "{}: worker {worker} was terminated by a signal", self.stage),
            },
            StageEvent::Finished { produced, total } => {
                write!(f, "{}: finished with {produced}/{total} outputs", self.stage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_format() {
        let status = StageStatus::new("gctf", StageEvent::Progress { done: 5, total: 10 });
        assert_eq!(status.to_string(), "gctf: 5/10 done");
        assert_eq!(status.fraction(), Some(0.5));
    }

    #[test]
    fn worker_exit_has_no_fraction() {
        let status = StageStatus::new(
            "gctf",
            StageEvent::WorkerExited {
                worker: 1,
                code: Some(0),
            },
        );
        assert!(status.fraction().is_none());
    }
}
