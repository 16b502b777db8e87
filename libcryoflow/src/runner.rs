use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use super::cancel::CancelToken;
use super::command::{RenderedCommand, WorkerContext};
use super::config::PollConfig;
use super::error::{RunnerError, TemplateError};
use super::partition::plan_partitions;
use super::resources::ResourceKind;
use super::signal::CompletionSignal;
use super::stage_status::{StageEvent, StageStatus};
use super::work_list::WorkItem;
use super::worker::{Worker, WorkerOutcome, WorkerState};

/// How the supervisor waits on a stage
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: u32,
    /// Give up on the stage after this long
    pub deadline: Option<Duration>,
    /// Watch worker exit statuses while polling
    pub check_exits: bool,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

impl From<&PollConfig> for PollPolicy {
    fn from(config: &PollConfig) -> Self {
        Self {
            initial_interval: config.initial_interval(),
            max_interval: config.max_interval(),
            backoff_factor: config.backoff_factor,
            deadline: config.stage_timeout(),
            check_exits: true,
        }
    }
}

impl PollPolicy {
    /// No deadline and no exit checks: waits until the completion signal reaches its total,
    /// forever if a worker dies without producing output. Only useful where the signal is
    /// known to be reliable.
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            check_exits: false,
            ..Self::default()
        }
    }

    /// Sleep before poll number `attempt` (1 based), growing geometrically up to the maximum
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }
}

/// Turns raw completion-signal observations into progress events.
/// The first observation is the baseline; an event is produced only when the count
/// strictly increases over the previous observation.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last: Option<usize>,
}

impl ProgressTracker {
    pub fn observe(&mut self, count: usize) -> Option<usize> {
        let event = match self.last {
            Some(last) if count > last => Some(count),
            _ => None,
        };
        self.last = Some(self.last.map_or(count, |last| last.max(count)));
        event
    }
}

/// Outcome of the polling loop
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub total: usize,
    pub produced: usize,
    pub elapsed: Duration,
}

/// Final state of a stage after every worker was joined
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub stage: String,
    pub total: usize,
    pub produced: usize,
    pub workers: Vec<WorkerOutcome>,
    pub elapsed: Duration,
}

impl RunResult {
    pub fn log_files(&self) -> Vec<&Path> {
        self.workers.iter().map(|w| w.log_path.as_path()).collect()
    }
}

/// A pipeline step that fans its work items out over external processes
pub trait FanOutStage {
    /// Short name used for logs and status messages
    fn name(&self) -> &str;
    fn resource_kind(&self) -> ResourceKind;
    /// Directory the worker processes run in
    fn working_dir(&self) -> &Path;
    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError>;
    fn completion_signal(&self) -> Box<dyn CompletionSignal>;
    /// Number of completion-signal matches that mean the stage is done
    fn expected_outputs(&self, n_items: usize) -> usize {
        n_items
    }
}

/// Poll `signal` until it reaches `total`, a worker fails, the deadline passes or the run is
/// cancelled. Sleeps between polls follow the policy's backoff.
pub fn await_completion(
    stage: &str,
    workers: &mut [Worker],
    total: usize,
    signal: &dyn CompletionSignal,
    policy: &PollPolicy,
    cancel: &CancelToken,
    tx: &Sender<StageStatus>,
) -> Result<Completion, RunnerError> {
    let start = Instant::now();
    let mut tracker = ProgressTracker::default();
    let mut reported_exit = vec![false; workers.len()];
    let mut attempt: u32 = 0;

    loop {
        let count = signal.observe()?;
        if let Some(done) = tracker.observe(count) {
            spdlog::info!("{stage}: {done}/{total} done");
            tx.send(StageStatus::new(stage, StageEvent::Progress { done, total }))?;
        }
        if count >= total {
            return Ok(Completion {
                total,
                produced: count,
                elapsed: start.elapsed(),
            });
        }

        if cancel.is_cancelled() {
            spdlog::warn!("{stage}: cancelled with {count}/{total} done");
            return Err(RunnerError::Cancelled {
                stage: stage.to_string(),
            });
        }

        if policy.check_exits {
            let mut all_exited = true;
            for (worker, reported) in workers.iter_mut().zip(reported_exit.iter_mut()) {
                let state = worker.poll()?;
                if state.is_finished() && !*reported {
                    *reported = true;
                    tx.send(StageStatus::new(
                        stage,
                        StageEvent::WorkerExited {
                            worker: worker.index,
                            code: worker.exit_code(),
                        },
                    ))?;
                }
                match state {
                    WorkerState::Created | WorkerState::Running => all_exited = false,
                    WorkerState::Failed(code) => {
                        spdlog::error!(
                            "{stage}: worker {} exited with {code:?}, see {:?}",
                            worker.index,
                            worker.log_path()
                        );
                        return Err(RunnerError::WorkerFailed {
                            stage: stage.to_string(),
                            worker: worker.index,
                            code,
                            log: worker.log_path().to_path_buf(),
                        });
                    }
                    WorkerState::Killed => {
                        return Err(RunnerError::WorkerFailed {
                            stage: stage.to_string(),
                            worker: worker.index,
                            code: None,
                            log: worker.log_path().to_path_buf(),
                        })
                    }
                    WorkerState::Succeeded | WorkerState::Joined => (),
                }
            }

            if all_exited {
                // Outputs may land between the last observation and the final exit
                let produced = signal.observe()?;
                if let Some(done) = tracker.observe(produced) {
                    tx.send(StageStatus::new(stage, StageEvent::Progress { done, total }))?;
                }
                if produced >= total {
                    return Ok(Completion {
                        total,
                        produced,
                        elapsed: start.elapsed(),
                    });
                }
                spdlog::error!(
                    "{stage}: all workers exited but only {produced}/{total} outputs matched {}",
                    signal.describe()
                );
                return Err(RunnerError::IncompleteOutput {
                    stage: stage.to_string(),
                    expected: total,
                    produced,
                });
            }
        }

        let mut delay = policy.delay_for_attempt(attempt + 1);
        if let Some(deadline) = policy.deadline {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                spdlog::error!("{stage}: timed out with {count}/{total} done");
                return Err(RunnerError::Timeout {
                    stage: stage.to_string(),
                    expected: total,
                    produced: count,
                    elapsed_secs: elapsed.as_secs_f64(),
                });
            }
            delay = delay.min(deadline - elapsed);
        }
        std::thread::sleep(delay);
        attempt = attempt.saturating_add(1);
    }
}

/// Once the outputs are in, wait for the workers to exit under the same deadline and
/// cancellation as the polling loop. A tool that stalls after writing its outputs must not
/// hang the stage.
pub fn await_exits(
    stage: &str,
    workers: &mut [Worker],
    completion: &Completion,
    start: Instant,
    policy: &PollPolicy,
    cancel: &CancelToken,
) -> Result<(), RunnerError> {
    let mut attempt: u32 = 0;
    loop {
        let mut all_exited = true;
        for worker in workers.iter_mut() {
            match worker.poll()? {
                WorkerState::Created | WorkerState::Running => all_exited = false,
                WorkerState::Failed(code) => {
                    return Err(RunnerError::WorkerFailed {
                        stage: stage.to_string(),
                        worker: worker.index,
                        code,
                        log: worker.log_path().to_path_buf(),
                    })
                }
                _ => (),
            }
        }
        if all_exited {
            return Ok(());
        }

        if cancel.is_cancelled() {
            spdlog::warn!("{stage}: cancelled while waiting for workers to exit");
            return Err(RunnerError::Cancelled {
                stage: stage.to_string(),
            });
        }
        let mut delay = policy.delay_for_attempt(attempt + 1);
        if let Some(deadline) = policy.deadline {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                spdlog::error!(
                    "{stage}: outputs complete but workers still running after {:.1}s",
                    elapsed.as_secs_f64()
                );
                return Err(RunnerError::Timeout {
                    stage: stage.to_string(),
                    expected: completion.total,
                    produced: completion.produced,
                    elapsed_secs: elapsed.as_secs_f64(),
                });
            }
            delay = delay.min(deadline - elapsed);
        }
        std::thread::sleep(delay);
        attempt = attempt.saturating_add(1);
    }
}

/// Wait for every worker in turn and collect their outcomes
pub fn join(workers: &mut [Worker]) -> Result<Vec<WorkerOutcome>, RunnerError> {
    let mut outcomes = Vec::with_capacity(workers.len());
    for worker in workers.iter_mut() {
        outcomes.push(worker.join()?);
    }
    Ok(outcomes)
}

/// Kill and reap every worker after a failure. Errors here are logged, not returned, so the
/// original failure is the one reported.
fn abort_workers(stage: &str, workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        if let Err(e) = worker.terminate() {
            spdlog::error!("{stage}: could not terminate worker {}: {e}", worker.index);
        }
        if let Err(e) = worker.join() {
            spdlog::error!("{stage}: could not join worker {}: {e}", worker.index);
        }
    }
}

/// Plans partitions, launches one worker per partition, supervises them and joins them
#[derive(Debug, Clone)]
pub struct FanOutRunner {
    policy: PollPolicy,
    cancel: CancelToken,
    tx: Sender<StageStatus>,
    log_dir: PathBuf,
}

impl FanOutRunner {
    pub fn new(
        policy: PollPolicy,
        cancel: CancelToken,
        tx: Sender<StageStatus>,
        log_dir: &Path,
    ) -> Self {
        Self {
            policy,
            cancel,
            tx,
            log_dir: log_dir.to_path_buf(),
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Everything between launch and join. Any error here leaves workers to be aborted.
    fn supervise(
        &self,
        name: &str,
        workers: &mut [Worker],
        total: usize,
        signal: &dyn CompletionSignal,
    ) -> Result<Completion, RunnerError> {
        let start = Instant::now();
        self.tx.send(StageStatus::new(
            name,
            StageEvent::Launched {
                workers: workers.len(),
                total,
            },
        ))?;
        let completion = await_completion(
            name,
            workers,
            total,
            signal,
            &self.policy,
            &self.cancel,
            &self.tx,
        )?;
        await_exits(name, workers, &completion, start, &self.policy, &self.cancel)?;
        Ok(completion)
    }

    /// Run a stage over `items` with at most `resource_count` workers
    pub fn run(
        &self,
        stage: &dyn FanOutStage,
        items: &[WorkItem],
        resource_count: usize,
    ) -> Result<RunResult, RunnerError> {
        let name = stage.name();
        let partitions = plan_partitions(items, resource_count)?;
        let total = stage.expected_outputs(items.len());
        let signal = stage.completion_signal();
        spdlog::info!(
            "{name}: {} items over {} {} workers, waiting on {} ({total} expected)",
            items.len(),
            partitions.len(),
            stage.resource_kind().label(),
            signal.describe()
        );

        let mut workers: Vec<Worker> = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let ctx = WorkerContext {
                index: partition.index,
                resource_id: partition.index,
                kind: stage.resource_kind(),
                partition,
            };
            let launched = stage
                .render_worker(&ctx)
                .map_err(RunnerError::from)
                .and_then(|command| {
                    let log_path = self
                        .log_dir
                        .join(format!("{name}_{}.log", ctx.worker_name()));
                    Worker::launch(&ctx, &command, stage.working_dir(), log_path)
                        .map_err(RunnerError::from)
                });
            match launched {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    abort_workers(name, &mut workers);
                    return Err(e);
                }
            }
        }
        let completion = match self.supervise(name, &mut workers, total, signal.as_ref()) {
            Ok(completion) => completion,
            Err(e) => {
                abort_workers(name, &mut workers);
                return Err(e);
            }
        };
        let outcomes = match join(&mut workers) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                abort_workers(name, &mut workers);
                return Err(e);
            }
        };
        // Exit status is authoritative even when the expected outputs showed up
        if let Some(failed) = outcomes
            .iter()
            .find(|o| !matches!(o.state, WorkerState::Succeeded))
        {
            return Err(RunnerError::WorkerFailed {
                stage: name.to_string(),
                worker: failed.index,
                code: failed.exit_code,
                log: failed.log_path.clone(),
            });
        }

        let produced = signal.observe()?.max(completion.produced);
        self.tx
            .send(StageStatus::new(name, StageEvent::Finished { produced, total }))?;
        spdlog::info!(
            "{name}: finished {produced}/{total} in {:.1}s",
            completion.elapsed.as_secs_f64()
        );
        Ok(RunResult {
            stage: name.to_string(),
            total,
            produced,
            workers: outcomes,
            elapsed: completion.elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;
    use std::cell::Cell;
    use std::sync::mpsc::channel;

    /// Replays a fixed sequence of counts, repeating the last one
    struct ScriptedSignal {
        counts: Vec<usize>,
        next: Cell<usize>,
    }

    impl ScriptedSignal {
        fn new(counts: &[usize]) -> Self {
            Self {
                counts: counts.to_vec(),
                next: Cell::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.next.get()
        }
    }

    impl CompletionSignal for ScriptedSignal {
        fn observe(&self) -> Result<usize, SignalError> {
            let idx = self.next.get();
            self.next.set(idx + 1);
            Ok(self.counts[idx.min(self.counts.len() - 1)])
        }

        fn describe(&self) -> String {
            String::from("scripted")
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            backoff_factor: 2,
            deadline: Some(Duration::from_secs(5)),
            check_exits: false,
        }
    }

    fn progress_events(rx: &std::sync::mpsc::Receiver<StageStatus>) -> Vec<usize> {
        rx.try_iter()
            .filter_map(|s| match s.event {
                StageEvent::Progress { done, .. } => Some(done),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tracker_reports_strict_increases_only() {
        let mut tracker = ProgressTracker::default();
        let events: Vec<usize> = [2, 2, 2, 5, 5, 7]
            .into_iter()
            .filter_map(|c| tracker.observe(c))
            .collect();
        assert_eq!(events, vec![5, 7]);
    }

    #[test]
    fn tracker_ignores_a_shrinking_count() {
        let mut tracker = ProgressTracker::default();
        assert_eq!(tracker.observe(4), None);
        assert_eq!(tracker.observe(3), None);
        assert_eq!(tracker.observe(4), None);
        assert_eq!(tracker.observe(5), Some(5));
    }

    #[test]
    fn scripted_counts_emit_two_progress_events() {
        let (tx, rx) = channel();
        let signal = ScriptedSignal::new(&[2, 2, 2, 5, 5, 7]);
        let completion = await_completion(
            "test",
            &mut [],
            7,
            &signal,
            &fast_policy(),
            &CancelToken::new(),
            &tx,
        )
        .unwrap();
        assert_eq!(completion.produced, 7);
        assert_eq!(signal.calls(), 6);
        assert_eq!(progress_events(&rx), vec![5, 7]);
    }

    #[test]
    fn outputs_already_present_return_immediately() {
        let (tx, rx) = channel();
        let signal = ScriptedSignal::new(&[10]);
        let completion = await_completion(
            "test",
            &mut [],
            10,
            &signal,
            &fast_policy(),
            &CancelToken::new(),
            &tx,
        )
        .unwrap();
        assert_eq!(completion.total, completion.produced);
        assert_eq!(signal.calls(), 1);
        assert!(progress_events(&rx).is_empty());
    }

    #[test]
    fn cancelled_before_completion() {
        let (tx, _rx) = channel();
        let signal = ScriptedSignal::new(&[0]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = await_completion("ctf", &mut [], 3, &signal, &fast_policy(), &cancel, &tx);
        assert!(matches!(result, Err(RunnerError::Cancelled { stage }) if stage == "ctf"));
    }

    #[test]
    fn deadline_is_enforced() {
        let (tx, _rx) = channel();
        let signal = ScriptedSignal::new(&[1]);
        let mut policy = fast_policy();
        policy.deadline = Some(Duration::from_millis(30));
        let result = await_completion("ctf", &mut [], 3, &signal, &policy, &CancelToken::new(), &tx);
        match result {
            Err(RunnerError::Timeout {
                expected, produced, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(produced, 1);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[test]
    fn no_workers_left_with_missing_output_is_incomplete() {
        let (tx, _rx) = channel();
        let signal = ScriptedSignal::new(&[1]);
        let mut policy = fast_policy();
        policy.check_exits = true;
        let result = await_completion("ctf", &mut [], 3, &signal, &policy, &CancelToken::new(), &tx);
        assert!(matches!(
            result,
            Err(RunnerError::IncompleteOutput {
                expected: 3,
                produced: 1,
                ..
            })
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = PollPolicy {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_millis(1500),
            backoff_factor: 2,
            deadline: None,
            check_exits: true,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1500));
    }

    #[test]
    fn unbounded_policy_has_no_limits() {
        let policy = PollPolicy::unbounded();
        assert!(policy.deadline.is_none());
        assert!(!policy.check_exits);
        assert!(PollPolicy::default().check_exits);
    }
}
