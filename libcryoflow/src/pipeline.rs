//! Steering of a full run: preprocessing, rounds of 2D classification with automatic class
//! selection, optional re-extraction, an initial model when no reference was given, and 3D
//! classification.
//!
//! Where to go after each 2D round is decided by a [`Steering`] implementation. The
//! transitions themselves are a pure function ([`next_state`]) so they can be tested without
//! running anything.
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::config::{Config, CtfEstimator};
use super::error::PipelineError;
use super::resources::{resolve_worker_count, ResourceKind};
use super::runner::FanOutRunner;
use super::stages::classify::{run_classification, Classification};
use super::stages::ctf::run_ctf;
use super::stages::extract::{run_extraction, run_reextraction};
use super::stages::motion::{dose_weighted_micrographs, run_motion_correction};
use super::stages::picking::run_picking;
use super::stages::reference::{run_initial_model, run_template_projection};
use super::star::{filter_particles, select_classes, ClassCriteria};
use super::summary::{ClassRound, RunSummary};
use super::work_list::WorkList;

/// Classes added to each automatic 2D round
pub const AUTO_CLASS_STEP: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Motion correction (movies only), CTF, picking and extraction
    Preprocess,
    Classify2d { run: u32 },
    /// Waiting on the steering decision after a 2D round
    Decide { run: u32 },
    Reextract { run: u32 },
    /// De novo 3D model from the selected particles
    InitialModel,
    Classify3d,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preprocess => write!(f, "PREPROCESS"),
            Self::Classify2d { run } => write!(f, "CLASSIFY_2D({run})"),
            Self::Decide { run } => write!(f, "DECIDE({run})"),
            Self::Reextract { run } => write!(f, "REEXTRACT({run})"),
            Self::InitialModel => write!(f, "INITIAL_MODEL"),
            Self::Classify3d => write!(f, "CLASSIFY_3D"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// What to do after a 2D round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Another 2D round on the selected particles, optionally with a new class count
    Classify2dAgain { classes: Option<u32> },
    /// Re-extract the selected particles at full size, then classify in 3D
    Reextract,
    /// Classify the selected particles in 3D as they are
    Classify3d,
    Stop,
}

/// Compute the state after `state`. `decision` only matters in [`PipelineState::Decide`],
/// where a missing decision means stop. Without a reference model 3D classification is
/// preceded by [`PipelineState::InitialModel`].
pub fn next_state(
    state: PipelineState,
    decision: Option<&Decision>,
    has_reference: bool,
) -> PipelineState {
    let to_3d = if has_reference {
        PipelineState::Classify3d
    } else {
        PipelineState::InitialModel
    };
    match state {
        PipelineState::Preprocess => PipelineState::Classify2d { run: 1 },
        PipelineState::Classify2d { run } => PipelineState::Decide { run },
        PipelineState::Decide { run } => match decision {
            Some(Decision::Classify2dAgain { .. }) => PipelineState::Classify2d { run: run + 1 },
            Some(Decision::Reextract) => PipelineState::Reextract { run },
            Some(Decision::Classify3d) => to_3d,
            Some(Decision::Stop) | None => PipelineState::Done,
        },
        PipelineState::Reextract { .. } => to_3d,
        PipelineState::InitialModel => PipelineState::Classify3d,
        PipelineState::Classify3d | PipelineState::Done => PipelineState::Done,
    }
}

/// What the steering sees after a 2D round
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub run: u32,
    pub classes: u32,
    pub model_star: PathBuf,
    pub data_star: PathBuf,
    pub selected_classes: BTreeSet<u32>,
    pub selected_particles: usize,
    /// Particles of the selected classes, input of whatever comes next
    pub selected_star: PathBuf,
}

/// Decides where the pipeline goes after each 2D round
pub trait Steering {
    fn decide(&mut self, checkpoint: &Checkpoint) -> Decision;
}

/// Runs a fixed number of 2D rounds, growing the class count each time, then re-extracts
/// and classifies in 3D when the config asks for 3D
#[derive(Debug, Clone, PartialEq)]
pub struct AutoSteering {
    rounds: u32,
    to_3d: bool,
}

impl AutoSteering {
    pub fn new(rounds: u32, to_3d: bool) -> Self {
        Self {
            rounds: rounds.max(1),
            to_3d,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.auto_2d_rounds, config.goes_3d())
    }
}

impl Steering for AutoSteering {
    fn decide(&mut self, checkpoint: &Checkpoint) -> Decision {
        if checkpoint.selected_particles == 0 {
            spdlog::warn!(
                "No particles passed class selection after 2D run {}, stopping",
                checkpoint.run
            );
            Decision::Stop
        } else if checkpoint.run < self.rounds {
            Decision::Classify2dAgain {
                classes: Some(checkpoint.classes + AUTO_CLASS_STEP),
            }
        } else if self.to_3d {
            Decision::Reextract
        } else {
            Decision::Stop
        }
    }
}

/// Replays a fixed list of decisions, then stops. Keeps every checkpoint it was shown.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSteering {
    decisions: VecDeque<Decision>,
    seen: Vec<Checkpoint>,
}

impl ScriptedSteering {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: decisions.into(),
            seen: Vec::new(),
        }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.seen
    }
}

impl Steering for ScriptedSteering {
    fn decide(&mut self, checkpoint: &Checkpoint) -> Decision {
        self.seen.push(checkpoint.clone());
        self.decisions.pop_front().unwrap_or(Decision::Stop)
    }
}

/// Resources the pipeline may hand to its stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub gpus: usize,
    pub cpus: usize,
}

/// Drives one run directory through the states, invoking the stages
pub struct Pipeline<'a> {
    config: &'a Config,
    run_dir: PathBuf,
    runner: FanOutRunner,
    estimator: CtfEstimator,
    resources: Resources,
    state: PipelineState,
    history: Vec<PipelineState>,
    summary: RunSummary,
    classes: u32,
    ctf_star: PathBuf,
    particles: PathBuf,
    /// Reference for 3D classification, from the config or built by the initial model
    reference: Option<PathBuf>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        run_dir: &Path,
        runner: FanOutRunner,
        estimator: CtfEstimator,
        resources: Resources,
    ) -> Self {
        Self {
            config,
            run_dir: run_dir.to_path_buf(),
            runner,
            estimator,
            resources,
            state: PipelineState::Preprocess,
            history: Vec::new(),
            summary: RunSummary::default(),
            classes: config.classes_2d,
            ctf_star: PathBuf::new(),
            particles: PathBuf::new(),
            reference: config.reference_model.clone(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// States already left, in order
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn micrographs_dir(&self) -> PathBuf {
        self.run_dir.join("micrographs")
    }

    fn class2d_dir(&self) -> PathBuf {
        self.run_dir.join("Class2D")
    }

    /// Run from preprocessing until the steering stops or 3D classification finishes.
    /// The summary is written to the run directory either way it ends successfully.
    pub fn run(
        &mut self,
        inputs: &WorkList,
        steering: &mut dyn Steering,
    ) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        self.summary = RunSummary::new(&self.run_dir, inputs);
        self.summary.ctf_estimator = Some(self.estimator);

        while self.state != PipelineState::Done {
            let decision = match self.state {
                PipelineState::Preprocess => {
                    self.preprocess(inputs)?;
                    None
                }
                PipelineState::Classify2d { run } => {
                    self.classify_2d(run)?;
                    None
                }
                PipelineState::Decide { run } => {
                    let checkpoint = self.checkpoint(run)?;
                    let decision = steering.decide(&checkpoint);
                    self.apply(&decision, &checkpoint);
                    Some(decision)
                }
                PipelineState::Reextract { .. } => {
                    self.reextract()?;
                    None
                }
                PipelineState::InitialModel => {
                    self.initial_model()?;
                    None
                }
                PipelineState::Classify3d => {
                    self.classify_3d()?;
                    None
                }
                PipelineState::Done => None,
            };
            let next = next_state(self.state, decision.as_ref(), self.reference.is_some());
            spdlog::info!("Pipeline: {} -> {next}", self.state);
            self.history.push(self.state);
            self.state = next;
        }

        self.summary.set_duration(start.elapsed());
        let path = self.summary.write()?;
        spdlog::info!("Run summary written to {path:?}");
        Ok(self.summary.clone())
    }

    fn workers(&self, kind: ResourceKind, n_items: usize) -> Result<usize, PipelineError> {
        let (requested, available) = match kind {
            ResourceKind::Gpu => (self.config.n_gpus, self.resources.gpus),
            ResourceKind::Cpu => (self.config.n_cpus, self.resources.cpus),
            ResourceKind::Single => (1, 1),
        };
        Ok(resolve_worker_count(kind, requested, available, n_items)?)
    }

    fn preprocess(&mut self, inputs: &WorkList) -> Result<(), PipelineError> {
        let config = self.config;
        let micrographs_dir = self.micrographs_dir();

        // Micrographs for CTF, micrographs for picking, and the suffix extraction reads
        let (ctf_inputs, pick_inputs, suffix) = if config.movies {
            let workers = self.workers(ResourceKind::Gpu, inputs.len())?;
            let (result, aligned) =
                run_motion_correction(&self.runner, config, inputs, &self.run_dir, workers)?;
            self.summary.record_stage(&result);
            if config.is_dose_weighted() {
                let weighted = dose_weighted_micrographs(config, &self.run_dir.join("aligned"))?;
                (aligned, weighted, String::from("_DW.mrc"))
            } else {
                (aligned.clone(), aligned, String::from(".mrc"))
            }
        } else {
            (
                inputs.clone(),
                inputs.clone(),
                format!(".{}", config.micrograph_suffix),
            )
        };

        let kind = match self.estimator {
            CtfEstimator::Gctf => ResourceKind::Gpu,
            CtfEstimator::Ctffind => ResourceKind::Cpu,
        };
        let workers = self.workers(kind, ctf_inputs.len())?;
        let ctf = run_ctf(
            &self.runner,
            config,
            self.estimator,
            &ctf_inputs,
            &micrographs_dir,
            workers,
            &suffix,
        )?;
        self.summary.record_stage(&ctf.result);
        self.summary.ctf = Some(ctf.summary);
        self.ctf_star = ctf.ctf_star;

        let templates = match (&config.template, &config.template_model) {
            (None, Some(model)) => {
                let (result, projections) = run_template_projection(
                    &self.runner,
                    config,
                    &self.run_dir.join("templates"),
                    model,
                )?;
                self.summary.record_stage(&result);
                Some(projections)
            }
            (template, _) => template.clone(),
        };

        let workers = self.workers(ResourceKind::Gpu, pick_inputs.len())?;
        let (result, picked) = run_picking(
            &self.runner,
            config,
            &pick_inputs,
            &micrographs_dir,
            workers,
            templates.as_deref(),
        )?;
        self.summary.record_stage(&result);
        self.summary.particles_picked = Some(picked);

        let (result, particles) = run_extraction(
            &self.runner,
            config,
            &self.ctf_star,
            &pick_inputs,
            &micrographs_dir,
            &self.run_dir.join("Particles"),
        )?;
        self.summary.record_stage(&result);
        self.particles = particles;
        Ok(())
    }

    fn classify_2d(&mut self, run: u32) -> Result<(), PipelineError> {
        let stage = Classification::two_d(
            self.config,
            &self.class2d_dir(),
            run,
            &self.particles,
            self.classes,
        );
        let outcome = run_classification(&self.runner, &stage, &self.particles)?;
        self.summary.record_stage(&outcome.result);
        Ok(())
    }

    /// Select the good classes of the finished round and write their particles
    fn checkpoint(&mut self, run: u32) -> Result<Checkpoint, PipelineError> {
        let stage = Classification::two_d(
            self.config,
            &self.class2d_dir(),
            run,
            &self.particles,
            self.classes,
        );
        let model_star = stage.final_model_star();
        let data_star = stage.final_data_star();
        let selected_classes = select_classes(&model_star, &ClassCriteria::default())?;
        let selected_star = self.class2d_dir().join(format!("particles{run}.star"));
        let selected_particles = filter_particles(&data_star, &selected_classes, &selected_star)?;
        spdlog::info!(
            "2D run {run}: kept classes {selected_classes:?} with {selected_particles} particles"
        );
        self.summary.class_rounds.push(ClassRound {
            run,
            classes: self.classes,
            selected_classes: selected_classes.iter().copied().collect(),
            selected_particles,
        });
        Ok(Checkpoint {
            run,
            classes: self.classes,
            model_star,
            data_star,
            selected_classes,
            selected_particles,
            selected_star,
        })
    }

    fn apply(&mut self, decision: &Decision, checkpoint: &Checkpoint) {
        if let Decision::Classify2dAgain {
            classes: Some(classes),
        } = decision
        {
            self.classes = *classes;
        }
        if !matches!(decision, Decision::Stop) {
            self.particles = checkpoint.selected_star.clone();
        }
    }

    fn reextract(&mut self) -> Result<(), PipelineError> {
        let (result, particles) = run_reextraction(
            &self.runner,
            self.config,
            &self.ctf_star,
            &self.particles,
            &self.micrographs_dir(),
            &self.run_dir.join("reextract"),
        )?;
        self.summary.record_stage(&result);
        self.particles = particles;
        Ok(())
    }

    fn initial_model(&mut self) -> Result<(), PipelineError> {
        let (result, model) = run_initial_model(
            &self.runner,
            self.config,
            &self.run_dir.join("InitialModel"),
            &self.particles,
        )?;
        self.summary.record_stage(&result);
        self.summary.initial_model = Some(model.clone());
        self.reference = Some(model);
        Ok(())
    }

    fn classify_3d(&mut self) -> Result<(), PipelineError> {
        let reference = self
            .reference
            .as_ref()
            .ok_or(PipelineError::MissingReference)?;
        let stage = Classification::three_d(
            self.config,
            &self.run_dir.join("Class3D"),
            1,
            &self.particles,
            reference,
        );
        let outcome = run_classification(&self.runner, &stage, &self.particles)?;
        self.summary.record_stage(&outcome.result);
        self.summary.final_model = Some(outcome.model_star);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(run: u32, classes: u32, selected_particles: usize) -> Checkpoint {
        Checkpoint {
            run,
            classes,
            model_star: PathBuf::from(format!("run{run}_it025_model.star")),
            data_star: PathBuf::from(format!("run{run}_it025_data.star")),
            selected_classes: BTreeSet::from([1, 4]),
            selected_particles,
            selected_star: PathBuf::from(format!("particles{run}.star")),
        }
    }

    /// Walk the transitions the way the driver does, feeding decisions at Decide
    fn walk(steering: &mut dyn Steering) -> Vec<PipelineState> {
        let mut state = PipelineState::Preprocess;
        let mut classes = 15;
        let mut visited = vec![state];
        while state != PipelineState::Done {
            let decision = match state {
                PipelineState::Decide { run } => {
                    let d = steering.decide(&checkpoint(run, classes, 100));
                    if let Decision::Classify2dAgain { classes: Some(k) } = d {
                        classes = k;
                    }
                    Some(d)
                }
                _ => None,
            };
            state = next_state(state, decision.as_ref(), true);
            visited.push(state);
        }
        visited
    }

    #[test]
    fn single_round_then_stop() {
        let mut steering = ScriptedSteering::new(vec![Decision::Stop]);
        assert_eq!(
            walk(&mut steering),
            vec![
                PipelineState::Preprocess,
                PipelineState::Classify2d { run: 1 },
                PipelineState::Decide { run: 1 },
                PipelineState::Done,
            ]
        );
        assert_eq!(steering.checkpoints().len(), 1);
    }

    #[test]
    fn scripted_path_through_reextraction() {
        let mut steering = ScriptedSteering::new(vec![
            Decision::Classify2dAgain { classes: Some(40) },
            Decision::Reextract,
        ]);
        assert_eq!(
            walk(&mut steering),
            vec![
                PipelineState::Preprocess,
                PipelineState::Classify2d { run: 1 },
                PipelineState::Decide { run: 1 },
                PipelineState::Classify2d { run: 2 },
                PipelineState::Decide { run: 2 },
                PipelineState::Reextract { run: 2 },
                PipelineState::Classify3d,
                PipelineState::Done,
            ]
        );
        assert_eq!(steering.checkpoints()[1].classes, 40);
    }

    #[test]
    fn scripted_steering_stops_when_exhausted() {
        let mut steering = ScriptedSteering::new(vec![Decision::Classify2dAgain { classes: None }]);
        let visited = walk(&mut steering);
        assert_eq!(visited[visited.len() - 2], PipelineState::Decide { run: 2 });
        assert_eq!(steering.checkpoints()[1].classes, 15);
    }

    #[test]
    fn auto_steering_grows_classes_then_goes_3d() {
        let mut steering = AutoSteering::new(3, true);
        assert_eq!(
            steering.decide(&checkpoint(1, 15, 500)),
            Decision::Classify2dAgain { classes: Some(30) }
        );
        assert_eq!(
            steering.decide(&checkpoint(2, 30, 400)),
            Decision::Classify2dAgain { classes: Some(45) }
        );
        assert_eq!(steering.decide(&checkpoint(3, 45, 300)), Decision::Reextract);

        let visited = walk(&mut AutoSteering::new(3, true));
        assert!(visited.contains(&PipelineState::Classify2d { run: 3 }));
        assert!(!visited.contains(&PipelineState::Classify2d { run: 4 }));
        assert!(visited.contains(&PipelineState::Reextract { run: 3 }));
    }

    #[test]
    fn auto_steering_without_3d_stops() {
        let mut steering = AutoSteering::new(0, false);
        assert_eq!(steering.decide(&checkpoint(1, 15, 500)), Decision::Stop);
    }

    #[test]
    fn auto_steering_goes_3d_without_reference_when_asked() {
        let mut config = Config::default();
        config.classify_3d = true;
        let mut steering = AutoSteering::from_config(&config);
        assert_eq!(steering.decide(&checkpoint(1, 15, 500)), Decision::Reextract);
    }

    #[test]
    fn missing_reference_builds_an_initial_model() {
        let reextract = PipelineState::Reextract { run: 2 };
        assert_eq!(next_state(reextract, None, false), PipelineState::InitialModel);
        assert_eq!(next_state(reextract, None, true), PipelineState::Classify3d);
        assert_eq!(
            next_state(PipelineState::Decide { run: 1 }, Some(&Decision::Classify3d), false),
            PipelineState::InitialModel
        );
        assert_eq!(
            next_state(PipelineState::InitialModel, None, false),
            PipelineState::Classify3d
        );
    }

    #[test]
    fn empty_selection_stops() {
        let mut steering = AutoSteering::new(5, true);
        assert_eq!(steering.decide(&checkpoint(1, 15, 0)), Decision::Stop);
    }

    #[test]
    fn missing_decision_and_done_are_terminal() {
        assert_eq!(
            next_state(PipelineState::Decide { run: 4 }, None, true),
            PipelineState::Done
        );
        assert_eq!(next_state(PipelineState::Done, None, false), PipelineState::Done);
        assert_eq!(
            next_state(PipelineState::Decide { run: 2 }, Some(&Decision::Classify3d), true),
            PipelineState::Classify3d
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(PipelineState::Classify2d { run: 2 }.to_string(), "CLASSIFY_2D(2)");
        assert_eq!(PipelineState::Reextract { run: 1 }.to_string(), "REEXTRACT(1)");
        assert_eq!(PipelineState::InitialModel.to_string(), "INITIAL_MODEL");
    }
}
