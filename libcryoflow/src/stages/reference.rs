//! 3D references the particle stages can start from: a de novo initial model built from the
//! selected 2D particles, and picking templates projected from an existing 3D model.
use std::path::{Path, PathBuf};

use crate::command::{CommandTemplate, RenderedCommand, WorkerContext};
use crate::config::Config;
use crate::error::{StageError, TemplateError};
use crate::resources::ResourceKind;
use crate::runner::{FanOutRunner, FanOutStage, RunResult};
use crate::signal::{CompletionSignal, PathExists};
use crate::work_list::WorkItem;

/// Map written by the single SGD iteration of the initial model run
pub const INITIAL_MODEL_NAME: &str = "run1_it001_class001.mrc";

pub const PROJECTIONS_NAME: &str = "templates.mrcs";

/// De novo initial model with `relion_refine_mpi --sgd --denovo_3dref`. Done once the class
/// map of the first iteration exists.
#[derive(Debug, Clone)]
pub struct InitialModel {
    dir: PathBuf,
    template: CommandTemplate,
}

impl InitialModel {
    pub fn new(config: &Config, dir: &Path, particles: &Path) -> Self {
        let template = CommandTemplate::new(&config.tools.mpirun)
            .flag("-np", config.mpi_processes)
            .arg(&config.tools.relion_refine)
            .flag("--o", "./run1")
            .arg("--sgd")
            .flag("--subset_size", 200)
            .flag("--strict_highres_sgd", 20)
            .flag("--write_subsets", 10)
            .arg("--denovo_3dref")
            .flag("--i", particles.display())
            .arg("--ctf")
            .flag("--sym", "C1")
            .arg("--zero_mask")
            .arg("--dont_combine_weights_via_disc")
            .flag("--pool", 100)
            .flag("--iter", 1)
            .flag("--particle_diameter", config.mask_diameter_or_default())
            .flag("--oversampling", 1)
            .flag("--healpix_order", 1)
            .flag("--offset_range", 10)
            .flag("--offset_step", 4)
            .flag("--j", 2)
            .arg("--gpu");
        Self {
            dir: dir.to_path_buf(),
            template,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(INITIAL_MODEL_NAME)
    }
}

impl FanOutStage for InitialModel {
    fn name(&self) -> &str {
        "initial_model"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Single
    }

    fn working_dir(&self) -> &Path {
        &self.dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        self.template.render(ctx)
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        Box::new(PathExists::new(&self.model_path()))
    }

    fn expected_outputs(&self, _n_items: usize) -> usize {
        1
    }
}

/// Build an initial model from `particles` in `dir` and return the path of the map
pub fn run_initial_model(
    runner: &FanOutRunner,
    config: &Config,
    dir: &Path,
    particles: &Path,
) -> Result<(RunResult, PathBuf), StageError> {
    std::fs::create_dir_all(dir)?;
    let stage = InitialModel::new(config, dir, particles);
    let items = [WorkItem::new(particles.to_path_buf())];
    let result = runner.run(&stage, &items, 1)?;
    let model = stage.model_path();
    spdlog::info!("Initial model written to {model:?}");
    Ok((result, model))
}

/// Even projections of a 3D model, low pass filtered, for template based picking
#[derive(Debug, Clone)]
pub struct TemplateProjection {
    dir: PathBuf,
    output: PathBuf,
    template: CommandTemplate,
}

impl TemplateProjection {
    pub fn new(config: &Config, dir: &Path, model: &Path) -> Self {
        let output = dir.join(PROJECTIONS_NAME);
        let template = CommandTemplate::new(&config.tools.project3d)
            .flag("--outfile", output.display())
            .arg(model.display().to_string())
            .arg("--orientgen=eman:delta=45")
            .arg("--sym=c1")
            .arg("--postprocess=filter.lowpass.gauss:cutoff_freq=0.025");
        Self {
            dir: dir.to_path_buf(),
            output,
            template,
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl FanOutStage for TemplateProjection {
    fn name(&self) -> &str {
        "project3d"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Single
    }

    fn working_dir(&self) -> &Path {
        &self.dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        self.template.render(ctx)
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        Box::new(PathExists::new(&self.output))
    }

    fn expected_outputs(&self, _n_items: usize) -> usize {
        1
    }
}

/// Project `model` into picking templates in `dir` and return the template stack
pub fn run_template_projection(
    runner: &FanOutRunner,
    config: &Config,
    dir: &Path,
    model: &Path,
) -> Result<(RunResult, PathBuf), StageError> {
    std::fs::create_dir_all(dir)?;
    let stage = TemplateProjection::new(config, dir, model);
    let items = [WorkItem::new(model.to_path_buf())];
    let result = runner.run(&stage, &items, 1)?;
    Ok((result, stage.output.clone()))
}
