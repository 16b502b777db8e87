use std::path::{Path, PathBuf};

use crate::command::{CommandTemplate, RenderedCommand, WorkerContext};
use crate::config::Config;
use crate::error::{StageError, TemplateError};
use crate::resources::ResourceKind;
use crate::runner::{FanOutRunner, FanOutStage, RunResult};
use crate::signal::{CompletionSignal, GlobCount};
use crate::work_list::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    TwoD,
    ThreeD,
}

impl ClassKind {
    fn stage_name(&self) -> &'static str {
        match self {
            Self::TwoD => "class2d",
            Self::ThreeD => "class3d",
        }
    }
}

/// One `relion_refine_mpi` classification run. RELION writes a model STAR per iteration
/// (including iteration 0), so the run is done after `iterations + 1` of them.
#[derive(Debug, Clone)]
pub struct Classification {
    kind: ClassKind,
    dir: PathBuf,
    run: u32,
    iterations: u32,
    template: CommandTemplate,
}

impl Classification {
    fn base_command(config: &Config, particles: &Path, run: u32) -> CommandTemplate {
        CommandTemplate::new(&config.tools.mpirun)
            .flag("-np", config.mpi_processes)
            .arg(&config.tools.relion_refine)
            .flag("--o", format!("./run{run}"))
            .flag("--i", particles.display())
    }

    pub fn two_d(config: &Config, dir: &Path, run: u32, particles: &Path, classes: u32) -> Self {
        let iterations = config.iterations_2d;
        let template = Self::base_command(config, particles, run)
            .arg("--dont_combine_weights_via_disc")
            .flag("--pool", 100)
            .arg("--ctf")
            .flag("--pad", 2)
            .arg("--fast_subsets")
            .flag("--iter", iterations)
            .flag("--tau2_fudge", config.tau2_fudge)
            .flag("--K", classes)
            .flag("--particle_diameter", config.mask_diameter_or_default())
            .arg("--flatten_solvent")
            .arg("--zero_mask")
            .flag("--oversampling", 1)
            .flag("--psi_step", 10)
            .flag("--offset_range", 5)
            .flag("--offset_step", 2)
            .arg("--dont_check_norm")
            .arg("--scale")
            .flag("--j", 4)
            .arg("--gpu")
            .switch_if("--ctf_intact_first_peak", config.ignore_ctf_first_peak);
        Self {
            kind: ClassKind::TwoD,
            dir: dir.to_path_buf(),
            run,
            iterations,
            template,
        }
    }

    pub fn three_d(
        config: &Config,
        dir: &Path,
        run: u32,
        particles: &Path,
        reference: &Path,
    ) -> Self {
        let iterations = config.iterations_3d;
        let template = Self::base_command(config, particles, run)
            .flag("--ref", reference.display())
            .arg("--firstiter_cc")
            .flag("--ini_high", 40)
            .arg("--dont_combine_weights_via_disc")
            .flag("--pool", 100)
            .arg("--ctf")
            .flag("--pad", 2)
            .arg("--fast_subsets")
            .flag("--iter", iterations)
            .flag("--tau2_fudge", config.tau2_fudge)
            .flag("--K", config.classes_3d)
            .flag("--particle_diameter", config.mask_diameter_or_default())
            .arg("--flatten_solvent")
            .arg("--zero_mask")
            .flag("--oversampling", 1)
            .flag("--healpix_order", 2)
            .flag("--offset_range", 5)
            .flag("--offset_step", 2)
            .flag("--sym", "C1")
            .arg("--norm")
            .arg("--scale")
            .flag("--j", 4)
            .arg("--gpu")
            .switch_if("--ctf_intact_first_peak", config.ignore_ctf_first_peak)
            .opt_flag("--solvent_mask", config.solvent_mask.as_ref().map(|m| m.display()));
        Self {
            kind: ClassKind::ThreeD,
            dir: dir.to_path_buf(),
            run,
            iterations,
            template,
        }
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    /// Model STAR of the final iteration, e.g. `run2_it025_model.star`
    pub fn final_model_star(&self) -> PathBuf {
        self.dir
            .join(format!("run{}_it{:03}_model.star", self.run, self.iterations))
    }

    /// Particle assignments of the final iteration
    pub fn final_data_star(&self) -> PathBuf {
        self.dir
            .join(format!("run{}_it{:03}_data.star", self.run, self.iterations))
    }
}

impl FanOutStage for Classification {
    fn name(&self) -> &str {
        self.kind.stage_name()
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
        Box::new(GlobCount::new(
            &self.dir,
            &format!("run{}_it*_model.star", self.run),
        ))
    }

    fn expected_outputs(&self, _n_items: usize) -> usize {
        self.iterations as usize + 1
    }
}

/// Result files of a finished classification run
#[derive(Debug, Clone)]
pub struct ClassificationOutcome {
    pub result: RunResult,
    pub kind: ClassKind,
    pub run: u32,
    pub model_star: PathBuf,
    pub data_star: PathBuf,
}

pub fn run_classification(
    runner: &FanOutRunner,
    stage: &Classification,
    particles: &Path,
) -> Result<ClassificationOutcome, StageError> {
    std::fs::create_dir_all(&stage.dir)?;
    let items = [WorkItem::new(particles.to_path_buf())];
    let result = runner.run(stage, &items, 1)?;
    Ok(ClassificationOutcome {
        result,
        kind: stage.kind,
        run: stage.run,
        model_star: stage.final_model_star(),
        data_star: stage.final_data_star(),
    })
}
