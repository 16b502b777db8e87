use std::path::{Path, PathBuf};

use super::link_items;
use crate::command::{CommandTemplate, RenderedCommand, WorkerContext};
use crate::config::Config;
use crate::error::{StageError, TemplateError};
use crate::logs::count_box_particles;
use crate::resources::ResourceKind;
use crate::runner::{FanOutRunner, FanOutStage, RunResult};
use crate::signal::{CompletionSignal, GlobCount};
use crate::work_list::WorkList;

/// Local average thresholds Gautomatch uses to reject ice and carbon
const LAVE_MIN: f64 = -1.0;
const LAVE_MAX: f64 = 1.2;

/// Reference-free (or template based) particle picking with Gautomatch, one GPU per worker
#[derive(Debug, Clone)]
pub struct ParticlePicking {
    dir: PathBuf,
    template: CommandTemplate,
}

impl ParticlePicking {
    pub fn new(config: &Config, dir: &Path) -> Self {
        Self::with_templates(config, dir, config.template.as_deref())
    }

    /// Picking against `templates` instead of the configured template
    pub fn with_templates(config: &Config, dir: &Path, templates: Option<&Path>) -> Self {
        let pixel_size = config.effective_pixel_size();
        let mut template = CommandTemplate::new(&config.tools.gautomatch)
            .flag("--apixM", pixel_size)
            .flag("--diameter", config.particle_diameter)
            .flag("--speed", 1)
            .flag("--lsigma_cutoff", 1.2)
            .flag("--lave_min", LAVE_MIN)
            .flag("--lave_max", LAVE_MAX)
            .flag("--cc_cutoff", config.cc_cutoff)
            .members()
            .arg("--gid")
            .resource_id()
            // Negative stain particles are bright, so the templates must not be inverted
            .switch_if("--dont_invertT", config.negative_stain);
        if let Some(reference) = templates {
            template = template
                .flag("--T", reference.display())
                .flag("--apixT", config.template_pixel_size.unwrap_or(pixel_size));
        }
        Self {
            dir: dir.to_path_buf(),
            template,
        }
    }
}

impl FanOutStage for ParticlePicking {
    fn name(&self) -> &str {
        "gautomatch"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Gpu
    }

    fn working_dir(&self) -> &Path {
        &self.dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        self.template.render(ctx)
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        Box::new(GlobCount::new(&self.dir, "*_automatch.star"))
    }
}

/// Pick particles on every micrograph and return the total number picked
pub fn run_picking(
    runner: &FanOutRunner,
    config: &Config,
    micrographs: &WorkList,
    dir: &Path,
    workers: usize,
    templates: Option<&Path>,
) -> Result<(RunResult, usize), StageError> {
    let linked = link_items(micrographs.items(), dir)?;
    let stage = ParticlePicking::with_templates(config, dir, templates);
    let result = runner.run(&stage, &linked, workers)?;
    let particles = count_box_particles(dir)?;
    spdlog::info!("Total number of picked particles: {particles}");
    Ok((result, particles))
}
