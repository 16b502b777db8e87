use std::path::{Path, PathBuf};

use super::dir_arg;
use crate::command::{CommandTemplate, RenderedCommand, WorkerContext};
use crate::config::Config;
use crate::error::{StageError, TemplateError};
use crate::resources::ResourceKind;
use crate::runner::{FanOutRunner, FanOutStage, RunResult};
use crate::signal::{CompletionSignal, GlobCount, PathExists};
use crate::work_list::{WorkItem, WorkList};

pub const PARTICLES_STAR_NAME: &str = "particles.star";

/// Background circle radius in pixels for normalisation: three quarters of the final box
pub fn background_radius(box_size: u32, rescale: Option<u32>) -> u32 {
    let final_box = rescale.unwrap_or(box_size);
    (final_box as f64 * 0.75 / 2.0).round() as u32
}

fn preprocess_command(config: &Config) -> CommandTemplate {
    CommandTemplate::new(&config.tools.mpirun)
        .flag("-np", config.mpi_processes)
        .arg(&config.tools.relion_preprocess)
}

/// Particle extraction with `relion_preprocess_mpi`, using the Gautomatch coordinates next
/// to the micrographs. One MPI job; progress is the number of per-micrograph particle stars.
#[derive(Debug, Clone)]
pub struct ParticleExtraction {
    micrographs_dir: PathBuf,
    particles_dir: PathBuf,
    template: CommandTemplate,
    expected: usize,
}

impl ParticleExtraction {
    /// `expected` is the number of micrographs that have particles to extract
    pub fn new(
        config: &Config,
        ctf_star: &Path,
        micrographs_dir: &Path,
        particles_dir: &Path,
        expected: usize,
    ) -> Self {
        let box_size = config.box_size_or_default();
        let template = preprocess_command(config)
            .flag("--i", ctf_star.display())
            .flag("--coord_dir", "./")
            .flag("--coord_suffix", "_automatch.star")
            .flag("--part_star", particles_dir.join(PARTICLES_STAR_NAME).display())
            .flag("--part_dir", dir_arg(particles_dir))
            .arg("--extract")
            .flag("--extract_size", box_size)
            .arg("--norm")
            .flag("--bg_radius", background_radius(box_size, config.rescale_size))
            .flag("--white_dust", -1)
            .flag("--black_dust", -1)
            .switch_if("--invert_contrast", !config.negative_stain)
            .opt_flag("--scale", config.rescale_size);
        Self {
            micrographs_dir: micrographs_dir.to_path_buf(),
            particles_dir: particles_dir.to_path_buf(),
            template,
            expected,
        }
    }
}

impl FanOutStage for ParticleExtraction {
    fn name(&self) -> &str {
        "extract"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Single
    }

    fn working_dir(&self) -> &Path {
        &self.micrographs_dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        self.template.render(ctx)
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        Box::new(GlobCount::new(&self.particles_dir, "*_extract.star"))
    }

    fn expected_outputs(&self, _n_items: usize) -> usize {
        self.expected
    }
}

/// Re-extraction of selected 2D particles, recentred on their class offsets, at the full box.
/// Done once `particles.star` of the re-extraction exists.
#[derive(Debug, Clone)]
pub struct ParticleReextraction {
    micrographs_dir: PathBuf,
    particles_star: PathBuf,
    template: CommandTemplate,
}

impl ParticleReextraction {
    pub fn new(
        config: &Config,
        ctf_star: &Path,
        selected_particles: &Path,
        micrographs_dir: &Path,
        output_dir: &Path,
    ) -> Self {
        let box_size = config.box_size_or_default();
        let particles_star = output_dir.join(PARTICLES_STAR_NAME);
        let template = preprocess_command(config)
            .flag("--i", ctf_star.display())
            .flag("--reextract_data_star", selected_particles.display())
            .arg("--recenter")
            .flag("--part_star", particles_star.display())
            .flag("--part_dir", dir_arg(output_dir))
            .arg("--extract")
            .flag("--extract_size", box_size)
            .arg("--norm")
            .flag("--bg_radius", background_radius(box_size, None))
            .flag("--white_dust", 3)
            .flag("--black_dust", 3)
            .switch_if("--invert_contrast", !config.negative_stain);
        Self {
            micrographs_dir: micrographs_dir.to_path_buf(),
            particles_star,
            template,
        }
    }
}

impl FanOutStage for ParticleReextraction {
    fn name(&self) -> &str {
        "reextract"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Single
    }

    fn working_dir(&self) -> &Path {
        &self.micrographs_dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        self.template.render(ctx)
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        Box::new(PathExists::new(&self.particles_star))
    }

    fn expected_outputs(&self, _n_items: usize) -> usize {
        1
    }
}

/// Micrographs whose Gautomatch box file is not empty
fn micrographs_with_particles(micrographs_dir: &Path) -> Result<usize, StageError> {
    let boxes = GlobCount::new(micrographs_dir, "*_automatch.box").matches()?;
    let mut count = 0;
    for path in boxes {
        if std::fs::metadata(&path)?.len() > 0 {
            count += 1;
        }
    }
    Ok(count)
}

/// Extract the picked particles into `particles_dir` and return the particle STAR file
pub fn run_extraction(
    runner: &FanOutRunner,
    config: &Config,
    ctf_star: &Path,
    micrographs: &WorkList,
    micrographs_dir: &Path,
    particles_dir: &Path,
) -> Result<(RunResult, PathBuf), StageError> {
    let expected = micrographs_with_particles(micrographs_dir)?;
    if expected == 0 {
        return Err(StageError::NothingToExtract);
    }
    std::fs::create_dir_all(particles_dir)?;
    let stage = ParticleExtraction::new(config, ctf_star, micrographs_dir, particles_dir, expected);
    let result = runner.run(&stage, micrographs.items(), 1)?;
    Ok((result, particles_dir.join(PARTICLES_STAR_NAME)))
}

/// Re-extract `selected_particles` into `output_dir` and return the new particle STAR file
pub fn run_reextraction(
    runner: &FanOutRunner,
    config: &Config,
    ctf_star: &Path,
    selected_particles: &Path,
    micrographs_dir: &Path,
    output_dir: &Path,
) -> Result<(RunResult, PathBuf), StageError> {
    std::fs::create_dir_all(output_dir)?;
    let stage = ParticleReextraction::new(
        config,
        ctf_star,
        selected_particles,
        micrographs_dir,
        output_dir,
    );
    let items = [WorkItem::new(selected_particles.to_path_buf())];
    let result = runner.run(&stage, &items, 1)?;
    Ok((result, output_dir.join(PARTICLES_STAR_NAME)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;

    fn single_ctx(partition: &Partition) -> WorkerContext<'_> {
        WorkerContext {
            index: 0,
            resource_id: 0,
            kind: ResourceKind::Single,
            partition,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.pixel_size = 1.0;
        config.particle_diameter = 150.0;
        config.mpi_processes = 16;
        config
    }

    #[test]
    fn background_radius_uses_final_box() {
        assert_eq!(background_radius(270, None), 101);
        assert_eq!(background_radius(270, Some(96)), 36);
    }

    #[test]
    fn extraction_command() {
        let partition = Partition {
            index: 0,
            items: vec![WorkItem::new(PathBuf::from("/run/micrographs/a.mrc"))],
        };
        let stage = ParticleExtraction::new(
            &config(),
            Path::new("/run/micrographs/micrographs_ctf.star"),
            Path::new("/run/micrographs"),
            Path::new("/run/Particles"),
            1,
        );
        let command = stage.render_worker(&single_ctx(&partition)).unwrap();
        assert_eq!(command.program, "mpirun");
        assert_eq!(
            command.args.join(" "),
            "-np 16 relion_preprocess_mpi --i /run/micrographs/micrographs_ctf.star --coord_dir ./ \
             --coord_suffix _automatch.star --part_star /run/Particles/particles.star \
             --part_dir /run/Particles/ --extract --extract_size 270 --norm --bg_radius 36 \
             --white_dust -1 --black_dust -1 --invert_contrast --scale 96"
        );
        assert_eq!(stage.expected_outputs(5), 1);
    }

    #[test]
    fn reextraction_recenters_without_rescaling() {
        let partition = Partition {
            index: 0,
            items: vec![WorkItem::new(PathBuf::from("/run/Class2D/particles2.star"))],
        };
        let mut config = config();
        config.negative_stain = true;
        let stage = ParticleReextraction::new(
            &config,
            Path::new("/run/micrographs/micrographs_ctf.star"),
            Path::new("/run/Class2D/particles2.star"),
            Path::new("/run/micrographs"),
            Path::new("/run/reextract"),
        );
        let args = stage.render_worker(&single_ctx(&partition)).unwrap().args.join(" ");
        assert!(args.contains("--reextract_data_star /run/Class2D/particles2.star --recenter"));
        assert!(args.ends_with("--bg_radius 101 --white_dust 3 --black_dust 3"));
        assert_eq!(
            stage.completion_signal().describe(),
            "/run/reextract/particles.star"
        );
    }

    #[test]
    fn empty_box_files_are_not_expected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_automatch.box"), "10 10 150 150\n").unwrap();
        std::fs::write(dir.path().join("b_automatch.box"), "").unwrap();
        assert_eq!(micrographs_with_particles(dir.path()).unwrap(), 1);
    }
}
