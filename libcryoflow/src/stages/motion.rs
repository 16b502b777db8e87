use std::path::{Path, PathBuf};

use super::{dir_arg, link_items};
use crate::command::{CommandTemplate, RenderedCommand, WorkerContext};
use crate::config::Config;
use crate::error::{StageError, TemplateError};
use crate::resources::ResourceKind;
use crate::runner::{FanOutRunner, FanOutStage, RunResult};
use crate::signal::{CompletionSignal, GlobCount};
use crate::work_list::{WorkItem, WorkList};

/// Frame alignment of movies with MotionCor2, one GPU per worker.
/// Each worker reads a directory holding links to the movies of its partition.
#[derive(Debug, Clone)]
pub struct MotionCorrection {
    movies_dir: PathBuf,
    output_dir: PathBuf,
    template: CommandTemplate,
    dose_weighted: bool,
}

impl MotionCorrection {
    pub fn new(config: &Config, movies_dir: &Path, output_dir: &Path) -> Self {
        let input_flag = if config.micrograph_suffix == "tif" || config.micrograph_suffix == "tiff" {
            "-InTiff"
        } else {
            "-InMrc"
        };
        let template = CommandTemplate::new(&config.tools.motioncor)
            .arg(input_flag)
            .worker_file(movies_dir, "/")
            .flag("-OutMrc", dir_arg(output_dir))
            .arg("-Patch")
            .arg("5")
            .arg("5")
            .flag("-Tol", 0.5)
            .flag("-Serial", 1)
            .arg("-Gpu")
            .resource_id()
            .flag("-FtBin", config.binning)
            .opt_flag("-Gain", config.gain_reference.as_ref().map(|g| g.display()))
            .flag("-InitDose", config.pre_exposure)
            .flag("-FmDose", config.dose_per_frame)
            .flag("-PixSize", config.pixel_size)
            .flag("-kV", config.voltage_kv)
            .flag("-Throw", 1);
        Self {
            movies_dir: movies_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            template,
            dose_weighted: config.is_dose_weighted(),
        }
    }
}

impl FanOutStage for MotionCorrection {
    fn name(&self) -> &str {
        "motioncor"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Gpu
    }

    fn working_dir(&self) -> &Path {
        &self.output_dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        let worker_dir = self.movies_dir.join(ctx.worker_name());
        link_items(&ctx.partition.items, &worker_dir)?;
        self.template.render(ctx)
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        let pattern = if self.dose_weighted { "*_DW.mrc" } else { "*.mrc" };
        Box::new(GlobCount::new(&self.output_dir, pattern))
    }
}

/// Align all movies and return the aligned (non dose weighted) micrographs
pub fn run_motion_correction(
    runner: &FanOutRunner,
    config: &Config,
    movies: &WorkList,
    run_dir: &Path,
    workers: usize,
) -> Result<(RunResult, WorkList), StageError> {
    let movies_dir = run_dir.join("movies");
    let output_dir = run_dir.join("aligned");
    std::fs::create_dir_all(&movies_dir)?;
    std::fs::create_dir_all(&output_dir)?;

    let stage = MotionCorrection::new(config, &movies_dir, &output_dir);
    let result = runner.run(&stage, movies.items(), workers)?;

    if config.micrograph_suffix == "mrcs" {
        rename_mrcs_outputs(&output_dir)?;
    }
    let aligned = WorkList::scan(
        &output_dir,
        &format!("*{}*mrc", config.micrograph_pattern),
        "DW",
    )?;
    spdlog::info!("Movie alignment done, {} aligned micrographs", aligned.len());
    Ok((result, aligned))
}

/// Dose weighted companions of the aligned micrographs
pub fn dose_weighted_micrographs(config: &Config, aligned_dir: &Path) -> Result<WorkList, StageError> {
    Ok(WorkList::scan(
        aligned_dir,
        &format!("*{}*_DW.mrc", config.micrograph_pattern),
        &config.exclude_pattern,
    )?)
}

/// MotionCor2 keeps the `.mrcs` extension of stack inputs; downstream tools want `.mrc`
fn rename_mrcs_outputs(dir: &Path) -> Result<(), std::io::Error> {
    for entry in dir.read_dir()? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "mrcs") {
            let renamed = path.with_extension("mrc");
            std::fs::rename(&path, &renamed)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;

    #[test]
    fn worker_command_and_links() {
        let run = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let movie = data.path().join("m1.tif");
        std::fs::write(&movie, "").unwrap();

        let mut config = Config::default();
        config.micrograph_suffix = String::from("tif");
        config.pixel_size = 0.53;
        config.binning = 2;
        config.dose_per_frame = 1.2;
        let stage = MotionCorrection::new(&config, &run.path().join("movies"), &run.path().join("aligned"));
        let partition = Partition {
            index: 1,
            items: vec![WorkItem::new(movie)],
        };
        let ctx = WorkerContext {
            index: 1,
            resource_id: 1,
            kind: ResourceKind::Gpu,
            partition: &partition,
        };
        let command = stage.render_worker(&ctx).unwrap();
        assert_eq!(command.program, "MotionCor2");
        assert_eq!(command.args[0], "-InTiff");
        assert_eq!(command.args[1], format!("{}/gpu1/", run.path().join("movies").display()));
        let gpu = command.args.iter().position(|a| a == "-Gpu").unwrap();
        assert_eq!(command.args[gpu + 1], "1");
        assert!(!command.args.contains(&String::from("-Gain")));
        assert!(run.path().join("movies/gpu1/m1.tif").exists());
        assert_eq!(stage.completion_signal().describe(), format!("{}/*_DW.mrc", run.path().join("aligned").display()));
    }

    #[test]
    fn mrcs_outputs_are_renamed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mrcs"), "").unwrap();
        std::fs::write(dir.path().join("b.mrc"), "").unwrap();
        rename_mrcs_outputs(dir.path()).unwrap();
        assert!(dir.path().join("a.mrc").exists());
        assert!(!dir.path().join("a.mrcs").exists());
        assert!(dir.path().join("b.mrc").exists());
    }
}
