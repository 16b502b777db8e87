use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Instant;

use super::cancel::CancelToken;
use super::config::{Config, CtfEstimator};
use super::error::PipelineError;
use super::logs::{collect_ctf_results, compare_estimates, count_box_particles, CtfSummary};
use super::pipeline::{Pipeline, Resources, Steering};
use super::prerequisites::{find_executable, require_executables, select_ctf_estimator};
use super::resources::{detect_cpus, detect_gpus, resolve_worker_count, ResourceKind};
use super::runner::{FanOutRunner, PollPolicy};
use super::stage_status::StageStatus;
use super::stages::ctf::run_ctf;
use super::star::write_micrograph_list;
use super::summary::RunSummary;
use super::work_list::WorkList;

/// Name of the copy of the configuration kept in each run directory
const RUN_CONFIG_NAME: &str = "config.yml";

/// Everything shared by the stages of one run
struct RunContext {
    run_dir: PathBuf,
    runner: FanOutRunner,
    resources: Resources,
}

/// Validate the config, create the timestamped run directory with its `logs/` directory and
/// keep a copy of the config there
fn prepare_run(
    config: &Config,
    prefix: &str,
    tx: Sender<StageStatus>,
    cancel: CancelToken,
) -> Result<RunContext, PipelineError> {
    config.validate()?;
    let run_dir = config.create_work_directory(prefix)?;
    let log_dir = run_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    config.write_config_file(&run_dir.join(RUN_CONFIG_NAME))?;
    spdlog::info!("Working directory: {run_dir:?}");

    let resources = Resources {
        gpus: detect_gpus(),
        cpus: detect_cpus(),
    };
    spdlog::info!(
        "Detected {} GPUs and {} CPUs",
        resources.gpus,
        resources.cpus
    );
    let runner = FanOutRunner::new(PollPolicy::from(&config.poll), cancel, tx, &log_dir);
    Ok(RunContext {
        run_dir,
        runner,
        resources,
    })
}

/// Which estimator to run, given what is installed
fn choose_estimator(config: &Config) -> Result<CtfEstimator, PipelineError> {
    Ok(select_ctf_estimator(
        config.ctf_estimator,
        find_executable(&config.tools.gctf).is_some(),
        find_executable(&config.tools.ctffind).is_some(),
    )?)
}

fn estimator_workers(
    config: &Config,
    estimator: CtfEstimator,
    resources: &Resources,
    n_items: usize,
) -> Result<usize, PipelineError> {
    let count = match estimator {
        CtfEstimator::Gctf => {
            resolve_worker_count(ResourceKind::Gpu, config.n_gpus, resources.gpus, n_items)?
        }
        CtfEstimator::Ctffind => {
            resolve_worker_count(ResourceKind::Cpu, config.n_cpus, resources.cpus, n_items)?
        }
    };
    Ok(count)
}

/// Estimate the CTF of a set of micrographs and summarize the fits.
///
/// With `compare` set, both Gctf and ctffind are run (ctffind in its own `ctffind/`
/// directory) and the micrographs are split into `micrographs_ctf_matching.star` and
/// `micrographs_ctf_differ.star` by whether the two resolution estimates agree.
pub fn process_ctf(
    config: &Config,
    tx: Sender<StageStatus>,
    cancel: CancelToken,
    compare: bool,
) -> Result<RunSummary, PipelineError> {
    let start = Instant::now();
    let estimator = if compare {
        require_executables(&[config.tools.gctf.as_str(), config.tools.ctffind.as_str()])?;
        CtfEstimator::Gctf
    } else {
        choose_estimator(config)?
    };
    let micrographs = WorkList::discover(config)?;
    let ctx = prepare_run(config, "CTF", tx, cancel)?;
    let mut summary = RunSummary::new(&ctx.run_dir, &micrographs);
    summary.ctf_estimator = Some(estimator);
    let suffix = format!(".{}", config.micrograph_suffix);

    let micrographs_dir = ctx.run_dir.join("micrographs");
    let workers = estimator_workers(config, estimator, &ctx.resources, micrographs.len())?;
    let primary = run_ctf(
        &ctx.runner,
        config,
        estimator,
        &micrographs,
        &micrographs_dir,
        workers,
        &suffix,
    )?;
    summary.record_stage(&primary.result);
    summary.ctf = Some(primary.summary.clone());

    if compare {
        let workers = estimator_workers(
            config,
            CtfEstimator::Ctffind,
            &ctx.resources,
            micrographs.len(),
        )?;
        let secondary = run_ctf(
            &ctx.runner,
            config,
            CtfEstimator::Ctffind,
            &micrographs,
            &ctx.run_dir.join("ctffind"),
            workers,
            &suffix,
        )?;
        summary.record_stage(&secondary.result);

        let comparison =
            compare_estimates(&primary.records, &secondary.records, config.resolution_cut);
        let with_suffix = |names: &[String]| -> Vec<String> {
            names.iter().map(|n| format!("{n}{suffix}")).collect()
        };
        write_micrograph_list(
            &micrographs_dir.join("micrographs_ctf_matching.star"),
            &with_suffix(&comparison.matching),
        )?;
        write_micrograph_list(
            &micrographs_dir.join("micrographs_ctf_differ.star"),
            &with_suffix(&comparison.differ),
        )?;
        spdlog::info!(
            "Gctf and ctffind agree on {} micrographs and differ on {}",
            comparison.matching.len(),
            comparison.differ.len()
        );
        summary.comparison = Some(comparison);
    }

    summary.set_duration(start.elapsed());
    summary.write()?;
    Ok(summary)
}

/// Executables the full pipeline needs for this config
fn pipeline_executables(config: &Config, estimator: CtfEstimator) -> Vec<&str> {
    let mut names = Vec::new();
    if config.movies {
        names.push(config.tools.motioncor.as_str());
    }
    names.push(match estimator {
        CtfEstimator::Gctf => config.tools.gctf.as_str(),
        CtfEstimator::Ctffind => config.tools.ctffind.as_str(),
    });
    if config.template.is_none() && config.template_model.is_some() {
        names.push(config.tools.project3d.as_str());
    }
    names.push(config.tools.gautomatch.as_str());
    names.push(config.tools.mpirun.as_str());
    names.push(config.tools.relion_preprocess.as_str());
    names.push(config.tools.relion_refine.as_str());
    names
}

/// The main entry point of cryoflow.
///
/// Checks prerequisites, discovers the inputs, then drives the pipeline from preprocessing
/// through classification with `steering` making the calls between 2D rounds.
pub fn process_pipeline(
    config: &Config,
    tx: Sender<StageStatus>,
    cancel: CancelToken,
    steering: &mut dyn Steering,
) -> Result<RunSummary, PipelineError> {
    config.validate_particles()?;
    let estimator = choose_estimator(config)?;
    require_executables(&pipeline_executables(config, estimator))?;
    let inputs = WorkList::discover(config)?;
    let prefix = if config.goes_3d() {
        "QUICK3D"
    } else {
        "QUICK2D"
    };
    let ctx = prepare_run(config, prefix, tx, cancel)?;
    let mut pipeline = Pipeline::new(config, &ctx.run_dir, ctx.runner, estimator, ctx.resources);
    let summary = pipeline.run(&inputs, steering)?;
    spdlog::info!("Pipeline finished after {:?}", pipeline.history());
    Ok(summary)
}

/// Summarize results already present in `dir` without running anything: CTF fits of the
/// given estimator and picked particles
pub fn summarize_directory(dir: &Path, estimator: CtfEstimator) -> Result<RunSummary, PipelineError> {
    let records = collect_ctf_results(dir, estimator)?;
    let mut summary = RunSummary {
        run_dir: dir.to_path_buf(),
        inputs: records.len(),
        ctf_estimator: Some(estimator),
        ..Default::default()
    };
    summary.ctf = Some(CtfSummary::from_records(&records)?);
    let picked = count_box_particles(dir)?;
    if picked > 0 {
        summary.particles_picked = Some(picked);
    }
    Ok(summary)
}
