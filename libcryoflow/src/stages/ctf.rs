use std::path::{Path, PathBuf};

use super::link_items;
use crate::command::{CommandTemplate, RenderedCommand, ScriptTemplate, WorkerContext};
use crate::config::{Config, CtfEstimator};
use crate::constants::MICROGRAPHS_STAR_NAME;
use crate::error::{StageError, TemplateError};
use crate::logs::{collect_ctf_results, CtfRecord, CtfSummary};
use crate::resources::ResourceKind;
use crate::runner::{FanOutRunner, FanOutStage, RunResult};
use crate::signal::{CompletionSignal, GlobCount};
use crate::star::{write_ctf_star, write_micrograph_list};
use crate::work_list::WorkList;

pub const CTF_STAR_NAME: &str = "micrographs_ctf.star";

/// High resolution limit and B-factor limit handed to Gctf, both in Angstrom.
/// Coarse pixels cannot resolve 4 A so the limit follows the Nyquist frequency.
pub fn gctf_resolution_limits(pixel_size: f64) -> (f64, f64) {
    if pixel_size > 3.0 {
        (2.0 * pixel_size, 9.0)
    } else {
        (4.0, 7.0)
    }
}

/// CTF estimation with Gctf, one GPU per worker
#[derive(Debug, Clone)]
pub struct GctfStage {
    dir: PathBuf,
    template: CommandTemplate,
}

impl GctfStage {
    pub fn new(config: &Config, dir: &Path) -> Self {
        let pixel_size = config.effective_pixel_size();
        let (res_high, b_res_high) = gctf_resolution_limits(pixel_size);
        let mut template = CommandTemplate::new(&config.tools.gctf)
            .flag("--apix", pixel_size)
            .flag("--kV", config.voltage_kv)
            .flag("--cs", config.spherical_aberration)
            .members()
            .arg("--gid")
            .resource_id()
            .arg("--do_validation")
            .flag("--resH", res_high)
            .flag("--B_resH", b_res_high);
        template = if config.negative_stain {
            template.flag("--ac", 0.35)
        } else {
            template.flag("--boxsize", 512).flag("--ac", 0.07)
        };
        template = template.arg("--ctfstar").worker_file(dir, ".star");
        Self {
            dir: dir.to_path_buf(),
            template,
        }
    }
}

impl FanOutStage for GctfStage {
    fn name(&self) -> &str {
        "gctf"
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
        Box::new(GlobCount::new(&self.dir, "*_gctf.log"))
    }
}

/// CTF estimation with ctffind on CPUs. ctffind reads its parameters from stdin, so each
/// worker runs a script that invokes it once per micrograph.
#[derive(Debug, Clone)]
pub struct CtffindStage {
    dir: PathBuf,
    script: ScriptTemplate,
}

impl CtffindStage {
    pub fn new(config: &Config, dir: &Path) -> Self {
        let script = ScriptTemplate::new(&config.tools.ctffind, "_ctffind.log")
            .item_path()
            .item_stem(".ctf")
            .line(config.effective_pixel_size())
            .line(config.voltage_kv)
            .line(config.spherical_aberration)
            .line(if config.negative_stain { "0.35" } else { "0.07" })
            // spectrum size, min/max resolution, min/max defocus, defocus step
            .line(512)
            .line(20)
            .line(5)
            .line(5000)
            .line(50000)
            .line(500)
            // astigmatism known, slower exhaustive search, restrain astigmatism
            .line("no")
            .line("no")
            .line("yes")
            .line(100)
            // additional phase shift, expert options
            .line("no")
            .line("no");
        Self {
            dir: dir.to_path_buf(),
            script,
        }
    }
}

impl FanOutStage for CtffindStage {
    fn name(&self) -> &str {
        "ctffind"
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn working_dir(&self) -> &Path {
        &self.dir
    }

    fn render_worker(&self, ctx: &WorkerContext) -> Result<RenderedCommand, TemplateError> {
        self.script.write_script(ctx, &self.dir, self.name())
    }

    fn completion_signal(&self) -> Box<dyn CompletionSignal> {
        Box::new(GlobCount::new(&self.dir, "*.ctf"))
    }
}

/// Everything the CTF step leaves behind for the later steps
#[derive(Debug, Clone)]
pub struct CtfOutcome {
    pub result: RunResult,
    pub estimator: CtfEstimator,
    pub records: Vec<CtfRecord>,
    pub summary: CtfSummary,
    /// Micrograph table with CTF parameters, input of particle extraction
    pub ctf_star: PathBuf,
}

/// Estimate the CTF of every micrograph in `dir`.
///
/// The micrographs are linked into `dir` and the estimator runs there. `file_suffix` is the
/// suffix extraction should read for each micrograph (for example `.mrc`, or `_DW.mrc` after
/// dose weighting).
pub fn run_ctf(
    runner: &FanOutRunner,
    config: &Config,
    estimator: CtfEstimator,
    micrographs: &WorkList,
    dir: &Path,
    workers: usize,
    file_suffix: &str,
) -> Result<CtfOutcome, StageError> {
    let linked = link_items(micrographs.items(), dir)?;
    let names: Vec<String> = linked.iter().map(|item| item.file_name()).collect();
    write_micrograph_list(&dir.join(MICROGRAPHS_STAR_NAME), &names)?;

    let result = match estimator {
        CtfEstimator::Gctf => runner.run(&GctfStage::new(config, dir), &linked, workers)?,
        CtfEstimator::Ctffind => runner.run(&CtffindStage::new(config, dir), &linked, workers)?,
    };

    let records = collect_ctf_results(dir, estimator)?;
    let summary = CtfSummary::from_records(&records)?;
    let ctf_star = dir.join(CTF_STAR_NAME);
    write_ctf_star(&ctf_star, &records, config, file_suffix)?;
    spdlog::info!(
        "CTF estimated for {} micrographs, mean resolution {} A, mean defocus {} A",
        summary.count,
        summary.mean_resolution,
        summary.mean_defocus_u
    );

    Ok(CtfOutcome {
        result,
        estimator,
        records,
        summary,
        ctf_star,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use crate::work_list::WorkItem;

    fn config(pixel_size: f64) -> Config {
        let mut config = Config::default();
        config.pixel_size = pixel_size;
        config
    }

    #[test]
    fn resolution_limits_follow_pixel_size() {
        assert_eq!(gctf_resolution_limits(1.06), (4.0, 7.0));
        assert_eq!(gctf_resolution_limits(3.0), (4.0, 7.0));
        assert_eq!(gctf_resolution_limits(3.5), (7.0, 9.0));
    }

    #[test]
    fn gctf_worker_command() {
        let dir = tempfile::tempdir().unwrap();
        let stage = GctfStage::new(&config(1.5), dir.path());
        let partition = Partition {
            index: 1,
            items: vec![
                WorkItem::new(dir.path().join("a.mrc")),
                WorkItem::new(dir.path().join("b.mrc")),
            ],
        };
        let ctx = WorkerContext {
            index: 1,
            resource_id: 1,
            kind: ResourceKind::Gpu,
            partition: &partition,
        };
        let command = stage.render_worker(&ctx).unwrap();
        let args = command.args.join(" ");
        assert_eq!(command.program, "Gctf");
        assert!(args.starts_with("--apix 1.5 --kV 300 --cs 2.7 "));
        assert!(args.contains("a.mrc"));
        assert!(args.contains("--gid 1 --do_validation --resH 4 --B_resH 7 --boxsize 512 --ac 0.07"));
        assert!(args.ends_with(&format!("--ctfstar {}", dir.path().join("gpu1.star").display())));
    }

    #[test]
    fn negative_stain_drops_box_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(4.0);
        config.negative_stain = true;
        let stage = GctfStage::new(&config, dir.path());
        let partition = Partition {
            index: 0,
            items: vec![WorkItem::new(dir.path().join("a.mrc"))],
        };
        let ctx = WorkerContext {
            index: 0,
            resource_id: 0,
            kind: ResourceKind::Gpu,
            partition: &partition,
        };
        let args = stage.render_worker(&ctx).unwrap().args.join(" ");
        assert!(args.contains("--resH 8 --B_resH 9 --ac 0.35"));
        assert!(!args.contains("--boxsize"));
    }

    #[test]
    fn ctffind_script_feeds_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let stage = CtffindStage::new(&config(1.06), dir.path());
        let partition = Partition {
            index: 2,
            items: vec![WorkItem::new(dir.path().join("mic_7.mrc"))],
        };
        let ctx = WorkerContext {
            index: 2,
            resource_id: 2,
            kind: ResourceKind::Cpu,
            partition: &partition,
        };
        let command = stage.render_worker(&ctx).unwrap();
        let script_path = dir.path().join("ctffind_cpu2.sh");
        assert_eq!(command.program, "sh");
        assert_eq!(command.args, vec![script_path.to_string_lossy().into_owned()]);

        let script = std::fs::read_to_string(&script_path).unwrap();
        let block: Vec<&str> = script.lines().skip(3).take(18).collect();
        assert_eq!(block[0], "mic_7.ctf");
        assert_eq!(
            &block[1..],
            &["1.06", "300", "2.7", "0.07", "512", "20", "5", "5000", "50000", "500", "no", "no", "yes", "100", "no", "no", "CRYOFLOW_EOF"]
        );
        assert!(script.contains("ctffind > mic_7_ctffind.log"));
    }
}
