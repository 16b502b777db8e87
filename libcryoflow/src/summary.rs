use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::config::CtfEstimator;
use super::constants::SUMMARY_FILE_NAME;
use super::error::PipelineError;
use super::logs::{CtfSummary, EstimateComparison};
use super::runner::RunResult;
use super::work_list::WorkList;

/// How one stage went
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub workers: usize,
    pub produced: usize,
    pub expected: usize,
    pub elapsed_secs: f64,
}

impl From<&RunResult> for StageSummary {
    fn from(result: &RunResult) -> Self {
        Self {
            stage: result.stage.clone(),
            workers: result.workers.len(),
            produced: result.produced,
            expected: result.total,
            elapsed_secs: round_secs(result.elapsed),
        }
    }
}

/// One 2D classification round and the automatic selection made from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRound {
    pub run: u32,
    pub classes: u32,
    pub selected_classes: Vec<u32>,
    pub selected_particles: usize,
}

/// Record of a whole run, written as `summary.yml` into the run directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub inputs: usize,
    pub input_bytes: u64,
    pub ctf_estimator: Option<CtfEstimator>,
    pub stages: Vec<StageSummary>,
    pub ctf: Option<CtfSummary>,
    pub comparison: Option<EstimateComparison>,
    pub particles_picked: Option<usize>,
    pub class_rounds: Vec<ClassRound>,
    /// Map built de novo when no reference model was given
    pub initial_model: Option<PathBuf>,
    pub final_model: Option<PathBuf>,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn new(run_dir: &Path, inputs: &WorkList) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            inputs: inputs.len(),
            input_bytes: inputs.total_size_bytes(),
            ..Default::default()
        }
    }

    pub fn record_stage(&mut self, result: &RunResult) {
        self.stages.push(StageSummary::from(result));
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_secs = round_secs(duration);
    }

    /// Write to `<run_dir>/summary.yml` and return the path
    pub fn write(&self) -> Result<PathBuf, PipelineError> {
        let path = self.run_dir.join(SUMMARY_FILE_NAME);
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        let yaml_str = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }
}

fn round_secs(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 10.0).round() / 10.0
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run directory: {}", self.run_dir.display())?;
        writeln!(
            f,
            "Inputs: {} ({})",
            self.inputs,
            human_bytes::human_bytes(self.input_bytes as f64)
        )?;
        for stage in &self.stages {
            writeln!(
                f,
                "  {:<10} {}/{} outputs, {} workers, {:.1}s",
                stage.stage, stage.produced, stage.expected, stage.workers, stage.elapsed_secs
            )?;
        }
        if let Some(ctf) = &self.ctf {
            let estimator = match self.ctf_estimator {
                Some(CtfEstimator::Ctffind) => "ctffind",
                _ => "Gctf",
            };
            writeln!(f, "CTF ({estimator}) over {} micrographs:", ctf.count)?;
            writeln!(f, "  mean defocus U/V: {} / {} A", ctf.mean_defocus_u, ctf.mean_defocus_v)?;
            writeln!(f, "  mean astigmatism angle: {}", ctf.mean_angle)?;
            writeln!(f, "  mean CC: {}", ctf.mean_cc)?;
            writeln!(f, "  mean resolution: {} A", ctf.mean_resolution)?;
        }
        if let Some(comparison) = &self.comparison {
            writeln!(
                f,
                "Gctf and ctffind agree on {} micrographs, differ on {}",
                comparison.matching.len(),
                comparison.differ.len()
            )?;
        }
        if let Some(picked) = self.particles_picked {
            writeln!(f, "Particles picked: {picked}")?;
        }
        for round in &self.class_rounds {
            writeln!(
                f,
                "2D run {}: {} classes, kept {} classes with {} particles",
                round.run,
                round.classes,
                round.selected_classes.len(),
                round.selected_particles
            )?;
        }
        if let Some(model) = &self.initial_model {
            writeln!(f, "Initial model: {}", model.display())?;
        }
        if let Some(model) = &self.final_model {
            writeln!(f, "Final model: {}", model.display())?;
        }
        write!(f, "Total time: {:.1}s", self.duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(dir: &Path) -> RunSummary {
        RunSummary {
            run_dir: dir.to_path_buf(),
            inputs: 12,
            input_bytes: 2048,
            ctf_estimator: Some(CtfEstimator::Gctf),
            stages: vec![StageSummary {
                stage: String::from("gctf"),
                workers: 2,
                produced: 12,
                expected: 12,
                elapsed_secs: 3.2,
            }],
            ctf: Some(CtfSummary {
                count: 12,
                mean_defocus_u: 15000.5,
                mean_defocus_v: 14800.0,
                mean_angle: 30.1,
                mean_cc: 0.1,
                mean_resolution: 3.7,
            }),
            comparison: None,
            particles_picked: Some(1520),
            class_rounds: vec![ClassRound {
                run: 1,
                classes: 15,
                selected_classes: vec![2, 5],
                selected_particles: 640,
            }],
            initial_model: Some(PathBuf::from("/run/InitialModel/run1_it001_class001.mrc")),
            final_model: None,
            duration_secs: 61.0,
        }
    }

    #[test]
    fn yaml_roundtrip_in_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let written = summary(dir.path());
        let path = written.write().unwrap();
        assert_eq!(path, dir.path().join("summary.yml"));
        assert_eq!(RunSummary::read(&path).unwrap(), written);
    }

    #[test]
    fn text_block() {
        let text = summary(Path::new("/run")).to_string();
        assert!(text.starts_with("Run directory: /run\nInputs: 12 ("));
        assert!(text.contains("  gctf       12/12 outputs, 2 workers, 3.2s\n"));
        assert!(text.contains("CTF (Gctf) over 12 micrographs:\n"));
        assert!(text.contains("  mean resolution: 3.7 A\n"));
        assert!(text.contains("Particles picked: 1520\n"));
        assert!(text.contains("2D run 1: 15 classes, kept 2 classes with 640 particles\n"));
        assert!(text.contains("Initial model: /run/InitialModel/run1_it001_class001.mrc\n"));
        assert!(text.ends_with("Total time: 61.0s"));
    }

    #[test]
    fn stage_summary_from_result() {
        let result = RunResult {
            stage: String::from("extract"),
            total: 4,
            produced: 4,
            workers: Vec::new(),
            elapsed: Duration::from_millis(1260),
        };
        let stage = StageSummary::from(&result);
        assert_eq!(stage.expected, 4);
        assert_eq!(stage.workers, 0);
        assert_eq!(stage.elapsed_secs, 1.3);
    }
}
