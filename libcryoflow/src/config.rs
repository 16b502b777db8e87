use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

use super::constants::{
    CTFFIND_EXE, GAUTOMATCH_EXE, GCTF_EXE, MOTIONCOR_EXE, MPIRUN_EXE, PROJECT3D_EXE,
    RELION_PREPROCESS_EXE, RELION_REFINE_EXE,
};
use super::error::ConfigError;

/// Which program estimates the CTF of each micrograph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtfEstimator {
    Gctf,
    Ctffind,
}

/// Polling behaviour of the completion supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_factor: u32,
    /// Overall deadline for a single stage. `None` waits as long as workers stay alive.
    pub stage_timeout_secs: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 250,
            max_interval_ms: 5000,
            backoff_factor: 2,
            stage_timeout_secs: None,
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

/// Names (or full paths) of the external programs. Overridable so sites can pin versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub motioncor: String,
    pub gctf: String,
    pub ctffind: String,
    pub gautomatch: String,
    pub relion_preprocess: String,
    pub relion_refine: String,
    pub mpirun: String,
    /// EMAN2 projector, only needed when picking templates come from a 3D model
    pub project3d: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            motioncor: String::from(MOTIONCOR_EXE),
            gctf: String::from(GCTF_EXE),
            ctffind: String::from(CTFFIND_EXE),
            gautomatch: String::from(GAUTOMATCH_EXE),
            relion_preprocess: String::from(RELION_PREPROCESS_EXE),
            relion_refine: String::from(RELION_REFINE_EXE),
            mpirun: String::from(MPIRUN_EXE),
            project3d: String::from(PROJECT3D_EXE),
        }
    }
}

/// Structure representing the run configuration. Contains pathing, microscope and tool parameters.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml.
/// A Config is built once at startup and handed by reference to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_path: PathBuf,
    pub work_path: PathBuf,
    pub micrograph_pattern: String,
    pub micrograph_suffix: String,
    pub exclude_pattern: String,
    pub list_file: Option<PathBuf>,
    pub max_micrographs: Option<usize>,
    pub movies: bool,
    pub pixel_size: f64,
    pub voltage_kv: f64,
    pub spherical_aberration: f64,
    pub dose_per_frame: f64,
    pub pre_exposure: f64,
    pub binning: u32,
    pub gain_reference: Option<PathBuf>,
    pub negative_stain: bool,
    pub ctf_estimator: CtfEstimator,
    pub n_gpus: usize,
    pub n_cpus: usize,
    /// Ranks handed to `mpirun -np` for the RELION steps. RELION's first rank only coordinates,
    /// so the default of 9 gives 8 working ranks, which fits a single workstation. Clusters
    /// with more cores can raise it (16 is common).
    pub mpi_processes: usize,
    pub particle_diameter: f64,
    pub cc_cutoff: f64,
    pub template: Option<PathBuf>,
    pub template_pixel_size: Option<f64>,
    /// 3D model whose projections become the picking templates. Ignored when `template` is set.
    pub template_model: Option<PathBuf>,
    pub box_size: Option<u32>,
    pub rescale_size: Option<u32>,
    pub mask_diameter: Option<f64>,
    pub classes_2d: u32,
    pub classes_3d: u32,
    pub iterations_2d: u32,
    pub iterations_3d: u32,
    pub tau2_fudge: f64,
    pub ignore_ctf_first_peak: bool,
    /// Number of 2D rounds the automatic steering runs before moving on; 0 and 1 both mean one
    pub auto_2d_rounds: u32,
    /// Continue to 3D classification after the 2D rounds. Without `reference_model` an initial
    /// model is built from the selected particles first.
    pub classify_3d: bool,
    pub reference_model: Option<PathBuf>,
    pub solvent_mask: Option<PathBuf>,
    pub resolution_cut: Option<f64>,
    pub poll: PollConfig,
    pub tools: ToolPaths,
}

impl Default for Config {
    /// Generate a new Config object. Pixel size is left at zero and must be provided.
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("."),
            work_path: PathBuf::from("."),
            micrograph_pattern: String::from(""),
            micrograph_suffix: String::from("mrc"),
            exclude_pattern: String::from("#"),
            list_file: None,
            max_micrographs: None,
            movies: false,
            pixel_size: 0.0,
            voltage_kv: 300.0,
            spherical_aberration: 2.7,
            dose_per_frame: 0.0,
            pre_exposure: 0.0,
            binning: 1,
            gain_reference: None,
            negative_stain: false,
            ctf_estimator: CtfEstimator::Gctf,
            n_gpus: 0,
            n_cpus: 0,
            mpi_processes: 9,
            particle_diameter: 0.0,
            cc_cutoff: 0.2,
            template: None,
            template_pixel_size: None,
            template_model: None,
            box_size: None,
            rescale_size: Some(96),
            mask_diameter: None,
            classes_2d: 15,
            classes_3d: 1,
            iterations_2d: 25,
            iterations_3d: 25,
            tau2_fudge: 2.0,
            ignore_ctf_first_peak: false,
            auto_2d_rounds: 0,
            classify_3d: false,
            reference_model: None,
            solvent_mask: None,
            resolution_cut: None,
            poll: PollConfig::default(),
            tools: ToolPaths::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file, overwriting anything already there
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pixel_size <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "pixel_size",
                reason: String::from("a positive pixel size (Angstrom) is required"),
            });
        }
        if self.binning == 0 {
            return Err(ConfigError::InvalidValue {
                field: "binning",
                reason: String::from("binning must be at least 1"),
            });
        }
        if self.poll.backoff_factor == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll.backoff_factor",
                reason: String::from("backoff factor must be at least 1"),
            });
        }
        if self.poll.initial_interval_ms > self.poll.max_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "poll.initial_interval_ms",
                reason: String::from("initial interval exceeds the maximum interval"),
            });
        }
        Ok(())
    }

    /// Validation specific to the particle stages, which need a diameter
    pub fn validate_particles(&self) -> Result<(), ConfigError> {
        if self.particle_diameter <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "particle_diameter",
                reason: String::from("a positive particle diameter (Angstrom) is required"),
            });
        }
        Ok(())
    }

    /// The glob used to find micrographs in the data directory
    pub fn micrograph_glob(&self) -> String {
        format!("*{}*{}", self.micrograph_pattern, self.micrograph_suffix)
    }

    /// Pixel size of the images handed to the particle stages; binning in motion correction scales it
    pub fn effective_pixel_size(&self) -> f64 {
        if self.movies && self.binning > 1 {
            self.pixel_size * self.binning as f64
        } else {
            self.pixel_size
        }
    }

    pub fn is_dose_weighted(&self) -> bool {
        self.dose_per_frame > 0.0
    }

    /// Extraction box in pixels. Defaults to 1.8x the particle diameter rounded up to an even number.
    pub fn box_size_or_default(&self) -> u32 {
        match self.box_size {
            Some(b) => b,
            None => round_up_to_even(self.particle_diameter * 1.8 / self.effective_pixel_size()),
        }
    }

    /// Classification mask diameter in Angstrom. Defaults to 1.1x the particle diameter.
    pub fn mask_diameter_or_default(&self) -> f64 {
        self.mask_diameter.unwrap_or(self.particle_diameter * 1.1)
    }

    /// Whether the run goes on to 3D classification
    pub fn goes_3d(&self) -> bool {
        self.classify_3d || self.reference_model.is_some()
    }

    /// Create the timestamped working directory for this run under `work_path`
    pub fn create_work_directory(&self, prefix: &str) -> Result<PathBuf, ConfigError> {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let dir = self.work_path.join(Self::get_run_dir_name(prefix, now)?);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Construct the run directory name, e.g. `QUICK2D_16_Oct_2026_03_04_05PM`
    fn get_run_dir_name(prefix: &str, when: OffsetDateTime) -> Result<String, ConfigError> {
        let format = format_description!(
            "[day]_[month repr:short]_[year]_[hour repr:12]_[minute]_[second][period]"
        );
        Ok(format!("{prefix}_{}", when.format(&format)?))
    }
}

fn round_up_to_even(value: f64) -> u32 {
    ((value / 2.0).ceil() * 2.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.micrograph_suffix, "mrc");
        assert_eq!(config.ctf_estimator, CtfEstimator::Gctf);
        assert_eq!(config.tools.gctf, "Gctf");
        assert_eq!(config.poll.backoff_factor, 2);
        assert_eq!(config.auto_2d_rounds, 0);
        assert_eq!(config.mpi_processes, 9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserialize_partial_yaml() {
        let yaml = "pixel_size: 1.42\nn_gpus: 2\nctf_estimator: ctffind\npoll:\n  stage_timeout_secs: 60\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pixel_size, 1.42);
        assert_eq!(config.n_gpus, 2);
        assert_eq!(config.ctf_estimator, CtfEstimator::Ctffind);
        assert_eq!(config.poll.stage_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.poll.initial_interval_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let mut config = Config::default();
        config.pixel_size = 1.06;
        config.template = Some(PathBuf::from("/data/template.mrcs"));
        config.write_config_file(&path).unwrap();
        let read = Config::read_config_file(&path).unwrap();
        assert_eq!(read, config);
    }

    #[test]
    fn missing_file_is_reported() {
        let result = Config::read_config_file(Path::new("/definitely/not/here.yml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn zero_backoff_is_rejected() {
        let mut config = Config::default();
        config.pixel_size = 1.0;
        config.poll.backoff_factor = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "poll.backoff_factor",
                ..
            })
        ));
    }

    #[test]
    fn particle_geometry_defaults() {
        let mut config = Config::default();
        config.pixel_size = 1.0;
        config.particle_diameter = 150.0;
        // 150 * 1.8 = 270, already even
        assert_eq!(config.box_size_or_default(), 270);
        config.particle_diameter = 151.0;
        // 271.8 rounds up to 272
        assert_eq!(config.box_size_or_default(), 272);
        assert!((config.mask_diameter_or_default() - 166.1).abs() < 1e-9);
    }

    #[test]
    fn binning_scales_pixel_size_for_movies() {
        let mut config = Config::default();
        config.pixel_size = 0.8;
        config.binning = 2;
        assert_eq!(config.effective_pixel_size(), 0.8);
        config.movies = true;
        assert_eq!(config.effective_pixel_size(), 1.6);
    }

    #[test]
    fn reference_or_flag_means_3d() {
        let mut config = Config::default();
        assert!(!config.goes_3d());
        config.classify_3d = true;
        assert!(config.goes_3d());
        config.classify_3d = false;
        config.reference_model = Some(PathBuf::from("/data/model.mrc"));
        assert!(config.goes_3d());
    }

    #[test]
    fn run_directory_name_format() {
        let when = datetime!(2026-10-16 15:04:05 UTC);
        let name = Config::get_run_dir_name("QUICK2D", when).unwrap();
        assert_eq!(name, "QUICK2D_16_Oct_2026_03_04_05PM");
    }
}
