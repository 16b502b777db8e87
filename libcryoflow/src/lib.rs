//! # cryoflow
//!
//! cryoflow is a quick-look processing pipeline for cryo-EM data, written in Rust. It takes
//! a directory of movies or micrographs straight off the microscope and drives the standard
//! external tools over them: MotionCor2 for frame alignment, Gctf or ctffind for CTF
//! estimation, Gautomatch for particle picking and RELION for particle extraction and 2D/3D
//! classification. The aim is to know within the session whether a grid is worth a full
//! collection.
//!
//! ## How work is distributed
//!
//! Every step follows the same pattern. The list of micrographs is split into contiguous
//! partitions, one per GPU (or CPU), and one external process is launched per partition, all
//! at once. The supervisor then polls the output directory, counting files that match the
//! step's completion pattern to report progress, while also watching the exit status of
//! every worker. A step is complete when every worker exited successfully and the expected
//! outputs exist. A worker that fails, a step that runs past its deadline, or an interrupt
//! from the user stops the step, and every remaining worker process group is killed.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installing the tool chain.
//! Then use `cargo install --path ./cryoflow_cli` from the top level of the repository.
//!
//! cryoflow only runs on Linux (it relies on process groups and POSIX signals). The external
//! tools must be on your `PATH`, or their locations given in the `tools` section of the
//! configuration. Missing tools are reported once, before anything is run.
//!
//! ## Configuration
//!
//! A run is described by a YAML file; `cryoflow_cli new --path config.yml` writes a template
//! with every field at its default. The most relevant fields are:
//!
//! ```yml
//! data_path: /data/session_01
//! work_path: /scratch/quick
//! micrograph_pattern: ''
//! micrograph_suffix: mrc
//! movies: false
//! pixel_size: 1.06
//! voltage_kv: 300.0
//! spherical_aberration: 2.7
//! particle_diameter: 150.0
//! ctf_estimator: gctf
//! n_gpus: 0
//! n_cpus: 0
//! auto_2d_rounds: 0
//! classify_3d: false
//! reference_model: null
//! poll:
//!   initial_interval_ms: 250
//!   max_interval_ms: 5000
//!   backoff_factor: 2
//!   stage_timeout_secs: null
//! ```
//!
//! `n_gpus` and `n_cpus` of zero mean "use everything detected". `auto_2d_rounds` is the
//! number of 2D rounds run before moving to 3D; zero and one both mean a single round. A run
//! goes to 3D when `classify_3d` is set or a `reference_model` is given; without a reference
//! an initial model is built from the selected particles first.
//!
//! ## Output
//!
//! Each run creates a timestamped directory under `work_path`, prefixed `QUICK2D` for 2D-only
//! runs and `QUICK3D` otherwise:
//!
//! ```text
//! QUICK3D_16_Oct_2026_03_04_05PM
//! |---- config.yml        copy of the configuration used
//! |---- summary.yml       run summary
//! |---- logs/             one log per stage and worker, e.g. gctf_gpu0.log
//! |---- movies/           per-GPU links to the movies (movie input only)
//! |---- aligned/          MotionCor2 output (movie input only)
//! |---- templates/        picking templates projected from `template_model`
//! |---- micrographs/      links to the micrographs, CTF and picking results
//! |---- Particles/        extracted particles
//! |---- Class2D/          2D classification runs and selected particles
//! |---- reextract/        re-extracted particles
//! |---- InitialModel/     de novo model (3D runs without a reference)
//! |---- Class3D/          3D classification
//! ```
//!
//! The first line of every worker log is the command that was run.
pub mod cancel;
pub mod command;
pub mod config;
pub mod constants;
pub mod error;
pub mod glob;
pub mod logs;
pub mod partition;
pub mod pipeline;
pub mod prerequisites;
pub mod process;
pub mod resources;
pub mod runner;
pub mod signal;
pub mod stage_status;
pub mod stages;
pub mod star;
pub mod summary;
pub mod work_list;
pub mod worker;
