/// Each entry in this directory is one NVIDIA GPU visible to the driver
pub const NVIDIA_GPU_DIR: &str = "/proc/driver/nvidia/gpus";

pub const MOTIONCOR_EXE: &str = "MotionCor2";
pub const GCTF_EXE: &str = "Gctf";
pub const CTFFIND_EXE: &str = "ctffind";
pub const GAUTOMATCH_EXE: &str = "Gautomatch";
pub const RELION_PREPROCESS_EXE: &str = "relion_preprocess_mpi";
pub const RELION_REFINE_EXE: &str = "relion_refine_mpi";
pub const MPIRUN_EXE: &str = "mpirun";
pub const PROJECT3D_EXE: &str = "e2project3d.py";

/// ctffind reports an unresolved fit as `inf`; summaries substitute this value (Angstrom)
pub const UNRESOLVED_RESOLUTION: f64 = 50.0;

/// Gctf and ctffind resolution estimates within this many Angstrom are considered in agreement
pub const ESTIMATE_AGREEMENT: f64 = 3.0;

/// Gctf validation score bins, from coarsest to finest
pub const VALIDATION_BINS: [&str; 5] = ["20-08A", "15-06A", "12-05A", "10-04A", "08-03A"];

pub const STAR_MICROGRAPH_LABEL: &str = "_rlnMicrographName";

pub const MICROGRAPHS_STAR_NAME: &str = "micrographs.star";
pub const SUMMARY_FILE_NAME: &str = "summary.yml";
