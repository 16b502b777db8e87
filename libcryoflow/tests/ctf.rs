use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;

use libcryoflow::cancel::CancelToken;
use libcryoflow::config::{Config, CtfEstimator};
use libcryoflow::error::{PipelineError, RunnerError, StageError};
use libcryoflow::process::{process_ctf, summarize_directory};
use libcryoflow::stage_status::StageEvent;
use libcryoflow::summary::RunSummary;

/// Stands in for Gctf: writes a log next to every micrograph it is given
const FAKE_GCTF: &str = r#"#!/bin/sh
for arg in "$@"; do
    case "$arg" in
        *.mrc)
            log="${arg%.mrc}_gctf.log"
            echo "   Defocus_U   Defocus_V       Angle         CCC" > "$log"
            echo "    21356.37    20987.08       45.93    0.098542  Final Values" >> "$log"
            echo "Resolution limit estimated by EPA: RES_LIMIT 3.512" >> "$log"
            ;;
    esac
done
"#;

/// Stands in for ctffind: reads the input block and writes the spectrum and result files.
/// Micrograph `c` gets a much worse resolution than Gctf reports.
const FAKE_CTFFIND: &str = r##"#!/bin/sh
read input
read output
stem="${output%.ctf}"
case "$stem" in
    c) res=12.0 ;;
    *) res=3.6 ;;
esac
touch "$output"
echo "# ctffind fake" > "$stem.txt"
echo "1.000000 21000.0 20900.0 44.0 0.0 0.11 $res" >> "$stem.txt"
"##;

fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Session {
    _root: tempfile::TempDir,
    config: Config,
}

fn session(gctf_body: &str) -> Session {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    let work = root.path().join("work");
    let tools = root.path().join("tools");
    for dir in [&data, &work, &tools] {
        std::fs::create_dir_all(dir).unwrap();
    }
    for name in ["a", "b", "c"] {
        std::fs::write(data.join(format!("{name}.mrc")), b"MRC data").unwrap();
    }

    let mut config = Config::default();
    config.data_path = data;
    config.work_path = work;
    config.pixel_size = 1.06;
    config.n_gpus = 2;
    config.n_cpus = 2;
    config.poll.initial_interval_ms = 10;
    config.poll.max_interval_ms = 50;
    config.poll.stage_timeout_secs = Some(30);
    config.tools.gctf = write_tool(&tools, "Gctf", gctf_body)
        .to_string_lossy()
        .into_owned();
    config.tools.ctffind = write_tool(&tools, "ctffind", FAKE_CTFFIND)
        .to_string_lossy()
        .into_owned();
    Session {
        _root: root,
        config,
    }
}

#[test]
fn gctf_run_writes_tables_and_summary() {
    let session = session(FAKE_GCTF);
    let (tx, rx) = channel();
    let summary = process_ctf(&session.config, tx, CancelToken::new(), false).unwrap();

    assert_eq!(summary.inputs, 3);
    assert_eq!(summary.ctf_estimator, Some(CtfEstimator::Gctf));
    assert_eq!(summary.stages.len(), 1);
    assert_eq!(summary.stages[0].stage, "gctf");
    assert_eq!(summary.stages[0].workers, 2);
    assert_eq!(summary.stages[0].produced, 3);
    let ctf = summary.ctf.as_ref().unwrap();
    assert_eq!(ctf.count, 3);
    assert_eq!(ctf.mean_resolution, 3.5);

    let run_dir = &summary.run_dir;
    assert!(run_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("CTF_"));
    assert!(run_dir.join("config.yml").exists());
    assert!(run_dir.join("logs/gctf_gpu0.log").exists());
    assert!(run_dir.join("logs/gctf_gpu1.log").exists());
    let star = std::fs::read_to_string(run_dir.join("micrographs/micrographs_ctf.star")).unwrap();
    for name in ["a.mrc", "b.mrc", "c.mrc"] {
        assert!(star.contains(name));
    }
    assert_eq!(RunSummary::read(&run_dir.join("summary.yml")).unwrap(), summary);

    let events: Vec<StageEvent> = rx.try_iter().map(|s| s.event).collect();
    assert!(events.contains(&StageEvent::Finished {
        produced: 3,
        total: 3
    }));

    let again = summarize_directory(&run_dir.join("micrographs"), CtfEstimator::Gctf).unwrap();
    assert_eq!(again.ctf, summary.ctf);
}

#[test]
fn compare_mode_splits_micrographs() {
    let session = session(FAKE_GCTF);
    let (tx, _rx) = channel();
    let summary = process_ctf(&session.config, tx, CancelToken::new(), true).unwrap();

    let stages: Vec<&str> = summary.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(stages, vec!["gctf", "ctffind"]);
    let comparison = summary.comparison.as_ref().unwrap();
    assert_eq!(comparison.matching, vec!["a", "b"]);
    assert_eq!(comparison.differ, vec!["c"]);

    let micrographs = summary.run_dir.join("micrographs");
    let matching =
        std::fs::read_to_string(micrographs.join("micrographs_ctf_matching.star")).unwrap();
    assert!(matching.contains("a.mrc"));
    assert!(!matching.contains("c.mrc"));
    let differ = std::fs::read_to_string(micrographs.join("micrographs_ctf_differ.star")).unwrap();
    assert!(differ.contains("c.mrc"));
    assert!(summary.run_dir.join("ctffind/c.ctf").exists());
}

#[test]
fn failing_estimator_stops_the_run() {
    let session = session("#!/bin/sh\necho 'CUDA error' >&2\nexit 2\n");
    let (tx, _rx) = channel();
    let error = process_ctf(&session.config, tx, CancelToken::new(), false).unwrap_err();
    assert!(matches!(
        error,
        PipelineError::StageError(StageError::RunnerError(RunnerError::WorkerFailed {
            code: Some(2),
            ..
        }))
    ));
}

#[test]
fn missing_estimators_are_reported_before_running() {
    let mut session = session(FAKE_GCTF);
    session.config.tools.gctf = String::from("/nonexistent/Gctf");
    session.config.tools.ctffind = String::from("/nonexistent/ctffind");
    let (tx, _rx) = channel();
    let error = process_ctf(&session.config, tx, CancelToken::new(), false).unwrap_err();
    assert!(matches!(error, PipelineError::PrerequisiteError(_)));
    let runs = std::fs::read_dir(&session.config.work_path).unwrap().count();
    assert_eq!(runs, 0);
}
