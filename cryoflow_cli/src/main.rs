use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use libcryoflow::cancel::{install_interrupt_handler, CancelToken};
use libcryoflow::config::{Config, CtfEstimator};
use libcryoflow::error::PipelineError;
use libcryoflow::pipeline::AutoSteering;
use libcryoflow::process::{process_ctf, process_pipeline, summarize_directory};
use libcryoflow::stage_status::{StageEvent, StageStatus};
use libcryoflow::summary::RunSummary;

/// How long the main thread waits on the status channel before checking on the worker
const STATUS_WAIT: Duration = Duration::from_millis(200);

/// Send the library's spdlog output to a file next to where the tool was run
fn setup_file_logging() -> Result<(), spdlog::Error> {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./cryoflow.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()?,
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

fn cli() -> Command {
    Command::new("cryoflow_cli")
        .about("Quick-look cryo-EM processing")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file (or results directory for summarize)"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("ctf")
                .about("Estimate the CTF of every micrograph")
                .arg(
                    Arg::new("compare")
                        .long("compare")
                        .action(ArgAction::SetTrue)
                        .help("Run both Gctf and ctffind and compare their resolution estimates"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run the pipeline from the raw inputs through classification"),
        )
        .subcommand(
            Command::new("summarize")
                .about("Summarize CTF and picking results already in a directory")
                .arg(
                    Arg::new("estimator")
                        .long("estimator")
                        .value_parser(["gctf", "ctffind"])
                        .default_value("gctf")
                        .help("Which estimator produced the logs"),
                ),
        )
}

fn load_config(config_path: &Path) -> Option<Config> {
    log::info!("Loading config from {}...", config_path.display());
    match Config::read_config_file(config_path) {
        Ok(c) => {
            log::info!("Config successfully loaded.");
            log::info!("Data Path: {}", c.data_path.display());
            log::info!("Work Path: {}", c.work_path.display());
            log::info!(
                "Pattern: '{}' Suffix: {} Movies: {}",
                c.micrograph_pattern,
                c.micrograph_suffix,
                c.movies
            );
            log::info!("Pixel Size: {} A", c.pixel_size);
            Some(c)
        }
        Err(e) => {
            log::error!("{e}");
            None
        }
    }
}

/// Run `task` on its own thread, drawing one progress bar per stage from the status messages
fn run_with_progress<F>(pb_manager: &MultiProgress, task: F) -> Result<RunSummary, String>
where
    F: FnOnce(mpsc::Sender<StageStatus>, CancelToken) -> Result<RunSummary, PipelineError>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<StageStatus>();
    let cancel = CancelToken::new();
    let handle = std::thread::spawn(move || task(tx, cancel));

    let style = ProgressStyle::with_template("{msg:>10} [{bar:40}] {pos}/{len} {elapsed}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    loop {
        match rx.recv_timeout(STATUS_WAIT) {
            Ok(status) => {
                log::debug!("{status}");
                match status.event {
                    StageEvent::Launched { total, .. } => {
                        // A stage can run more than once (2D rounds), start a fresh bar each time
                        if let Some(old) = bars.remove(&status.stage) {
                            old.finish();
                        }
                        let pb = pb_manager.add(ProgressBar::new(total as u64));
                        pb.set_style(style.clone());
                        pb.set_message(status.stage.clone());
                        bars.insert(status.stage.clone(), pb);
                    }
                    StageEvent::Progress { done, .. } => {
                        if let Some(pb) = bars.get(&status.stage) {
                            pb.set_position(done as u64);
                        }
                    }
                    StageEvent::WorkerExited { .. } => log::info!("{status}"),
                    StageEvent::Finished { produced, .. } => {
                        if let Some(pb) = bars.get(&status.stage) {
                            pb.set_position(produced as u64);
                            pb.finish();
                        }
                        log::info!("{status}");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if handle.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for pb in bars.values() {
        if !pb.is_finished() {
            pb.abandon();
        }
    }

    match handle.join() {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(String::from("Failed to join processing task!")),
    }
}

fn dispatch(matches: &ArgMatches, pb_manager: &MultiProgress) -> Result<(), String> {
    let Some((command, sub)) = matches.subcommand() else {
        return Err(String::from("No command given, see --help"));
    };
    let path = match sub.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => return Err(String::from("A path is required, see --help")),
    };

    let summary = match (command, sub) {
        ("new", _) => {
            log::info!("Making a template config at {}...", path.display());
            Config::default()
                .write_config_file(&path)
                .map_err(|e| e.to_string())?;
            log::info!("Done.");
            return Ok(());
        }
        ("summarize", sub) => {
            let estimator = match sub.get_one::<String>("estimator").map(String::as_str) {
                Some("ctffind") => CtfEstimator::Ctffind,
                _ => CtfEstimator::Gctf,
            };
            summarize_directory(&path, estimator).map_err(|e| e.to_string())?
        }
        ("ctf", sub) => {
            let compare = sub.get_flag("compare");
            let config = load_config(&path).ok_or("Could not load config")?;
            run_with_progress(pb_manager, move |tx, cancel| {
                process_ctf(&config, tx, cancel, compare)
            })?
        }
        ("run", _) => {
            let config = load_config(&path).ok_or("Could not load config")?;
            run_with_progress(pb_manager, move |tx, cancel| {
                let mut steering = AutoSteering::from_config(&config);
                process_pipeline(&config, tx, cancel, &mut steering)
            })?
        }
        _ => return Err(String::from("Unknown command, see --help")),
    };

    println!("{summary}");
    Ok(())
}

fn main() {
    let matches = cli().get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    let pb_manager = MultiProgress::new();
    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        std::process::exit(1);
    }
    if let Err(e) = setup_file_logging() {
        log::warn!("Could not open cryoflow.log, library messages go to the terminal: {e}");
    }
    if let Err(e) = install_interrupt_handler() {
        log::warn!("Could not install the interrupt handler: {e}");
    }

    match dispatch(&matches, &pb_manager) {
        Ok(()) => spdlog::info!("cryoflow_cli finished"),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn compare_flag_and_global_path() {
        let matches = cli()
            .try_get_matches_from(["cryoflow_cli", "ctf", "--compare", "-p", "conf.yml"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "ctf");
        assert!(sub.get_flag("compare"));
        assert_eq!(sub.get_one::<String>("path").unwrap(), "conf.yml");
    }
}
