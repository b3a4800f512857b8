use std::env;
use std::ffi::OsString;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info, warn};
use serde_derive::{Deserialize, Serialize};

use jobq::core::watch_signals;
use jobq::{logger, Coordinator, RunConfig, RunParams, WorkerExit};

/// Runs producers and consumers over a bounded job queue.
#[derive(clap::Parser)]
#[clap(name = "jobq", allow_negative_numbers = true)]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    #[clap(long = "log-level")]
    log_level: Option<String>,
    /// Queue size, jobs per producer, number of producers, number of consumers
    #[clap(value_name = "ARG")]
    args: Vec<String>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
struct RunnerConfig {
    run: RunConfig,
}

fn main() {
    process::exit(run());
}

// Err carries the exit code. The positionals are counted here rather than by
// clap, so a bad flag keeps clap's own message.
fn parse_opts<I, T>(args: I) -> Result<(Opts, [String; 4]), i32>
    where I: IntoIterator<Item = T>,
          T: Into<OsString> + Clone,
{
    let mut opts = Opts::try_parse_from(args).map_err(|e| {
        let _ = e.print();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => jobq::EXIT_OK,
            _ => jobq::EXIT_INVALID_ARGUMENT,
        }
    })?;
    match <[String; 4]>::try_from(std::mem::take(&mut opts.args)) {
        Ok(positionals) => Ok((opts, positionals)),
        Err(_) => {
            eprintln!("Please enter 4 command line arguments.");
            Err(jobq::EXIT_ARGUMENT_COUNT)
        }
    }
}

fn run() -> i32 {
    let (opts, positionals) = match parse_opts(env::args_os()) {
        Ok(parsed) => parsed,
        Err(code) => return code,
    };

    let mut cfg = match &opts.config {
        Some(path) => match confy::load_path(path) {
            Ok(RunnerConfig { run }) => run,
            Err(e) => {
                eprintln!("Could not load configuration {}: {}", path, e);
                return jobq::EXIT_INVALID_ARGUMENT;
            }
        },
        None => RunConfig::default(),
    };
    if let Some(level) = opts.log_level {
        cfg.log_level = level;
    }
    match logger::parse_level(&cfg.log_level) {
        Ok(level) => logger::init(level),
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    }

    let params = match RunParams::parse(&positionals) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };

    let coordinator = Coordinator::new(cfg);
    if let Err(e) = watch_signals(&coordinator.closing_flag()) {
        warn!("signals will not stop the run gracefully: {}", e);
    }

    match coordinator.run(&params) {
        Ok(summary) => {
            let interrupted = summary
                .reports
                .iter()
                .filter(|r| r.exit == WorkerExit::Interrupted)
                .count();
            if interrupted > 0 {
                warn!("{} worker(s) stopped early on a signal", interrupted);
            }
            if !summary.failures.is_empty() {
                let e = jobq::JobqError::WorkerFailed { failed: summary.failures.len() };
                error!("{}", e);
                eprintln!("{}", e);
                return e.exit_code();
            }
            info!("{} job(s) deposited, {} consumed", summary.deposited(), summary.consumed());
            jobq::EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
