//! Main entry point for the regtriage CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use log::error;
use regtriage::{
    app::App,
    cli::{Args, Config},
    error::Error,
    output::write_summary,
    privilege::relaunch_elevated,
};
use simplelog::SimpleLogger;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args = Args::parse();
    // Only fails if a logger is already installed
    let _ = SimpleLogger::init(args.log_level, simplelog::Config::default());

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::from_args(args).context("invalid configuration")?;
    let app = App::new(config);

    match app.run() {
        Ok(report) => {
            for line in report.summary_lines() {
                eprintln!("{}", line);
            }
            eprintln!(
                "{} hive(s) processed: {} succeeded, {} failed",
                report.outcomes.len(),
                report.succeeded(),
                report.failed()
            );
            if let Some(path) = &app.config().summary_path {
                if let Err(err) = write_summary(&report, path) {
                    error!("could not write summary to {}: {}", path.display(), err);
                }
            }
            Ok(())
        }
        Err(Error::Elevation(reason)) if !app.config().relaunched => {
            eprintln!("{}; requesting elevation and restarting", reason);
            let args: Vec<String> = std::env::args_os()
                .skip(1)
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            relaunch_elevated(&args).context("could not restart with elevated rights")
        }
        Err(err) => Err(err).context("run aborted"),
    }
}
