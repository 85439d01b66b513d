// Copyright 2024 the wjs authors. MIT license.

//! Command-line front end: boots a root worker context on the entry
//! script given on the command line and runs it to quiescence (spec
//! §4.F "root"). Module resolution, permissions, and snapshots are out of
//! scope; this only ever runs a single file (spec Non-goals).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

/// Run a script as the root of a worker tree.
#[derive(Parser)]
#[command(name = "wjs", version, about)]
struct Args {
  /// JavaScript entry point to run as the root context.
  script: PathBuf,

  /// Enable verbose (debug-level) logging. Equivalent to RUST_LOG=debug.
  #[arg(short, long)]
  verbose: bool,
}

fn main() -> ExitCode {
  let args = Args::parse();

  let mut builder = env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
  );
  builder.init();

  match wjs_runtime::run_root(args.script) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error!("{err}");
      ExitCode::FAILURE
    }
  }
}
