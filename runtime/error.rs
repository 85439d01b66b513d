// Copyright 2024 the wjs authors. MIT license.

//! Error kinds produced by the worker runtime (spec §7).

use std::path::PathBuf;

/// The four error kinds the core distinguishes. Sending into a dead port is
/// deliberately **not** one of these: per §7(c) it is a non-error, silently
/// discarding the message and returning `false`.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  /// A script-thrown exception, or a malformed call from script into the
  /// native surface (wrong arity, non-string file, non-JSON-encodable
  /// value). Reported back through the script engine's native-error
  /// facility at the call site; this variant is what gets logged when it
  /// happens off a run loop that has no caller to report it to.
  #[error("{0}")]
  Js(String),

  /// A worker's entry file failed to compile or threw while loading. Never
  /// surfaced to the parent as a script exception — the parent only ever
  /// observes a receive port that disconnects without delivering a message
  /// (§7(b)) — but logged here for diagnostics and returned from the
  /// worker thread's join handle.
  #[error("worker failed to load {file}: {source}")]
  LoadFailed {
    file: PathBuf,
    #[source]
    source: Box<WorkerError>,
  },

  /// The entry file could not be read from disk.
  #[error("failed to read worker entry point: {0}")]
  Io(#[from] std::io::Error),

  /// Fatal OS resource failure: thread, mutex, or condvar creation. Only
  /// ever produced on the thread calling `Worker(file)`, never inside a
  /// running run loop.
  #[error("OS resource failure: {0}")]
  Os(String),
}
