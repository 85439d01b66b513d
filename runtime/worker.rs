// Copyright 2024 the wjs authors. MIT license.

//! Worker lifecycle: spawn, run, and tear down (spec §4.C, §4.F).
//!
//! Mirrors `spawn_worker`/`run_worker`/`cleanup_worker` in the original.
//! The OS thread takes the place of the original's `pthread_create`; the
//! join handle is stashed so a later collection pass (or process exit)
//! can observe the thread actually finished rather than just that the
//! port drained.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use deno_core::JsRuntime;
use deno_core::RuntimeOptions;
use log::debug;
use log::error;
use log::warn;

use crate::bindings;
use crate::context::HeapStash;
use crate::error::WorkerError;
use crate::message::WorkerId;
use crate::port::Port;
use crate::run_loop;

/// A live (or just-finished) worker, as its parent and the quiescence
/// collector see it. Shared via `Arc` between the `ChildSlot` that owns
/// it script-side and the thread actually running it.
pub struct WorkerHandle {
  pub id: WorkerId,
  pub file: PathBuf,
  /// This worker's own mailbox; `postMessage` calls on the corresponding
  /// `Worker` object deliver here.
  pub receive_port: Arc<Port>,
  /// The port this worker's global `postMessage` sends into — its
  /// parent's default port (spec `post_message_global`).
  pub parent_port: Arc<Port>,
  thread: Mutex<Option<JoinHandle<()>>>,
}

/// Spawns a new worker thread executing `file`, with messages to it
/// routed through a fresh receive port and upward sends routed into
/// `parent_port` (spec `spawn_worker`).
pub fn spawn(parent_port: Arc<Port>, file: PathBuf) -> Result<Arc<WorkerHandle>, WorkerError> {
  let id = WorkerId::next();
  let receive_port = Port::new();
  parent_port.add_sender();

  let handle = Arc::new(WorkerHandle {
    id,
    file: file.clone(),
    receive_port,
    parent_port,
    thread: Mutex::new(None),
  });

  let spawned = Arc::clone(&handle);
  let thread = thread::Builder::new()
    .name(id.to_string())
    .spawn(move || worker_main(spawned))
    .map_err(|e| WorkerError::Os(e.to_string()))?;
  *handle.thread.lock().unwrap() = Some(thread);

  debug!("spawned worker {id} for {}", file.display());
  Ok(handle)
}

fn worker_main(handle: Arc<WorkerHandle>) {
  let id = handle.id;
  if let Err(err) = run_worker(&handle) {
    error!("worker {id} terminated abnormally: {err}");
  }
  cleanup(&handle);
}

fn run_worker(handle: &Arc<WorkerHandle>) -> Result<(), WorkerError> {
  let extension = bindings::worker_extension();
  let mut runtime = JsRuntime::new(RuntimeOptions {
    extensions: vec![extension],
    ..Default::default()
  });

  runtime
    .execute_script("wjs:worker_bootstrap.js", bindings::WORKER_BOOTSTRAP_JS)
    .map_err(|e| WorkerError::Js(e.to_string()))?;

  {
    let state = runtime.op_state();
    state
      .borrow_mut()
      .put(HeapStash::new(Arc::clone(&handle.receive_port), Some(Arc::clone(handle))));
  }

  let source = read_entry_point(&handle.file).map_err(|e| WorkerError::LoadFailed {
    file: handle.file.clone(),
    source: Box::new(e),
  })?;
  runtime
    .execute_script(handle.file.to_string_lossy().into_owned(), source)
    .map_err(|e| WorkerError::LoadFailed {
      file: handle.file.clone(),
      source: Box::new(WorkerError::Js(e.to_string())),
    })?;

  run_loop::run(&mut runtime, &handle.receive_port, Some(&handle.parent_port))
}

fn read_entry_point(path: &Path) -> Result<String, WorkerError> {
  fs::read_to_string(path).map_err(WorkerError::Io)
}

/// Tears down a worker once its run loop has returned (spec
/// `cleanup_worker`): marks its own receive port disconnected so late
/// `postMessage` calls are silently dropped, waits for every `Worker`
/// object referencing it to let go, then releases its own hold on the
/// parent's port.
fn cleanup(handle: &Arc<WorkerHandle>) {
  debug!("worker {} cleaning up", handle.id);
  handle.receive_port.mark_disconnected();
  handle.receive_port.wait_for_drain();
  handle.parent_port.release_sending();
}

impl WorkerHandle {
  /// Blocks until this worker's OS thread has actually finished, logging
  /// if it panicked. Called by the quiescence collector once a child's
  /// `Worker` object has been reaped: `wait_for_drain` in `cleanup` only
  /// proves the thread reached the end of its run loop, not that the
  /// `thread::spawn` closure (and the runtime drop it does on the way out)
  /// has returned. Idempotent: a second call is a no-op, since the handle
  /// is taken out of the `Mutex` on the first.
  pub(crate) fn join(&self) {
    let Some(thread) = self.thread.lock().unwrap().take() else {
      return;
    };
    if thread.join().is_err() {
      error!("worker {} thread panicked", self.id);
    }
  }
}

/// Runs the root context directly on the calling thread (spec `run_worker`
/// as invoked from `main`, minus the thread spawn). There is no parent
/// port and no worker record; quiescence is observed directly rather than
/// reported upward.
pub fn run_root(file: PathBuf) -> Result<(), WorkerError> {
  let extension = bindings::worker_extension();
  let mut runtime = JsRuntime::new(RuntimeOptions {
    extensions: vec![extension],
    ..Default::default()
  });

  runtime
    .execute_script("wjs:root_bootstrap.js", bindings::ROOT_BOOTSTRAP_JS)
    .map_err(|e| WorkerError::Js(e.to_string()))?;

  let root_port = Port::new();
  {
    let state = runtime.op_state();
    state.borrow_mut().put(HeapStash::new(Arc::clone(&root_port), None));
  }

  let source = read_entry_point(&file).map_err(|e| WorkerError::LoadFailed {
    file: file.clone(),
    source: Box::new(e),
  })?;
  runtime.execute_script(file.to_string_lossy().into_owned(), source).map_err(|e| WorkerError::LoadFailed {
    file: file.clone(),
    source: Box::new(WorkerError::Js(e.to_string())),
  })?;

  let result = run_loop::run(&mut runtime, &root_port, None);
  if result.is_err() {
    warn!("root context exited with an error");
  }
  result
}

/// Like [`run_root`] but with a `__sink(value)` global wired to a shared
/// buffer, and `source` executed directly instead of read from `file`.
/// Lets integration tests observe what a root script's `onmessage`
/// observed without capturing real stdout.
#[cfg(test)]
pub(crate) fn run_root_with_sink(source: &str) -> Result<Vec<String>, WorkerError> {
  use std::sync::Mutex as StdMutex;

  let sink = Arc::new(StdMutex::new(Vec::new()));
  let (sink_extension, sink_state) = bindings::test_sink_extension(Arc::clone(&sink));
  let mut runtime = JsRuntime::new(RuntimeOptions {
    extensions: vec![bindings::worker_extension(), sink_extension],
    ..Default::default()
  });

  runtime
    .execute_script("wjs:root_bootstrap.js", bindings::ROOT_BOOTSTRAP_JS)
    .map_err(|e| WorkerError::Js(e.to_string()))?;
  runtime
    .execute_script("wjs:test_sink_bootstrap.js", bindings::TEST_SINK_BOOTSTRAP_JS)
    .map_err(|e| WorkerError::Js(e.to_string()))?;

  let root_port = Port::new();
  {
    let state = runtime.op_state();
    let mut state = state.borrow_mut();
    state.put(HeapStash::new(Arc::clone(&root_port), None));
    state.put(sink_state);
  }

  runtime
    .execute_script("wjs:test_entry.js", source.to_string())
    .map_err(|e| WorkerError::Js(e.to_string()))?;

  run_loop::run(&mut runtime, &root_port, None)?;
  Ok(Arc::try_unwrap(sink).unwrap().into_inner().unwrap())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_script(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
  }

  // S1: a root with no workers runs its top-level code and exits.
  #[test]
  fn root_with_no_workers_runs_and_exits() {
    let out = run_root_with_sink("__sink('hello')").unwrap();
    assert_eq!(out, vec!["hello".to_string()]);
  }

  // S1 variant exercised through the real file-reading entry point.
  #[test]
  fn run_root_reads_and_executes_a_real_file() {
    let file = write_script("1 + 1;");
    let result = run_root(file.path().to_path_buf());
    assert!(result.is_ok());
  }

  // S2: ping — one child worker, one round trip.
  #[test]
  fn ping_round_trip_between_root_and_one_worker() {
    let worker_file = write_script(
      r#"
      onmessage = function(msg) {
        postMessage({ pong: msg.ping });
      };
      "#,
    );
    // Block-scoped so `w` is collectible once its onmessage closure is
    // done with it; a root-level `const` would stay reachable in the
    // script's context forever and the worker thread's own teardown
    // (which waits for the last Worker object referencing it to be
    // reclaimed) would never complete.
    let script = format!(
      r#"
      (function() {{
        const w = new Worker({:?});
        w.onmessage = function(msg) {{ __sink(JSON.stringify(msg)); w.terminate(); }};
        w.postMessage({{ ping: 1 }});
      }})();
      "#,
      worker_file.path().to_string_lossy()
    );
    let out = run_root_with_sink(&script).unwrap();
    assert_eq!(out, vec![r#"{"pong":1}"#.to_string()]);
  }

  // S3: fan-out — several workers, each replies once.
  #[test]
  fn fan_out_to_several_workers_each_reply_observed() {
    let worker_file = write_script("onmessage = function(msg) { postMessage(msg.n * 2); };");
    let path = worker_file.path().to_string_lossy().into_owned();
    let script = format!(
      r#"
      const results = [];
      let remaining = 3;
      for (let i = 0; i < 3; i++) {{
        const w = new Worker({path:?});
        w.onmessage = function(msg) {{
          results.push(msg);
          remaining -= 1;
          if (remaining === 0) {{
            results.sort();
            __sink(JSON.stringify(results));
          }}
          w.terminate();
        }};
        w.postMessage({{ n: i }});
      }}
      "#,
    );
    let out = run_root_with_sink(&script).unwrap();
    assert_eq!(out.len(), 1);
    let mut values: Vec<i64> = serde_json::from_str(&out[0]).unwrap();
    values.sort_unstable();
    assert_eq!(values, vec![0, 2, 4]);
  }

  // S4: idle tree — a worker that never replies still lets the root
  // become quiescent and return once the root has nothing left to do.
  #[test]
  fn idle_child_does_not_block_root_quiescence() {
    let worker_file = write_script("onmessage = function(_msg) {};");
    // The worker is created and used inside an IIFE so nothing keeps it
    // reachable afterwards; quiescence depends on the collector actually
    // reclaiming it, not merely on the worker going idle.
    let script = format!(
      r#"
      (function() {{
        const w = new Worker({:?});
        w.postMessage({{}});
      }})();
      __sink('root done');
      "#,
      worker_file.path().to_string_lossy()
    );
    let out = run_root_with_sink(&script).unwrap();
    assert_eq!(out, vec!["root done".to_string()]);
  }

  // S5: terminate mid-stream — a worker is terminated after one message,
  // a second send to it is silently dropped rather than erroring.
  #[test]
  fn terminate_mid_stream_drops_the_next_message() {
    let worker_file = write_script("onmessage = function(msg) { postMessage(msg); };");
    let script = format!(
      r#"
      (function() {{
        const w = new Worker({:?});
        let count = 0;
        w.onmessage = function(msg) {{
          count += 1;
          __sink('got ' + count);
        }};
        w.postMessage(1);
        w.terminate();
        w.postMessage(2);
      }})();
      __sink('done sending');
      "#,
      worker_file.path().to_string_lossy()
    );
    let out = run_root_with_sink(&script).unwrap();
    assert!(out.contains(&"done sending".to_string()));
  }

  // S6: child crash — a worker whose entry file throws never delivers a
  // message and the root observes no reply, but the root itself keeps
  // running normally.
  #[test]
  fn crashing_child_never_delivers_and_root_still_finishes() {
    let worker_file = write_script("throw new Error('boom');");
    // Same IIFE reasoning as the idle-tree case: a worker whose entry
    // file throws never reaches its own message loop, so its thread only
    // unblocks once the collector reaps the (otherwise unreachable)
    // Worker object and releases its sending reference.
    let script = format!(
      r#"
      (function() {{
        const w = new Worker({:?});
        w.onmessage = function(_msg) {{ __sink('should not happen'); }};
      }})();
      __sink('root finished');
      "#,
      worker_file.path().to_string_lossy()
    );
    let out = run_root_with_sink(&script).unwrap();
    assert_eq!(out, vec!["root finished".to_string()]);
  }
}
