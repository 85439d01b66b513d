// Copyright 2024 the wjs authors. MIT license.

//! The script-visible surface: the `Worker` constructor/prototype and the
//! two global bindings (`postMessage`, `closing`) a worker context sees
//! (spec §4.F). Grounded on `init_workers`/`prepare_onmessage` in the
//! original and on the `#[op2]` binding style used throughout
//! `deno_runtime`'s extensions.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::anyhow::anyhow;
use deno_core::anyhow::Error as AnyError;
use deno_core::op2;
use deno_core::v8;
use deno_core::Extension;
use deno_core::OpState;
use log::debug;

use crate::context::ChildRoot;
use crate::context::ChildSlot;
use crate::context::HeapStash;
use crate::message::Message;
use crate::message::Receiver;
use crate::message::WorkerId;
use crate::worker;

/// `new Worker(file)`. Spawns the child thread, records a strongly-rooted
/// `ChildSlot` keyed by the returned id, and bumps the child's receive
/// port refcount once for this `Worker` object (spec §4.F `spawn_worker`).
#[op2]
#[bigint]
fn op_worker_new(
  state: Rc<RefCell<OpState>>,
  scope: &mut v8::HandleScope,
  #[string] file: String,
  this: v8::Local<v8::Object>,
) -> Result<u64, AnyError> {
  let mut state = state.borrow_mut();
  let stash = state.borrow_mut::<HeapStash>();
  let parent_port = stash.default_port.clone();

  let handle = worker::spawn(parent_port, PathBuf::from(file)).map_err(|e| anyhow!(e))?;
  handle.receive_port.add_sender();

  let global = v8::Global::new(scope, this);
  let id = handle.id;
  stash.children.push(ChildSlot {
    id,
    handle,
    root: ChildRoot::Strong(global),
    collected: Arc::new(std::sync::atomic::AtomicBool::new(false)),
  });
  debug!("constructed worker {id}");
  Ok(id_to_bigint(id))
}

/// `Worker.prototype.postMessage(v)`. Per `post_message_method` in the
/// original, this is a *downward* send: the message's receiver is the
/// child's own global `onMessage`, not anything addressed to "the Worker
/// object", so it always carries `Receiver::Global` into the child's own
/// `receive_port`.
#[op2]
fn op_worker_post_message(
  state: Rc<RefCell<OpState>>,
  scope: &mut v8::HandleScope,
  #[bigint] id: u64,
  value: v8::Local<v8::Value>,
) -> Result<(), AnyError> {
  let id = id_from_bigint(id);
  let json = stringify(scope, value)?;

  let mut state = state.borrow_mut();
  let stash = state.borrow_mut::<HeapStash>();
  let Some(child) = stash.child_by_id(id) else {
    debug!("postMessage to unknown or already-collected worker {id}");
    return Ok(());
  };
  child.handle.receive_port.send(Message::new(json, Receiver::Global));
  Ok(())
}

/// `Worker.prototype.terminate()`. Idempotent (spec P7, `terminate_method`
/// early-return).
#[op2(fast)]
fn op_worker_terminate(state: Rc<RefCell<OpState>>, #[bigint] id: u64) {
  let id = id_from_bigint(id);
  let mut state = state.borrow_mut();
  let stash = state.borrow_mut::<HeapStash>();
  if let Some(child) = stash.child_by_id(id) {
    child.handle.receive_port.terminate();
  }
}

/// Global `postMessage(v)`, available only inside a worker context. An
/// *upward* send: receiver is this worker's own id, routed into the
/// parent's port so the parent's dispatcher knows which `Worker` object's
/// `onmessage` to invoke (spec `post_message_global`).
#[op2]
fn op_global_post_message(
  state: Rc<RefCell<OpState>>,
  scope: &mut v8::HandleScope,
  value: v8::Local<v8::Value>,
) -> Result<(), AnyError> {
  let json = stringify(scope, value)?;
  let state = state.borrow();
  let stash = state.borrow::<HeapStash>();
  let Some(record) = &stash.worker_record else {
    return Err(anyhow!("postMessage is not defined"));
  };
  record.parent_port.send(Message::new(json, Receiver::Worker(record.id)));
  Ok(())
}

/// Global `closing()`, available only inside a worker context (spec
/// `get_closing`).
#[op2(fast)]
fn op_worker_is_closing(state: Rc<RefCell<OpState>>) -> bool {
  let state = state.borrow();
  let stash = state.borrow::<HeapStash>();
  stash
    .worker_record
    .as_ref()
    .map(|r| r.receive_port.is_terminated())
    .unwrap_or(false)
}

fn stringify(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Result<String, AnyError> {
  let json = v8::json::stringify(scope, value).ok_or_else(|| anyhow!("value is not JSON-encodable"))?;
  Ok(json.to_rust_string_lossy(scope))
}

fn id_to_bigint(id: WorkerId) -> u64 {
  id.raw()
}

fn id_from_bigint(raw: u64) -> WorkerId {
  WorkerId::from_raw(raw)
}

/// Test-only sink so integration tests can observe what a script did
/// without capturing real stdout (spec's ambient test tooling). Never
/// part of a production runtime: `worker::spawn`/`run_root` never install
/// it.
#[cfg(test)]
pub struct TestSink(pub std::sync::Arc<std::sync::Mutex<Vec<String>>>);

#[cfg(test)]
#[op2(fast)]
fn op_test_sink(state: Rc<RefCell<OpState>>, #[string] msg: String) {
  let state = state.borrow();
  let sink = state.borrow::<TestSink>();
  sink.0.lock().unwrap().push(msg);
}

#[cfg(test)]
pub fn test_sink_extension(sink: std::sync::Arc<std::sync::Mutex<Vec<String>>>) -> (Extension, TestSink) {
  (
    Extension { name: "wjs_test_sink", ops: vec![op_test_sink()].into(), ..Default::default() },
    TestSink(sink),
  )
}

pub fn worker_extension() -> Extension {
  Extension {
    name: "wjs_worker",
    ops: vec![
      op_worker_new(),
      op_worker_post_message(),
      op_worker_terminate(),
      op_global_post_message(),
      op_worker_is_closing(),
    ]
    .into(),
    ..Default::default()
  }
}

/// Installed in every context (spec `init_workers`): the `Worker`
/// constructor and its `postMessage`/`terminate` prototype methods. The
/// finalizer the original wires up on construction has no counterpart
/// here — reclaiming an unreachable `Worker` object is entirely the
/// quiescence collector's job (`crate::quiescence`), triggered off a
/// `v8::Weak` finalizer instead of a script-visible finalizer callback.
pub const ROOT_BOOTSTRAP_JS: &str = r#"
(function() {
  const core = Deno.core;
  class Worker {
    constructor(file) {
      this.__id = core.ops.op_worker_new(String(file), this);
      this.onmessage = null;
    }
    postMessage(value) {
      core.ops.op_worker_post_message(this.__id, value);
    }
    terminate() {
      core.ops.op_worker_terminate(this.__id);
    }
  }
  globalThis.Worker = Worker;
})();
"#;

/// Test-only global wiring `__sink` to [`op_test_sink`].
#[cfg(test)]
pub const TEST_SINK_BOOTSTRAP_JS: &str = r#"
globalThis.__sink = function(value) {
  Deno.core.ops.op_test_sink(typeof value === "string" ? value : JSON.stringify(value));
};
"#;

/// Adds the two worker-only globals on top of [`ROOT_BOOTSTRAP_JS`] (spec
/// `prepare_onmessage`). `closing` is a getter, not a method — matching
/// `get_closing`'s `duk_def_prop(ctx, -3, DUK_DEFPROP_HAVE_GETTER)` in the
/// original, so `if (closing)` reads the current termination state rather
/// than always seeing a truthy function object.
pub const WORKER_BOOTSTRAP_JS: &str = r#"
(function() {
  const core = Deno.core;
  globalThis.postMessage = function(value) {
    core.ops.op_global_post_message(value);
  };
  Object.defineProperty(globalThis, "closing", {
    get() {
      return core.ops.op_worker_is_closing();
    },
  });
  globalThis.onmessage = null;
})();
"#;
