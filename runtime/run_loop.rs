// Copyright 2024 the wjs authors. MIT license.

//! The per-context message loop (spec §4.D), grounded on
//! `run_message_loop` in the original: pop one message, dispatch it,
//! recompute quiescence, and either stop (root, quiescent) or keep going
//! (anyone, while still referenced).

use std::sync::Arc;

use deno_core::v8;
use deno_core::JsRuntime;
use log::debug;

use crate::context::HeapStash;
use crate::error::WorkerError;
use crate::message::Message;
use crate::message::Receiver;
use crate::port::Port;
use crate::quiescence;

/// Drains `port` until the context is torn down (worker) or provably
/// quiescent (root). `parent`, when present, is this context's own
/// parent's port, passed through to [`Port::pop_blocking`] so the
/// locking discipline in spec §5 is observed.
pub fn run(runtime: &mut JsRuntime, port: &Arc<Port>, parent: Option<&Arc<Port>>) -> Result<(), WorkerError> {
  loop {
    let message = port.pop_blocking(parent, || quiescence::collect(runtime));

    if let Some(message) = message {
      if !port.is_terminated() {
        dispatch(runtime, message)?;
      }
    }

    if port.is_terminated() {
      debug!("run loop observed termination, exiting");
      break;
    }

    // Always recompute quiescence once more, win or lose on the message
    // above, exactly as the original does unconditionally at the bottom
    // of its loop body.
    let quiescent = quiescence::collect(runtime) && !port.has_pending();
    if parent.is_none() && quiescent {
      debug!("root context is quiescent, exiting run loop");
      break;
    }

    if port.refcount() == 0 {
      debug!("no senders remain, exiting run loop");
      break;
    }
  }
  Ok(())
}

fn dispatch(runtime: &mut JsRuntime, message: Message) -> Result<(), WorkerError> {
  match message.receiver() {
    Receiver::Global => dispatch_to_global(runtime, message.contents()),
    Receiver::Worker(id) => dispatch_to_worker(runtime, id, message.contents()),
  }
}

fn dispatch_to_global(runtime: &mut JsRuntime, json: &str) -> Result<(), WorkerError> {
  let scope = &mut runtime.handle_scope();
  let Some(value) = parse_json(scope, json) else {
    return Err(WorkerError::Js("message payload was not valid JSON".to_string()));
  };

  let global = scope.get_current_context().global(scope);
  let on_message = get_callable(scope, global.into(), "onmessage");
  let Some(on_message) = on_message else {
    debug!("dropping message, no onmessage handler installed");
    return Ok(());
  };
  let undefined = v8::undefined(scope).into();
  on_message
    .call(scope, undefined, &[value])
    .ok_or_else(|| WorkerError::Js("onmessage threw".to_string()))?;
  Ok(())
}

fn dispatch_to_worker(runtime: &mut JsRuntime, id: crate::message::WorkerId, json: &str) -> Result<(), WorkerError> {
  let op_state = runtime.op_state();
  let scope = &mut runtime.handle_scope();
  let target = {
    let state = op_state.borrow();
    let stash = state.borrow::<HeapStash>();
    match stash.child_by_id(id) {
      Some(child) => match &child.root {
        crate::context::ChildRoot::Strong(global) => Some(global.clone()),
        crate::context::ChildRoot::Weak(weak) => weak.to_local(scope).map(|l| v8::Global::new(scope, l)),
      },
      None => None,
    }
  };

  let Some(target) = target else {
    debug!("dropping message, worker {id} has already been collected");
    return Ok(());
  };

  let Some(value) = parse_json(scope, json) else {
    return Err(WorkerError::Js("message payload was not valid JSON".to_string()));
  };

  let object = v8::Local::new(scope, &target);
  let on_message = get_callable(scope, object, "onmessage");
  let Some(on_message) = on_message else {
    debug!("dropping message, worker {id}'s onmessage is not set");
    return Ok(());
  };
  on_message
    .call(scope, object.into(), &[value])
    .ok_or_else(|| WorkerError::Js("onmessage threw".to_string()))?;
  Ok(())
}

fn parse_json<'s>(scope: &mut v8::HandleScope<'s>, json: &str) -> Option<v8::Local<'s, v8::Value>> {
  let source = v8::String::new(scope, json)?;
  v8::json::parse(scope, source)
}

fn get_callable<'s>(
  scope: &mut v8::HandleScope<'s>,
  receiver: v8::Local<'s, v8::Value>,
  name: &str,
) -> Option<v8::Local<'s, v8::Function>> {
  let object = v8::Local::<v8::Object>::try_from(receiver).ok()?;
  let key = v8::String::new(scope, name)?;
  let value = object.get(scope, key.into())?;
  v8::Local::<v8::Function>::try_from(value).ok()
}
