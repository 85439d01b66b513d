// Copyright 2024 the wjs authors. MIT license.

//! The distributed quiescence detector (spec §5).
//!
//! A context is quiescent when its own receive port is empty and every
//! child it still references is itself provably unreachable from script
//! (and therefore will never post anything else). `try_to_collect_workers`
//! in the original drives this by temporarily turning each disconnected-or-
//! waiting child's strong heap reference into a bare pointer, running the
//! collector twice, and seeing which ones survive; survivors get re-rooted,
//! casualties get reaped. `v8::Weak::with_finalizer` plus two
//! `low_memory_notification()` passes is the direct `deno_core` analog of
//! that pointer-swap-then-collect dance: demote to weak, force a GC pass
//! (twice, since V8's incremental marking can need a second nudge to run
//! finalizers scheduled by the first), then see who is still alive.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use deno_core::v8;
use deno_core::JsRuntime;
use log::debug;

use crate::context::ChildRoot;
use crate::context::HeapStash;

/// Runs one pass of the collector over `runtime`'s own `HeapStash` and
/// returns `all_waiting`: whether every child was, at the start of this
/// pass, either `waiting` or `disconnected` (spec §4.E step 5). This is
/// computed from the live port flags, not from whether any `Worker`
/// object actually got reaped by the GC dance below — a script can hold
/// an ordinary reference to an idle `Worker` object forever, and that
/// must not stop quiescence from being observed.
///
/// Deliberately does not look at this context's own port: it is called
/// from inside [`crate::port::Port::pop_blocking`]'s `collect` closure,
/// which may already hold this context's port lock, so touching it here
/// would self-deadlock. Callers combine the result with
/// `own_port.has_pending()` themselves, outside of any lock.
pub fn collect(runtime: &mut JsRuntime) -> bool {
  let all_waiting = demote_idle_children(runtime);
  run_gc_passes(runtime);
  reap_and_repromote(runtime);
  all_waiting
}

fn demote_idle_children(runtime: &mut JsRuntime) -> bool {
  let op_state = runtime.op_state();
  let scope = &mut runtime.handle_scope();
  let mut state = op_state.borrow_mut();
  let stash = state.borrow_mut::<HeapStash>();

  let mut all_waiting = true;
  for child in stash.children.iter_mut() {
    let idle = child.handle.receive_port.is_waiting() || child.handle.receive_port.is_disconnected();
    all_waiting &= idle;
    if !idle {
      continue;
    }
    if let ChildRoot::Strong(global) = &child.root {
      let local = v8::Local::new(scope, global);
      let collected = Arc::clone(&child.collected);
      let receive_port = Arc::clone(&child.handle.receive_port);
      let id = child.id;
      let weak = v8::Weak::with_finalizer(
        scope,
        local,
        Box::new(move |_isolate| {
          // The Worker object is gone: it can never send into its child's
          // receive port again, so this was the last such reference.
          // Releasing it lets the child's own run loop notice
          // `refcount() == 0` and return, the same way finalising a
          // worker releases its sending port in the original.
          debug!("worker {id}'s Worker object was collected");
          receive_port.release_sending();
          collected.store(true, Ordering::Release);
        }),
      );
      child.root = ChildRoot::Weak(weak);
      debug!("demoted worker {} to weak reference", child.id);
    }
  }
  all_waiting
}

fn run_gc_passes(runtime: &mut JsRuntime) {
  // Two passes: the first pass's finalizers can themselves drop the last
  // strong reference to an object that only becomes unreachable as a
  // result, so a single pass can undercount collectible children.
  runtime.v8_isolate().low_memory_notification();
  runtime.v8_isolate().low_memory_notification();
}

/// Drops slots whose finalizer fired — joining their thread, since the
/// finalizer releasing the child's receive-port sending reference is
/// what lets that thread's own run loop notice `refcount() == 0` and
/// return — and re-roots survivors.
fn reap_and_repromote(runtime: &mut JsRuntime) {
  let op_state = runtime.op_state();
  let scope = &mut runtime.handle_scope();
  let mut state = op_state.borrow_mut();
  let stash = state.borrow_mut::<HeapStash>();

  stash.children.retain_mut(|child| {
    if child.collected.load(Ordering::Acquire) {
      debug!("reaped worker {}, joining its thread", child.id);
      child.handle.join();
      return false;
    }
    if let ChildRoot::Weak(weak) = &child.root {
      if let Some(local) = weak.to_local(scope) {
        // Still script-reachable: re-root it strongly for the next
        // round, since it might yet receive or send another message.
        child.root = ChildRoot::Strong(v8::Global::new(scope, local));
        debug!("re-rooted worker {}, still reachable", child.id);
      }
    }
    true
  });
}
