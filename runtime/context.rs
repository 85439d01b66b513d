// Copyright 2024 the wjs authors. MIT license.

//! Per-runtime state stashed in `OpState` (spec §4.D "context record").
//!
//! The original keeps this as a handful of hidden properties on the global
//! object, reached through `duk_get_global_string`/the value stack. With
//! `deno_core` the idiomatic place for native, non-script-visible state
//! tied to one `JsRuntime` is `OpState`, so `HeapStash` takes over that
//! role: one instance lives in every runtime's `OpState`, root or worker
//! alike.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use deno_core::v8;

use crate::message::WorkerId;
use crate::worker::WorkerHandle;

/// How a context holds on to one of its children's script-visible `Worker`
/// object across a GC pass (spec §4.D "rooted vs. unrooted").
pub enum ChildRoot {
  /// Strongly rooted: the `Worker` object cannot be collected regardless
  /// of script reachability. The steady state while the child might still
  /// have something to say.
  Strong(v8::Global<v8::Object>),
  /// Demoted to a weak reference with a finalizer pending GC (spec §5,
  /// quiescence detector phase 1). If script still holds its own
  /// reference the object survives the GC pass and phase 3 re-promotes
  /// it; otherwise the finalizer fires and `collected` is set.
  Weak(v8::Weak<v8::Object>),
}

/// Everything a context needs to track about one still-known child
/// worker. Removed once the finalizer confirms collection.
pub struct ChildSlot {
  pub id: WorkerId,
  pub handle: Arc<WorkerHandle>,
  pub root: ChildRoot,
  /// Flipped by the `v8::Weak` finalizer; the next quiescence pass reaps
  /// any slot where this is `true` rather than trying to re-promote it.
  pub collected: Arc<AtomicBool>,
}

/// The native state attached to one `JsRuntime` via `OpState::put`.
pub struct HeapStash {
  /// This context's own receive port — the default port every context is
  /// built around (spec §4.D).
  pub default_port: Arc<crate::port::Port>,
  /// This context's own worker record, if it isn't the root (spec §4.D
  /// "root has no worker record").
  pub worker_record: Option<Arc<WorkerHandle>>,
  /// Every `Worker` object this context has constructed and not yet
  /// reaped.
  pub children: Vec<ChildSlot>,
}

impl HeapStash {
  pub fn new(default_port: Arc<crate::port::Port>, worker_record: Option<Arc<WorkerHandle>>) -> Self {
    HeapStash { default_port, worker_record, children: Vec::new() }
  }

  pub fn child_by_id(&self, id: WorkerId) -> Option<&ChildSlot> {
    self.children.iter().find(|c| c.id == id)
  }
}
