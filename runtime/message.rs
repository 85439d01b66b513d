// Copyright 2024 the wjs authors. MIT license.

//! The immutable envelope exchanged between ports (spec §4.A).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Stable identifier for a `Worker` script object. Stamped once at
/// construction and used to route upward messages back to the right
/// handle, and to look the backing [`crate::worker::WorkerHandle`] up in a
/// context's child-worker set, without the queue ever having to carry a raw
/// V8 pointer across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
  pub(crate) fn next() -> WorkerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    WorkerId(NEXT.fetch_add(1, Ordering::Relaxed))
  }

  /// Encodes the id for passage across the script boundary as a bigint.
  pub fn raw(self) -> u64 {
    self.0
  }

  /// Inverse of [`WorkerId::raw`], used to look a script-supplied id back
  /// up in a context's child set. Never used to mint a fresh id: all ids
  /// originate from [`WorkerId::next`].
  pub fn from_raw(raw: u64) -> WorkerId {
    WorkerId(raw)
  }
}

impl std::fmt::Display for WorkerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "worker-{}", self.0)
  }
}

/// Identifies who should receive a [`Message`] once it reaches the front of
/// a port's queue (spec §4.A, §4.D step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
  /// Deliver to the receiving context's global `onMessage`, called as a
  /// plain function.
  Global,
  /// Deliver to the `Worker` script object identified by this id, called
  /// as a method with that object as `this`.
  Worker(WorkerId),
}

/// A message in flight between two ports. Owns its JSON payload; created by
/// a sender, transferred to exactly one port, and consumed by the receiving
/// run loop (spec I5).
#[derive(Debug)]
pub struct Message {
  contents: String,
  receiver: Receiver,
}

impl Message {
  pub fn new(contents: String, receiver: Receiver) -> Self {
    Message { contents, receiver }
  }

  pub fn contents(&self) -> &str {
    &self.contents
  }

  pub fn receiver(&self) -> Receiver {
    self.receiver
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_carries_payload_and_receiver() {
    let m = Message::new(r#"{"v":1}"#.to_string(), Receiver::Global);
    assert_eq!(m.contents(), r#"{"v":1}"#);
    assert_eq!(m.receiver(), Receiver::Global);
  }

  #[test]
  fn worker_receiver_roundtrips_id() {
    let id = WorkerId::next();
    let m = Message::new("{}".to_string(), Receiver::Worker(id));
    assert_eq!(m.receiver(), Receiver::Worker(id));
  }

  #[test]
  fn worker_ids_are_distinct_and_increasing() {
    let a = WorkerId::next();
    let b = WorkerId::next();
    assert!(b > a);
  }
}
