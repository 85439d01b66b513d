// Copyright 2024 the wjs authors. MIT license.

//! A FIFO mailbox with one receiver and potentially many senders (spec
//! §4.B). The original tracks messages as a hand-rolled singly-linked
//! chain under a `pthread_mutex_t`/`pthread_cond_t` pair; a `VecDeque`
//! behind a `Mutex`/`Condvar` is the direct, safe-Rust equivalent FIFO and
//! preserves the same invariants (I1–I5) without hand-rolled pointer
//! chasing. Memory is reclaimed by `Arc`'s reference count rather than by a
//! manual `free()` call — every unit of `refcount` below corresponds to
//! exactly one live `Arc<Port>` clone held by its sender, so dropping the
//! clone (directly, or via a `Worker` wrapper's finalizer) both releases
//! the sending relationship and, once the last clone anywhere is gone,
//! reclaims the port. `refcount` itself stays a plain counter distinct
//! from `Arc`'s strong count because it counts *script-visible sending
//! relationships* (spec invariant I3), not memory ownership.
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use log::debug;

use crate::message::Message;

struct Inner {
  queue: VecDeque<Message>,
  /// Number of script objects that may still send into this port. The
  /// receiving worker itself does not count.
  refcount: usize,
}

/// A mailbox, shared by `Arc` between the worker that drains it and every
/// script object that may still send into it.
pub struct Port {
  inner: Mutex<Inner>,
  cond: Condvar,
  /// Set by the receiver when it has blocked with an empty queue and
  /// (transitively) no active children; cleared by any sender that
  /// enqueues. Readable without `L` so a parent's quiescence collector can
  /// snapshot a child's state without inverting the parent-before-child
  /// lock order (spec §5 "Locking discipline").
  waiting: AtomicBool,
  /// Set by the receiving worker just before teardown. Monotone (I4).
  disconnected: AtomicBool,
  /// Set by `Worker.terminate()`. Monotone (I4).
  terminated: AtomicBool,
}

impl Port {
  pub fn new() -> Arc<Port> {
    Arc::new(Port {
      inner: Mutex::new(Inner { queue: VecDeque::new(), refcount: 0 }),
      cond: Condvar::new(),
      waiting: AtomicBool::new(false),
      disconnected: AtomicBool::new(false),
      terminated: AtomicBool::new(false),
    })
  }

  /// Records a new sending relationship (spec: refcount bumped "by whoever
  /// constructs the sending relationship").
  pub fn add_sender(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.refcount += 1;
  }

  /// Releases a sending relationship. Never frees the port; the receiver's
  /// `cleanup` is the only one that ever tears one down (spec §4.C).
  pub fn release_sending(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.refcount = inner.refcount.saturating_sub(1);
    debug!("released sending reference, refcount now {}", inner.refcount);
    drop(inner);
    // Wakes a receiver blocked waiting to learn that the last possible
    // sender has gone away.
    self.cond.notify_one();
  }

  pub fn refcount(&self) -> usize {
    self.inner.lock().unwrap().refcount
  }

  pub fn is_waiting(&self) -> bool {
    self.waiting.load(Ordering::Acquire)
  }

  pub fn is_disconnected(&self) -> bool {
    self.disconnected.load(Ordering::Acquire)
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated.load(Ordering::Acquire)
  }

  pub fn has_pending(&self) -> bool {
    !self.inner.lock().unwrap().queue.is_empty()
  }

  /// Marks the receiving side gone. Called by `cleanup` just before
  /// waiting out the remaining senders; does not itself need the lock
  /// since it is a monotone, atomically-readable flag (spec §5).
  pub fn mark_disconnected(&self) {
    self.disconnected.store(true, Ordering::Release);
  }

  /// Blocks until `refcount` drops to zero (spec §4.C `cleanup`).
  pub fn wait_for_drain(&self) {
    let mut inner = self.inner.lock().unwrap();
    while inner.refcount > 0 {
      inner = self.cond.wait(inner).unwrap();
    }
  }

  /// Cooperative shutdown request (spec §4.F). Idempotent (P7).
  pub fn terminate(&self) {
    if self.terminated.swap(true, Ordering::AcqRel) {
      return;
    }
    let _inner = self.inner.lock().unwrap();
    self.cond.notify_one();
  }

  /// Posts a message into the port (spec §4.B `send`). Returns `false`
  /// without error if the receiver is already `terminated` or
  /// `disconnected` — this is the designed "no backpressure, no delivery
  /// guarantee after termination" contract (spec §7(c)), not a failure.
  pub fn send(&self, msg: Message) -> bool {
    let mut inner = self.inner.lock().unwrap();
    if self.terminated.load(Ordering::Acquire) || self.disconnected.load(Ordering::Acquire) {
      debug!("dropping message, receiver is down");
      return false;
    }
    self.waiting.store(false, Ordering::Release);
    let was_empty = inner.queue.is_empty();
    inner.queue.push_back(msg);
    drop(inner);
    if was_empty {
      // Only need to wake the receiver on an empty-to-non-empty
      // transition; it only ever sleeps on the condvar when the queue is
      // empty and it holds the lock.
      self.cond.notify_one();
    }
    true
  }

  /// The quiescence-aware receive primitive (spec §4.E `pop_blocking`).
  ///
  /// `collect` is invoked with this port's lock held (and, when `parent`
  /// is `Some`, with the parent's lock *also* held, acquired first per the
  /// global parent-before-child lock order) to walk this context's live
  /// children and decide whether they are all quiescent. It must not
  /// itself try to acquire `self`'s or `parent`'s lock.
  pub fn pop_blocking<F>(
    self: &Arc<Port>,
    parent: Option<&Arc<Port>>,
    mut collect: F,
  ) -> Option<Message>
  where
    F: FnMut() -> bool,
  {
    let mut guard = self.inner.lock().unwrap();

    if self.terminated.load(Ordering::Acquire) {
      debug!("pop_blocking: already terminated");
      return None;
    }

    if guard.queue.is_empty() && guard.refcount > 0 {
      match parent {
        Some(parent_port) => {
          // Release and reacquire in the global parent-before-child
          // order so the parent's next `collect` pass sees a consistent
          // snapshot, with no lost wakeup on the parent's condvar.
          drop(guard);
          let parent_guard = parent_port.inner.lock().unwrap();
          guard = self.inner.lock().unwrap();
          let mut waiting = collect();
          // refcount == 1 means only the parent itself references this
          // port, i.e. there are no children left to wait on.
          waiting |= guard.refcount == 1;
          if guard.queue.is_empty() && waiting {
            debug!("marking waiting and signalling parent");
            self.waiting.store(true, Ordering::Release);
            parent_port.cond.notify_one();
          }
          drop(parent_guard);
        }
        None => {
          // Root: try to collect children and give up now if they are
          // all idle.
          if collect() {
            return None;
          }
        }
      }

      if guard.queue.is_empty() && guard.refcount > 0 {
        debug!("sleeping on port ({} senders)", guard.refcount);
        guard = self.cond.wait(guard).unwrap();
      }
      debug_assert!(!self.waiting.load(Ordering::Acquire) || guard.queue.is_empty());
    }

    if guard.queue.is_empty() {
      debug!("pop_blocking: exiting with no messages");
      return None;
    }
    let msg = guard.queue.pop_front();
    debug_assert!(msg.is_some());
    msg
  }
}

#[cfg(debug_assertions)]
impl Drop for Port {
  fn drop(&mut self) {
    let inner = self.inner.get_mut().unwrap();
    debug_assert_eq!(
      inner.refcount, 0,
      "port freed while {} sending references remain (I3)",
      inner.refcount
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Receiver;

  fn msg(n: u32) -> Message {
    Message::new(format!("{{\"n\":{n}}}"), Receiver::Global)
  }

  #[test]
  fn send_then_pop_is_fifo() {
    let p = Port::new();
    p.add_sender();
    assert!(p.send(msg(0)));
    assert!(p.send(msg(1)));
    assert!(p.send(msg(2)));
    let m0 = p.pop_blocking(None, || false).unwrap();
    let m1 = p.pop_blocking(None, || false).unwrap();
    let m2 = p.pop_blocking(None, || false).unwrap();
    assert_eq!(m0.contents(), r#"{"n":0}"#);
    assert_eq!(m1.contents(), r#"{"n":1}"#);
    assert_eq!(m2.contents(), r#"{"n":2}"#);
    p.release_sending();
  }

  #[test]
  fn send_after_terminate_is_dropped_silently() {
    let p = Port::new();
    p.add_sender();
    p.terminate();
    assert!(!p.send(msg(0)));
  }

  #[test]
  fn send_after_disconnect_is_dropped_silently() {
    let p = Port::new();
    p.add_sender();
    p.mark_disconnected();
    assert!(!p.send(msg(0)));
  }

  #[test]
  fn terminate_is_idempotent() {
    let p = Port::new();
    p.terminate();
    p.terminate();
    assert!(p.is_terminated());
  }

  #[test]
  fn root_pop_blocking_exits_when_collect_reports_quiescent() {
    let p = Port::new();
    p.add_sender();
    let result = p.pop_blocking(None, || true);
    assert!(result.is_none());
  }

  #[test]
  fn pop_blocking_with_no_senders_and_empty_queue_returns_none() {
    let p = Port::new();
    let result = p.pop_blocking(None, || false);
    assert!(result.is_none());
  }

  #[test]
  fn release_sending_wakes_a_blocked_receiver() {
    use std::thread;
    use std::time::Duration;

    let p = Port::new();
    p.add_sender();
    let p2 = Arc::clone(&p);
    let handle = thread::spawn(move || p2.pop_blocking(None, || false));
    thread::sleep(Duration::from_millis(50));
    p.release_sending();
    let result = handle.join().unwrap();
    assert!(result.is_none());
  }
}
