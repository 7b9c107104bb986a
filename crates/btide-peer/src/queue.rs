//! Request and request queue (`spec.md` §4.6).
//!
//! A request is resolved at most once; any thread waiting on it wakes
//! via its own mutex/condvar pair. The queue itself is a FIFO per
//! target peer guarded by a single mutex and a condition variable
//! whose `ready` flag doubles as a shutdown signal.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use btide_wire::Packet;
use tracing::debug;

use crate::peer::PeerId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestStatus {
    Waiting,
    Success,
    Failed,
}

/// An enqueued outbound packet awaiting delivery to `target` and,
/// where applicable, a correlated response.
pub struct Request {
    pub target: PeerId,
    pub packet: Packet,
    state: Mutex<RequestStatus>,
    cond: Condvar,
}

impl Request {
    #[must_use]
    pub fn new(target: PeerId, packet: Packet) -> Arc<Self> {
        Arc::new(Self {
            target,
            packet,
            state: Mutex::new(RequestStatus::Waiting),
            cond: Condvar::new(),
        })
    }

    #[must_use]
    pub fn status(&self) -> RequestStatus {
        *self.state.lock().expect("request lock poisoned")
    }

    /// Resolve the request. A no-op if it is already resolved, so a
    /// request is never resolved twice (`spec.md` §3 invariant).
    pub fn resolve(&self, status: RequestStatus) {
        let mut state = self.state.lock().expect("request lock poisoned");
        if *state == RequestStatus::Waiting {
            *state = status;
            self.cond.notify_all();
        }
    }

    /// Block until resolved.
    pub fn wait(&self) -> RequestStatus {
        let mut state = self.state.lock().expect("request lock poisoned");
        while *state == RequestStatus::Waiting {
            state = self.cond.wait(state).expect("request lock poisoned");
        }
        *state
    }

    /// Block until resolved or `timeout` elapses, whichever is first.
    pub fn wait_timeout(&self, timeout: Duration) -> RequestStatus {
        let mut state = self.state.lock().expect("request lock poisoned");
        while *state == RequestStatus::Waiting {
            let (guard, result) = self
                .cond
                .wait_timeout(state, timeout)
                .expect("request lock poisoned");
            state = guard;
            if result.timed_out() {
                break;
            }
        }
        *state
    }
}

struct Inner {
    items: VecDeque<Arc<Request>>,
    ready: bool,
}

pub struct RequestQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                ready: true,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append `req` to the tail, mark the queue ready, and wake
    /// anyone blocked waiting for work.
    pub fn enqueue(&self, req: Arc<Request>) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        debug!(target = %req.target, "request enqueued");
        inner.items.push_back(req);
        inner.ready = true;
        self.cond.notify_all();
    }

    /// Detach and return the earliest request targeting `peer`, if
    /// any (`spec.md` §4.6, "next-matching"). Requests for other
    /// peers are left in place, preserving per-peer FIFO order.
    pub fn next_matching(&self, peer: &PeerId) -> Option<Arc<Request>> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let pos = inner.items.iter().position(|r| &r.target == peer)?;
        inner.items.remove(pos)
    }

    /// Non-destructive look at the head of the queue.
    #[must_use]
    pub fn peek(&self) -> Option<Arc<Request>> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .items
            .front()
            .cloned()
    }

    /// Fail every request still queued for `peer` and wake its
    /// waiters; used during peer teardown (`spec.md` §4.7,
    /// "drain-before-exit").
    pub fn drain_for(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            inner.items.drain(..).partition(|r| &r.target == peer);
        inner.items = rest;
        drop(inner);
        for req in &matching {
            req.resolve(RequestStatus::Failed);
        }
        if !matching.is_empty() {
            debug!(peer = %peer, drained = matching.len(), "drained queued requests for peer");
        }
    }

    /// Clear the `ready` flag and wake everyone; a final broadcast for
    /// threads blocked in [`Self::wait_for_ready`].
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.ready = false;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").ready
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btide_wire::Packet;

    fn peer(port: u16) -> PeerId {
        PeerId::new("127.0.0.1", port)
    }

    #[test]
    fn fifo_order_per_target_peer() {
        let q = RequestQueue::new();
        let a1 = Request::new(peer(1), Packet::Png);
        let a2 = Request::new(peer(1), Packet::Png);
        let b1 = Request::new(peer(2), Packet::Png);
        q.enqueue(a1.clone());
        q.enqueue(b1.clone());
        q.enqueue(a2.clone());

        let first = q.next_matching(&peer(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &a1));
        let second = q.next_matching(&peer(1)).unwrap();
        assert!(Arc::ptr_eq(&second, &a2));
        assert!(q.next_matching(&peer(1)).is_none());

        let b = q.next_matching(&peer(2)).unwrap();
        assert!(Arc::ptr_eq(&b, &b1));
    }

    #[test]
    fn drain_for_resolves_failed_and_leaves_others() {
        let q = RequestQueue::new();
        let a = Request::new(peer(1), Packet::Png);
        let b = Request::new(peer(2), Packet::Png);
        q.enqueue(a.clone());
        q.enqueue(b.clone());

        q.drain_for(&peer(1));
        assert_eq!(a.status(), RequestStatus::Failed);
        assert_eq!(b.status(), RequestStatus::Waiting);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn resolve_is_idempotent() {
        let req = Request::new(peer(1), Packet::Png);
        req.resolve(RequestStatus::Success);
        req.resolve(RequestStatus::Failed);
        assert_eq!(req.status(), RequestStatus::Success);
    }

    #[test]
    fn wait_unblocks_on_resolve() {
        use std::thread;

        let req = Request::new(peer(1), Packet::Png);
        let req_clone = req.clone();
        let handle = thread::spawn(move || req_clone.wait());
        thread::sleep(Duration::from_millis(20));
        req.resolve(RequestStatus::Success);
        assert_eq!(handle.join().unwrap(), RequestStatus::Success);
    }
}
