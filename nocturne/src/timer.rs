//! Indexed min-heap of per-connection deadlines.
//!
//! The heap arena is paired with an id → position map that is updated on
//! every swap, so a live connection's deadline can be adjusted in place with
//! a directional sift instead of a delete-and-reinsert. Owned and driven by
//! the reactor thread only; it is not thread-safe.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnMut() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: TimeoutCallback,
}

#[derive(Default)]
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    positions: HashMap<RawFd, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a deadline for `id`, or replace the existing node's deadline
    /// and callback in place.
    pub fn add(&mut self, id: RawFd, timeout: Duration, cb: TimeoutCallback) {
        let expires = Instant::now() + timeout;
        match self.positions.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.positions.insert(id, i);
                self.heap.push(TimerNode { id, expires, cb });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = cb;
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Extend the deadline of a live node; the callback is preserved.
    pub fn adjust(&mut self, id: RawFd, timeout: Duration) {
        if let Some(i) = self.positions.get(&id).copied() {
            self.heap[i].expires = Instant::now() + timeout;
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        }
    }

    /// Fire `id`'s callback now and remove its node.
    pub fn do_work(&mut self, id: RawFd) {
        if let Some(i) = self.positions.get(&id).copied() {
            (self.heap[i].cb)();
            self.delete(i);
        }
    }

    /// Fire every expired node.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            (self.heap[0].cb)();
            self.pop();
        }
    }

    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.delete(0);
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.positions.clear();
    }

    /// Run expired callbacks, then return milliseconds until the next
    /// deadline (clamped at 0), or -1 when no timers are pending.
    pub fn next_tick_ms(&mut self) -> i64 {
        self.tick();
        match self.heap.first() {
            None => -1,
            Some(root) => root
                .expires
                .saturating_duration_since(Instant::now())
                .as_millis() as i64,
        }
    }

    /// Swap-with-last removal, then sift from the vacated slot.
    fn delete(&mut self, index: usize) {
        let last = self.heap.len() - 1;
        if index < last {
            self.swap_nodes(index, last);
            self.positions.remove(&self.heap[last].id);
            self.heap.pop();
            if !self.sift_down(index, self.heap.len()) {
                self.sift_up(index);
            }
        } else {
            self.positions.remove(&self.heap[last].id);
            self.heap.pop();
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true when the node moved down at all.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.positions.insert(self.heap[i].id, i);
        self.positions.insert(self.heap[j].id, j);
    }
}
