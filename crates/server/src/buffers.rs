//! Bounded capture buffers.
//!
//! `RingBuffer` is count-bounded with oldest-first eviction; the console
//! variant coalesces exact duplicates instead of growing. `ActivityBuffer`
//! is time-windowed and shrinks by age on push and on the broker's periodic
//! sweep, so it drains to empty after a burst with no further traffic.

use std::collections::VecDeque;
use std::time::Duration;

use domlens_protocol::{ConsoleEntry, FlowEvent};

/// Generic bounded, order-preserving buffer with oldest-first eviction.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(128)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in arrival order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }
}

impl RingBuffer<ConsoleEntry> {
    /// Push a console entry, merging an exact duplicate of the most recent
    /// entry (same message + source) into its repeat count instead of
    /// inserting. Bounds log spam without losing the recurrence signal.
    pub fn push_console(&mut self, entry: ConsoleEntry) {
        if let Some(last) = self.entries.back_mut() {
            if last.same_origin(&entry) {
                last.count = last.count.saturating_add(entry.count.max(1));
                return;
            }
        }
        self.push(entry);
    }
}

/// Rolling, time-windowed buffer of recent flow events.
///
/// Entries are aged by broker arrival time, not by the page's self-reported
/// timestamps, so a skewed client clock cannot pin events in the buffer.
#[derive(Debug)]
pub struct ActivityBuffer {
    entries: VecDeque<(u64, FlowEvent)>,
    window_ms: u64,
}

impl ActivityBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn push(&mut self, event: FlowEvent, arrived_ms: u64) {
        self.sweep(arrived_ms);
        self.entries.push_back((arrived_ms, event));
    }

    /// Evict entries older than the window. Called on every push and on a
    /// periodic broker tick, since the buffer must shrink even with no
    /// further traffic.
    pub fn sweep(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some((arrived, _)) = self.entries.front() {
            if *arrived < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &FlowEvent> {
        self.entries.iter().map(|(_, e)| e)
    }
}
