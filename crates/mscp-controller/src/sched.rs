//! Discrete-event scheduling.
//!
//! All controller activity is cooperative: pending work schedules itself to
//! resume after a simulated delay, and [`crate::MscpController::tick`] fires
//! whatever is due. Events are plain state-carrying values, not suspended
//! stacks; ties break in insertion order so replays are deterministic.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    /// Advance the host queues: one command, idle-unit FIFOs, one response.
    QueSvc,
    /// Run one transfer chunk for a unit.
    UnitSvc(usize),
    /// Periodic host-access supervision.
    Tmr,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<(u64, u64, Event)>>,
    seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: u64, ev: Event) {
        self.heap.push(Reverse((deadline, self.seq, ev)));
        self.seq += 1;
    }

    /// Pop the next event due at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<Event> {
        match self.heap.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => {
                let Reverse((_, _, ev)) = self.heap.pop().unwrap();
                Some(ev)
            }
            _ => None,
        }
    }

    pub fn is_scheduled(&self, ev: Event) -> bool {
        self.heap.iter().any(|Reverse((_, _, e))| *e == ev)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
