//! Simulation events and the `(time, seq)` min-heap they live in.

use std::{cmp::Reverse, collections::BinaryHeap};

use crate::workflow::WfId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    WfArrival,
    WfCompletion,
    ObjStart,
    ObjEnd,
}

impl EventKind {
    /// The label events carry in the run log.
    pub fn label(self) -> &'static str {
        match self {
            EventKind::WfArrival => "EvWfArrival",
            EventKind::WfCompletion => "EvWfCompletion",
            EventKind::ObjStart => "EvObjStart",
            EventKind::ObjEnd => "EvObjEnd",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SimEvent {
    pub time: f64,
    pub seq: u64,
    pub kind: EventKind,
    pub wf: WfId,
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for SimEvent {}

impl Ord for SimEvent {
    /// Lexicographic on `(time, seq)`: equal-time events dequeue in
    /// insertion order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending events with a monotonically increasing sequence
/// counter owned by the queue, not a process global.
#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<SimEvent>>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: f64, kind: EventKind, wf: WfId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(SimEvent {
            time,
            seq,
            kind,
            wf,
        }));
        seq
    }

    pub fn pop(&mut self) -> Option<SimEvent> {
        self.heap.pop().map(|Reverse(ev)| ev)
    }

    pub fn peek_time(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(ev)| ev.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_times_dequeue_in_insertion_order() {
        let mut q = EventQueue::new();
        q.push(5.0, EventKind::ObjStart, WfId(0));
        q.push(1.0, EventKind::WfArrival, WfId(1));
        q.push(1.0, EventKind::WfArrival, WfId(2));
        q.push(3.0, EventKind::ObjEnd, WfId(3));

        let order: Vec<(f64, WfId)> = std::iter::from_fn(|| q.pop())
            .map(|ev| (ev.time, ev.wf))
            .collect();
        assert_eq!(
            order,
            vec![
                (1.0, WfId(1)),
                (1.0, WfId(2)),
                (3.0, WfId(3)),
                (5.0, WfId(0)),
            ]
        );
    }
}
