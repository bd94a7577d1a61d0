//! Workflow records and their lock-set bookkeeping.
//!
//! Workflows and lock objects reference each other through plain arena
//! indices ([`WfId`], [`ObjId`]); the forward and reverse edges are kept in
//! lock step by the link/unlink helpers of the owning engine, which makes
//! the bidirectional-consistency invariant a linear check.

use std::collections::HashSet;

/// Arena index of a workflow.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WfId(pub u32);

/// Arena index of a lock object: a containment-tree node for the regex-tree
/// engine, a per-device or per-datacenter object for the baselines.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Read,
    Write,
}

/// Lock-kind filter for containment queries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockFilter {
    Read,
    Write,
    ReadWrite,
}

/// The four lock categories an edge can be in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockKind {
    HeldShared,
    HeldExclusive,
    IntentShared,
    IntentExclusive,
}

impl LockKind {
    pub const ALL: [LockKind; 4] = [
        LockKind::HeldShared,
        LockKind::HeldExclusive,
        LockKind::IntentShared,
        LockKind::IntentExclusive,
    ];
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    /// Some requested lock is still an intent.
    Pending,
    /// All requested locks are held.
    Running,
}

#[derive(Clone, Debug)]
pub struct AccessRequest {
    pub regex: String,
    pub duration: f64,
    pub access: AccessType,
    pub arrival: f64,
}

impl AccessRequest {
    pub fn new(regex: impl Into<String>, duration: f64, access: AccessType) -> Self {
        AccessRequest {
            regex: regex.into(),
            duration,
            access,
            arrival: -1.0,
        }
    }
}

#[derive(Debug)]
pub struct Workflow {
    pub name: String,
    /// The ordered access requests. The model admits several, but only the
    /// first is ever exercised; see `Workflow::is_last_request`.
    pub requests: Vec<AccessRequest>,
    pub cur: usize,
    pub status: Status,
    pub held_shared: Vec<ObjId>,
    pub held_exclusive: Vec<ObjId>,
    pub intent_shared: Vec<ObjId>,
    pub intent_exclusive: Vec<ObjId>,
    /// Cached dependency set, valid while `dep_valid` holds.
    pub dep_wfs: HashSet<WfId>,
    pub dep_valid: bool,
}

impl Workflow {
    pub fn new(name: impl Into<String>, requests: Vec<AccessRequest>) -> Self {
        assert!(!requests.is_empty(), "a workflow needs at least one request");
        Workflow {
            name: name.into(),
            requests,
            cur: 0,
            status: Status::Pending,
            held_shared: Vec::new(),
            held_exclusive: Vec::new(),
            intent_shared: Vec::new(),
            intent_exclusive: Vec::new(),
            dep_wfs: HashSet::new(),
            dep_valid: false,
        }
    }

    pub fn current(&self) -> &AccessRequest {
        &self.requests[self.cur]
    }

    pub fn current_mut(&mut self) -> &mut AccessRequest {
        &mut self.requests[self.cur]
    }

    /// A workflow can run exactly when no request is still an intent.
    pub fn runnable(&self) -> bool {
        self.intent_shared.is_empty() && self.intent_exclusive.is_empty()
    }

    pub fn is_last_request(&self) -> bool {
        self.cur == self.requests.len() - 1
    }

    /// Clear all mutable state except the name and the request list. Used on
    /// deadlock rollback before the arrival is replayed.
    pub fn reset(&mut self) {
        self.cur = 0;
        self.status = Status::Pending;
        self.held_shared.clear();
        self.held_exclusive.clear();
        self.intent_shared.clear();
        self.intent_exclusive.clear();
        self.dep_wfs.clear();
        self.dep_valid = false;
    }

    pub fn lock_list(&self, kind: LockKind) -> &Vec<ObjId> {
        match kind {
            LockKind::HeldShared => &self.held_shared,
            LockKind::HeldExclusive => &self.held_exclusive,
            LockKind::IntentShared => &self.intent_shared,
            LockKind::IntentExclusive => &self.intent_exclusive,
        }
    }

    pub fn lock_list_mut(&mut self, kind: LockKind) -> &mut Vec<ObjId> {
        match kind {
            LockKind::HeldShared => &mut self.held_shared,
            LockKind::HeldExclusive => &mut self.held_exclusive,
            LockKind::IntentShared => &mut self.intent_shared,
            LockKind::IntentExclusive => &mut self.intent_exclusive,
        }
    }
}

#[derive(Default)]
pub struct WfArena {
    items: Vec<Workflow>,
}

impl WfArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, wf: Workflow) -> WfId {
        let id = WfId(self.items.len() as u32);
        self.items.push(wf);
        id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = WfId> {
        (0..self.items.len() as u32).map(WfId)
    }
}

impl std::ops::Index<WfId> for WfArena {
    type Output = Workflow;

    fn index(&self, id: WfId) -> &Workflow {
        &self.items[id.0 as usize]
    }
}

impl std::ops::IndexMut<WfId> for WfArena {
    fn index_mut(&mut self, id: WfId) -> &mut Workflow {
        &mut self.items[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runnable_tracks_intent_lists() {
        let mut wf = Workflow::new(
            "0_vmhandler",
            vec![AccessRequest::new("d0dc1", 5.0, AccessType::Write)],
        );
        assert!(wf.runnable());
        wf.intent_exclusive.push(ObjId(3));
        assert!(!wf.runnable());
        wf.reset();
        assert!(wf.runnable());
        assert_eq!(wf.status, Status::Pending);
        assert_eq!(wf.requests.len(), 1);
    }
}
