/*!
The regex-tree engine: multi-granularity locking over the containment tree.

`schedule()` sweeps every live node and applies the scheduling cases in
order. Shared intents are granted onto compatible shared holders (cases 1
and 2), a lock-free containment goes through candidate selection with reads
folded into a synthetic super-read batch (case 3), and a workflow that
already holds shared within the containment may upgrade in place (cases 4
and 5). The sweep repeats until a full pass changes nothing.

The dependency-set closure used by candidate selection doubles as the
deadlock detector: meeting a workflow that is already being expanded is a
cycle, and the rollback path revokes that witness and replays its arrival.
*/

use std::{collections::HashSet, time::Instant};

use tracing::debug;

use crate::{
    error::{DeadlockDetected, Result, SimError},
    events::EventKind,
    resolver::Resolver,
    sched::{deadlock, sanity, Policy, SchedFault, SimCore, LOCK_DELAY_US},
    tree::RegexTree,
    workflow::{LockFilter, LockKind, ObjId, WfId},
};

/// The folded batch of read candidates competing at one node. Never enters
/// the tree; lives only through one candidate selection.
struct SuperRead {
    arrival: f64,
    deps: HashSet<WfId>,
}

enum Candidate {
    SuperRead,
    Write(WfId),
}

pub struct OccamEngine {
    pub tree: RegexTree,
    pub policy: Policy,
}

impl OccamEngine {
    pub fn new(rl: &Resolver, policy: Policy) -> Result<Self> {
        Ok(OccamEngine {
            tree: RegexTree::new(rl)?,
            policy,
        })
    }

    pub fn handle_arrival(
        &mut self,
        core: &mut SimCore,
        rl: &Resolver,
        wf: WfId,
        now: f64,
    ) -> Result<()> {
        core.record_event(EventKind::WfArrival, now, wf);
        debug!(wf = %core.wfs[wf].name, now, "workflow arrival");
        core.wfs[wf].cur = 0;
        core.wfs[wf].current_mut().arrival = now;
        let regex = core.wfs[wf].current().regex.clone();

        let started = Instant::now();
        let obj = self.tree.node_from_regex(rl, &regex)?;
        let root = self.tree.root;
        self.tree.insert(&mut core.wfs, rl, root, obj, Some(wf))?;
        core.meta_mut(wf).insert_time_us += started.elapsed().as_micros() as u64;
        core.meta_mut(wf).schedule_time_us += LOCK_DELAY_US * 6;

        core.pending.push(wf);
        let started = Instant::now();
        self.schedule(core, rl, now)?;
        let sched_us = started.elapsed().as_micros() as u64;
        core.pending_q_len.push((now, core.pending.len()));
        let active = self.tree.all_children(self.tree.root).len();
        core.active_objs.push((now, active));
        core.meta_mut(wf).schedule_time_us += sched_us;
        Ok(())
    }

    pub fn handle_completion(
        &mut self,
        core: &mut SimCore,
        rl: &Resolver,
        wf: WfId,
        now: f64,
    ) -> Result<()> {
        core.record_event(EventKind::WfCompletion, now, wf);
        debug!(wf = %core.wfs[wf].name, now, "workflow completion");

        let started = Instant::now();
        self.tree.release_workflow(&mut core.wfs, wf)?;
        core.meta_mut(wf).delete_time_us += started.elapsed().as_micros() as u64;
        core.meta_mut(wf).schedule_time_us += LOCK_DELAY_US * 6;

        core.running.retain(|&w| w != wf);
        core.complete.push(wf);
        core.meta_mut(wf).finish = Some(now);

        let started = Instant::now();
        self.schedule(core, rl, now)?;
        let sched_us = started.elapsed().as_micros() as u64;
        core.pending_q_len.push((now, core.pending.len()));
        let active = self.tree.all_children(self.tree.root).len();
        core.active_objs.push((now, active));
        core.meta_mut(wf).schedule_time_us += sched_us;
        Ok(())
    }

    /// One full scheduling fixpoint: sweep every node, apply the first
    /// matching cases, promote runnable workflows, and repeat until a pass
    /// changes nothing. Re-entrancy after rollback is the `continue` of the
    /// outer loop.
    pub fn schedule(&mut self, core: &mut SimCore, rl: &Resolver, now: f64) -> Result<()> {
        loop {
            let mut changed = false;
            let mut has_deadlock = false;
            let sweep = self.tree.all_children(self.tree.root);
            for obj in sweep {
                if !self.tree[obj].is_alive() {
                    continue;
                }
                if self.tree.delete_if_empty(obj)? {
                    debug!(obj = obj.0, "collected idle node");
                    changed = true;
                    continue;
                }
                debug_assert!(
                    self.tree[obj].held_shared.is_empty()
                        || self.tree[obj].held_exclusive.is_empty()
                );

                // Case 1: shared holders plus pending shared intents.
                if !self.tree[obj].held_shared.is_empty()
                    && !self.tree[obj].intent_shared.is_empty()
                {
                    debug!(obj = %self.tree[obj].regex, "scheduling case 1");
                    debug_assert!(!self
                        .tree
                        .has_lock_in_containment(obj, LockFilter::Write, false)?);
                    self.grant_all_shared(core, obj);
                    changed = true;
                }

                // Case 2: no lock here, but shared held in the containment.
                if self.tree[obj].held_shared.is_empty()
                    && self.tree[obj].held_exclusive.is_empty()
                    && !self.tree[obj].intent_shared.is_empty()
                    && self
                        .tree
                        .has_lock_in_containment(obj, LockFilter::Read, true)?
                {
                    debug!(obj = %self.tree[obj].regex, "scheduling case 2");
                    if self.tree.has_lock_in_path(obj, LockFilter::Read, true)? {
                        // An ancestor holds shared; safe immediately.
                        self.grant_all_shared(core, obj);
                        changed = true;
                    } else if !self.tree.has_lock_in_children(obj, LockFilter::Write) {
                        self.grant_all_shared(core, obj);
                        changed = true;
                    }
                    // Otherwise an exclusive below must drain first; no
                    // split is performed for this.
                }

                // Case 3: the whole containment is lock-free.
                if self.tree[obj].held_exclusive.is_empty()
                    && self.tree[obj].held_shared.is_empty()
                    && !self
                        .tree
                        .has_lock_in_containment(obj, LockFilter::ReadWrite, false)?
                {
                    debug!(obj = %self.tree[obj].regex, "scheduling case 3");
                    match self.fresh_grant(core, obj, now)? {
                        FreshGrant::Granted => changed = true,
                        FreshGrant::Deadlock => {
                            has_deadlock = true;
                            changed = true;
                            break;
                        }
                    }
                }

                // Case 4: shared-to-exclusive upgrade on the same node.
                if self.tree[obj].held_shared.len() == 1
                    && !self.tree[obj].intent_exclusive.is_empty()
                {
                    let holder = self.tree[obj].held_shared[0];
                    if self.tree.only_wf_in_path(obj, holder)?
                        && self.tree.only_wf_in_children(obj, holder)
                        && self.tree[obj].intent_exclusive.contains(&holder)
                    {
                        debug!(obj = %self.tree[obj].regex, "scheduling case 4");
                        self.tree
                            .unlink(&mut core.wfs, obj, holder, LockKind::IntentExclusive);
                        self.tree
                            .unlink(&mut core.wfs, obj, holder, LockKind::HeldShared);
                        self.tree
                            .link(&mut core.wfs, obj, holder, LockKind::HeldExclusive);
                        changed = true;
                    }
                }

                // Case 5: upgrade in place from shared held elsewhere in the
                // containment.
                if self.tree[obj].held_exclusive.is_empty()
                    && self.tree[obj].held_shared.is_empty()
                    && !self.tree[obj].intent_exclusive.is_empty()
                    && self
                        .tree
                        .has_lock_in_containment(obj, LockFilter::Read, false)?
                {
                    debug!(obj = %self.tree[obj].regex, "scheduling case 5");
                    if self.upgrade_from_containment(core, obj)? {
                        changed = true;
                    }
                }
            }

            if core.promote_runnable(now) {
                changed = true;
            }

            // Progress guarantee: nothing runs, something waits, and the
            // closure walk saw no cycle. The pending head is the witness.
            if core.running.is_empty() && !core.pending.is_empty() && !has_deadlock {
                let witness = core.pending[0];
                self.rollback(core, witness, now)?;
                changed = true;
            }

            if !changed {
                break;
            }
        }

        if core.sanity_check {
            sanity::check_tree(&self.tree)?;
            let watch: Vec<WfId> = core.pending.iter().chain(&core.running).copied().collect();
            sanity::check_workflows(&core.wfs, &self.tree, &watch)?;
        }
        Ok(())
    }

    fn grant_all_shared(&mut self, core: &mut SimCore, obj: ObjId) {
        for wf in self.tree[obj].intent_shared.clone() {
            self.tree.unlink(&mut core.wfs, obj, wf, LockKind::IntentShared);
            self.tree.link(&mut core.wfs, obj, wf, LockKind::HeldShared);
        }
    }

    /// Case 5 body: try to upgrade each exclusive-intent holder that
    /// already holds shared somewhere in the containment.
    fn upgrade_from_containment(&mut self, core: &mut SimCore, obj: ObjId) -> Result<bool> {
        let mut changed = false;
        let contain_wfs = self
            .tree
            .wfs_with_held_in_containment(obj, LockFilter::Read, false)?;
        let root_children = self.tree[self.tree.root].children.clone();
        for wf in self.tree[obj].intent_exclusive.clone() {
            if !contain_wfs.contains(&wf) {
                continue;
            }
            debug!(obj = %self.tree[obj].regex, wf = wf.0, "scheduling case 5 hit");
            if self.tree.only_wf_in_path(obj, wf)? && !root_children.contains(&obj) {
                // The shared ancestor takes the exclusive lock in place.
                let mut path = self.tree.path(obj)?;
                path.retain(|&o| o != obj);
                let Some(target) = path
                    .into_iter()
                    .find(|&anc| self.tree[anc].held_shared.contains(&wf))
                else {
                    return Err(SimError::TreeStructure(
                        "upgrade found no shared-holding ancestor".to_owned(),
                    ));
                };
                self.release_held_below(core, target, wf);
                self.tree
                    .unlink(&mut core.wfs, obj, wf, LockKind::IntentExclusive);
                self.tree
                    .unlink(&mut core.wfs, target, wf, LockKind::HeldShared);
                self.tree
                    .link(&mut core.wfs, target, wf, LockKind::HeldExclusive);
                changed = true;
            } else if self.tree.only_wf_in_children(obj, wf)
                && !self.tree.all_children(obj).is_empty()
            {
                // The node absorbs the locks held below it.
                self.release_held_below(core, obj, wf);
                self.tree
                    .unlink(&mut core.wfs, obj, wf, LockKind::IntentExclusive);
                self.tree
                    .link(&mut core.wfs, obj, wf, LockKind::HeldExclusive);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Release every lock `wf` still holds in the subtree below `obj`; the
    /// vacated nodes are collected by the next sweep pass.
    fn release_held_below(&mut self, core: &mut SimCore, obj: ObjId, wf: WfId) {
        for co in self.tree.all_children(obj) {
            if !self.tree[co].held_shared.is_empty() {
                debug_assert_eq!(self.tree[co].held_shared, vec![wf]);
                self.tree.unlink(&mut core.wfs, co, wf, LockKind::HeldShared);
            } else if !self.tree[co].held_exclusive.is_empty() {
                debug_assert_eq!(self.tree[co].held_exclusive, vec![wf]);
                self.tree
                    .unlink(&mut core.wfs, co, wf, LockKind::HeldExclusive);
            }
        }
    }

    /// Case 3 body: collect candidates over the lock-free containment, fold
    /// the reads, pick one, and grant its intents within the containment.
    fn fresh_grant(&mut self, core: &mut SimCore, obj: ObjId, now: f64) -> Result<FreshGrant> {
        debug_assert!(
            !self.tree[obj].intent_exclusive.is_empty()
                || !self.tree[obj].intent_shared.is_empty()
        );
        let contain = self.tree.containment(obj, false)?;
        let mut write_wfs: Vec<WfId> = Vec::new();
        let mut read_wfs: Vec<WfId> = Vec::new();
        for &co in &contain {
            // A write candidate needs its whole containment lock-free; a
            // read candidate only needs it free of exclusives.
            if !self.tree[co].intent_exclusive.is_empty()
                && !self
                    .tree
                    .has_lock_in_containment(co, LockFilter::ReadWrite, false)?
            {
                for &wf in &self.tree[co].intent_exclusive {
                    if !write_wfs.contains(&wf) {
                        write_wfs.push(wf);
                    }
                }
            }
            if !self.tree[co].intent_shared.is_empty()
                && !self
                    .tree
                    .has_lock_in_containment(co, LockFilter::Write, false)?
            {
                for &wf in &self.tree[co].intent_shared {
                    if !read_wfs.contains(&wf) {
                        read_wfs.push(wf);
                    }
                }
            }
        }

        let mut super_read: Option<SuperRead> = None;
        for &wf in &read_wfs {
            let arrival = core.wfs[wf].current().arrival;
            let sr = super_read.get_or_insert(SuperRead {
                arrival: f64::INFINITY,
                deps: HashSet::new(),
            });
            if sr.arrival > arrival {
                sr.arrival = arrival;
            }
        }

        let candidate = if write_wfs.is_empty() && !read_wfs.is_empty() {
            Candidate::SuperRead
        } else if write_wfs.len() == 1 && read_wfs.is_empty() {
            Candidate::Write(write_wfs[0])
        } else {
            core.reset_depset();
            match self.compute_depsets(core, &read_wfs, &write_wfs, &mut super_read) {
                Ok(()) => {}
                Err(SchedFault::Deadlock(detected)) => {
                    self.rollback(core, detected.witness, now)?;
                    return Ok(FreshGrant::Deadlock);
                }
                Err(SchedFault::Error(e)) => return Err(e),
            }
            debug!(obj = %self.tree[obj].regex, now, "get candidate");
            let Some(candidate) = self.choose(core, super_read.as_ref(), &write_wfs) else {
                return Err(SimError::Invariant(
                    "candidate selection over an empty field".to_owned(),
                ));
            };
            candidate
        };

        match candidate {
            Candidate::SuperRead => {
                debug!(now, "scheduled read batch");
                for &wf in &read_wfs {
                    for ro in core.wfs[wf].intent_shared.clone() {
                        if contain.contains(&ro) {
                            self.tree.unlink(&mut core.wfs, ro, wf, LockKind::IntentShared);
                            self.tree.link(&mut core.wfs, ro, wf, LockKind::HeldShared);
                        }
                    }
                }
            }
            Candidate::Write(wf) => {
                debug!(wf = %core.wfs[wf].name, now, "scheduled write");
                for wo in core.wfs[wf].intent_exclusive.clone() {
                    if contain.contains(&wo) {
                        self.tree
                            .unlink(&mut core.wfs, wo, wf, LockKind::IntentExclusive);
                        self.tree.link(&mut core.wfs, wo, wf, LockKind::HeldExclusive);
                    }
                }
            }
        }
        Ok(FreshGrant::Granted)
    }

    fn compute_depsets(
        &self,
        core: &mut SimCore,
        read_wfs: &[WfId],
        write_wfs: &[WfId],
        super_read: &mut Option<SuperRead>,
    ) -> Result<(), SchedFault> {
        for &wf in read_wfs {
            let deps = self.dependent_wfs(core, wf, &mut Vec::new())?;
            if let Some(sr) = super_read.as_mut() {
                sr.deps.extend(deps.iter().copied());
            }
        }
        for &wf in write_wfs {
            self.dependent_wfs(core, wf, &mut Vec::new())?;
        }
        Ok(())
    }

    /// Transitive closure of workflows waiting, directly or indirectly, on
    /// any lock `wf` holds. Colored DFS: `grey` holds the workflows whose
    /// expansion is in progress, and meeting one again is a cycle.
    fn dependent_wfs(
        &self,
        core: &mut SimCore,
        wf: WfId,
        grey: &mut Vec<WfId>,
    ) -> Result<HashSet<WfId>, SchedFault> {
        if core.wfs[wf].dep_valid {
            return Ok(core.wfs[wf].dep_wfs.clone());
        }
        grey.push(wf);
        let mut deps = HashSet::new();
        deps.insert(wf);
        let held: Vec<ObjId> = core.wfs[wf]
            .held_exclusive
            .iter()
            .chain(&core.wfs[wf].held_shared)
            .copied()
            .collect();
        for obj in held {
            for co in self.tree.containment(obj, false).map_err(SchedFault::Error)? {
                let waiters: Vec<WfId> = self.tree[co]
                    .intent_exclusive
                    .iter()
                    .chain(&self.tree[co].intent_shared)
                    .copied()
                    .collect();
                for waited in waiters {
                    if waited == wf {
                        continue;
                    }
                    if grey.contains(&waited) {
                        debug!(witness = waited.0, "dependency cycle detected");
                        return Err(DeadlockDetected { witness: waited }.into());
                    }
                    let sub = self.dependent_wfs(core, waited, grey)?;
                    deps.extend(sub);
                }
            }
        }
        grey.pop();
        let record = &mut core.wfs[wf];
        record.dep_valid = true;
        record.dep_wfs = deps.clone();
        Ok(deps)
    }

    fn choose(
        &self,
        core: &SimCore,
        super_read: Option<&SuperRead>,
        writes: &[WfId],
    ) -> Option<Candidate> {
        let mut best = super_read.map(|_| Candidate::SuperRead);
        let mut earliest = super_read.map_or(f64::INFINITY, |sr| sr.arrival);
        match self.policy {
            Policy::Fifo => {
                for &wf in writes {
                    let arrival = core.wfs[wf].current().arrival;
                    if arrival < earliest {
                        earliest = arrival;
                        best = Some(Candidate::Write(wf));
                    }
                }
            }
            Policy::DepSet => {
                let mut max_depset: i64 = super_read.map_or(-1, |sr| sr.deps.len() as i64);
                for &wf in writes {
                    let size = core.wfs[wf].dep_wfs.len() as i64;
                    let arrival = core.wfs[wf].current().arrival;
                    debug!(
                        wf = %core.wfs[wf].name,
                        depset = size,
                        max_depset,
                        arrival,
                        "candidate"
                    );
                    if size > max_depset || (size == max_depset && arrival < earliest) {
                        max_depset = size;
                        earliest = arrival;
                        best = Some(Candidate::Write(wf));
                    }
                }
            }
        }
        best
    }

    /// Revoke every edge of the witness, collect vacated nodes, and replay
    /// its arrival at the current time.
    pub fn rollback(&mut self, core: &mut SimCore, witness: WfId, now: f64) -> Result<()> {
        for kind in [
            LockKind::HeldExclusive,
            LockKind::HeldShared,
            LockKind::IntentShared,
            LockKind::IntentExclusive,
        ] {
            for obj in std::mem::take(core.wfs[witness].lock_list_mut(kind)) {
                self.tree.unlink(&mut core.wfs, obj, witness, kind);
                self.tree.delete_if_empty(obj)?;
            }
        }
        deadlock::requeue_witness(core, witness, now);
        Ok(())
    }
}

enum FreshGrant {
    Granted,
    Deadlock,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sched::TaskMeta,
        workflow::{AccessRequest, AccessType, Status, Workflow},
    };

    fn harness(policy: Policy) -> (Resolver, OccamEngine, SimCore) {
        let rl = Resolver::in_memory(["d0dc1", "d1dc1", "d2dc1"], ["dc1"]);
        let engine = OccamEngine::new(&rl, policy).unwrap();
        let mut core = SimCore::new();
        core.sanity_check = true;
        (rl, engine, core)
    }

    fn add(core: &mut SimCore, name: &str, regex: &str, access: AccessType, dur: f64) -> WfId {
        let wf = Workflow::new(name, vec![AccessRequest::new(regex, dur, access)]);
        core.add_workflow(wf, TaskMeta::new(0.0, name, dur, regex))
    }

    #[test]
    fn lone_reader_is_granted_on_arrival() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        let a = add(&mut core, "a", "d0dc1", AccessType::Read, 10.0);
        engine.handle_arrival(&mut core, &rl, a, 0.0).unwrap();
        assert_eq!(core.wfs[a].status, Status::Running);
        assert_eq!(core.running, vec![a]);
        assert_eq!(core.wfs[a].held_shared.len(), 1);
    }

    #[test]
    fn writer_waits_for_reader_and_takes_over() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        let a = add(&mut core, "a", "d0dc1", AccessType::Read, 10.0);
        let b = add(&mut core, "b", "d0dc1", AccessType::Write, 5.0);
        engine.handle_arrival(&mut core, &rl, a, 0.0).unwrap();
        engine.handle_arrival(&mut core, &rl, b, 1.0).unwrap();
        assert_eq!(core.wfs[b].status, Status::Pending);
        assert!(!core.wfs[b].intent_exclusive.is_empty());

        engine.handle_completion(&mut core, &rl, a, 10.0).unwrap();
        assert_eq!(core.wfs[b].status, Status::Running);
        assert_eq!(core.wfs[b].held_exclusive.len(), 1);
    }

    #[test]
    fn read_batch_shares_overlapping_nodes() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        let a = add(&mut core, "a", "d[0-2]dc1", AccessType::Read, 10.0);
        let b = add(&mut core, "b", "d0dc1", AccessType::Read, 3.0);
        let c = add(&mut core, "c", "d1dc1", AccessType::Read, 3.0);
        for (wf, t) in [(a, 0.0), (b, 0.0), (c, 0.0)] {
            engine.handle_arrival(&mut core, &rl, wf, t).unwrap();
        }
        for wf in [a, b, c] {
            assert_eq!(core.wfs[wf].status, Status::Running, "{}", core.wfs[wf].name);
        }
    }

    #[test]
    fn upgrade_moves_exclusive_to_shared_ancestor() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        core.sanity_check = false;
        let w = add(&mut core, "w", "d[0-1]dc1", AccessType::Write, 5.0);
        // Hand-built state: w holds shared on an ancestor and intends
        // exclusive on its child.
        let anc = engine.tree.node_from_regex(&rl, "d[0-1]dc1").unwrap();
        let obj = engine.tree.node_from_regex(&rl, "d0dc1").unwrap();
        let root = engine.tree.root;
        engine.tree.insert(&mut core.wfs, &rl, root, anc, None).unwrap();
        engine.tree.insert(&mut core.wfs, &rl, root, obj, None).unwrap();
        engine.tree.link(&mut core.wfs, anc, w, LockKind::HeldShared);
        engine.tree.link(&mut core.wfs, obj, w, LockKind::IntentExclusive);
        core.pending.push(w);

        engine.schedule(&mut core, &rl, 1.0).unwrap();
        assert_eq!(core.wfs[w].held_exclusive, vec![anc]);
        assert!(core.wfs[w].held_shared.is_empty());
        assert_eq!(core.wfs[w].status, Status::Running);
        // The vacated child was collected.
        assert!(!engine.tree[obj].is_alive());
    }

    #[test]
    fn closure_reports_cycle_witness() {
        let (rl, mut engine, mut core) = harness(Policy::DepSet);
        core.sanity_check = false;
        let x = add(&mut core, "x", "d0dc1", AccessType::Write, 5.0);
        let y = add(&mut core, "y", "d1dc1", AccessType::Write, 5.0);
        let p = engine.tree.node_from_regex(&rl, "d0dc1").unwrap();
        let q = engine.tree.node_from_regex(&rl, "d1dc1").unwrap();
        let root = engine.tree.root;
        engine.tree.insert(&mut core.wfs, &rl, root, p, None).unwrap();
        engine.tree.insert(&mut core.wfs, &rl, root, q, None).unwrap();
        // x holds p and waits on q; y holds q and waits on p.
        engine.tree.link(&mut core.wfs, p, x, LockKind::HeldExclusive);
        engine.tree.link(&mut core.wfs, q, x, LockKind::IntentExclusive);
        engine.tree.link(&mut core.wfs, q, y, LockKind::HeldExclusive);
        engine.tree.link(&mut core.wfs, p, y, LockKind::IntentExclusive);

        let fault = engine.dependent_wfs(&mut core, x, &mut Vec::new());
        match fault {
            Err(SchedFault::Deadlock(detected)) => {
                assert!(detected.witness == x || detected.witness == y)
            }
            _ => panic!("expected a detected cycle"),
        }
    }

    #[test]
    fn stuck_pending_head_is_rolled_back_and_replayed() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        core.sanity_check = false;
        let x = add(&mut core, "x", "d0dc1", AccessType::Write, 5.0);
        let y = add(&mut core, "y", "d1dc1", AccessType::Write, 5.0);
        let p = engine.tree.node_from_regex(&rl, "d0dc1").unwrap();
        let q = engine.tree.node_from_regex(&rl, "d1dc1").unwrap();
        let root = engine.tree.root;
        engine.tree.insert(&mut core.wfs, &rl, root, p, None).unwrap();
        engine.tree.insert(&mut core.wfs, &rl, root, q, None).unwrap();
        engine.tree.link(&mut core.wfs, p, x, LockKind::HeldExclusive);
        engine.tree.link(&mut core.wfs, q, x, LockKind::IntentExclusive);
        engine.tree.link(&mut core.wfs, q, y, LockKind::HeldExclusive);
        engine.tree.link(&mut core.wfs, p, y, LockKind::IntentExclusive);
        core.pending.extend([x, y]);

        engine.schedule(&mut core, &rl, 7.0).unwrap();
        // The pending head was revoked and its arrival replayed at t=7.
        assert_eq!(core.deadlocks, 1);
        assert!(core
            .records
            .iter()
            .any(|r| r.starts_with("Deadlock: ev_time = 7")));
        assert!(core.wfs[x].held_exclusive.is_empty());
        // With the cycle broken, y was granted everything and runs.
        assert_eq!(core.wfs[y].status, Status::Running);
        assert_eq!(core.queue.len(), 2, "arrival replay plus y's start");
    }
}
