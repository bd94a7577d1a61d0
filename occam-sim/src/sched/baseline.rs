/*!
The baseline engines: one lock object per device or per datacenter.

A workflow's regex expands to its matched units at arrival and an edge is
added per unit, granted eagerly when compatible (shared on shared, anything
on an idle unit) and queued as an intent otherwise. Scheduling then sweeps
the live units, running candidate selection wherever a unit has drained.
*/

use std::{
    collections::{HashMap, HashSet},
    time::Instant,
};

use tracing::debug;

use crate::{
    error::{DeadlockDetected, Result, SimError},
    events::EventKind,
    resolver::Resolver,
    sched::{deadlock, Granularity, Policy, SchedFault, SimCore, LOCK_DELAY_US},
    workflow::{AccessType, LockKind, ObjId, WfArena, WfId},
};

/// A per-device or per-datacenter lock object.
pub struct NetObj {
    pub name: String,
    pub held_shared: Vec<WfId>,
    pub held_exclusive: Vec<WfId>,
    pub intent_shared: Vec<WfId>,
    pub intent_exclusive: Vec<WfId>,
    alive: bool,
}

impl NetObj {
    fn new(name: String) -> Self {
        NetObj {
            name,
            held_shared: Vec::new(),
            held_exclusive: Vec::new(),
            intent_shared: Vec::new(),
            intent_exclusive: Vec::new(),
            alive: true,
        }
    }

    fn lock_list(&self, kind: LockKind) -> &Vec<WfId> {
        match kind {
            LockKind::HeldShared => &self.held_shared,
            LockKind::HeldExclusive => &self.held_exclusive,
            LockKind::IntentShared => &self.intent_shared,
            LockKind::IntentExclusive => &self.intent_exclusive,
        }
    }

    fn lock_list_mut(&mut self, kind: LockKind) -> &mut Vec<WfId> {
        match kind {
            LockKind::HeldShared => &mut self.held_shared,
            LockKind::HeldExclusive => &mut self.held_exclusive,
            LockKind::IntentShared => &mut self.intent_shared,
            LockKind::IntentExclusive => &mut self.intent_exclusive,
        }
    }

    fn has_any_lock(&self) -> bool {
        !self.held_shared.is_empty()
            || !self.held_exclusive.is_empty()
            || !self.intent_shared.is_empty()
            || !self.intent_exclusive.is_empty()
    }
}

enum UnitCandidate {
    /// Grant the whole shared-intent batch.
    Reads,
    Write(WfId),
}

pub struct UnitEngine {
    objs: Vec<NetObj>,
    by_name: HashMap<String, ObjId>,
    /// Insertion-ordered sweep list; dead entries are skipped.
    order: Vec<ObjId>,
    pub granularity: Granularity,
    pub policy: Policy,
    /// At 2 the DepSet baselines collect the sweep's grant decisions and
    /// apply them at once, freezing dependency sets for the sweep.
    pub opt_level: u8,
}

impl UnitEngine {
    pub fn new(granularity: Granularity, policy: Policy) -> Self {
        UnitEngine {
            objs: Vec::new(),
            by_name: HashMap::new(),
            order: Vec::new(),
            granularity,
            policy,
            opt_level: 1,
        }
    }

    pub fn active_objects(&self) -> usize {
        self.by_name.len()
    }

    fn node(&self, id: ObjId) -> &NetObj {
        &self.objs[id.0 as usize]
    }

    fn node_mut(&mut self, id: ObjId) -> &mut NetObj {
        &mut self.objs[id.0 as usize]
    }

    fn link(&mut self, wfs: &mut WfArena, obj: ObjId, wf: WfId, kind: LockKind) {
        debug_assert!(!self.node(obj).lock_list(kind).contains(&wf));
        self.node_mut(obj).lock_list_mut(kind).push(wf);
        wfs[wf].lock_list_mut(kind).push(obj);
    }

    fn unlink(&mut self, wfs: &mut WfArena, obj: ObjId, wf: WfId, kind: LockKind) {
        if let Some(pos) = self.node(obj).lock_list(kind).iter().position(|&w| w == wf) {
            self.node_mut(obj).lock_list_mut(kind).remove(pos);
        }
        if let Some(pos) = wfs[wf].lock_list(kind).iter().position(|&o| o == obj) {
            wfs[wf].lock_list_mut(kind).remove(pos);
        }
    }

    fn get_or_create(&mut self, name: &str) -> ObjId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = ObjId(self.objs.len() as u32);
        self.objs.push(NetObj::new(name.to_owned()));
        self.by_name.insert(name.to_owned(), id);
        self.order.push(id);
        id
    }

    fn delete_if_empty(&mut self, obj: ObjId) {
        if self.node(obj).alive && !self.node(obj).has_any_lock() {
            let name = self.node(obj).name.clone();
            self.by_name.remove(&name);
            self.node_mut(obj).alive = false;
        }
    }

    /// The lock-object names a regex expands to at this granularity.
    fn expand(&self, rl: &Resolver, regex: &str) -> Result<Vec<String>> {
        match self.granularity {
            Granularity::Device => {
                let fsm = rl.fsm_for(regex)?;
                if rl.using_trace {
                    Ok(rl.matched_devices(regex, &fsm).into_iter().collect())
                } else {
                    fsm.strings()
                }
            }
            Granularity::Datacenter => {
                let fsm = rl.fsm_for(regex)?;
                if rl.using_trace {
                    rl.matched_dcs(regex, &fsm)
                } else {
                    let mut out = Vec::new();
                    for s in fsm.strings()? {
                        let dc = match s.find("dc") {
                            Some(at) => s[at..].to_owned(),
                            None => s,
                        };
                        if !out.contains(&dc) {
                            out.push(dc);
                        }
                    }
                    Ok(out)
                }
            }
        }
    }

    /// Grant eagerly when compatible, otherwise record the intent.
    fn add_edges(&mut self, core: &mut SimCore, obj: ObjId, wf: WfId) {
        match core.wfs[wf].current().access {
            AccessType::Read => {
                if self.node(obj).held_exclusive.is_empty() {
                    self.link(&mut core.wfs, obj, wf, LockKind::HeldShared);
                } else {
                    self.link(&mut core.wfs, obj, wf, LockKind::IntentShared);
                }
            }
            AccessType::Write => {
                if self.node(obj).held_exclusive.is_empty()
                    && self.node(obj).held_shared.is_empty()
                {
                    self.link(&mut core.wfs, obj, wf, LockKind::HeldExclusive);
                } else {
                    self.link(&mut core.wfs, obj, wf, LockKind::IntentExclusive);
                }
            }
        }
    }

    fn acquire_lock(&mut self, core: &mut SimCore, rl: &Resolver, wf: WfId) -> Result<()> {
        let regex = core.wfs[wf].current().regex.clone();
        let names = self.expand(rl, &regex)?;
        if names.is_empty() {
            return Err(SimError::Invariant(format!(
                "regex {regex:?} expands to no lock object"
            )));
        }
        let count = names.len() as u64;
        for name in names {
            let obj = self.get_or_create(&name);
            debug_assert!(
                self.node(obj).held_exclusive.is_empty() || self.node(obj).held_shared.is_empty()
            );
            self.add_edges(core, obj, wf);
        }
        core.meta_mut(wf).schedule_time_us += LOCK_DELAY_US * 2 * count * 2;
        Ok(())
    }

    fn release_lock(&mut self, core: &mut SimCore, wf: WfId) {
        let held_sh = std::mem::take(&mut core.wfs[wf].held_shared);
        let held_ex = std::mem::take(&mut core.wfs[wf].held_exclusive);
        for &obj in &held_sh {
            if let Some(pos) = self.node(obj).held_shared.iter().position(|&w| w == wf) {
                self.node_mut(obj).held_shared.remove(pos);
            }
        }
        for &obj in &held_ex {
            if let Some(pos) = self.node(obj).held_exclusive.iter().position(|&w| w == wf) {
                self.node_mut(obj).held_exclusive.remove(pos);
            }
        }
        core.meta_mut(wf).schedule_time_us +=
            LOCK_DELAY_US * (held_sh.len() + held_ex.len()) as u64;
        for obj in held_sh.into_iter().chain(held_ex) {
            self.delete_if_empty(obj);
        }
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
        let started = Instant::now();
        core.pending.push(wf);
        core.wfs[wf].cur = 0;
        core.wfs[wf].current_mut().arrival = now;
        self.acquire_lock(core, rl, wf)?;
        self.schedule(core, now)?;
        let us = started.elapsed().as_micros() as u64;
        core.pending_q_len.push((now, core.pending.len()));
        core.active_objs.push((now, self.by_name.len()));
        core.meta_mut(wf).schedule_time_us += us;
        Ok(())
    }

    pub fn handle_completion(
        &mut self,
        core: &mut SimCore,
        rl: &Resolver,
        wf: WfId,
        now: f64,
    ) -> Result<()> {
        let _ = rl;
        core.record_event(EventKind::WfCompletion, now, wf);
        debug!(wf = %core.wfs[wf].name, now, "workflow completion");
        let started = Instant::now();
        self.release_lock(core, wf);
        core.running.retain(|&w| w != wf);
        core.complete.push(wf);
        core.meta_mut(wf).finish = Some(now);
        self.schedule(core, now)?;
        let us = started.elapsed().as_micros() as u64;
        core.pending_q_len.push((now, core.pending.len()));
        core.active_objs.push((now, self.by_name.len()));
        core.meta_mut(wf).schedule_time_us += us;
        Ok(())
    }

    pub fn schedule(&mut self, core: &mut SimCore, now: f64) -> Result<()> {
        loop {
            let mut has_deadlock = false;
            let mut batch: Vec<(ObjId, Vec<WfId>)> = Vec::new();
            let sweep: Vec<ObjId> = self
                .order
                .iter()
                .copied()
                .filter(|&o| self.node(o).alive)
                .collect();
            debug!(netobjs = sweep.len(), "schedule sweep");
            'sweep: for obj in sweep {
                if !self.node(obj).alive {
                    continue;
                }

                // Shared holders plus shared intents: grant immediately.
                if !self.node(obj).held_shared.is_empty()
                    && !self.node(obj).intent_shared.is_empty()
                {
                    debug!(obj = %self.node(obj).name, "grant shared on shared");
                    self.grant_all_shared(core, obj);
                }

                // Idle unit: candidate selection.
                if self.node(obj).held_exclusive.is_empty()
                    && self.node(obj).held_shared.is_empty()
                {
                    debug_assert!(self.node(obj).has_any_lock());
                    debug!(obj = %self.node(obj).name, now, "get candidate");
                    let chosen = match self.candidate(core, obj) {
                        Ok(c) => c,
                        Err(SchedFault::Deadlock(detected)) => {
                            self.rollback(core, detected.witness, now)?;
                            has_deadlock = true;
                            break 'sweep;
                        }
                        Err(SchedFault::Error(e)) => return Err(e),
                    };
                    if self.opt_level >= 2 && self.policy == Policy::DepSet {
                        let alloc = match chosen {
                            UnitCandidate::Reads => self.node(obj).intent_shared.clone(),
                            UnitCandidate::Write(wf) => vec![wf],
                        };
                        batch.push((obj, alloc));
                    } else {
                        match chosen {
                            UnitCandidate::Reads => self.grant_all_shared(core, obj),
                            UnitCandidate::Write(wf) => {
                                self.unlink(&mut core.wfs, obj, wf, LockKind::IntentExclusive);
                                self.link(&mut core.wfs, obj, wf, LockKind::HeldExclusive);
                            }
                        }
                    }
                }

                // An exclusive holder re-requesting the unit absorbs its own
                // intents.
                if !self.node(obj).held_exclusive.is_empty() {
                    for kind in [LockKind::IntentExclusive, LockKind::IntentShared] {
                        let absorbed: Vec<WfId> = self
                            .node(obj)
                            .lock_list(kind)
                            .iter()
                            .copied()
                            .filter(|w| self.node(obj).held_exclusive.contains(w))
                            .collect();
                        for wf in absorbed {
                            debug!(obj = %self.node(obj).name, "exclusive holder absorbs intent");
                            self.unlink(&mut core.wfs, obj, wf, kind);
                        }
                    }
                }

                // A sole shared holder upgrades to exclusive.
                if !self.node(obj).held_shared.is_empty()
                    && !self.node(obj).intent_exclusive.is_empty()
                {
                    let upgrading: Vec<WfId> = self
                        .node(obj)
                        .intent_exclusive
                        .iter()
                        .copied()
                        .filter(|w| self.node(obj).held_shared.contains(w))
                        .collect();
                    for wf in upgrading {
                        if self.node(obj).held_shared.len() == 1 {
                            debug!(obj = %self.node(obj).name, "shared holder upgrades to exclusive");
                            self.unlink(&mut core.wfs, obj, wf, LockKind::HeldShared);
                            self.unlink(&mut core.wfs, obj, wf, LockKind::IntentExclusive);
                            self.link(&mut core.wfs, obj, wf, LockKind::HeldExclusive);
                        }
                    }
                }
            }

            // Apply the batched decisions at once; dependency sets were
            // frozen for the whole sweep.
            if self.opt_level >= 2 && self.policy == Policy::DepSet {
                for (obj, alloc) in batch {
                    if !self.node(obj).alive {
                        continue;
                    }
                    let read_batch = alloc
                        .first()
                        .map(|&wf| core.wfs[wf].current().access == AccessType::Read)
                        .unwrap_or(false);
                    if read_batch {
                        for &wf in &alloc {
                            self.unlink(&mut core.wfs, obj, wf, LockKind::IntentShared);
                            self.link(&mut core.wfs, obj, wf, LockKind::HeldShared);
                        }
                        self.grant_all_shared(core, obj);
                    } else if let Some(&wf) = alloc.first() {
                        self.unlink(&mut core.wfs, obj, wf, LockKind::IntentExclusive);
                        self.link(&mut core.wfs, obj, wf, LockKind::HeldExclusive);
                    }
                }
            }

            core.promote_runnable(now);

            if core.running.is_empty() && !core.pending.is_empty() && !has_deadlock {
                let witness = core.pending[0];
                self.rollback(core, witness, now)?;
                has_deadlock = true;
            }

            if !has_deadlock {
                return Ok(());
            }
        }
    }

    fn grant_all_shared(&mut self, core: &mut SimCore, obj: ObjId) {
        for wf in self.node(obj).intent_shared.clone() {
            self.unlink(&mut core.wfs, obj, wf, LockKind::IntentShared);
            self.link(&mut core.wfs, obj, wf, LockKind::HeldShared);
        }
    }

    fn candidate(&self, core: &mut SimCore, obj: ObjId) -> Result<UnitCandidate, SchedFault> {
        let ish = self.node(obj).intent_shared.clone();
        let iex = self.node(obj).intent_exclusive.clone();
        match self.policy {
            Policy::Fifo => {
                if iex.is_empty() && !ish.is_empty() {
                    Ok(UnitCandidate::Reads)
                } else if !iex.is_empty() && ish.is_empty() {
                    Ok(UnitCandidate::Write(iex[0]))
                } else if !iex.is_empty() && !ish.is_empty() {
                    let read_arrival = core.wfs[ish[0]].current().arrival;
                    let write_arrival = core.wfs[iex[0]].current().arrival;
                    if read_arrival < write_arrival {
                        Ok(UnitCandidate::Reads)
                    } else {
                        Ok(UnitCandidate::Write(iex[0]))
                    }
                } else {
                    Err(SchedFault::Error(SimError::Invariant(
                        "an idle lock object must carry an intent or be deleted".to_owned(),
                    )))
                }
            }
            Policy::DepSet => {
                if iex.is_empty() && !ish.is_empty() {
                    return Ok(UnitCandidate::Reads);
                }
                if iex.len() == 1 && ish.is_empty() {
                    return Ok(UnitCandidate::Write(iex[0]));
                }
                core.reset_depset();
                debug!(obj = %self.node(obj).name, "compute dependency sets");
                let mut super_read: Option<(f64, HashSet<WfId>)> = None;
                for &wf in &ish {
                    let deps = self.dependent_wfs(core, wf, &mut Vec::new())?;
                    let arrival = core.wfs[wf].current().arrival;
                    let sr = super_read.get_or_insert((f64::INFINITY, HashSet::new()));
                    sr.1.extend(deps);
                    if sr.0 > arrival {
                        sr.0 = arrival;
                    }
                }
                let mut best = super_read.as_ref().map(|_| UnitCandidate::Reads);
                let mut max_depset: i64 =
                    super_read.as_ref().map_or(-1, |sr| sr.1.len() as i64);
                let mut earliest = super_read.as_ref().map_or(f64::INFINITY, |sr| sr.0);
                for &wf in &iex {
                    let size = self.dependent_wfs(core, wf, &mut Vec::new())?.len() as i64;
                    let arrival = core.wfs[wf].current().arrival;
                    debug!(wf = %core.wfs[wf].name, depset = size, max_depset, "candidate");
                    if size > max_depset || (size == max_depset && arrival < earliest) {
                        max_depset = size;
                        earliest = arrival;
                        best = Some(UnitCandidate::Write(wf));
                    }
                }
                best.ok_or_else(|| {
                    SchedFault::Error(SimError::Invariant(
                        "an idle lock object must carry an intent or be deleted".to_owned(),
                    ))
                })
            }
        }
    }

    /// Closure of workflows waiting on any unit `wf` holds. Unlike the tree
    /// engine there is no containment to traverse and no self-edge filter: a
    /// workflow re-requesting a unit it holds closes a one-step cycle.
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
            let waiters: Vec<WfId> = self
                .node(obj)
                .intent_exclusive
                .iter()
                .chain(&self.node(obj).intent_shared)
                .copied()
                .collect();
            for waited in waiters {
                if grey.contains(&waited) {
                    debug!(witness = waited.0, "dependency cycle detected");
                    return Err(DeadlockDetected { witness: waited }.into());
                }
                let sub = self.dependent_wfs(core, waited, grey)?;
                deps.extend(sub);
            }
        }
        grey.pop();
        let record = &mut core.wfs[wf];
        record.dep_valid = true;
        record.dep_wfs = deps.clone();
        Ok(deps)
    }

    pub fn rollback(&mut self, core: &mut SimCore, witness: WfId, now: f64) -> Result<()> {
        for kind in [
            LockKind::HeldExclusive,
            LockKind::HeldShared,
            LockKind::IntentShared,
            LockKind::IntentExclusive,
        ] {
            for obj in std::mem::take(core.wfs[witness].lock_list_mut(kind)) {
                if let Some(pos) = self
                    .node(obj)
                    .lock_list(kind)
                    .iter()
                    .position(|&w| w == witness)
                {
                    self.node_mut(obj).lock_list_mut(kind).remove(pos);
                }
                self.delete_if_empty(obj);
            }
        }
        deadlock::requeue_witness(core, witness, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sched::TaskMeta,
        workflow::{AccessRequest, Status, Workflow},
    };

    fn harness(policy: Policy) -> (Resolver, UnitEngine, SimCore) {
        let rl = Resolver::in_memory(["d0dc1", "d1dc1", "d2dc1"], ["dc1"]);
        let engine = UnitEngine::new(Granularity::Device, policy);
        (rl, engine, SimCore::new())
    }

    fn add(core: &mut SimCore, name: &str, regex: &str, access: AccessType, dur: f64) -> WfId {
        let wf = Workflow::new(name, vec![AccessRequest::new(regex, dur, access)]);
        core.add_workflow(wf, TaskMeta::new(0.0, name, dur, regex))
    }

    #[test]
    fn reads_share_devices_eagerly() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        let a = add(&mut core, "a", "d[0-1]dc1", AccessType::Read, 5.0);
        let b = add(&mut core, "b", "d1dc1", AccessType::Read, 5.0);
        engine.handle_arrival(&mut core, &rl, a, 0.0).unwrap();
        engine.handle_arrival(&mut core, &rl, b, 0.0).unwrap();
        assert_eq!(core.wfs[a].status, Status::Running);
        assert_eq!(core.wfs[b].status, Status::Running);
        assert_eq!(core.wfs[a].held_shared.len(), 2);
        assert_eq!(engine.active_objects(), 2);
    }

    #[test]
    fn writer_queues_behind_each_held_device() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        let a = add(&mut core, "a", "d[0-1]dc1", AccessType::Read, 5.0);
        let b = add(&mut core, "b", "d[0-2]dc1", AccessType::Write, 1.0);
        engine.handle_arrival(&mut core, &rl, a, 0.0).unwrap();
        engine.handle_arrival(&mut core, &rl, b, 1.0).unwrap();
        // d2 was idle and granted eagerly; d0 and d1 are shared-held.
        assert_eq!(core.wfs[b].status, Status::Pending);
        assert_eq!(core.wfs[b].held_exclusive.len(), 1);
        assert_eq!(core.wfs[b].intent_exclusive.len(), 2);

        engine.handle_completion(&mut core, &rl, a, 5.0).unwrap();
        assert_eq!(core.wfs[b].status, Status::Running);
        assert_eq!(core.wfs[b].held_exclusive.len(), 3);
        assert!(core.wfs[b].intent_exclusive.is_empty());
    }

    #[test]
    fn fifo_prefers_earliest_between_read_and_write_heads() {
        let (rl, mut engine, mut core) = harness(Policy::Fifo);
        let a = add(&mut core, "a", "d0dc1", AccessType::Write, 10.0);
        let b = add(&mut core, "b", "d0dc1", AccessType::Write, 1.0);
        let c = add(&mut core, "c", "d0dc1", AccessType::Read, 1.0);
        engine.handle_arrival(&mut core, &rl, a, 0.0).unwrap();
        engine.handle_arrival(&mut core, &rl, b, 1.0).unwrap();
        engine.handle_arrival(&mut core, &rl, c, 2.0).unwrap();
        engine.handle_completion(&mut core, &rl, a, 10.0).unwrap();
        // b arrived before c, so the write wins the drained device.
        assert_eq!(core.wfs[b].status, Status::Running);
        assert_eq!(core.wfs[c].status, Status::Pending);
    }

    #[test]
    fn depset_prefers_larger_read_batch() {
        let (rl, mut engine, mut core) = harness(Policy::DepSet);
        let a = add(&mut core, "a", "d0dc1", AccessType::Write, 10.0);
        let b = add(&mut core, "b", "d0dc1", AccessType::Write, 1.0);
        let c = add(&mut core, "c", "d0dc1", AccessType::Read, 1.0);
        let d = add(&mut core, "d", "d0dc1", AccessType::Read, 1.0);
        engine.handle_arrival(&mut core, &rl, a, 0.0).unwrap();
        engine.handle_arrival(&mut core, &rl, b, 1.0).unwrap();
        engine.handle_arrival(&mut core, &rl, c, 2.0).unwrap();
        engine.handle_arrival(&mut core, &rl, d, 3.0).unwrap();
        engine.handle_completion(&mut core, &rl, a, 10.0).unwrap();
        // The folded read batch {c, d} outweighs the lone write b.
        assert_eq!(core.wfs[c].status, Status::Running);
        assert_eq!(core.wfs[d].status, Status::Running);
        assert_eq!(core.wfs[b].status, Status::Pending);
    }
}
