/*!
Scheduling engines and the state they share.

Six scheduler variants share the event machinery and the candidate
policies but differ in lock granularity: per-device and per-datacenter
baselines ([`baseline`]) keep one lock object per matched unit, while the
regex-tree engines ([`occam`]) lock containment-tree nodes. The variants
form a closed set ([`SchedulerKind`]) dispatched as an enum.
*/

use tracing::debug;

use crate::{
    error::Result,
    events::{EventKind, EventQueue},
    resolver::Resolver,
    workflow::{Status, WfArena, WfId, Workflow},
};

pub mod baseline;
pub mod deadlock;
pub mod occam;
pub mod sanity;

/// Modeled cost of one lock operation, in microseconds; folded into the
/// per-workflow `schedule_time` accounting.
pub const LOCK_DELAY_US: u64 = 10;

/// A fault raised while computing candidates: either a detected dependency
/// cycle (recovered locally by rollback) or a real error.
pub(crate) enum SchedFault {
    Deadlock(crate::error::DeadlockDetected),
    Error(crate::error::SimError),
}

impl From<crate::error::SimError> for SchedFault {
    fn from(e: crate::error::SimError) -> Self {
        SchedFault::Error(e)
    }
}

impl From<crate::error::DeadlockDetected> for SchedFault {
    fn from(d: crate::error::DeadlockDetected) -> Self {
        SchedFault::Deadlock(d)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Policy {
    Fifo,
    DepSet,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Granularity {
    Device,
    Datacenter,
}

/// The closed set of scheduler variants.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedulerKind {
    DcFifo,
    DevFifo,
    DcDepset,
    DevDepset,
    OccamDepset,
    OccamFifo,
}

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 6] = [
        SchedulerKind::DcFifo,
        SchedulerKind::DevFifo,
        SchedulerKind::DcDepset,
        SchedulerKind::DevDepset,
        SchedulerKind::OccamDepset,
        SchedulerKind::OccamFifo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SchedulerKind::DcFifo => "dc_fifo",
            SchedulerKind::DevFifo => "dev_fifo",
            SchedulerKind::DcDepset => "dc_depset",
            SchedulerKind::DevDepset => "dev_depset",
            SchedulerKind::OccamDepset => "occam_depset",
            SchedulerKind::OccamFifo => "occam_fifo",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn policy(self) -> Policy {
        match self {
            SchedulerKind::DcFifo | SchedulerKind::DevFifo | SchedulerKind::OccamFifo => {
                Policy::Fifo
            }
            SchedulerKind::DcDepset | SchedulerKind::DevDepset | SchedulerKind::OccamDepset => {
                Policy::DepSet
            }
        }
    }

    /// The lock granularity of the baseline variants; `None` for the
    /// regex-tree engines.
    pub fn granularity(self) -> Option<Granularity> {
        match self {
            SchedulerKind::DcFifo | SchedulerKind::DcDepset => Some(Granularity::Datacenter),
            SchedulerKind::DevFifo | SchedulerKind::DevDepset => Some(Granularity::Device),
            SchedulerKind::OccamDepset | SchedulerKind::OccamFifo => None,
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-workflow bookkeeping reported in the result files.
#[derive(Clone, Debug)]
pub struct TaskMeta {
    pub start_time: f64,
    pub wf_name: String,
    pub exec_time: f64,
    pub regex: String,
    pub schedule_time_us: u64,
    pub insert_time_us: u64,
    pub delete_time_us: u64,
    pub actual_start: Option<f64>,
    pub finish: Option<f64>,
}

impl TaskMeta {
    pub fn new(start_time: f64, wf_name: impl Into<String>, exec_time: f64, regex: impl Into<String>) -> Self {
        TaskMeta {
            start_time,
            wf_name: wf_name.into(),
            exec_time,
            regex: regex.into(),
            schedule_time_us: 0,
            insert_time_us: 0,
            delete_time_us: 0,
            actual_start: None,
            finish: None,
        }
    }
}

/// State shared by every engine: the workflow arena, the event heap, the
/// pending/running/complete lists, the event records and the time series.
pub struct SimCore {
    pub wfs: WfArena,
    pub queue: EventQueue,
    pub pending: Vec<WfId>,
    pub running: Vec<WfId>,
    pub complete: Vec<WfId>,
    /// One line per handled event, flushed to the `.log` result file.
    pub records: Vec<String>,
    pub pending_q_len: Vec<(f64, usize)>,
    pub active_objs: Vec<(f64, usize)>,
    pub meta: Vec<TaskMeta>,
    pub deadlocks: u64,
    pub sanity_check: bool,
}

impl Default for SimCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCore {
    pub fn new() -> Self {
        SimCore {
            wfs: WfArena::new(),
            queue: EventQueue::new(),
            pending: Vec::new(),
            running: Vec::new(),
            complete: Vec::new(),
            records: Vec::new(),
            pending_q_len: Vec::new(),
            active_objs: Vec::new(),
            meta: Vec::new(),
            deadlocks: 0,
            sanity_check: false,
        }
    }

    /// Register a workflow and its metadata, keeping the two arenas aligned.
    pub fn add_workflow(&mut self, wf: Workflow, meta: TaskMeta) -> WfId {
        let id = self.wfs.alloc(wf);
        self.meta.push(meta);
        id
    }

    pub fn meta_mut(&mut self, wf: WfId) -> &mut TaskMeta {
        &mut self.meta[wf.0 as usize]
    }

    pub fn record_event(&mut self, kind: EventKind, time: f64, wf: WfId) {
        self.records.push(format!(
            "{}: ev_time = {}, wf_name = {}\n",
            kind.label(),
            time,
            self.wfs[wf].name
        ));
    }

    fn record_event_with_obj(&mut self, kind: EventKind, time: f64, wf: WfId) {
        self.records.push(format!(
            "{}: ev_time = {}, wf_name = {}, obj_id = {}\n",
            kind.label(),
            time,
            self.wfs[wf].name,
            self.wfs[wf].cur
        ));
    }

    /// `ObjStart`: schedule the matching `ObjEnd` after the request's
    /// duration.
    pub fn handle_obj_start(&mut self, wf: WfId, now: f64) {
        self.record_event_with_obj(EventKind::ObjStart, now, wf);
        debug!(wf = %self.wfs[wf].name, now, "object start");
        let duration = self.wfs[wf].current().duration;
        self.queue.push(now + duration, EventKind::ObjEnd, wf);
        if self.wfs[wf].cur == 0 {
            self.meta_mut(wf).actual_start = Some(now);
        }
    }

    /// `ObjEnd`: the single exercised request is done, emit the completion.
    pub fn handle_obj_end(&mut self, wf: WfId, now: f64) {
        self.record_event_with_obj(EventKind::ObjEnd, now, wf);
        debug!(wf = %self.wfs[wf].name, now, "object end");
        assert!(
            self.wfs[wf].is_last_request(),
            "multi-request workflows are not supported"
        );
        self.queue.push(now, EventKind::WfCompletion, wf);
    }

    /// Move every pending workflow whose intent lists drained to RUNNING and
    /// enqueue its `ObjStart` at the current time.
    pub fn promote_runnable(&mut self, now: f64) -> bool {
        let mut promoted = Vec::new();
        for &wf in &self.pending {
            if self.wfs[wf].runnable() {
                promoted.push(wf);
            }
        }
        for &wf in &promoted {
            self.wfs[wf].status = Status::Running;
            self.queue.push(now, EventKind::ObjStart, wf);
        }
        for wf in &promoted {
            self.pending.retain(|w| w != wf);
            self.running.push(*wf);
        }
        !promoted.is_empty()
    }

    /// Invalidate every cached dependency set before a recomputation pass.
    pub fn reset_depset(&mut self) {
        let ids: Vec<WfId> = self.running.iter().chain(&self.pending).copied().collect();
        for wf in ids {
            self.wfs[wf].dep_valid = false;
        }
    }
}

/// One of the six variants, ready to drive events.
pub enum Engine {
    Occam(occam::OccamEngine),
    Unit(baseline::UnitEngine),
}

impl Engine {
    pub fn for_kind(kind: SchedulerKind, rl: &Resolver) -> Result<Self> {
        Ok(match kind.granularity() {
            None => Engine::Occam(occam::OccamEngine::new(rl, kind.policy())?),
            Some(granularity) => {
                Engine::Unit(baseline::UnitEngine::new(granularity, kind.policy()))
            }
        })
    }

    pub fn handle_arrival(
        &mut self,
        core: &mut SimCore,
        rl: &Resolver,
        wf: WfId,
        now: f64,
    ) -> Result<()> {
        match self {
            Engine::Occam(e) => e.handle_arrival(core, rl, wf, now),
            Engine::Unit(e) => e.handle_arrival(core, rl, wf, now),
        }
    }

    pub fn handle_completion(
        &mut self,
        core: &mut SimCore,
        rl: &Resolver,
        wf: WfId,
        now: f64,
    ) -> Result<()> {
        match self {
            Engine::Occam(e) => e.handle_completion(core, rl, wf, now),
            Engine::Unit(e) => e.handle_completion(core, rl, wf, now),
        }
    }

    /// Number of live lock objects, for the end-of-run accounting.
    pub fn active_objects(&self) -> usize {
        match self {
            Engine::Occam(e) => e.tree.all_children(e.tree.root).len(),
            Engine::Unit(e) => e.active_objects(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in SchedulerKind::ALL {
            assert_eq!(SchedulerKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(SchedulerKind::parse("fifo"), None);
    }

    #[test]
    fn depset_kinds_pair_policy_and_granularity() {
        assert_eq!(SchedulerKind::DevDepset.policy(), Policy::DepSet);
        assert_eq!(
            SchedulerKind::DevDepset.granularity(),
            Some(Granularity::Device)
        );
        assert_eq!(SchedulerKind::OccamFifo.granularity(), None);
    }
}
