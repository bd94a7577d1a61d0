//! Deadlock rollback: the engine-independent tail of revoking a witness.
//!
//! The engines strip the witness's lock edges themselves (the garbage
//! collection differs per granularity); what follows is always the same:
//! reset the workflow, drop it from the pending list, replay its arrival at
//! the current simulated time and log the rollback.

use tracing::debug;

use crate::{events::EventKind, sched::SimCore, workflow::WfId};

pub(crate) fn requeue_witness(core: &mut SimCore, witness: WfId, now: f64) {
    debug!(wf = %core.wfs[witness].name, now, "deadlock rollback");
    core.wfs[witness].reset();
    core.pending.retain(|&w| w != witness);
    core.queue.push(now, EventKind::WfArrival, witness);
    let line = format!(
        "Deadlock: ev_time = {}, wf_name = {}\n",
        now, core.wfs[witness].name
    );
    core.records.push(line);
    core.deadlocks += 1;
}
