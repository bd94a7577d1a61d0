//! Optional structural sanity checks, run after each scheduling fixpoint
//! when enabled. They are quadratic in the tree size and meant for
//! debugging runs, not production simulations.

use itertools::Itertools;

use crate::{
    error::{Result, SimError},
    fsm::Fsm,
    tree::RegexTree,
    workflow::{LockFilter, LockKind, WfArena, WfId},
};

fn fail(msg: impl Into<String>) -> SimError {
    SimError::Invariant(msg.into())
}

/// Workflow-side invariants for every pending or running workflow: list
/// hygiene, status agreement, mirror consistency with the tree, and the
/// language agreement between a workflow's lock set and its request.
pub fn check_workflows(wfs: &WfArena, tree: &RegexTree, watch: &[WfId]) -> Result<()> {
    if watch.iter().duplicates().next().is_some() {
        return Err(fail("duplicated workflows in the active lists"));
    }
    for &wf in watch {
        let record = &wfs[wf];
        if record.status == crate::workflow::Status::Running && !record.runnable() {
            return Err(fail(format!(
                "{} is RUNNING with pending intents",
                record.name
            )));
        }
        if record.status == crate::workflow::Status::Pending
            && record.runnable()
            && (!record.held_shared.is_empty() || !record.held_exclusive.is_empty())
        {
            return Err(fail(format!(
                "{} holds all of its locks but still pends",
                record.name
            )));
        }
        for kind in LockKind::ALL {
            for &obj in record.lock_list(kind) {
                if !tree[obj].lock_list(kind).contains(&wf) {
                    return Err(fail(format!(
                        "{} has a {:?} edge to {:?} with no mirror",
                        record.name, kind, tree[obj].regex
                    )));
                }
            }
        }

        // The union of the languages the workflow is granted or waiting on
        // must equal the union of its exercised requests.
        let mut lock_fsm: Option<Fsm> = None;
        for kind in LockKind::ALL {
            for &obj in record.lock_list(kind) {
                let piece = &tree[obj].fsm;
                lock_fsm = Some(match lock_fsm {
                    None => piece.clone(),
                    Some(acc) => acc.union(piece),
                });
            }
        }
        let mut req_fsm: Option<Fsm> = None;
        for req in &record.requests[..=record.cur] {
            let piece = Fsm::from_regex(&req.regex)?;
            req_fsm = Some(match req_fsm {
                None => piece,
                Some(acc) => acc.union(&piece),
            });
        }
        let agree = match (&lock_fsm, &req_fsm) {
            (Some(a), Some(b)) => a.language_eq(b),
            (None, None) => true,
            _ => false,
        };
        if !agree {
            return Err(fail(format!(
                "{}'s lock set does not cover its request",
                record.name
            )));
        }
    }
    Ok(())
}

/// Tree-side invariants for every live node.
pub fn check_tree(tree: &RegexTree) -> Result<()> {
    for obj in tree.all_children(tree.root) {
        check_node(tree, obj)?;
        check_containment(tree, obj)?;
    }
    Ok(())
}

fn check_node(tree: &RegexTree, obj: crate::workflow::ObjId) -> Result<()> {
    let node = &tree[obj];
    if !node.held_shared.is_empty() && !node.held_exclusive.is_empty() {
        return Err(fail(format!(
            "{:?} holds both shared and exclusive",
            node.regex
        )));
    }
    if node.held_exclusive.len() > 1 {
        return Err(fail(format!(
            "{:?} holds more than one exclusive",
            node.regex
        )));
    }
    for kind in LockKind::ALL {
        if node.lock_list(kind).iter().duplicates().next().is_some() {
            return Err(fail(format!(
                "{:?} lists a workflow twice under {kind:?}",
                node.regex
            )));
        }
    }
    let overlapping = [
        (&node.held_shared, &node.held_exclusive),
        (&node.intent_shared, &node.intent_exclusive),
        (&node.intent_shared, &node.held_shared),
        (&node.intent_exclusive, &node.held_exclusive),
        (&node.intent_shared, &node.held_exclusive),
    ];
    for (a, b) in overlapping {
        if a.iter().any(|wf| b.contains(wf)) {
            return Err(fail(format!(
                "{:?} grants a workflow conflicting categories",
                node.regex
            )));
        }
    }
    Ok(())
}

fn check_containment(tree: &RegexTree, obj: crate::workflow::ObjId) -> Result<()> {
    let node = &tree[obj];
    if node.held_shared.is_empty() && node.held_exclusive.is_empty() {
        return Ok(());
    }
    if tree.has_lock_in_containment(obj, LockFilter::Write, false)?
        && tree.has_lock_in_containment(obj, LockFilter::Read, false)?
    {
        return Err(fail(format!(
            "the containment of {:?} mixes shared and exclusive holders",
            node.regex
        )));
    }
    if tree.num_exclusive_in_path(obj)? > 1 {
        return Err(fail(format!(
            "more than one exclusive on the root path of {:?}",
            node.regex
        )));
    }
    Ok(())
}
