/*!
The containment tree: a hierarchical index of active regex nodes ordered by
language containment.

Every child's language is a strict subset of its parent's and siblings are
pairwise disjoint; the root denotes `.*`. Inserting a regex that overlaps a
sibling splits both into intersection and differences, and every lock or
intent that referenced the split node is re-granted on the intersection so
ownership is preserved across the split.

Nodes and workflows refer to each other by arena indices; the forward and
reverse edges are only touched through [`RegexTree::link`] and
[`RegexTree::unlink`].
*/

use std::collections::BTreeSet;

use tracing::debug;

use crate::{
    error::{Result, SimError},
    fsm::Fsm,
    resolver::{LangView, Resolver},
    workflow::{AccessType, LockFilter, LockKind, ObjId, WfArena, WfId},
};

pub struct TreeNode {
    pub regex: String,
    pub fsm: Fsm,
    /// Device identifiers matched by the regex; drives the device-count
    /// relation shortcuts and sanity reporting.
    pub devices: BTreeSet<String>,
    /// Datacenter bound keys; only a sort key among siblings.
    pub lo: String,
    pub hi: String,
    pub children: Vec<ObjId>,
    pub held_shared: Vec<WfId>,
    pub held_exclusive: Vec<WfId>,
    pub intent_shared: Vec<WfId>,
    pub intent_exclusive: Vec<WfId>,
    alive: bool,
}

impl TreeNode {
    pub fn lock_list(&self, kind: LockKind) -> &Vec<WfId> {
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

    pub fn has_any_lock(&self) -> bool {
        !self.held_shared.is_empty()
            || !self.held_exclusive.is_empty()
            || !self.intent_shared.is_empty()
            || !self.intent_exclusive.is_empty()
    }

    pub fn view(&self) -> LangView<'_> {
        LangView {
            regex: &self.regex,
            fsm: &self.fsm,
            devices: &self.devices,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

pub struct RegexTree {
    nodes: Vec<TreeNode>,
    pub root: ObjId,
}

impl std::ops::Index<ObjId> for RegexTree {
    type Output = TreeNode;

    fn index(&self, id: ObjId) -> &TreeNode {
        &self.nodes[id.0 as usize]
    }
}

impl std::ops::IndexMut<ObjId> for RegexTree {
    fn index_mut(&mut self, id: ObjId) -> &mut TreeNode {
        &mut self.nodes[id.0 as usize]
    }
}

impl RegexTree {
    pub fn new(rl: &Resolver) -> Result<Self> {
        let mut tree = RegexTree {
            nodes: Vec::new(),
            root: ObjId(0),
        };
        let root = tree.node_from_regex(rl, ".*")?;
        tree.root = root;
        Ok(tree)
    }

    /// Allocate a node for a regex, compiling through the resolver's FSM
    /// cache.
    pub fn node_from_regex(&mut self, rl: &Resolver, regex: &str) -> Result<ObjId> {
        let fsm = rl.fsm_for(regex)?;
        self.alloc(rl, regex.to_owned(), fsm)
    }

    /// Allocate a node for an automaton produced by a split; the regex text
    /// is rendered from the automaton.
    pub fn node_from_fsm(&mut self, rl: &Resolver, fsm: Fsm) -> Result<ObjId> {
        let fsm = fsm.minimized();
        let regex = fsm.to_regex();
        self.alloc(rl, regex, fsm)
    }

    fn alloc(&mut self, rl: &Resolver, regex: String, fsm: Fsm) -> Result<ObjId> {
        let devices = rl.matched_devices(&regex, &fsm);
        let (lo, hi) = bounds_for(rl, &regex, &fsm)?;
        let id = ObjId(self.nodes.len() as u32);
        self.nodes.push(TreeNode {
            regex,
            fsm,
            devices,
            lo,
            hi,
            children: Vec::new(),
            held_shared: Vec::new(),
            held_exclusive: Vec::new(),
            intent_shared: Vec::new(),
            intent_exclusive: Vec::new(),
            alive: true,
        });
        Ok(id)
    }

    /// Replace a node's language after a split: regex text, device set and
    /// bound keys all follow the new automaton.
    fn set_fsm(&mut self, rl: &Resolver, id: ObjId, fsm: Fsm) -> Result<()> {
        let fsm = fsm.minimized();
        let regex = fsm.to_regex();
        let devices = rl.matched_devices(&regex, &fsm);
        let (lo, hi) = bounds_for(rl, &regex, &fsm)?;
        let node = &mut self[id];
        node.regex = regex;
        node.fsm = fsm;
        node.devices = devices;
        node.lo = lo;
        node.hi = hi;
        Ok(())
    }

    // ---- edge discipline ----------------------------------------------

    /// Add the forward and reverse edge of one lock category.
    pub fn link(&mut self, wfs: &mut WfArena, obj: ObjId, wf: WfId, kind: LockKind) {
        debug_assert!(!self[obj].lock_list(kind).contains(&wf));
        debug_assert!(!wfs[wf].lock_list(kind).contains(&obj));
        self[obj].lock_list_mut(kind).push(wf);
        wfs[wf].lock_list_mut(kind).push(obj);
    }

    /// Remove the forward and reverse edge of one lock category.
    pub fn unlink(&mut self, wfs: &mut WfArena, obj: ObjId, wf: WfId, kind: LockKind) {
        if let Some(pos) = self[obj].lock_list(kind).iter().position(|&w| w == wf) {
            self[obj].lock_list_mut(kind).remove(pos);
        }
        if let Some(pos) = wfs[wf].lock_list(kind).iter().position(|&o| o == obj) {
            wfs[wf].lock_list_mut(kind).remove(pos);
        }
    }

    /// Register the workflow's pending request on a node: read requests as
    /// intent-shared, write requests as intent-exclusive.
    pub fn add_intent(&mut self, wfs: &mut WfArena, obj: ObjId, wf: Option<WfId>) {
        let Some(wf) = wf else { return };
        match wfs[wf].current().access {
            AccessType::Read => self.link(wfs, obj, wf, LockKind::IntentShared),
            AccessType::Write => self.link(wfs, obj, wf, LockKind::IntentExclusive),
        }
    }

    /// After a split, everything granted or requested on `from` is also
    /// granted or requested on `to`, held and intent categories alike.
    fn copy_edges(&mut self, wfs: &mut WfArena, from: ObjId, to: ObjId) {
        for kind in LockKind::ALL {
            for wf in self[from].lock_list(kind).clone() {
                self.link(wfs, to, wf, kind);
            }
        }
    }

    // ---- structure ----------------------------------------------------

    fn insert_child(&mut self, parent: ObjId, index: usize, child: ObjId) {
        self[parent].children.insert(index, child);
    }

    fn append_child(&mut self, parent: ObjId, child: ObjId) {
        self[parent].children.push(child);
    }

    fn remove_child(&mut self, parent: ObjId, child: ObjId) {
        self[parent].children.retain(|&c| c != child);
    }

    /// Keep a layer in ascending `(lo, hi)` order.
    fn sort_layer(&mut self, parent: ObjId) {
        let mut children = std::mem::take(&mut self[parent].children);
        children.sort_by(|&a, &b| {
            let (na, nb) = (&self[a], &self[b]);
            (na.lo.as_str(), na.hi.as_str()).cmp(&(nb.lo.as_str(), nb.hi.as_str()))
        });
        self[parent].children = children;
    }

    // ---- queries ------------------------------------------------------

    /// The subtree below `root`, excluding `root`: direct children first,
    /// then each child's subtree.
    pub fn all_children(&self, root: ObjId) -> Vec<ObjId> {
        let mut out = self[root].children.clone();
        for &ch in &self[root].children {
            out.extend(self.all_children(ch));
        }
        out
    }

    /// Nodes from the root (exclusive) down to `obj` (inclusive).
    pub fn path(&self, obj: ObjId) -> Result<Vec<ObjId>> {
        fn walk(tree: &RegexTree, cur: ObjId, obj: ObjId) -> Option<Vec<ObjId>> {
            if cur == obj {
                return Some(vec![cur]);
            }
            for &ch in &tree[cur].children {
                if let Some(mut path) = walk(tree, ch, obj) {
                    path.insert(0, cur);
                    return Some(path);
                }
            }
            None
        }
        let mut path = walk(self, self.root, obj).ok_or_else(|| {
            SimError::TreeStructure(format!("{:?} is not in the tree", self[obj].regex))
        })?;
        path.remove(0);
        Ok(path)
    }

    /// `path(obj) ∪ all_children(obj)`, excluding `obj` itself if `proper`.
    pub fn containment(&self, obj: ObjId, proper: bool) -> Result<Vec<ObjId>> {
        let mut out = self.path(obj)?;
        if proper {
            out.retain(|&o| o != obj);
        }
        out.extend(self.all_children(obj));
        Ok(out)
    }

    pub fn find_parent(&self, obj: ObjId) -> Option<ObjId> {
        fn walk(tree: &RegexTree, cur: ObjId, obj: ObjId) -> Option<ObjId> {
            if tree[cur].children.contains(&obj) {
                return Some(cur);
            }
            for &ch in &tree[cur].children {
                if let Some(p) = walk(tree, ch, obj) {
                    return Some(p);
                }
            }
            None
        }
        walk(self, self.root, obj)
    }

    /// Indented dump of the live tree, for debug logging and failure
    /// reports.
    pub fn render(&self) -> String {
        fn rec(tree: &RegexTree, id: ObjId, indent: &str, out: &mut String) {
            out.push_str(indent);
            out.push_str(&tree[id].regex);
            out.push('\n');
            let deeper = format!("{indent}   ");
            for &ch in &tree[id].children {
                rec(tree, ch, &deeper, out);
            }
        }
        let mut out = String::new();
        rec(self, self.root, "", &mut out);
        out
    }

    // ---- lock queries over the structure ------------------------------

    fn has_lock_in(&self, objs: &[ObjId], filter: LockFilter) -> bool {
        objs.iter().any(|&o| {
            let node = &self[o];
            match filter {
                LockFilter::Read => !node.held_shared.is_empty(),
                LockFilter::Write => !node.held_exclusive.is_empty(),
                LockFilter::ReadWrite => {
                    !node.held_shared.is_empty() || !node.held_exclusive.is_empty()
                }
            }
        })
    }

    pub fn has_lock_in_containment(
        &self,
        obj: ObjId,
        filter: LockFilter,
        proper: bool,
    ) -> Result<bool> {
        Ok(self.has_lock_in(&self.containment(obj, proper)?, filter))
    }

    pub fn has_lock_in_path(&self, obj: ObjId, filter: LockFilter, proper: bool) -> Result<bool> {
        let mut path = self.path(obj)?;
        if proper {
            path.retain(|&o| o != obj);
        }
        Ok(self.has_lock_in(&path, filter))
    }

    pub fn has_lock_in_children(&self, obj: ObjId, filter: LockFilter) -> bool {
        self.has_lock_in(&self.all_children(obj), filter)
    }

    /// Workflows holding a lock of the given kind anywhere in the
    /// containment.
    pub fn wfs_with_held_in_containment(
        &self,
        obj: ObjId,
        filter: LockFilter,
        proper: bool,
    ) -> Result<Vec<WfId>> {
        let mut out = Vec::new();
        for co in self.containment(obj, proper)? {
            let node = &self[co];
            let lists: &[&Vec<WfId>] = match filter {
                LockFilter::Read => &[&node.held_shared],
                LockFilter::Write => &[&node.held_exclusive],
                LockFilter::ReadWrite => &[&node.held_shared, &node.held_exclusive],
            };
            for list in lists {
                for &wf in *list {
                    if !out.contains(&wf) {
                        out.push(wf);
                    }
                }
            }
        }
        Ok(out)
    }

    /// All held locks in the subtree below `obj` belong to `wf`.
    pub fn only_wf_in_children(&self, obj: ObjId, wf: WfId) -> bool {
        self.all_children(obj).iter().all(|&co| {
            let node = &self[co];
            node.held_shared
                .iter()
                .chain(&node.held_exclusive)
                .all(|&holder| holder == wf)
        })
    }

    /// All held locks on the path above `obj` belong to `wf`, and wherever
    /// an ancestor holds for `wf`, the off-path subtrees below it hold only
    /// for `wf` as well.
    pub fn only_wf_in_path(&self, obj: ObjId, wf: WfId) -> Result<bool> {
        let mut path = self.path(obj)?;
        path.retain(|&o| o != obj);
        for &co in &path {
            let node = &self[co];
            if node
                .held_shared
                .iter()
                .chain(&node.held_exclusive)
                .any(|&holder| holder != wf)
            {
                return Ok(false);
            }
        }
        for &ancestor in &path {
            let node = &self[ancestor];
            if node.held_shared.contains(&wf) || node.held_exclusive.contains(&wf) {
                for &child in &node.children {
                    if !path.contains(&child) && !self.only_wf_in_children(child, wf) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    pub fn num_exclusive_in_path(&self, obj: ObjId) -> Result<usize> {
        Ok(self
            .path(obj)?
            .iter()
            .filter(|&&o| !self[o].held_exclusive.is_empty())
            .count())
    }

    // ---- deletion -----------------------------------------------------

    /// Remove the node when all four lock lists are empty, promoting its
    /// children to its parent.
    pub fn delete_if_empty(&mut self, obj: ObjId) -> Result<bool> {
        if !self[obj].alive || self[obj].has_any_lock() {
            return Ok(false);
        }
        self.delete_obj(obj)?;
        Ok(true)
    }

    fn delete_obj(&mut self, obj: ObjId) -> Result<()> {
        let Some(parent) = self.find_parent(obj) else {
            return Err(SimError::TreeStructure(format!(
                "cannot find the parent of {:?} in:\n{}",
                self[obj].regex,
                self.render()
            )));
        };
        let children = std::mem::take(&mut self[obj].children);
        for ch in children {
            self.append_child(parent, ch);
        }
        self.remove_child(parent, obj);
        self[obj].alive = false;
        self.sort_layer(parent);
        Ok(())
    }

    /// Release every held lock of a completing workflow and garbage-collect
    /// each node it vacates. Calling this twice is a no-op the second time.
    pub fn release_workflow(&mut self, wfs: &mut WfArena, wf: WfId) -> Result<()> {
        for obj in std::mem::take(&mut wfs[wf].held_shared) {
            if let Some(pos) = self[obj].held_shared.iter().position(|&w| w == wf) {
                self[obj].held_shared.remove(pos);
            }
            let node = &self[obj];
            if node.intent_shared.is_empty()
                && node.intent_exclusive.is_empty()
                && node.held_shared.is_empty()
            {
                self.delete_obj(obj)?;
            }
        }
        for obj in std::mem::take(&mut wfs[wf].held_exclusive) {
            if let Some(pos) = self[obj].held_exclusive.iter().position(|&w| w == wf) {
                self[obj].held_exclusive.remove(pos);
            }
            let node = &self[obj];
            if node.intent_shared.is_empty() && node.intent_exclusive.is_empty() {
                self.delete_obj(obj)?;
            }
        }
        Ok(())
    }

    // ---- relations ----------------------------------------------------

    fn rel_equal(&self, rl: &Resolver, a: ObjId, b: ObjId) -> bool {
        rl.lang_equal(self[a].view(), self[b].view())
    }

    fn rel_contains(&self, rl: &Resolver, a: ObjId, b: ObjId) -> bool {
        rl.lang_contains(self[a].view(), self[b].view())
    }

    fn rel_contains_proper(&self, rl: &Resolver, a: ObjId, b: ObjId) -> bool {
        rl.lang_contains_proper(self[a].view(), self[b].view())
    }

    fn rel_overlaps(&self, rl: &Resolver, a: ObjId, b: ObjId) -> bool {
        rl.lang_overlaps(self[a].view(), self[b].view())
    }

    // ---- insertion ----------------------------------------------------

    /// Insert `obj` below `root`, registering `wf`'s pending request on it.
    ///
    /// Four stages: classify the layer's children against `obj`, partition
    /// the overlapping ones into intersection and differences, re-grant the
    /// split nodes' edges on the intersections, then redistribute children
    /// and re-sort the touched layers.
    pub fn insert(
        &mut self,
        wfs: &mut WfArena,
        rl: &Resolver,
        root: ObjId,
        obj: ObjId,
        wf: Option<WfId>,
    ) -> Result<()> {
        if self[root].children.is_empty() {
            debug!(obj = %self[obj].regex, "insert: no child");
            self.insert_child(root, 0, obj);
            self.add_intent(wfs, obj, wf);
            return Ok(());
        }
        let first = self[root].children[0];
        if self[obj].hi < self[first].lo {
            debug!(obj = %self[obj].regex, "insert: below all siblings");
            self.insert_child(root, 0, obj);
            self.add_intent(wfs, obj, wf);
            return Ok(());
        }

        // Stage 1: classify the children of this layer.
        let num_child = self[root].children.len();
        let mut untouched = true;
        let mut contained: Vec<ObjId> = Vec::new();
        let mut overlaps: Vec<ObjId> = Vec::new();
        let mut idx = 0;
        while idx < num_child {
            let ch = self[root].children[idx];
            if self[ch].lo > self[obj].hi {
                break;
            }
            if self.rel_contains(rl, obj, ch) {
                debug!(obj = %self[obj].regex, ch = %self[ch].regex, "insert: obj contains child");
                untouched = false;
                contained.push(ch);
            } else if self.rel_contains_proper(rl, ch, obj) {
                debug!(obj = %self[obj].regex, ch = %self[ch].regex, "insert: child contains obj");
                untouched = false;
                if self[ch].children.is_empty() {
                    self.insert_child(ch, 0, obj);
                    self.add_intent(wfs, obj, wf);
                } else {
                    self.insert(wfs, rl, ch, obj, wf)?;
                }
                break;
            } else if self.rel_overlaps(rl, obj, ch) {
                debug!(obj = %self[obj].regex, ch = %self[ch].regex, "insert: overlapping");
                untouched = false;
                overlaps.push(ch);
            }
            idx += 1;
        }

        if untouched {
            debug!(obj = %self[obj].regex, "insert: untouched");
            self.append_child(root, obj);
            self.add_intent(wfs, obj, wf);
            self.sort_layer(root);
            return Ok(());
        }

        if !overlaps.is_empty() || !contained.is_empty() {
            // Stage 2: partition each overlapping child. A partition can
            // leave the remaining `obj` equal to or inside a later child;
            // both end the stage early and discard the overlaps not yet
            // partitioned.
            let mut commons: Vec<ObjId> = Vec::new();
            let mut remaining = true;
            let mut i = 0;
            while i < overlaps.len() {
                let ch = overlaps[i];
                if self.rel_equal(rl, obj, ch) {
                    debug!(obj = %self[obj].regex, ch = %self[ch].regex, "partition: obj equals child");
                    remaining = false;
                    self.append_child(ch, obj);
                    self.add_intent(wfs, obj, wf);
                    overlaps.truncate(commons.len());
                    break;
                } else if self.rel_contains(rl, ch, obj) {
                    debug!(obj = %self[obj].regex, ch = %self[ch].regex, "partition: child now contains obj");
                    remaining = false;
                    if self[ch].children.is_empty() {
                        self.insert_child(ch, 0, obj);
                        self.add_intent(wfs, obj, wf);
                    } else {
                        self.insert(wfs, rl, ch, obj, wf)?;
                    }
                    overlaps.truncate(commons.len());
                    break;
                }
                let common_fsm = self[obj].fsm.intersect(&self[ch].fsm);
                let obj_diff = self[obj].fsm.difference(&common_fsm);
                let ch_diff = self[ch].fsm.difference(&common_fsm);
                let common = self.node_from_fsm(rl, common_fsm)?;
                self.set_fsm(rl, ch, ch_diff)?;
                self.set_fsm(rl, obj, obj_diff)?;
                commons.push(common);
                i += 1;
            }
            debug_assert_eq!(overlaps.len(), commons.len());

            // Stage 3: the split nodes' edges and children move onto the
            // intersections.
            for i in 0..overlaps.len() {
                self.copy_edges(wfs, overlaps[i], commons[i]);
                self.rebuild_children(wfs, rl, commons[i], overlaps[i])?;
            }

            // Stage 4: update this layer.
            for &c in &contained {
                self.append_child(obj, c);
                self.remove_child(root, c);
            }
            for &c in &commons {
                self.append_child(root, c);
                self.add_intent(wfs, c, wf);
            }
            if remaining {
                self.append_child(root, obj);
                self.add_intent(wfs, obj, wf);
            }
        }
        self.sort_layer(root);
        self.sort_layer(obj);
        Ok(())
    }

    /// Redistribute the children of a split node between it and the
    /// intersection peer; a grandchild straddling both is split recursively.
    fn rebuild_children(
        &mut self,
        wfs: &mut WfArena,
        rl: &Resolver,
        common: ObjId,
        child: ObjId,
    ) -> Result<()> {
        debug!(common = %self[common].regex, child = %self[child].regex, "rebuild children");
        let mut i = 0;
        while i < self[child].children.len() {
            let gc = self[child].children[i];
            if self.rel_contains(rl, child, gc) {
                i += 1;
            } else if self.rel_contains(rl, common, gc) {
                self.remove_child(child, gc);
                self.append_child(common, gc);
            } else {
                let in_common = self[gc].fsm.intersect(&self[common].fsm);
                let in_child = self[gc].fsm.intersect(&self[child].fsm);
                let piece = self.node_from_fsm(rl, in_common)?;
                self.copy_edges(wfs, gc, piece);
                self.set_fsm(rl, gc, in_child)?;
                self.append_child(common, piece);
                self.rebuild_children(wfs, rl, piece, gc)?;
                i += 1;
            }
        }
        self.sort_layer(common);
        self.sort_layer(child);
        Ok(())
    }
}

/// Compute the `(lo, hi)` datacenter bound keys of a node.
///
/// In trace mode they come from the matched-datacenter caches; otherwise the
/// (finite) language is enumerated and the substring from `dc` on is the
/// key. The root matches everything and gets sentinel bounds.
fn bounds_for(rl: &Resolver, regex: &str, fsm: &Fsm) -> Result<(String, String)> {
    if rl.using_trace {
        if regex == ".*" {
            return Ok(("_dc0000_".to_owned(), "_dc9999_".to_owned()));
        }
        let mut dcs = rl.matched_dcs(regex, fsm)?;
        if dcs.is_empty() {
            // A split remainder may match no device at all.
            return Ok(("_dc0000_".to_owned(), "_dc0000_".to_owned()));
        }
        dcs.sort_unstable();
        Ok((dcs[0].clone(), dcs[dcs.len() - 1].clone()))
    } else {
        if regex == ".*" {
            return Ok(("dc1".to_owned(), "dc99999".to_owned()));
        }
        let mut lo: Option<String> = None;
        let mut hi: Option<String> = None;
        for s in fsm.strings()? {
            let key = match s.find("dc") {
                Some(at) => s[at..].to_owned(),
                None => s,
            };
            if lo.as_deref().map_or(true, |cur| key.as_str() < cur) {
                lo = Some(key.clone());
            }
            if hi.as_deref().map_or(true, |cur| key.as_str() > cur) {
                hi = Some(key);
            }
        }
        match (lo, hi) {
            (Some(lo), Some(hi)) => Ok((lo, hi)),
            _ => Err(SimError::Invariant(format!(
                "regex {regex:?} denotes no string; bound keys are undefined"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{AccessRequest, Status, Workflow};

    fn harness() -> (Resolver, RegexTree, WfArena) {
        let rl = Resolver::in_memory(["d0dc1", "d1dc1", "d2dc1"], ["dc1"]);
        let tree = RegexTree::new(&rl).unwrap();
        (rl, tree, WfArena::new())
    }

    fn reader(wfs: &mut WfArena, name: &str, regex: &str) -> WfId {
        wfs.alloc(Workflow::new(
            name,
            vec![AccessRequest::new(regex, 1.0, AccessType::Read)],
        ))
    }

    fn writer(wfs: &mut WfArena, name: &str, regex: &str) -> WfId {
        wfs.alloc(Workflow::new(
            name,
            vec![AccessRequest::new(regex, 1.0, AccessType::Write)],
        ))
    }

    fn insert_for(
        tree: &mut RegexTree,
        wfs: &mut WfArena,
        rl: &Resolver,
        wf: WfId,
    ) -> ObjId {
        let regex = wfs[wf].current().regex.clone();
        let obj = tree.node_from_regex(rl, &regex).unwrap();
        let root = tree.root;
        tree.insert(wfs, rl, root, obj, Some(wf)).unwrap();
        obj
    }

    #[test]
    fn disjoint_siblings_stay_flat() {
        let (rl, mut tree, mut wfs) = harness();
        let a = reader(&mut wfs, "a", "d0dc1");
        let b = reader(&mut wfs, "b", "d1dc1");
        let na = insert_for(&mut tree, &mut wfs, &rl, a);
        let nb = insert_for(&mut tree, &mut wfs, &rl, b);
        assert_eq!(tree[tree.root].children.len(), 2);
        assert_eq!(tree.all_children(tree.root), vec![na, nb]);
        assert_eq!(wfs[a].intent_shared, vec![na]);
        assert_eq!(tree[nb].intent_shared, vec![b]);
    }

    #[test]
    fn contained_insert_dives_below_superset() {
        let (rl, mut tree, mut wfs) = harness();
        let wide = reader(&mut wfs, "wide", "d[0-2]dc1");
        let narrow = reader(&mut wfs, "narrow", "d0dc1");
        let n_wide = insert_for(&mut tree, &mut wfs, &rl, wide);
        let n_narrow = insert_for(&mut tree, &mut wfs, &rl, narrow);
        assert_eq!(tree[tree.root].children, vec![n_wide]);
        assert_eq!(tree[n_wide].children, vec![n_narrow]);
        assert_eq!(tree.path(n_narrow).unwrap(), vec![n_wide, n_narrow]);
        assert_eq!(
            tree.containment(n_wide, false).unwrap(),
            vec![n_wide, n_narrow]
        );
    }

    #[test]
    fn superset_insert_adopts_existing_sibling() {
        let (rl, mut tree, mut wfs) = harness();
        let narrow = reader(&mut wfs, "narrow", "d0dc1");
        let wide = reader(&mut wfs, "wide", "d[0-2]dc1");
        let n_narrow = insert_for(&mut tree, &mut wfs, &rl, narrow);
        let n_wide = insert_for(&mut tree, &mut wfs, &rl, wide);
        assert_eq!(tree[tree.root].children, vec![n_wide]);
        assert_eq!(tree[n_wide].children, vec![n_narrow]);
    }

    #[test]
    fn overlap_split_preserves_ownership() {
        let (rl, mut tree, mut wfs) = harness();
        let a = reader(&mut wfs, "a", "d[0-1]dc1");
        let b = writer(&mut wfs, "b", "d[1-2]dc1");
        let na = insert_for(&mut tree, &mut wfs, &rl, a);
        // Simulate a grant on the existing node before the split.
        tree.unlink(&mut wfs, na, a, LockKind::IntentShared);
        tree.link(&mut wfs, na, a, LockKind::HeldShared);
        let nb = insert_for(&mut tree, &mut wfs, &rl, b);

        // Layer is now {a − common, common, b − common}.
        let layer = tree[tree.root].children.clone();
        assert_eq!(layer.len(), 3);
        let common = layer
            .iter()
            .copied()
            .find(|&n| tree[n].fsm.matches("d1dc1") && n != nb)
            .unwrap();
        assert!(tree[na].fsm.matches("d0dc1") && !tree[na].fsm.matches("d1dc1"));
        assert!(tree[nb].fsm.matches("d2dc1") && !tree[nb].fsm.matches("d1dc1"));
        // The held lock of `a` was re-granted on the intersection, and the
        // writer requested it.
        assert!(tree[common].held_shared.contains(&a));
        assert!(tree[common].intent_exclusive.contains(&b));
        assert!(wfs[a].held_shared.contains(&common));
        assert!(wfs[b].intent_exclusive.contains(&common));
        // Sibling languages are pairwise disjoint again.
        for &x in &layer {
            for &y in &layer {
                if x != y {
                    assert!(tree[x].fsm.is_disjoint(&tree[y].fsm));
                }
            }
        }
    }

    #[test]
    fn insertion_preserves_language_coverage() {
        let (rl, mut tree, mut wfs) = harness();
        let a = reader(&mut wfs, "a", "d[0-1]dc1");
        let b = writer(&mut wfs, "b", "d[1-2]dc1");
        insert_for(&mut tree, &mut wfs, &rl, a);
        insert_for(&mut tree, &mut wfs, &rl, b);
        for device in ["d0dc1", "d1dc1", "d2dc1"] {
            let covering: Vec<ObjId> = tree
                .all_children(tree.root)
                .into_iter()
                .filter(|&n| tree[n].fsm.matches(device))
                .collect();
            assert_eq!(covering.len(), 1, "{device} must be covered exactly once");
        }
    }

    #[test]
    fn release_collects_empty_nodes_and_is_idempotent() {
        let (rl, mut tree, mut wfs) = harness();
        let a = reader(&mut wfs, "a", "d0dc1");
        let na = insert_for(&mut tree, &mut wfs, &rl, a);
        tree.unlink(&mut wfs, na, a, LockKind::IntentShared);
        tree.link(&mut wfs, na, a, LockKind::HeldShared);
        wfs[a].status = Status::Running;

        tree.release_workflow(&mut wfs, a).unwrap();
        assert!(tree[tree.root].children.is_empty());
        assert!(!tree[na].is_alive());
        // Second release is a no-op.
        tree.release_workflow(&mut wfs, a).unwrap();
        assert!(tree[tree.root].children.is_empty());
    }

    #[test]
    fn delete_promotes_children() {
        let (rl, mut tree, mut wfs) = harness();
        let wide = reader(&mut wfs, "wide", "d[0-2]dc1");
        let narrow = reader(&mut wfs, "narrow", "d0dc1");
        let n_wide = insert_for(&mut tree, &mut wfs, &rl, wide);
        let n_narrow = insert_for(&mut tree, &mut wfs, &rl, narrow);
        tree.unlink(&mut wfs, n_wide, wide, LockKind::IntentShared);
        assert!(tree.delete_if_empty(n_wide).unwrap());
        assert_eq!(tree[tree.root].children, vec![n_narrow]);
        assert!(!tree.delete_if_empty(n_narrow).unwrap());
    }
}
