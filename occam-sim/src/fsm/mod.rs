/*!
Deterministic finite automata over device-identifier strings, with the set
algebra the containment tree is built on.

A [`Fsm`] is compiled from a regex through [`regex-automata`]'s dense DFA
builder and re-tabulated as a complete transition table over the byte
alphabet. Working on complete tables makes the set operations product
constructions: containment, disjointness, intersection and difference are
all walks over pairs of states, so every relation the tree needs is decided
exactly, never approximated.

`to_regex` goes the other way (state elimination). The rendered pattern is
language-equal to the automaton but generally not textually equal to the
pattern the automaton was compiled from.

[`regex-automata`]: https://docs.rs/regex-automata/
*/

use std::collections::{HashMap, HashSet};

use regex_automata::{
    dfa::{dense, Automaton, StartKind},
    nfa::thompson,
    util::syntax,
    Anchored, Input,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

mod render;

/// Number of symbols in the byte alphabet.
const ALPHABET: usize = 256;

/// State id of the canonical dead state. Every `Fsm` owns one at index 0:
/// non-accepting, all transitions to itself.
const DEAD: u32 = 0;

/// A complete deterministic finite automaton denoting a set of device
/// identifiers (a whole-string language over bytes).
#[derive(Clone, Serialize, Deserialize)]
pub struct Fsm {
    /// `table[s * 256 + b]` is the successor of state `s` on byte `b`.
    table: Vec<u32>,
    accept: Vec<bool>,
    start: u32,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("states", &self.state_count())
            .field("start", &self.start)
            .finish()
    }
}

impl Fsm {
    /// Compile a regex into a minimal complete DFA. The pattern is matched
    /// against whole strings: an implicit anchor at both ends.
    pub fn from_regex(pattern: &str) -> Result<Self> {
        let build_err = |e: &dyn std::fmt::Display| SimError::Pattern {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        };
        let dfa = dense::Builder::new()
            .configure(
                dense::Config::new()
                    .start_kind(StartKind::Anchored)
                    .minimize(true),
            )
            .syntax(syntax::Config::new().unicode(false).utf8(false))
            .thompson(thompson::Config::new().utf8(false))
            .build(pattern)
            .map_err(|e| build_err(&e))?;
        let start = dfa
            .start_state_forward(&Input::new("").anchored(Anchored::Yes))
            .map_err(|e| build_err(&e))?;

        // Re-tabulate the dense DFA into a plain complete table, folding its
        // dead and quit states into our canonical dead state.
        let mut table = vec![DEAD; ALPHABET];
        let mut accept = vec![false];
        let mut ids = HashMap::new();
        let mut order = Vec::new();
        let mut id_of = |s, order: &mut Vec<_>, accept: &mut Vec<bool>, table: &mut Vec<u32>| {
            if dfa.is_dead_state(s) || dfa.is_quit_state(s) {
                return DEAD;
            }
            *ids.entry(s).or_insert_with(|| {
                order.push(s);
                accept.push(dfa.is_match_state(dfa.next_eoi_state(s)));
                table.extend(std::iter::repeat(DEAD).take(ALPHABET));
                (accept.len() - 1) as u32
            })
        };
        let start = id_of(start, &mut order, &mut accept, &mut table);
        let mut i = 0;
        while i < order.len() {
            let s = order[i];
            let sid = (i + 1) as u32;
            for b in 0..ALPHABET {
                let t = dfa.next_state(s, b as u8);
                let t = id_of(t, &mut order, &mut accept, &mut table);
                table[sid as usize * ALPHABET + b] = t;
            }
            i += 1;
        }
        Ok(Fsm {
            table,
            accept,
            start,
        })
    }

    pub fn state_count(&self) -> usize {
        self.accept.len()
    }

    fn next(&self, s: u32, b: u8) -> u32 {
        self.table[s as usize * ALPHABET + b as usize]
    }

    /// Whole-string membership test.
    pub fn matches(&self, input: &str) -> bool {
        let mut s = self.start;
        for &b in input.as_bytes() {
            s = self.next(s, b);
            if s == DEAD {
                return false;
            }
        }
        self.accept[s as usize]
    }

    fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.state_count()];
        let mut stack = vec![self.start];
        seen[self.start as usize] = true;
        while let Some(s) = stack.pop() {
            for b in 0..ALPHABET {
                let t = self.next(s, b as u8);
                if !seen[t as usize] {
                    seen[t as usize] = true;
                    stack.push(t);
                }
            }
        }
        seen
    }

    /// States from which some accepting state is reachable.
    fn useful(&self) -> Vec<bool> {
        let mut useful = self.accept.clone();
        loop {
            let mut grew = false;
            for s in 0..self.state_count() {
                if useful[s] {
                    continue;
                }
                if (0..ALPHABET).any(|b| useful[self.next(s as u32, b as u8) as usize]) {
                    useful[s] = true;
                    grew = true;
                }
            }
            if !grew {
                return useful;
            }
        }
    }

    pub fn is_empty_language(&self) -> bool {
        !self.reachable()
            .iter()
            .zip(&self.accept)
            .any(|(&r, &a)| r && a)
    }

    /// Walk reachable state pairs of `self × other`, reporting whether any
    /// pair satisfies the predicate on the two accept flags.
    fn any_reachable_pair(&self, other: &Fsm, pred: impl Fn(bool, bool) -> bool) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![(self.start, other.start)];
        seen.insert((self.start, other.start));
        while let Some((sa, sb)) = stack.pop() {
            if pred(self.accept[sa as usize], other.accept[sb as usize]) {
                return true;
            }
            if (sa, sb) == (DEAD, DEAD) {
                continue;
            }
            for b in 0..ALPHABET {
                let t = (self.next(sa, b as u8), other.next(sb, b as u8));
                if seen.insert(t) {
                    stack.push(t);
                }
            }
        }
        false
    }

    /// `L(self) ⊆ L(other)`.
    pub fn is_subset_of(&self, other: &Fsm) -> bool {
        !self.any_reachable_pair(other, |a, b| a && !b)
    }

    /// `L(self) ⊇ L(other)`.
    pub fn contains(&self, other: &Fsm) -> bool {
        other.is_subset_of(self)
    }

    /// `L(self) ⊃ L(other)`.
    pub fn contains_proper(&self, other: &Fsm) -> bool {
        self.contains(other) && !self.is_subset_of(other)
    }

    pub fn language_eq(&self, other: &Fsm) -> bool {
        self.is_subset_of(other) && other.is_subset_of(self)
    }

    pub fn is_disjoint(&self, other: &Fsm) -> bool {
        !self.any_reachable_pair(other, |a, b| a && b)
    }

    fn product(&self, other: &Fsm, accept: impl Fn(bool, bool) -> bool) -> Fsm {
        let mut ids = HashMap::new();
        let mut order = vec![(DEAD, DEAD)];
        ids.insert((DEAD, DEAD), DEAD);
        let start_pair = (self.start, other.start);
        let start = *ids.entry(start_pair).or_insert_with(|| {
            order.push(start_pair);
            1
        });
        let mut table = Vec::new();
        let mut acc = Vec::new();
        let mut i = 0;
        while i < order.len() {
            let (sa, sb) = order[i];
            acc.push(accept(self.accept[sa as usize], other.accept[sb as usize]));
            let base = table.len();
            table.resize(base + ALPHABET, DEAD);
            for b in 0..ALPHABET {
                let pair = (self.next(sa, b as u8), other.next(sb, b as u8));
                let next = order.len() as u32;
                let id = *ids.entry(pair).or_insert_with(|| {
                    order.push(pair);
                    next
                });
                table[base + b] = id;
            }
            i += 1;
        }
        Fsm {
            table,
            accept: acc,
            start,
        }
    }

    /// `L(self) ∩ L(other)`.
    pub fn intersect(&self, other: &Fsm) -> Fsm {
        self.product(other, |a, b| a && b)
    }

    /// `L(self) − L(other)`.
    pub fn difference(&self, other: &Fsm) -> Fsm {
        self.product(other, |a, b| a && !b)
    }

    /// `L(self) ∪ L(other)`.
    pub fn union(&self, other: &Fsm) -> Fsm {
        self.product(other, |a, b| a || b)
    }

    /// Language-preserving state minimization (partition refinement), with
    /// unreachable states dropped. Product constructions leave redundant
    /// states behind; rendering a regex from them first is much cleaner.
    pub fn minimized(&self) -> Fsm {
        let reachable = self.reachable();
        let included = |s: usize| reachable[s] || s == DEAD as usize;
        // Initial partition: accepting vs rejecting. Refinement only ever
        // splits classes, so the partition is stable once its size stops
        // growing.
        let mut class: Vec<u32> = self.accept.iter().map(|&a| a as u32).collect();
        let mut num_classes = 0usize;
        let count = loop {
            let mut sig_ids: HashMap<(u32, Vec<u32>), u32> = HashMap::new();
            let mut next_class = vec![0u32; self.state_count()];
            for s in 0..self.state_count() {
                if !included(s) {
                    continue;
                }
                let sig = (
                    class[s],
                    (0..ALPHABET)
                        .map(|b| class[self.next(s as u32, b as u8) as usize])
                        .collect::<Vec<_>>(),
                );
                let fresh = sig_ids.len() as u32;
                next_class[s] = *sig_ids.entry(sig).or_insert(fresh);
            }
            let n = sig_ids.len();
            class = next_class;
            if n == num_classes {
                break n;
            }
            num_classes = n;
        };
        // Rebuild with the dead class pinned at index 0.
        let dead_class = class[DEAD as usize];
        let remap = |c: u32| -> u32 {
            if c == dead_class {
                0
            } else if c < dead_class {
                c + 1
            } else {
                c
            }
        };
        let mut table = vec![DEAD; count * ALPHABET];
        let mut accept = vec![false; count];
        for s in 0..self.state_count() {
            if !included(s) {
                continue;
            }
            let c = remap(class[s]) as usize;
            accept[c] = self.accept[s];
            for b in 0..ALPHABET {
                table[c * ALPHABET + b] = remap(class[self.next(s as u32, b as u8) as usize]);
            }
        }
        Fsm {
            table,
            accept,
            start: remap(class[self.start as usize]),
        }
    }

    /// Enumerate every accepted string, shortest first (ties in byte order).
    ///
    /// Only meaningful for finite languages; an automaton with a cycle on an
    /// accepting path is rejected instead of enumerated forever.
    pub fn strings(&self) -> Result<Vec<String>> {
        let reachable = self.reachable();
        let useful = self.useful();
        let live: Vec<bool> = reachable
            .iter()
            .zip(&useful)
            .map(|(&r, &u)| r && u)
            .collect();
        if self.has_cycle_within(&live) {
            return Err(SimError::InfiniteLanguage(self.to_regex()));
        }
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        if live[self.start as usize] {
            queue.push_back((self.start, Vec::new()));
        }
        while let Some((s, bytes)) = queue.pop_front() {
            if self.accept[s as usize] {
                out.push(String::from_utf8_lossy(&bytes).into_owned());
            }
            for b in 0..ALPHABET {
                let t = self.next(s, b as u8);
                if live[t as usize] {
                    let mut next = bytes.clone();
                    next.push(b as u8);
                    queue.push_back((t, next));
                }
            }
        }
        Ok(out)
    }

    fn has_cycle_within(&self, live: &[bool]) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut color = vec![Color::White; self.state_count()];
        // Iterative DFS; (state, next byte to try) frames.
        for root in 0..self.state_count() as u32 {
            if !live[root as usize] || color[root as usize] != Color::White {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            color[root as usize] = Color::Grey;
            while let Some(frame) = stack.last_mut() {
                let s = frame.0;
                if frame.1 == ALPHABET {
                    color[s as usize] = Color::Black;
                    stack.pop();
                    continue;
                }
                let t = self.next(s, frame.1 as u8);
                frame.1 += 1;
                if !live[t as usize] {
                    continue;
                }
                match color[t as usize] {
                    Color::Grey => return true,
                    Color::White => {
                        color[t as usize] = Color::Grey;
                        stack.push((t, 0));
                    }
                    Color::Black => {}
                }
            }
        }
        false
    }

    /// Render a regex whose language equals this automaton's.
    pub fn to_regex(&self) -> String {
        render::to_regex(self)
    }

    pub(crate) fn start(&self) -> u32 {
        self.start
    }

    pub(crate) fn accepts_state(&self, s: u32) -> bool {
        self.accept[s as usize]
    }

    pub(crate) fn next_state(&self, s: u32, b: u8) -> u32 {
        self.next(s, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm(pattern: &str) -> Fsm {
        Fsm::from_regex(pattern).unwrap()
    }

    #[test]
    fn whole_string_matching() {
        let f = fsm("d[0-2]dc1");
        assert!(f.matches("d0dc1"));
        assert!(f.matches("d2dc1"));
        assert!(!f.matches("d3dc1"));
        assert!(!f.matches("d0dc11"));
        assert!(!f.matches("xd0dc1"));
    }

    #[test]
    fn containment_relations() {
        let all = fsm("d[0-2]dc1");
        let one = fsm("d0dc1");
        let other = fsm("d5dc9");
        assert!(all.contains(&one));
        assert!(all.contains_proper(&one));
        assert!(all.contains(&all));
        assert!(!all.contains_proper(&all));
        assert!(!one.contains(&all));
        assert!(one.is_subset_of(&all));
        assert!(all.is_disjoint(&other));
        assert!(!all.is_disjoint(&one));
        assert!(fsm(".*").contains_proper(&all));
    }

    #[test]
    fn product_algebra() {
        let a = fsm("d[0-3]dc1");
        let b = fsm("d[2-5]dc1");
        let inter = a.intersect(&b);
        assert!(inter.language_eq(&fsm("d[2-3]dc1")));
        let diff = a.difference(&inter);
        assert!(diff.language_eq(&fsm("d[0-1]dc1")));
        let uni = diff.union(&inter);
        assert!(uni.language_eq(&a));
        assert!(a.difference(&a).is_empty_language());
    }

    #[test]
    fn enumeration_is_ordered_and_finite_only() {
        let f = fsm("d[0-2]dc1");
        assert_eq!(f.strings().unwrap(), vec!["d0dc1", "d1dc1", "d2dc1"]);
        assert!(matches!(
            fsm("d[0-9]+").strings(),
            Err(SimError::InfiniteLanguage(_))
        ));
    }

    #[test]
    fn render_round_trips() {
        for pattern in [
            "d0dc1",
            "d[0-2]dc1",
            "(tor|agg)[1-4]pod[0-9]dc2",
            "sw\\.edge[0-3]",
            "d[0-9]+dc1",
        ] {
            let f = fsm(pattern);
            let rendered = f.to_regex();
            let back = fsm(&rendered);
            assert!(
                back.language_eq(&f),
                "{pattern:?} rendered as {rendered:?} is not language-equal"
            );
        }
    }

    #[test]
    fn minimized_preserves_language() {
        let a = fsm("d[0-3]dc1");
        let b = fsm("d[2-5]dc1");
        let inter = a.intersect(&b);
        let min = inter.minimized();
        assert!(min.language_eq(&inter));
        assert!(min.state_count() <= inter.state_count());
    }

    #[test]
    fn empty_language() {
        let a = fsm("d0dc1");
        let b = fsm("d1dc1");
        assert!(a.intersect(&b).is_empty_language());
        assert!(!a.is_empty_language());
    }
}
