//! Pure statechart step machinery: transition selection, transition domains,
//! exit/entry set computation, history recording and restoration. Everything
//! here is synchronous and side-effect free; `machine.rs` drives it and runs
//! the actions.
//!
//! Ordering relies on the arena being built in document pre-order: ascending
//! `StateId` is document order (parents before children), so descending id is
//! exit order and ascending id is entry order.

use crate::chart::MachineChart;
use crate::types::*;
use std::collections::{BTreeMap, BTreeSet};

/// Recorded history: history-node id → the state set to restore.
pub type HistoryStore = BTreeMap<StateId, Vec<StateId>>;

/// What transition lists to search during selection.
#[derive(Clone, Copy)]
pub enum Trigger<'a> {
    Named(&'a str),
    /// Eventless (`always`) transitions.
    Always,
}

/// Select the transition set for one microstep.
///
/// Walks each active leaf from the leaf outward and takes the first
/// transition whose guards all pass; one winner per orthogonal region.
/// Winners whose exit sets overlap are reduced by preferring the deeper
/// source.
pub fn select_transitions(
    chart: &MachineChart,
    active: &BTreeSet<StateId>,
    trigger: Trigger<'_>,
    guard_eval: &mut dyn FnMut(&str) -> bool,
) -> Vec<Transition> {
    let mut selected: Vec<Transition> = Vec::new();

    for leaf in active_leaves(chart, active) {
        let mut cursor = Some(leaf);
        'walk: while let Some(state) = cursor {
            let candidates: Option<&Vec<Transition>> = match trigger {
                Trigger::Named(name) => chart.node(state).on.get(name),
                Trigger::Always => {
                    let always = &chart.node(state).always;
                    if always.is_empty() {
                        None
                    } else {
                        Some(always)
                    }
                }
            };
            if let Some(candidates) = candidates {
                for t in candidates {
                    if t.guards.iter().all(|g| guard_eval(g)) {
                        if !selected.contains(t) {
                            selected.push(t.clone());
                        }
                        break 'walk;
                    }
                }
            }
            cursor = chart.parent_of(state);
        }
    }

    resolve_conflicts(chart, active, selected)
}

/// Drop transitions whose exit sets overlap a deeper-sourced winner.
fn resolve_conflicts(
    chart: &MachineChart,
    active: &BTreeSet<StateId>,
    candidates: Vec<Transition>,
) -> Vec<Transition> {
    let mut kept: Vec<(Transition, BTreeSet<StateId>)> = Vec::new();

    'next: for t in candidates {
        let t_exit = exit_set(chart, active, &t);
        let mut to_remove = Vec::new();
        for (i, (existing, e_exit)) in kept.iter().enumerate() {
            let disjoint = t_exit.is_disjoint(e_exit);
            if !disjoint {
                if chart.depth(t.source) > chart.depth(existing.source) {
                    to_remove.push(i);
                } else {
                    continue 'next;
                }
            }
        }
        for i in to_remove.into_iter().rev() {
            kept.remove(i);
        }
        kept.push((t, t_exit));
    }

    kept.into_iter().map(|(t, _)| t).collect()
}

/// Active states with no active descendant, deepest-first in reverse
/// document order.
pub fn active_leaves(chart: &MachineChart, active: &BTreeSet<StateId>) -> Vec<StateId> {
    let mut leaves: Vec<StateId> = active
        .iter()
        .copied()
        .filter(|&s| {
            !chart
                .node(s)
                .children
                .iter()
                .any(|c| active.contains(c))
        })
        .collect();
    leaves.sort_unstable_by(|a, b| b.cmp(a));
    leaves
}

/// Atomic-leaf paths in document order, the externally visible configuration.
pub fn configuration_paths(chart: &MachineChart, active: &BTreeSet<StateId>) -> Vec<String> {
    let mut leaves = active_leaves(chart, active);
    leaves.sort_unstable();
    leaves
        .into_iter()
        .map(|s| {
            let p = &chart.node(s).path;
            if p.is_empty() {
                chart.id.clone()
            } else {
                p.clone()
            }
        })
        .collect()
}

/// The state whose subtree a transition exits and re-enters, or `None` for
/// internal/targetless transitions. The domain is the nearest compound (or
/// root) proper ancestor of the source that contains the target.
pub fn transition_domain(chart: &MachineChart, t: &Transition) -> Option<StateId> {
    let target = t.target?;
    if t.kind == TransitionKind::Internal {
        return None;
    }
    for anc in chart.ancestors(t.source) {
        let eligible = anc == chart.root || chart.node(anc).kind == StateKind::Compound;
        if eligible && chart.is_descendant(target, anc) {
            return Some(anc);
        }
    }
    Some(chart.root)
}

/// Active states the transition exits: everything strictly below the domain.
pub fn exit_set(chart: &MachineChart, active: &BTreeSet<StateId>, t: &Transition) -> BTreeSet<StateId> {
    match transition_domain(chart, t) {
        None => BTreeSet::new(),
        Some(domain) => active
            .iter()
            .copied()
            .filter(|&s| chart.is_descendant(s, domain))
            .collect(),
    }
}

/// Union exit list for a transition set, in exit order (reverse document
/// order, children before parents).
pub fn compute_exit_list(
    chart: &MachineChart,
    active: &BTreeSet<StateId>,
    transitions: &[Transition],
) -> Vec<StateId> {
    let mut set = BTreeSet::new();
    for t in transitions {
        set.extend(exit_set(chart, active, t));
    }
    set.into_iter().rev().collect()
}

/// Record history for every exited compound that declares history children.
/// Must run before the exit set is removed from the active configuration.
pub fn record_history(
    chart: &MachineChart,
    active: &BTreeSet<StateId>,
    exit_list: &[StateId],
    history: &mut HistoryStore,
) {
    for &exited in exit_list {
        let node = chart.node(exited);
        for &child in &node.children {
            let Some(kind) = chart.node(child).history else {
                continue;
            };
            let snapshot: Vec<StateId> = match kind {
                HistoryKind::Shallow => node
                    .children
                    .iter()
                    .copied()
                    .filter(|c| active.contains(c))
                    .collect(),
                HistoryKind::Deep => active
                    .iter()
                    .copied()
                    .filter(|&s| chart.is_descendant(s, exited) && chart.node(s).is_leaf())
                    .collect(),
            };
            if !snapshot.is_empty() {
                history.insert(child, snapshot);
            }
        }
    }
}

/// Union entry list for a transition set, in entry order (document order,
/// parents before children). History pseudostates are resolved here and
/// never appear in the output.
pub fn compute_entry_list(
    chart: &MachineChart,
    transitions: &[Transition],
    history: &HistoryStore,
) -> Vec<StateId> {
    let mut set = BTreeSet::new();
    for t in transitions {
        let Some(domain) = transition_domain(chart, t) else {
            continue;
        };
        let Some(target) = t.target else { continue };
        add_entry_target(chart, &mut set, domain, target, history);
    }
    complete_entry_set(chart, &mut set, history);
    set.into_iter().collect()
}

/// Entry list for the initial configuration: the root plus its completion.
pub fn initial_entry_list(chart: &MachineChart, history: &HistoryStore) -> Vec<StateId> {
    let mut set = BTreeSet::new();
    set.insert(chart.root);
    complete_entry_set(chart, &mut set, history);
    set.into_iter().collect()
}

fn add_entry_target(
    chart: &MachineChart,
    set: &mut BTreeSet<StateId>,
    domain: StateId,
    target: StateId,
    history: &HistoryStore,
) {
    if chart.node(target).kind == StateKind::History {
        let parent = chart
            .parent_of(target)
            .unwrap_or(chart.root);
        add_chain(chart, set, domain, parent);
        match history.get(&target) {
            Some(stored) if !stored.is_empty() => {
                for &restored in stored {
                    add_chain(chart, set, parent, restored);
                }
            }
            _ => {
                let fallback = chart.node(target).history_default.or_else(|| {
                    chart.node(parent).initial
                });
                if let Some(fallback) = fallback {
                    add_chain(chart, set, parent, fallback);
                }
            }
        }
    } else {
        add_chain(chart, set, domain, target);
    }
}

/// Insert `node` and its ancestors below `top` (exclusive).
fn add_chain(chart: &MachineChart, set: &mut BTreeSet<StateId>, top: StateId, node: StateId) {
    let mut cursor = Some(node);
    while let Some(s) = cursor {
        if s == top {
            break;
        }
        set.insert(s);
        cursor = chart.parent_of(s);
    }
}

/// Close the entry set: compounds get their initial child unless an explicit
/// descendant path already chose one; parallels get every region.
fn complete_entry_set(chart: &MachineChart, set: &mut BTreeSet<StateId>, history: &HistoryStore) {
    loop {
        let mut additions: Vec<StateId> = Vec::new();
        for &s in set.iter() {
            let node = chart.node(s);
            match node.kind {
                StateKind::Compound => {
                    let has_explicit_child =
                        node.children.iter().any(|c| set.contains(c));
                    if !has_explicit_child {
                        if let Some(initial) = node.initial {
                            if chart.node(initial).kind == StateKind::History {
                                // A history initial replays its record.
                                let mut sub = BTreeSet::new();
                                add_entry_target(chart, &mut sub, s, initial, history);
                                additions.extend(sub);
                            } else {
                                additions.push(initial);
                            }
                        }
                    }
                }
                StateKind::Parallel => {
                    for &region in &node.children {
                        if chart.node(region).kind != StateKind::History
                            && !set.contains(&region)
                        {
                            additions.push(region);
                        }
                    }
                }
                _ => {}
            }
        }
        additions.retain(|a| !set.contains(a));
        if additions.is_empty() {
            return;
        }
        set.extend(additions);
    }
}

/// A compound is final when its active child is a final state; a parallel is
/// final when every region is.
pub fn is_in_final_state(chart: &MachineChart, active: &BTreeSet<StateId>, s: StateId) -> bool {
    let node = chart.node(s);
    match node.kind {
        StateKind::Compound => node.children.iter().any(|&c| {
            active.contains(&c) && chart.node(c).kind == StateKind::Final
        }),
        StateKind::Parallel => node
            .children
            .iter()
            .filter(|&&c| chart.node(c).kind != StateKind::History)
            .all(|&c| is_in_final_state(chart, active, c)),
        _ => false,
    }
}
