//! Desired state vs. recorded state
//!
//! The record decides what exists. A live listing is consulted for two things
//! only: finding leftovers of interrupted steps (so they can be torn down) and
//! refusing to touch objects nobody recorded.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::control::Handle;
use crate::planner::graph::{dependents, DesiredStateGraph, ResourceId};
use crate::state::{LifecycleRecord, ResourceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    /// Recorded but no longer desired
    Orphan,
    /// READY with a different fingerprint, or depends on something replaced
    Replace,
    /// Interrupted step left a live object behind
    Leftover,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    /// Resources to remove before anything is created
    pub teardown: BTreeMap<ResourceId, TeardownReason>,
    /// Resources to bring to READY
    pub create: BTreeSet<ResourceId>,
    /// Live objects with the name of a desired resource that was never recorded
    pub conflicts: BTreeSet<ResourceId>,
    /// READY resources left as they are
    pub unchanged: BTreeSet<ResourceId>,
}

impl ActionPlan {
    /// Nothing to do at all
    pub fn is_noop(&self) -> bool {
        self.teardown.is_empty() && self.create.is_empty() && self.conflicts.is_empty()
    }
}

// ============================================================================
// SBIO: Pure diff (no I/O)
// ============================================================================

/// Compute the actions that converge `record` onto `graph`.
///
/// `live` is the current control-plane listing.
pub fn plan_actions(
    graph: &DesiredStateGraph,
    record: &LifecycleRecord,
    live: &HashSet<Handle>,
) -> ActionPlan {
    let mut plan = ActionPlan::default();
    let is_live = |id: &ResourceId| -> bool {
        record
            .resources
            .get(id)
            .map(|r| Handle::for_spec(&r.spec))
            .or_else(|| graph.get(id).map(|n| Handle::for_spec(&n.spec)))
            .is_some_and(|h| live.contains(&h))
    };

    for (id, node) in &graph.nodes {
        match record.resources.get(id) {
            None => {
                if live.contains(&Handle::for_spec(&node.spec)) {
                    plan.conflicts.insert(id.clone());
                } else {
                    plan.create.insert(id.clone());
                }
            }
            Some(r) => match r.status {
                ResourceStatus::Ready if r.fingerprint == node.fingerprint => {
                    plan.unchanged.insert(id.clone());
                }
                ResourceStatus::Ready => {
                    plan.teardown.insert(id.clone(), TeardownReason::Replace);
                    plan.create.insert(id.clone());
                }
                ResourceStatus::Pending => {
                    if is_live(id) {
                        plan.conflicts.insert(id.clone());
                    } else {
                        plan.create.insert(id.clone());
                    }
                }
                ResourceStatus::Creating | ResourceStatus::Failed | ResourceStatus::Destroying => {
                    if is_live(id) {
                        plan.teardown.insert(id.clone(), TeardownReason::Leftover);
                    }
                    plan.create.insert(id.clone());
                }
            },
        }
    }

    for id in record.resources.keys() {
        if graph.get(id).is_none() {
            plan.teardown.insert(id.clone(), TeardownReason::Orphan);
        }
    }

    // Anything READY that sits on top of a replaced resource is rebuilt too
    let mut edges = graph.edges();
    for (id, deps) in record.edges() {
        edges.entry(id).or_insert(deps);
    }
    let reverse = dependents(&edges);
    let mut stack: Vec<ResourceId> = plan
        .teardown
        .iter()
        .filter(|(_, reason)| **reason == TeardownReason::Replace)
        .map(|(id, _)| id.clone())
        .collect();
    while let Some(id) = stack.pop() {
        for dep in reverse.get(&id).into_iter().flatten() {
            if plan.unchanged.remove(dep) {
                plan.teardown.insert(dep.clone(), TeardownReason::Replace);
                plan.create.insert(dep.clone());
                stack.push(dep.clone());
            }
        }
    }

    plan
}
