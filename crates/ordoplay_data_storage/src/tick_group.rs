// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tick phases and named tick groups.
//!
//! Every phase runs its groups in an order derived from before/after
//! constraints. A group's registered defaults always apply; queries placed
//! in the group can only add constraints on top of them.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Phase of a storage tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum TickPhase {
    /// Before physics
    #[default]
    PrePhysics,
    /// Alongside physics
    DuringPhysics,
    /// After physics
    PostPhysics,
    /// End of the frame
    FrameEnd,
}

impl TickPhase {
    /// Phases in execution order
    pub const ALL: [Self; 4] = [Self::PrePhysics, Self::DuringPhysics, Self::PostPhysics, Self::FrameEnd];
}

/// Name of a tick group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TickGroupName(pub Cow<'static, str>);

impl TickGroupName {
    /// Copies external data into the storage
    pub const SYNC_EXTERNAL_TO_DATA_STORAGE: Self = Self::new("SyncExternalToDataStorage");
    /// Group of queries that name none
    pub const DEFAULT: Self = Self::new("Default");
    /// Before the update
    pub const PRE_UPDATE: Self = Self::new("PreUpdate");
    /// Main update
    pub const UPDATE: Self = Self::new("Update");
    /// After the update
    pub const POST_UPDATE: Self = Self::new("PostUpdate");
    /// Copies storage data back out
    pub const SYNC_DATA_STORAGE_TO_EXTERNAL: Self = Self::new("SyncDataStorageToExternal");
    /// Widget refresh, main thread only
    pub const SYNC_WIDGETS: Self = Self::new("SyncWidgets");

    /// Group with a static name
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Group name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TickGroupName {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<String> for TickGroupName {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for TickGroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Constraints that apply to every query in a group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickGroupDefaults {
    /// Groups this one runs before
    pub before: Vec<TickGroupName>,
    /// Groups this one runs after
    pub after: Vec<TickGroupName>,
    /// Whether the group must run on the ticking thread
    pub main_thread: bool,
}

/// Extra constraints a query adds to its group
pub(crate) struct GroupConstraints<'a> {
    pub group: &'a TickGroupName,
    pub before: &'a [TickGroupName],
    pub after: &'a [TickGroupName],
}

/// Registered tick groups per phase
#[derive(Debug, Default)]
pub struct TickGroups {
    groups: IndexMap<(TickPhase, TickGroupName), TickGroupDefaults>,
}

impl TickGroups {
    /// Groups with the standard editor chain registered in every phase
    pub fn with_defaults() -> Self {
        let mut groups = Self::default();
        let chain = [
            TickGroupName::SYNC_EXTERNAL_TO_DATA_STORAGE,
            TickGroupName::DEFAULT,
            TickGroupName::PRE_UPDATE,
            TickGroupName::UPDATE,
            TickGroupName::POST_UPDATE,
            TickGroupName::SYNC_DATA_STORAGE_TO_EXTERNAL,
        ];
        for phase in TickPhase::ALL {
            for (position, name) in chain.iter().enumerate() {
                let after = position.checked_sub(1).map(|previous| chain[previous].clone());
                groups.register(name.clone(), phase, Vec::new(), after.into_iter().collect(), false);
            }
            groups.register(
                TickGroupName::SYNC_WIDGETS,
                phase,
                Vec::new(),
                vec![TickGroupName::POST_UPDATE],
                true,
            );
        }
        groups
    }

    /// Register group defaults. A group is registered once per phase; later
    /// registrations are ignored.
    pub fn register(
        &mut self,
        name: TickGroupName,
        phase: TickPhase,
        before: Vec<TickGroupName>,
        after: Vec<TickGroupName>,
        main_thread: bool,
    ) -> bool {
        let key = (phase, name);
        if self.groups.contains_key(&key) {
            tracing::debug!(group = %key.1, phase = ?phase, "Tick group already registered");
            return false;
        }
        tracing::debug!(group = %key.1, phase = ?phase, "Registered tick group");
        self.groups.insert(
            key,
            TickGroupDefaults {
                before,
                after,
                main_thread,
            },
        );
        true
    }

    /// Remove group defaults
    pub fn unregister(&mut self, name: &TickGroupName, phase: TickPhase) -> bool {
        self.groups.shift_remove(&(phase, name.clone())).is_some()
    }

    /// Defaults of a group
    pub fn defaults(&self, name: &TickGroupName, phase: TickPhase) -> Option<&TickGroupDefaults> {
        self.groups.get(&(phase, name.clone()))
    }

    /// Groups of `phase` in execution order.
    ///
    /// Includes every registered group plus any group named by `constraints`.
    /// Constraints on groups outside that set are ignored. A cycle is logged
    /// and the groups caught in it run in registration order.
    pub(crate) fn order(&self, phase: TickPhase, constraints: &[GroupConstraints<'_>]) -> Vec<TickGroupName> {
        let mut nodes: IndexSet<TickGroupName> = self
            .groups
            .keys()
            .filter(|(group_phase, _)| *group_phase == phase)
            .map(|(_, name)| name.clone())
            .collect();
        for constraint in constraints {
            nodes.insert(constraint.group.clone());
        }

        let mut edges: Vec<(usize, usize)> = Vec::new();
        let mut add_edge = |first: &TickGroupName, second: &TickGroupName| {
            if let (Some(a), Some(b)) = (nodes.get_index_of(first), nodes.get_index_of(second)) {
                if a != b && !edges.contains(&(a, b)) {
                    edges.push((a, b));
                }
            }
        };
        for ((group_phase, name), defaults) in &self.groups {
            if *group_phase != phase {
                continue;
            }
            for before in &defaults.before {
                add_edge(name, before);
            }
            for after in &defaults.after {
                add_edge(after, name);
            }
        }
        for constraint in constraints {
            for before in constraint.before {
                add_edge(constraint.group, before);
            }
            for after in constraint.after {
                add_edge(after, constraint.group);
            }
        }

        let mut incoming = vec![0_usize; nodes.len()];
        for &(_, to) in &edges {
            incoming[to] += 1;
        }
        let mut order = Vec::with_capacity(nodes.len());
        let mut placed = vec![false; nodes.len()];
        while order.len() < nodes.len() {
            let next = (0..nodes.len()).find(|&node| !placed[node] && incoming[node] == 0);
            let Some(next) = next else {
                let stuck: Vec<&str> = (0..nodes.len())
                    .filter(|&node| !placed[node])
                    .filter_map(|node| nodes.get_index(node).map(TickGroupName::as_str))
                    .collect();
                tracing::warn!(phase = ?phase, groups = ?stuck, "Tick group constraints form a cycle");
                order.extend((0..nodes.len()).filter(|&node| !placed[node]));
                break;
            };
            placed[next] = true;
            order.push(next);
            for &(from, to) in &edges {
                if from == next {
                    incoming[to] -= 1;
                }
            }
        }
        order
            .into_iter()
            .filter_map(|node| nodes.get_index(node).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[TickGroupName], name: &TickGroupName) -> usize {
        order.iter().position(|group| group == name).unwrap()
    }

    #[test]
    fn test_default_chain_order() {
        let groups = TickGroups::with_defaults();
        let order = groups.order(TickPhase::PrePhysics, &[]);
        assert_eq!(order.len(), 7);
        assert_eq!(order[0], TickGroupName::SYNC_EXTERNAL_TO_DATA_STORAGE);
        assert!(position(&order, &TickGroupName::DEFAULT) < position(&order, &TickGroupName::PRE_UPDATE));
        assert!(position(&order, &TickGroupName::UPDATE) < position(&order, &TickGroupName::POST_UPDATE));
        assert!(position(&order, &TickGroupName::POST_UPDATE) < position(&order, &TickGroupName::SYNC_WIDGETS));
        assert!(groups.defaults(&TickGroupName::SYNC_WIDGETS, TickPhase::FrameEnd).unwrap().main_thread);
    }

    #[test]
    fn test_registered_once() {
        let mut groups = TickGroups::default();
        let name = TickGroupName::new("Custom");
        assert!(groups.register(name.clone(), TickPhase::FrameEnd, vec![], vec![], false));
        assert!(!groups.register(name.clone(), TickPhase::FrameEnd, vec![], vec![], true));
        assert!(!groups.defaults(&name, TickPhase::FrameEnd).unwrap().main_thread);
        assert!(groups.unregister(&name, TickPhase::FrameEnd));
        assert!(groups.defaults(&name, TickPhase::FrameEnd).is_none());
    }

    #[test]
    fn test_query_constraints_union_with_defaults() {
        let groups = TickGroups::with_defaults();
        let late = TickGroupName::new("Late");
        let before = [TickGroupName::SYNC_EXTERNAL_TO_DATA_STORAGE];
        let order = groups.order(
            TickPhase::PrePhysics,
            &[GroupConstraints {
                group: &late,
                before: &before,
                after: &[],
            }],
        );
        assert_eq!(order[0], late);
        assert!(position(&order, &TickGroupName::DEFAULT) < position(&order, &TickGroupName::UPDATE));
    }

    #[test]
    fn test_cycle_still_orders_everything() {
        let mut groups = TickGroups::default();
        let (a, b) = (TickGroupName::new("A"), TickGroupName::new("B"));
        groups.register(a.clone(), TickPhase::PrePhysics, vec![], vec![b.clone()], false);
        groups.register(b.clone(), TickPhase::PrePhysics, vec![], vec![a.clone()], false);
        let order = groups.order(TickPhase::PrePhysics, &[]);
        assert_eq!(order, vec![a, b]);
    }
}
