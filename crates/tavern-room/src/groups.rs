//! Interest groups: byte-id subsets of active actors.

use std::collections::{BTreeMap, BTreeSet};

use tavern_protocol::ActorNr;

/// Group membership of a room. Group 0 is reserved and never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTable {
    groups: BTreeMap<u8, BTreeSet<ActorNr>>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the actor was not yet a member.
    pub fn add(&mut self, group: u8, actor: ActorNr) -> bool {
        if group == 0 {
            return false;
        }
        self.groups.entry(group).or_default().insert(actor)
    }

    pub fn remove(&mut self, group: u8, actor: ActorNr) -> bool {
        let Some(members) = self.groups.get_mut(&group) else {
            return false;
        };
        let removed = members.remove(&actor);
        if members.is_empty() {
            self.groups.remove(&group);
        }
        removed
    }

    /// Drops the actor from every group.
    pub fn remove_actor(&mut self, actor: ActorNr) {
        self.groups.retain(|_, members| {
            members.remove(&actor);
            !members.is_empty()
        });
    }

    pub fn members(&self, group: u8) -> impl Iterator<Item = ActorNr> + '_ {
        self.groups.get(&group).into_iter().flatten().copied()
    }

    /// Ids of every non-empty group.
    pub fn group_ids(&self) -> Vec<u8> {
        self.groups.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_ignores_group_zero() {
        let mut table = GroupTable::new();
        assert!(!table.add(0, ActorNr(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_actor_clears_empty_groups() {
        let mut table = GroupTable::new();
        table.add(1, ActorNr(1));
        table.add(2, ActorNr(1));
        table.add(2, ActorNr(2));

        table.remove_actor(ActorNr(1));
        assert_eq!(table.group_ids(), vec![2]);
        assert_eq!(table.members(2).collect::<Vec<_>>(), vec![ActorNr(2)]);
        assert_eq!(table.members(1).count(), 0);
    }

    #[test]
    fn test_remove_single_membership() {
        let mut table = GroupTable::new();
        table.add(7, ActorNr(3));
        assert!(table.remove(7, ActorNr(3)));
        assert!(!table.remove(7, ActorNr(3)));
        assert!(table.is_empty());
    }
}
