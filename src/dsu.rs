//! # Disjoint Set Union over contacts
//!
//! Union-Find used by the audit to group contacts that are connected by a
//! shared email, a shared phone number or a stored link.

use crate::model::ContactId;
use hashbrown::HashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ContactDsu {
    parent: HashMap<ContactId, ContactId>,
    rank: HashMap<ContactId, u32>,
    component_count: usize,
}

impl ContactDsu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact as its own component. Adding a known contact is a no-op.
    pub fn add(&mut self, id: ContactId) {
        if self.parent.contains_key(&id) {
            return;
        }
        self.parent.insert(id, id);
        self.rank.insert(id, 0);
        self.component_count += 1;
    }

    pub fn contains(&self, id: ContactId) -> bool {
        self.parent.contains_key(&id)
    }

    /// Root of `id`, halving the path on the way. Unknown ids are their own root.
    pub fn find(&mut self, id: ContactId) -> ContactId {
        let mut current = id;
        loop {
            let Some(&parent) = self.parent.get(&current) else {
                return current;
            };
            if parent == current {
                return current;
            }
            let grandparent = self.parent.get(&parent).copied().unwrap_or(parent);
            self.parent.insert(current, grandparent);
            current = grandparent;
        }
    }

    /// Merge the components of `a` and `b`, adding either one if unknown.
    /// Returns `false` when they were already joined.
    pub fn union(&mut self, a: ContactId, b: ContactId) -> bool {
        self.add(a);
        self.add(b);
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }

        let rank_a = self.rank.get(&root_a).copied().unwrap_or(0);
        let rank_b = self.rank.get(&root_b).copied().unwrap_or(0);
        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else if rank_a > rank_b {
            self.parent.insert(root_b, root_a);
        } else {
            self.parent.insert(root_a, root_b);
            self.rank.insert(root_b, rank_b + 1);
        }
        self.component_count = self.component_count.saturating_sub(1);
        true
    }

    pub fn same_component(&mut self, a: ContactId, b: ContactId) -> bool {
        self.find(a) == self.find(b)
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    /// Every component as a sorted id list, ordered by smallest member.
    pub fn components(&mut self) -> Vec<Vec<ContactId>> {
        let ids: Vec<ContactId> = self.parent.keys().copied().collect();
        let mut grouped: HashMap<ContactId, Vec<ContactId>> = HashMap::new();
        for id in ids {
            let root = self.find(id);
            grouped.entry(root).or_default().push(id);
        }
        let mut ordered: BTreeMap<ContactId, Vec<ContactId>> = BTreeMap::new();
        for (_, mut members) in grouped {
            members.sort();
            if let Some(&first) = members.first() {
                ordered.insert(first, members);
            }
        }
        ordered.into_values().collect()
    }
}
