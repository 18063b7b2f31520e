//! # Cluster Resolution
//!
//! Candidate lookup, root selection and cluster materialization: the read
//! half of the identify pipeline.

use crate::deadline::Deadline;
use crate::error::{Result, Stage, StageContext};
use crate::model::{sort_by_age, Contact, ContactId, Observation};
use crate::store::ContactStore;
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Every contact sharing the observation's email or phone number, oldest first.
pub fn find_candidates(
    store: &dyn ContactStore,
    observation: &Observation,
    deadline: &Deadline,
) -> Result<Vec<Contact>> {
    deadline.check(Stage::FindCandidates)?;
    store
        .find_by_email_or_phone(observation.email(), observation.phone_number())
        .at(Stage::FindCandidates)
}

/// Distinct primaries the candidates claim to belong to.
pub fn primary_pointers(candidates: &[Contact]) -> BTreeSet<ContactId> {
    candidates
        .iter()
        .filter_map(Contact::primary_pointer)
        .collect()
}

/// Chosen cluster root and how it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootResolution {
    pub root: ContactId,
    /// Every primary pointer seen among the candidates.
    pub pointers: BTreeSet<ContactId>,
    /// No candidate carried a pointer; the oldest candidate was used instead.
    pub fallback: bool,
}

/// Pick the root for a set of candidates: the smallest primary pointer, which
/// favours the oldest cluster since ids follow creation order. Falls back to
/// the oldest candidate. Returns `None` for an empty candidate list.
pub fn resolve_root(candidates: &[Contact]) -> Option<RootResolution> {
    let pointers = primary_pointers(candidates);
    if let Some(&root) = pointers.first() {
        return Some(RootResolution {
            root,
            pointers,
            fallback: false,
        });
    }
    candidates
        .iter()
        .min_by_key(|contact| contact.age_key())
        .map(|oldest| RootResolution {
            root: oldest.id,
            pointers,
            fallback: true,
        })
}

/// Ids whose cluster keys must be held while consolidating these candidates.
pub fn cluster_lock_targets(candidates: &[Contact]) -> BTreeSet<ContactId> {
    match resolve_root(candidates) {
        Some(resolution) if resolution.fallback => BTreeSet::from([resolution.root]),
        Some(resolution) => resolution.pointers,
        None => BTreeSet::new(),
    }
}

/// How the primary of a materialized group was designated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Designation {
    /// The root itself is a primary.
    Root,
    /// Another primary in the group.
    OtherPrimary,
    /// No primary at all; the oldest member will be promoted.
    OldestMember,
}

/// Authoritative snapshot of the cluster(s) an observation touches.
#[derive(Debug, Clone)]
pub struct ClusterGroup {
    root: ContactId,
    members: Vec<Contact>,
}

impl ClusterGroup {
    pub fn root(&self) -> ContactId {
        self.root
    }

    pub fn members(&self) -> &[Contact] {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut [Contact] {
        &mut self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn push(&mut self, contact: Contact) {
        self.members.push(contact);
        sort_by_age(&mut self.members);
    }

    /// The primary new secondaries should link to: the root when it is a
    /// primary, else the oldest primary, else the oldest member.
    pub fn designated_primary(&self) -> Option<(ContactId, Designation)> {
        if self
            .members
            .iter()
            .any(|contact| contact.id == self.root && contact.is_primary())
        {
            return Some((self.root, Designation::Root));
        }
        if let Some(primary) = self.members.iter().find(|contact| contact.is_primary()) {
            return Some((primary.id, Designation::OtherPrimary));
        }
        self.members
            .first()
            .map(|oldest| (oldest.id, Designation::OldestMember))
    }
}

/// Re-read every cluster the candidates point into and merge them into one
/// group, oldest first.
///
/// Starting from the root and every candidate pointer, each cluster is read
/// with `find_by_primary_or_linked`; members pointing at a cluster not yet
/// read are followed, so a link left dangling by an interrupted merge is
/// pulled back into the group. Candidates are kept even when no read returns
/// them (secondaries with a missing link).
pub fn materialize_group(
    store: &dyn ContactStore,
    resolution: &RootResolution,
    candidates: &[Contact],
    deadline: &Deadline,
) -> Result<ClusterGroup> {
    let mut members: HashMap<ContactId, Contact> = candidates
        .iter()
        .map(|contact| (contact.id, contact.clone()))
        .collect();
    let mut visited = BTreeSet::new();
    let mut frontier: Vec<ContactId> = std::iter::once(resolution.root)
        .chain(resolution.pointers.iter().copied())
        .collect();

    while let Some(cluster_id) = frontier.pop() {
        if !visited.insert(cluster_id) {
            continue;
        }
        deadline.check(Stage::MaterializeGroup)?;
        let cluster = store
            .find_by_primary_or_linked(cluster_id)
            .at(Stage::MaterializeGroup)?;
        for contact in cluster {
            if let Some(pointer) = contact.primary_pointer() {
                if !visited.contains(&pointer) {
                    frontier.push(pointer);
                }
            }
            members.insert(contact.id, contact);
        }
    }

    let mut members: Vec<Contact> = members.into_values().collect();
    sort_by_age(&mut members);
    Ok(ClusterGroup {
        root: resolution.root,
        members,
    })
}
