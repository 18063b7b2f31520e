//! # Cluster Repair
//!
//! Computes the link writes that restore "one primary, every other member
//! linked directly to it" for a materialized group.
//!
//! Planning is pure; the orchestrator persists each update as an
//! independent single-record write and then mirrors the plan onto its
//! in-memory group. Updates are ordered demotions, promotion, relinks.

use crate::model::{Contact, ContactId, LinkPrecedence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkUpdate {
    pub id: ContactId,
    pub precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPlan {
    pub primary: ContactId,
    /// Extra primaries turned into secondaries of `primary`.
    pub demoted: Vec<ContactId>,
    /// Set when the group had no primary and its oldest member was promoted.
    pub promoted: Option<ContactId>,
    /// Members whose stored link disagreed with the settled primary.
    pub relinked: Vec<ContactId>,
    pub updates: Vec<LinkUpdate>,
}

impl RepairPlan {
    pub fn is_noop(&self) -> bool {
        self.updates.is_empty()
    }

    /// Mirror the planned writes onto an in-memory copy of the group.
    pub fn apply(&self, members: &mut [Contact]) {
        for update in &self.updates {
            if let Some(contact) = members.iter_mut().find(|contact| contact.id == update.id) {
                contact.link_precedence = update.precedence;
                contact.linked_id = update.linked_id;
            }
        }
    }
}

/// Plan the repair of a group sorted oldest first. `None` for an empty group.
pub fn plan_repair(members: &[Contact]) -> Option<RepairPlan> {
    let oldest = members.iter().min_by_key(|contact| contact.age_key())?;

    let mut primaries: Vec<&Contact> = members.iter().filter(|c| c.is_primary()).collect();
    primaries.sort_by_key(|contact| contact.age_key());

    let mut updates = Vec::new();
    let mut demoted = Vec::new();
    let mut promoted = None;

    // Primary collisions: the oldest primary wins.
    let primary = match primaries.split_first() {
        Some((winner, rest)) => {
            for loser in rest {
                demoted.push(loser.id);
                updates.push(LinkUpdate {
                    id: loser.id,
                    precedence: LinkPrecedence::Secondary,
                    linked_id: Some(winner.id),
                });
            }
            *winner
        }
        None => {
            promoted = Some(oldest.id);
            updates.push(LinkUpdate {
                id: oldest.id,
                precedence: LinkPrecedence::Primary,
                linked_id: None,
            });
            oldest
        }
    };

    let mut relinked = Vec::new();
    if promoted.is_none() && primary.linked_id.is_some() {
        relinked.push(primary.id);
        updates.push(LinkUpdate {
            id: primary.id,
            precedence: LinkPrecedence::Primary,
            linked_id: None,
        });
    }
    for contact in members {
        if contact.id == primary.id || demoted.contains(&contact.id) {
            continue;
        }
        let settled = contact.link_precedence == LinkPrecedence::Secondary
            && contact.linked_id == Some(primary.id);
        if !settled {
            relinked.push(contact.id);
            updates.push(LinkUpdate {
                id: contact.id,
                precedence: LinkPrecedence::Secondary,
                linked_id: Some(primary.id),
            });
        }
    }

    Some(RepairPlan {
        primary: primary.id,
        demoted,
        promoted,
        relinked,
        updates,
    })
}
