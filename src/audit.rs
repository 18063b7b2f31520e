//! # Cluster Audit
//!
//! Rebuilds clusters from a full store scan and reports every contact that
//! breaks the cluster shape: exactly one unlinked primary, the oldest
//! member, with every other member linked directly to it.
//!
//! Clusters are the connected components of "shares an email", "shares a
//! phone number" and "links to". Two primaries in one component means
//! consolidation missed a merge.

use crate::dsu::ContactDsu;
use crate::model::{sort_by_age, Contact, ContactId};
use crate::store::ContactStore;
use anyhow::Result;
use hashbrown::HashMap;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    NoPrimary {
        members: Vec<ContactId>,
    },
    MultiplePrimaries {
        primaries: Vec<ContactId>,
    },
    PrimaryWithLink {
        primary: ContactId,
        linked_id: ContactId,
    },
    /// Secondary whose link is missing or does not name the cluster primary.
    MislinkedSecondary {
        contact: ContactId,
        linked_id: Option<ContactId>,
        expected: ContactId,
    },
    PrimaryNotOldest {
        primary: ContactId,
        oldest: ContactId,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NoPrimary { members } => {
                write!(f, "cluster {} has no primary", join_ids(members))
            }
            Violation::MultiplePrimaries { primaries } => {
                write!(f, "cluster has several primaries: {}", join_ids(primaries))
            }
            Violation::PrimaryWithLink { primary, linked_id } => {
                write!(f, "primary {primary} links to {linked_id}")
            }
            Violation::MislinkedSecondary {
                contact,
                linked_id: Some(linked_id),
                expected,
            } => write!(f, "secondary {contact} links to {linked_id}, expected {expected}"),
            Violation::MislinkedSecondary {
                contact, expected, ..
            } => write!(f, "secondary {contact} has no link, expected {expected}"),
            Violation::PrimaryNotOldest { primary, oldest } => {
                write!(f, "primary {primary} is newer than member {oldest}")
            }
        }
    }
}

fn join_ids(ids: &[ContactId]) -> String {
    ids.iter()
        .map(ContactId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Audit every cluster in `store`. An empty result means the store is
/// consistent.
pub fn check_invariants(store: &dyn ContactStore) -> Result<Vec<Violation>> {
    let contacts = store.all_contacts()?;
    let violations = check_contacts(&contacts);
    debug!(
        contacts = contacts.len(),
        violations = violations.len(),
        "audited contact store"
    );
    Ok(violations)
}

/// Audit an in-memory snapshot of contacts.
pub fn check_contacts(contacts: &[Contact]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for cluster in clusters(contacts) {
        check_cluster(&cluster, &mut violations);
    }
    violations
}

/// Connected components of the contact graph, each sorted oldest first.
pub fn clusters(contacts: &[Contact]) -> Vec<Vec<Contact>> {
    let mut dsu = ContactDsu::new();
    let mut by_email: HashMap<&str, ContactId> = HashMap::new();
    let mut by_phone: HashMap<&str, ContactId> = HashMap::new();

    for contact in contacts {
        dsu.add(contact.id);
        if let Some(email) = contact.email.as_deref() {
            let first = *by_email.entry(email).or_insert(contact.id);
            dsu.union(first, contact.id);
        }
        if let Some(phone_number) = contact.phone_number.as_deref() {
            let first = *by_phone.entry(phone_number).or_insert(contact.id);
            dsu.union(first, contact.id);
        }
    }
    // Links to contacts missing from the scan are left out; the secondary
    // is reported as mislinked instead.
    for contact in contacts {
        if let Some(linked_id) = contact.linked_id {
            if dsu.contains(linked_id) {
                dsu.union(contact.id, linked_id);
            }
        }
    }

    let by_id: HashMap<ContactId, &Contact> =
        contacts.iter().map(|contact| (contact.id, contact)).collect();
    dsu.components()
        .into_iter()
        .map(|ids| {
            let mut members: Vec<Contact> = ids
                .iter()
                .filter_map(|id| by_id.get(id).map(|contact| (*contact).clone()))
                .collect();
            sort_by_age(&mut members);
            members
        })
        .collect()
}

fn check_cluster(cluster: &[Contact], violations: &mut Vec<Violation>) {
    let Some(oldest) = cluster.first() else {
        return;
    };
    let primaries: Vec<&Contact> = cluster.iter().filter(|c| c.is_primary()).collect();

    for primary in &primaries {
        if let Some(linked_id) = primary.linked_id {
            violations.push(Violation::PrimaryWithLink {
                primary: primary.id,
                linked_id,
            });
        }
    }

    let primary = match primaries.as_slice() {
        [] => {
            violations.push(Violation::NoPrimary {
                members: cluster.iter().map(|contact| contact.id).collect(),
            });
            return;
        }
        [primary] => *primary,
        several => {
            violations.push(Violation::MultiplePrimaries {
                primaries: several.iter().map(|contact| contact.id).collect(),
            });
            return;
        }
    };

    if primary.id != oldest.id {
        violations.push(Violation::PrimaryNotOldest {
            primary: primary.id,
            oldest: oldest.id,
        });
    }
    for contact in cluster.iter().filter(|contact| !contact.is_primary()) {
        if contact.linked_id != Some(primary.id) {
            violations.push(Violation::MislinkedSecondary {
                contact: contact.id,
                linked_id: contact.linked_id,
                expected: primary.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinkPrecedence::{self, Primary, Secondary};
    use crate::store::MemoryContactStore;
    use time::{Duration, OffsetDateTime};

    fn contact(
        id: u64,
        email: Option<&str>,
        phone_number: Option<&str>,
        precedence: LinkPrecedence,
        linked: Option<u64>,
    ) -> Contact {
        Contact {
            id: ContactId(id),
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: linked.map(ContactId),
            link_precedence: precedence,
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::minutes(id as i64),
        }
    }

    #[test]
    fn test_consistent_store_has_no_violations() -> anyhow::Result<()> {
        let store = MemoryContactStore::new();
        store.seed(contact(1, Some("a@x.com"), Some("1"), Primary, None))?;
        store.seed(contact(2, Some("b@x.com"), Some("1"), Secondary, Some(1)))?;
        // Shares nothing with the primary but is linked to it.
        store.seed(contact(3, Some("c@x.com"), Some("3"), Secondary, Some(1)))?;
        store.seed(contact(4, Some("d@x.com"), None, Primary, None))?;

        assert!(check_invariants(&store)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_unmerged_primaries_sharing_a_value() {
        let contacts = vec![
            contact(1, Some("a@x.com"), None, Primary, None),
            contact(2, Some("a@x.com"), Some("2"), Primary, None),
        ];
        assert_eq!(
            check_contacts(&contacts),
            vec![Violation::MultiplePrimaries {
                primaries: vec![ContactId(1), ContactId(2)],
            }]
        );
    }

    #[test]
    fn test_chained_link_and_primary_link() {
        let contacts = vec![
            contact(1, Some("a@x.com"), None, Primary, Some(9)),
            contact(2, Some("a@x.com"), Some("2"), Secondary, Some(1)),
            contact(3, None, Some("2"), Secondary, Some(2)),
        ];
        let violations = check_contacts(&contacts);
        assert!(violations.contains(&Violation::PrimaryWithLink {
            primary: ContactId(1),
            linked_id: ContactId(9),
        }));
        assert!(violations.contains(&Violation::MislinkedSecondary {
            contact: ContactId(3),
            linked_id: Some(ContactId(2)),
            expected: ContactId(1),
        }));
    }

    #[test]
    fn test_primary_not_oldest_and_missing_primary() {
        let contacts = vec![
            contact(1, Some("a@x.com"), None, Secondary, Some(2)),
            contact(2, Some("a@x.com"), None, Primary, None),
            contact(3, Some("z@x.com"), None, Secondary, None),
        ];
        let violations = check_contacts(&contacts);
        assert_eq!(
            violations,
            vec![
                Violation::PrimaryNotOldest {
                    primary: ContactId(2),
                    oldest: ContactId(1),
                },
                Violation::NoPrimary {
                    members: vec![ContactId(3)],
                },
            ]
        );
        assert_eq!(violations[1].to_string(), "cluster C3 has no primary");
    }
}
