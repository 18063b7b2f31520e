//! Canonical summary of a settled cluster.

use crate::model::{Contact, ContactId, ContactSummary};

/// Build the response view of `cluster` (oldest first) whose primary is
/// `primary`.
///
/// Emails and phone numbers are deduplicated in first-seen order, starting
/// with the primary's own values. Secondary ids are sorted ascending.
/// `primary_contact_id` is `None` only when the primary is not part of
/// `cluster`.
pub fn build_summary(cluster: &[Contact], primary: ContactId) -> ContactSummary {
    let primary_contact = cluster.iter().find(|contact| contact.id == primary);
    let ordered = primary_contact
        .into_iter()
        .chain(cluster.iter().filter(|contact| contact.id != primary));

    let mut emails: Vec<String> = Vec::new();
    let mut phone_numbers: Vec<String> = Vec::new();
    for contact in ordered {
        push_distinct(&mut emails, contact.email.as_deref());
        push_distinct(&mut phone_numbers, contact.phone_number.as_deref());
    }

    let mut secondary_contact_ids: Vec<ContactId> = cluster
        .iter()
        .map(|contact| contact.id)
        .filter(|id| *id != primary)
        .collect();
    secondary_contact_ids.sort();
    secondary_contact_ids.dedup();

    ContactSummary {
        primary_contact_id: primary_contact.map(|contact| contact.id),
        emails,
        phone_numbers,
        secondary_contact_ids,
    }
}

fn push_distinct(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}
