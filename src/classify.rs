//! Decides whether an observation is already captured by its cluster.

use crate::model::{Contact, ContactId, Observation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A member carries every provided field of the observation.
    ExactMatch(ContactId),
    /// Members share the email or the phone number, but no single member
    /// carries the combination.
    PartialOverlap,
    /// No member shares any provided field.
    Disjoint,
}

impl Classification {
    /// Anything short of an exact match is a new combination worth recording.
    pub fn needs_insert(&self) -> bool {
        !matches!(self, Classification::ExactMatch(_))
    }
}

/// Exact match: every field the observation provides equals the member's
/// field. Absent observation fields are not compared.
pub fn is_exact_match(contact: &Contact, observation: &Observation) -> bool {
    let email_matches = observation
        .email()
        .map_or(true, |email| contact.has_email(email));
    let phone_matches = observation
        .phone_number()
        .map_or(true, |phone_number| contact.has_phone_number(phone_number));
    email_matches && phone_matches
}

fn overlaps(contact: &Contact, observation: &Observation) -> bool {
    observation
        .email()
        .is_some_and(|email| contact.has_email(email))
        || observation
            .phone_number()
            .is_some_and(|phone_number| contact.has_phone_number(phone_number))
}

pub fn classify(members: &[Contact], observation: &Observation) -> Classification {
    if let Some(contact) = members
        .iter()
        .find(|contact| is_exact_match(contact, observation))
    {
        return Classification::ExactMatch(contact.id);
    }
    if members.iter().any(|contact| overlaps(contact, observation)) {
        Classification::PartialOverlap
    } else {
        Classification::Disjoint
    }
}
