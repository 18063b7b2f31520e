//! # Data Model
//!
//! Contact records, the identity observations that drive consolidation, and
//! the canonical cluster summary returned to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Store-assigned contact identifier. Monotonic with creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Role of a contact inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPrecedence::Primary => write!(f, "primary"),
            LinkPrecedence::Secondary => write!(f, "secondary"),
        }
    }
}

/// A persisted contact record.
///
/// `email` and `phone_number` never change after creation; only
/// `link_precedence` and `linked_id` are rewritten by cluster repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    /// Set if and only if the contact is secondary; points at the cluster primary.
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    pub created_at: OffsetDateTime,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// The primary this contact claims to belong to: itself when primary,
    /// otherwise its link (which may be absent in a damaged store).
    pub fn primary_pointer(&self) -> Option<ContactId> {
        match self.link_precedence {
            LinkPrecedence::Primary => Some(self.id),
            LinkPrecedence::Secondary => self.linked_id,
        }
    }

    /// Age ordering key: creation time, ties broken by the smaller id.
    pub fn age_key(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }

    pub fn has_email(&self, email: &str) -> bool {
        self.email.as_deref() == Some(email)
    }

    pub fn has_phone_number(&self, phone_number: &str) -> bool {
        self.phone_number.as_deref() == Some(phone_number)
    }
}

/// Sort contacts oldest first.
pub fn sort_by_age(contacts: &mut [Contact]) {
    contacts.sort_by_key(Contact::age_key);
}

/// Insert payload; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// First sighting of an identity.
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// New combination inside an existing cluster.
    pub fn secondary(observation: &Observation, primary: ContactId) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// A validated `(email, phone)` pair with at least one field present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Returns `None` when neither field carries a value.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Option<Self> {
        if email.is_none() && phone_number.is_none() {
            return None;
        }
        Some(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.email.as_deref().unwrap_or("-"),
            self.phone_number.as_deref().unwrap_or("-")
        )
    }
}

/// Canonical view of one settled cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    pub primary_contact_id: Option<ContactId>,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Response envelope for the identify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ContactSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn contact(id: u64, precedence: LinkPrecedence, linked: Option<u64>) -> Contact {
        Contact {
            id: ContactId(id),
            email: None,
            phone_number: None,
            linked_id: linked.map(ContactId),
            link_precedence: precedence,
            created_at: datetime!(2024-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_primary_pointer() {
        assert_eq!(
            contact(4, LinkPrecedence::Primary, None).primary_pointer(),
            Some(ContactId(4))
        );
        assert_eq!(
            contact(5, LinkPrecedence::Secondary, Some(4)).primary_pointer(),
            Some(ContactId(4))
        );
        assert_eq!(
            contact(6, LinkPrecedence::Secondary, None).primary_pointer(),
            None
        );
    }

    #[test]
    fn test_age_ordering_breaks_ties_by_id() {
        let mut contacts = vec![
            contact(9, LinkPrecedence::Primary, None),
            contact(3, LinkPrecedence::Primary, None),
        ];
        sort_by_age(&mut contacts);
        assert_eq!(contacts[0].id, ContactId(3));
    }

    #[test]
    fn test_observation_requires_a_field() {
        assert!(Observation::new(None, None).is_none());
        assert!(Observation::new(Some("a@x.com".to_string()), None).is_some());
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let summary = ContactSummary {
            primary_contact_id: Some(ContactId(1)),
            emails: vec!["a@x.com".to_string()],
            phone_numbers: vec!["123".to_string()],
            secondary_contact_ids: vec![ContactId(2)],
        };
        let json = serde_json::to_value(IdentifyResponse { contact: summary }).unwrap();
        assert_eq!(json["contact"]["primaryContactId"], 1);
        assert_eq!(json["contact"]["phoneNumbers"][0], "123");
        assert_eq!(json["contact"]["secondaryContactIds"][0], 2);
    }
}
