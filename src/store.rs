//! # Store Module
//!
//! The narrow read/write contract the consolidation core needs from a contact
//! repository, plus an in-memory engine with email/phone/link indexes.
//!
//! Engines make no multi-record transactional promise: each insert or update
//! is atomic for the one record it touches.

use crate::model::{sort_by_age, Contact, ContactId, LinkPrecedence, NewContact};
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use time::OffsetDateTime;

/// Contact repository used by the identify pipeline.
///
/// List results are ordered by `(created_at, id)` ascending.
pub trait ContactStore: Send + Sync {
    /// Contacts whose email equals `email` or whose phone equals `phone_number`.
    /// Absent arguments are not used as filter terms.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>>;

    /// The contact `primary` itself plus every contact linked to it.
    fn find_by_primary_or_linked(&self, primary: ContactId) -> Result<Vec<Contact>>;

    /// Create a contact, assigning its id and creation time.
    fn insert(&self, contact: NewContact) -> Result<Contact>;

    /// Rewrite the link fields of one contact. Fails if the contact does not exist.
    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()>;

    fn get(&self, id: ContactId) -> Result<Option<Contact>>;

    /// Full scan, used by auditing.
    fn all_contacts(&self) -> Result<Vec<Contact>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: ContactStore + ?Sized> ContactStore for Arc<S> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>> {
        (**self).find_by_email_or_phone(email, phone_number)
    }

    fn find_by_primary_or_linked(&self, primary: ContactId) -> Result<Vec<Contact>> {
        (**self).find_by_primary_or_linked(primary)
    }

    fn insert(&self, contact: NewContact) -> Result<Contact> {
        (**self).insert(contact)
    }

    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()> {
        (**self).update_precedence_and_link(id, precedence, linked_id)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        (**self).get(id)
    }

    fn all_contacts(&self) -> Result<Vec<Contact>> {
        (**self).all_contacts()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Monotonic creation clock shared by the engines. Wall time is clamped so
/// that a contact is never older than one created before it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CreationClock {
    last: Option<OffsetDateTime>,
}

impl CreationClock {
    pub(crate) fn tick(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let stamped = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamped);
        stamped
    }

    pub(crate) fn observe(&mut self, created_at: OffsetDateTime) {
        if self.last.map_or(true, |last| created_at > last) {
            self.last = Some(created_at);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    contacts: HashMap<ContactId, Contact>,
    by_email: HashMap<String, Vec<ContactId>>,
    by_phone: HashMap<String, Vec<ContactId>>,
    by_linked: HashMap<ContactId, Vec<ContactId>>,
    next_contact_id: u64,
    clock: CreationClock,
}

impl MemoryInner {
    fn index(&mut self, contact: &Contact) {
        if let Some(email) = &contact.email {
            self.by_email.entry(email.clone()).or_default().push(contact.id);
        }
        if let Some(phone_number) = &contact.phone_number {
            self.by_phone
                .entry(phone_number.clone())
                .or_default()
                .push(contact.id);
        }
        if let Some(linked_id) = contact.linked_id {
            self.by_linked.entry(linked_id).or_default().push(contact.id);
        }
    }

    fn unlink(&mut self, linked_id: ContactId, id: ContactId) {
        if let Some(ids) = self.by_linked.get_mut(&linked_id) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.by_linked.remove(&linked_id);
            }
        }
    }

    fn collect(&self, ids: impl IntoIterator<Item = ContactId>) -> Vec<Contact> {
        let mut seen = hashbrown::HashSet::new();
        let mut contacts: Vec<Contact> = ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.contacts.get(&id).cloned())
            .collect();
        sort_by_age(&mut contacts);
        contacts
    }
}

/// In-memory contact store. Cloning shares the underlying data.
#[derive(Debug, Clone)]
pub struct MemoryContactStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner {
                next_contact_id: 1,
                ..MemoryInner::default()
            })),
        }
    }

    /// Load a contact with an explicit id and creation time, bypassing id
    /// assignment. Used to restore snapshots and to build fixtures.
    pub fn seed(&self, contact: Contact) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.contacts.contains_key(&contact.id) {
            return Err(anyhow!("contact already exists: {}", contact.id));
        }
        inner.next_contact_id = inner.next_contact_id.max(contact.id.0 + 1);
        inner.clock.observe(contact.created_at);
        inner.index(&contact);
        inner.contacts.insert(contact.id, contact);
        Ok(())
    }

    pub fn next_contact_id(&self) -> ContactId {
        ContactId(self.inner.read().next_contact_id)
    }
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactStore for MemoryContactStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>> {
        let inner = self.inner.read();
        let by_email = email
            .and_then(|email| inner.by_email.get(email))
            .into_iter()
            .flatten();
        let by_phone = phone_number
            .and_then(|phone_number| inner.by_phone.get(phone_number))
            .into_iter()
            .flatten();
        Ok(inner.collect(by_email.chain(by_phone).copied()))
    }

    fn find_by_primary_or_linked(&self, primary: ContactId) -> Result<Vec<Contact>> {
        let inner = self.inner.read();
        let linked = inner.by_linked.get(&primary).into_iter().flatten().copied();
        Ok(inner.collect(std::iter::once(primary).chain(linked)))
    }

    fn insert(&self, contact: NewContact) -> Result<Contact> {
        let mut inner = self.inner.write();
        let id = ContactId(inner.next_contact_id);
        inner.next_contact_id += 1;
        let created_at = inner.clock.tick();
        let contact = Contact {
            id,
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at,
        };
        inner.index(&contact);
        inner.contacts.insert(id, contact.clone());
        Ok(contact)
    }

    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let previous = match inner.contacts.get_mut(&id) {
            Some(contact) => {
                let previous = contact.linked_id;
                contact.link_precedence = precedence;
                contact.linked_id = linked_id;
                previous
            }
            None => return Err(anyhow!("contact not found: {id}")),
        };
        if previous != linked_id {
            if let Some(previous) = previous {
                inner.unlink(previous, id);
            }
            if let Some(linked_id) = linked_id {
                inner.by_linked.entry(linked_id).or_default().push(id);
            }
        }
        Ok(())
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        Ok(self.inner.read().contacts.get(&id).cloned())
    }

    fn all_contacts(&self) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self.inner.read().contacts.values().cloned().collect();
        sort_by_age(&mut contacts);
        Ok(contacts)
    }

    fn len(&self) -> usize {
        self.inner.read().contacts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observation;

    fn observation(email: Option<&str>, phone_number: Option<&str>) -> Observation {
        Observation::new(email.map(str::to_string), phone_number.map(str::to_string)).unwrap()
    }

    #[test]
    fn test_store_creation() {
        let store = MemoryContactStore::new();
        assert!(store.is_empty());
        assert_eq!(store.next_contact_id(), ContactId(1));
    }

    #[test]
    fn test_insert_assigns_monotonic_ids_and_times() {
        let store = MemoryContactStore::new();
        let first = store
            .insert(NewContact::primary(&observation(Some("a@x.com"), None)))
            .unwrap();
        let second = store
            .insert(NewContact::primary(&observation(Some("b@x.com"), None)))
            .unwrap();
        assert_eq!(first.id, ContactId(1));
        assert_eq!(second.id, ContactId(2));
        assert!(second.created_at >= first.created_at);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_find_by_email_or_phone_unions_and_dedups() {
        let store = MemoryContactStore::new();
        let a = store
            .insert(NewContact::primary(&observation(Some("a@x.com"), Some("111"))))
            .unwrap();
        let b = store
            .insert(NewContact::primary(&observation(Some("b@x.com"), Some("222"))))
            .unwrap();
        store
            .insert(NewContact::primary(&observation(Some("c@x.com"), None)))
            .unwrap();

        let found = store
            .find_by_email_or_phone(Some("a@x.com"), Some("222"))
            .unwrap();
        let ids: Vec<ContactId> = found.iter().map(|contact| contact.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let found = store.find_by_email_or_phone(Some("a@x.com"), Some("111")).unwrap();
        assert_eq!(found.len(), 1);

        assert!(store.find_by_email_or_phone(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_update_moves_link_index() {
        let store = MemoryContactStore::new();
        let a = store
            .insert(NewContact::primary(&observation(Some("a@x.com"), None)))
            .unwrap();
        let b = store
            .insert(NewContact::primary(&observation(Some("b@x.com"), None)))
            .unwrap();
        let c = store
            .insert(NewContact::secondary(&observation(Some("b@x.com"), Some("3")), b.id))
            .unwrap();

        assert_eq!(store.find_by_primary_or_linked(b.id).unwrap().len(), 2);

        store
            .update_precedence_and_link(c.id, LinkPrecedence::Secondary, Some(a.id))
            .unwrap();
        assert_eq!(store.find_by_primary_or_linked(b.id).unwrap().len(), 1);
        let group = store.find_by_primary_or_linked(a.id).unwrap();
        assert_eq!(
            group.iter().map(|contact| contact.id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );
    }

    #[test]
    fn test_update_missing_contact_fails() {
        let store = MemoryContactStore::new();
        assert!(store
            .update_precedence_and_link(ContactId(7), LinkPrecedence::Primary, None)
            .is_err());
    }

    #[test]
    fn test_seed_advances_sequence() {
        let store = MemoryContactStore::new();
        store
            .seed(Contact {
                id: ContactId(10),
                email: Some("a@x.com".to_string()),
                phone_number: None,
                linked_id: None,
                link_precedence: LinkPrecedence::Primary,
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .unwrap();
        assert_eq!(store.next_contact_id(), ContactId(11));
        assert!(store
            .seed(Contact {
                id: ContactId(10),
                email: None,
                phone_number: Some("1".to_string()),
                linked_id: None,
                link_precedence: LinkPrecedence::Primary,
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .is_err());
    }
}
