//! RocksDB-backed contact store.
//!
//! Contacts live in the `contacts` column family keyed by big-endian id.
//! Three secondary index families map email, phone number and `linked_id`
//! to contact ids. Every insert or link update is written as a single
//! `WriteBatch` so a record and its index entries change together.

use crate::model::{sort_by_age, Contact, ContactId, LinkPrecedence, NewContact};
use crate::store::{ContactStore, CreationClock};
use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamilyDescriptor, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const CF_CONTACTS: &str = "contacts";
const CF_METADATA: &str = "metadata";
const CF_INDEX_EMAIL: &str = "index_email";
const CF_INDEX_PHONE: &str = "index_phone";
const CF_INDEX_LINKED: &str = "index_linked";

const KEY_NEXT_CONTACT_ID: &[u8] = b"next_contact_id";
const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: crate::config::DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Sequence and clock state; held while writing so id assignment and
/// read-modify-write updates are serialized.
struct WriterState {
    next_contact_id: u64,
    clock: CreationClock,
}

pub struct PersistentContactStore {
    db: DB,
    writer: Mutex<WriterState>,
    cache: Mutex<LruCache<ContactId, Contact>>,
    len: AtomicUsize,
}

impl PersistentContactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;

        let mut clock = CreationClock::default();
        let mut len = 0usize;
        let mut max_id = 0u64;
        for entry in db.iterator_cf(cf(&db, CF_CONTACTS)?, IteratorMode::Start) {
            let (_key, value) = entry?;
            let contact: Contact = bincode::deserialize(&value)?;
            clock.observe(contact.created_at);
            max_id = max_id.max(contact.id.0);
            len += 1;
        }
        let next_contact_id = load_metadata::<u64>(&db, KEY_NEXT_CONTACT_ID)?
            .unwrap_or(1)
            .max(max_id + 1);

        let capacity = NonZeroUsize::new(options.cache_capacity)
            .ok_or_else(|| anyhow!("cache capacity must be greater than zero"))?;

        Ok(Self {
            db,
            writer: Mutex::new(WriterState {
                next_contact_id,
                clock,
            }),
            cache: Mutex::new(LruCache::new(capacity)),
            len: AtomicUsize::new(len),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    pub fn next_contact_id(&self) -> ContactId {
        ContactId(self.writer.lock().next_contact_id)
    }

    /// Cache-through read. A miss reads the database while holding the cache
    /// lock: writers publish to the cache after their batch commits, so a
    /// fill can never land on top of a newer value.
    fn load(&self, id: ContactId) -> Result<Option<Contact>> {
        let mut cache = self.cache.lock();
        if let Some(contact) = cache.get(&id) {
            return Ok(Some(contact.clone()));
        }
        let Some(bytes) = self.db.get_cf(cf(&self.db, CF_CONTACTS)?, id.0.to_be_bytes())? else {
            return Ok(None);
        };
        let contact: Contact = bincode::deserialize(&bytes)?;
        cache.put(id, contact.clone());
        Ok(Some(contact))
    }

    fn load_many(&self, ids: impl IntoIterator<Item = ContactId>) -> Result<Vec<Contact>> {
        let mut seen = hashbrown::HashSet::new();
        let mut contacts = Vec::new();
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(contact) = self.load(id)? {
                contacts.push(contact);
            }
        }
        sort_by_age(&mut contacts);
        Ok(contacts)
    }

    fn scan_ids(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<ContactId>> {
        let cf = cf(&self.db, cf_name)?;
        let mut ids = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(id) = decode_trailing_id(&key, prefix.len()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn write_contact(&self, batch: &mut WriteBatch, contact: &Contact) -> Result<()> {
        let bytes = bincode::serialize(contact)?;
        batch.put_cf(cf(&self.db, CF_CONTACTS)?, contact.id.0.to_be_bytes(), bytes);
        Ok(())
    }
}

impl ContactStore for PersistentContactStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>> {
        let mut ids = Vec::new();
        if let Some(email) = email {
            ids.extend(self.scan_ids(CF_INDEX_EMAIL, &encode_string_prefix(email))?);
        }
        if let Some(phone_number) = phone_number {
            ids.extend(self.scan_ids(CF_INDEX_PHONE, &encode_string_prefix(phone_number))?);
        }
        let contacts = self.load_many(ids)?;
        Ok(contacts
            .into_iter()
            .filter(|contact| {
                email.is_some_and(|email| contact.has_email(email))
                    || phone_number.is_some_and(|phone| contact.has_phone_number(phone))
            })
            .collect())
    }

    fn find_by_primary_or_linked(&self, primary: ContactId) -> Result<Vec<Contact>> {
        let linked = self.scan_ids(CF_INDEX_LINKED, &primary.0.to_be_bytes())?;
        let contacts = self.load_many(std::iter::once(primary).chain(linked))?;
        Ok(contacts
            .into_iter()
            .filter(|contact| contact.id == primary || contact.linked_id == Some(primary))
            .collect())
    }

    fn insert(&self, contact: NewContact) -> Result<Contact> {
        let mut writer = self.writer.lock();
        let id = ContactId(writer.next_contact_id);
        let created_at = writer.clock.tick();
        let contact = Contact {
            id,
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at,
        };

        let mut batch = WriteBatch::default();
        self.write_contact(&mut batch, &contact)?;
        if let Some(email) = &contact.email {
            batch.put_cf(cf(&self.db, CF_INDEX_EMAIL)?, encode_string_index(email, id), []);
        }
        if let Some(phone_number) = &contact.phone_number {
            batch.put_cf(
                cf(&self.db, CF_INDEX_PHONE)?,
                encode_string_index(phone_number, id),
                [],
            );
        }
        if let Some(linked_id) = contact.linked_id {
            batch.put_cf(cf(&self.db, CF_INDEX_LINKED)?, encode_link_index(linked_id, id), []);
        }
        batch.put_cf(
            cf(&self.db, CF_METADATA)?,
            KEY_NEXT_CONTACT_ID,
            bincode::serialize(&(id.0 + 1))?,
        );
        self.db.write(batch)?;

        writer.next_contact_id = id.0 + 1;
        self.len.fetch_add(1, Ordering::Relaxed);
        self.cache.lock().put(id, contact.clone());
        Ok(contact)
    }

    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()> {
        let _writer = self.writer.lock();
        let mut contact = self
            .load(id)?
            .ok_or_else(|| anyhow!("contact not found: {id}"))?;
        let previous = contact.linked_id;
        contact.link_precedence = precedence;
        contact.linked_id = linked_id;

        let mut batch = WriteBatch::default();
        self.write_contact(&mut batch, &contact)?;
        if previous != linked_id {
            let linked_cf = cf(&self.db, CF_INDEX_LINKED)?;
            if let Some(previous) = previous {
                batch.delete_cf(linked_cf, encode_link_index(previous, id));
            }
            if let Some(linked_id) = linked_id {
                batch.put_cf(linked_cf, encode_link_index(linked_id, id), []);
            }
        }
        self.db.write(batch)?;
        self.cache.lock().put(id, contact);
        Ok(())
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        self.load(id)
    }

    fn all_contacts(&self) -> Result<Vec<Contact>> {
        let mut contacts = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf(&self.db, CF_CONTACTS)?, IteratorMode::Start)
        {
            let (_key, value) = entry?;
            contacts.push(bincode::deserialize::<Contact>(&value)?);
        }
        sort_by_age(&mut contacts);
        Ok(contacts)
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl Drop for PersistentContactStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| anyhow!("missing column family {name}"))
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CONTACTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_EMAIL, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_PHONE, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_LINKED, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn encode_string_prefix(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key
}

fn encode_string_index(value: &str, id: ContactId) -> Vec<u8> {
    let mut key = encode_string_prefix(value);
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn encode_link_index(linked_id: ContactId, id: ContactId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&linked_id.0.to_be_bytes());
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn decode_trailing_id(key: &[u8], prefix_len: usize) -> Option<ContactId> {
    if key.len() != prefix_len + 8 {
        return None;
    }
    Some(ContactId(u64::from_be_bytes(
        key[prefix_len..prefix_len + 8].try_into().ok()?,
    )))
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    match db.get_cf(cf(db, CF_METADATA)?, key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observation;
    use tempfile::tempdir;

    fn observation(email: Option<&str>, phone_number: Option<&str>) -> Observation {
        Observation::new(email.map(str::to_string), phone_number.map(str::to_string)).unwrap()
    }

    #[test]
    fn persistent_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let store = PersistentContactStore::open(path).unwrap();
        let created = store
            .insert(NewContact::primary(&observation(Some("a@x.com"), Some("111"))))
            .unwrap();
        drop(store);

        let store = PersistentContactStore::open(path).unwrap();
        let loaded = store.get(created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(store.len(), 1);
        assert_eq!(store.next_contact_id(), ContactId(created.id.0 + 1));
    }

    #[test]
    fn persistent_store_indexes_email_and_phone() {
        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open(dir.path()).unwrap();
        let a = store
            .insert(NewContact::primary(&observation(Some("a@x.com"), Some("111"))))
            .unwrap();
        let ab = store
            .insert(NewContact::primary(&observation(Some("a@x.com.au"), Some("1112"))))
            .unwrap();

        let found = store.find_by_email_or_phone(Some("a@x.com"), None).unwrap();
        assert_eq!(found, vec![a.clone()]);
        let found = store.find_by_email_or_phone(None, Some("1112")).unwrap();
        assert_eq!(found, vec![ab.clone()]);
        let found = store
            .find_by_email_or_phone(Some("a@x.com"), Some("1112"))
            .unwrap();
        assert_eq!(found, vec![a, ab]);
    }

    #[test]
    fn persistent_store_relinks_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path();
        let (a, b, c) = {
            let store = PersistentContactStore::open(path).unwrap();
            let a = store
                .insert(NewContact::primary(&observation(Some("a@x.com"), None)))
                .unwrap();
            let b = store
                .insert(NewContact::primary(&observation(Some("b@x.com"), None)))
                .unwrap();
            let c = store
                .insert(NewContact::secondary(&observation(Some("b@x.com"), Some("3")), b.id))
                .unwrap();
            store
                .update_precedence_and_link(b.id, LinkPrecedence::Secondary, Some(a.id))
                .unwrap();
            store
                .update_precedence_and_link(c.id, LinkPrecedence::Secondary, Some(a.id))
                .unwrap();
            (a, b, c)
        };

        let store = PersistentContactStore::open(path).unwrap();
        let group = store.find_by_primary_or_linked(a.id).unwrap();
        assert_eq!(
            group.iter().map(|contact| contact.id).collect::<Vec<_>>(),
            vec![a.id, b.id, c.id]
        );
        assert_eq!(store.find_by_primary_or_linked(b.id).unwrap().len(), 1);
        let b = store.get(b.id).unwrap().unwrap();
        assert_eq!(b.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(b.linked_id, Some(a.id));
    }

    #[test]
    fn persistent_store_rejects_zero_cache() {
        let dir = tempdir().unwrap();
        let result = PersistentContactStore::open_with_options(
            dir.path(),
            PersistentOpenOptions {
                repair: false,
                cache_capacity: 0,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn persistent_store_cache_never_regresses_under_concurrent_reads() {
        use std::sync::atomic::AtomicBool;

        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open_with_options(
            dir.path(),
            PersistentOpenOptions {
                repair: false,
                cache_capacity: 1,
            },
        )
        .unwrap();
        let a = store
            .insert(NewContact::primary(&observation(Some("a@x.com"), None)))
            .unwrap();
        let b = store
            .insert(NewContact::primary(&observation(Some("b@x.com"), None)))
            .unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    // Alternating ids keeps a one-entry cache missing.
                    while !done.load(Ordering::Relaxed) {
                        store.get(a.id).unwrap();
                        store.get(b.id).unwrap();
                    }
                });
            }
            for round in 0..200 {
                if round % 2 == 0 {
                    store
                        .update_precedence_and_link(b.id, LinkPrecedence::Secondary, Some(a.id))
                        .unwrap();
                } else {
                    store
                        .update_precedence_and_link(b.id, LinkPrecedence::Primary, None)
                        .unwrap();
                }
                let cached = store.get(b.id).unwrap().unwrap();
                assert_eq!(cached.linked_id.is_some(), round % 2 == 0, "round {round}");
            }
            done.store(true, Ordering::Relaxed);
        });

        let on_disk = store.all_contacts().unwrap();
        for contact in on_disk {
            assert_eq!(store.get(contact.id).unwrap(), Some(contact));
        }
    }

    #[test]
    fn persistent_store_checkpoint_reopens() {
        let dir = tempdir().unwrap();
        let store = PersistentContactStore::open(dir.path().join("live")).unwrap();
        store
            .insert(NewContact::primary(&observation(None, Some("555"))))
            .unwrap();
        let snapshot = dir.path().join("snapshot");
        store.checkpoint(&snapshot).unwrap();

        let restored = PersistentContactStore::open(&snapshot).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.find_by_email_or_phone(None, Some("555")).unwrap().len(),
            1
        );
    }
}
