//! Helpers shared by unit tests, integration tests and benches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::request::IdentifyRequest;
use crate::store::ContactStore;
use anyhow::{anyhow, Result};

/// Shape of a generated identify workload.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadSpec {
    pub requests: usize,
    /// Distinct emails to draw from; smaller pools mean more overlap.
    pub email_pool: usize,
    pub phone_pool: usize,
    /// Chance that a request carries only one of the two fields.
    pub single_field_probability: f64,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            requests: 200,
            email_pool: 40,
            phone_pool: 40,
            single_field_probability: 0.3,
        }
    }
}

/// Deterministic stream of valid identify requests.
pub fn generate_requests(spec: WorkloadSpec, seed: u64) -> Vec<IdentifyRequest> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut requests = Vec::with_capacity(spec.requests);
    for _ in 0..spec.requests {
        let email = format!("user{:03}@example.com", rng.random_range(0..spec.email_pool));
        let phone = format!("555{:04}", rng.random_range(0..spec.phone_pool));
        let request = if rng.random_bool(spec.single_field_probability) {
            if rng.random_bool(0.5) {
                IdentifyRequest::new(Some(&email), None)
            } else {
                IdentifyRequest::new(None, Some(&phone))
            }
        } else {
            IdentifyRequest::new(Some(&email), Some(&phone))
        };
        requests.push(request);
    }
    requests
}

/// Which store write a [`FailingStore`] should break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Insert,
    Update,
    Find,
}

/// Store wrapper that fails the nth call (0-based) of one operation.
pub struct FailingStore<S> {
    inner: S,
    fail_on: FailOn,
    fail_at: usize,
    calls: AtomicUsize,
}

impl<S: ContactStore> FailingStore<S> {
    pub fn new(inner: S, fail_on: FailOn, fail_at: usize) -> Self {
        Self {
            inner,
            fail_on,
            fail_at,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn trip(&self, op: FailOn) -> Result<()> {
        if op != self.fail_on {
            return Ok(());
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_at {
            return Err(anyhow!("injected {op:?} failure"));
        }
        Ok(())
    }
}

impl<S: ContactStore> ContactStore for FailingStore<S> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>> {
        self.trip(FailOn::Find)?;
        self.inner.find_by_email_or_phone(email, phone_number)
    }

    fn find_by_primary_or_linked(&self, primary: ContactId) -> Result<Vec<Contact>> {
        self.inner.find_by_primary_or_linked(primary)
    }

    fn insert(&self, contact: NewContact) -> Result<Contact> {
        self.trip(FailOn::Insert)?;
        self.inner.insert(contact)
    }

    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<()> {
        self.trip(FailOn::Update)?;
        self.inner.update_precedence_and_link(id, precedence, linked_id)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        self.inner.get(id)
    }

    fn all_contacts(&self) -> Result<Vec<Contact>> {
        self.inner.all_contacts()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
