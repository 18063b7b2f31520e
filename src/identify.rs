//! # Identify Pipeline
//!
//! Consolidates one `(email, phone)` observation into the contact store:
//!
//! ```text
//! lock identity keys
//!   -> find candidates -> lock candidate clusters (re-validated)
//!   -> resolve root -> materialize group
//!   -> classify observation (may insert a secondary)
//!   -> repair cluster links (may update contacts)
//!   -> re-read cluster -> summary
//! ```
//!
//! With no candidates the observation becomes a new primary. Every store
//! round trip and lock wait is bounded by the request deadline; a failure
//! aborts the request without compensating earlier writes.

use crate::classify::classify;
use crate::config::IdentifyTuning;
use crate::deadline::Deadline;
use crate::error::{IdentifyError, Result, Stage, StageContext};
use crate::locks::{KeyLockGuard, KeyLocks, LockKey};
use crate::model::{Contact, ContactId, ContactSummary, NewContact, Observation};
use crate::repair::plan_repair;
use crate::request::IdentifyRequest;
use crate::resolve::{
    cluster_lock_targets, find_candidates, materialize_group, resolve_root, Designation,
    RootResolution,
};
use crate::store::ContactStore;
use crate::summary::build_summary;
use tracing::{debug, info, instrument, warn};

/// Identity consolidation service over a contact store.
pub struct Identifier<S> {
    store: S,
    locks: KeyLocks,
    tuning: IdentifyTuning,
}

impl<S: ContactStore> Identifier<S> {
    pub fn new(store: S) -> Self {
        Self::with_tuning(store, IdentifyTuning::default())
    }

    pub fn with_tuning(store: S, tuning: IdentifyTuning) -> Self {
        Self {
            store,
            locks: KeyLocks::new(),
            tuning,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tuning(&self) -> &IdentifyTuning {
        &self.tuning
    }

    /// Validate a request and consolidate it. Validation failures never
    /// touch the store.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<ContactSummary> {
        let observation = request.observation()?;
        self.identify_observation(&observation)
    }

    #[instrument(
        skip_all,
        level = "debug",
        fields(
            has_email = observation.email().is_some(),
            has_phone = observation.phone_number().is_some()
        )
    )]
    pub fn identify_observation(&self, observation: &Observation) -> Result<ContactSummary> {
        let deadline = Deadline::after(self.tuning.request_timeout());
        let _identity = self
            .locks
            .acquire(LockKey::identity(observation), deadline.instant())
            .ok_or(IdentifyError::Timeout {
                stage: Stage::LockIdentity,
            })?;

        let (candidates, _clusters) = self.lock_candidate_clusters(observation, &deadline)?;
        debug!(candidates = candidates.len(), "found candidates");

        let primary = match resolve_root(&candidates) {
            None => self.create_primary(observation, &deadline)?,
            Some(resolution) => {
                self.consolidate(observation, &resolution, &candidates, &deadline)?
            }
        };

        deadline.check(Stage::BuildSummary)?;
        let cluster = self
            .store
            .find_by_primary_or_linked(primary)
            .at(Stage::BuildSummary)?;
        Ok(build_summary(&cluster, primary))
    }

    /// Find candidates and hold the cluster keys of every primary they point
    /// at. Candidates are re-read under the locks; if a concurrent merge
    /// moved them to other clusters the locks are released and retried.
    fn lock_candidate_clusters(
        &self,
        observation: &Observation,
        deadline: &Deadline,
    ) -> Result<(Vec<Contact>, Option<KeyLockGuard<'_>>)> {
        let mut candidates = find_candidates(&self.store, observation, deadline)?;
        for attempt in 0..=self.tuning.max_lock_retries {
            let targets = cluster_lock_targets(&candidates);
            if targets.is_empty() {
                // Nothing to lock: the identity keys alone keep any other
                // request from creating a contact that matches ours.
                return Ok((candidates, None));
            }
            let guard = self
                .locks
                .acquire(LockKey::clusters(&targets), deadline.instant())
                .ok_or(IdentifyError::Timeout {
                    stage: Stage::LockClusters,
                })?;
            let refreshed = find_candidates(&self.store, observation, deadline)?;
            if cluster_lock_targets(&refreshed) == targets {
                return Ok((refreshed, Some(guard)));
            }
            warn!(attempt, "candidate clusters moved while locking; retrying");
            drop(guard);
            candidates = refreshed;
        }
        Err(IdentifyError::Store {
            stage: Stage::LockClusters,
            message: format!(
                "candidate clusters kept changing after {} attempts",
                self.tuning.max_lock_retries + 1
            ),
        })
    }

    fn create_primary(&self, observation: &Observation, deadline: &Deadline) -> Result<ContactId> {
        deadline.check(Stage::InsertContact)?;
        let created = self
            .store
            .insert(NewContact::primary(observation))
            .at(Stage::InsertContact)?;
        info!(contact = %created.id, "created primary contact");
        Ok(created.id)
    }

    fn consolidate(
        &self,
        observation: &Observation,
        resolution: &RootResolution,
        candidates: &[Contact],
        deadline: &Deadline,
    ) -> Result<ContactId> {
        if resolution.fallback {
            warn!(
                root = %resolution.root,
                "no candidate points at a primary; using oldest candidate as root"
            );
        }

        let mut group = materialize_group(&self.store, resolution, candidates, deadline)?;
        let classification = classify(group.members(), observation);
        debug!(
            root = %group.root(),
            members = group.len(),
            ?classification,
            "materialized cluster"
        );

        if classification.needs_insert() {
            let (primary, designation) =
                group.designated_primary().ok_or_else(|| IdentifyError::Store {
                    stage: Stage::MaterializeGroup,
                    message: format!("cluster {} materialized empty", resolution.root),
                })?;
            if designation == Designation::OldestMember {
                warn!(contact = %primary, "cluster has no primary; oldest member will be promoted");
            }
            deadline.check(Stage::InsertContact)?;
            let created = self
                .store
                .insert(NewContact::secondary(observation, primary))
                .at(Stage::InsertContact)?;
            info!(contact = %created.id, primary = %primary, "inserted secondary contact");
            group.push(created);
        }

        let plan = plan_repair(group.members()).ok_or_else(|| IdentifyError::Store {
            stage: Stage::MaterializeGroup,
            message: format!("cluster {} materialized empty", resolution.root),
        })?;
        for update in &plan.updates {
            deadline.check(Stage::RepairCluster)?;
            self.store
                .update_precedence_and_link(update.id, update.precedence, update.linked_id)
                .at(Stage::RepairCluster)?;
        }
        plan.apply(group.members_mut());

        if !plan.demoted.is_empty() {
            info!(
                primary = %plan.primary,
                demoted = ?plan.demoted,
                "merged clusters"
            );
        }
        if let Some(promoted) = plan.promoted {
            warn!(contact = %promoted, "promoted oldest member of a cluster without primary");
        }
        if !plan.relinked.is_empty() {
            debug!(relinked = ?plan.relinked, "relinked cluster members");
        }
        Ok(plan.primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinkPrecedence;
    use crate::store::MemoryContactStore;

    fn request(email: Option<&str>, phone_number: Option<&str>) -> IdentifyRequest {
        IdentifyRequest::new(email, phone_number)
    }

    #[test]
    fn test_first_sighting_creates_primary() {
        let identifier = Identifier::new(MemoryContactStore::new());
        let summary = identifier
            .identify(&request(Some("a@x.com"), Some("123")))
            .unwrap();
        assert_eq!(summary.primary_contact_id, Some(ContactId(1)));
        assert_eq!(summary.emails, vec!["a@x.com"]);
        assert_eq!(summary.phone_numbers, vec!["123"]);
        assert!(summary.secondary_contact_ids.is_empty());
        assert_eq!(identifier.store().len(), 1);
    }

    #[test]
    fn test_validation_failure_skips_store() {
        let identifier = Identifier::new(MemoryContactStore::new());
        let err = identifier.identify(&request(Some(""), None)).unwrap_err();
        assert!(err.is_validation());
        assert!(identifier.store().is_empty());
    }

    #[test]
    fn test_locks_are_released_after_each_request() {
        let identifier = Identifier::new(MemoryContactStore::new());
        identifier
            .identify(&request(Some("a@x.com"), Some("1")))
            .unwrap();
        identifier
            .identify(&request(Some("b@x.com"), Some("1")))
            .unwrap();
        assert_eq!(identifier.locks.held_count(), 0);
    }

    #[test]
    fn test_bridging_request_merges_clusters() {
        let identifier = Identifier::new(MemoryContactStore::new());
        identifier
            .identify(&request(Some("a@x.com"), Some("111")))
            .unwrap();
        identifier
            .identify(&request(Some("b@x.com"), Some("222")))
            .unwrap();
        let summary = identifier
            .identify(&request(Some("a@x.com"), Some("222")))
            .unwrap();

        assert_eq!(summary.primary_contact_id, Some(ContactId(1)));
        assert_eq!(summary.emails, vec!["a@x.com", "b@x.com"]);
        assert_eq!(summary.phone_numbers, vec!["111", "222"]);
        assert_eq!(summary.secondary_contact_ids, vec![ContactId(2), ContactId(3)]);

        let demoted = identifier.store().get(ContactId(2)).unwrap().unwrap();
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(ContactId(1)));
    }

    #[test]
    fn test_expired_deadline_aborts_before_store() {
        let tuning = IdentifyTuning {
            request_timeout_ms: 0,
            ..IdentifyTuning::default()
        };
        let identifier = Identifier::with_tuning(MemoryContactStore::new(), tuning);
        let err = identifier
            .identify(&request(Some("a@x.com"), None))
            .unwrap_err();
        assert!(matches!(err, IdentifyError::Timeout { .. }));
        assert!(identifier.store().is_empty());
    }
}
