//! DeltaFile persistence port and its in-memory implementation.
//!
//! Every write goes through [`DeltaFileRepository::save`] with the version
//! the caller read. A stale version is refused with [`Error::Conflict`] and
//! the caller redoes the whole read-advance-write cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use df_core::{DeltaFileId, Error, Result};
use df_model::{ActionState, DeltaFile, DeltaFileStage, FlowState};

#[async_trait]
pub trait DeltaFileRepository: Send + Sync {
    async fn get(&self, did: DeltaFileId) -> Result<Option<DeltaFile>>;

    /// Store a new item at version 1.
    async fn insert(&self, delta_file: DeltaFile) -> Result<DeltaFile>;

    /// Replace the stored item if it is still at `expected_version`.
    /// Returns the new version.
    async fn save(&self, delta_file: &DeltaFile, expected_version: u64) -> Result<u64>;

    /// In-flight items holding a QUEUED action queued before `cutoff`.
    async fn queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeltaFileId>>;

    /// In-flight items holding a COLD_QUEUED action, at most `limit`.
    async fn cold_queued(&self, limit: usize) -> Result<Vec<DeltaFileId>>;

    /// Errored items with an auto-resume due at or before `now`.
    async fn auto_resume_due(&self, now: DateTime<Utc>) -> Result<Vec<DeltaFileId>>;

    /// Items with an action parked in a join or waiting to be collected
    /// into a released one.
    async fn joining(&self) -> Result<Vec<DeltaFileId>>;

    async fn count(&self) -> Result<usize>;
}

/// Concurrent map of items keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryDeltaFileRepository {
    items: DashMap<DeltaFileId, DeltaFile>,
}

impl InMemoryDeltaFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn select(&self, predicate: impl Fn(&DeltaFile) -> bool) -> Vec<DeltaFileId> {
        let mut dids: Vec<_> = self
            .items
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        dids.sort();
        dids
    }
}

#[async_trait]
impl DeltaFileRepository for InMemoryDeltaFileRepository {
    async fn get(&self, did: DeltaFileId) -> Result<Option<DeltaFile>> {
        Ok(self.items.get(&did).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, mut delta_file: DeltaFile) -> Result<DeltaFile> {
        delta_file.version = 1;
        match self.items.entry(delta_file.did) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Validation(format!(
                "DeltaFile {} already exists",
                delta_file.did
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(delta_file.clone());
                Ok(delta_file)
            }
        }
    }

    async fn save(&self, delta_file: &DeltaFile, expected_version: u64) -> Result<u64> {
        let mut stored = self
            .items
            .get_mut(&delta_file.did)
            .ok_or_else(|| Error::not_found("deltaFile", delta_file.did))?;
        if stored.version != expected_version {
            return Err(Error::conflict(delta_file.did, expected_version, stored.version));
        }
        let version = expected_version + 1;
        *stored = DeltaFile {
            version,
            ..delta_file.clone()
        };
        Ok(version)
    }

    async fn queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeltaFileId>> {
        Ok(self.select(|df| {
            df.stage == DeltaFileStage::InFlight
                && df.flows.iter().flat_map(|f| f.actions.iter()).any(|a| {
                    a.state == ActionState::Queued && a.queued.is_some_and(|q| q < cutoff)
                })
        }))
    }

    async fn cold_queued(&self, limit: usize) -> Result<Vec<DeltaFileId>> {
        let mut dids = self.select(|df| {
            df.stage == DeltaFileStage::InFlight && df.flows.iter().any(|f| f.cold_queued)
        });
        dids.truncate(limit);
        Ok(dids)
    }

    async fn auto_resume_due(&self, now: DateTime<Utc>) -> Result<Vec<DeltaFileId>> {
        Ok(self.select(|df| {
            df.flows.iter().any(|f| {
                f.state == FlowState::Error && f.next_auto_resume.is_some_and(|at| at <= now)
            })
        }))
    }

    async fn joining(&self) -> Result<Vec<DeltaFileId>> {
        Ok(self.select(|df| {
            df.flows
                .iter()
                .flat_map(|f| f.actions.iter())
                .any(|a| matches!(a.state, ActionState::Collecting | ActionState::ReadyToCollect))
        }))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.items.len())
    }
}
