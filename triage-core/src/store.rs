//! Incident store: the single source of truth for incident lifecycles.
//!
//! Persistence is pluggable through [`IncidentRepository`], a key-value
//! collaborator with compare-and-swap writes on the incident version. On top
//! of it [`IncidentStore`] hands out per-incident leases so at most one
//! orchestration cycle mutates an incident at a time, while unrelated
//! incidents proceed with no shared locking.

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{ConfigError, Result, StoreError};
use crate::persistence;
use crate::types::{Incident, IncidentId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Durable key-value storage for incidents.
///
/// `put` is conditional: `expected_version` must match the version currently
/// stored (`None` means the key must not exist yet), otherwise the write is
/// refused with [`StoreError::ConcurrencyConflict`] or
/// [`StoreError::AlreadyExists`].
#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn get(&self, id: &IncidentId) -> std::result::Result<Option<Incident>, StoreError>;

    async fn put(
        &self,
        incident: &Incident,
        expected_version: Option<u64>,
    ) -> std::result::Result<(), StoreError>;

    async fn list(&self) -> std::result::Result<Vec<IncidentId>, StoreError>;

    /// Returns whether a document was removed.
    async fn delete(&self, id: &IncidentId) -> std::result::Result<bool, StoreError>;
}

fn check_version(
    id: &IncidentId,
    stored: Option<u64>,
    expected: Option<u64>,
) -> std::result::Result<(), StoreError> {
    match (stored, expected) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(StoreError::AlreadyExists { id: id.to_string() }),
        (None, Some(_)) => Err(StoreError::NotFound { id: id.to_string() }),
        (Some(stored), Some(expected)) if stored == expected => Ok(()),
        (Some(stored), Some(expected)) => Err(StoreError::ConcurrencyConflict {
            id: id.to_string(),
            detail: format!("expected version {expected}, found {stored}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

/// Process-local repository, the default backend.
#[derive(Default)]
pub struct InMemoryRepository {
    incidents: RwLock<HashMap<IncidentId, Incident>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IncidentRepository for InMemoryRepository {
    async fn get(&self, id: &IncidentId) -> std::result::Result<Option<Incident>, StoreError> {
        Ok(self.incidents.read().await.get(id).cloned())
    }

    async fn put(
        &self,
        incident: &Incident,
        expected_version: Option<u64>,
    ) -> std::result::Result<(), StoreError> {
        let mut incidents = self.incidents.write().await;
        let stored = incidents.get(&incident.id).map(|i| i.version);
        check_version(&incident.id, stored, expected_version)?;
        incidents.insert(incident.id.clone(), incident.clone());
        Ok(())
    }

    async fn list(&self) -> std::result::Result<Vec<IncidentId>, StoreError> {
        let mut ids: Vec<IncidentId> = self.incidents.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &IncidentId) -> std::result::Result<bool, StoreError> {
        Ok(self.incidents.write().await.remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// File repository
// ---------------------------------------------------------------------------

/// Per-incident async mutexes, created on first use.
type SlotTable = std::sync::Mutex<HashMap<IncidentId, Arc<Mutex<()>>>>;

fn slot_for(table: &SlotTable, id: &IncidentId) -> std::result::Result<Arc<Mutex<()>>, StoreError> {
    let mut slots = table.lock().map_err(|_| StoreError::Backend {
        message: "slot table poisoned".into(),
    })?;
    Ok(slots
        .entry(id.clone())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

/// One JSON document per incident under a directory.
pub struct FileRepository {
    dir: PathBuf,
    // Read-compare-write is serialized per incident so CAS holds within
    // this process.
    write_slots: SlotTable,
}

impl FileRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_slots: SlotTable::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &IncidentId) -> PathBuf {
        persistence::document_path(&self.dir, id.as_str())
    }
}

fn backend(e: std::io::Error) -> StoreError {
    StoreError::Backend {
        message: e.to_string(),
    }
}

#[async_trait]
impl IncidentRepository for FileRepository {
    async fn get(&self, id: &IncidentId) -> std::result::Result<Option<Incident>, StoreError> {
        persistence::read_json(&self.path_for(id))
            .await
            .map_err(backend)
    }

    async fn put(
        &self,
        incident: &Incident,
        expected_version: Option<u64>,
    ) -> std::result::Result<(), StoreError> {
        let slot = slot_for(&self.write_slots, &incident.id)?;
        let _guard = slot.lock().await;
        let path = self.path_for(&incident.id);
        let stored: Option<Incident> = persistence::read_json(&path).await.map_err(backend)?;
        check_version(&incident.id, stored.map(|i| i.version), expected_version)?;
        persistence::write_json_atomic(&path, incident)
            .await
            .map_err(backend)
    }

    async fn list(&self) -> std::result::Result<Vec<IncidentId>, StoreError> {
        let paths = persistence::list_documents(&self.dir).await.map_err(backend)?;
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(incident) = persistence::read_json::<Incident>(&path)
                .await
                .map_err(backend)?
            {
                ids.push(incident.id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &IncidentId) -> std::result::Result<bool, StoreError> {
        let slot = slot_for(&self.write_slots, id)?;
        let _guard = slot.lock().await;
        persistence::remove_document(&self.path_for(id))
            .await
            .map_err(backend)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Exclusive right to mutate one incident. Released on drop.
#[derive(Debug)]
pub struct IncidentLease {
    id: IncidentId,
    _guard: OwnedMutexGuard<()>,
}

impl IncidentLease {
    pub fn incident_id(&self) -> &IncidentId {
        &self.id
    }
}

/// Incident store with per-incident leases and CAS writes.
pub struct IncidentStore {
    repo: Arc<dyn IncidentRepository>,
    leases: SlotTable,
    max_cas_retries: u32,
}

impl IncidentStore {
    pub fn new(repo: Arc<dyn IncidentRepository>, max_cas_retries: u32) -> Self {
        Self {
            repo,
            leases: SlotTable::default(),
            max_cas_retries: max_cas_retries.max(1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryRepository::new()),
            StoreConfig::default().max_cas_retries,
        )
    }

    /// Build a store for the configured backend.
    pub fn from_config(config: &StoreConfig) -> std::result::Result<Self, ConfigError> {
        let repo: Arc<dyn IncidentRepository> = match config.backend {
            StoreBackend::Memory => Arc::new(InMemoryRepository::new()),
            StoreBackend::File => {
                let path = config.path.clone().ok_or_else(|| ConfigError::Invalid {
                    message: "store.path is required for the file backend".into(),
                })?;
                Arc::new(FileRepository::new(path))
            }
        };
        Ok(Self::new(repo, config.max_cas_retries))
    }

    fn lease_slot(&self, id: &IncidentId) -> std::result::Result<Arc<Mutex<()>>, StoreError> {
        slot_for(&self.leases, id)
    }

    /// Take the incident's lease without waiting.
    ///
    /// Fails with [`StoreError::ConcurrencyConflict`] when another holder is
    /// active; the caller should retry later against fresh state.
    pub fn try_acquire(&self, id: &IncidentId) -> std::result::Result<IncidentLease, StoreError> {
        let slot = self.lease_slot(id)?;
        let guard = slot
            .try_lock_owned()
            .map_err(|_| StoreError::ConcurrencyConflict {
                id: id.to_string(),
                detail: "another orchestration cycle holds the incident lease".into(),
            })?;
        debug!(incident_id = %id, "Lease acquired");
        Ok(IncidentLease {
            id: id.clone(),
            _guard: guard,
        })
    }

    /// Wait for the incident's lease.
    pub async fn acquire(&self, id: &IncidentId) -> std::result::Result<IncidentLease, StoreError> {
        let slot = self.lease_slot(id)?;
        let guard = slot.lock_owned().await;
        Ok(IncidentLease {
            id: id.clone(),
            _guard: guard,
        })
    }

    /// Persist a brand new incident. Its version becomes 1.
    pub async fn create(&self, mut incident: Incident) -> Result<Incident> {
        incident.version = 1;
        self.repo.put(&incident, None).await?;
        info!(incident_id = %incident.id, category = %incident.category, "Incident created");
        Ok(incident)
    }

    pub async fn find(&self, id: &IncidentId) -> Result<Option<Incident>> {
        Ok(self.repo.get(id).await?)
    }

    pub async fn get(&self, id: &IncidentId) -> Result<Incident> {
        self.find(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() }.into())
    }

    pub async fn list(&self) -> Result<Vec<IncidentId>> {
        Ok(self.repo.list().await?)
    }

    /// Compare-and-swap write against the version the caller read.
    ///
    /// On success `incident.version` is bumped to the stored version.
    pub async fn save(&self, incident: &mut Incident) -> std::result::Result<(), StoreError> {
        let expected = incident.version;
        let mut next = incident.clone();
        next.version = expected + 1;
        self.repo.put(&next, Some(expected)).await?;
        incident.version = next.version;
        Ok(())
    }

    /// Read-modify-write with CAS, re-reading on conflict.
    pub async fn update<F>(&self, id: &IncidentId, mut mutate: F) -> Result<Incident>
    where
        F: FnMut(&mut Incident) -> Result<()> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut incident = self.get(id).await?;
            mutate(&mut incident)?;
            match self.save(&mut incident).await {
                Ok(()) => return Ok(incident),
                Err(StoreError::ConcurrencyConflict { detail, .. })
                    if attempt < self.max_cas_retries =>
                {
                    debug!(incident_id = %id, attempt, detail = %detail, "CAS conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove an incident. Only terminal incidents may be archived.
    pub async fn archive(&self, id: &IncidentId) -> Result<Incident> {
        let lease = self.acquire(id).await?;
        let incident = self.get(id).await?;
        if !incident.is_terminal() {
            return Err(crate::error::OrchestrationError::NotTerminal {
                id: id.to_string(),
                status: incident.status,
            }
            .into());
        }
        self.repo.delete(id).await?;
        drop(lease);
        // A waiter still holding the slot must keep contending on the same
        // mutex, so the entry only goes once nobody else references it.
        if let Ok(mut leases) = self.leases.lock() {
            if leases.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                leases.remove(id);
            }
        }
        info!(incident_id = %id, status = %incident.status, "Incident archived");
        Ok(incident)
    }
}
