//! Resource inventory collaborator.
//!
//! The orchestrator reads versioned snapshots for allocation and validation,
//! and commits approved plans. A commit against a stale snapshot, or one that
//! no longer fits the live stock, is answered with a conflict.

use crate::error::InventoryError;
use crate::types::{AllocationPlan, Location, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A staging location holding deployable resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Depot {
    pub id: String,
    pub location: Location,
    /// Whether a road/air route from this depot is currently usable.
    #[serde(default = "default_route_open")]
    pub route_open: bool,
    /// Crew readiness in `0.0..=1.0`.
    #[serde(default = "default_readiness")]
    pub readiness: f64,
    #[serde(default)]
    pub stock: BTreeMap<ResourceType, u32>,
}

fn default_route_open() -> bool {
    true
}

fn default_readiness() -> f64 {
    1.0
}

impl Depot {
    pub fn new(id: impl Into<String>, location: Location) -> Self {
        Self {
            id: id.into(),
            location,
            route_open: true,
            readiness: 1.0,
            stock: BTreeMap::new(),
        }
    }

    pub fn with_stock(mut self, resource: ResourceType, quantity: u32) -> Self {
        self.stock.insert(resource, quantity);
        self
    }

    pub fn with_readiness(mut self, readiness: f64) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn closed(mut self) -> Self {
        self.route_open = false;
        self
    }

    pub fn available(&self, resource: ResourceType) -> u32 {
        self.stock.get(&resource).copied().unwrap_or(0)
    }
}

/// Point-in-time view of the inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub version: u64,
    pub depots: Vec<Depot>,
}

impl InventorySnapshot {
    pub fn depot(&self, id: &str) -> Option<&Depot> {
        self.depots.iter().find(|d| d.id == id)
    }

    /// Total stock of a type across all depots, reachable or not.
    pub fn total(&self, resource: ResourceType) -> u32 {
        self.depots.iter().map(|d| d.available(resource)).sum()
    }
}

/// Answer to a commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: u64 },
    Conflict { reason: String },
}

#[async_trait]
pub trait ResourceInventory: Send + Sync {
    async fn snapshot(&self) -> Result<InventorySnapshot, InventoryError>;

    /// Reserve every assignment of `plan` atomically, or none of them.
    async fn commit(&self, plan: &AllocationPlan) -> Result<CommitOutcome, InventoryError>;
}

/// Process-local inventory with optimistic versioning.
pub struct InMemoryInventory {
    state: Mutex<InventorySnapshot>,
}

impl InMemoryInventory {
    pub fn new(depots: Vec<Depot>) -> Self {
        Self {
            state: Mutex::new(InventorySnapshot { version: 1, depots }),
        }
    }

    /// Add stock out of band; bumps the version like any live change.
    pub async fn restock(&self, depot: &str, resource: ResourceType, quantity: u32) -> bool {
        let mut state = self.state.lock().await;
        let Some(d) = state.depots.iter_mut().find(|d| d.id == depot) else {
            return false;
        };
        *d.stock.entry(resource).or_insert(0) += quantity;
        state.version += 1;
        true
    }
}

#[async_trait]
impl ResourceInventory for InMemoryInventory {
    async fn snapshot(&self) -> Result<InventorySnapshot, InventoryError> {
        Ok(self.state.lock().await.clone())
    }

    async fn commit(&self, plan: &AllocationPlan) -> Result<CommitOutcome, InventoryError> {
        let mut state = self.state.lock().await;
        if plan.inventory_version != state.version {
            debug!(
                plan_version = plan.inventory_version,
                current = state.version,
                "Rejecting commit against stale snapshot"
            );
            return Ok(CommitOutcome::Conflict {
                reason: format!(
                    "plan computed against version {}, inventory is at {}",
                    plan.inventory_version, state.version
                ),
            });
        }

        let mut demand: BTreeMap<(&str, ResourceType), u32> = BTreeMap::new();
        for a in &plan.assignments {
            *demand
                .entry((a.source_depot.as_str(), a.resource_type))
                .or_insert(0) += a.quantity;
        }
        for ((depot, resource), quantity) in &demand {
            let available = state.depot(depot).map(|d| d.available(*resource)).unwrap_or(0);
            if available < *quantity {
                return Ok(CommitOutcome::Conflict {
                    reason: format!(
                        "depot '{depot}' holds {available} {resource}, plan needs {quantity}"
                    ),
                });
            }
        }

        for ((depot, resource), quantity) in demand {
            if let Some(d) = state.depots.iter_mut().find(|d| d.id == depot) {
                if let Some(stock) = d.stock.get_mut(&resource) {
                    *stock -= quantity;
                }
            }
        }
        state.version += 1;
        info!(
            incident_id = %plan.incident_id,
            version = state.version,
            assignments = plan.assignments.len(),
            "Committed allocation plan"
        );
        Ok(CommitOutcome::Committed {
            version: state.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Assignment, IncidentId};

    fn inventory() -> InMemoryInventory {
        InMemoryInventory::new(vec![
            Depot::new("north", Location::new(34.2, -118.2)).with_stock(ResourceType::FireEngine, 3),
        ])
    }

    fn plan(version: u64, quantity: u32) -> AllocationPlan {
        AllocationPlan {
            incident_id: IncidentId::new("INC-1"),
            cycle: 1,
            inventory_version: version,
            assignments: vec![Assignment {
                resource_type: ResourceType::FireEngine,
                quantity,
                source_depot: "north".into(),
                destination: Location::new(34.05, -118.24),
                distance_km: 17.0,
                optional: false,
            }],
            required: BTreeMap::from([(ResourceType::FireEngine, quantity)]),
            shortfall: BTreeMap::new(),
            partial: false,
        }
    }

    #[tokio::test]
    async fn test_commit_deducts_stock_and_bumps_version() {
        let inv = inventory();
        let outcome = inv.commit(&plan(1, 2)).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { version: 2 });
        let snap = inv.snapshot().await.unwrap();
        assert_eq!(snap.depot("north").unwrap().available(ResourceType::FireEngine), 1);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let inv = inventory();
        assert!(inv.restock("north", ResourceType::Ambulance, 1).await);
        let outcome = inv.commit(&plan(1, 1)).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Conflict { .. }));
        // nothing was deducted
        let snap = inv.snapshot().await.unwrap();
        assert_eq!(snap.depot("north").unwrap().available(ResourceType::FireEngine), 3);
    }

    #[tokio::test]
    async fn test_insufficient_stock_conflicts() {
        let inv = inventory();
        let outcome = inv.commit(&plan(1, 5)).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Conflict { .. }));
    }

    #[test]
    fn test_depot_deserializes_with_defaults() {
        let depot: Depot = serde_json::from_str(
            r#"{"id":"d1","location":{"latitude":1.0,"longitude":2.0},"stock":{"boat":4}}"#,
        )
        .unwrap();
        assert!(depot.route_open);
        assert_eq!(depot.readiness, 1.0);
        assert_eq!(depot.available(ResourceType::Boat), 4);
    }
}
