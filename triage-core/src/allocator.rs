//! Resource allocator: report + inventory snapshot -> deployment plan.
//!
//! Side-effect free. The snapshot is only read, so allocation can run
//! speculatively; committing the plan is the caller's job.

use crate::config::AllocationConfig;
use crate::error::{AllocationError, AllocationErrorKind};
use crate::inventory::{Depot, InventorySnapshot};
use crate::types::{AllocationPlan, Assignment, ResourceType, Severity, UnifiedReport};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Allocator {
    config: AllocationConfig,
}

impl Allocator {
    pub fn new(config: AllocationConfig) -> Self {
        Self { config }
    }

    fn severity_factor(&self, severity: Severity) -> f64 {
        let f = &self.config.severity_factors;
        match severity {
            Severity::Low => f.low,
            Severity::Medium => f.medium,
            Severity::High => f.high,
            Severity::Critical => f.critical,
        }
    }

    fn area_factor(&self, area_km2: Option<f64>) -> f64 {
        let area = area_km2.unwrap_or(0.0).max(0.0);
        (1.0 + area / self.config.area_unit_km2).min(self.config.max_area_factor)
    }

    /// Required units per resource type for a report.
    pub fn required(&self, report: &UnifiedReport) -> BTreeMap<ResourceType, u32> {
        let factor = self.severity_factor(report.severity) * self.area_factor(report.affected_area_km2);
        let mut required = BTreeMap::new();
        for rule in &self.config.base_requirements {
            if rule.category != report.category || rule.base == 0 {
                continue;
            }
            let units = ((f64::from(rule.base) * factor).ceil() as u32).max(1);
            *required.entry(rule.resource).or_insert(0) += units;
        }
        required
    }

    /// Depots usable for `resource`, best first: nearest, then most ready, then id.
    fn ranked_depots<'a>(
        report: &UnifiedReport,
        snapshot: &'a InventorySnapshot,
        resource: ResourceType,
    ) -> Vec<(&'a Depot, f64)> {
        let mut depots: Vec<(&Depot, f64)> = snapshot
            .depots
            .iter()
            .filter(|d| d.route_open && d.available(resource) > 0)
            .map(|d| (d, d.location.distance_km(&report.location)))
            .collect();
        depots.sort_by(|(a, da), (b, db)| {
            da.total_cmp(db)
                .then_with(|| b.readiness.total_cmp(&a.readiness))
                .then_with(|| a.id.cmp(&b.id))
        });
        depots
    }

    /// Compute a plan. Never mutates `snapshot`.
    pub fn allocate(
        &self,
        report: &UnifiedReport,
        snapshot: &InventorySnapshot,
    ) -> Result<AllocationPlan, AllocationError> {
        let required = self.required(report);
        let mut remaining: HashMap<(&str, ResourceType), u32> = HashMap::new();
        let mut assignments = Vec::new();
        let mut shortfall = BTreeMap::new();

        // Minimum set first, for every type, before any surplus.
        let mut ranked: BTreeMap<ResourceType, Vec<(&Depot, f64)>> = BTreeMap::new();
        for (&resource, &need) in &required {
            let depots = Self::ranked_depots(report, snapshot, resource);
            let mut outstanding = need;
            for &(depot, distance) in &depots {
                if outstanding == 0 {
                    break;
                }
                let left = remaining
                    .entry((depot.id.as_str(), resource))
                    .or_insert_with(|| depot.available(resource));
                let take = outstanding.min(*left);
                if take == 0 {
                    continue;
                }
                *left -= take;
                outstanding -= take;
                assignments.push(Assignment {
                    resource_type: resource,
                    quantity: take,
                    source_depot: depot.id.clone(),
                    destination: report.location,
                    distance_km: distance,
                    optional: false,
                });
            }
            if outstanding > 0 {
                shortfall.insert(resource, outstanding);
            }
            ranked.insert(resource, depots);
        }

        if self.config.surplus_ratio > 0.0 {
            for (&resource, &need) in &required {
                let mut extra = (f64::from(need) * self.config.surplus_ratio).ceil() as u32;
                for &(depot, distance) in ranked.get(&resource).into_iter().flatten() {
                    if extra == 0 {
                        break;
                    }
                    let left = remaining
                        .entry((depot.id.as_str(), resource))
                        .or_insert_with(|| depot.available(resource));
                    let take = extra.min(*left);
                    if take == 0 {
                        continue;
                    }
                    *left -= take;
                    extra -= take;
                    assignments.push(Assignment {
                        resource_type: resource,
                        quantity: take,
                        source_depot: depot.id.clone(),
                        destination: report.location,
                        distance_km: distance,
                        optional: true,
                    });
                }
            }
        }

        let total_required: u32 = required.values().sum();
        if total_required > 0 && assignments.is_empty() {
            let blocked_by_route = snapshot.depots.iter().any(|d| {
                !d.route_open && required.keys().any(|r| d.available(*r) > 0)
            });
            let kind = if blocked_by_route {
                AllocationErrorKind::NoViableRoute
            } else {
                AllocationErrorKind::InsufficientInventory
            };
            warn!(incident_id = %report.incident_id, kind = %kind, "Nothing could be allocated");
            return Err(AllocationError::new(
                kind,
                format!(
                    "no depot can supply any of {} required units",
                    total_required
                ),
            ));
        }

        let partial = !shortfall.is_empty();
        if partial {
            warn!(
                incident_id = %report.incident_id,
                shortfall = ?shortfall,
                "Inventory cannot fully meet the requirement, plan is partial"
            );
        }
        debug!(
            incident_id = %report.incident_id,
            assignments = assignments.len(),
            inventory_version = snapshot.version,
            "Allocation computed"
        );

        Ok(AllocationPlan {
            incident_id: report.incident_id.clone(),
            cycle: report.cycle,
            inventory_version: snapshot.version,
            assignments,
            required,
            shortfall,
            partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RequirementRule;
    use crate::types::{Category, IncidentId, Location};
    use std::collections::BTreeSet;

    const SCENE: Location = Location {
        latitude: 34.05,
        longitude: -118.24,
    };

    fn report(category: Category, severity: Severity, area: Option<f64>) -> UnifiedReport {
        UnifiedReport {
            incident_id: IncidentId::new("INC-alloc"),
            cycle: 1,
            category,
            location: SCENE,
            severity,
            affected_area_km2: area,
            people_at_risk: None,
            hazards: BTreeSet::new(),
            provenance: BTreeMap::new(),
            conflicts: Vec::new(),
            contributors: Vec::new(),
            missing: Vec::new(),
            provider_attributes: BTreeMap::new(),
        }
    }

    /// Needs exactly `units` fire engines for a medium fire with no area.
    fn engines_only(units: u32) -> Allocator {
        Allocator::new(AllocationConfig {
            base_requirements: vec![RequirementRule {
                category: Category::Fire,
                resource: ResourceType::FireEngine,
                base: units,
            }],
            ..AllocationConfig::default()
        })
    }

    fn snapshot(depots: Vec<Depot>) -> InventorySnapshot {
        InventorySnapshot { version: 7, depots }
    }

    #[test]
    fn test_required_vector_scales_with_severity_and_area() {
        let alloc = Allocator::new(AllocationConfig::default());
        let medium = alloc.required(&report(Category::Fire, Severity::Medium, None));
        assert_eq!(medium[&ResourceType::FireEngine], 2);
        let critical = alloc.required(&report(Category::Fire, Severity::Critical, Some(10.0)));
        // 2 * 2.5 * 2.0
        assert_eq!(critical[&ResourceType::FireEngine], 10);
        let low = alloc.required(&report(Category::Fire, Severity::Low, None));
        assert_eq!(low[&ResourceType::Helicopter], 1);
    }

    #[test]
    fn test_partial_plan_when_inventory_short() {
        let snap = snapshot(vec![
            Depot::new("north", Location::new(34.2, -118.2)).with_stock(ResourceType::FireEngine, 3),
        ]);
        let plan = engines_only(5)
            .allocate(&report(Category::Fire, Severity::Medium, None), &snap)
            .unwrap();
        assert!(plan.partial);
        assert_eq!(plan.quantity_of(ResourceType::FireEngine), 3);
        assert_eq!(plan.shortfall[&ResourceType::FireEngine], 2);
        assert_eq!(plan.inventory_version, 7);
        // snapshot untouched
        assert_eq!(snap.depots[0].available(ResourceType::FireEngine), 3);
    }

    #[test]
    fn test_greedy_prefers_nearest_then_readiness() {
        let snap = snapshot(vec![
            Depot::new("far", Location::new(35.0, -118.24)).with_stock(ResourceType::FireEngine, 10),
            Depot::new("near-b", Location::new(34.06, -118.24))
                .with_stock(ResourceType::FireEngine, 1)
                .with_readiness(0.6),
            Depot::new("near-a", Location::new(34.06, -118.24))
                .with_stock(ResourceType::FireEngine, 1)
                .with_readiness(0.9),
        ]);
        let plan = engines_only(3)
            .allocate(&report(Category::Fire, Severity::Medium, None), &snap)
            .unwrap();
        let order: Vec<&str> = plan.assignments.iter().map(|a| a.source_depot.as_str()).collect();
        assert_eq!(order, vec!["near-a", "near-b", "far"]);
        assert!(!plan.partial);
    }

    #[test]
    fn test_closed_routes_are_skipped() {
        let snap = snapshot(vec![
            Depot::new("closed", SCENE)
                .with_stock(ResourceType::FireEngine, 5)
                .closed(),
        ]);
        let err = engines_only(2)
            .allocate(&report(Category::Fire, Severity::Medium, None), &snap)
            .unwrap_err();
        assert_eq!(err.kind, AllocationErrorKind::NoViableRoute);
    }

    #[test]
    fn test_empty_inventory_is_insufficient() {
        let err = engines_only(2)
            .allocate(&report(Category::Fire, Severity::Medium, None), &snapshot(Vec::new()))
            .unwrap_err();
        assert_eq!(err.kind, AllocationErrorKind::InsufficientInventory);
    }

    #[test]
    fn test_surplus_is_optional_and_after_minimum() {
        let mut config = AllocationConfig::default();
        config.base_requirements = vec![RequirementRule {
            category: Category::Fire,
            resource: ResourceType::FireEngine,
            base: 4,
        }];
        config.surplus_ratio = 0.5;
        let snap = snapshot(vec![
            Depot::new("a", SCENE).with_stock(ResourceType::FireEngine, 5),
        ]);
        let plan = Allocator::new(config)
            .allocate(&report(Category::Fire, Severity::Medium, None), &snap)
            .unwrap();
        let mandatory: u32 = plan.assignments.iter().filter(|a| !a.optional).map(|a| a.quantity).sum();
        let optional: u32 = plan.assignments.iter().filter(|a| a.optional).map(|a| a.quantity).sum();
        assert_eq!(mandatory, 4);
        assert_eq!(optional, 1);
        assert!(!plan.partial);
    }

    #[test]
    fn test_zero_requirement_gives_empty_plan() {
        let alloc = Allocator::new(AllocationConfig {
            base_requirements: Vec::new(),
            ..AllocationConfig::default()
        });
        let plan = alloc
            .allocate(&report(Category::Other, Severity::Low, None), &snapshot(Vec::new()))
            .unwrap();
        assert!(plan.assignments.is_empty());
        assert!(!plan.partial);
    }
}
