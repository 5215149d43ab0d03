//! Validator: fail-fast readiness gates in front of any real-world action.
//!
//! Gates run in the fixed order of [`GateKind::SEQUENCE`]; the first failure
//! rejects the plan and later gates are not evaluated.

use crate::config::ValidationConfig;
use crate::error::ValidationRejection;
use crate::inventory::InventorySnapshot;
use crate::types::{AllocationPlan, GateKind, UnifiedReport};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What the gates check a plan against.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Fresh inventory read, not the one the plan was computed from.
    pub inventory: &'a InventorySnapshot,
    pub report: &'a UnifiedReport,
}

/// Result of one evaluated gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    pub gate: GateKind,
    pub passed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved,
    Rejected(ValidationRejection),
}

/// Verdict plus every gate evaluated, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub verdict: Verdict,
    pub gates: Vec<GateResult>,
}

impl ValidationOutcome {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }

    pub fn rejection(&self) -> Option<&ValidationRejection> {
        match &self.verdict {
            Verdict::Rejected(r) => Some(r),
            Verdict::Approved => None,
        }
    }

    pub fn evaluated(&self, gate: GateKind) -> bool {
        self.gates.iter().any(|g| g.gate == gate)
    }
}

type GateCheck = Result<String, String>;

#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn allows_degraded_response(&self) -> bool {
        self.config.allow_degraded_response
    }

    /// Run the gate chain.
    pub fn validate(&self, plan: &AllocationPlan, ctx: ValidationContext<'_>) -> ValidationOutcome {
        let mut gates = Vec::with_capacity(GateKind::SEQUENCE.len());
        for gate in GateKind::SEQUENCE {
            let check = match gate {
                GateKind::InventoryAvailability => self.inventory_availability(plan, &ctx),
                GateKind::RouteAccessibility => self.route_accessibility(plan, &ctx),
                GateKind::ResponderReadiness => self.responder_readiness(plan, &ctx),
                GateKind::SafetyProtocol => self.safety_protocol(plan, &ctx),
            };
            match check {
                Ok(reason) => {
                    debug!(incident_id = %plan.incident_id, gate = %gate, "Gate passed");
                    gates.push(GateResult {
                        gate,
                        passed: true,
                        reason,
                    });
                }
                Err(reason) => {
                    warn!(incident_id = %plan.incident_id, gate = %gate, reason = %reason, "Plan rejected");
                    gates.push(GateResult {
                        gate,
                        passed: false,
                        reason: reason.clone(),
                    });
                    return ValidationOutcome {
                        verdict: Verdict::Rejected(ValidationRejection { gate, reason }),
                        gates,
                    };
                }
            }
        }
        info!(incident_id = %plan.incident_id, partial = plan.partial, "Plan approved");
        ValidationOutcome {
            verdict: Verdict::Approved,
            gates,
        }
    }

    fn inventory_availability(&self, plan: &AllocationPlan, ctx: &ValidationContext<'_>) -> GateCheck {
        if plan.partial && !self.config.allow_degraded_response {
            return Err(format!(
                "plan is partial (short {} units) and degraded response is not allowed",
                plan.shortfall.values().sum::<u32>()
            ));
        }
        if plan.assignments.is_empty() && plan.total_required() > 0 {
            return Err("plan assigns nothing against a non-zero requirement".into());
        }
        let mut demand: BTreeMap<(&str, _), u32> = BTreeMap::new();
        for a in &plan.assignments {
            *demand
                .entry((a.source_depot.as_str(), a.resource_type))
                .or_insert(0) += a.quantity;
        }
        for ((depot_id, resource), quantity) in demand {
            // unknown depots are the route gate's concern
            if let Some(depot) = ctx.inventory.depot(depot_id) {
                let available = depot.available(resource);
                if available < quantity {
                    return Err(format!(
                        "depot '{depot_id}' now holds {available} {resource}, plan needs {quantity}"
                    ));
                }
            }
        }
        Ok(if plan.partial {
            "partial plan accepted under degraded-response policy".into()
        } else {
            "all assignments in stock".into()
        })
    }

    fn route_accessibility(&self, plan: &AllocationPlan, ctx: &ValidationContext<'_>) -> GateCheck {
        for a in &plan.assignments {
            let Some(depot) = ctx.inventory.depot(&a.source_depot) else {
                return Err(format!("depot '{}' is unknown", a.source_depot));
            };
            if !depot.route_open {
                return Err(format!("route from depot '{}' is closed", depot.id));
            }
            let distance = depot.location.distance_km(&ctx.report.location);
            if distance > self.config.max_route_km {
                return Err(format!(
                    "depot '{}' is {:.1} km away, limit is {:.1} km",
                    depot.id, distance, self.config.max_route_km
                ));
            }
        }
        Ok("all routes open and within range".into())
    }

    fn responder_readiness(&self, plan: &AllocationPlan, ctx: &ValidationContext<'_>) -> GateCheck {
        for a in &plan.assignments {
            if let Some(depot) = ctx.inventory.depot(&a.source_depot) {
                if depot.readiness < self.config.min_readiness {
                    return Err(format!(
                        "depot '{}' readiness {:.2} below {:.2}",
                        depot.id, depot.readiness, self.config.min_readiness
                    ));
                }
            }
        }
        Ok("responders ready".into())
    }

    fn safety_protocol(&self, plan: &AllocationPlan, ctx: &ValidationContext<'_>) -> GateCheck {
        for restriction in &self.config.restrictions {
            if !ctx.report.has_hazard(&restriction.hazard) {
                continue;
            }
            if let Some(a) = plan
                .assignments
                .iter()
                .find(|a| restriction.resources.contains(&a.resource_type))
            {
                return Err(format!(
                    "{} grounded by hazard '{}'",
                    a.resource_type, restriction.hazard
                ));
            }
        }
        Ok("no restricted resources for reported hazards".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Depot;
    use crate::types::{Assignment, Category, IncidentId, Location, ResourceType, Severity};
    use std::collections::BTreeSet;

    const SCENE: Location = Location {
        latitude: 34.05,
        longitude: -118.24,
    };

    fn report(hazards: &[&str]) -> UnifiedReport {
        UnifiedReport {
            incident_id: IncidentId::new("INC-val"),
            cycle: 1,
            category: Category::Fire,
            location: SCENE,
            severity: Severity::High,
            affected_area_km2: None,
            people_at_risk: None,
            hazards: hazards.iter().map(|h| h.to_string()).collect::<BTreeSet<_>>(),
            provenance: BTreeMap::new(),
            conflicts: Vec::new(),
            contributors: Vec::new(),
            missing: Vec::new(),
            provider_attributes: BTreeMap::new(),
        }
    }

    fn plan(resource: ResourceType, depot: &str, quantity: u32, shortfall: u32) -> AllocationPlan {
        let mut short = BTreeMap::new();
        if shortfall > 0 {
            short.insert(resource, shortfall);
        }
        AllocationPlan {
            incident_id: IncidentId::new("INC-val"),
            cycle: 1,
            inventory_version: 1,
            assignments: vec![Assignment {
                resource_type: resource,
                quantity,
                source_depot: depot.into(),
                destination: SCENE,
                distance_km: 10.0,
                optional: false,
            }],
            required: BTreeMap::from([(resource, quantity + shortfall)]),
            shortfall: short,
            partial: shortfall > 0,
        }
    }

    fn inventory(depots: Vec<Depot>) -> InventorySnapshot {
        InventorySnapshot { version: 1, depots }
    }

    fn depot() -> Depot {
        Depot::new("north", Location::new(34.1, -118.2))
            .with_stock(ResourceType::FireEngine, 3)
            .with_stock(ResourceType::Helicopter, 2)
    }

    #[test]
    fn test_full_plan_approved() {
        let inv = inventory(vec![depot()]);
        let r = report(&[]);
        let outcome = Validator::new(ValidationConfig::default()).validate(
            &plan(ResourceType::FireEngine, "north", 3, 0),
            ValidationContext {
                inventory: &inv,
                report: &r,
            },
        );
        assert!(outcome.is_approved());
        assert_eq!(outcome.gates.len(), 4);
    }

    #[test]
    fn test_partial_plan_depends_on_policy() {
        let inv = inventory(vec![depot()]);
        let r = report(&[]);
        let partial = plan(ResourceType::FireEngine, "north", 3, 2);
        let ctx = ValidationContext {
            inventory: &inv,
            report: &r,
        };

        let strict = Validator::new(ValidationConfig::default()).validate(&partial, ctx);
        assert_eq!(
            strict.rejection().unwrap().gate,
            GateKind::InventoryAvailability
        );

        let lenient = Validator::new(ValidationConfig {
            allow_degraded_response: true,
            ..ValidationConfig::default()
        })
        .validate(&partial, ctx);
        assert!(lenient.is_approved());
    }

    #[test]
    fn test_route_failure_stops_chain() {
        let inv = inventory(vec![depot().closed()]);
        let r = report(&["high_wind"]);
        let outcome = Validator::new(ValidationConfig::default()).validate(
            &plan(ResourceType::Helicopter, "north", 1, 0),
            ValidationContext {
                inventory: &inv,
                report: &r,
            },
        );
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.gate, GateKind::RouteAccessibility);
        assert!(!outcome.evaluated(GateKind::SafetyProtocol));
        assert_eq!(outcome.gates.len(), 2);
    }

    #[test]
    fn test_stock_drained_since_allocation() {
        let inv = inventory(vec![
            Depot::new("north", Location::new(34.1, -118.2)).with_stock(ResourceType::FireEngine, 1),
        ]);
        let r = report(&[]);
        let outcome = Validator::new(ValidationConfig::default()).validate(
            &plan(ResourceType::FireEngine, "north", 3, 0),
            ValidationContext {
                inventory: &inv,
                report: &r,
            },
        );
        assert_eq!(
            outcome.rejection().unwrap().gate,
            GateKind::InventoryAvailability
        );
    }

    #[test]
    fn test_low_readiness_rejected() {
        let inv = inventory(vec![depot().with_readiness(0.2)]);
        let r = report(&[]);
        let outcome = Validator::new(ValidationConfig::default()).validate(
            &plan(ResourceType::FireEngine, "north", 1, 0),
            ValidationContext {
                inventory: &inv,
                report: &r,
            },
        );
        assert_eq!(
            outcome.rejection().unwrap().gate,
            GateKind::ResponderReadiness
        );
    }

    #[test]
    fn test_hazard_grounds_helicopters() {
        let inv = inventory(vec![depot()]);
        let r = report(&["high_wind"]);
        let outcome = Validator::new(ValidationConfig::default()).validate(
            &plan(ResourceType::Helicopter, "north", 1, 0),
            ValidationContext {
                inventory: &inv,
                report: &r,
            },
        );
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.gate, GateKind::SafetyProtocol);
        assert!(rejection.reason.contains("helicopter"));
    }

    #[test]
    fn test_route_out_of_range() {
        let inv = inventory(vec![
            Depot::new("far", Location::new(40.0, -118.24)).with_stock(ResourceType::FireEngine, 3),
        ]);
        let r = report(&[]);
        let outcome = Validator::new(ValidationConfig::default()).validate(
            &plan(ResourceType::FireEngine, "far", 1, 0),
            ValidationContext {
                inventory: &inv,
                report: &r,
            },
        );
        assert_eq!(
            outcome.rejection().unwrap().gate,
            GateKind::RouteAccessibility
        );
    }
}
