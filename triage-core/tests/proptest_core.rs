//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use chrono::Utc;
use std::collections::BTreeMap;
use triage_core::config::{AggregationConfig, AllocationConfig, ValidationConfig};
use triage_core::types::{AnalysisTask, ReportField, TaskOutcome};
use triage_core::validator::ValidationContext;
use triage_core::{
    Aggregator, Allocator, Category, Depot, Finding, Incident, IncidentId, IncidentReport,
    InventorySnapshot, Location, ProviderId, ProviderKind, ResourceType, Severity, UnifiedReport,
    Validator,
};

const SCENE: Location = Location {
    latitude: 34.05,
    longitude: -118.24,
};

fn incident(category: Category) -> Incident {
    Incident::from_report(IncidentReport {
        category,
        location: SCENE,
        description: None,
        signals: Vec::new(),
    })
}

fn success(provider: &str, kind: ProviderKind, finding: Finding) -> (ProviderId, AnalysisTask) {
    let id = ProviderId::from(provider);
    let mut task = AnalysisTask::pending(id.clone(), kind, IncidentId::new("INC-prop"), Utc::now());
    task.attempts = 1;
    task.outcome = TaskOutcome::Success { finding };
    (id, task)
}

fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Low),
        Just(Severity::Medium),
        Just(Severity::High),
        Just(Severity::Critical),
    ]
}

fn category() -> impl Strategy<Value = Category> {
    prop_oneof![
        Just(Category::Fire),
        Just(Category::Flood),
        Just(Category::Seismic),
        Just(Category::Storm),
        Just(Category::Other),
    ]
}

fn resource() -> impl Strategy<Value = ResourceType> {
    prop_oneof![
        Just(ResourceType::FireEngine),
        Just(ResourceType::Ambulance),
        Just(ResourceType::SearchAndRescue),
        Just(ResourceType::Helicopter),
        Just(ResourceType::Boat),
        Just(ResourceType::SupplyTruck),
    ]
}

fn finding() -> impl Strategy<Value = Finding> {
    (
        severity(),
        proptest::option::of(0.0f64..500.0),
        proptest::option::of(0u32..10_000),
    )
        .prop_map(|(severity, area, people)| {
            let mut f = Finding::with_severity(severity);
            f.affected_area_km2 = area;
            f.people_at_risk = people;
            f
        })
}

fn depot() -> impl Strategy<Value = Depot> {
    (
        -1.0f64..1.0,
        -1.0f64..1.0,
        proptest::collection::btree_map(resource(), 0u32..20, 0..4),
        any::<bool>(),
    )
        .prop_map(|(dlat, dlon, stock, open)| {
            let mut d = Depot::new(
                "unnamed",
                Location::new(SCENE.latitude + dlat, SCENE.longitude + dlon),
            );
            d.stock = stock;
            d.route_open = open;
            d
        })
}

fn depots() -> impl Strategy<Value = Vec<Depot>> {
    proptest::collection::vec(depot(), 0..6).prop_map(|mut depots| {
        for (i, d) in depots.iter_mut().enumerate() {
            d.id = format!("depot-{i}");
        }
        depots
    })
}

fn report_for(category: Category, severity: Severity, area: Option<f64>) -> UnifiedReport {
    let mut f = Finding::with_severity(severity);
    f.affected_area_km2 = area;
    let outcomes = BTreeMap::from([success("weather", ProviderKind::Weather, f)]);
    Aggregator::new(AggregationConfig::default())
        .aggregate(&incident(category), &outcomes)
        .unwrap()
}

// --- Aggregation properties ---

proptest! {
    #[test]
    fn aggregation_is_idempotent(
        weather in finding(),
        imagery in finding(),
        sos in finding(),
    ) {
        let outcomes = BTreeMap::from([
            success("weather", ProviderKind::Weather, weather),
            success("imagery", ProviderKind::Imagery, imagery),
            success("sos", ProviderKind::SosExtraction, sos),
        ]);
        let agg = Aggregator::new(AggregationConfig::default());
        let inc = incident(Category::Fire);
        let first = agg.aggregate(&inc, &outcomes).unwrap();
        let second = agg.aggregate(&inc, &outcomes).unwrap();
        prop_assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn equal_precedence_keeps_the_higher_severity(a in severity(), b in severity()) {
        let outcomes = BTreeMap::from([
            success("weather", ProviderKind::Weather, Finding::with_severity(a)),
            success("imagery", ProviderKind::Imagery, Finding::with_severity(b)),
        ]);
        let report = Aggregator::new(AggregationConfig::default())
            .aggregate(&incident(Category::Fire), &outcomes)
            .unwrap();
        prop_assert_eq!(report.severity, a.max(b));
        prop_assert_eq!(report.conflict_on(ReportField::Severity).is_some(), a != b);
    }
}

// --- Allocation properties ---

proptest! {
    #[test]
    fn allocation_never_exceeds_stock(
        category in category(),
        severity in severity(),
        area in proptest::option::of(0.0f64..200.0),
        depots in depots(),
        surplus in 0.0f64..1.0,
    ) {
        let report = report_for(category, severity, area);
        let snapshot = InventorySnapshot { version: 3, depots };
        let allocator = Allocator::new(AllocationConfig {
            surplus_ratio: surplus,
            ..AllocationConfig::default()
        });
        let Ok(plan) = allocator.allocate(&report, &snapshot) else {
            return Ok(());
        };

        let mut drawn: BTreeMap<(String, ResourceType), u32> = BTreeMap::new();
        for a in &plan.assignments {
            prop_assert!(a.quantity > 0);
            *drawn.entry((a.source_depot.clone(), a.resource_type)).or_insert(0) += a.quantity;
        }
        for ((depot, resource), quantity) in drawn {
            let source = snapshot.depot(&depot).unwrap();
            prop_assert!(source.route_open);
            let stock = source.available(resource);
            prop_assert!(quantity <= stock, "{depot} {resource}: {quantity} > {stock}");
        }
        for (resource, &need) in &plan.required {
            let mandatory: u32 = plan
                .assignments
                .iter()
                .filter(|a| a.resource_type == *resource && !a.optional)
                .map(|a| a.quantity)
                .sum();
            prop_assert!(mandatory <= need);
            prop_assert_eq!(mandatory + plan.shortfall.get(resource).copied().unwrap_or(0), need);
        }
        prop_assert_eq!(plan.partial, !plan.shortfall.is_empty());
    }

    #[test]
    fn partial_plans_pass_only_with_degraded_response(
        ambulances in 1u32..5,
    ) {
        let report = report_for(Category::Fire, Severity::Medium, None);
        let snapshot = InventorySnapshot {
            version: 1,
            depots: vec![
                Depot::new("north", Location::new(34.1, -118.2))
                    .with_stock(ResourceType::FireEngine, 1)
                    .with_stock(ResourceType::Ambulance, ambulances)
                    .with_stock(ResourceType::Helicopter, 5),
            ],
        };
        let plan = Allocator::new(AllocationConfig::default())
            .allocate(&report, &snapshot)
            .unwrap();
        prop_assert!(plan.partial);

        let ctx = ValidationContext { inventory: &snapshot, report: &report };
        let strict = Validator::new(ValidationConfig::default()).validate(&plan, ctx);
        prop_assert!(!strict.is_approved());

        let lenient = Validator::new(ValidationConfig {
            allow_degraded_response: true,
            ..ValidationConfig::default()
        })
        .validate(&plan, ctx);
        prop_assert!(lenient.is_approved(), "{:?}", lenient.gates);
    }
}
