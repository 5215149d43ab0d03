//! Aggregator: merges provider outcomes into one [`UnifiedReport`].
//!
//! Pure and deterministic. Per field, the highest-precedence providers win;
//! among equal-precedence providers the most severe value is chosen and a
//! conflict is recorded when their spread exceeds the configured tolerance.

use crate::config::AggregationConfig;
use crate::error::AggregationError;
use crate::types::{
    AnalysisTask, Conflict, FieldValue, Finding, Incident, ProviderId, ProviderKind, Provenance,
    ReportField, ResolutionRule, UnifiedReport,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

struct Candidate<'a> {
    provider: &'a ProviderId,
    rank: u8,
    value: FieldValue,
}

fn magnitude(value: &FieldValue) -> f64 {
    match value {
        FieldValue::Severity(s) => f64::from(s.level()),
        FieldValue::AreaKm2(a) => *a,
        FieldValue::People(p) => f64::from(*p),
    }
}

fn field_value(field: ReportField, finding: &Finding) -> Option<FieldValue> {
    match field {
        ReportField::Severity => finding.severity.map(FieldValue::Severity),
        ReportField::AffectedArea => finding.affected_area_km2.map(FieldValue::AreaKm2),
        ReportField::PeopleAtRisk => finding.people_at_risk.map(FieldValue::People),
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    config: AggregationConfig,
}

impl Aggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    fn rank(&self, field: ReportField, kind: ProviderKind) -> u8 {
        self.config
            .precedence
            .iter()
            .find(|r| r.field == field && r.kind == kind)
            .map(|r| r.rank)
            .unwrap_or(0)
    }

    fn check_quorum(
        &self,
        outcomes: &BTreeMap<ProviderId, AnalysisTask>,
    ) -> Result<(), AggregationError> {
        for rule in &self.config.quorum {
            let succeeded = rule
                .any_of
                .iter()
                .filter(|p| {
                    outcomes
                        .get(&ProviderId::new(p.as_str()))
                        .is_some_and(|t| t.outcome.is_success())
                })
                .count();
            if succeeded < rule.min_successes {
                return Err(AggregationError::QuorumNotMet {
                    candidates: rule.any_of.join(", "),
                    required: rule.min_successes,
                    succeeded,
                });
            }
        }
        Ok(())
    }

    fn exceeds_tolerance(&self, low: &FieldValue, high: &FieldValue) -> bool {
        match (low, high) {
            (FieldValue::Severity(a), FieldValue::Severity(b)) => {
                b.level().abs_diff(a.level()) > self.config.severity_tolerance
            }
            _ => {
                let (lo, hi) = (magnitude(low), magnitude(high));
                hi > 0.0 && (hi - lo) / hi > self.config.numeric_tolerance
            }
        }
    }

    /// Choose a value for one field, recording a conflict when warranted.
    fn resolve(
        &self,
        field: ReportField,
        candidates: Vec<Candidate<'_>>,
    ) -> Option<(Provenance, Option<Conflict>)> {
        let top_rank = candidates.iter().map(|c| c.rank).max()?;
        let top: Vec<&Candidate<'_>> = candidates.iter().filter(|c| c.rank == top_rank).collect();

        let mut chosen = top[0];
        let mut lowest = top[0];
        for c in &top[1..] {
            if magnitude(&c.value) > magnitude(&chosen.value) {
                chosen = *c;
            }
            if magnitude(&c.value) < magnitude(&lowest.value) {
                lowest = *c;
            }
        }
        let provenance = Provenance {
            provider: chosen.provider.clone(),
            value: chosen.value,
        };

        let conflict = (top.len() > 1 && self.exceeds_tolerance(&lowest.value, &chosen.value))
            .then(|| Conflict {
                field,
                candidates: top
                    .iter()
                    .map(|c| Provenance {
                        provider: c.provider.clone(),
                        value: c.value,
                    })
                    .collect(),
                chosen: provenance.clone(),
                rule: ResolutionRule::MostConservative,
            });
        Some((provenance, conflict))
    }

    /// Merge the outcomes of one cycle for `incident`.
    pub fn aggregate(
        &self,
        incident: &Incident,
        outcomes: &BTreeMap<ProviderId, AnalysisTask>,
    ) -> Result<UnifiedReport, AggregationError> {
        self.check_quorum(outcomes)?;

        let successes: Vec<(&ProviderId, ProviderKind, &Finding)> = outcomes
            .iter()
            .filter_map(|(id, task)| task.outcome.finding().map(|f| (id, task.kind, f)))
            .collect();
        let contributors: Vec<ProviderId> = successes.iter().map(|(id, _, _)| (*id).clone()).collect();
        let missing: Vec<ProviderId> = outcomes
            .iter()
            .filter(|(_, t)| !t.outcome.is_success())
            .map(|(id, _)| id.clone())
            .collect();

        let mut provenance = BTreeMap::new();
        let mut conflicts = Vec::new();
        for field in [
            ReportField::Severity,
            ReportField::AffectedArea,
            ReportField::PeopleAtRisk,
        ] {
            let candidates = successes
                .iter()
                .filter_map(|(id, kind, finding)| {
                    field_value(field, finding).map(|value| Candidate {
                        provider: *id,
                        rank: self.rank(field, *kind),
                        value,
                    })
                })
                .collect();
            if let Some((chosen, conflict)) = self.resolve(field, candidates) {
                if let Some(conflict) = conflict {
                    warn!(
                        incident_id = %incident.id,
                        field = %field,
                        chosen = %conflict.chosen.provider,
                        candidates = conflict.candidates.len(),
                        "Providers disagree, keeping the most conservative value"
                    );
                    conflicts.push(conflict);
                }
                provenance.insert(field, chosen);
            }
        }

        let severity = match provenance.get(&ReportField::Severity).map(|p| p.value) {
            Some(FieldValue::Severity(s)) => s,
            _ => return Err(AggregationError::MissingSeverity),
        };
        let affected_area_km2 = match provenance.get(&ReportField::AffectedArea).map(|p| p.value) {
            Some(FieldValue::AreaKm2(a)) => Some(a),
            _ => None,
        };
        let people_at_risk = match provenance.get(&ReportField::PeopleAtRisk).map(|p| p.value) {
            Some(FieldValue::People(n)) => Some(n),
            _ => None,
        };

        let hazards: BTreeSet<String> = successes
            .iter()
            .flat_map(|(_, _, f)| f.hazards.iter().cloned())
            .collect();
        let provider_attributes = successes
            .iter()
            .filter(|(_, _, f)| !f.attributes.is_empty())
            .map(|(id, _, f)| ((*id).clone(), f.attributes.clone()))
            .collect();

        debug!(
            incident_id = %incident.id,
            severity = %severity,
            contributors = contributors.len(),
            conflicts = conflicts.len(),
            "Aggregated provider outcomes"
        );

        Ok(UnifiedReport {
            incident_id: incident.id.clone(),
            cycle: incident.cycle,
            category: incident.category,
            location: incident.location,
            severity,
            affected_area_km2,
            people_at_risk,
            hazards,
            provenance,
            conflicts,
            contributors,
            missing,
            provider_attributes,
        })
    }
}
