//! Core data model for Triage.
//!
//! Incidents and their status machine, analysis tasks and provider findings,
//! the unified report, allocation plans and notification records.

use crate::error::OrchestrationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const EARTH_RADIUS_KM: f64 = 6371.0;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Immutable incident identifier, e.g. `INC-20260105093012-1f3a9c2e`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id from the current time plus a random suffix.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "INC-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key of an analysis provider (`sos`, `weather`, `imagery`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Incident attributes
// ---------------------------------------------------------------------------

/// Disaster category. Accepts the inbound report vocabulary as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[serde(alias = "earthquake")]
    Seismic,
    #[serde(alias = "tsunami")]
    Flood,
    #[serde(alias = "wildfire")]
    Fire,
    #[serde(alias = "hurricane")]
    Storm,
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Seismic => write!(f, "seismic"),
            Category::Flood => write!(f, "flood"),
            Category::Fire => write!(f, "fire"),
            Category::Storm => write!(f, "storm"),
            Category::Other => write!(f, "other"),
        }
    }
}

impl FromStr for Category {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seismic" | "earthquake" => Ok(Category::Seismic),
            "flood" | "tsunami" => Ok(Category::Flood),
            "fire" | "wildfire" => Ok(Category::Fire),
            "storm" | "hurricane" => Ok(Category::Storm),
            "other" => Ok(Category::Other),
            _ => Err(OrchestrationError::UnknownCategory {
                value: s.to_string(),
            }),
        }
    }
}

/// Severity scale. Ordering is by urgency, so `max()` is the conservative pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn level(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    /// One level more severe, saturating at critical.
    pub fn raised(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &Location) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// An inbound distress signal attached to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosMessage {
    pub id: String,
    pub text: String,
    pub location: Location,
    pub received_at: DateTime<Utc>,
    /// Where the signal came from: `twitter`, `manual`, `sms`, ...
    pub source: String,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub verified: bool,
}

impl SosMessage {
    pub fn new(text: impl Into<String>, location: Location, source: impl Into<String>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("SOS-{}", &suffix[..12]),
            text: text.into(),
            location,
            received_at: Utc::now(),
            source: source.into(),
            severity: None,
            verified: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Status machine
// ---------------------------------------------------------------------------

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Created,
    Analyzing,
    Aggregated,
    Allocating,
    Validating,
    Notifying,
    Monitoring,
    Resolved,
    Failed,
}

impl IncidentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the transition graph.
    ///
    /// Edges run strictly forward through the pipeline, except for the
    /// `monitoring -> analyzing` re-trigger. Any non-terminal status may
    /// move to `failed` or be explicitly `resolved`.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (_, Resolved)
                | (Created, Analyzing)
                | (Analyzing, Aggregated)
                | (Aggregated, Allocating)
                | (Allocating, Validating)
                | (Validating, Notifying)
                | (Notifying, Monitoring)
                | (Monitoring, Analyzing)
        )
    }

    /// Statuses an orchestration cycle may start from.
    pub fn is_runnable(self) -> bool {
        matches!(self, IncidentStatus::Created | IncidentStatus::Monitoring)
    }

    /// Pipeline stage of the last checkpoint a cycle wrote, `None` outside
    /// a cycle.
    pub fn cycle_stage(self) -> Option<Stage> {
        match self {
            IncidentStatus::Analyzing => Some(Stage::Analysis),
            IncidentStatus::Aggregated => Some(Stage::Aggregation),
            IncidentStatus::Allocating => Some(Stage::Allocation),
            IncidentStatus::Validating => Some(Stage::Validation),
            IncidentStatus::Notifying => Some(Stage::Notification),
            _ => None,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IncidentStatus::Created => "created",
            IncidentStatus::Analyzing => "analyzing",
            IncidentStatus::Aggregated => "aggregated",
            IncidentStatus::Allocating => "allocating",
            IncidentStatus::Validating => "validating",
            IncidentStatus::Notifying => "notifying",
            IncidentStatus::Monitoring => "monitoring",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entry of the incident's status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: IncidentStatus,
    pub to: IncidentStatus,
    pub at: DateTime<Utc>,
    pub cycle: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Pipeline stage that produced a cycle-fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Aggregation,
    Allocation,
    Validation,
    Commit,
    Notification,
    /// The cycle stopped without recording an outcome.
    Interrupted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Analysis => "analysis",
            Stage::Aggregation => "aggregation",
            Stage::Allocation => "allocation",
            Stage::Validation => "validation",
            Stage::Commit => "commit",
            Stage::Notification => "notification",
            Stage::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Structured cause recorded when a cycle ends in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub stage: Stage,
    pub message: String,
    pub cycle: u64,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Analysis tasks and findings
// ---------------------------------------------------------------------------

/// Capability family of a provider; drives per-field precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    SosExtraction,
    Weather,
    Imagery,
    /// Generic inference (e.g. a language model guess); lowest precedence.
    Inference,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::SosExtraction => write!(f, "sos_extraction"),
            ProviderKind::Weather => write!(f, "weather"),
            ProviderKind::Imagery => write!(f, "imagery"),
            ProviderKind::Inference => write!(f, "inference"),
        }
    }
}

/// Typed partial result produced by one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub affected_area_km2: Option<f64>,
    #[serde(default)]
    pub people_at_risk: Option<u32>,
    #[serde(default)]
    pub hazards: BTreeSet<String>,
    /// Provider-specific detail, carried through to provenance untouched.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Finding {
    pub fn with_severity(severity: Severity) -> Self {
        Self {
            severity: Some(severity),
            ..Default::default()
        }
    }

    pub fn hazard(mut self, tag: impl Into<String>) -> Self {
        self.hazards.insert(tag.into());
        self
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Panicked,
}

/// Error payload stored on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one analysis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    Pending,
    Success { finding: Finding },
    Failed { error: ErrorDescriptor },
    TimedOut,
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    pub fn finding(&self) -> Option<&Finding> {
        match self {
            TaskOutcome::Success { finding } => Some(finding),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Pending => "pending",
            TaskOutcome::Success { .. } => "success",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::TimedOut => "timed_out",
        }
    }
}

/// One scheduled invocation of one provider for one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub provider: ProviderId,
    pub kind: ProviderKind,
    pub incident_id: IncidentId,
    pub attempts: u32,
    pub deadline: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: TaskOutcome,
}

impl AnalysisTask {
    pub fn pending(
        provider: ProviderId,
        kind: ProviderKind,
        incident_id: IncidentId,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            provider,
            kind,
            incident_id,
            attempts: 0,
            deadline,
            elapsed_ms: 0,
            outcome: TaskOutcome::Pending,
        }
    }
}

/// Latest recorded outcome of a provider on an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub cycle: u64,
    pub task: AnalysisTask,
}

// ---------------------------------------------------------------------------
// Unified report
// ---------------------------------------------------------------------------

/// Report fields subject to precedence and conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportField {
    Severity,
    AffectedArea,
    PeopleAtRisk,
}

impl fmt::Display for ReportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportField::Severity => write!(f, "severity"),
            ReportField::AffectedArea => write!(f, "affected_area"),
            ReportField::PeopleAtRisk => write!(f, "people_at_risk"),
        }
    }
}

/// A value contributed to a report field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Severity(Severity),
    AreaKm2(f64),
    People(u32),
}

/// Which provider supplied the chosen value of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: ProviderId,
    pub value: FieldValue,
}

/// How a conflicting field was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// Equal-precedence disagreement beyond tolerance; the most severe value wins.
    MostConservative,
}

/// A field on which equal-precedence providers disagreed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: ReportField,
    pub candidates: Vec<Provenance>,
    pub chosen: Provenance,
    pub rule: ResolutionRule,
}

/// The merged, conflict-resolved view of one analysis cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedReport {
    pub incident_id: IncidentId,
    pub cycle: u64,
    pub category: Category,
    pub location: Location,
    pub severity: Severity,
    pub affected_area_km2: Option<f64>,
    pub people_at_risk: Option<u32>,
    pub hazards: BTreeSet<String>,
    pub provenance: BTreeMap<ReportField, Provenance>,
    pub conflicts: Vec<Conflict>,
    pub contributors: Vec<ProviderId>,
    pub missing: Vec<ProviderId>,
    pub provider_attributes: BTreeMap<ProviderId, BTreeMap<String, serde_json::Value>>,
}

impl UnifiedReport {
    pub fn has_hazard(&self, tag: &str) -> bool {
        self.hazards.contains(tag)
    }

    pub fn conflict_on(&self, field: ReportField) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.field == field)
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Deployable resource families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    FireEngine,
    Ambulance,
    SearchAndRescue,
    Helicopter,
    Boat,
    SupplyTruck,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::FireEngine => "fire_engine",
            ResourceType::Ambulance => "ambulance",
            ResourceType::SearchAndRescue => "search_and_rescue",
            ResourceType::Helicopter => "helicopter",
            ResourceType::Boat => "boat",
            ResourceType::SupplyTruck => "supply_truck",
        };
        f.write_str(s)
    }
}

/// One (resource, quantity, destination) line of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub resource_type: ResourceType,
    pub quantity: u32,
    pub source_depot: String,
    pub destination: Location,
    pub distance_km: f64,
    /// Surplus beyond the minimum required set.
    #[serde(default)]
    pub optional: bool,
}

/// Deployment plan computed from a report and an inventory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub incident_id: IncidentId,
    pub cycle: u64,
    pub inventory_version: u64,
    pub assignments: Vec<Assignment>,
    pub required: BTreeMap<ResourceType, u32>,
    pub shortfall: BTreeMap<ResourceType, u32>,
    pub partial: bool,
}

impl AllocationPlan {
    /// Total units of a type across all assignments.
    pub fn quantity_of(&self, resource_type: ResourceType) -> u32 {
        self.assignments
            .iter()
            .filter(|a| a.resource_type == resource_type)
            .map(|a| a.quantity)
            .sum()
    }

    pub fn total_required(&self) -> u32 {
        self.required.values().sum()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// The fixed, ordered validation gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    InventoryAvailability,
    RouteAccessibility,
    ResponderReadiness,
    SafetyProtocol,
}

impl GateKind {
    /// Evaluation order of the gate chain.
    pub const SEQUENCE: [GateKind; 4] = [
        GateKind::InventoryAvailability,
        GateKind::RouteAccessibility,
        GateKind::ResponderReadiness,
        GateKind::SafetyProtocol,
    ];
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateKind::InventoryAvailability => "inventory_availability",
            GateKind::RouteAccessibility => "route_accessibility",
            GateKind::ResponderReadiness => "responder_readiness",
            GateKind::SafetyProtocol => "safety_protocol",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Who a channel speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceKind {
    Public,
    Responders,
    Authorities,
}

impl fmt::Display for AudienceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudienceKind::Public => write!(f, "public"),
            AudienceKind::Responders => write!(f, "responders"),
            AudienceKind::Authorities => write!(f, "authorities"),
        }
    }
}

/// Aggregate delivery status across channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Full,
    Partial,
    None,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Full => write!(f, "full"),
            DeliveryStatus::Partial => write!(f, "partial"),
            DeliveryStatus::None => write!(f, "none"),
        }
    }
}

/// Result of delivering to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub channel: String,
    pub audience: AudienceKind,
    pub attempts: u32,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the dispatcher did for one approved plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub cycle: u64,
    pub status: DeliveryStatus,
    pub deliveries: Vec<ChannelDelivery>,
    pub dispatched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Incident
// ---------------------------------------------------------------------------

/// Inbound report that creates an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub category: Category,
    pub location: Location,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub signals: Vec<SosMessage>,
}

/// Read-only view of an incident handed to analysis providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSnapshot {
    pub id: IncidentId,
    pub category: Category,
    pub location: Location,
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub signals: Vec<SosMessage>,
    pub cycle: u64,
}

/// The unit of work: one reported disaster event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub category: Category,
    pub location: Location,
    #[serde(default)]
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub created_at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub transitions: Vec<StatusTransition>,
    pub provider_results: BTreeMap<ProviderId, Option<ProviderRecord>>,
    pub report: Option<UnifiedReport>,
    pub plan: Option<AllocationPlan>,
    pub notification: Option<NotificationRecord>,
    #[serde(default)]
    pub failure: Option<FailureCause>,
    #[serde(default)]
    pub signals: Vec<SosMessage>,
    /// Number of orchestration cycles started.
    #[serde(default)]
    pub cycle: u64,
    /// Store version, bumped on every successful write.
    #[serde(default)]
    pub version: u64,
}

impl Incident {
    /// Create a new incident from an inbound report.
    pub fn from_report(report: IncidentReport) -> Self {
        Self {
            id: IncidentId::generate(),
            category: report.category,
            location: report.location,
            description: report.description,
            severity: None,
            created_at: Utc::now(),
            status: IncidentStatus::Created,
            transitions: Vec::new(),
            provider_results: BTreeMap::new(),
            report: None,
            plan: None,
            notification: None,
            failure: None,
            signals: report.signals,
            cycle: 0,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move along the transition graph, appending to the status log.
    pub fn transition(
        &mut self,
        to: IncidentStatus,
        note: Option<String>,
    ) -> Result<(), OrchestrationError> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.transitions.push(StatusTransition {
            from: self.status,
            to,
            at: Utc::now(),
            cycle: self.cycle,
            note,
        });
        self.status = to;
        Ok(())
    }

    /// Record a cycle-fatal error and move to `failed`.
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) -> Result<(), OrchestrationError> {
        let message = message.into();
        self.transition(IncidentStatus::Failed, Some(format!("{stage}: {message}")))?;
        self.failure = Some(FailureCause {
            stage,
            message,
            cycle: self.cycle,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Make sure every provider has an entry, `None` until it reports.
    pub fn register_providers<'a>(&mut self, providers: impl IntoIterator<Item = &'a ProviderId>) {
        for provider in providers {
            self.provider_results.entry(provider.clone()).or_insert(None);
        }
    }

    /// Record a terminal task outcome for its provider.
    ///
    /// An existing record is replaced only by a strictly newer one: a later
    /// cycle, or the same cycle with more attempts. Pending tasks are never
    /// recorded. Returns whether the record was stored.
    pub fn record_provider_result(&mut self, cycle: u64, task: AnalysisTask) -> bool {
        if !task.outcome.is_terminal() {
            self.provider_results.entry(task.provider.clone()).or_insert(None);
            return false;
        }
        let slot = self.provider_results.entry(task.provider.clone()).or_insert(None);
        let newer = match slot {
            None => true,
            Some(existing) => (cycle, task.attempts) > (existing.cycle, existing.task.attempts),
        };
        if newer {
            *slot = Some(ProviderRecord { cycle, task });
        }
        newer
    }

    /// Immutable view for providers, taken at the start of analysis.
    pub fn snapshot(&self) -> IncidentSnapshot {
        IncidentSnapshot {
            id: self.id.clone(),
            category: self.category,
            location: self.location,
            description: self.description.clone(),
            severity: self.severity,
            signals: self.signals.clone(),
            cycle: self.cycle,
        }
    }
}
