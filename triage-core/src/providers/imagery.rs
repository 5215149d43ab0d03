//! Satellite and terrain assessment provider.
//!
//! Active fire detections drive fire severity and burnt-area estimates;
//! the terrain profile drives flood and surge exposure.

use super::{AnalysisContext, AnalysisProvider, unless_cancelled};
use crate::error::{ProviderError, SourceError};
use crate::types::{Category, Finding, IncidentSnapshot, Location, ProviderId, ProviderKind, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// Footprint of one active-fire detection pixel.
const DETECTION_AREA_KM2: f64 = 0.14;
const LOW_ELEVATION_M: f64 = 10.0;
const STEEP_SLOPE_DEG: f64 = 30.0;

/// One thermal anomaly from a fire detection product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireDetection {
    pub latitude: f64,
    pub longitude: f64,
    /// Brightness temperature in kelvin.
    pub brightness: f64,
    pub confidence: String,
}

impl FireDetection {
    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainProfile {
    pub elevation_m: f64,
    pub slope_deg: f64,
    pub flood_risk: Severity,
    pub land_cover: String,
}

#[async_trait]
pub trait ImagerySource: Send + Sync {
    async fn fire_detections(
        &self,
        center: Location,
        radius_km: f64,
    ) -> Result<Vec<FireDetection>, SourceError>;

    async fn terrain(&self, location: Location) -> Result<TerrainProfile, SourceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageryConfig {
    pub radius_km: f64,
    pub max_detections: usize,
}

impl Default for ImageryConfig {
    fn default() -> Self {
        Self {
            radius_km: 50.0,
            max_detections: 10,
        }
    }
}

pub struct ImageryProvider {
    source: Arc<dyn ImagerySource>,
    config: ImageryConfig,
}

impl ImageryProvider {
    pub const ID: &'static str = "imagery";

    pub fn new(source: Arc<dyn ImagerySource>, config: ImageryConfig) -> Self {
        Self { source, config }
    }

    /// Nearest detections within the radius, closest first.
    fn nearest(&self, center: Location, detections: Vec<FireDetection>) -> Vec<FireDetection> {
        let mut ranked: Vec<(f64, FireDetection)> = detections
            .into_iter()
            .map(|d| (center.distance_km(&d.location()), d))
            .filter(|(dist, _)| *dist <= self.config.radius_km)
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked
            .into_iter()
            .take(self.config.max_detections)
            .map(|(_, d)| d)
            .collect()
    }
}

fn fire_severity(detections: &[FireDetection]) -> Severity {
    let peak = detections
        .iter()
        .map(|d| d.brightness)
        .fold(0.0_f64, f64::max);
    match detections.len() {
        0 => Severity::Low,
        n if n >= 8 || peak >= 400.0 => Severity::Critical,
        n if n >= 4 || peak >= 360.0 => Severity::High,
        _ => Severity::Medium,
    }
}

/// Combine detections and terrain into a finding for `category`.
pub fn assess(category: Category, detections: &[FireDetection], terrain: &TerrainProfile) -> Finding {
    let low_lying = terrain.elevation_m < LOW_ELEVATION_M;
    let severity = match category {
        Category::Fire => fire_severity(detections),
        Category::Flood if low_lying => terrain.flood_risk.raised(),
        Category::Flood | Category::Storm => terrain.flood_risk,
        Category::Seismic if terrain.slope_deg >= STEEP_SLOPE_DEG => Severity::Medium,
        Category::Seismic | Category::Other => Severity::Low,
    };

    let mut finding = Finding::with_severity(severity);
    if !detections.is_empty() {
        finding.affected_area_km2 = Some(detections.len() as f64 * DETECTION_AREA_KM2);
        finding = finding.hazard("active_fire");
    }
    if category == Category::Flood && severity >= Severity::High {
        finding = finding.hazard("flooding");
    }
    if category == Category::Storm && low_lying && terrain.flood_risk >= Severity::High {
        finding = finding.hazard("storm_surge");
    }
    if terrain.slope_deg >= STEEP_SLOPE_DEG {
        finding = finding.hazard("steep_terrain");
    }

    let attrs = &mut finding.attributes;
    attrs.insert("detections".into(), detections.len().into());
    attrs.insert("elevation_m".into(), terrain.elevation_m.into());
    attrs.insert("slope_deg".into(), terrain.slope_deg.into());
    attrs.insert("land_cover".into(), terrain.land_cover.clone().into());
    finding
}

#[async_trait]
impl AnalysisProvider for ImageryProvider {
    fn id(&self) -> ProviderId {
        ProviderId::from(Self::ID)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Imagery
    }

    async fn analyze(
        &self,
        snapshot: &IncidentSnapshot,
        ctx: &AnalysisContext,
        _deadline: Instant,
    ) -> Result<Finding, ProviderError> {
        let detections = if snapshot.category == Category::Fire {
            let raw = unless_cancelled(ctx, Self::ID, async {
                self.source
                    .fire_detections(snapshot.location, self.config.radius_km)
                    .await
                    .map_err(|e| e.into_provider_error(Self::ID))
            })
            .await?;
            self.nearest(snapshot.location, raw)
        } else {
            Vec::new()
        };
        let terrain = unless_cancelled(ctx, Self::ID, async {
            self.source
                .terrain(snapshot.location)
                .await
                .map_err(|e| e.into_provider_error(Self::ID))
        })
        .await?;
        Ok(assess(snapshot.category, &detections, &terrain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terrain(elevation: f64, slope: f64, flood_risk: Severity) -> TerrainProfile {
        TerrainProfile {
            elevation_m: elevation,
            slope_deg: slope,
            flood_risk,
            land_cover: "shrubland".into(),
        }
    }

    fn detection(lat: f64, lon: f64, brightness: f64) -> FireDetection {
        FireDetection {
            latitude: lat,
            longitude: lon,
            brightness,
            confidence: "h".into(),
        }
    }

    #[test]
    fn test_fire_severity_from_detections() {
        let few = vec![detection(34.05, -118.24, 330.0); 2];
        let finding = assess(Category::Fire, &few, &terrain(200.0, 5.0, Severity::Low));
        assert_eq!(finding.severity, Some(Severity::Medium));
        assert!((finding.affected_area_km2.unwrap() - 0.28).abs() < 1e-9);
        assert!(finding.hazards.contains("active_fire"));

        let hot = vec![detection(34.05, -118.24, 410.0)];
        let finding = assess(Category::Fire, &hot, &terrain(200.0, 5.0, Severity::Low));
        assert_eq!(finding.severity, Some(Severity::Critical));
    }

    #[test]
    fn test_low_elevation_raises_flood_severity() {
        let finding = assess(Category::Flood, &[], &terrain(4.0, 1.0, Severity::Medium));
        assert_eq!(finding.severity, Some(Severity::High));
        assert!(finding.hazards.contains("flooding"));
    }

    #[test]
    fn test_storm_surge_and_steep_terrain() {
        let finding = assess(Category::Storm, &[], &terrain(2.0, 35.0, Severity::High));
        assert!(finding.hazards.contains("storm_surge"));
        assert!(finding.hazards.contains("steep_terrain"));
    }

    #[test]
    fn test_nearest_detections_are_capped() {
        struct Unused;
        #[async_trait]
        impl ImagerySource for Unused {
            async fn fire_detections(
                &self,
                _center: Location,
                _radius_km: f64,
            ) -> Result<Vec<FireDetection>, SourceError> {
                Ok(Vec::new())
            }
            async fn terrain(&self, _location: Location) -> Result<TerrainProfile, SourceError> {
                Err(SourceError::Rejected("unused".into()))
            }
        }

        let provider = ImageryProvider::new(
            Arc::new(Unused),
            ImageryConfig {
                radius_km: 50.0,
                max_detections: 3,
            },
        );
        let center = Location::new(34.0, -118.0);
        let mut detections: Vec<FireDetection> = (1..=5)
            .map(|i| detection(34.0 + i as f64 * 0.01, -118.0, 320.0))
            .collect();
        detections.push(detection(40.0, -100.0, 500.0));
        let nearest = provider.nearest(center, detections);
        assert_eq!(nearest.len(), 3);
        assert!((nearest[0].latitude - 34.01).abs() < 1e-9);
    }
}
