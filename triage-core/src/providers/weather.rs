//! Weather assessment provider.

use super::{AnalysisContext, AnalysisProvider, unless_cancelled};
use crate::error::{ProviderError, SourceError};
use crate::types::{Category, Finding, IncidentSnapshot, Location, ProviderId, ProviderKind, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

const FIRE_HEAT_C: f64 = 35.0;
const FIRE_HUMIDITY_PCT: f64 = 20.0;
const FIRE_WIND_MS: f64 = 10.0;
const HIGH_WIND_MS: f64 = 15.0;
const LOW_VISIBILITY_M: f64 = 1000.0;

/// Current conditions at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub temperature_c: f64,
    /// Free-text summary, e.g. `light rain`, `thunderstorm`.
    pub conditions: String,
    pub wind_speed_ms: f64,
    pub humidity_pct: f64,
    pub visibility_m: f64,
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current(&self, location: Location) -> Result<WeatherObservation, SourceError>;
}

pub struct WeatherProvider {
    source: Arc<dyn WeatherSource>,
}

impl WeatherProvider {
    pub const ID: &'static str = "weather";

    pub fn new(source: Arc<dyn WeatherSource>) -> Self {
        Self { source }
    }
}

/// Rule-based reading of an observation for one incident category.
pub fn assess(category: Category, obs: &WeatherObservation) -> Finding {
    let conditions = obs.conditions.to_lowercase();
    let severity = match category {
        Category::Fire => {
            let met = [
                obs.temperature_c >= FIRE_HEAT_C,
                obs.humidity_pct <= FIRE_HUMIDITY_PCT,
                obs.wind_speed_ms >= FIRE_WIND_MS,
            ]
            .into_iter()
            .filter(|c| *c)
            .count();
            match met {
                3 => Severity::Critical,
                2 => Severity::High,
                1 => Severity::Medium,
                _ => Severity::Low,
            }
        }
        Category::Storm => {
            if obs.wind_speed_ms >= 25.0 {
                Severity::Critical
            } else if obs.wind_speed_ms >= 17.0 {
                Severity::High
            } else if obs.wind_speed_ms >= 10.0 {
                Severity::Medium
            } else {
                Severity::Low
            }
        }
        Category::Flood => {
            if conditions.contains("thunderstorm") {
                Severity::Critical
            } else if conditions.contains("rain") && obs.humidity_pct >= 90.0 {
                Severity::High
            } else if conditions.contains("rain") {
                Severity::Medium
            } else {
                Severity::Low
            }
        }
        Category::Seismic | Category::Other => Severity::Low,
    };

    let mut finding = Finding::with_severity(severity);
    if obs.wind_speed_ms >= HIGH_WIND_MS {
        finding = finding.hazard("high_wind");
    }
    if obs.visibility_m < LOW_VISIBILITY_M {
        finding = finding.hazard("low_visibility");
    }
    let attrs = &mut finding.attributes;
    attrs.insert("temperature_c".into(), obs.temperature_c.into());
    attrs.insert("conditions".into(), obs.conditions.clone().into());
    attrs.insert("wind_speed_ms".into(), obs.wind_speed_ms.into());
    attrs.insert("humidity_pct".into(), obs.humidity_pct.into());
    attrs.insert("visibility_m".into(), obs.visibility_m.into());
    finding
}

#[async_trait]
impl AnalysisProvider for WeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::from(Self::ID)
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Weather
    }

    async fn analyze(
        &self,
        snapshot: &IncidentSnapshot,
        ctx: &AnalysisContext,
        _deadline: Instant,
    ) -> Result<Finding, ProviderError> {
        let obs = unless_cancelled(ctx, Self::ID, async {
            self.source
                .current(snapshot.location)
                .await
                .map_err(|e| e.into_provider_error(Self::ID))
        })
        .await?;
        Ok(assess(snapshot.category, &obs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(temp: f64, conditions: &str, wind: f64, humidity: f64) -> WeatherObservation {
        WeatherObservation {
            temperature_c: temp,
            conditions: conditions.into(),
            wind_speed_ms: wind,
            humidity_pct: humidity,
            visibility_m: 10_000.0,
        }
    }

    #[test]
    fn test_fire_weather_counts_conditions() {
        let hot_dry_windy = obs(38.0, "clear", 12.0, 10.0);
        assert_eq!(
            assess(Category::Fire, &hot_dry_windy).severity,
            Some(Severity::Critical)
        );
        let hot_dry = obs(38.0, "clear", 3.0, 15.0);
        assert_eq!(assess(Category::Fire, &hot_dry).severity, Some(Severity::High));
        let mild = obs(22.0, "clear", 3.0, 50.0);
        assert_eq!(assess(Category::Fire, &mild).severity, Some(Severity::Low));
    }

    #[test]
    fn test_flood_conditions() {
        assert_eq!(
            assess(Category::Flood, &obs(20.0, "Thunderstorm", 5.0, 80.0)).severity,
            Some(Severity::Critical)
        );
        assert_eq!(
            assess(Category::Flood, &obs(20.0, "heavy rain", 5.0, 95.0)).severity,
            Some(Severity::High)
        );
        assert_eq!(
            assess(Category::Flood, &obs(20.0, "light rain", 5.0, 60.0)).severity,
            Some(Severity::Medium)
        );
    }

    #[test]
    fn test_storm_wind_and_hazards() {
        let mut o = obs(20.0, "overcast", 18.0, 70.0);
        o.visibility_m = 400.0;
        let finding = assess(Category::Storm, &o);
        assert_eq!(finding.severity, Some(Severity::High));
        assert!(finding.hazards.contains("high_wind"));
        assert!(finding.hazards.contains("low_visibility"));
        assert_eq!(finding.attributes["wind_speed_ms"], 18.0);
    }

    #[test]
    fn test_seismic_is_low() {
        let finding = assess(Category::Seismic, &obs(20.0, "clear", 2.0, 40.0));
        assert_eq!(finding.severity, Some(Severity::Low));
        assert!(finding.hazards.is_empty());
    }
}
