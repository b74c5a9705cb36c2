use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::print_job::PrintJobError;

/// Longest exposure a job may ask for, in seconds.
pub const MAX_EXPOSURE_SECS: f64 = 3600.0;

fn exposure_duration(secs: f64) -> Duration {
    // NaN and negatives are rejected by `validate`; never panic on them here.
    Duration::try_from_secs_f64(secs.min(MAX_EXPOSURE_SECS)).unwrap_or(Duration::ZERO)
}

/// How the leveling blade crosses the vat between exposures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BladeMode {
    /// Every pass goes to the far end and back before the exposure.
    #[default]
    Roundtrip,
    /// The blade stays at the far end during the exposure and returns after the lift.
    Oneway,
}

impl fmt::Display for BladeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BladeMode::Roundtrip => write!(f, "roundtrip"),
            BladeMode::Oneway => write!(f, "oneway"),
        }
    }
}

impl FromStr for BladeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roundtrip" | "round-trip" => Ok(BladeMode::Roundtrip),
            "oneway" | "one-way" => Ok(BladeMode::Oneway),
            other => Err(format!("unknown blade mode '{}'", other)),
        }
    }
}

/// Timing and motion parameters of one print job.
///
/// Speeds are feed rates in mm/min, heights in mm, times in seconds.
/// `led_power` and `blade_speed` are taken as-is here; the ports clamp them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PrintParameters {
    pub total_layers: usize,
    pub layer_height: f64,
    pub estimated_print_time: f64,
    pub bottom_layer_count: usize,
    pub bottom_exposure_time: f64,
    pub bottom_lift_height: f64,
    pub bottom_lift_speed: f64,
    pub normal_exposure_time: f64,
    pub normal_lift_height: f64,
    pub normal_lift_speed: f64,
    pub drop_speed: f64,
    pub blade_speed: f64,
    pub led_power: u16,
    pub leveling_cycles: u32,
    pub blade_cycles_per_layer: u32,
    pub blade_mode: BladeMode,
    pub resolution_x: u32,
    pub resolution_y: u32,
}

impl Default for PrintParameters {
    fn default() -> Self {
        Self {
            total_layers: 0,
            layer_height: 0.05,
            estimated_print_time: 0.0,
            bottom_layer_count: 8,
            bottom_exposure_time: 50.0,
            bottom_lift_height: 5.0,
            bottom_lift_speed: 65.0,
            normal_exposure_time: 6.0,
            normal_lift_height: 5.0,
            normal_lift_speed: 65.0,
            drop_speed: 150.0,
            blade_speed: 1500.0,
            led_power: 440,
            leveling_cycles: 1,
            blade_cycles_per_layer: 1,
            blade_mode: BladeMode::Roundtrip,
            resolution_x: 1440,
            resolution_y: 2560,
        }
    }
}

/// Exposure and lift settings for a single layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerProfile {
    pub bottom: bool,
    pub exposure: Duration,
    pub lift_height: f64,
    pub lift_speed: f64,
}

impl PrintParameters {
    /// Bottom layers are the first `bottom_layer_count` indices.
    pub fn is_bottom_layer(&self, index: usize) -> bool {
        index < self.bottom_layer_count
    }

    pub fn layer_profile(&self, index: usize) -> LayerProfile {
        if self.is_bottom_layer(index) {
            LayerProfile {
                bottom: true,
                exposure: exposure_duration(self.bottom_exposure_time),
                lift_height: self.bottom_lift_height,
                lift_speed: self.bottom_lift_speed,
            }
        } else {
            LayerProfile {
                bottom: false,
                exposure: exposure_duration(self.normal_exposure_time),
                lift_height: self.normal_lift_height,
                lift_speed: self.normal_lift_speed,
            }
        }
    }

    /// Build plate height at which layer `index` is exposed.
    pub fn layer_z(&self, index: usize) -> f64 {
        (index + 1) as f64 * self.layer_height
    }

    pub fn is_last_layer(&self, index: usize) -> bool {
        index + 1 >= self.total_layers
    }

    /// Returns a copy with every override that is set applied on top.
    pub fn with_overrides(&self, overrides: &ParameterOverrides) -> Self {
        let mut params = self.clone();
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = overrides.$field {
                    params.$field = value;
                })*
            };
        }
        apply!(
            total_layers,
            layer_height,
            bottom_layer_count,
            bottom_exposure_time,
            bottom_lift_height,
            bottom_lift_speed,
            normal_exposure_time,
            normal_lift_height,
            normal_lift_speed,
            drop_speed,
            blade_speed,
            led_power,
            leveling_cycles,
            blade_cycles_per_layer,
            blade_mode,
        );
        params
    }

    /// Rejects non-finite values, negative heights and times, zero feed
    /// rates and layer height, and exposures above [`MAX_EXPOSURE_SECS`].
    pub fn validate(&self) -> Result<(), PrintJobError> {
        let invalid = |name: &str, value: f64| PrintJobError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        };

        let positive = [
            ("layer_height", self.layer_height),
            ("bottom_lift_speed", self.bottom_lift_speed),
            ("normal_lift_speed", self.normal_lift_speed),
            ("drop_speed", self.drop_speed),
            ("blade_speed", self.blade_speed),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(name, value));
            }
        }

        let non_negative = [
            ("bottom_lift_height", self.bottom_lift_height),
            ("normal_lift_height", self.normal_lift_height),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(name, value));
            }
        }

        let exposures = [
            ("bottom_exposure_time", self.bottom_exposure_time),
            ("normal_exposure_time", self.normal_exposure_time),
        ];
        for (name, value) in exposures {
            if !value.is_finite() || !(0.0..=MAX_EXPOSURE_SECS).contains(&value) {
                return Err(invalid(name, value));
            }
        }
        Ok(())
    }
}

/// Caller-supplied values that win over what the job manifest says.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParameterOverrides {
    pub total_layers: Option<usize>,
    pub layer_height: Option<f64>,
    pub bottom_layer_count: Option<usize>,
    pub bottom_exposure_time: Option<f64>,
    pub bottom_lift_height: Option<f64>,
    pub bottom_lift_speed: Option<f64>,
    pub normal_exposure_time: Option<f64>,
    pub normal_lift_height: Option<f64>,
    pub normal_lift_speed: Option<f64>,
    pub drop_speed: Option<f64>,
    pub blade_speed: Option<f64>,
    pub led_power: Option<u16>,
    pub leveling_cycles: Option<u32>,
    pub blade_cycles_per_layer: Option<u32>,
    pub blade_mode: Option<BladeMode>,
}

impl ParameterOverrides {
    /// Layers `other` on top of `self`; fields set in `other` win.
    pub fn merged_with(&self, other: &ParameterOverrides) -> Self {
        Self {
            total_layers: other.total_layers.or(self.total_layers),
            layer_height: other.layer_height.or(self.layer_height),
            bottom_layer_count: other.bottom_layer_count.or(self.bottom_layer_count),
            bottom_exposure_time: other.bottom_exposure_time.or(self.bottom_exposure_time),
            bottom_lift_height: other.bottom_lift_height.or(self.bottom_lift_height),
            bottom_lift_speed: other.bottom_lift_speed.or(self.bottom_lift_speed),
            normal_exposure_time: other.normal_exposure_time.or(self.normal_exposure_time),
            normal_lift_height: other.normal_lift_height.or(self.normal_lift_height),
            normal_lift_speed: other.normal_lift_speed.or(self.normal_lift_speed),
            drop_speed: other.drop_speed.or(self.drop_speed),
            blade_speed: other.blade_speed.or(self.blade_speed),
            led_power: other.led_power.or(self.led_power),
            leveling_cycles: other.leveling_cycles.or(self.leveling_cycles),
            blade_cycles_per_layer: other.blade_cycles_per_layer.or(self.blade_cycles_per_layer),
            blade_mode: other.blade_mode.or(self.blade_mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_profile_selection() {
        let params = PrintParameters {
            bottom_layer_count: 2,
            bottom_exposure_time: 5.0,
            normal_exposure_time: 2.0,
            bottom_lift_height: 6.0,
            normal_lift_height: 4.0,
            ..PrintParameters::default()
        };
        let bottom = params.layer_profile(1);
        assert!(bottom.bottom);
        assert_eq!(bottom.exposure, Duration::from_secs(5));
        assert_eq!(bottom.lift_height, 6.0);

        let normal = params.layer_profile(2);
        assert!(!normal.bottom);
        assert_eq!(normal.exposure, Duration::from_secs(2));
        assert_eq!(normal.lift_height, 4.0);
    }

    #[test]
    fn test_layer_z() {
        let params = PrintParameters { layer_height: 0.05, ..PrintParameters::default() };
        assert!((params.layer_z(0) - 0.05).abs() < 1e-9);
        assert!((params.layer_z(9) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_overrides_only_touch_set_fields() {
        let base = PrintParameters::default();
        let overrides = ParameterOverrides {
            led_power: Some(600),
            blade_mode: Some(BladeMode::Oneway),
            ..ParameterOverrides::default()
        };
        let params = base.with_overrides(&overrides);
        assert_eq!(params.led_power, 600);
        assert_eq!(params.blade_mode, BladeMode::Oneway);
        assert_eq!(params.layer_height, base.layer_height);
        assert_eq!(params.blade_speed, base.blade_speed);
    }

    #[test]
    fn test_merged_overrides_prefer_newer() {
        let defaults = ParameterOverrides {
            blade_speed: Some(1800.0),
            leveling_cycles: Some(2),
            ..ParameterOverrides::default()
        };
        let cli = ParameterOverrides { leveling_cycles: Some(0), ..ParameterOverrides::default() };
        let merged = defaults.merged_with(&cli);
        assert_eq!(merged.blade_speed, Some(1800.0));
        assert_eq!(merged.leveling_cycles, Some(0));
    }

    #[test]
    fn test_validate_rejects_negative_values() {
        let params = PrintParameters { normal_exposure_time: -1.0, ..PrintParameters::default() };
        let err = params.validate().unwrap_err();
        assert!(matches!(err, PrintJobError::InvalidParameter { ref name, .. } if name == "normal_exposure_time"));

        let params = PrintParameters { drop_speed: f64::NAN, ..PrintParameters::default() };
        assert!(params.validate().is_err());
        assert!(PrintParameters::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_feed_rates() {
        for params in [
            PrintParameters { drop_speed: 0.0, ..PrintParameters::default() },
            PrintParameters { blade_speed: 0.0, ..PrintParameters::default() },
            PrintParameters { bottom_lift_speed: 0.0, ..PrintParameters::default() },
            PrintParameters { normal_lift_speed: 0.0, ..PrintParameters::default() },
            PrintParameters { layer_height: 0.0, ..PrintParameters::default() },
        ] {
            assert!(matches!(params.validate(), Err(PrintJobError::InvalidParameter { .. })));
        }
        // Zero lift height is a valid (if unusual) setting
        let params = PrintParameters { normal_lift_height: 0.0, ..PrintParameters::default() };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_exposure_time() {
        let params = PrintParameters { bottom_exposure_time: 1e20, ..PrintParameters::default() };
        let err = params.validate().unwrap_err();
        assert!(matches!(err, PrintJobError::InvalidParameter { ref name, .. } if name == "bottom_exposure_time"));

        let params = PrintParameters { normal_exposure_time: MAX_EXPOSURE_SECS, ..PrintParameters::default() };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_layer_profile_never_panics_on_unvalidated_times() {
        let params = PrintParameters {
            bottom_layer_count: 1,
            bottom_exposure_time: 1e20,
            normal_exposure_time: f64::NAN,
            ..PrintParameters::default()
        };
        assert_eq!(params.layer_profile(0).exposure, Duration::from_secs(3600));
        assert_eq!(params.layer_profile(1).exposure, Duration::from_secs(3600));
        let params = PrintParameters { normal_exposure_time: -2.0, bottom_layer_count: 0, ..PrintParameters::default() };
        assert_eq!(params.layer_profile(0).exposure, Duration::ZERO);
    }

    #[test]
    fn test_blade_mode_parsing() {
        assert_eq!("oneway".parse::<BladeMode>().unwrap(), BladeMode::Oneway);
        assert_eq!("RoundTrip".parse::<BladeMode>().unwrap(), BladeMode::Roundtrip);
        assert!("sideways".parse::<BladeMode>().is_err());

        let overrides: ParameterOverrides = toml::from_str("blade_mode = \"oneway\"\nled_power = 500").unwrap();
        assert_eq!(overrides.blade_mode, Some(BladeMode::Oneway));
        assert_eq!(overrides.led_power, Some(500));
    }
}
