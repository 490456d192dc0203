//! Glucose unit policy and conversion.
//!
//! All internal calculations use mg/dL; values are converted to the
//! configured unit only at formatting boundaries. The unit is resolved
//! once at startup from configuration and carried explicitly — there is
//! no process-global mutable setting.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Conversion factor between mmol/L and mg/dL.
pub const MMOL_TO_MGDL: f64 = 18.0182;

/// Clinical thresholds, expressed in a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseThresholds {
    pub target_low: f64,
    pub target_high: f64,
    pub severe_hyper: f64,
}

/// Thresholds in mg/dL.
pub const THRESHOLDS_MGDL: GlucoseThresholds = GlucoseThresholds {
    target_low: 70.0,
    target_high: 180.0,
    severe_hyper: 250.0,
};

/// Thresholds in mmol/L.
pub const THRESHOLDS_MMOL: GlucoseThresholds = GlucoseThresholds {
    target_low: 3.9,
    target_high: 10.0,
    severe_hyper: 13.9,
};

/// Display unit for glucose values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlucoseUnit {
    #[serde(rename = "mmol/L")]
    MmolL,
    #[serde(rename = "mg/dL")]
    MgDl,
}

impl std::fmt::Display for GlucoseUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MmolL => write!(f, "mmol/L"),
            Self::MgDl => write!(f, "mg/dL"),
        }
    }
}

impl FromStr for GlucoseUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mmol/L" => Ok(Self::MmolL),
            "mg/dL" => Ok(Self::MgDl),
            other => Err(Error::config(format!(
                "Invalid glucose unit: {other}. Must be 'mmol/L' or 'mg/dL'"
            ))),
        }
    }
}

impl GlucoseUnit {
    /// Resolve the unit from the `GLUCOSE_UNIT` environment variable,
    /// defaulting to mmol/L when unset. Invalid values are fatal.
    pub fn from_env() -> Result<Self> {
        match std::env::var("GLUCOSE_UNIT") {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::MmolL),
        }
    }

    /// Thresholds in this unit.
    pub fn thresholds(&self) -> &'static GlucoseThresholds {
        match self {
            Self::MmolL => &THRESHOLDS_MMOL,
            Self::MgDl => &THRESHOLDS_MGDL,
        }
    }

    /// Convert a mg/dL value into this unit, rounded to one decimal.
    pub fn convert_from_mgdl(&self, value_mgdl: f64) -> f64 {
        let converted = match self {
            Self::MmolL => to_mmol(value_mgdl),
            Self::MgDl => value_mgdl,
        };
        (converted * 10.0).round() / 10.0
    }

    /// Convert a value in this unit back to mg/dL.
    pub fn convert_to_mgdl(&self, value: f64) -> f64 {
        match self {
            Self::MmolL => to_mgdl(value),
            Self::MgDl => value,
        }
    }

    /// Format a mg/dL value with the unit label.
    pub fn format(&self, value_mgdl: f64) -> String {
        format!("{} {}", self.convert_from_mgdl(value_mgdl), self)
    }
}

/// Convert mmol/L to mg/dL.
pub fn to_mgdl(value_mmol: f64) -> f64 {
    value_mmol * MMOL_TO_MGDL
}

/// Convert mg/dL to mmol/L.
pub fn to_mmol(value_mgdl: f64) -> f64 {
    value_mgdl / MMOL_TO_MGDL
}

/// Check whether a glucose value (mg/dL) is physiologically plausible.
pub fn validate_glucose_range(value_mgdl: f64) -> bool {
    (20.0..=600.0).contains(&value_mgdl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("mmol/L".parse::<GlucoseUnit>().unwrap(), GlucoseUnit::MmolL);
        assert_eq!(" mg/dL ".parse::<GlucoseUnit>().unwrap(), GlucoseUnit::MgDl);
        assert!("mgdl".parse::<GlucoseUnit>().is_err());
    }

    #[test]
    fn test_format_mmol() {
        let formatted = GlucoseUnit::MmolL.format(180.0);
        assert_eq!(formatted, "10 mmol/L");
    }

    #[test]
    fn test_format_mgdl_passthrough() {
        assert_eq!(GlucoseUnit::MgDl.format(130.0), "130 mg/dL");
    }

    #[test]
    fn test_thresholds_per_unit() {
        assert_eq!(GlucoseUnit::MgDl.thresholds().severe_hyper, 250.0);
        assert_eq!(GlucoseUnit::MmolL.thresholds().severe_hyper, 13.9);
    }

    #[test]
    fn test_physiological_range() {
        assert!(validate_glucose_range(70.0));
        assert!(validate_glucose_range(20.0));
        assert!(validate_glucose_range(600.0));
        assert!(!validate_glucose_range(19.9));
        assert!(!validate_glucose_range(601.0));
    }

    proptest! {
        /// Rounding to one decimal costs at most 0.05 mmol/L, so the full
        /// round trip stays within 0.06 mmol/L.
        #[test]
        fn round_trip_error_bounded(mgdl in 20.0f64..600.0) {
            let mmol = GlucoseUnit::MmolL.convert_from_mgdl(mgdl);
            let back = to_mmol(GlucoseUnit::MmolL.convert_to_mgdl(mmol));
            prop_assert!((back - to_mmol(mgdl)).abs() <= 0.06);
        }
    }
}
