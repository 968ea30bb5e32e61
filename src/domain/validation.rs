use std::ops::RangeInclusive;

use thiserror::Error;

/// Allowed meter consumption in kW.
pub const METER_RANGE_KW: RangeInclusive<f64> = 0.0..=20.0;
/// Allowed PV production in kW.
pub const PV_RANGE_KW: RangeInclusive<f64> = 0.0..=10.0;
/// Allowed net power in kW. Negative values mean drawing from the grid.
pub const NET_RANGE_KW: RangeInclusive<f64> = -20.0..=10.0;

/// A value fell outside its domain bounds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("meter value {value} kW outside {min}..={max} kW")]
    MeterOutOfRange { value: f64, min: f64, max: f64 },
    #[error("pv value {value} kW outside {min}..={max} kW")]
    PvOutOfRange { value: f64, min: f64, max: f64 },
    #[error("net value {value} kW outside {min}..={max} kW")]
    NetOutOfRange { value: f64, min: f64, max: f64 },
}

/// Round a power value to two decimals (10 W resolution), ties to even.
pub fn round_kw(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Range checks applied on both sides of the broker.
///
/// A reading is validated when the producer creates it and again when the
/// consumer receives it; nothing is trusted across the transport boundary.
pub struct ReadingValidator;

impl ReadingValidator {
    /// Validate a meter value and return it rounded to two decimals.
    pub fn validate_meter(value: f64) -> Result<f64, ValidationError> {
        if !METER_RANGE_KW.contains(&value) {
            return Err(ValidationError::MeterOutOfRange {
                value,
                min: *METER_RANGE_KW.start(),
                max: *METER_RANGE_KW.end(),
            });
        }
        Ok(round_kw(value))
    }

    /// Validate a PV/net pair and return both rounded to two decimals.
    pub fn validate_pv_net(pv: f64, net: f64) -> Result<(f64, f64), ValidationError> {
        if !PV_RANGE_KW.contains(&pv) {
            return Err(ValidationError::PvOutOfRange {
                value: pv,
                min: *PV_RANGE_KW.start(),
                max: *PV_RANGE_KW.end(),
            });
        }
        if !NET_RANGE_KW.contains(&net) {
            return Err(ValidationError::NetOutOfRange {
                value: net,
                min: *NET_RANGE_KW.start(),
                max: *NET_RANGE_KW.end(),
            });
        }
        Ok((round_kw(pv), round_kw(net)))
    }
}
