//! # Solar Production Profile
//!
//! Clear-day PV output modelled as a Gaussian bell centred on solar noon.

/// Peak production in kW, reached at solar noon
pub const PEAK_OUTPUT_KW: f64 = 8.0;
/// Hour of day with maximum production
pub const SOLAR_NOON_HOUR: f64 = 12.0;
/// Denominator of the Gaussian exponent, i.e. 2σ² with σ = 3 h
const SPREAD: f64 = 18.0;

/// Simulated PV output in kW for a time of day.
///
/// `output = max(0, 8 * exp(-((hour + minute/60 - 12)^2) / 18))`
///
/// Output lies in `[0, 8]`, rises monotonically until noon and falls after it.
/// Pure and deterministic.
pub fn pv_profile(hour: u32, minute: u32) -> f64 {
    let time_decimal = hour as f64 + minute as f64 / 60.0;
    let offset = time_decimal - SOLAR_NOON_HOUR;
    (PEAK_OUTPUT_KW * (-(offset * offset) / SPREAD).exp()).max(0.0)
}

/// [`pv_profile`] on the full hour.
pub fn pv_profile_hour(hour: u32) -> f64 {
    pv_profile(hour, 0)
}
