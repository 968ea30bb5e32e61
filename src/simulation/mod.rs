//! # Signal Simulation Module
//!
//! Synthetic inputs for the meter/PV pipeline.
//!
//! - **Meter**: uniformly distributed household consumption samples
//! - **Solar**: time-of-day PV production profile
//!
//! ## Usage
//!
//! ```rust
//! use pv_simulator::simulation::{pv_profile, MeterGenerator, MeterGeneratorConfig};
//!
//! let mut meter = MeterGenerator::new(MeterGeneratorConfig {
//!     random_seed: Some(7),
//!     ..Default::default()
//! });
//!
//! let consumption_kw = meter.sample_kw();
//! let production_kw = pv_profile(12, 30);
//! assert!(consumption_kw >= 0.5 && production_kw <= 8.0);
//! ```

pub mod meter;
pub mod solar;

pub use meter::{MeterGenerator, MeterGeneratorConfig};
pub use solar::{pv_profile, pv_profile_hour, PEAK_OUTPUT_KW, SOLAR_NOON_HOUR};
