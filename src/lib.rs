//! # PV Simulator
//!
//! Simulates a household energy meter and a photovoltaic production feed.
//! A producer task publishes synthetic meter readings onto a durable broker
//! queue; a consumer task derives PV output and net power for every reading,
//! validates the result and appends it to a flat CSV record store.
//!
//! [`controller::SimulationController`] owns the lifecycle of both tasks.

pub mod broker;
pub mod config;
pub mod controller;
pub mod domain;
pub mod repo;
pub mod simulation;
pub mod telemetry;
pub mod utils;

pub use controller::{SimulationController, SimulationStatus};
pub use domain::{MeterReading, PVRecord, ReadingValidator};
pub use simulation::pv_profile;
