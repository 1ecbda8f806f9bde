//! Common utilities shared across Portward crates.

pub mod single_flight;

pub use single_flight::{FlightGuard, SingleFlight};
