//! Core types, validation, and shared utilities for the Chairlift ingestion pipeline.
//!
//! This crate provides:
//! - The lift ride [`Event`] and its validation at ingress
//! - The [`RideRecord`] storage mapping with its content-derived [`RideKey`]
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

pub use error::{Error, Result};
pub use event::{
    ACCEPTED_SEASON, DAY_ID_RANGE, Event, LIFT_ID_RANGE, LiftRide, RESORT_ID_RANGE, RideKey,
    RidePath, RideRecord, SKIER_ID_RANGE, TIME_RANGE, validate_ride,
};
