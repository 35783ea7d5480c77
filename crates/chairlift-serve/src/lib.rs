//! Chairlift Serve - HTTP ingress for lift rides.
//!
//! Validates ride submissions and publishes them to the ingestion queue
//! through the pipeline's [`IngressGateway`](chairlift_ingest::IngressGateway).
//! Storage happens asynchronously behind the queue; a `201` means the ride
//! was queued, not that it is stored yet.
//!
//! # Architecture
//!
//! - **Config**: CLI flags with environment fallbacks
//! - **AppState**: Shared gateway handle
//! - **Routes**: Ride submission and health check

mod config;
mod error;
mod routes;
mod state;

pub use self::config::{Config, Mode};
pub use self::error::ApiError;
pub use self::routes::router;
pub use self::state::AppState;
