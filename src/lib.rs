//! Interaction Engine — behavioral scoring and intervention dispatch core.
//!
//! Exposes the evaluation pipeline modules for use by the binary and by
//! integration tests. The HTTP/WS wiring lives in `main.rs`; everything
//! that can be exercised without a live server lives here.

pub mod batcher;
pub mod clock;
pub mod config;
pub mod config_store;
pub mod decision;
pub mod drift;
pub mod errors;
pub mod evaluation;
pub mod experiments;
pub mod friction;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod mswim;
pub mod session;
pub mod shadow;
pub mod store;
pub mod training;
pub mod transport;
