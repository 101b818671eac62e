//! Gateway service library crate.
//!
//! # Purpose
//! Exposes the service subsystems (config, app wiring, observability, core
//! routes) for use by the gateway binary and integration tests.
pub mod app;
pub mod config;
pub mod observability;
pub mod routes;
