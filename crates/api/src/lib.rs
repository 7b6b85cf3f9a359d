//! HTTP API: job submission, run event streaming, and process wiring.

pub mod app;
pub mod config;
