//! Standalone vigil service: loads rules, channels, templates and recipients
//! from TOML and feeds domain events through the alert pipeline.

pub mod bootstrap;
pub mod config;
pub mod maintenance;
pub mod pipeline;
