//! Shared types and helpers for the vigil alerting workspace.

pub mod clock;
pub mod id;
pub mod path;
pub mod types;
