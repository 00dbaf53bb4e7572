//! Infrastructure adapters and runtime bootstrap.

pub mod credentials;
pub mod db;
pub mod error;
pub mod queue;
pub mod telemetry;
