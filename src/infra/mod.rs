//! Infrastructure adapters and runtime bootstrap.

pub mod artifacts;
pub mod error;
pub mod http;
pub mod process;
pub mod remote;
pub mod staging;
pub mod telemetry;
