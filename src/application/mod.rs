//! Application services: validation, job orchestration and output classification.

pub mod classify;
pub mod error;
pub mod export;
pub mod generate;
pub mod jobs;
pub mod validate;
