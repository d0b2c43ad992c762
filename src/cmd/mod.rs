//! Command-line entry points.

pub mod run;
pub mod schema;
pub mod status;
