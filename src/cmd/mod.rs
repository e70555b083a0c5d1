//! Command-line entry points.

pub mod extract;
pub mod prefill;
pub mod schema;
