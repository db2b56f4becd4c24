//! Demonstration model and console report of the `femstate` binary.

pub mod model;
pub mod report;
