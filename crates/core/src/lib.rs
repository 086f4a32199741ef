//! Pure logic for the tabular bulk import engine.
//!
//! Nothing in this crate performs I/O: the registry, coercion rules,
//! row validation, file profiling heuristics, timestamp normalisation,
//! retry policy, and outcome counters are all plain functions and values
//! that the engine and store crates drive.

pub mod coercion;
pub mod error;
pub mod outcome;
pub mod profile;
pub mod registry;
pub mod retry;
pub mod timestamps;
pub mod types;
pub mod validation;
pub mod value;
