//! deltaflow - data-pipeline orchestration engine
//!
//! This library crate hosts the in-process simulation used by the CLI and
//! the integration tests. The engine itself lives in the `df-*` crates.

pub mod simulate;
