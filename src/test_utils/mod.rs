//! Test helpers shared by unit tests and the `tests/` integration suite.

pub mod database_seed;
