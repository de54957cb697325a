// Casetrail - util/mod.rs
//
// Utility modules: error types, named constants, logging setup.
// Only the error module reaches into core, to wrap domain violations.

pub mod constants;
pub mod error;
pub mod logging;
