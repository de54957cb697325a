// Casetrail - app/mod.rs
//
// Application layer: the file-backed Integrity Ledger and the pipeline
// that drives a run through its stages.
// Dependencies: core, platform (validated config).

pub mod custody;
pub mod pipeline;
