// Casetrail - core/mod.rs
//
// Core business logic layer.
// Must NOT depend on: platform, app.
// Reads files only where ingestion and discovery need to; hashing of
// evidence on disk belongs to app::custody.

pub mod cancel;
pub mod diagnostics;
pub mod discovery;
pub mod event_store;
pub mod export;
pub mod manifest;
pub mod model;
pub mod rules;
pub mod summary;
pub mod timeline;
pub mod timestamp;
