//! Persisted configuration: vaults, named filters, rotation policies and
//! retention rules.
//!
//! Everything lives in one JSON file next to the data directory, written
//! atomically under an advisory lock. A content digest travels with every
//! load so a writer can detect that someone else saved in between
//! (lost-update protection), the same way the section-config files of the
//! backup server carry their digest.

mod types;
pub use types::*;

mod store;
pub use store::*;
