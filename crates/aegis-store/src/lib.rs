//! `aegis-store` – Local Persistence.
//!
//! A SQLite-backed implementation of the persistence and evidence
//! collaborators, so a single device can run the safety core without a
//! remote backend.
//!
//! # Modules
//!
//! - [`sqlite`] – [`SqliteStore`][sqlite::SqliteStore]: profile, keyword
//!   enrollments, evidence rows and session summaries in one database file.

pub mod sqlite;

pub use sqlite::{SqliteStore, StoreError};
