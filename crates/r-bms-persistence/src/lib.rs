//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Persistence abstractions and storage bindings."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Storage for alarm history: a JSON array written on shutdown and an
//! append-only JSON-lines journal covering the time in between.

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored file exists but its content cannot be decoded.
    #[error("corrupt file {path}: {source}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Decoder failure.
        source: serde_json::Error,
    },
    /// The journal header does not match its recorded digest.
    #[error("journal header hash mismatch in {0}")]
    HeaderMismatch(PathBuf),
}

pub mod history;
pub mod journal;

pub use history::HistoryStore;
pub use journal::replay as replay_journal;
pub use journal::{JournalEntry, JournalReader, JournalWriter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_error_names_the_file() {
        let source = serde_json::from_str::<Vec<u8>>("[1,").unwrap_err();
        let err = PersistenceError::Corrupt {
            path: PathBuf::from("alarms.json"),
            source,
        };
        assert!(format!("{err}").starts_with("corrupt file alarms.json"));
    }
}
