//! TLE Ingestion
//!
//! Fetches element sets from a primary source, cross-checks them against a
//! fallback, scores them and keeps an append-only history.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`repository`] | Append-only store (SQLite or in-memory) |
//! | [`quality`] | Pure scoring against the previously accepted TLE |
//! | [`sources`] | HTTP line-delimited TLE sources |
//! | [`acquisition`] | Fetch → cross-check → score → persist, and time-based selection |

use thiserror::Error;

pub mod acquisition;
pub mod quality;
pub mod repository;
pub mod sources;

pub use acquisition::AcquisitionService;
pub use orbital_mechanics::TleSet;
pub use quality::{ElementThresholds, QualityAssessor, ScoreWeights, TleQualityConfig};
pub use repository::{InMemoryTleRepository, SqliteTleRepository, TleRepository};
pub use sources::{HttpTleSource, TleSource, TleSourceConfig};

/// TLE fetch or parse failure, recovered locally by the acquisition service.
#[derive(Error, Debug, Clone)]
pub enum DataSourceError {
    #[error("{source_name}: request failed: {message}")]
    Request { source_name: String, message: String },
    #[error("{source_name}: returned status {status}")]
    Status { source_name: String, status: u16 },
    #[error("{source_name}: no TLE line pair in response")]
    MissingLines { source_name: String },
    #[error("{source_name}: unparseable elements: {message}")]
    Parse { source_name: String, message: String },
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: i64, reason: String },
    #[error("Repository lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
    #[error("Invalid TLE configuration: {0}")]
    InvalidConfig(String),
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, IngestError>;
