pub mod csv_store;

use thiserror::Error;

use crate::domain::PVRecord;

pub use csv_store::CsvRecordStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed store file: {0}")]
    Parse(String),
}

/// Append-only persistence for derived PV records.
///
/// Written by the consumer only; at most one writer at a time. Methods do
/// blocking file io; async callers go through `spawn_blocking`.
#[cfg_attr(test, mockall::automock)]
pub trait RecordStore: Send + Sync {
    /// Append one record. Never rewrites existing rows.
    fn append(&self, record: &PVRecord) -> Result<(), StoreError>;

    /// The last `limit` records, oldest first.
    fn latest(&self, limit: usize) -> Result<Vec<PVRecord>, StoreError>;

    /// Number of persisted records, header excluded.
    fn count(&self) -> Result<usize, StoreError>;
}
