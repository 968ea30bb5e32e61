//! CSV record store.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{RecordStore, StoreError};
use crate::domain::{iso_timestamp, PVRecord};

/// Column header, fixed order.
pub const HEADER: [&str; 4] = ["timestamp", "meter", "pv", "net"];
/// Older files named the net column `sum`.
const LEGACY_NET_COLUMN: &str = "sum";

/// Flat CSV file with header `timestamp,meter,pv,net`.
///
/// The file is created with its header on the first append and only ever
/// appended to afterwards.
pub struct CsvRecordStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn needs_header(&self) -> bool {
        fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true)
    }

    /// Read every record in file order. Rows that do not parse are skipped.
    fn read_all(&self) -> Result<Vec<PVRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;
        let columns = Columns::locate(reader.headers()?)?;

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            match columns.parse(&row) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %self.path.display(), row = line + 1, error = %e, "skipping malformed row"),
            }
        }
        Ok(records)
    }
}

impl RecordStore for CsvRecordStore {
    fn append(&self, record: &PVRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        let write_header = self.needs_header();
        if write_header {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if write_header {
            writer.write_record(HEADER)?;
            info!(path = %self.path.display(), "created results file");
        }
        writer.write_record(&[
            iso_timestamp::format(&record.timestamp),
            format_kw(record.meter),
            format_kw(record.pv),
            format_kw(record.net),
        ])?;
        writer.flush()?;
        Ok(())
    }

    fn latest(&self, limit: usize) -> Result<Vec<PVRecord>, StoreError> {
        let mut tail = VecDeque::new();
        for record in self.read_all()? {
            if tail.len() == limit {
                tail.pop_front();
            }
            if limit > 0 {
                tail.push_back(record);
            }
        }
        Ok(tail.into())
    }

    fn count(&self) -> Result<usize, StoreError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;
        let mut rows = 0;
        for row in reader.records() {
            row?;
            rows += 1;
        }
        Ok(rows)
    }
}

/// Two decimals; `-0.00` is written as `0.00`.
fn format_kw(value: f64) -> String {
    format!("{:.2}", value + 0.0)
}

/// Column positions resolved from the header row.
struct Columns {
    timestamp: usize,
    meter: usize,
    pv: usize,
    net: usize,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, StoreError> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);
        let missing = |name: &str| StoreError::Parse(format!("missing column '{name}'"));

        Ok(Self {
            timestamp: find("timestamp").ok_or_else(|| missing("timestamp"))?,
            meter: find("meter").ok_or_else(|| missing("meter"))?,
            pv: find("pv").ok_or_else(|| missing("pv"))?,
            net: find("net")
                .or_else(|| find(LEGACY_NET_COLUMN))
                .ok_or_else(|| missing("net"))?,
        })
    }

    fn parse(&self, row: &csv::StringRecord) -> Result<PVRecord, StoreError> {
        let field = |idx: usize| {
            row.get(idx)
                .map(str::trim)
                .ok_or_else(|| StoreError::Parse(format!("row has no column {idx}")))
        };
        let number = |idx: usize| -> Result<f64, StoreError> {
            let raw = field(idx)?;
            raw.parse()
                .map_err(|_| StoreError::Parse(format!("'{raw}' is not a number")))
        };

        let raw_ts = field(self.timestamp)?;
        Ok(PVRecord {
            timestamp: iso_timestamp::parse(raw_ts)
                .map_err(|e| StoreError::Parse(format!("timestamp '{raw_ts}': {e}")))?,
            meter: number(self.meter)?,
            pv: number(self.pv)?,
            net: number(self.net)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn record(minute: u32, meter: f64, pv: f64, net: f64) -> PVRecord {
        PVRecord {
            timestamp: NaiveDate::from_ymd_opt(2023, 1, 1)
                .unwrap()
                .and_hms_opt(12, minute, 0)
                .unwrap(),
            meter,
            pv,
            net,
        }
    }

    #[test]
    fn test_first_append_writes_header() {
        let dir = TempDir::new().unwrap();
        let store = CsvRecordStore::new(dir.path().join("nested/results.csv"));
        store.append(&record(0, 5.5, 8.0, 2.5)).unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents, "timestamp,meter,pv,net\n2023-01-01T12:00:00,5.50,8.00,2.50\n");
    }

    #[test]
    fn test_appends_never_rewrite() {
        let dir = TempDir::new().unwrap();
        let store = CsvRecordStore::new(dir.path().join("results.csv"));
        store.append(&record(0, 5.5, 8.0, 2.5)).unwrap();
        store.append(&record(1, 9.99, 7.99, -2.0)).unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,meter,pv,net");
        assert_eq!(lines[2], "2023-01-01T12:01:00,9.99,7.99,-2.00");
    }

    #[test]
    fn test_negative_zero_is_normalised() {
        assert_eq!(format_kw(-0.0), "0.00");
        assert_eq!(format_kw(-1.234), "-1.23");
    }

    #[test]
    fn test_latest_returns_tail_in_order() {
        let dir = TempDir::new().unwrap();
        let store = CsvRecordStore::new(dir.path().join("results.csv"));
        for minute in 0..10 {
            store.append(&record(minute, 1.0, 8.0, 7.0)).unwrap();
        }

        let tail = store.latest(3).unwrap();
        let minutes: Vec<u32> = tail
            .iter()
            .map(|r| chrono::Timelike::minute(&r.timestamp))
            .collect();
        assert_eq!(minutes, vec![7, 8, 9]);
        assert_eq!(store.latest(50).unwrap().len(), 10);
        assert!(store.latest(0).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 10);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = CsvRecordStore::new(dir.path().join("absent.csv"));
        assert!(store.latest(5).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_reads_legacy_sum_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(
            &path,
            "timestamp,meter,pv,sum\n2023-01-01T12:00:00,5.5,7.2,1.7\n2023-01-01T12:00:03,6.1,7.1,1.0\n",
        )
        .unwrap();

        let records = CsvRecordStore::new(&path).latest(50).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].meter, 5.5);
        assert_eq!(records[0].pv, 7.2);
        assert_eq!(records[0].net, 1.7);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(
            &path,
            "timestamp,meter,pv,net\nnot-a-time,1.00,2.00,1.00\n2023-01-01T12:00:00,5.50,8.00,2.50\n",
        )
        .unwrap();

        let records = CsvRecordStore::new(&path).latest(50).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].net, 2.5);
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, "timestamp,meter\n2023-01-01T12:00:00,5.50\n").unwrap();
        assert!(matches!(
            CsvRecordStore::new(&path).latest(1),
            Err(StoreError::Parse(_))
        ));
    }
}
