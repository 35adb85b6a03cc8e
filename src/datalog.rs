//! Process data logging.
//!
//! The bus worker hands one [`DataRow`] to its [`RowSink`] after every full poll
//! pass. Rows go to hourly CSV files named `process_log_YYYYMMDD_HH.csv`; a file
//! gets the header once, when it is created.

use crate::error::{AppResult, DaqError};
use crate::snapshot::DataRow;
use tokio::sync::mpsc;

/// Destination for per-pass rows. Called from the bus worker only.
pub trait RowSink: Send {
    /// Store one row.
    fn append(&mut self, row: &DataRow) -> AppResult<()>;
}

/// Discards every row.
#[derive(Debug, Default)]
pub struct NullSink;

impl RowSink for NullSink {
    fn append(&mut self, _row: &DataRow) -> AppResult<()> {
        Ok(())
    }
}

/// Forwards rows to a channel (GUI plots, tests).
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DataRow>,
}

impl ChannelSink {
    /// The sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DataRow>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RowSink for ChannelSink {
    fn append(&mut self, row: &DataRow) -> AppResult<()> {
        self.tx.send(row.clone()).map_err(|_| DaqError::ChannelClosed)
    }
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::path::{Path, PathBuf};
    use tracing::info;

    /// Hourly CSV files named `process_log_YYYYMMDD_HH.csv`.
    pub struct CsvRowSink {
        dir: PathBuf,
        current: Option<(String, csv::Writer<File>)>,
    }

    impl CsvRowSink {
        /// Create `dir` if needed. Files are opened lazily.
        pub fn new(dir: impl Into<PathBuf>) -> AppResult<Self> {
            let dir = dir.into();
            std::fs::create_dir_all(&dir)?;
            Ok(Self { dir, current: None })
        }

        /// Directory the logs go to.
        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Log file that receives `row`.
        pub fn file_name(row: &DataRow) -> String {
            format!("process_log_{}.csv", row.timestamp.format("%Y%m%d_%H"))
        }

        fn writer_for(&mut self, row: &DataRow) -> AppResult<&mut csv::Writer<File>> {
            let name = Self::file_name(row);
            let rotate = self.current.as_ref().map_or(true, |(open, _)| *open != name);
            if rotate {
                if let Some((_, mut old)) = self.current.take() {
                    old.flush()?;
                }
                let path = self.dir.join(&name);
                let fresh = !path.exists();
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let mut writer = csv::Writer::from_writer(file);
                if fresh {
                    writer.write_record(DataRow::HEADER).map_err(csv_error)?;
                    info!(path = %path.display(), "Started process log");
                }
                self.current = Some((name, writer));
            }
            self.current
                .as_mut()
                .map(|(_, writer)| writer)
                .ok_or_else(|| DaqError::Persistence("no open log file".to_string()))
        }
    }

    fn csv_error(e: csv::Error) -> DaqError {
        DaqError::Persistence(format!("CSV write failed: {e}"))
    }

    impl RowSink for CsvRowSink {
        fn append(&mut self, row: &DataRow) -> AppResult<()> {
            let writer = self.writer_for(row)?;
            writer.write_record(row.to_record()).map_err(csv_error)?;
            writer.flush()?;
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::path::PathBuf;

    /// Stand-in when the `storage_csv` feature is off.
    pub struct CsvRowSink;

    impl CsvRowSink {
        /// Always fails with `FeatureNotEnabled`.
        pub fn new(_dir: impl Into<PathBuf>) -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }

    impl RowSink for CsvRowSink {
        fn append(&mut self, _row: &DataRow) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvRowSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvRowSink;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::snapshot::{InstrumentSnapshot, Reading};
    use chrono::{Local, TimeZone};
    use tempfile::TempDir;

    fn row_at(hour: u32, minute: u32) -> DataRow {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[0] = Reading::Value(123.4);
        let ts = Local.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap();
        DataRow::from_snapshot(&snap, ts)
    }

    #[test]
    fn rows_rotate_hourly_with_one_header() {
        let tmp = TempDir::new().unwrap();
        let mut sink = CsvRowSink::new(tmp.path()).unwrap();
        sink.append(&row_at(10, 0)).unwrap();
        sink.append(&row_at(10, 59)).unwrap();
        sink.append(&row_at(11, 0)).unwrap();

        let first = std::fs::read_to_string(tmp.path().join("process_log_20240305_10.csv")).unwrap();
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Timestamp,Heater,Preheater,Reactor"));
        assert!(lines[1].starts_with("2024-03-05 10:00:00,123.4,NC"));

        let second = std::fs::read_to_string(tmp.path().join("process_log_20240305_11.csv")).unwrap();
        assert_eq!(second.lines().count(), 2);
    }

    #[test]
    fn reopened_file_is_appended_without_header() {
        let tmp = TempDir::new().unwrap();
        CsvRowSink::new(tmp.path()).unwrap().append(&row_at(9, 0)).unwrap();
        CsvRowSink::new(tmp.path()).unwrap().append(&row_at(9, 30)).unwrap();

        let text = std::fs::read_to_string(tmp.path().join("process_log_20240305_09.csv")).unwrap();
        let headers = text.lines().filter(|l| l.starts_with("Timestamp")).count();
        assert_eq!(headers, 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn every_column_is_written() {
        let tmp = TempDir::new().unwrap();
        let mut sink = CsvRowSink::new(tmp.path()).unwrap();
        sink.append(&row_at(8, 0)).unwrap();

        let mut reader = csv::Reader::from_path(tmp.path().join("process_log_20240305_08.csv")).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(record.len(), DataRow::HEADER.len());
    }

    #[tokio::test]
    async fn channel_sink_forwards_rows() {
        let (mut sink, mut rx) = ChannelSink::new();
        sink.append(&row_at(1, 0)).unwrap();
        assert_eq!(rx.recv().await.unwrap().temperatures[0], Reading::Value(123.4));
    }
}
