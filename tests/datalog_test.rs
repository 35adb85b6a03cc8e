//! Every completed poll pass produces one data row.
#![cfg(feature = "storage_csv")]

mod common;

use reactor_daq::adapters::RigSimulator;
use reactor_daq::datalog::CsvRowSink;
use reactor_daq::snapshot::{DataRow, Reading};
use tempfile::TempDir;

#[tokio::test(start_paused = true)]
async fn one_row_per_pass() {
    let sim = RigSimulator::default();
    sim.update(|s| s.temperatures[5] = None);
    let (rig, mut rows) = common::start(sim);
    rig.handle.wait_for_pass(3).await.unwrap();

    let mut received = Vec::new();
    while let Ok(row) = rows.try_recv() {
        received.push(row);
    }
    assert!(received.len() >= 3);

    let row = &received[0];
    assert_eq!(row.temperatures[0], Reading::Value(25.0));
    assert_eq!(row.temperatures[5], Reading::NotConnected);
    assert_eq!(row.pressures, [Reading::Value(1.0); 3]);
    assert!(row.gases.iter().all(Reading::is_value));
    let record = row.to_record();
    assert_eq!(record[6], DataRow::MISSING);
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rows_land_in_hourly_csv() {
    let dir = TempDir::new().unwrap();
    let settings = common::settings(&dir);
    let data_dir = settings.application.data_dir.clone();
    let sink = CsvRowSink::new(data_dir.clone()).unwrap();
    let rig = common::start_with(RigSimulator::default(), &settings, dir, Box::new(sink));
    rig.handle.wait_for_pass(2).await.unwrap();
    rig.app.shutdown().await;

    let files: Vec<_> = std::fs::read_dir(&data_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(!files.is_empty());
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("process_log_") && name.ends_with(".csv"), "{name}");

    let rows: usize = files
        .iter()
        .map(|path| {
            let mut reader = csv::Reader::from_path(path).unwrap();
            assert_eq!(reader.headers().unwrap().len(), DataRow::HEADER.len());
            reader.records().count()
        })
        .sum();
    assert!(rows >= 2);
}
