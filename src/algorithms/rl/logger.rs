//! Tabular key-value log sinks.
//!
//! One record per epoch. [`TabularLogger::for_run`] writes `progress.csv` and
//! `progress.jsonl` into the run directory and echoes a table through
//! `tracing`.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use super::metrics::Metrics;
use crate::error::TrainError;

/// Destination for epoch records.
pub trait TabularSink {
    fn write_record(&mut self, record: &Metrics) -> Result<(), TrainError>;
}

/// CSV file whose header grows when new keys appear.
///
/// Growing the header rewrites the file, padding earlier rows with empty
/// cells. Header cells are quoted per RFC 4180 when they contain a comma, a
/// quote or a line break.
pub struct CsvSink {
    path: PathBuf,
    keys: Vec<String>,
    /// Bytes taken by the header line currently on disk.
    header_len: usize,
}

/// Quotes a cell if it would otherwise split the record.
fn csv_field(cell: &str) -> Cow<'_, str> {
    if cell.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", cell.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(cell)
    }
}

fn csv_line<'a>(cells: impl IntoIterator<Item = &'a str>) -> String {
    let cells: Vec<Cow<'a, str>> = cells.into_iter().map(csv_field).collect();
    let mut line = cells.join(",");
    line.push('\n');
    line
}

impl CsvSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, TrainError> {
        let path = path.into();
        File::create(&path)?;
        Ok(Self {
            path,
            keys: Vec::new(),
            header_len: 0,
        })
    }

    /// Rewrites the file under the current header. Rows already on disk have
    /// `old_width` cells each.
    fn rewrite_with_header(&mut self, old_width: usize) -> Result<(), TrainError> {
        let content = fs::read_to_string(&self.path)?;
        let rows = content.get(self.header_len..).unwrap_or_default();

        let header = csv_line(self.keys.iter().map(String::as_str));
        let padding = ",".repeat(self.keys.len().saturating_sub(old_width));
        let mut out = BufWriter::new(File::create(&self.path)?);
        out.write_all(header.as_bytes())?;
        for row in rows.lines() {
            writeln!(out, "{}{}", row, padding)?;
        }
        out.flush()?;
        self.header_len = header.len();
        Ok(())
    }
}

impl TabularSink for CsvSink {
    fn write_record(&mut self, record: &Metrics) -> Result<(), TrainError> {
        let old_width = self.keys.len();
        let new_keys: Vec<String> = record
            .keys()
            .filter(|k| !self.keys.contains(k))
            .cloned()
            .collect();
        if !new_keys.is_empty() {
            self.keys.extend(new_keys);
            self.rewrite_with_header(old_width)?;
        }

        let row: Vec<String> = self
            .keys
            .iter()
            .map(|k| record.get(k).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(csv_line(row.iter().map(String::as_str)).as_bytes())?;
        Ok(())
    }
}

/// One JSON object per line. Non-finite values are written as `null`.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl TabularSink for JsonLinesSink {
    fn write_record(&mut self, record: &Metrics) -> Result<(), TrainError> {
        serde_json::to_writer(&mut self.writer, record)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Echoes each record as an aligned table through `tracing`.
#[derive(Debug, Default)]
pub struct HumanSink;

impl TabularSink for HumanSink {
    fn write_record(&mut self, record: &Metrics) -> Result<(), TrainError> {
        let width = record.keys().map(String::len).max().unwrap_or(0);
        let dashes = "-".repeat(width + 16);
        let mut table = String::new();
        table.push_str(&dashes);
        for (k, v) in record {
            table.push_str(&format!("\n| {:<width$} | {:>10.4} |", k, v, width = width));
        }
        table.push('\n');
        table.push_str(&dashes);
        info!("\n{}", table);
        Ok(())
    }
}

/// Fans a record out to several sinks.
#[derive(Default)]
pub struct TabularLogger {
    sinks: Vec<Box<dyn TabularSink>>,
}

impl TabularLogger {
    pub fn new(sinks: Vec<Box<dyn TabularSink>>) -> Self {
        Self { sinks }
    }

    /// CSV, JSON lines and console sinks for a run directory (created if needed).
    pub fn for_run(log_dir: impl AsRef<Path>) -> Result<Self, TrainError> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;
        info!(dir = %log_dir.display(), "logging to");
        Ok(Self::new(vec![
            Box::new(HumanSink),
            Box::new(CsvSink::create(log_dir.join("progress.csv"))?),
            Box::new(JsonLinesSink::create(log_dir.join("progress.jsonl"))?),
        ]))
    }

    pub fn dump(&mut self, record: &Metrics) -> Result<(), TrainError> {
        for sink in &mut self.sinks {
            sink.write_record(record)?;
        }
        Ok(())
    }
}
