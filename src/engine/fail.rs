//! Failure-recovery file.
//!
//! Failed rows are written as CSV with the source header plus an
//! appended `_ERROR_REASON` column, incrementally as batches complete.
//! Row order therefore follows completion order, not source order.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;

use crate::dataset::FailRecord;
use crate::error::FlowError;

pub const ERROR_REASON_COLUMN: &str = "_ERROR_REASON";

/// Standard fail-file name for a model.
pub fn fail_file_name(model: &str) -> String {
    format!("{}_fail.csv", model.replace('.', "_"))
}

/// Timestamped name used when re-running previously failed records, so
/// a recovery run never clobbers its own input.
pub fn retry_fail_file_name(model: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    format!("{}_{stamp}_failed.csv", model.replace('.', "_"))
}

/// Extracts the meaningful message from a raw fault string. Server
/// faults often arrive as serialized payloads with the human-readable
/// text nested under `data.message`.
pub fn clean_fault_message(raw: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(message) = value.pointer("/data/message").and_then(Value::as_str) {
            return message.trim().replace('\n', " ");
        }
    }
    raw.trim().replace('\n', " ")
}

/// Incremental CSV writer for fail records. Appends happen only from
/// the pool's completion path; the mutex keeps the type shareable
/// across passes without allowing interleaved writes.
pub struct FailFile {
    path: PathBuf,
    writer: Mutex<csv::Writer<fs::File>>,
}

impl FailFile {
    /// Creates the file and writes the header, appending the error
    /// reason column unless the source already carries one (recovery
    /// runs re-import their own fail files).
    pub fn create(path: impl AsRef<Path>, header: &[String]) -> Result<Self, FlowError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // Source rows may be ragged; never reject a record we are
        // trying to save for recovery.
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .flexible(true)
            .from_path(&path)?;
        let mut columns: Vec<String> = header.to_vec();
        if !columns.iter().any(|c| c == ERROR_REASON_COLUMN) {
            columns.push(ERROR_REASON_COLUMN.to_string());
        }
        writer.write_record(&columns)?;
        writer.flush()?;
        log::debug!("fail file ready at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends records and forces them to disk so a crash mid-run loses
    /// nothing already classified as failed.
    pub fn append_all(&self, records: &[FailRecord]) -> Result<(), FlowError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        for record in records {
            let mut row = record.row.clone();
            row.push(record.reason.clone());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}
