//! Flat row data model shared by all passes.
//!
//! Rows arrive already resolved to flat column/value string maps; nothing
//! here parses delimited files. Columns may carry a namespace suffix
//! (`field/id` for an external-key reference, `field/.id` for a raw
//! numeric id) which is stripped when matching against the remote schema.

/// Returns the schema-facing base name of a header column, with any
/// `/`-suffix removed (`parent_id/id` becomes `parent_id`).
pub fn base_field(column: &str) -> &str {
    column.split('/').next().unwrap_or(column)
}

/// A header plus string rows, one row per target record.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Dataset {
    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { header, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by its exact header name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|c| c == name)
    }

    /// Index of the first column whose base name matches `base`,
    /// regardless of suffix notation.
    pub fn index_of_base(&self, base: &str) -> Option<usize> {
        self.header.iter().position(|c| base_field(c) == base)
    }
}

/// Splits rows into numbered contiguous batches. Numbering starts at 1
/// and matches the order of submission; batches are independent units of
/// work and never depend on each other's output.
pub fn number_batches(rows: &[Vec<String>], batch_size: usize) -> Vec<(usize, Vec<Vec<String>>)> {
    let size = batch_size.max(1);
    rows.chunks(size)
        .enumerate()
        .map(|(i, chunk)| (i + 1, chunk.to_vec()))
        .collect()
}

/// A source row plus the human-readable reason it failed. The unit of the
/// failure-recovery file.
#[derive(Debug, Clone, PartialEq)]
pub struct FailRecord {
    pub row: Vec<String>,
    pub reason: String,
}

impl FailRecord {
    pub fn new(row: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            row,
            reason: reason.into(),
        }
    }
}

/// Lifecycle of a batch across the create/write engines.
///
/// `Pending -> Submitted -> (Succeeded | FailedBulk -> SucceededIndividual
/// | FailedIndividual)`. Only `FailedIndividual` rows reach the fail file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Submitted,
    Succeeded,
    FailedBulk,
    SucceededIndividual,
    FailedIndividual,
}

impl BatchState {
    pub fn is_terminal_success(self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::SucceededIndividual)
    }
}
