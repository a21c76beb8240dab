//! Variant lookup behind a narrow trait.

use labshare_types::VariantRow;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VariantStoreError {
    #[error("failed to read variant file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed variant record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Answers region queries over variant records.
///
/// Only called after the request has been authorized. `start` alone selects
/// a single position; with `end` it selects the inclusive range; neither
/// selects the whole chromosome.
pub trait VariantStore: Send + Sync {
    fn query(
        &self,
        chrom: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<VariantRow>, VariantStoreError>;
}

fn in_region(pos: u64, start: Option<u64>, end: Option<u64>) -> bool {
    match (start, end) {
        (Some(start), None) => pos == start,
        (Some(start), Some(end)) => pos >= start && pos <= end,
        (None, Some(end)) => pos <= end,
        (None, None) => true,
    }
}

/// A tab-separated file whose first two columns are chromosome and
/// position. Lines starting with `#` are headers.
#[derive(Debug, Clone)]
pub struct TsvVariantStore {
    path: PathBuf,
}

impl TsvVariantStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VariantStore for TsvVariantStore {
    fn query(
        &self,
        chrom: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<VariantRow>, VariantStoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut rows = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: VariantRow = line.split('\t').map(str::to_string).collect();
            if fields.len() < 2 {
                return Err(VariantStoreError::Malformed {
                    line: index + 1,
                    reason: "expected at least chromosome and position".to_string(),
                });
            }
            if fields[0] != chrom {
                continue;
            }
            let pos: u64 = fields[1].parse().map_err(|_| VariantStoreError::Malformed {
                line: index + 1,
                reason: format!("position '{}' is not a number", fields[1]),
            })?;
            if in_region(pos, start, end) {
                rows.push(fields);
            }
        }

        Ok(rows)
    }
}

/// Rows held in memory. Used when no variant file is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticVariantStore {
    rows: Vec<VariantRow>,
}

impl StaticVariantStore {
    pub fn new(rows: Vec<VariantRow>) -> Self {
        Self { rows }
    }
}

impl VariantStore for StaticVariantStore {
    fn query(
        &self,
        chrom: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<VariantRow>, VariantStoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.first().map(String::as_str) == Some(chrom))
            .filter(|row| {
                row.get(1)
                    .and_then(|pos| pos.parse().ok())
                    .is_some_and(|pos| in_region(pos, start, end))
            })
            .cloned()
            .collect())
    }
}
