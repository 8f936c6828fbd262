use crate::error::BenchError;
use log::{debug, warn};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Append-only CSV writer for one measurement run
///
/// The header is written when the file is created; every [`Recorder::record`]
/// call appends exactly one row of the same width. The file is truncated on
/// creation, so a recorder never mixes rows of two runs.
#[derive(Debug)]
pub struct Recorder {
    writer: Option<csv::Writer<File>>,
    path: PathBuf,
    columns: usize,
    rows: usize,
}

impl Recorder {
    pub fn create<P: AsRef<Path>, S: AsRef<str>>(path: P, header: &[S]) -> Result<Self, BenchError> {
        let path = path.as_ref().to_path_buf();
        if header.is_empty() {
            return Err(BenchError::Config(
                "Result file header must declare at least one column".to_string(),
            ));
        }

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(header.iter().map(|h| h.as_ref()))?;
        writer.flush()?;
        debug!("Opened result file {}", path.display());

        Ok(Self {
            writer: Some(writer),
            path,
            columns: header.len(),
            rows: 0,
        })
    }

    /// Append one row; the width must match the header
    pub fn record(&mut self, row: &[f64]) -> Result<(), BenchError> {
        if row.len() != self.columns {
            return Err(BenchError::Config(format!(
                "Row has {} values but the header declares {} columns",
                row.len(),
                self.columns
            )));
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BenchError::Config("Recorder already closed".to_string()))?;
        writer.write_record(row.iter().map(|v| v.to_string()))?;
        // rows already on disk survive an aborted sweep
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and close the file, returning the number of rows written
    pub fn finish(mut self) -> Result<usize, BenchError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        debug!("Closed {} after {} row(s)", self.path.display(), self.rows);
        Ok(self.rows)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush {}: {}", self.path.display(), e);
            }
        }
    }
}
