//! Merged table writer
//!
//! Writes the final node and edge tables: tab-separated, header first,
//! columns in canonical order. Output goes to a temporary name in the same
//! directory and is renamed into place on finish, so a crash never leaves a
//! half-written artifact under the published name.

use kgm_common::{KgmError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::{Row, Schema};

pub struct TableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl TableWriter {
    /// Create the writer and emit the header line
    pub fn create(path: impl Into<PathBuf>, schema: &Arc<Schema>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tsv.tmp");
        let file = File::create(&tmp_path).map_err(|e| KgmError::write_error(e, &tmp_path))?;
        let mut writer = BufWriter::new(file);
        let header = schema.columns().join("\t");
        writeln!(writer, "{}", header).map_err(|e| KgmError::write_error(e, &tmp_path))?;
        Ok(Self {
            path,
            tmp_path,
            writer,
            rows: 0,
        })
    }

    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        let line = row.values().join("\t");
        writeln!(self.writer, "{}", line).map_err(|e| KgmError::write_error(e, &self.tmp_path))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and publish the table under its final name
    pub fn finish(mut self) -> Result<u64> {
        self.writer
            .flush()
            .map_err(|e| KgmError::write_error(e, &self.tmp_path))?;
        drop(self.writer);
        std::fs::rename(&self.tmp_path, &self.path)
            .map_err(|e| KgmError::write_error(e, &self.path))?;
        Ok(self.rows)
    }
}
