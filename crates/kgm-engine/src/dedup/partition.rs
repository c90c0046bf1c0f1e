//! On-disk partition run files
//!
//! The deduplicator bounds memory by hash-slicing its input across run
//! files under the spill directory, then merging one partition at a time.
//! Run files are JSON lines of [`SpillRow`]: text, debuggable, and immune
//! to the tab-in-value problem that rules out TSV for intermediates.
//!
//! Each partition file has exactly one writer at a time, enforced by a
//! per-partition mutex; workers hash a row's key to pick the partition.

use kgm_common::{KgmError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::model::{OrderKey, Provenance, Row, Schema};

/// A row at rest in a run file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillRow {
    pub values: Vec<String>,
    pub provenance: Provenance,
    pub order: OrderKey,
}

impl SpillRow {
    pub fn from_row(row: &Row) -> Self {
        Self {
            values: row.values().to_vec(),
            provenance: row.provenance().clone(),
            order: row.order(),
        }
    }

    pub fn into_row(self, schema: std::sync::Arc<Schema>) -> Row {
        Row::new(schema, self.values, self.provenance, self.order)
    }
}

/// Stable partition index for a key at a given re-partition depth
pub fn partition_index(key: &str, depth: u32, fanout: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    depth.hash(&mut hasher);
    key.hash(&mut hasher);
    (hasher.finish() % fanout as u64) as usize
}

/// A run file on disk, with enough metadata to decide on re-partitioning
#[derive(Debug, Clone)]
pub struct RunFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub depth: u32,
}

struct CountingWriter {
    inner: BufWriter<File>,
    bytes: u64,
}

/// A set of partition run files accepting concurrent appends
pub struct PartitionWriterSet {
    dir: PathBuf,
    depth: u32,
    writers: Vec<Mutex<CountingWriter>>,
}

impl PartitionWriterSet {
    /// Create `fanout` empty run files under `dir`
    pub fn create(dir: impl Into<PathBuf>, fanout: usize, depth: u32) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut writers = Vec::with_capacity(fanout);
        for idx in 0..fanout {
            let path = run_path(&dir, depth, idx);
            let file = File::create(&path).map_err(|e| KgmError::write_error(e, &path))?;
            writers.push(Mutex::new(CountingWriter {
                inner: BufWriter::new(file),
                bytes: 0,
            }));
        }
        Ok(Self { dir, depth, writers })
    }

    pub fn fanout(&self) -> usize {
        self.writers.len()
    }

    /// Append a row to the partition owning `key`
    pub fn append(&self, key: &str, row: &SpillRow) -> Result<()> {
        let idx = partition_index(key, self.depth, self.writers.len());
        let mut line = serde_json::to_string(row).map_err(|e| KgmError::Other(e.into()))?;
        line.push('\n');
        let mut writer = self.writers[idx].lock().unwrap_or_else(|e| e.into_inner());
        writer
            .inner
            .write_all(line.as_bytes())
            .map_err(|e| KgmError::write_error(e, run_path(&self.dir, self.depth, idx)))?;
        writer.bytes += line.len() as u64;
        Ok(())
    }

    /// Flush everything and return the run files
    pub fn finish(self) -> Result<Vec<RunFile>> {
        let mut runs = Vec::with_capacity(self.writers.len());
        for (idx, writer) in self.writers.into_iter().enumerate() {
            let mut writer = writer.into_inner().unwrap_or_else(|e| e.into_inner());
            let path = run_path(&self.dir, self.depth, idx);
            writer
                .inner
                .flush()
                .map_err(|e| KgmError::write_error(e, &path))?;
            runs.push(RunFile {
                path,
                bytes: writer.bytes,
                depth: self.depth,
            });
        }
        Ok(runs)
    }
}

fn run_path(dir: &Path, depth: u32, idx: usize) -> PathBuf {
    dir.join(format!("run-d{}-{:04}.jsonl", depth, idx))
}

/// Stream the rows of a run file
pub fn read_run(path: &Path) -> Result<impl Iterator<Item = Result<SpillRow>>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(reader.lines().map(|line| {
        let line = line?;
        serde_json::from_str::<SpillRow>(&line).map_err(|e| KgmError::Other(e.into()))
    }))
}

/// Split an oversized run file into finer partitions one level deeper.
///
/// The caller supplies the dedup key function so sliced rows land with
/// their key-mates. Returns the new run files; the original is deleted.
pub fn repartition(
    run: &RunFile,
    fanout: usize,
    sub_dir: impl Into<PathBuf>,
    key_of: impl Fn(&SpillRow) -> String,
) -> Result<Vec<RunFile>> {
    let writers = PartitionWriterSet::create(sub_dir, fanout, run.depth + 1)?;
    for row in read_run(&run.path)? {
        let row = row?;
        let key = key_of(&row);
        writers.append(&key, &row)?;
    }
    let runs = writers.finish()?;
    std::fs::remove_file(&run.path)?;
    Ok(runs)
}
