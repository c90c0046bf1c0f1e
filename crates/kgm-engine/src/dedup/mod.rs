//! Priority deduplication
//!
//! The central component of the merge. Invoked once for nodes and once for
//! edges with different keys and priority rules, it produces exactly one
//! winner per key while holding only one hash partition in memory at a
//! time.
//!
//! The run is out-of-core in three phases:
//!
//! 1. **Partition**: canonicalized rows are hash-sliced across run files on
//!    disk. Any worker may append; a per-partition mutex keeps each file
//!    single-writer.
//! 2. **Merge**: partitions are independent, so they fold in parallel. A
//!    partition folds into per-key accumulators
//!    (`absent -> tentative(winner, merged_sets)`), then its winners are
//!    sorted by first occurrence and written to a winner file. An
//!    oversized partition is re-partitioned one level deeper first.
//! 3. **Emit**: winner files are k-way merged by first-occurrence order, so
//!    the output is stable with respect to the first appearance of each
//!    key in the input.

pub mod partition;
pub mod priority;

use kgm_common::Result;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{DedupConfig, SetUnionOrder};
use crate::model::{join_list, split_list, OrderKey, Row, Schema, SET_VALUED_COLUMNS};
use kgm_common::curie;
use partition::{read_run, repartition, PartitionWriterSet, RunFile, SpillRow};
use priority::{EdgePriority, NodePriority};

/// Separator inside composite dedup keys; cannot occur in a TSV field
const KEY_SEP: char = '\u{1f}';

/// Re-partition fanout and recursion cap. Past the cap the partition is
/// folded anyway: fold memory grows with distinct keys, not file size, so a
/// single hot key cannot be split further no matter how deep we go.
const SUB_FANOUT: usize = 8;
const MAX_DEPTH: u32 = 6;

/// What to do with a row before partitioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Keep(String),
    /// The row matches a pruned prefix pair and is dropped outright
    Prune,
}

/// Key, priority, and accumulation rules for one table
pub trait DedupPolicy: Send + Sync + 'static {
    type Acc: Send;

    fn key(&self, row: &Row) -> KeyAction;
    fn start(&self, row: Row) -> Self::Acc;
    fn absorb(&self, acc: &mut Self::Acc, row: Row);
    fn first_order(&self, acc: &Self::Acc) -> OrderKey;
    fn finalize(&self, acc: Self::Acc) -> Row;
}

// ============================================================================
// Node policy
// ============================================================================

/// Node dedup: key = `id`; winner by [`NodePriority`]; the set-valued
/// columns are unioned across every row sharing the key.
pub struct NodeDedupPolicy {
    set_union_order: SetUnionOrder,
}

impl NodeDedupPolicy {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            set_union_order: config.set_union_order,
        }
    }
}

/// Accumulated state for one node id
pub struct NodeAcc {
    winner: Row,
    priority: NodePriority,
    first_order: OrderKey,
    /// column -> member -> earliest contributing row order
    sets: Vec<BTreeMap<String, OrderKey>>,
}

fn collect_sets(sets: &mut [BTreeMap<String, OrderKey>], row: &Row) {
    for (i, column) in SET_VALUED_COLUMNS.iter().enumerate() {
        for member in split_list(row.get(column)) {
            let order = row.order();
            sets[i]
                .entry(member.to_string())
                .and_modify(|o| {
                    if order < *o {
                        *o = order;
                    }
                })
                .or_insert(order);
        }
    }
}

impl DedupPolicy for NodeDedupPolicy {
    type Acc = NodeAcc;

    fn key(&self, row: &Row) -> KeyAction {
        KeyAction::Keep(row.get("id").to_string())
    }

    fn start(&self, row: Row) -> NodeAcc {
        let mut sets = vec![BTreeMap::new(); SET_VALUED_COLUMNS.len()];
        collect_sets(&mut sets, &row);
        NodeAcc {
            priority: NodePriority::of(&row),
            first_order: row.order(),
            sets,
            winner: row,
        }
    }

    fn absorb(&self, acc: &mut NodeAcc, row: Row) {
        collect_sets(&mut acc.sets, &row);
        if row.order() < acc.first_order {
            acc.first_order = row.order();
        }
        let priority = NodePriority::of(&row);
        let challenger = (&priority, row.order());
        let incumbent = (&acc.priority, acc.winner.order());
        if challenger < incumbent {
            acc.winner = row;
            acc.priority = priority;
        }
    }

    fn first_order(&self, acc: &NodeAcc) -> OrderKey {
        acc.first_order
    }

    fn finalize(&self, mut acc: NodeAcc) -> Row {
        for (i, column) in SET_VALUED_COLUMNS.iter().enumerate() {
            let members = std::mem::take(&mut acc.sets[i]);
            if members.is_empty() {
                continue;
            }
            let joined = match self.set_union_order {
                SetUnionOrder::Sorted => join_list(members.keys()),
                SetUnionOrder::Insertion => {
                    let mut entries: Vec<(String, OrderKey)> = members.into_iter().collect();
                    entries.sort_by_key(|(_, order)| *order);
                    join_list(entries.into_iter().map(|(v, _)| v))
                },
            };
            acc.winner.set(column, joined);
        }
        let mut winner = acc.winner;
        winner.set_order(acc.first_order);
        winner
    }
}

// ============================================================================
// Edge policy
// ============================================================================

/// Edge dedup: key = `(subject, object)`, or `(subject, object, predicate)`
/// for fan-out exempt prefix pairs; pruned pairs never reach a partition.
pub struct EdgeDedupPolicy {
    config: DedupConfig,
}

impl EdgeDedupPolicy {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }
}

/// Accumulated state for one edge key
pub struct EdgeAcc {
    winner: Row,
    priority: EdgePriority,
    first_order: OrderKey,
}

impl DedupPolicy for EdgeDedupPolicy {
    type Acc = EdgeAcc;

    fn key(&self, row: &Row) -> KeyAction {
        let subject = row.get("subject");
        let object = row.get("object");
        let subject_prefix = curie::prefix(subject).unwrap_or("");
        let object_prefix = curie::prefix(object).unwrap_or("");

        if self.config.is_pruned(subject_prefix, object_prefix) {
            return KeyAction::Prune;
        }

        let mut key = String::with_capacity(subject.len() + object.len() + 2);
        key.push_str(subject);
        key.push(KEY_SEP);
        key.push_str(object);
        if self.config.is_fanout_exempt(subject_prefix, object_prefix) {
            key.push(KEY_SEP);
            key.push_str(row.get("predicate"));
        }
        KeyAction::Keep(key)
    }

    fn start(&self, row: Row) -> EdgeAcc {
        EdgeAcc {
            priority: EdgePriority::of(&self.config, &row),
            first_order: row.order(),
            winner: row,
        }
    }

    fn absorb(&self, acc: &mut EdgeAcc, row: Row) {
        if row.order() < acc.first_order {
            acc.first_order = row.order();
        }
        let priority = EdgePriority::of(&self.config, &row);
        let challenger = (priority, row.order());
        let incumbent = (acc.priority, acc.winner.order());
        if challenger < incumbent {
            acc.winner = row;
            acc.priority = priority;
        }
    }

    fn first_order(&self, acc: &EdgeAcc) -> OrderKey {
        acc.first_order
    }

    fn finalize(&self, acc: EdgeAcc) -> Row {
        let mut winner = acc.winner;
        winner.set_order(acc.first_order);
        winner
    }
}

// ============================================================================
// Partitioned driver
// ============================================================================

/// Outcome of offering a row to the deduplicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Kept,
    Pruned,
}

/// Totals across the whole dedup
#[derive(Debug, Default, Clone, Copy)]
pub struct DedupStats {
    pub input_rows: u64,
    pub winners: u64,
    pub collapsed: u64,
}

/// Phase 1 handle: thread-safe appender into partition run files
pub struct PartitionedDedup<P: DedupPolicy> {
    policy: Arc<P>,
    schema: Arc<Schema>,
    writers: PartitionWriterSet,
    dir: PathBuf,
    budget_bytes: u64,
    input_rows: AtomicU64,
}

impl<P: DedupPolicy> PartitionedDedup<P> {
    pub fn create(
        dir: impl Into<PathBuf>,
        fanout: usize,
        policy: P,
        schema: Arc<Schema>,
        budget_bytes: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        let writers = PartitionWriterSet::create(&dir, fanout, 0)?;
        Ok(Self {
            policy: Arc::new(policy),
            schema,
            writers,
            dir,
            budget_bytes,
            input_rows: AtomicU64::new(0),
        })
    }

    /// Offer one canonicalized row. Safe to call from any worker thread.
    pub fn add(&self, row: &Row) -> Result<AddOutcome> {
        match self.policy.key(row) {
            KeyAction::Prune => Ok(AddOutcome::Pruned),
            KeyAction::Keep(key) => {
                self.input_rows.fetch_add(1, Ordering::Relaxed);
                self.writers.append(&key, &SpillRow::from_row(row))?;
                Ok(AddOutcome::Kept)
            },
        }
    }

    /// Close the partition files; merging can begin
    pub fn finish(self) -> Result<PendingMerge<P>> {
        let runs = self.writers.finish()?;
        Ok(PendingMerge {
            policy: self.policy,
            schema: self.schema,
            runs,
            dir: self.dir,
            budget_bytes: self.budget_bytes,
            input_rows: self.input_rows.into_inner(),
        })
    }
}

/// Phase 2 handle: run files on disk, ready to fold
pub struct PendingMerge<P: DedupPolicy> {
    policy: Arc<P>,
    schema: Arc<Schema>,
    runs: Vec<RunFile>,
    dir: PathBuf,
    budget_bytes: u64,
    input_rows: u64,
}

/// A winner file: one sorted slice of the final output
#[derive(Debug)]
struct WinnerFile {
    path: PathBuf,
    rows: u64,
}

impl<P: DedupPolicy> PendingMerge<P> {
    /// Fold every partition (in parallel) and return the merged stream
    pub fn merge(self, cancelled: &AtomicBool) -> Result<(MergedStream, DedupStats)> {
        self.merge_excluding(cancelled, &std::collections::HashSet::new())
    }

    /// Like [`merge`](Self::merge), but rows from the named sources are
    /// dropped during the fold. Covers sources refused mid-read, whose
    /// earlier rows already reached the partitions.
    pub fn merge_excluding(
        self,
        cancelled: &AtomicBool,
        exclude_sources: &std::collections::HashSet<String>,
    ) -> Result<(MergedStream, DedupStats)> {
        let collapsed = AtomicU64::new(0);
        let winner_files: Vec<WinnerFile> = self
            .runs
            .par_iter()
            .map(|run| self.merge_run(run, &collapsed, cancelled, exclude_sources))
            .collect::<Result<Vec<Vec<WinnerFile>>>>()?
            .into_iter()
            .flatten()
            .collect();

        let winners: u64 = winner_files.iter().map(|w| w.rows).sum();
        let stats = DedupStats {
            input_rows: self.input_rows,
            winners,
            collapsed: collapsed.into_inner(),
        };
        debug!(
            winners = stats.winners,
            collapsed = stats.collapsed,
            "dedup merge complete"
        );
        let stream = MergedStream::open(winner_files, Arc::clone(&self.schema))?;
        Ok((stream, stats))
    }

    fn merge_run(
        &self,
        run: &RunFile,
        collapsed: &AtomicU64,
        cancelled: &AtomicBool,
        exclude_sources: &std::collections::HashSet<String>,
    ) -> Result<Vec<WinnerFile>> {
        if cancelled.load(Ordering::Relaxed) {
            return Err(kgm_common::KgmError::Cancelled);
        }
        if run.bytes > self.budget_bytes && run.depth < MAX_DEPTH {
            debug!(
                path = %run.path.display(),
                bytes = run.bytes,
                "partition over budget, re-partitioning"
            );
            let policy = Arc::clone(&self.policy);
            let schema = Arc::clone(&self.schema);
            let subs = repartition(run, SUB_FANOUT, &self.dir, move |spill| {
                let row = spill.clone().into_row(Arc::clone(&schema));
                match policy.key(&row) {
                    KeyAction::Keep(key) => key,
                    KeyAction::Prune => String::new(),
                }
            })?;
            let mut winner_files = Vec::new();
            for sub in &subs {
                winner_files.extend(self.merge_run(sub, collapsed, cancelled, exclude_sources)?);
            }
            return Ok(winner_files);
        }
        if run.bytes > self.budget_bytes {
            warn!(
                path = %run.path.display(),
                bytes = run.bytes,
                "partition still over budget at maximum depth, folding anyway"
            );
        }

        let mut accs: HashMap<String, P::Acc> = HashMap::new();
        for (i, spill) in read_run(&run.path)?.enumerate() {
            if i % 16384 == 0 && cancelled.load(Ordering::Relaxed) {
                return Err(kgm_common::KgmError::Cancelled);
            }
            let row = spill?.into_row(Arc::clone(&self.schema));
            if !exclude_sources.is_empty() && exclude_sources.contains(&row.provenance().source) {
                continue;
            }
            let key = match self.policy.key(&row) {
                KeyAction::Keep(key) => key,
                KeyAction::Prune => continue,
            };
            match accs.entry(key) {
                Entry::Occupied(mut entry) => {
                    collapsed.fetch_add(1, Ordering::Relaxed);
                    self.policy.absorb(entry.get_mut(), row);
                },
                Entry::Vacant(entry) => {
                    entry.insert(self.policy.start(row));
                },
            }
        }

        let mut winners: Vec<(OrderKey, Row)> = accs
            .into_values()
            .map(|acc| {
                let order = self.policy.first_order(&acc);
                (order, self.policy.finalize(acc))
            })
            .collect();
        winners.sort_by_key(|(order, _)| *order);

        let winner_path = run.path.with_extension("winners.jsonl");
        let rows = write_winners(&winner_path, &winners)?;
        std::fs::remove_file(&run.path)?;
        Ok(vec![WinnerFile {
            path: winner_path,
            rows,
        }])
    }
}

fn write_winners(path: &PathBuf, winners: &[(OrderKey, Row)]) -> Result<u64> {
    use std::io::Write;
    let file = std::fs::File::create(path).map_err(|e| kgm_common::KgmError::write_error(e, path))?;
    let mut writer = std::io::BufWriter::new(file);
    for (_, row) in winners {
        let mut line = serde_json::to_string(&SpillRow::from_row(row))
            .map_err(|e| kgm_common::KgmError::Other(e.into()))?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .map_err(|e| kgm_common::KgmError::write_error(e, path))?;
    }
    writer
        .flush()
        .map_err(|e| kgm_common::KgmError::write_error(e, path))?;
    Ok(winners.len() as u64)
}

// ============================================================================
// Phase 3: k-way merged output stream
// ============================================================================

struct HeapEntry {
    order: OrderKey,
    file_idx: usize,
    row: SpillRow,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.file_idx == other.file_idx
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.order, self.file_idx).cmp(&(other.order, other.file_idx))
    }
}

/// Streaming union of sorted winner files, in global first-occurrence order
pub struct MergedStream {
    schema: Arc<Schema>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    files: Vec<Box<dyn Iterator<Item = Result<SpillRow>> + Send>>,
    paths: Vec<PathBuf>,
}

impl MergedStream {
    fn open(winner_files: Vec<WinnerFile>, schema: Arc<Schema>) -> Result<Self> {
        let mut files: Vec<Box<dyn Iterator<Item = Result<SpillRow>> + Send>> = Vec::new();
        let mut paths = Vec::new();
        let mut heap = BinaryHeap::new();
        for (idx, winner) in winner_files.iter().enumerate() {
            let mut iter = read_run(&winner.path)?;
            if let Some(first) = iter.next() {
                let row = first?;
                heap.push(Reverse(HeapEntry {
                    order: row.order,
                    file_idx: idx,
                    row,
                }));
            }
            files.push(Box::new(iter));
            paths.push(winner.path.clone());
        }
        Ok(Self {
            schema,
            heap,
            files,
            paths,
        })
    }

    /// Delete the winner files backing this stream
    pub fn cleanup(self) -> Result<()> {
        for path in &self.paths {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

impl Iterator for MergedStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(entry) = self.heap.pop()?;
        match self.files[entry.file_idx].next() {
            Some(Ok(row)) => {
                self.heap.push(Reverse(HeapEntry {
                    order: row.order,
                    file_idx: entry.file_idx,
                    row,
                }));
            },
            Some(Err(e)) => return Some(Err(e)),
            None => {},
        }
        Some(Ok(entry.row.into_row(Arc::clone(&self.schema))))
    }
}
