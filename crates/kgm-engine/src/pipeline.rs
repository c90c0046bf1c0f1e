//! Merge pipeline orchestration
//!
//! Wires the components into the full run: reader threads stream rows onto
//! a bounded queue, a canonicalizer pool drains it and appends to the
//! sharded partition writers, partitions merge in parallel, and the winner
//! stream feeds the output writer and statistics collector. Chains and the
//! stats document come last.
//!
//! Thread shape per table:
//!
//! ```text
//! reader (1 per source table) -> bounded queue -> canon workers -> partitions
//! ```
//!
//! Backpressure comes from the bounded queue; ordering within a source is
//! irrelevant to correctness because every row carries its first-occurrence
//! order key.

use kgm_common::{KgmError, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::canon::{CanonOutcome, Canonicalizer};
use crate::chain::{derive_transitive, evaluate_chain};
use crate::config::MergeConfig;
use crate::dedup::{
    AddOutcome, DedupPolicy, EdgeDedupPolicy, MergedStream, NodeDedupPolicy, PartitionedDedup,
};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::model::{OrderKey, Provenance, Row, Schema, TableKind};
use crate::reader::{prepare, RowReader, SourceTable, TableLayout};
use crate::spill::{ResumeMode, SpillGuard};
use crate::stats::{output_checksums, write_stats, StatsCollector};
use crate::writer::TableWriter;

/// Bounded queue depth between readers and the canonicalizer pool
const QUEUE_DEPTH: usize = 4096;

/// Initial partition fanout for the deduplicator
const PARTITION_FANOUT: usize = 64;

/// Cooperative cancellation signal shared by every worker
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn as_atomic(&self) -> &AtomicBool {
        &self.0
    }
}

/// Partial re-runs over existing merged tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnlyMode {
    /// Re-emit statistics from the existing merged tables
    Stats,
    /// Re-run a single chain projection by name
    Chain(String),
}

/// Caller-facing run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub only: Option<OnlyMode>,
    pub resume: ResumeMode,
    /// Turn dangling references into a fatal error after the merge
    pub strict: bool,
    /// Worker threads for the canonicalizer pool; defaults to the core count
    pub processes: Option<usize>,
}

/// What a run produced
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub nodes_written: u64,
    pub edges_written: u64,
    /// Distinct rows per evaluated chain
    pub chains: BTreeMap<String, u64>,
    pub diagnostics: crate::diagnostics::CounterSnapshot,
    pub refused_sources: Vec<String>,
    pub node_path: PathBuf,
    pub edge_path: PathBuf,
}

impl MergeReport {
    /// True when some sources were refused (exit code 4 territory)
    pub fn is_partial(&self) -> bool {
        !self.refused_sources.is_empty()
    }
}

/// One source whose both tables passed the header checks
struct PreparedSource {
    table: SourceTable,
    layout: TableLayout,
}

/// The merge engine: immutable configuration plus a run entry point
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Run the engine according to the options
    pub fn run(&self, options: &RunOptions, cancel: &CancelFlag) -> Result<MergeReport> {
        match &options.only {
            Some(OnlyMode::Stats) => self.run_stats_only(options),
            Some(OnlyMode::Chain(name)) => self.run_single_chain(name, options),
            None => self.run_full(options, cancel),
        }
    }

    // ------------------------------------------------------------------
    // Full merge
    // ------------------------------------------------------------------

    fn run_full(&self, options: &RunOptions, cancel: &CancelFlag) -> Result<MergeReport> {
        let sink = Arc::new(DiagnosticSink::new());
        let canon = Canonicalizer::new(&self.config.canon);
        let workers = options.processes.unwrap_or_else(num_cpus::get).max(1);
        let spill = SpillGuard::prepare(&self.config.memory.spill_dir, options.resume)?;
        let extract_dir = spill.dir().join("extract");
        std::fs::create_dir_all(&extract_dir)?;
        let mut stats = StatsCollector::new(&self.config.stats);

        info!(
            sources = self.config.sources.len(),
            workers, "starting merge run"
        );

        // Header checks up front; a source failing either table is refused
        // before any of its rows move.
        let mut node_sources = Vec::new();
        let mut edge_sources = Vec::new();
        for (index, source) in self.config.sources.iter().enumerate() {
            let node_table = SourceTable {
                source: source.name.clone(),
                rank: source.rank,
                source_index: index as u32,
                kind: TableKind::Nodes,
                path: source.nodes_path.clone(),
            };
            let edge_table = SourceTable {
                source: source.name.clone(),
                rank: source.rank,
                source_index: index as u32,
                kind: TableKind::Edges,
                path: source.edges_path.clone(),
            };
            let prepared = prepare(&node_table, &extract_dir)
                .and_then(|nodes| prepare(&edge_table, &extract_dir).map(|edges| (nodes, edges)));
            match prepared {
                Ok((node_layout, edge_layout)) => {
                    node_sources.push(PreparedSource {
                        table: node_table,
                        layout: node_layout,
                    });
                    edge_sources.push(PreparedSource {
                        table: edge_table,
                        layout: edge_layout,
                    });
                },
                Err(e) => {
                    warn!(source = %source.name, error = %e, "source refused");
                    sink.record_refused_source(&source.name);
                },
            }
        }

        // ---- Nodes ----
        let node_schema = union_schema(TableKind::Nodes, &node_sources);
        let node_dedup = PartitionedDedup::create(
            spill.dir().join("nodes"),
            PARTITION_FANOUT,
            NodeDedupPolicy::new(&self.config.dedup),
            Arc::clone(&node_schema),
            self.config.memory.partition_bytes,
        )?;
        self.partition_phase(node_sources, &node_schema, &node_dedup, &canon, &sink, cancel, workers)?;
        let exclude = sink.refused_sources().into_iter().collect::<HashSet<_>>();
        let (node_stream, node_stats) = node_dedup
            .finish()?
            .merge_excluding(cancel.as_atomic(), &exclude)?;
        info!(
            winners = node_stats.winners,
            collapsed = node_stats.collapsed,
            "node dedup complete"
        );

        let mut node_ids: HashSet<u64> = HashSet::new();
        let mut node_writer = TableWriter::create(self.config.output.node_path(), &node_schema)?;
        let mut node_stream = node_stream;
        for row in node_stream.by_ref() {
            let row = row?;
            node_ids.insert(id_hash(row.get("id")));
            stats.observe_node(&row);
            node_writer.write_row(&row)?;
        }
        let nodes_written = node_writer.finish()?;
        node_stream.cleanup()?;
        sink.add_collapsed(true, node_stats.collapsed);

        // ---- Edges ----
        // A source refused while its nodes streamed is out entirely; skip
        // its edge table as well.
        let refused_so_far: HashSet<String> = sink.refused_sources().into_iter().collect();
        let edge_sources: Vec<PreparedSource> = edge_sources
            .into_iter()
            .filter(|s| !refused_so_far.contains(&s.table.source))
            .collect();
        let edge_schema = union_schema(TableKind::Edges, &edge_sources);
        let edge_dedup = PartitionedDedup::create(
            spill.dir().join("edges"),
            PARTITION_FANOUT,
            EdgeDedupPolicy::new(self.config.dedup.clone()),
            Arc::clone(&edge_schema),
            self.config.memory.partition_bytes,
        )?;
        self.partition_phase(edge_sources, &edge_schema, &edge_dedup, &canon, &sink, cancel, workers)?;
        let exclude = sink.refused_sources().into_iter().collect::<HashSet<_>>();
        let (edge_stream, edge_stats) = edge_dedup
            .finish()?
            .merge_excluding(cancel.as_atomic(), &exclude)?;
        info!(
            winners = edge_stats.winners,
            collapsed = edge_stats.collapsed,
            "edge dedup complete"
        );
        sink.add_collapsed(false, edge_stats.collapsed);

        let edges_written = if self.config.transitive_relations.is_empty() {
            self.write_edges(edge_stream, &edge_schema, &mut stats, &node_ids, &sink)?
        } else {
            self.write_edges_with_transitive(
                edge_stream,
                &edge_schema,
                &mut stats,
                &node_ids,
                &sink,
                &spill,
                cancel,
            )?
        };

        // ---- Chains ----
        let chains = self.evaluate_chains(&self.config.chains, spill.dir().to_path_buf())?;

        // ---- Stats ----
        let mut output_files: Vec<PathBuf> = vec![
            self.config.output.node_path(),
            self.config.output.edge_path(),
        ];
        for chain in &self.config.chains {
            // Shard names are not predictable here; checksum the plain form.
            output_files.push(self.config.output.dir.join(format!(
                "{}_{}.tsv",
                self.config.output.chain_file_prefix, chain.name
            )));
        }
        let checksums = output_checksums(output_files.iter().map(|p| p.as_path()))?;
        let snapshot = sink.snapshot();
        let refused = sink.refused_sources();
        let doc = stats.finalize(snapshot, refused.clone(), checksums);
        write_stats(&self.config.output.stats_path(), &doc)?;

        spill.cleanup()?;

        if options.strict && snapshot.dangling_refs > 0 {
            let first = sink
                .first_detail(DiagnosticKind::DanglingRef)
                .map(|d| format!("{} ({}:{})", d.message, d.path, d.line))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(KgmError::DanglingReferences {
                count: snapshot.dangling_refs,
                first,
            });
        }

        info!(nodes = nodes_written, edges = edges_written, "merge complete");
        Ok(MergeReport {
            nodes_written,
            edges_written,
            chains,
            diagnostics: snapshot,
            refused_sources: refused,
            node_path: self.config.output.node_path(),
            edge_path: self.config.output.edge_path(),
        })
    }

    /// Readers -> queue -> canon/partition workers for one table
    #[allow(clippy::too_many_arguments)]
    fn partition_phase<P: DedupPolicy>(
        &self,
        sources: Vec<PreparedSource>,
        schema: &Arc<Schema>,
        dedup: &PartitionedDedup<P>,
        canon: &Canonicalizer,
        sink: &Arc<DiagnosticSink>,
        cancel: &CancelFlag,
        workers: usize,
    ) -> Result<()> {
        let kind = sources
            .first()
            .map(|s| s.table.kind)
            .unwrap_or(TableKind::Nodes);
        let (tx, rx) = mpsc::sync_channel::<Row>(QUEUE_DEPTH);

        let mut fatal: Option<KgmError> = None;
        std::thread::scope(|scope| {
            let rx = Arc::new(Mutex::new(rx));
            let mut reader_handles = Vec::new();
            for prepared in sources {
                let tx = tx.clone();
                let schema = Arc::clone(schema);
                let sink = Arc::clone(sink);
                let cancel = cancel.clone();
                reader_handles.push(scope.spawn(move || -> Result<()> {
                    let source_name = prepared.table.source.clone();
                    let reader =
                        RowReader::new(prepared.table, prepared.layout, schema, sink);
                    for row in reader {
                        if cancel.is_cancelled() {
                            return Err(KgmError::Cancelled);
                        }
                        let row = row.map_err(|e| match e {
                            refused @ KgmError::SourceRefused { .. } => refused,
                            other => KgmError::source_refused(&source_name, other.to_string()),
                        })?;
                        if tx.send(row).is_err() {
                            // Workers are gone; their error wins.
                            return Ok(());
                        }
                    }
                    Ok(())
                }));
            }
            drop(tx);

            let mut worker_handles = Vec::new();
            for _ in 0..workers {
                let rx = Arc::clone(&rx);
                let sink = Arc::clone(sink);
                let cancel = cancel.clone();
                worker_handles.push(scope.spawn(move || -> Result<()> {
                    loop {
                        if cancel.is_cancelled() {
                            return Err(KgmError::Cancelled);
                        }
                        let row = {
                            let guard = rx.lock().unwrap_or_else(|e| e.into_inner());
                            guard.recv()
                        };
                        let mut row = match row {
                            Ok(row) => row,
                            Err(_) => return Ok(()),
                        };
                        let outcome = match kind {
                            TableKind::Nodes => canon.canon_node(&mut row),
                            TableKind::Edges => canon.canon_edge(&mut row),
                        };
                        match outcome {
                            CanonOutcome::Drop(reason) => {
                                sink.record(Diagnostic {
                                    kind: DiagnosticKind::DroppedInvalid,
                                    path: row.provenance().path.clone(),
                                    line: row.provenance().line,
                                    message: reason.to_string(),
                                });
                                continue;
                            },
                            CanonOutcome::Keep => {},
                        }
                        match dedup.add(&row)? {
                            AddOutcome::Kept => {},
                            AddOutcome::Pruned => {
                                sink.record(Diagnostic {
                                    kind: DiagnosticKind::PrunedEdge,
                                    path: row.provenance().path.clone(),
                                    line: row.provenance().line,
                                    message: format!(
                                        "pruned edge {} -> {}",
                                        row.get("subject"),
                                        row.get("object")
                                    ),
                                });
                            },
                        }
                    }
                }));
            }
            // Keep no receiver handle here: once every worker exits, a
            // reader blocked on a full queue must see the channel close.
            drop(rx);

            for handle in reader_handles {
                match handle.join() {
                    Ok(Ok(())) => {},
                    Ok(Err(KgmError::SourceRefused { source, reason })) => {
                        warn!(source = %source, reason = %reason, "source refused mid-read");
                        sink.record_refused_source(&source);
                    },
                    Ok(Err(e)) => {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    },
                    Err(_) => {
                        if fatal.is_none() {
                            fatal = Some(KgmError::Other(anyhow::anyhow!("reader thread panicked")));
                        }
                    },
                }
            }
            for handle in worker_handles {
                match handle.join() {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    },
                    Err(_) => {
                        if fatal.is_none() {
                            fatal = Some(KgmError::Other(anyhow::anyhow!("worker thread panicked")));
                        }
                    },
                }
            }
        });

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stream edge winners straight to the output table
    fn write_edges(
        &self,
        mut stream: MergedStream,
        schema: &Arc<Schema>,
        stats: &mut StatsCollector,
        node_ids: &HashSet<u64>,
        sink: &DiagnosticSink,
    ) -> Result<u64> {
        let mut writer = TableWriter::create(self.config.output.edge_path(), schema)?;
        for row in stream.by_ref() {
            let row = row?;
            check_dangling(&row, node_ids, sink);
            stats.observe_edge(&row);
            writer.write_row(&row)?;
        }
        let written = writer.finish()?;
        stream.cleanup()?;
        Ok(written)
    }

    /// Two-pass edge finish: stage the winners, derive transitive edges,
    /// then deduplicate winners plus derivations into the final table.
    #[allow(clippy::too_many_arguments)]
    fn write_edges_with_transitive(
        &self,
        mut stream: MergedStream,
        schema: &Arc<Schema>,
        stats: &mut StatsCollector,
        node_ids: &HashSet<u64>,
        sink: &Arc<DiagnosticSink>,
        spill: &SpillGuard,
        cancel: &CancelFlag,
    ) -> Result<u64> {
        let stage_path = spill.dir().join("edges-stage.tsv");
        let mut stage = TableWriter::create(&stage_path, schema)?;
        let second = PartitionedDedup::create(
            spill.dir().join("edges-final"),
            PARTITION_FANOUT,
            EdgeDedupPolicy::new(self.config.dedup.clone()),
            Arc::clone(schema),
            self.config.memory.partition_bytes,
        )?;
        for row in stream.by_ref() {
            let row = row?;
            stage.write_row(&row)?;
            second.add(&row)?;
        }
        stage.finish()?;
        stream.cleanup()?;

        let mut derived_seq = 0u64;
        for spec in &self.config.transitive_relations {
            let pairs = derive_transitive(spec, &stage_path)?;
            info!(relation = %spec.name, derived = pairs.len(), "transitive relation derived");
            for (subject, object) in pairs {
                let mut values = vec![String::new(); schema.len()];
                if let Some(pos) = schema.position("subject") {
                    values[pos] = subject;
                }
                if let Some(pos) = schema.position("predicate") {
                    values[pos] = spec.predicate.clone();
                }
                if let Some(pos) = schema.position("object") {
                    values[pos] = object;
                }
                let row = Row::new(
                    Arc::clone(schema),
                    values,
                    Provenance {
                        source: format!("derived:{}", spec.name),
                        rank: self.config.sources.len() as u32,
                        path: stage_path.display().to_string(),
                        line: 0,
                    },
                    OrderKey {
                        source_index: u32::MAX,
                        row_seq: derived_seq,
                    },
                );
                derived_seq += 1;
                second.add(&row)?;
            }
        }

        let (final_stream, _) = second
            .finish()?
            .merge_excluding(cancel.as_atomic(), &HashSet::new())?;
        self.write_edges(final_stream, schema, stats, node_ids, sink)
    }

    /// Evaluate chains in parallel; they are independent by construction
    fn evaluate_chains(
        &self,
        chains: &[crate::config::ChainSpec],
        spill_dir: PathBuf,
    ) -> Result<BTreeMap<String, u64>> {
        let edge_path = self.config.output.edge_path();
        let results: Vec<(String, u64)> = chains
            .par_iter()
            .map(|spec| {
                evaluate_chain(
                    spec,
                    &edge_path,
                    &spill_dir,
                    &self.config.output.dir,
                    &self.config.output.chain_file_prefix,
                    self.config.memory.partition_bytes as usize,
                )
                .map(|out| (spec.name.clone(), out.rows))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(results.into_iter().collect())
    }

    // ------------------------------------------------------------------
    // Partial runs
    // ------------------------------------------------------------------

    /// `--only stats`: re-emit statistics from the existing merged tables
    fn run_stats_only(&self, options: &RunOptions) -> Result<MergeReport> {
        let sink = Arc::new(DiagnosticSink::new());
        let mut stats = StatsCollector::new(&self.config.stats);
        let mut node_ids: HashSet<u64> = HashSet::new();

        let mut nodes_written = 0u64;
        for row in read_merged_table(self.config.output.node_path(), TableKind::Nodes)? {
            let row = row?;
            node_ids.insert(id_hash(row.get("id")));
            stats.observe_node(&row);
            nodes_written += 1;
        }
        let mut edges_written = 0u64;
        for row in read_merged_table(self.config.output.edge_path(), TableKind::Edges)? {
            let row = row?;
            check_dangling(&row, &node_ids, &sink);
            stats.observe_edge(&row);
            edges_written += 1;
        }

        let checksums = output_checksums(
            [
                self.config.output.node_path(),
                self.config.output.edge_path(),
            ]
            .iter()
            .map(|p| p.as_path()),
        )?;
        let snapshot = sink.snapshot();
        let doc = stats.finalize(snapshot, vec![], checksums);
        write_stats(&self.config.output.stats_path(), &doc)?;

        if options.strict && snapshot.dangling_refs > 0 {
            let first = sink
                .first_detail(DiagnosticKind::DanglingRef)
                .map(|d| format!("{} ({}:{})", d.message, d.path, d.line))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(KgmError::DanglingReferences {
                count: snapshot.dangling_refs,
                first,
            });
        }

        Ok(MergeReport {
            nodes_written,
            edges_written,
            chains: BTreeMap::new(),
            diagnostics: snapshot,
            refused_sources: vec![],
            node_path: self.config.output.node_path(),
            edge_path: self.config.output.edge_path(),
        })
    }

    /// `--only chain=<name>`: re-run one projection over the merged edges
    fn run_single_chain(&self, name: &str, options: &RunOptions) -> Result<MergeReport> {
        let spec = self.config.chain(name).ok_or_else(|| {
            KgmError::config(
                format!("unknown chain '{}'", name),
                "Declare the chain under 'chains' in the configuration",
            )
        })?;
        let spill = SpillGuard::prepare(&self.config.memory.spill_dir, options.resume)?;
        let out = evaluate_chain(
            spec,
            &self.config.output.edge_path(),
            spill.dir(),
            &self.config.output.dir,
            &self.config.output.chain_file_prefix,
            self.config.memory.partition_bytes as usize,
        )?;
        spill.cleanup()?;

        let mut chains = BTreeMap::new();
        chains.insert(spec.name.clone(), out.rows);
        Ok(MergeReport {
            nodes_written: 0,
            edges_written: 0,
            chains,
            diagnostics: Default::default(),
            refused_sources: vec![],
            node_path: self.config.output.node_path(),
            edge_path: self.config.output.edge_path(),
        })
    }
}

/// Union output schema across the prepared sources of one table
fn union_schema(kind: TableKind, sources: &[PreparedSource]) -> Arc<Schema> {
    let observed = sources
        .iter()
        .flat_map(|s| s.layout.columns.iter().map(|c| c.as_str()));
    Arc::new(Schema::for_table(kind, observed))
}

/// Stable per-process hash for the node id membership set
fn id_hash(id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

/// Count dangling endpoint references of an edge winner
fn check_dangling(row: &Row, node_ids: &HashSet<u64>, sink: &DiagnosticSink) {
    for column in ["subject", "object"] {
        let id = row.get(column);
        if id.is_empty() || node_ids.contains(&id_hash(id)) {
            continue;
        }
        if sink.snapshot().dangling_refs == 0 {
            sink.record(Diagnostic {
                kind: DiagnosticKind::DanglingRef,
                path: row.provenance().path.clone(),
                line: row.provenance().line,
                message: format!("edge references missing node '{}'", id),
            });
        } else {
            sink.count_dangling();
        }
    }
}

/// Read a previously merged table back as rows (for partial runs)
fn read_merged_table(
    path: PathBuf,
    kind: TableKind,
) -> Result<impl Iterator<Item = Result<Row>>> {
    let table = SourceTable {
        source: "merged".to_string(),
        rank: 0,
        source_index: 0,
        kind,
        path: path.clone(),
    };
    let extract_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let layout = prepare(&table, &extract_dir)?;
    let schema = Arc::new(Schema::for_table(
        kind,
        layout.columns.iter().map(|c| c.as_str()),
    ));
    let sink = Arc::new(DiagnosticSink::new());
    Ok(RowReader::new(table, layout, schema, sink))
}
