//! Shared diagnostic sink
//!
//! Row-level problems never abort the run: workers record them here and the
//! statistics emitter summarizes the counters at the end. The sink is shared
//! by every worker; counters are atomic, and the bounded detail buffer is
//! behind a mutex fed in coarse batches so workers rarely contend.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// How many detailed diagnostics are retained for the log; counters keep
/// exact totals past this point.
const DETAIL_CAP: usize = 1000;

/// Local buffer size before a worker flushes to the shared sink
const BATCH_SIZE: usize = 256;

/// What went wrong with a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Malformed row (wrong field count, embedded tab)
    ParseError,
    /// Required field empty after canonicalization
    DroppedInvalid,
    /// Edge references a node id absent from the merged output
    DanglingRef,
    /// Edge matched a pruned prefix pair
    PrunedEdge,
}

/// A single recorded problem
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub path: String,
    pub line: u64,
    pub message: String,
}

/// Exact totals, readable while workers are still running
#[derive(Debug, Default)]
pub struct Counters {
    pub parse_errors: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dangling_refs: AtomicU64,
    pub pruned_edges: AtomicU64,
    pub nodes_collapsed: AtomicU64,
    pub edges_collapsed: AtomicU64,
}

/// Snapshot of the counters for the statistics document
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub parse_errors: u64,
    pub dropped_invalid: u64,
    pub dangling_refs: u64,
    pub pruned_edges: u64,
    pub nodes_collapsed: u64,
    pub edges_collapsed: u64,
}

/// The shared sink
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    counters: Counters,
    details: Mutex<Vec<Diagnostic>>,
    refused_sources: Mutex<Vec<String>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one diagnostic immediately. Workers on hot paths should prefer
    /// [`DiagnosticBuffer`].
    pub fn record(&self, diag: Diagnostic) {
        self.bump(diag.kind, 1);
        self.push_details(std::iter::once(diag));
    }

    /// Record a batch from a worker-local buffer
    pub fn record_batch(&self, batch: Vec<Diagnostic>) {
        for diag in &batch {
            self.bump(diag.kind, 1);
        }
        self.push_details(batch.into_iter());
    }

    /// A source was refused entirely (schema violation or read error)
    pub fn record_refused_source(&self, name: &str) {
        let mut refused = self.refused_sources.lock().unwrap_or_else(|e| e.into_inner());
        if !refused.iter().any(|s| s == name) {
            refused.push(name.to_string());
        }
    }

    /// Count collapsed duplicates without detail records
    pub fn add_collapsed(&self, nodes: bool, by: u64) {
        let counter = if nodes {
            &self.counters.nodes_collapsed
        } else {
            &self.counters.edges_collapsed
        };
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Count a dangling reference without a detail record
    pub fn count_dangling(&self) {
        self.counters.dangling_refs.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(&self, kind: DiagnosticKind, by: u64) {
        let counter = match kind {
            DiagnosticKind::ParseError => &self.counters.parse_errors,
            DiagnosticKind::DroppedInvalid => &self.counters.dropped_invalid,
            DiagnosticKind::DanglingRef => &self.counters.dangling_refs,
            DiagnosticKind::PrunedEdge => &self.counters.pruned_edges,
        };
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn push_details(&self, diags: impl Iterator<Item = Diagnostic>) {
        let mut details = self.details.lock().unwrap_or_else(|e| e.into_inner());
        for diag in diags {
            if details.len() >= DETAIL_CAP {
                break;
            }
            tracing::warn!(
                kind = ?diag.kind,
                path = %diag.path,
                line = diag.line,
                "{}",
                diag.message
            );
            details.push(diag);
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            parse_errors: self.counters.parse_errors.load(Ordering::Relaxed),
            dropped_invalid: self.counters.dropped_invalid.load(Ordering::Relaxed),
            dangling_refs: self.counters.dangling_refs.load(Ordering::Relaxed),
            pruned_edges: self.counters.pruned_edges.load(Ordering::Relaxed),
            nodes_collapsed: self.counters.nodes_collapsed.load(Ordering::Relaxed),
            edges_collapsed: self.counters.edges_collapsed.load(Ordering::Relaxed),
        }
    }

    pub fn refused_sources(&self) -> Vec<String> {
        self.refused_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// First recorded dangling reference, for strict-mode reporting
    pub fn first_detail(&self, kind: DiagnosticKind) -> Option<Diagnostic> {
        self.details
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|d| d.kind == kind)
            .cloned()
    }
}

/// Worker-local buffer that flushes to the sink in batches
pub struct DiagnosticBuffer<'a> {
    sink: &'a DiagnosticSink,
    pending: Vec<Diagnostic>,
}

impl<'a> DiagnosticBuffer<'a> {
    pub fn new(sink: &'a DiagnosticSink) -> Self {
        Self {
            sink,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.pending.push(diag);
        if self.pending.len() >= BATCH_SIZE {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.sink.record_batch(std::mem::take(&mut self.pending));
        }
    }
}

impl Drop for DiagnosticBuffer<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(kind: DiagnosticKind, line: u64) -> Diagnostic {
        Diagnostic {
            kind,
            path: "nodes.tsv".into(),
            line,
            message: "test".into(),
        }
    }

    #[test]
    fn test_counters_track_kinds() {
        let sink = DiagnosticSink::new();
        sink.record(diag(DiagnosticKind::ParseError, 3));
        sink.record(diag(DiagnosticKind::ParseError, 4));
        sink.record(diag(DiagnosticKind::DroppedInvalid, 5));
        let snap = sink.snapshot();
        assert_eq!(snap.parse_errors, 2);
        assert_eq!(snap.dropped_invalid, 1);
        assert_eq!(snap.dangling_refs, 0);
    }

    #[test]
    fn test_buffer_flushes_on_drop() {
        let sink = DiagnosticSink::new();
        {
            let mut buffer = DiagnosticBuffer::new(&sink);
            buffer.push(diag(DiagnosticKind::PrunedEdge, 10));
        }
        assert_eq!(sink.snapshot().pruned_edges, 1);
    }

    #[test]
    fn test_refused_sources_deduplicate() {
        let sink = DiagnosticSink::new();
        sink.record_refused_source("uniprot");
        sink.record_refused_source("uniprot");
        assert_eq!(sink.refused_sources(), vec!["uniprot".to_string()]);
    }

    #[test]
    fn test_detail_cap_does_not_lose_counts() {
        let sink = DiagnosticSink::new();
        for i in 0..(DETAIL_CAP as u64 + 50) {
            sink.record(diag(DiagnosticKind::ParseError, i));
        }
        assert_eq!(sink.snapshot().parse_errors, DETAIL_CAP as u64 + 50);
    }
}
