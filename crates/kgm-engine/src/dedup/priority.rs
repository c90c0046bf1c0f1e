//! Priority rules for duplicate resolution
//!
//! Both tables resolve duplicates through a totally ordered key where
//! smaller is better. Ties fall back to the global first-occurrence order,
//! which makes the winner deterministic regardless of how worker threads
//! interleave partition appends.

use crate::config::DedupConfig;
use crate::model::Row;

/// Priority of a node row. Ordered ascending = better:
/// source rank, then presence of a name, then presence of a description,
/// then longer `xref`, then lexicographic source name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodePriority {
    rank: u32,
    missing_name: bool,
    missing_description: bool,
    /// Inverted length so that a longer xref sorts smaller
    xref_shortfall: u64,
    source: String,
}

impl NodePriority {
    pub fn of(row: &Row) -> Self {
        Self {
            rank: row.provenance().rank,
            missing_name: row.get("name").is_empty(),
            missing_description: row.get("description").is_empty(),
            xref_shortfall: u64::MAX - row.get("xref").len() as u64,
            source: row.provenance().source.clone(),
        }
    }
}

/// Priority of an edge row: the configured predicate rank. Unlisted
/// predicates share the bottom rank; the first-occurrence tie-break decides
/// among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EdgePriority {
    rank: u32,
}

impl EdgePriority {
    pub fn of(config: &DedupConfig, row: &Row) -> Self {
        Self {
            rank: config.predicate_rank(row.get("predicate")),
        }
    }
}
