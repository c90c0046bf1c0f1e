//! Statistics emitter
//!
//! A single pass over the merged node and edge streams produces a YAML
//! summary: totals, facet distributions over configured columns, per-source
//! contribution of dedup winners, the diagnostic counters, and SHA-256
//! checksums of every published file. Facet values are emitted by
//! descending count with a lexicographic tie-break, so the document is
//! byte-stable for identical inputs.

use chrono::Utc;
use kgm_common::{checksum, KgmError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::StatsConfig;
use crate::diagnostics::CounterSnapshot;
use crate::model::Row;

/// One facet value and its count
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FacetCount {
    pub value: String,
    pub count: u64,
}

/// Distribution of one column
#[derive(Debug, Clone, Serialize)]
pub struct FacetSection {
    pub column: String,
    pub values: Vec<FacetCount>,
}

/// Totals and facets for one table
#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub total: u64,
    pub facets: Vec<FacetSection>,
}

/// Winner contribution of one source
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceContribution {
    pub name: String,
    pub rank: u32,
    pub nodes: u64,
    pub edges: u64,
}

/// The diagnostics section of the stats document
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSection {
    pub parse_errors: u64,
    pub dropped_invalid: u64,
    pub dangling_refs: u64,
    pub pruned_edges: u64,
    pub nodes_collapsed: u64,
    pub edges_collapsed: u64,
    pub refused_sources: Vec<String>,
}

/// The complete statistics document
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub generated_at: String,
    pub nodes: TableStats,
    pub edges: TableStats,
    pub sources: Vec<SourceContribution>,
    pub diagnostics: DiagnosticsSection,
    pub checksums: BTreeMap<String, String>,
}

/// Streaming facet/total collector
#[derive(Debug)]
pub struct StatsCollector {
    node_facets: Vec<(String, HashMap<String, u64>)>,
    edge_facets: Vec<(String, HashMap<String, u64>)>,
    node_total: u64,
    edge_total: u64,
    per_source: BTreeMap<(u32, String), (u64, u64)>,
}

impl StatsCollector {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            node_facets: config
                .node_facets
                .iter()
                .map(|c| (c.clone(), HashMap::new()))
                .collect(),
            edge_facets: config
                .edge_facets
                .iter()
                .map(|c| (c.clone(), HashMap::new()))
                .collect(),
            node_total: 0,
            edge_total: 0,
            per_source: BTreeMap::new(),
        }
    }

    pub fn observe_node(&mut self, row: &Row) {
        self.node_total += 1;
        for (column, counts) in &mut self.node_facets {
            *counts.entry(row.get(column).to_string()).or_insert(0) += 1;
        }
        let key = (row.provenance().rank, row.provenance().source.clone());
        self.per_source.entry(key).or_insert((0, 0)).0 += 1;
    }

    pub fn observe_edge(&mut self, row: &Row) {
        self.edge_total += 1;
        for (column, counts) in &mut self.edge_facets {
            *counts.entry(row.get(column).to_string()).or_insert(0) += 1;
        }
        let key = (row.provenance().rank, row.provenance().source.clone());
        self.per_source.entry(key).or_insert((0, 0)).1 += 1;
    }

    /// Assemble the final document
    pub fn finalize(
        self,
        diagnostics: CounterSnapshot,
        refused_sources: Vec<String>,
        checksums: BTreeMap<String, String>,
    ) -> GraphStats {
        GraphStats {
            generated_at: Utc::now().to_rfc3339(),
            nodes: TableStats {
                total: self.node_total,
                facets: facet_sections(self.node_facets),
            },
            edges: TableStats {
                total: self.edge_total,
                facets: facet_sections(self.edge_facets),
            },
            sources: self
                .per_source
                .into_iter()
                .map(|((rank, name), (nodes, edges))| SourceContribution {
                    name,
                    rank,
                    nodes,
                    edges,
                })
                .collect(),
            diagnostics: DiagnosticsSection {
                parse_errors: diagnostics.parse_errors,
                dropped_invalid: diagnostics.dropped_invalid,
                dangling_refs: diagnostics.dangling_refs,
                pruned_edges: diagnostics.pruned_edges,
                nodes_collapsed: diagnostics.nodes_collapsed,
                edges_collapsed: diagnostics.edges_collapsed,
                refused_sources,
            },
            checksums,
        }
    }
}

fn facet_sections(facets: Vec<(String, HashMap<String, u64>)>) -> Vec<FacetSection> {
    facets
        .into_iter()
        .map(|(column, counts)| {
            let mut values: Vec<FacetCount> = counts
                .into_iter()
                .map(|(value, count)| FacetCount { value, count })
                .collect();
            // Descending count, lexicographic tie-break.
            values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
            FacetSection { column, values }
        })
        .collect()
}

/// Compute checksums for the named output files (missing files are skipped)
pub fn output_checksums<'a>(
    paths: impl IntoIterator<Item = &'a Path>,
) -> Result<BTreeMap<String, String>> {
    let mut sums = BTreeMap::new();
    for path in paths {
        if !path.exists() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        sums.insert(name, checksum::sha256_file(path)?);
    }
    Ok(sums)
}

/// Serialize the stats document to its YAML file
pub fn write_stats(path: &Path, stats: &GraphStats) -> Result<()> {
    let yaml = serde_yaml::to_string(stats)?;
    std::fs::write(path, yaml).map_err(|e| KgmError::write_error(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderKey, Provenance, Schema, TableKind};
    use std::sync::Arc;

    fn node(category: &str, source: &str, rank: u32) -> Row {
        let schema = Arc::new(Schema::for_table(TableKind::Nodes, []));
        let mut values = vec![String::new(); schema.len()];
        values[schema.position("id").unwrap()] = "X:1".into();
        values[schema.position("category").unwrap()] = category.into();
        values[schema.position("provided_by").unwrap()] = source.into();
        Row::new(
            schema,
            values,
            Provenance {
                source: source.into(),
                rank,
                path: "nodes.tsv".into(),
                line: 2,
            },
            OrderKey {
                source_index: rank,
                row_seq: 0,
            },
        )
    }

    #[test]
    fn test_facets_sorted_by_count_then_value() {
        let mut collector = StatsCollector::new(&StatsConfig::default());
        for _ in 0..3 {
            collector.observe_node(&node("biolink:ChemicalEntity", "a", 0));
        }
        collector.observe_node(&node("biolink:OrganismTaxon", "a", 0));
        collector.observe_node(&node("biolink:MolecularActivity", "a", 0));
        let stats = collector.finalize(CounterSnapshot::default(), vec![], BTreeMap::new());

        let categories = &stats.nodes.facets[0];
        assert_eq!(categories.column, "category");
        assert_eq!(categories.values[0].value, "biolink:ChemicalEntity");
        assert_eq!(categories.values[0].count, 3);
        // Tie between the two singles breaks lexicographically.
        assert_eq!(categories.values[1].value, "biolink:MolecularActivity");
        assert_eq!(categories.values[2].value, "biolink:OrganismTaxon");
    }

    #[test]
    fn test_per_source_contribution() {
        let mut collector = StatsCollector::new(&StatsConfig::default());
        collector.observe_node(&node("biolink:ChemicalEntity", "main", 0));
        collector.observe_node(&node("biolink:ChemicalEntity", "satellite", 1));
        collector.observe_node(&node("biolink:ChemicalEntity", "main", 0));
        let stats = collector.finalize(CounterSnapshot::default(), vec![], BTreeMap::new());
        assert_eq!(
            stats.sources,
            vec![
                SourceContribution {
                    name: "main".into(),
                    rank: 0,
                    nodes: 2,
                    edges: 0
                },
                SourceContribution {
                    name: "satellite".into(),
                    rank: 1,
                    nodes: 1,
                    edges: 0
                },
            ]
        );
    }

    #[test]
    fn test_yaml_has_expected_sections() {
        let collector = StatsCollector::new(&StatsConfig::default());
        let stats = collector.finalize(
            CounterSnapshot::default(),
            vec!["broken_source".into()],
            BTreeMap::new(),
        );
        let yaml = serde_yaml::to_string(&stats).unwrap();
        for section in ["generated_at", "nodes:", "edges:", "sources:", "diagnostics:", "checksums:"] {
            assert!(yaml.contains(section), "missing {}", section);
        }
        assert!(yaml.contains("broken_source"));
    }

    #[test]
    fn test_output_checksums_skip_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("nodes.tsv");
        std::fs::write(&present, "id\tcategory\n").unwrap();
        let missing = dir.path().join("edges.tsv");
        let sums = output_checksums([present.as_path(), missing.as_path()]).unwrap();
        assert_eq!(sums.len(), 1);
        assert!(sums.contains_key("nodes.tsv"));
    }
}
