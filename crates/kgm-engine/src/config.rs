//! Merge configuration (`merge.yaml`)
//!
//! The whole engine is driven by one declarative document. Every rewrite
//! table (prefixes, categories, predicate priority, exempt and pruned pairs)
//! lives here as an immutable value constructed at startup, so tests can
//! instantiate the engine with alternate tables.

use kgm_common::{KgmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Rank assigned to predicates absent from the priority table
pub const UNRANKED_PREDICATE: u32 = 6;

/// Top-level configuration for a merge run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Input sources in priority order (rank 0 first by convention)
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub canon: CanonConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    /// Chain projections evaluated after the merge
    #[serde(default)]
    pub chains: Vec<ChainSpec>,

    /// Transitive relations materialized into the merged edge table
    #[serde(default)]
    pub transitive_relations: Vec<TransitiveSpec>,

    #[serde(default)]
    pub stats: StatsConfig,

    pub output: OutputConfig,
}

/// One logical source: a nodes file and an edges file plus a rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Smaller = higher priority in node dedup
    pub rank: u32,
    pub nodes_path: PathBuf,
    pub edges_path: PathBuf,
}

/// Deduplication tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Predicate -> rank overrides; unlisted predicates get
    /// [`UNRANKED_PREDICATE`] and fall back to insertion order.
    pub predicate_priority: BTreeMap<String, u32>,

    /// `(subject_prefix, object_prefix)` pairs for which one edge per
    /// distinct predicate is retained
    pub fanout_exempt_pairs: Vec<(String, String)>,

    /// `(subject_prefix, object_prefix)` pairs dropped unconditionally
    pub pruned_pairs: Vec<(String, String)>,

    /// Order of set-valued node fields in the output
    pub set_union_order: SetUnionOrder,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            predicate_priority: default_predicate_priority(),
            fanout_exempt_pairs: vec![
                ("NCBITaxon".to_string(), "CHEBI".to_string()),
                ("RHEA".to_string(), "CHEBI".to_string()),
            ],
            pruned_pairs: vec![("UniprotKB".to_string(), "NCBITaxon".to_string())],
            set_union_order: SetUnionOrder::Sorted,
        }
    }
}

impl DedupConfig {
    /// Rank of a predicate; unlisted predicates share the lowest rank and
    /// are broken by insertion order.
    pub fn predicate_rank(&self, predicate: &str) -> u32 {
        self.predicate_priority
            .get(predicate)
            .copied()
            .unwrap_or(UNRANKED_PREDICATE)
    }

    pub fn is_fanout_exempt(&self, subject_prefix: &str, object_prefix: &str) -> bool {
        self.fanout_exempt_pairs
            .iter()
            .any(|(s, o)| s == subject_prefix && o == object_prefix)
    }

    pub fn is_pruned(&self, subject_prefix: &str, object_prefix: &str) -> bool {
        self.pruned_pairs
            .iter()
            .any(|(s, o)| s == subject_prefix && o == object_prefix)
    }
}

fn default_predicate_priority() -> BTreeMap<String, u32> {
    [
        ("biolink:has_chemical_role", 1),
        ("biolink:subclass_of", 2),
        ("biolink:capable_of", 3),
        ("METPO:2000103", 3),
        ("biolink:can_be_carried_out_by", 4),
        ("biolink:superclass_of", 5),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Output order of merged set-valued fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SetUnionOrder {
    /// Lexicographic, for deterministic artifacts
    #[default]
    Sorted,
    /// First-seen order, for consumers that depend on it
    Insertion,
}

/// Canonicalization tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonConfig {
    /// Legacy prefix -> canonical prefix (entries include the trailing colon)
    pub prefix_map: BTreeMap<String, String>,

    /// Deprecated category -> canonical category
    pub category_map: BTreeMap<String, String>,

    /// Identifier prefix -> category adopted by every node with that prefix
    pub prefix_category_map: BTreeMap<String, String>,
}

impl Default for CanonConfig {
    fn default() -> Self {
        let prefix_map = [
            ("medium:", "mediadive.medium:"),
            ("solution:", "mediadive.solution:"),
            ("ingredient:", "mediadive.ingredient:"),
            ("strain:", "kgmicrobe.strain:"),
            ("ec:", "EC:"),
            ("eccode:", "EC:"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let category_map = [("biolink:ChemicalSubstance", "biolink:ChemicalEntity")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let prefix_category_map = [
            ("EC", "biolink:MolecularActivity"),
            ("mediadive.medium", "METPO:1004005"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            prefix_map,
            category_map,
            prefix_category_map,
        }
    }
}

impl CanonConfig {
    /// Merge user-supplied additions over the defaults
    pub fn with_additions(mut self, additions: &CanonConfig) -> Self {
        for (k, v) in &additions.prefix_map {
            self.prefix_map.insert(k.clone(), v.clone());
        }
        for (k, v) in &additions.category_map {
            self.category_map.insert(k.clone(), v.clone());
        }
        for (k, v) in &additions.prefix_category_map {
            self.prefix_category_map.insert(k.clone(), v.clone());
        }
        self
    }
}

/// Memory budget and spill placement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Target maximum bytes held in memory per dedup partition
    pub partition_bytes: u64,

    /// Directory for partition run files and chain temporaries
    pub spill_dir: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            partition_bytes: 256 * 1024 * 1024,
            spill_dir: PathBuf::from("spill"),
        }
    }
}

/// One hop of a chain projection.
///
/// A hop matches merged edges whose subject has prefix `from` and object has
/// prefix `to`; with `reverse: true` the stored edge runs `to -> from` and is
/// followed backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainHop {
    pub from: String,
    pub to: String,
    /// Restrict the hop to one predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Follow edges stored in the opposite direction
    #[serde(default)]
    pub reverse: bool,
}

/// A declared chain projection, e.g. Taxon-to-CHEBI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub hops: Vec<ChainHop>,
}

/// A transitive relation to materialize: wherever `A -> B` and `B -> C`
/// exist with the same predicate, derive `A -> C`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitiveSpec {
    pub name: String,
    pub subject_prefix: String,
    pub intermediate_prefix: String,
    pub predicate: String,
    pub object_prefixes: Vec<String>,
}

/// Statistics facets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub node_facets: Vec<String>,
    pub edge_facets: Vec<String>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            node_facets: vec!["category".to_string(), "provided_by".to_string()],
            edge_facets: vec![
                "predicate".to_string(),
                "primary_knowledge_source".to_string(),
            ],
        }
    }
}

/// Output file layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    #[serde(default = "default_node_file")]
    pub node_file: String,
    #[serde(default = "default_edge_file")]
    pub edge_file: String,
    #[serde(default = "default_stats_file")]
    pub stats_file: String,
    #[serde(default = "default_chain_prefix")]
    pub chain_file_prefix: String,
}

fn default_node_file() -> String {
    "merged-kg_nodes.tsv".to_string()
}

fn default_edge_file() -> String {
    "merged-kg_edges.tsv".to_string()
}

fn default_stats_file() -> String {
    "merged-kg_stats.yaml".to_string()
}

fn default_chain_prefix() -> String {
    "chain".to_string()
}

impl OutputConfig {
    pub fn node_path(&self) -> PathBuf {
        self.dir.join(&self.node_file)
    }

    pub fn edge_path(&self) -> PathBuf {
        self.dir.join(&self.edge_file)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.dir.join(&self.stats_file)
    }
}

impl MergeConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KgmError::config(
                format!("cannot read '{}': {}", path.display(), e),
                "Check the --config path",
            )
        })?;
        let mut config: MergeConfig = serde_yaml::from_str(&content)?;
        // User tables extend the defaults rather than replacing them.
        config.canon = CanonConfig::default().with_additions(&config.canon);
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the type system cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(KgmError::config(
                "no sources defined",
                "Add at least one entry under 'sources'",
            ));
        }
        let mut names: Vec<&str> = self.sources.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.sources.len() {
            return Err(KgmError::config(
                "duplicate source names",
                "Every source needs a unique 'name'",
            ));
        }
        for chain in &self.chains {
            if chain.hops.is_empty() {
                return Err(KgmError::config(
                    format!("chain '{}' has no hops", chain.name),
                    "Declare at least one hop per chain",
                ));
            }
            for pair in chain.hops.windows(2) {
                if pair[0].to != pair[1].from {
                    return Err(KgmError::config(
                        format!(
                            "chain '{}' is not connected: hop to '{}' followed by hop from '{}'",
                            chain.name, pair[0].to, pair[1].from
                        ),
                        "Each hop's 'from' must equal the previous hop's 'to'",
                    ));
                }
            }
        }
        if self.memory.partition_bytes < 1024 * 1024 {
            return Err(KgmError::config(
                "memory.partition_bytes below 1 MiB",
                "Raise the partition budget; tiny partitions thrash the spill directory",
            ));
        }
        Ok(())
    }

    /// Find a chain by name (for `--only chain=<name>`)
    pub fn chain(&self, name: &str) -> Option<&ChainSpec> {
        self.chains.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
sources:
  - name: ontologies
    rank: 0
    nodes_path: data/ontologies_nodes.tsv
    edges_path: data/ontologies_edges.tsv
output:
  dir: data/merged
"#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: MergeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.output.node_file, "merged-kg_nodes.tsv");
        assert_eq!(config.dedup.predicate_rank("biolink:subclass_of"), 2);
        assert_eq!(config.dedup.predicate_rank("biolink:related_to"), 6);
        assert!(config.dedup.is_fanout_exempt("NCBITaxon", "CHEBI"));
        assert!(config.dedup.is_pruned("UniprotKB", "NCBITaxon"));
    }

    #[test]
    fn test_canon_additions_extend_defaults() {
        let additions: CanonConfig = serde_yaml::from_str(
            r#"
prefix_map:
  "kegg:": "KEGG:"
"#,
        )
        .unwrap();
        let merged = CanonConfig::default().with_additions(&additions);
        assert_eq!(merged.prefix_map.get("kegg:").unwrap(), "KEGG:");
        assert_eq!(merged.prefix_map.get("medium:").unwrap(), "mediadive.medium:");
    }

    #[test]
    fn test_empty_sources_rejected() {
        let config: std::result::Result<MergeConfig, _> = serde_yaml::from_str(
            r#"
sources: []
output:
  dir: out
"#,
        );
        let config = config.unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disconnected_chain_rejected() {
        let mut config: MergeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.chains.push(ChainSpec {
            name: "broken".into(),
            hops: vec![
                ChainHop {
                    from: "NCBITaxon".into(),
                    to: "Proteomes".into(),
                    predicate: None,
                    reverse: true,
                },
                ChainHop {
                    from: "UniprotKB".into(),
                    to: "RHEA".into(),
                    predicate: None,
                    reverse: false,
                },
            ],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_predicate_priority_override() {
        let mut config: MergeConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config
            .dedup
            .predicate_priority
            .insert("biolink:related_to".into(), 1);
        assert_eq!(config.dedup.predicate_rank("biolink:related_to"), 1);
    }
}
