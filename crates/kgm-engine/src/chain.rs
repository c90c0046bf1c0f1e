//! Chain reducer
//!
//! Materializes derived relations by joining the merged edge table along a
//! declared sequence of hops, e.g. Taxon back through Proteomes and UniProt
//! out to RHEA and CHEBI. A chain of length L is evaluated as a left-deep
//! sequence of hash joins; every intermediate relation spills to
//! hash-partitioned pair files once it outgrows the memory budget, so peak
//! memory stays bounded no matter how wide a hop fans out.
//!
//! The output is the distinct set of `(start_id, end_id)` pairs after
//! projection. When the distinct set itself exceeds the budget the final
//! relation is emitted in hash-partitioned shards; consumers treat the
//! shards as a set union.

use kgm_common::{curie, KgmError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{ChainHop, ChainSpec};
use crate::dedup::partition::partition_index;

/// Shard fanout once a relation spills
const JOIN_FANOUT: usize = 16;

/// Result of one chain projection
#[derive(Debug)]
pub struct ChainOutput {
    /// Output shard paths; one entry unless the distinct set spilled
    pub files: Vec<PathBuf>,
    pub rows: u64,
}

/// Streaming view of the merged edge table as `(subject, predicate, object)`
pub struct EdgeTriples {
    reader: BufReader<File>,
    subject_pos: usize,
    predicate_pos: usize,
    object_pos: usize,
    path: PathBuf,
}

impl EdgeTriples {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let columns: Vec<&str> = header.trim_end_matches(['\n', '\r']).split('\t').collect();
        let find = |name: &str| {
            columns
                .iter()
                .position(|c| *c == name)
                .ok_or_else(|| {
                    KgmError::config(
                        format!("'{}' lacks a '{}' column", path.display(), name),
                        "Point the chain reducer at a merged edge table",
                    )
                })
        };
        Ok(Self {
            subject_pos: find("subject")?,
            predicate_pos: find("predicate")?,
            object_pos: find("object")?,
            reader,
            path,
        })
    }
}

impl Iterator for EdgeTriples {
    type Item = Result<(String, String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {},
                Err(e) => return Some(Err(e.into())),
            }
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let max = self.subject_pos.max(self.predicate_pos).max(self.object_pos);
            if fields.len() <= max {
                warn!(path = %self.path.display(), "short row in merged edge table, skipping");
                continue;
            }
            return Some(Ok((
                fields[self.subject_pos].to_string(),
                fields[self.predicate_pos].to_string(),
                fields[self.object_pos].to_string(),
            )));
        }
    }
}

/// Does an edge participate in this hop, and if so what `(from, to)` pair
/// does it contribute? Empty identifiers never match.
fn hop_pair(hop: &ChainHop, subject: &str, predicate: &str, object: &str) -> Option<(String, String)> {
    if subject.is_empty() || object.is_empty() {
        return None;
    }
    if let Some(wanted) = &hop.predicate {
        if predicate != wanted {
            return None;
        }
    }
    if hop.reverse {
        // Stored edge runs to -> from; follow it backwards.
        (curie::has_prefix(subject, &hop.to) && curie::has_prefix(object, &hop.from))
            .then(|| (object.to_string(), subject.to_string()))
    } else {
        (curie::has_prefix(subject, &hop.from) && curie::has_prefix(object, &hop.to))
            .then(|| (subject.to_string(), object.to_string()))
    }
}

// ============================================================================
// Spillable pair relation
// ============================================================================

/// An intermediate relation of `(start, end)` pairs. Lives in memory until
/// the byte budget is exceeded, then spills into pair files partitioned by
/// `hash(end)` so the next join can proceed partition-wise.
enum Pairs {
    Mem(Vec<(String, String)>),
    Disk { parts: Vec<PathBuf> },
}

/// Accumulates pairs, spilling transparently
struct PairsBuilder {
    mem: Vec<(String, String)>,
    bytes: usize,
    budget: usize,
    spill_dir: PathBuf,
    label: String,
    writers: Option<Vec<BufWriter<File>>>,
    part_paths: Vec<PathBuf>,
}

impl PairsBuilder {
    fn new(budget: usize, spill_dir: &Path, label: impl Into<String>) -> Self {
        Self {
            mem: Vec::new(),
            bytes: 0,
            budget,
            spill_dir: spill_dir.to_path_buf(),
            label: label.into(),
            writers: None,
            part_paths: Vec::new(),
        }
    }

    fn push(&mut self, start: String, end: String) -> Result<()> {
        if let Some(writers) = self.writers.as_mut() {
            let idx = partition_index(&end, 0, JOIN_FANOUT);
            let path = &self.part_paths[idx];
            writeln!(writers[idx], "{}\t{}", start, end)
                .map_err(|e| KgmError::write_error(e, path))?;
            return Ok(());
        }
        self.bytes += start.len() + end.len() + 48;
        self.mem.push((start, end));
        if self.bytes > self.budget {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        debug!(label = %self.label, bytes = self.bytes, "intermediate relation over budget, spilling");
        std::fs::create_dir_all(&self.spill_dir)?;
        let mut writers = Vec::with_capacity(JOIN_FANOUT);
        for idx in 0..JOIN_FANOUT {
            let path = self
                .spill_dir
                .join(format!("{}-pairs-{:02}.tsv", self.label, idx));
            let file = File::create(&path).map_err(|e| KgmError::write_error(e, &path))?;
            writers.push(BufWriter::new(file));
            self.part_paths.push(path);
        }
        for (start, end) in std::mem::take(&mut self.mem) {
            let idx = partition_index(&end, 0, JOIN_FANOUT);
            let path = &self.part_paths[idx];
            writeln!(writers[idx], "{}\t{}", start, end)
                .map_err(|e| KgmError::write_error(e, path))?;
        }
        self.writers = Some(writers);
        Ok(())
    }

    fn finish(self) -> Result<Pairs> {
        match self.writers {
            None => Ok(Pairs::Mem(self.mem)),
            Some(writers) => {
                for (mut writer, path) in writers.into_iter().zip(&self.part_paths) {
                    writer.flush().map_err(|e| KgmError::write_error(e, path))?;
                }
                Ok(Pairs::Disk {
                    parts: self.part_paths,
                })
            },
        }
    }
}

fn read_pairs(path: &Path) -> Result<impl Iterator<Item = Result<(String, String)>>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().map(|line| {
        let line = line?;
        match line.split_once('\t') {
            Some((a, b)) => Ok((a.to_string(), b.to_string())),
            None => Err(KgmError::Other(anyhow::anyhow!(
                "malformed pair line in spill file"
            ))),
        }
    }))
}

// ============================================================================
// Chain evaluation
// ============================================================================

/// Evaluate one chain specification against a merged edge table.
///
/// `spill_dir` receives intermediate pair files; `out_dir` receives the
/// final `<prefix>_<name>[.partN].tsv` shard(s).
pub fn evaluate_chain(
    spec: &ChainSpec,
    edge_path: &Path,
    spill_dir: &Path,
    out_dir: &Path,
    file_prefix: &str,
    budget_bytes: usize,
) -> Result<ChainOutput> {
    info!(chain = %spec.name, hops = spec.hops.len(), "evaluating chain");
    let chain_spill = spill_dir.join(format!("chain-{}", spec.name));
    std::fs::create_dir_all(&chain_spill)?;

    // Seed relation from the first hop.
    let mut frontier = {
        let mut builder = PairsBuilder::new(budget_bytes, &chain_spill, "hop0");
        for triple in EdgeTriples::open(edge_path)? {
            let (s, p, o) = triple?;
            if let Some((from, to)) = hop_pair(&spec.hops[0], &s, &p, &o) {
                builder.push(from, to)?;
            }
        }
        builder.finish()?
    };

    // Left-deep joins for the remaining hops.
    for (i, hop) in spec.hops.iter().enumerate().skip(1) {
        let label = format!("hop{}", i);
        frontier = join_hop(frontier, hop, edge_path, &chain_spill, &label, budget_bytes)?;
    }

    let (files, rows) = write_distinct(spec, frontier, out_dir, file_prefix, budget_bytes)?;
    if rows == 0 {
        warn!(chain = %spec.name, "chain produced no rows");
    } else {
        info!(chain = %spec.name, rows, shards = files.len(), "chain complete");
    }
    Ok(ChainOutput { files, rows })
}

/// Join the current frontier with one hop of the chain
fn join_hop(
    frontier: Pairs,
    hop: &ChainHop,
    edge_path: &Path,
    spill_dir: &Path,
    label: &str,
    budget_bytes: usize,
) -> Result<Pairs> {
    let mut next = PairsBuilder::new(budget_bytes, spill_dir, label);
    match frontier {
        Pairs::Mem(pairs) => {
            // Index the frontier by its end column, then stream the edges.
            let mut by_end: HashMap<String, Vec<String>> = HashMap::new();
            for (start, end) in pairs {
                by_end.entry(end).or_default().push(start);
            }
            for triple in EdgeTriples::open(edge_path)? {
                let (s, p, o) = triple?;
                if let Some((from, to)) = hop_pair(hop, &s, &p, &o) {
                    if let Some(starts) = by_end.get(&from) {
                        for start in starts {
                            next.push(start.clone(), to.clone())?;
                        }
                    }
                }
            }
        },
        Pairs::Disk { parts } => {
            // Grace join: partition the hop's edges the same way the
            // frontier already is, then join slice by slice.
            let hop_dir = spill_dir.join(format!("{}-probe", label));
            std::fs::create_dir_all(&hop_dir)?;
            let mut writers = Vec::with_capacity(JOIN_FANOUT);
            let mut hop_paths = Vec::with_capacity(JOIN_FANOUT);
            for idx in 0..JOIN_FANOUT {
                let path = hop_dir.join(format!("part-{:02}.tsv", idx));
                let file = File::create(&path).map_err(|e| KgmError::write_error(e, &path))?;
                writers.push(BufWriter::new(file));
                hop_paths.push(path);
            }
            for triple in EdgeTriples::open(edge_path)? {
                let (s, p, o) = triple?;
                if let Some((from, to)) = hop_pair(hop, &s, &p, &o) {
                    let idx = partition_index(&from, 0, JOIN_FANOUT);
                    writeln!(writers[idx], "{}\t{}", from, to)
                        .map_err(|e| KgmError::write_error(e, &hop_paths[idx]))?;
                }
            }
            for (mut writer, path) in writers.into_iter().zip(&hop_paths) {
                writer.flush().map_err(|e| KgmError::write_error(e, path))?;
            }

            for (part_idx, frontier_part) in parts.iter().enumerate() {
                let mut by_end: HashMap<String, Vec<String>> = HashMap::new();
                for pair in read_pairs(frontier_part)? {
                    let (start, end) = pair?;
                    by_end.entry(end).or_default().push(start);
                }
                for pair in read_pairs(&hop_paths[part_idx])? {
                    let (from, to) = pair?;
                    if let Some(starts) = by_end.get(&from) {
                        for start in starts {
                            next.push(start.clone(), to.clone())?;
                        }
                    }
                }
                std::fs::remove_file(frontier_part)?;
            }
            for path in &hop_paths {
                std::fs::remove_file(path)?;
            }
        },
    }
    next.finish()
}

/// Project the final relation to its distinct pair set and write shard(s)
fn write_distinct(
    spec: &ChainSpec,
    frontier: Pairs,
    out_dir: &Path,
    file_prefix: &str,
    budget_bytes: usize,
) -> Result<(Vec<PathBuf>, u64)> {
    std::fs::create_dir_all(out_dir)?;
    let header = format!(
        "{}_id\t{}_id",
        spec.hops[0].from.to_lowercase(),
        spec.hops[spec.hops.len() - 1].to.to_lowercase()
    );

    match frontier {
        Pairs::Mem(pairs) => {
            let distinct: BTreeSet<(String, String)> = pairs.into_iter().collect();
            let path = out_dir.join(format!("{}_{}.tsv", file_prefix, spec.name));
            let rows = write_pair_file(&path, &header, distinct.iter())?;
            Ok((vec![path], rows))
        },
        Pairs::Disk { parts } => {
            // Each partition holds a disjoint slice of end ids, so distinct
            // can be taken per shard. Shards count from 1 in file names.
            let mut files = Vec::new();
            let mut total = 0u64;
            let mut shard = 0usize;
            for part in &parts {
                let mut distinct: HashSet<(String, String)> = HashSet::new();
                let mut bytes = 0usize;
                for pair in read_pairs(part)? {
                    let pair = pair?;
                    bytes += pair.0.len() + pair.1.len() + 48;
                    distinct.insert(pair);
                    if bytes > budget_bytes.saturating_mul(2) {
                        warn!(chain = %spec.name, "distinct set exceeds twice the budget within one shard");
                    }
                }
                std::fs::remove_file(part)?;
                if distinct.is_empty() {
                    continue;
                }
                shard += 1;
                let mut sorted: Vec<&(String, String)> = distinct.iter().collect();
                sorted.sort();
                let path = out_dir.join(format!("{}_{}.part{}.tsv", file_prefix, spec.name, shard));
                total += write_pair_file(&path, &header, sorted.into_iter())?;
                files.push(path);
            }
            if files.is_empty() {
                // Preserve the single-file shape for empty results.
                let path = out_dir.join(format!("{}_{}.tsv", file_prefix, spec.name));
                write_pair_file(&path, &header, std::iter::empty::<&(String, String)>())?;
                files.push(path);
            }
            Ok((files, total))
        },
    }
}

fn write_pair_file<'a>(
    path: &Path,
    header: &str,
    pairs: impl Iterator<Item = &'a (String, String)>,
) -> Result<u64> {
    let file = File::create(path).map_err(|e| KgmError::write_error(e, path))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", header).map_err(|e| KgmError::write_error(e, path))?;
    let mut rows = 0u64;
    for (a, b) in pairs {
        writeln!(writer, "{}\t{}", a, b).map_err(|e| KgmError::write_error(e, path))?;
        rows += 1;
    }
    writer.flush().map_err(|e| KgmError::write_error(e, path))?;
    Ok(rows)
}

// ============================================================================
// Transitive relation derivation
// ============================================================================

/// Derive `A -> C` triples wherever `A -> B` and `B -> C` exist with the
/// same predicate. Returns `(subject, object)` pairs to append as edges
/// carrying the spec's predicate; deduplication against existing edges is
/// the caller's job.
pub fn derive_transitive(
    spec: &crate::config::TransitiveSpec,
    edge_path: &Path,
) -> Result<Vec<(String, String)>> {
    // B -> A for every A -> B with the spec's predicate.
    let mut subject_of: HashMap<String, Vec<String>> = HashMap::new();
    for triple in EdgeTriples::open(edge_path)? {
        let (s, p, o) = triple?;
        if p == spec.predicate
            && curie::has_prefix(&s, &spec.subject_prefix)
            && curie::has_prefix(&o, &spec.intermediate_prefix)
        {
            subject_of.entry(o).or_default().push(s);
        }
    }

    let mut derived = Vec::new();
    for triple in EdgeTriples::open(edge_path)? {
        let (s, p, o) = triple?;
        if p != spec.predicate || !curie::has_prefix(&s, &spec.intermediate_prefix) {
            continue;
        }
        if !spec
            .object_prefixes
            .iter()
            .any(|prefix| curie::has_prefix(&o, prefix))
        {
            continue;
        }
        if let Some(subjects) = subject_of.get(&s) {
            for subject in subjects {
                derived.push((subject.clone(), o.clone()));
            }
        }
    }
    debug!(relation = %spec.name, derived = derived.len(), "transitive derivation complete");
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransitiveSpec;

    fn write_edges(dir: &Path, rows: &[(&str, &str, &str)]) -> PathBuf {
        let path = dir.join("merged_edges.tsv");
        let mut body = String::from("subject\tpredicate\tobject\n");
        for (s, p, o) in rows {
            body.push_str(&format!("{}\t{}\t{}\n", s, p, o));
        }
        std::fs::write(&path, body).unwrap();
        path
    }

    fn taxon_to_chebi() -> ChainSpec {
        ChainSpec {
            name: "taxon_to_chebi".into(),
            hops: vec![
                ChainHop {
                    from: "NCBITaxon".into(),
                    to: "Proteomes".into(),
                    predicate: None,
                    reverse: true,
                },
                ChainHop {
                    from: "Proteomes".into(),
                    to: "UniprotKB".into(),
                    predicate: None,
                    reverse: true,
                },
                ChainHop {
                    from: "UniprotKB".into(),
                    to: "RHEA".into(),
                    predicate: None,
                    reverse: false,
                },
                ChainHop {
                    from: "RHEA".into(),
                    to: "CHEBI".into(),
                    predicate: Some("biolink:has_output".into()),
                    reverse: false,
                },
            ],
        }
    }

    #[test]
    fn test_taxon_to_chebi_chain() {
        let dir = tempfile::tempdir().unwrap();
        let edges = write_edges(
            dir.path(),
            &[
                ("Proteomes:UP1", "biolink:derives_from", "NCBITaxon:562"),
                ("UniprotKB:X", "biolink:derives_from", "Proteomes:UP1"),
                ("UniprotKB:X", "biolink:participates_in", "RHEA:R1"),
                ("RHEA:R1", "biolink:has_output", "CHEBI:C1"),
                // Wrong predicate on the last hop; must not contribute.
                ("RHEA:R1", "biolink:has_input", "CHEBI:C9"),
            ],
        );
        let out = evaluate_chain(
            &taxon_to_chebi(),
            &edges,
            &dir.path().join("spill"),
            &dir.path().join("out"),
            "chain",
            64 * 1024 * 1024,
        )
        .unwrap();
        assert_eq!(out.rows, 1);
        let body = std::fs::read_to_string(&out.files[0]).unwrap();
        assert_eq!(body, "ncbitaxon_id\tchebi_id\nNCBITaxon:562\tCHEBI:C1\n");
    }

    #[test]
    fn test_missing_hop_omits_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let edges = write_edges(
            dir.path(),
            &[
                ("Proteomes:UP1", "biolink:derives_from", "NCBITaxon:562"),
                // No UniprotKB attachment to the proteome.
                ("UniprotKB:X", "biolink:participates_in", "RHEA:R1"),
                ("RHEA:R1", "biolink:has_output", "CHEBI:C1"),
            ],
        );
        let out = evaluate_chain(
            &taxon_to_chebi(),
            &edges,
            &dir.path().join("spill"),
            &dir.path().join("out"),
            "chain",
            64 * 1024 * 1024,
        )
        .unwrap();
        assert_eq!(out.rows, 0);
    }

    #[test]
    fn test_distinct_pairs_only() {
        let dir = tempfile::tempdir().unwrap();
        // Two UniProt entries on the same proteome and reaction collapse
        // into one (taxon, chemical) pair.
        let edges = write_edges(
            dir.path(),
            &[
                ("Proteomes:UP1", "biolink:derives_from", "NCBITaxon:562"),
                ("UniprotKB:X", "biolink:derives_from", "Proteomes:UP1"),
                ("UniprotKB:Y", "biolink:derives_from", "Proteomes:UP1"),
                ("UniprotKB:X", "biolink:participates_in", "RHEA:R1"),
                ("UniprotKB:Y", "biolink:participates_in", "RHEA:R1"),
                ("RHEA:R1", "biolink:has_output", "CHEBI:C1"),
            ],
        );
        let out = evaluate_chain(
            &taxon_to_chebi(),
            &edges,
            &dir.path().join("spill"),
            &dir.path().join("out"),
            "chain",
            64 * 1024 * 1024,
        )
        .unwrap();
        assert_eq!(out.rows, 1);
    }

    #[test]
    fn test_tiny_budget_spills_and_still_answers() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows: Vec<(String, String, String)> = Vec::new();
        for i in 0..50 {
            rows.push((
                format!("Proteomes:UP{}", i),
                "biolink:derives_from".into(),
                format!("NCBITaxon:{}", i),
            ));
            rows.push((
                format!("UniprotKB:P{}", i),
                "biolink:derives_from".into(),
                format!("Proteomes:UP{}", i),
            ));
            rows.push((
                format!("UniprotKB:P{}", i),
                "biolink:participates_in".into(),
                "RHEA:R1".into(),
            ));
        }
        rows.push(("RHEA:R1".into(), "biolink:has_output".into(), "CHEBI:C1".into()));
        let borrowed: Vec<(&str, &str, &str)> = rows
            .iter()
            .map(|(a, b, c)| (a.as_str(), b.as_str(), c.as_str()))
            .collect();
        let edges = write_edges(dir.path(), &borrowed);
        let out = evaluate_chain(
            &taxon_to_chebi(),
            &edges,
            &dir.path().join("spill"),
            &dir.path().join("out"),
            "chain",
            // Force spilling almost immediately.
            256,
        )
        .unwrap();
        assert_eq!(out.rows, 50);
        assert!(!out.files.is_empty());
    }

    #[test]
    fn test_self_loop_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let edges = write_edges(dir.path(), &[("GO:1", "biolink:related_to", "GO:1")]);
        let spec = ChainSpec {
            name: "go_loop".into(),
            hops: vec![ChainHop {
                from: "GO".into(),
                to: "GO".into(),
                predicate: None,
                reverse: false,
            }],
        };
        let out = evaluate_chain(
            &spec,
            &edges,
            &dir.path().join("spill"),
            &dir.path().join("out"),
            "chain",
            64 * 1024 * 1024,
        )
        .unwrap();
        assert_eq!(out.rows, 1);
    }

    #[test]
    fn test_transitive_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let edges = write_edges(
            dir.path(),
            &[
                ("kgmicrobe.strain:1", "biolink:location_of", "mediadive.medium:5"),
                ("mediadive.medium:5", "biolink:location_of", "CHEBI:99"),
                // Different predicate, must not chain.
                ("mediadive.medium:5", "biolink:has_part", "CHEBI:1"),
            ],
        );
        let spec = TransitiveSpec {
            name: "strain_to_chemical".into(),
            subject_prefix: "kgmicrobe.strain".into(),
            intermediate_prefix: "mediadive.medium".into(),
            predicate: "biolink:location_of".into(),
            object_prefixes: vec!["CHEBI".into()],
        };
        let derived = derive_transitive(&spec, &edges).unwrap();
        assert_eq!(
            derived,
            vec![("kgmicrobe.strain:1".to_string(), "CHEBI:99".to_string())]
        );
    }
}
