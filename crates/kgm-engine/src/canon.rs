//! Canonicalizer
//!
//! Normalizes identifier strings and category values so downstream equality
//! tests are well-defined. Without this pass, two logically identical rows
//! spelled differently would both survive deduplication.
//!
//! Transformations, in order:
//!
//! 1. Sanitization: carriage returns stripped everywhere; whitespace trimmed;
//!    URI-hostile characters in a CURIE's local part percent-encoded.
//! 2. Legacy IntEnz query URLs used as identifiers collapse to `EC:<code>`.
//! 3. Prefix rewriting (`medium:` -> `mediadive.medium:` and friends).
//! 4. Category canonicalization: deprecated names, then prefix-driven
//!    categories (EC nodes are `biolink:MolecularActivity`, media nodes are
//!    `METPO:1004005`).
//! 5. EC IRI rewriting to the canonical Expasy form.
//! 6. Validation: rows with an empty required field are dropped.
//!
//! The operation is pure, deterministic, and idempotent; all tables are
//! immutable configuration injected at construction.

use kgm_common::curie;

use crate::config::CanonConfig;
use crate::model::Row;

/// Characters that corrupt a downstream URI when left raw in a CURIE local
/// part. Kept aligned with the sanitizer the transforms run before export.
const URI_HOSTILE: &[char] = &['>', '<', '°', '[', ']', '{', '}', '|', '\\', '^', '`', '"'];

/// Canonical IRI base for EC activity nodes
const EC_IRI_BASE: &str = "https://enzyme.expasy.org/EC/";

/// Marker identifying a legacy IntEnz query URL
const INTENZ_MARKER: &str = "intenz";

/// Verdict of canonicalizing one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonOutcome {
    Keep,
    /// Required field empty after canonicalization; the row is dropped
    Drop(&'static str),
}

/// Immutable canonicalization tables, constructed once at engine startup
#[derive(Debug)]
pub struct Canonicalizer {
    /// (legacy_prefix_with_colon, replacement_with_colon)
    prefix_map: Vec<(String, String)>,
    category_map: Vec<(String, String)>,
    /// (curie_prefix_without_colon, category)
    prefix_category_map: Vec<(String, String)>,
}

impl Canonicalizer {
    pub fn new(config: &CanonConfig) -> Self {
        Self {
            prefix_map: config
                .prefix_map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            category_map: config
                .category_map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            prefix_category_map: config
                .prefix_category_map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Canonicalize a node row in place
    pub fn canon_node(&self, row: &mut Row) -> CanonOutcome {
        self.sanitize_all(row);
        let id = self.canon_identifier(row.get("id"));
        row.set("id", id);

        let category = self.canon_category(row.get("id"), row.get("category"));
        row.set("category", category);

        self.canon_ec_iri(row);

        if row.get("id").is_empty() {
            CanonOutcome::Drop("node with empty id")
        } else if row.get("category").is_empty() {
            CanonOutcome::Drop("node with empty category")
        } else {
            CanonOutcome::Keep
        }
    }

    /// Canonicalize an edge row in place
    pub fn canon_edge(&self, row: &mut Row) -> CanonOutcome {
        self.sanitize_all(row);
        for column in ["subject", "object"] {
            let id = self.canon_identifier(row.get(column));
            row.set(column, id);
        }

        if row.get("subject").is_empty() {
            CanonOutcome::Drop("edge with empty subject")
        } else if row.get("object").is_empty() {
            CanonOutcome::Drop("edge with empty object")
        } else if row.get("predicate").is_empty() {
            CanonOutcome::Drop("edge with empty predicate")
        } else {
            CanonOutcome::Keep
        }
    }

    /// Step 1 over every field of the row
    fn sanitize_all(&self, row: &mut Row) {
        for value in row.values_mut() {
            if value.contains('\r') {
                *value = value.replace('\r', "");
            }
            let trimmed = value.trim();
            if trimmed.len() != value.len() {
                *value = trimmed.to_string();
            }
        }
        for column in ["id", "subject", "object"] {
            let raw = row.get(column);
            if raw.is_empty() {
                continue;
            }
            if let Some(sanitized) = sanitize_curie_local(raw) {
                row.set(column, sanitized);
            }
        }
    }

    /// Steps 2 and 3 for a single identifier
    fn canon_identifier(&self, id: &str) -> String {
        let id = match extract_intenz_ec(id) {
            Some(code) => format!("EC:{}", code),
            None => id.to_string(),
        };
        for (legacy, replacement) in &self.prefix_map {
            if let Some(local) = id.strip_prefix(legacy.as_str()) {
                return format!("{}{}", replacement, local);
            }
        }
        id
    }

    /// Step 4: deprecated names first, then prefix-driven categories
    fn canon_category(&self, id: &str, category: &str) -> String {
        let mut category = category.to_string();
        for (deprecated, canonical) in &self.category_map {
            if category == *deprecated {
                category = canonical.clone();
                break;
            }
        }
        if let Some(prefix) = curie::prefix(id) {
            for (wanted, forced) in &self.prefix_category_map {
                if prefix == wanted {
                    return forced.clone();
                }
            }
        }
        category
    }

    /// Step 5: any IRI still pointing at the legacy IntEnz query form is
    /// replaced with the canonical form derived from the local EC code.
    fn canon_ec_iri(&self, row: &mut Row) {
        if !curie::has_prefix(row.get("id"), "EC") {
            return;
        }
        let iri = row.get("iri");
        let stale = iri.is_empty() || iri.contains(INTENZ_MARKER);
        if stale {
            if let Some(code) = curie::local(row.get("id")) {
                let canonical = format!("{}{}", EC_IRI_BASE, code);
                row.set("iri", canonical);
            }
        }
    }
}

/// Percent-encode URI-hostile characters in the local part of a CURIE.
/// Returns `None` when the value needs no change.
fn sanitize_curie_local(value: &str) -> Option<String> {
    let (prefix, local) = curie::split(value)?;
    if !local.chars().any(|c| URI_HOSTILE.contains(&c)) {
        return None;
    }
    let mut encoded = String::with_capacity(local.len() + 8);
    for c in local.chars() {
        if URI_HOSTILE.contains(&c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                encoded.push('%');
                encoded.push_str(&format!("{:02X}", byte));
            }
        } else {
            encoded.push(c);
        }
    }
    Some(format!("{}:{}", prefix, encoded))
}

/// Pull the EC code out of a legacy IntEnz query URL, e.g.
/// `https://www.ebi.ac.uk/intenz/query?cmd=SearchEC&ec=1.1.1.1`
fn extract_intenz_ec(id: &str) -> Option<&str> {
    if !id.contains(INTENZ_MARKER) {
        return None;
    }
    let start = id.find("ec=")? + 3;
    let rest = &id[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    let code = &rest[..end];
    (!code.is_empty()).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderKey, Provenance, Schema, TableKind};
    use std::sync::Arc;

    fn canonicalizer() -> Canonicalizer {
        Canonicalizer::new(&CanonConfig::default())
    }

    fn node_row(values: &[(&str, &str)]) -> Row {
        build_row(TableKind::Nodes, values)
    }

    fn edge_row(values: &[(&str, &str)]) -> Row {
        build_row(TableKind::Edges, values)
    }

    fn build_row(kind: TableKind, values: &[(&str, &str)]) -> Row {
        let schema = Arc::new(Schema::for_table(kind, []));
        let mut vals = vec![String::new(); schema.len()];
        for (col, val) in values {
            vals[schema.position(col).unwrap()] = val.to_string();
        }
        Row::new(
            schema,
            vals,
            Provenance {
                source: "test".into(),
                rank: 0,
                path: "t.tsv".into(),
                line: 2,
            },
            OrderKey {
                source_index: 0,
                row_seq: 0,
            },
        )
    }

    #[test]
    fn test_legacy_prefixes_rewritten() {
        let canon = canonicalizer();
        for (raw, expected) in [
            ("medium:1", "mediadive.medium:1"),
            ("solution:2", "mediadive.solution:2"),
            ("ingredient:3", "mediadive.ingredient:3"),
            ("strain:4", "kgmicrobe.strain:4"),
            ("ec:1.1.1.1", "EC:1.1.1.1"),
            ("eccode:1.1.1.1", "EC:1.1.1.1"),
        ] {
            assert_eq!(canon.canon_identifier(raw), expected, "for {}", raw);
        }
    }

    #[test]
    fn test_prefix_rewrite_is_idempotent() {
        let canon = canonicalizer();
        let once = canon.canon_identifier("medium:1");
        let twice = canon.canon_identifier(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_medium_node_adopts_metpo_category() {
        let canon = canonicalizer();
        let mut row = node_row(&[("id", "medium:1"), ("category", "biolink:ChemicalMixture")]);
        assert_eq!(canon.canon_node(&mut row), CanonOutcome::Keep);
        assert_eq!(row.get("id"), "mediadive.medium:1");
        assert_eq!(row.get("category"), "METPO:1004005");
    }

    #[test]
    fn test_deprecated_chemical_substance_category() {
        let canon = canonicalizer();
        let mut row = node_row(&[("id", "CHEBI:1"), ("category", "biolink:ChemicalSubstance")]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("category"), "biolink:ChemicalEntity");
    }

    #[test]
    fn test_intenz_url_id_becomes_ec_curie() {
        let canon = canonicalizer();
        let mut row = node_row(&[(
            "id",
            "https://www.ebi.ac.uk/intenz/query?cmd=SearchEC&ec=1.1.1.1",
        )]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("id"), "EC:1.1.1.1");
        assert_eq!(row.get("category"), "biolink:MolecularActivity");
        assert_eq!(row.get("iri"), "https://enzyme.expasy.org/EC/1.1.1.1");
    }

    #[test]
    fn test_legacy_intenz_iri_rewritten() {
        let canon = canonicalizer();
        let mut row = node_row(&[
            ("id", "EC:2.7.1.1"),
            ("iri", "https://www.ebi.ac.uk/intenz/query?cmd=SearchEC&ec=2.7.1.1"),
        ]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("iri"), "https://enzyme.expasy.org/EC/2.7.1.1");
    }

    #[test]
    fn test_whitespace_trimmed_before_rewrite() {
        let canon = canonicalizer();
        let mut row = node_row(&[("id", "  medium:1 "), ("category", " biolink:ChemicalEntity ")]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("id"), "mediadive.medium:1");
    }

    #[test]
    fn test_carriage_returns_stripped() {
        let canon = canonicalizer();
        let mut row = node_row(&[("id", "CHEBI:1\r"), ("name", "wat\rer")]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("id"), "CHEBI:1");
        assert_eq!(row.get("name"), "water");
    }

    #[test]
    fn test_uri_hostile_local_chars_encoded() {
        let canon = canonicalizer();
        let mut row = node_row(&[("id", "chem:alpha>beta"), ("category", "biolink:ChemicalEntity")]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("id"), "chem:alpha%3Ebeta");
        // Second pass changes nothing.
        let mut again = row.clone();
        canon.canon_node(&mut again);
        assert_eq!(again.get("id"), row.get("id"));
    }

    #[test]
    fn test_empty_id_dropped() {
        let canon = canonicalizer();
        let mut row = node_row(&[("category", "biolink:ChemicalEntity")]);
        assert!(matches!(canon.canon_node(&mut row), CanonOutcome::Drop(_)));
    }

    #[test]
    fn test_edge_validation() {
        let canon = canonicalizer();
        let mut ok = edge_row(&[
            ("subject", "GO:1"),
            ("predicate", "biolink:subclass_of"),
            ("object", "GO:2"),
        ]);
        assert_eq!(canon.canon_edge(&mut ok), CanonOutcome::Keep);

        let mut missing = edge_row(&[("subject", "GO:1"), ("object", "GO:2")]);
        assert!(matches!(canon.canon_edge(&mut missing), CanonOutcome::Drop(_)));
    }

    #[test]
    fn test_edge_identifiers_rewritten() {
        let canon = canonicalizer();
        let mut row = edge_row(&[
            ("subject", "strain:7"),
            ("predicate", "biolink:occurs_in"),
            ("object", "medium:1"),
        ]);
        canon.canon_edge(&mut row);
        assert_eq!(row.get("subject"), "kgmicrobe.strain:7");
        assert_eq!(row.get("object"), "mediadive.medium:1");
    }

    #[test]
    fn test_canon_is_idempotent_on_nodes() {
        let canon = canonicalizer();
        let mut row = node_row(&[
            ("id", " eccode:1.2.3.4\r"),
            ("category", "biolink:ChemicalSubstance"),
            ("name", "  some name "),
        ]);
        canon.canon_node(&mut row);
        let after_once: Vec<String> = row.values().to_vec();
        canon.canon_node(&mut row);
        assert_eq!(row.values(), after_once.as_slice());
    }

    #[test]
    fn test_unicode_id_untouched() {
        let canon = canonicalizer();
        let mut row = node_row(&[("id", "chem:α-アミラーゼ")]);
        canon.canon_node(&mut row);
        assert_eq!(row.get("id"), "chem:α-アミラーゼ");
    }
}
