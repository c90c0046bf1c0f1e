//! Tabular source reader
//!
//! Streams delimiter-separated rows from one or more files per logical
//! source, hiding file count, compression, column order, and missing
//! columns. A source's files are unioned into one column set; rows are
//! yielded in the global output schema with absent columns as empty
//! strings.
//!
//! # Formats
//!
//! - Plain TSV
//! - Gzip (`.gz`) via flate2
//! - Gzipped tarballs (`.tar.gz`, `.tgz`); members are extracted under the
//!   spill directory and visited in lexicographic path order
//!
//! A malformed row is a diagnostic, not an error; the reader skips it and
//! continues. Failing to read a file at all refuses the whole source.

use flate2::read::GzDecoder;
use kgm_common::{KgmError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::model::{OrderKey, Provenance, Row, Schema, TableKind};

/// One table (nodes or edges) of one configured source
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub source: String,
    pub rank: u32,
    pub source_index: u32,
    pub kind: TableKind,
    pub path: PathBuf,
}

/// A concrete file to stream after archive extraction
#[derive(Debug, Clone)]
pub struct MemberFile {
    /// On-disk path (already extracted for tarball members)
    pub path: PathBuf,
    /// Path shown in diagnostics (original archive member name)
    pub display: String,
    /// Header columns declared by this member
    pub columns: Vec<String>,
    /// Whether the file still needs gzip decoding when streamed
    pub gzipped: bool,
}

/// The resolved layout of a source table: member files plus the union of
/// their columns in first-seen order
#[derive(Debug)]
pub struct TableLayout {
    pub members: Vec<MemberFile>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Plain,
    Gzip,
    TarGz,
}

fn detect_format(path: &Path) -> FileFormat {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        FileFormat::TarGz
    } else if name.ends_with(".gz") {
        FileFormat::Gzip
    } else {
        FileFormat::Plain
    }
}

/// Resolve a source table: extract archives, read headers, verify required
/// columns, and union member columns.
///
/// Returns a `SchemaViolation` when any member with data is missing a
/// required column, refusing the source. Members without even a header line
/// contribute no rows and no columns.
pub fn prepare(table: &SourceTable, extract_dir: &Path) -> Result<TableLayout> {
    let members = match detect_format(&table.path) {
        FileFormat::TarGz => extract_tarball(table, extract_dir)?,
        FileFormat::Gzip => vec![(table.path.clone(), table.path.display().to_string(), true)],
        FileFormat::Plain => vec![(table.path.clone(), table.path.display().to_string(), false)],
    };

    let mut resolved = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    for (path, display, gzipped) in members {
        let header = read_header(&path, gzipped).map_err(|e| {
            KgmError::source_refused(&table.source, format!("cannot read '{}': {}", display, e))
        })?;
        let Some(header) = header else {
            debug!(member = %display, "member is empty, skipping");
            continue;
        };
        for required in table.kind.required_columns() {
            if !header.iter().any(|c| c == required) {
                return Err(KgmError::schema(&table.source, &path, *required));
            }
        }
        for col in &header {
            if !columns.iter().any(|c| c == col) {
                columns.push(col.clone());
            }
        }
        resolved.push(MemberFile {
            path,
            display,
            columns: header,
            gzipped,
        });
    }

    Ok(TableLayout {
        members: resolved,
        columns,
    })
}

/// Extract every regular member of a gzipped tarball under `extract_dir`,
/// returning `(extracted_path, member_name, gzipped)` triples in
/// lexicographic member order.
fn extract_tarball(
    table: &SourceTable,
    extract_dir: &Path,
) -> Result<Vec<(PathBuf, String, bool)>> {
    let file = File::open(&table.path).map_err(|e| {
        KgmError::source_refused(
            &table.source,
            format!("cannot open '{}': {}", table.path.display(), e),
        )
    })?;
    let dest = extract_dir
        .join(format!("source-{:04}", table.source_index))
        .join(match table.kind {
            TableKind::Nodes => "nodes",
            TableKind::Edges => "edges",
        });
    std::fs::create_dir_all(&dest)?;

    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut members = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member_name = entry.path()?.to_string_lossy().to_string();
        // Flatten the member path; tarballs from transforms are one level deep.
        let flat: String = member_name.replace('/', "_");
        let out_path = dest.join(&flat);
        entry
            .unpack(&out_path)
            .map_err(|e| KgmError::write_error(e, &out_path))?;
        debug!(member = %member_name, "extracted tarball member");
        members.push((out_path, format!("{}:{}", table.path.display(), member_name), false));
    }
    members.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(members)
}

fn open_reader(path: &Path, gzipped: bool) -> std::io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if gzipped {
        Ok(Box::new(BufReader::new(GzDecoder::new(BufReader::new(
            file,
        )))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// First line of a file, split into columns. `None` when the file is empty.
fn read_header(path: &Path, gzipped: bool) -> std::io::Result<Option<Vec<String>>> {
    let mut reader = open_reader(path, gzipped)?;
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim_end_matches(['\n', '\r']);
    Ok(Some(line.split('\t').map(|c| c.to_string()).collect()))
}

/// Streaming iterator over every row of a source table, in file order.
///
/// Rows come out aligned to the global output schema; the per-member column
/// mapping is precomputed once. Parse problems are pushed to the diagnostic
/// sink and the offending row is skipped.
pub struct RowReader {
    table: SourceTable,
    schema: Arc<Schema>,
    members: std::vec::IntoIter<MemberFile>,
    current: Option<ActiveMember>,
    seq: u64,
    sink: Arc<DiagnosticSink>,
    pending: Vec<Diagnostic>,
}

struct ActiveMember {
    reader: Box<dyn BufRead + Send>,
    display: String,
    /// member column index -> global schema position
    mapping: Vec<usize>,
    line: u64,
}

impl RowReader {
    pub fn new(
        table: SourceTable,
        layout: TableLayout,
        schema: Arc<Schema>,
        sink: Arc<DiagnosticSink>,
    ) -> Self {
        Self {
            table,
            schema,
            members: layout.members.into_iter(),
            current: None,
            seq: 0,
            sink,
            pending: Vec::new(),
        }
    }

    fn push_diagnostic(&mut self, diag: Diagnostic) {
        self.pending.push(diag);
        if self.pending.len() >= 256 {
            self.sink.record_batch(std::mem::take(&mut self.pending));
        }
    }

    fn advance_member(&mut self) -> Result<bool> {
        let Some(member) = self.members.next() else {
            return Ok(false);
        };
        let mut reader = open_reader(&member.path, member.gzipped).map_err(|e| {
            KgmError::source_refused(
                &self.table.source,
                format!("cannot open '{}': {}", member.display, e),
            )
        })?;
        // Skip the header; prepare() already consumed and validated it.
        let mut header = String::new();
        reader.read_line(&mut header).map_err(|e| {
            KgmError::source_refused(
                &self.table.source,
                format!("cannot read '{}': {}", member.display, e),
            )
        })?;
        let mut mapping = Vec::with_capacity(member.columns.len());
        for col in &member.columns {
            match self.schema.position(col) {
                Some(pos) => mapping.push(pos),
                None => {
                    return Err(KgmError::source_refused(
                        &self.table.source,
                        format!("column '{}' is not in the output schema", col),
                    ))
                },
            }
        }
        self.current = Some(ActiveMember {
            reader,
            display: member.display,
            mapping,
            line: 1,
        });
        Ok(true)
    }

    fn parse_line(&self, member: &ActiveMember, line: &str) -> std::result::Result<Row, String> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(String::new());
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() > member.mapping.len() {
            return Err(format!(
                "expected {} fields, found {} (embedded tab?)",
                member.mapping.len(),
                fields.len()
            ));
        }
        let mut values = vec![String::new(); self.schema.len()];
        for (i, field) in fields.iter().enumerate() {
            values[member.mapping[i]] = (*field).to_string();
        }
        Ok(Row::new(
            Arc::clone(&self.schema),
            values,
            Provenance {
                source: self.table.source.clone(),
                rank: self.table.rank,
                path: member.display.clone(),
                line: member.line,
            },
            OrderKey {
                source_index: self.table.source_index,
                row_seq: self.seq,
            },
        ))
    }
}

impl Iterator for RowReader {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.advance_member() {
                    Ok(true) => {},
                    Ok(false) => {
                        if !self.pending.is_empty() {
                            self.sink.record_batch(std::mem::take(&mut self.pending));
                        }
                        return None;
                    },
                    Err(e) => return Some(Err(e)),
                }
            }
            let Some(member) = self.current.as_mut() else {
                continue;
            };

            let mut line = String::new();
            match member.reader.read_line(&mut line) {
                Ok(0) => {
                    self.current = None;
                    continue;
                },
                Ok(_) => member.line += 1,
                Err(e) => {
                    let source = self.table.source.clone();
                    let display = member.display.clone();
                    self.current = None;
                    return Some(Err(KgmError::source_refused(
                        source,
                        format!("read error in '{}': {}", display, e),
                    )));
                },
            }

            let Some(member) = self.current.as_ref() else {
                continue;
            };
            match self.parse_line(member, &line) {
                Ok(row) => {
                    self.seq += 1;
                    return Some(Ok(row));
                },
                Err(message) if message.is_empty() => {
                    // Blank line; not worth a diagnostic.
                    continue;
                },
                Err(message) => {
                    let diag = Diagnostic {
                        kind: DiagnosticKind::ParseError,
                        path: member.display.clone(),
                        line: member.line,
                        message,
                    };
                    self.push_diagnostic(diag);
                    continue;
                },
            }
        }
    }
}

impl Drop for RowReader {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.sink.record_batch(std::mem::take(&mut self.pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn table(path: &Path, kind: TableKind) -> SourceTable {
        SourceTable {
            source: "test".into(),
            rank: 0,
            source_index: 0,
            kind,
            path: path.to_path_buf(),
        }
    }

    fn read_all(table: SourceTable, layout: TableLayout, sink: Arc<DiagnosticSink>) -> Vec<Row> {
        let schema = Arc::new(Schema::for_table(
            table.kind,
            layout.columns.iter().map(|c| c.as_str()),
        ));
        RowReader::new(table, layout, schema, sink)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_plain_tsv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(&path, "id\tcategory\tname\nCHEBI:1\tbiolink:ChemicalEntity\twater\n")
            .unwrap();
        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), "CHEBI:1");
        assert_eq!(rows[0].get("name"), "water");
        assert_eq!(rows[0].provenance().line, 2);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.tsv.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"subject\tpredicate\tobject\nGO:1\tbiolink:subclass_of\tGO:2\n")
            .unwrap();
        enc.finish().unwrap();
        let t = table(&path, TableKind::Edges);
        let layout = prepare(&t, dir.path()).unwrap();
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("predicate"), "biolink:subclass_of");
    }

    #[test]
    fn test_tarball_members_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.tar.gz");
        let enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        // Appended out of order on purpose.
        for (name, body) in [
            ("b_nodes.tsv", "id\tcategory\nGO:2\tbiolink:MolecularActivity\n"),
            ("a_nodes.tsv", "id\tcategory\nGO:1\tbiolink:MolecularActivity\n"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), "GO:1");
        assert_eq!(rows[1].get("id"), "GO:2");
    }

    #[test]
    fn test_schema_union_across_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.tar.gz");
        let enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, body) in [
            ("a.tsv", "id\tcategory\tname\nX:1\tbiolink:ChemicalEntity\talpha\n"),
            ("b.tsv", "id\tcategory\tdescription\nX:2\tbiolink:ChemicalEntity\tbeta\n"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        assert!(layout.columns.contains(&"name".to_string()));
        assert!(layout.columns.contains(&"description".to_string()));
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        // Absent columns read as empty through the union schema.
        assert_eq!(rows[0].get("description"), "");
        assert_eq!(rows[1].get("description"), "beta");
    }

    #[test]
    fn test_missing_required_column_refuses_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(&path, "id\tname\nCHEBI:1\twater\n").unwrap();
        let t = table(&path, TableKind::Nodes);
        let err = prepare(&t, dir.path()).unwrap_err();
        assert!(matches!(err, KgmError::SchemaViolation { .. }));
    }

    #[test]
    fn test_header_only_file_yields_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(&path, "id\tcategory\n").unwrap();
        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_oversized_row_is_diagnostic_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(
            &path,
            "id\tcategory\nCHEBI:1\tbiolink:ChemicalEntity\textra\nCHEBI:2\tbiolink:ChemicalEntity\n",
        )
        .unwrap();
        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        let sink = Arc::new(DiagnosticSink::new());
        let rows = read_all(t, layout, Arc::clone(&sink));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), "CHEBI:2");
        assert_eq!(sink.snapshot().parse_errors, 1);
    }

    #[test]
    fn test_short_row_padded_with_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(&path, "id\tcategory\tname\nCHEBI:1\tbiolink:ChemicalEntity\n").unwrap();
        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), "");
    }

    #[test]
    fn test_unicode_identifiers_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.tsv");
        std::fs::write(&path, "id\tcategory\nchem:α-アミラーゼ\tbiolink:ChemicalEntity\n").unwrap();
        let t = table(&path, TableKind::Nodes);
        let layout = prepare(&t, dir.path()).unwrap();
        let rows = read_all(t, layout, Arc::new(DiagnosticSink::new()));
        assert_eq!(rows[0].get("id"), "chem:α-アミラーゼ");
    }
}
