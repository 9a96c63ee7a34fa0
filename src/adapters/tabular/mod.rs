//! Tabular adapters: Implementations of TabularSource.
//!
//! - `CsvFileSource`: CSV files with a header row
//! - `SqliteTableSource`: a table inside a SQLite database file, opened read-only
//! - `InMemorySource`: tables registered in-process (tests, embedding)
//! - `SourceRouter`: dispatches a descriptor to the matching reader

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::domain::{Datum, SourceDescriptor, Table};
use crate::ports::{SourceError, TabularSource};

const DELIMITER: char = ',';
const QUOTE: char = '"';

/// Split one CSV record, honoring quoted fields and doubled quotes.
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c == QUOTE {
            if in_quotes {
                if chars.peek() == Some(&QUOTE) {
                    current.push(QUOTE);
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                in_quotes = true;
            }
        } else if c == DELIMITER && !in_quotes {
            values.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
    }

    values.push(current.trim().to_string());
    values
}

/// Parse CSV text (header row first) into a column-oriented table.
///
/// # Errors
/// Returns `SourceError::Malformed` if the header is missing or a row has
/// the wrong number of fields.
pub fn parse_csv(content: &str) -> Result<Table, SourceError> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| SourceError::Malformed("CSV has no header row".into()))?;
    let names = parse_csv_line(header.trim_start_matches('\u{feff}'));

    let mut columns: Vec<Vec<Datum>> = vec![Vec::new(); names.len()];
    for (line_no, line) in lines.enumerate() {
        let fields = parse_csv_line(line);
        if fields.len() != names.len() {
            return Err(SourceError::Malformed(format!(
                "row {} has {} fields, header has {}",
                line_no + 2,
                fields.len(),
                names.len()
            )));
        }
        for (column, field) in columns.iter_mut().zip(&fields) {
            column.push(Datum::from_text(field));
        }
    }

    let mut table = Table::new();
    for (name, values) in names.into_iter().zip(columns) {
        table.insert(name, values);
    }
    Ok(table)
}

/// Reader for CSV files.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvFileSource;

impl CsvFileSource {
    /// Read and parse the CSV file at `path`.
    ///
    /// # Errors
    /// Returns `SourceError::Unavailable` if the file cannot be read.
    pub fn read(path: &str) -> Result<Table, SourceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Unavailable(format!("cannot read {path}: {e}")))?;
        parse_csv(&content)
    }
}

impl TabularSource for CsvFileSource {
    fn fetch(&self, source: &SourceDescriptor) -> Result<Table, SourceError> {
        match source {
            SourceDescriptor::CsvFile { path } => Self::read(path),
            other => Err(SourceError::UnsupportedSource(other.kind())),
        }
    }
}

/// Reader for tables in SQLite database files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteTableSource;

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl SqliteTableSource {
    /// Read every row of `table` from the database at `path`.
    ///
    /// # Errors
    /// Returns `SourceError::Unavailable` if the file or table is missing.
    pub fn read(path: &str, table: &str) -> Result<Table, SourceError> {
        if !valid_identifier(table) {
            return Err(SourceError::Malformed(format!("invalid table name '{table}'")));
        }
        if !Path::new(path).exists() {
            return Err(SourceError::Unavailable(format!("database {path} does not exist")));
        }

        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| SourceError::Unavailable(format!("cannot open {path}: {e}")))?;
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM \"{table}\""))
            .map_err(|e| SourceError::Unavailable(format!("cannot read table {table}: {e}")))?;

        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut columns: Vec<Vec<Datum>> = vec![Vec::new(); names.len()];

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (idx, column) in columns.iter_mut().enumerate() {
                let datum = match row.get_ref(idx)? {
                    ValueRef::Null | ValueRef::Blob(_) => Datum::Null,
                    ValueRef::Integer(i) => Datum::Int(i),
                    ValueRef::Real(f) => Datum::Real(f),
                    ValueRef::Text(bytes) => Datum::from_text(&String::from_utf8_lossy(bytes)),
                };
                column.push(datum);
            }
        }

        let mut out = Table::new();
        for (name, values) in names.into_iter().zip(columns) {
            out.insert(name, values);
        }
        Ok(out)
    }
}

impl TabularSource for SqliteTableSource {
    fn fetch(&self, source: &SourceDescriptor) -> Result<Table, SourceError> {
        match source {
            SourceDescriptor::SqliteTable { path, table } => Self::read(path, table),
            other => Err(SourceError::UnsupportedSource(other.kind())),
        }
    }
}

/// Tables registered in-process under a key.
#[derive(Debug, Default)]
pub struct InMemorySource {
    tables: DashMap<String, Table>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the table behind `key`.
    pub fn put(&self, key: impl Into<String>, table: Table) {
        self.tables.insert(key.into(), table);
    }

    /// Drop the table behind `key`. Later fetches report it unavailable.
    pub fn remove(&self, key: &str) -> Option<Table> {
        self.tables.remove(key).map(|(_, t)| t)
    }
}

impl TabularSource for InMemorySource {
    fn fetch(&self, source: &SourceDescriptor) -> Result<Table, SourceError> {
        match source {
            SourceDescriptor::Inline { key } => self
                .tables
                .get(key)
                .map(|t| t.value().clone())
                .ok_or_else(|| SourceError::Unavailable(format!("no inline table '{key}'"))),
            other => Err(SourceError::UnsupportedSource(other.kind())),
        }
    }
}

/// Dispatches each descriptor to the reader for its source type.
pub struct SourceRouter {
    csv: CsvFileSource,
    sqlite: SqliteTableSource,
    inline: Arc<InMemorySource>,
}

impl SourceRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_inline(Arc::new(InMemorySource::new()))
    }

    /// Share an in-memory source with the caller so it can register tables.
    #[must_use]
    pub fn with_inline(inline: Arc<InMemorySource>) -> Self {
        Self {
            csv: CsvFileSource,
            sqlite: SqliteTableSource,
            inline,
        }
    }

    #[must_use]
    pub fn inline(&self) -> &Arc<InMemorySource> {
        &self.inline
    }
}

impl Default for SourceRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TabularSource for SourceRouter {
    fn fetch(&self, source: &SourceDescriptor) -> Result<Table, SourceError> {
        tracing::debug!(source = source.kind(), "Fetching dataset rows");
        match source {
            SourceDescriptor::CsvFile { .. } => self.csv.fetch(source),
            SourceDescriptor::SqliteTable { .. } => self.sqlite.fetch(source),
            SourceDescriptor::Inline { .. } => self.inline.fetch(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_csv_line_quotes() {
        assert_eq!(parse_csv_line(r#"a,"b,c",d"#), vec!["a", "b,c", "d"]);
        assert_eq!(parse_csv_line(r#""say ""hi""",2"#), vec![r#"say "hi""#, "2"]);
        assert_eq!(parse_csv_line("x,,z"), vec!["x", "", "z"]);
    }

    #[test]
    fn test_parse_csv_table() {
        let table = parse_csv("age,city\n34,Paris\n,Lyon\n51,\"Nice\"\n").expect("Should parse");
        assert_eq!(
            table.column("age"),
            Some(&[Datum::Int(34), Datum::Null, Datum::Int(51)][..])
        );
        assert_eq!(table.column("city").map(<[Datum]>::len), Some(3));
    }

    #[test]
    fn test_parse_csv_ragged_row() {
        assert!(matches!(parse_csv("a,b\n1\n"), Err(SourceError::Malformed(_))));
        assert!(matches!(parse_csv(""), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn test_csv_missing_file_is_unavailable() {
        let source = SourceDescriptor::CsvFile {
            path: "/nonexistent/data.csv".into(),
        };
        assert!(matches!(CsvFileSource.fetch(&source), Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_csv_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().expect("Should create temp file");
        writeln!(file, "income\n1000\n2500.5").expect("Should write");

        let source = SourceDescriptor::CsvFile {
            path: file.path().to_string_lossy().into_owned(),
        };
        let table = SourceRouter::new().fetch(&source).expect("Should fetch");
        assert_eq!(
            table.column("income"),
            Some(&[Datum::Int(1000), Datum::Real(2500.5)][..])
        );
    }

    #[test]
    fn test_sqlite_table_source() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let path = dir.path().join("src.db");
        {
            let conn = Connection::open(&path).expect("Should open");
            conn.execute_batch(
                "CREATE TABLE people (age INTEGER, city TEXT);
                 INSERT INTO people VALUES (30, 'Oslo'), (NULL, 'Bergen');",
            )
            .expect("Should seed");
        }

        let source = SourceDescriptor::SqliteTable {
            path: path.to_string_lossy().into_owned(),
            table: "people".into(),
        };
        let table = SourceRouter::new().fetch(&source).expect("Should fetch");
        assert_eq!(table.column("age"), Some(&[Datum::Int(30), Datum::Null][..]));

        let bad = SourceDescriptor::SqliteTable {
            path: path.to_string_lossy().into_owned(),
            table: "people; DROP TABLE people".into(),
        };
        assert!(matches!(SqliteTableSource.fetch(&bad), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn test_inline_source() {
        let router = SourceRouter::new();
        router
            .inline()
            .put("k", Table::new().with_column("x", vec![Datum::Int(1)]));

        let source = SourceDescriptor::Inline { key: "k".into() };
        assert!(router.fetch(&source).is_ok());

        router.inline().remove("k");
        assert!(matches!(router.fetch(&source), Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_reader_rejects_other_source_types() {
        let source = SourceDescriptor::Inline { key: "k".into() };
        assert!(matches!(
            CsvFileSource.fetch(&source),
            Err(SourceError::UnsupportedSource("inline"))
        ));
    }
}
