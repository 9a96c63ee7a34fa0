//! Dataset metadata and tabular values as seen by the engine.
//!
//! Datasets are owned by the registry; the engine only reads their column
//! metadata and fetches column values through the data ports.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Declared column type, parsed from the registry's dtype string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Other(String),
}

impl ColumnType {
    /// Parse a dtype as reported by dataframe libraries or SQL schemas.
    #[must_use]
    pub fn parse(dtype: &str) -> Self {
        let lower = dtype.trim().to_lowercase();
        match lower.as_str() {
            "int" | "int8" | "int16" | "int32" | "int64" | "integer" | "bigint" | "smallint"
            | "uint8" | "uint16" | "uint32" | "uint64" => Self::Integer,
            "float" | "float16" | "float32" | "float64" | "double" | "real" | "numeric"
            | "decimal" => Self::Float,
            "bool" | "boolean" => Self::Boolean,
            "object" | "string" | "str" | "text" | "varchar" | "category" => Self::Text,
            _ => Self::Other(lower),
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Other(s) => s,
        }
    }
}

/// Declared numeric range of a column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub lower: f64,
    pub upper: f64,
}

impl ColumnBounds {
    /// Create bounds, rejecting non-finite or inverted ranges.
    ///
    /// # Errors
    /// Returns a description of the problem.
    pub fn new(lower: f64, upper: f64) -> Result<Self, String> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(format!("bounds must be finite, got [{lower}, {upper}]"));
        }
        if lower > upper {
            return Err(format!("lower bound {lower} exceeds upper bound {upper}"));
        }
        Ok(Self { lower, upper })
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    #[must_use]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lower, self.upper)
    }
}

/// Metadata for one column of a registered dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub dtype: ColumnType,
    pub bounds: Option<ColumnBounds>,
    pub is_categorical: bool,
    pub is_pii: bool,
}

impl ColumnMeta {
    /// A bounded numeric column.
    #[must_use]
    pub fn numeric(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            dtype: ColumnType::Float,
            bounds: ColumnBounds::new(lower, upper).ok(),
            is_categorical: false,
            is_pii: false,
        }
    }

    /// A categorical text column.
    #[must_use]
    pub fn categorical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: ColumnType::Text,
            bounds: None,
            is_categorical: true,
            is_pii: false,
        }
    }

    #[must_use]
    pub fn with_pii(mut self, is_pii: bool) -> Self {
        self.is_pii = is_pii;
        self
    }
}

/// Where the rows of a dataset live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// A CSV file with a header row.
    CsvFile { path: String },
    /// A table inside a SQLite database file.
    SqliteTable { path: String, table: String },
    /// Rows registered in-process under a key.
    Inline { key: String },
}

impl SourceDescriptor {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CsvFile { .. } => "csv_file",
            Self::SqliteTable { .. } => "sqlite_table",
            Self::Inline { .. } => "inline",
        }
    }
}

/// A registered dataset: identity, source and ordered column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub name: String,
    pub source: SourceDescriptor,
    pub columns: Vec<ColumnMeta>,
}

impl DatasetDescriptor {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Datum {
    /// Interpret a raw text cell: empty is null, numbers are parsed.
    #[must_use]
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("null")
            || trimmed.eq_ignore_ascii_case("nan")
        {
            return Self::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Self::Real(f);
            }
        }
        Self::Text(trimmed.to_string())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view of the cell. Text that parses as a number is accepted.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(*i as f64),
            Self::Real(f) => Some(*f),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        }
    }

    /// Category label used for histogram buckets.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(i.to_string()),
            Self::Real(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

/// Column-oriented table returned by a tabular source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: HashMap<String, Vec<Datum>>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a column.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<Datum>) -> Self {
        self.columns.insert(name.into(), values);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<Datum>) {
        self.columns.insert(name.into(), values);
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[Datum]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_parse() {
        assert_eq!(ColumnType::parse("int64"), ColumnType::Integer);
        assert_eq!(ColumnType::parse("FLOAT64"), ColumnType::Float);
        assert_eq!(ColumnType::parse("object"), ColumnType::Text);
        assert_eq!(ColumnType::parse("datetime64"), ColumnType::Other("datetime64".into()));
        assert!(ColumnType::parse("real").is_numeric());
        assert!(!ColumnType::parse("bool").is_numeric());
    }

    #[test]
    fn test_bounds_validation() {
        assert!(ColumnBounds::new(0.0, 10.0).is_ok());
        assert!(ColumnBounds::new(10.0, 0.0).is_err());
        assert!(ColumnBounds::new(f64::NAN, 1.0).is_err());

        let b = ColumnBounds::new(-5.0, 5.0).expect("valid bounds");
        assert!((b.width() - 10.0).abs() < f64::EPSILON);
        assert!((b.clamp(12.0) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_datum_from_text() {
        assert_eq!(Datum::from_text(""), Datum::Null);
        assert_eq!(Datum::from_text("NaN"), Datum::Null);
        assert_eq!(Datum::from_text("42"), Datum::Int(42));
        assert_eq!(Datum::from_text("4.5"), Datum::Real(4.5));
        assert_eq!(Datum::from_text(" paris "), Datum::Text("paris".into()));
    }

    #[test]
    fn test_datum_views() {
        assert_eq!(Datum::Text("3.5".into()).as_f64(), Some(3.5));
        assert_eq!(Datum::Text("abc".into()).as_f64(), None);
        assert_eq!(Datum::Int(7).label().as_deref(), Some("7"));
        assert_eq!(Datum::Null.label(), None);
    }
}
