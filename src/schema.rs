//! Live schema snapshots and typed SQL values
//!
//! Installations of PoultryMetrics evolved independently, so nothing here
//! assumes a fixed table shape. A [`SchemaDescriptor`] is one batch read of
//! SQLite metadata for a single table; callers decide what to do from that
//! snapshot instead of issuing ad-hoc probes.

use crate::db::{DbError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

lazy_static! {
    static ref IDENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier pattern");
}

/// Quote a configured table/column/index name for use in generated SQL.
///
/// Only plain identifiers (`^[A-Za-z_][A-Za-z0-9_]*$`) are accepted.
pub fn quote_ident(name: &str) -> Result<String> {
    if IDENT.is_match(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Quote a name read back from SQLite's own metadata. Any text is allowed;
/// embedded double quotes are doubled.
pub fn quote_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ============================================================================
// Descriptor
// ============================================================================

/// One column as reported by `PRAGMA table_xinfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, verbatim (may be empty)
    pub decl_type: String,
    pub not_null: bool,
    /// Default expression text as stored by SQLite
    pub default: Option<String>,
    /// 1-based position in the primary key, 0 if not part of it
    pub pk: i32,
    /// `GENERATED ALWAYS AS (...)`, virtual or stored; never written directly
    pub generated: bool,
}

/// How an index came to exist (`origin` column of `PRAGMA index_list`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexOrigin {
    /// `CREATE INDEX`
    Explicit,
    /// `UNIQUE` constraint
    Unique,
    /// `PRIMARY KEY` constraint
    PrimaryKey,
}

impl IndexOrigin {
    pub fn from_pragma(origin: &str) -> Self {
        match origin {
            "u" => IndexOrigin::Unique,
            "pk" => IndexOrigin::PrimaryKey,
            _ => IndexOrigin::Explicit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub origin: IndexOrigin,
    pub partial: bool,
    /// Indexed columns in key order; expression terms are skipped
    pub columns: Vec<String>,
    /// `CREATE INDEX` text for explicit indexes
    pub sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub table: String,
    pub from: Vec<String>,
    /// `None` entries reference the parent's primary key implicitly
    pub to: Vec<Option<String>>,
    pub on_update: String,
    pub on_delete: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub name: String,
    pub sql: String,
}

/// Snapshot of one table's live shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDescriptor {
    pub table: String,
    pub exists: bool,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub triggers: Vec<TriggerInfo>,
    pub create_sql: Option<String>,
}

impl SchemaDescriptor {
    /// Descriptor for a table that is not there (or could not be read)
    pub fn missing(table: &str) -> Self {
        Self {
            table: table.to_string(),
            exists: false,
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            triggers: Vec::new(),
            create_sql: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    /// First candidate (in the given order) that exists on this table
    pub fn first_present<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates.iter().copied().find(|c| self.has_column(c))
    }

    /// Primary key columns in key order
    pub fn primary_key(&self) -> Vec<&ColumnInfo> {
        let mut pk: Vec<&ColumnInfo> = self.columns.iter().filter(|c| c.pk > 0).collect();
        pk.sort_by_key(|c| c.pk);
        pk
    }

    fn create_sql_words(&self) -> Vec<String> {
        self.create_sql
            .as_deref()
            .unwrap_or("")
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_ascii_uppercase())
            .collect()
    }

    pub fn is_autoincrement(&self) -> bool {
        self.create_sql_words().iter().any(|w| w == "AUTOINCREMENT")
    }

    pub fn is_without_rowid(&self) -> bool {
        self.create_sql_words()
            .windows(2)
            .any(|pair| pair[0] == "WITHOUT" && pair[1] == "ROWID")
    }

    /// Keep only the row entries that name a writable column of this table
    pub fn project(&self, row: Row) -> Row {
        row.into_iter()
            .filter(|(column, _)| self.column(column).is_some_and(|c| !c.generated))
            .collect()
    }
}

// ============================================================================
// Values and statements
// ============================================================================

/// A bind parameter for generated DML
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(n) => write!(f, "{}", n),
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// Column name -> value for a variable-shape insert
pub type Row = BTreeMap<String, SqlValue>;

/// SQL text plus its positional binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.binds.push(value.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)?;
        if !self.binds.is_empty() {
            let binds: Vec<String> = self.binds.iter().map(|b| b.to_string()).collect();
            write!(f, " [{}]", binds.join(", "))?;
        }
        Ok(())
    }
}
