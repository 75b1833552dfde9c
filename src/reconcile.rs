//! Schema reconciliation for `egg_production`
//!
//! `reconcile` converges a live table toward a [`TargetTableSpec`] without
//! dropping anything. Every statement is attempted on its own and recorded
//! in a [`ReconciliationReport`]; a failing step never stops the ones after
//! it, so the command can simply be run again once the cause is fixed.
//!
//! Steps, always in this order:
//!
//! 1. create the table if it is missing
//! 2. add missing columns
//! 3. copy legacy date values into the canonical date column
//! 4. backfill remaining nulls with today, then make the column NOT NULL
//! 5. create missing indexes

use crate::db::{Database, DbError, Result};
use crate::schema::{quote_ident, quote_name, IndexOrigin, SchemaDescriptor, Statement};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Target definition
// ============================================================================

/// One column of the canonical table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    /// Constant default expression (SQLite refuses non-constant defaults on ADD COLUMN)
    pub default: Option<String>,
    pub nullable: bool,
    pub primary_key: bool,
    pub autoincrement: bool,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            default: None,
            nullable: true,
            primary_key: false,
            autoincrement: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default(mut self, expr: &str) -> Self {
        self.default = Some(expr.to_string());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    /// Column definition for CREATE TABLE
    fn create_clause(&self) -> Result<String> {
        let mut def = format!("{} {}", quote_ident(&self.name)?, self.sql_type);
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
            if self.autoincrement {
                def.push_str(" AUTOINCREMENT");
            }
        } else if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        Ok(def)
    }

    /// Column definition for ALTER TABLE ADD COLUMN.
    ///
    /// NOT NULL is only kept when there is a default to fill existing rows.
    fn add_clause(&self) -> Result<String> {
        let mut def = format!("{} {}", quote_ident(&self.name)?, self.sql_type);
        if let Some(default) = &self.default {
            if !self.nullable {
                def.push_str(" NOT NULL");
            }
            def.push_str(&format!(" DEFAULT {}", default));
        }
        Ok(def)
    }
}

/// Index on a single column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub column: String,
}

impl IndexDef {
    pub fn new(name: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: column.to_string(),
        }
    }
}

/// Canonical shape of a table plus its date standardisation rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTableSpec {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    /// Column that must end up NOT NULL and holds the standardised date
    pub canonical_date: String,
    /// Older names for the date, most preferred first
    pub legacy_date_columns: Vec<String>,
}

impl TargetTableSpec {
    /// The daily egg production log
    pub fn egg_production() -> Self {
        Self {
            name: "egg_production".to_string(),
            columns: vec![
                ColumnDef::new("id", "INTEGER").primary_key().autoincrement(),
                ColumnDef::new("prod_date", "DATE").not_null(),
                ColumnDef::new("house_id", "INTEGER"),
                ColumnDef::new("eggs_collected", "INTEGER").not_null().default("0"),
                ColumnDef::new("eggs_broken", "INTEGER").not_null().default("0"),
                ColumnDef::new("feed_kg", "REAL"),
                ColumnDef::new("mortality", "INTEGER").not_null().default("0"),
                ColumnDef::new("notes", "TEXT"),
                ColumnDef::new("recorded_by", "INTEGER"),
                ColumnDef::new("created_at", "TEXT"),
            ],
            indexes: vec![
                IndexDef::new("idx_egg_production_prod_date", "prod_date"),
                IndexDef::new("idx_egg_production_house", "house_id"),
            ],
            canonical_date: "prod_date".to_string(),
            legacy_date_columns: ["production_date", "record_date", "collection_date", "date", "prod_date"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn create_table_sql(&self) -> Result<Statement> {
        let defs = self
            .columns
            .iter()
            .map(|c| {
                // The canonical date is NOT NULL from birth in a fresh table
                if c.name.eq_ignore_ascii_case(&self.canonical_date) {
                    c.clone().not_null().create_clause()
                } else {
                    c.create_clause()
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Statement::new(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(&self.name)?,
            defs.join(",\n    ")
        )))
    }

    /// First legacy column present on the table, ignoring the canonical one
    fn legacy_source<'a>(&'a self, desc: &SchemaDescriptor) -> Option<&'a str> {
        self.legacy_date_columns
            .iter()
            .map(String::as_str)
            .filter(|c| !c.eq_ignore_ascii_case(&self.canonical_date))
            .find(|c| desc.has_column(c))
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CreateTable,
    AddColumn,
    MigrateLegacy,
    BackfillNulls,
    EnforceNotNull,
    CreateIndex,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::CreateTable => "create table",
            Step::AddColumn => "add column",
            Step::MigrateLegacy => "migrate legacy date",
            Step::BackfillNulls => "backfill nulls",
            Step::EnforceNotNull => "enforce not null",
            Step::CreateIndex => "create index",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied { rows: usize },
    Skipped { reason: String },
    Failed { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub step: Step,
    /// Table, column or index the step is about
    pub subject: String,
    pub statement: Option<String>,
    pub outcome: Outcome,
}

impl ReportEntry {
    /// Nothing changed: skipped, or a data update that touched no rows
    pub fn is_noop(&self) -> bool {
        match &self.outcome {
            Outcome::Skipped { .. } => true,
            Outcome::Applied { rows } => {
                *rows == 0 && matches!(self.step, Step::MigrateLegacy | Step::BackfillNulls)
            }
            Outcome::Failed { .. } => false,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Applied { rows } => {
                write!(f, "[OK]   {} {}", self.step, self.subject)?;
                if let Some(sql) = &self.statement {
                    write!(f, ": {}", sql.split_whitespace().collect::<Vec<_>>().join(" "))?;
                }
                if matches!(self.step, Step::MigrateLegacy | Step::BackfillNulls | Step::EnforceNotNull) {
                    write!(f, " ({} rows)", rows)?;
                }
                Ok(())
            }
            Outcome::Skipped { reason } => {
                write!(f, "[SKIP] {} {}: {}", self.step, self.subject, reason)
            }
            Outcome::Failed { detail } => {
                write!(f, "[FAIL] {} {}: {}", self.step, self.subject, detail)
            }
        }
    }
}

/// Everything one reconcile run attempted, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub table: String,
    pub entries: Vec<ReportEntry>,
}

impl ReconciliationReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.is_failure())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn applied_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_noop() && !e.is_failure()).count()
    }

    pub fn entries_for(&self, step: Step) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(move |e| e.step == step)
    }

    fn skip(&mut self, step: Step, subject: &str, reason: &str) {
        self.entries.push(ReportEntry {
            step,
            subject: subject.to_string(),
            statement: None,
            outcome: Outcome::Skipped {
                reason: reason.to_string(),
            },
        });
    }

    fn fail(&mut self, step: Step, subject: &str, statement: Option<String>, detail: String) {
        tracing::warn!(%step, subject, %detail, "reconcile step failed");
        self.entries.push(ReportEntry {
            step,
            subject: subject.to_string(),
            statement,
            outcome: Outcome::Failed { detail },
        });
    }

    /// Run a single statement and record the result; true on success
    fn run(&mut self, db: &Database, step: Step, subject: &str, stmt: Result<Statement>) -> bool {
        let stmt = match stmt {
            Ok(stmt) => stmt,
            Err(e) => {
                self.fail(step, subject, None, e.to_string());
                return false;
            }
        };
        match db.execute(&stmt) {
            Ok(rows) => {
                self.entries.push(ReportEntry {
                    step,
                    subject: subject.to_string(),
                    statement: Some(stmt.to_string()),
                    outcome: Outcome::Applied { rows },
                });
                true
            }
            Err(e) => {
                self.fail(step, subject, Some(stmt.to_string()), e.to_string());
                false
            }
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Bring `spec.name` to the canonical shape. Never fails as a whole.
pub fn reconcile(db: &Database, spec: &TargetTableSpec) -> ReconciliationReport {
    let mut report = ReconciliationReport::new(&spec.name);
    let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();

    // 1. existence
    let mut desc = db.probe(&spec.name);
    if desc.exists {
        report.skip(Step::CreateTable, &spec.name, "table already exists");
    } else {
        tracing::info!(table = %spec.name, "creating missing table");
        if report.run(db, Step::CreateTable, &spec.name, spec.create_table_sql()) {
            desc = db.probe(&spec.name);
        }
    }

    // 2. columns
    let mut added = false;
    for column in &spec.columns {
        if desc.has_column(&column.name) {
            report.skip(Step::AddColumn, &column.name, "already present");
        } else if column.primary_key {
            report.skip(
                Step::AddColumn,
                &column.name,
                "primary key columns cannot be added to an existing table",
            );
        } else {
            let stmt = add_column_sql(&spec.name, column);
            added |= report.run(db, Step::AddColumn, &column.name, stmt);
        }
    }
    if added {
        desc = db.probe(&spec.name);
    }

    // 3. legacy date migration
    let canonical = spec.canonical_date.as_str();
    match spec.legacy_source(&desc) {
        Some(source) => {
            tracing::info!(table = %spec.name, source, "migrating legacy date column");
            let stmt = migrate_sql(&spec.name, canonical, source);
            report.run(db, Step::MigrateLegacy, source, stmt);
        }
        None => report.skip(Step::MigrateLegacy, canonical, "no legacy date column found"),
    }

    // 4. backfill, then tighten. The order matters: NOT NULL cannot hold while nulls remain.
    let backfill = backfill_sql(&spec.name, canonical).map(|s| s.bind(today.as_str()));
    let backfilled = report.run(db, Step::BackfillNulls, canonical, backfill);

    match desc.column(canonical) {
        None => report.fail(
            Step::EnforceNotNull,
            canonical,
            None,
            format!("column {} does not exist", canonical),
        ),
        Some(col) if col.not_null => report.skip(Step::EnforceNotNull, canonical, "already NOT NULL"),
        Some(_) if !backfilled => report.fail(
            Step::EnforceNotNull,
            canonical,
            None,
            "null backfill did not succeed".to_string(),
        ),
        Some(_) => {
            if enforce_not_null(db, &mut report, &desc, canonical) {
                desc = db.probe(&spec.name);
            }
        }
    }

    // 5. indexes
    for index in &spec.indexes {
        if desc.has_index(&index.name) {
            report.skip(Step::CreateIndex, &index.name, "already present");
        } else {
            let stmt = create_index_sql(&spec.name, index);
            report.run(db, Step::CreateIndex, &index.name, stmt);
        }
    }

    tracing::info!(
        table = %spec.name,
        applied = report.applied_count(),
        failed = report.failures().count(),
        "reconcile finished"
    );
    report
}

fn add_column_sql(table: &str, column: &ColumnDef) -> Result<Statement> {
    Ok(Statement::new(format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table)?,
        column.add_clause()?
    )))
}

fn migrate_sql(table: &str, canonical: &str, source: &str) -> Result<Statement> {
    let (table, canonical, source) = (quote_ident(table)?, quote_ident(canonical)?, quote_ident(source)?);
    Ok(Statement::new(format!(
        "UPDATE {table} SET {canonical} = date({source}) WHERE {canonical} IS NULL AND {source} IS NOT NULL"
    )))
}

fn backfill_sql(table: &str, canonical: &str) -> Result<Statement> {
    let (table, canonical) = (quote_ident(table)?, quote_ident(canonical)?);
    Ok(Statement::new(format!(
        "UPDATE {table} SET {canonical} = ? WHERE {canonical} IS NULL"
    )))
}

fn create_index_sql(table: &str, index: &IndexDef) -> Result<Statement> {
    Ok(Statement::new(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index.name)?,
        quote_ident(table)?,
        quote_ident(&index.column)?
    )))
}

/// Rebuild the table with `column` NOT NULL, in one transaction
fn enforce_not_null(db: &Database, report: &mut ReconciliationReport, desc: &SchemaDescriptor, column: &str) -> bool {
    let stmts = match rebuild_statements(desc, column) {
        Ok(stmts) => stmts,
        Err(e) => {
            report.fail(Step::EnforceNotNull, column, None, e.to_string());
            return false;
        }
    };
    let summary = format!("rebuild {} with {} NOT NULL", desc.table, column);

    match db.execute_rebuild(&stmts) {
        Ok(counts) => {
            report.entries.push(ReportEntry {
                step: Step::EnforceNotNull,
                subject: column.to_string(),
                statement: Some(summary),
                outcome: Outcome::Applied {
                    rows: counts.get(REBUILD_COPY).copied().unwrap_or(0),
                },
            });
            true
        }
        Err(e) => {
            report.fail(Step::EnforceNotNull, column, Some(summary), e.to_string());
            false
        }
    }
}

/// Position of the row copy within `rebuild_statements`
const REBUILD_COPY: usize = 2;

/// SQLite cannot alter a column's constraints, so the table is copied into a
/// shadow table and renamed back. The shadow is created from the table's own
/// `CREATE TABLE` text with ` NOT NULL` appended to the column's definition,
/// which keeps CHECK, COLLATE, generated columns, foreign keys and table
/// options exactly as written. Explicit indexes, triggers and the
/// AUTOINCREMENT counter are restored afterwards.
///
/// Run the result through [`Database::execute_rebuild`] so views and foreign
/// keys that point at the table survive the drop and rename.
pub fn rebuild_statements(desc: &SchemaDescriptor, column: &str) -> Result<Vec<Statement>> {
    let create_sql = desc
        .create_sql
        .as_deref()
        .ok_or_else(|| DbError::Validation(format!("no CREATE TABLE text for {}", desc.table)))?;
    if desc.column(column).is_some_and(|c| c.generated) {
        return Err(DbError::Validation(format!("{} is a generated column", column)));
    }
    let body = tighten_column(create_sql, column).ok_or_else(|| {
        DbError::Validation(format!(
            "cannot find the definition of {} in the CREATE TABLE text of {}",
            column, desc.table
        ))
    })?;

    let shadow_name = format!("{}__reconcile", desc.table);
    let (table, shadow) = (quote_name(&desc.table), quote_name(&shadow_name));
    let cols = desc
        .columns
        .iter()
        .filter(|c| !c.generated)
        .map(|c| quote_name(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmts = vec![
        Statement::new(format!("DROP TABLE IF EXISTS {}", shadow)),
        Statement::new(format!("CREATE TABLE {} {}", shadow, body)),
        Statement::new(format!("INSERT INTO {shadow} ({cols}) SELECT {cols} FROM {table}")),
    ];
    if desc.is_autoincrement() {
        stmts.push(Statement::new("DELETE FROM sqlite_sequence WHERE name = ?").bind(shadow_name.as_str()));
        stmts.push(
            Statement::new("INSERT INTO sqlite_sequence (name, seq) SELECT ?, seq FROM sqlite_sequence WHERE name = ?")
                .bind(shadow_name.as_str())
                .bind(desc.table.as_str()),
        );
    }
    stmts.push(Statement::new(format!("DROP TABLE {}", table)));
    stmts.push(Statement::new(format!("ALTER TABLE {} RENAME TO {}", shadow, table)));
    stmts.extend(
        desc.indexes
            .iter()
            .filter(|i| i.origin == IndexOrigin::Explicit)
            .filter_map(|i| i.sql.clone())
            .map(Statement::new),
    );
    stmts.extend(desc.triggers.iter().map(|t| Statement::new(t.sql.clone())));
    Ok(stmts)
}

// ============================================================================
// CREATE TABLE text
// ============================================================================

/// Column list of a `CREATE TABLE` statement split at its top-level commas
struct TableBody {
    /// Byte offset of the `(` that opens the column list
    open: usize,
    /// Per definition: start offset and the end of its last non-comment token
    defs: Vec<(usize, usize)>,
}

/// Offset just past a quoted run starting at `start`. A doubled closing
/// character is an escaped one.
fn skip_quoted(sql: &[u8], start: usize, close: u8) -> usize {
    let mut i = start + 1;
    while i < sql.len() {
        if sql[i] == close {
            if close != b']' && sql.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    sql.len()
}

/// Offset just past a comment starting at `start`, if one starts there
fn skip_comment(sql: &[u8], start: usize) -> Option<usize> {
    match (sql[start], sql.get(start + 1)) {
        (b'-', Some(b'-')) => Some(
            sql[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(sql.len(), |n| start + n),
        ),
        (b'/', Some(b'*')) => Some(
            sql[start + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(sql.len(), |n| start + 2 + n + 2),
        ),
        _ => None,
    }
}

fn split_table_body(sql: &str) -> Option<TableBody> {
    let b = sql.as_bytes();
    let mut open = None;
    let mut defs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut last_code = 0;
    let mut i = 0;

    while i < b.len() {
        if let Some(next) = skip_comment(b, i) {
            i = next;
            continue;
        }
        match b[i] {
            q @ (b'\'' | b'"' | b'`') => {
                i = skip_quoted(b, i, q);
                last_code = i;
                continue;
            }
            b'[' => {
                i = skip_quoted(b, i, b']');
                last_code = i;
                continue;
            }
            b'(' => {
                depth += 1;
                if open.is_none() {
                    open = Some(i);
                    start = i + 1;
                    i += 1;
                    last_code = i;
                    continue;
                }
            }
            b')' => {
                if depth == 1 {
                    defs.push((start, last_code));
                    return open.map(|open| TableBody { open, defs });
                }
                depth = depth.saturating_sub(1);
            }
            b',' if depth == 1 => {
                defs.push((start, last_code));
                i += 1;
                start = i;
                last_code = i;
                continue;
            }
            _ => {}
        }
        if !b[i].is_ascii_whitespace() {
            last_code = i + 1;
        }
        i += 1;
    }
    None
}

/// Name a column definition starts with, or `None` for a table constraint
fn leading_name(def: &str) -> Option<String> {
    let b = def.as_bytes();
    let mut i = 0;
    while i < b.len() {
        if let Some(next) = skip_comment(b, i) {
            i = next;
        } else if b[i].is_ascii_whitespace() {
            i += 1;
        } else {
            break;
        }
    }
    let rest = &def[i..];
    let close = match rest.as_bytes().first()? {
        b'"' => '"',
        b'`' => '`',
        b'\'' => '\'',
        b'[' => ']',
        _ => {
            let word: String = rest
                .chars()
                .take_while(|c| !c.is_whitespace() && !matches!(c, '(' | ',' | '-' | '/'))
                .collect();
            let keyword = word.to_ascii_uppercase();
            return match keyword.as_str() {
                "CONSTRAINT" | "PRIMARY" | "UNIQUE" | "CHECK" | "FOREIGN" | "" => None,
                _ => Some(word),
            };
        }
    };
    let end = skip_quoted(rest.as_bytes(), 0, close as u8);
    let inner = rest.get(1..end.saturating_sub(1))?;
    if close == ']' {
        Some(inner.to_string())
    } else {
        let doubled = format!("{}{}", close, close);
        Some(inner.replace(&doubled, &close.to_string()))
    }
}

/// Column list of `create_sql` (from its opening parenthesis to the end) with
/// ` NOT NULL` appended to the definition of `column`
fn tighten_column(create_sql: &str, column: &str) -> Option<String> {
    let body = split_table_body(create_sql)?;
    let (_, end) = body
        .defs
        .iter()
        .copied()
        .find(|&(start, end)| leading_name(&create_sql[start..end]).is_some_and(|n| n.eq_ignore_ascii_case(column)))?;
    Some(format!(
        "{} NOT NULL{}",
        &create_sql[body.open..end],
        &create_sql[end..]
    ))
}
