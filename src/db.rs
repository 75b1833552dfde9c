//! SQLite access with Diesel
//!
//! Everything here works on raw SQL: the tables this tool touches belong to
//! the PoultryMetrics installation and their shape is discovered at runtime,
//! so there is no `table!` schema to lean on.

use crate::schema::{
    quote_ident, quote_name, ColumnInfo, ForeignKeyInfo, IndexInfo, IndexOrigin, Row,
    SchemaDescriptor, SqlValue, Statement, TriggerInfo,
};
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel::sqlite::{Sqlite, SqliteConnection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Env var that overrides every other database path source
pub const DB_PATH_ENV: &str = "POULTRYMETRICS_DB_PATH";

/// Walk up directory tree to find .poultrymetrics folder (like git finds .git)
fn find_db_in_parents() -> Option<PathBuf> {
    let current_dir = std::env::current_dir().ok()?;
    let mut dir = current_dir.as_path();
    loop {
        let pm_dir = dir.join(".poultrymetrics");
        if pm_dir.is_dir() {
            return Some(pm_dir.join("poultrymetrics.db"));
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return None,
        }
    }
}

/// Resolve the database path: env var, then config, then `.poultrymetrics/`
pub fn resolve_db_path(configured: Option<&Path>) -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    find_db_in_parents().unwrap_or_else(|| PathBuf::from(".poultrymetrics/poultrymetrics.db"))
}

// ============================================================================
// Helper structs for raw SQL queries
// ============================================================================

/// Helper for PRAGMA table_xinfo queries
#[derive(QueryableByName, Debug)]
struct PragmaTableInfo {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    r#type: String,
    #[diesel(sql_type = Integer)]
    notnull: i32,
    #[diesel(sql_type = Nullable<Text>)]
    dflt_value: Option<String>,
    #[diesel(sql_type = Integer)]
    pk: i32,
    /// 0 plain, 1 hidden (virtual tables), 2 generated virtual, 3 generated stored
    #[diesel(sql_type = Integer)]
    hidden: i32,
}

/// Helper for PRAGMA index_list queries
#[derive(QueryableByName, Debug)]
struct PragmaIndexList {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Integer)]
    unique: i32,
    #[diesel(sql_type = Text)]
    origin: String,
    #[diesel(sql_type = Integer)]
    partial: i32,
}

/// Helper for PRAGMA index_info queries
#[derive(QueryableByName, Debug)]
struct PragmaIndexInfo {
    #[diesel(sql_type = Integer)]
    seqno: i32,
    #[diesel(sql_type = Nullable<Text>)]
    name: Option<String>,
}

/// Helper for PRAGMA foreign_key_list queries
#[derive(QueryableByName, Debug)]
struct PragmaForeignKey {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = Integer)]
    seq: i32,
    #[diesel(sql_type = Text)]
    table: String,
    #[diesel(sql_type = Text)]
    from: String,
    #[diesel(sql_type = Nullable<Text>)]
    to: Option<String>,
    #[diesel(sql_type = Text)]
    on_update: String,
    #[diesel(sql_type = Text)]
    on_delete: String,
}

/// Helper for sqlite_master queries
#[derive(QueryableByName, Debug)]
struct MasterEntry {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Nullable<Text>)]
    sql: Option<String>,
}

/// Helper for PRAGMA foreign_keys
#[derive(QueryableByName, Debug)]
struct ForeignKeysFlag {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}

/// Helper for id lookups
#[derive(QueryableByName, Debug)]
struct IdOnly {
    #[diesel(sql_type = Nullable<BigInt>)]
    id: Option<i64>,
}

/// Helper for single text value lookups
#[derive(QueryableByName, Debug)]
struct TextOnly {
    #[diesel(sql_type = Nullable<Text>)]
    value: Option<String>,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),
    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

fn boxed(stmt: &Statement) -> BoxedSqlQuery<'static, Sqlite, SqlQuery> {
    let mut query = diesel::sql_query(stmt.sql.clone()).into_boxed::<Sqlite>();
    for value in &stmt.binds {
        query = match value {
            SqlValue::Null => query.bind::<Nullable<Text>, _>(None::<String>),
            SqlValue::Integer(n) => query.bind::<BigInt, _>(*n),
            SqlValue::Text(s) => query.bind::<Text, _>(s.clone()),
        };
    }
    query
}

fn run_batch(conn: &mut SqliteConnection, stmts: &[Statement]) -> Result<Vec<usize>> {
    conn.transaction::<Vec<usize>, DbError, _>(|conn| {
        let mut counts = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            tracing::debug!(sql = %stmt, "execute (batch)");
            counts.push(boxed(stmt).execute(conn)?);
        }
        Ok(counts)
    })
}

impl Database {
    /// Open database at the resolved default path (respects POULTRYMETRICS_DB_PATH)
    pub fn open(configured: Option<&Path>) -> Result<Self> {
        let path = resolve_db_path(configured);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::Connection(e.to_string()))?;
            }
        }
        Self::open_at(&path)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(&path_str);
        let pool = Pool::builder()
            .max_size(5)
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        tracing::debug!(path = %path_str, "opened database");
        Ok(Self {
            pool,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Read everything SQLite knows about `table` in one go
    pub fn describe_table(&self, table: &str) -> Result<SchemaDescriptor> {
        quote_ident(table)?;
        let mut conn = self.get_conn()?;

        let master: Vec<MasterEntry> = diesel::sql_query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?)",
        )
        .bind::<Text, _>(table)
        .load(&mut conn)?;

        let Some(entry) = master.into_iter().next() else {
            return Ok(SchemaDescriptor::missing(table));
        };
        // From here on, use the name as stored; it may not be a plain identifier
        let quoted = quote_name(&entry.name);

        let columns: Vec<ColumnInfo> = diesel::sql_query(format!("PRAGMA table_xinfo({})", quoted))
            .load::<PragmaTableInfo>(&mut conn)?
            .into_iter()
            .filter(|c| c.hidden != 1)
            .map(|c| ColumnInfo {
                name: c.name,
                decl_type: c.r#type,
                not_null: c.notnull != 0,
                default: c.dflt_value,
                pk: c.pk,
                generated: c.hidden >= 2,
            })
            .collect();

        let index_sql: BTreeMap<String, Option<String>> = diesel::sql_query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ?",
        )
        .bind::<Text, _>(entry.name.clone())
        .load::<MasterEntry>(&mut conn)?
        .into_iter()
        .map(|e| (e.name, e.sql))
        .collect();

        let mut indexes = Vec::new();
        for idx in diesel::sql_query(format!("PRAGMA index_list({})", quoted))
            .load::<PragmaIndexList>(&mut conn)?
        {
            let mut info: Vec<PragmaIndexInfo> =
                diesel::sql_query(format!("PRAGMA index_info({})", quote_name(&idx.name)))
                    .load(&mut conn)?;
            info.sort_by_key(|i| i.seqno);

            indexes.push(IndexInfo {
                sql: index_sql.get(&idx.name).cloned().flatten(),
                name: idx.name,
                unique: idx.unique != 0,
                origin: IndexOrigin::from_pragma(&idx.origin),
                partial: idx.partial != 0,
                columns: info.into_iter().filter_map(|i| i.name).collect(),
            });
        }

        let triggers: Vec<TriggerInfo> = diesel::sql_query(
            "SELECT name, sql FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ? ORDER BY rowid",
        )
        .bind::<Text, _>(entry.name.clone())
        .load::<MasterEntry>(&mut conn)?
        .into_iter()
        .filter_map(|e| e.sql.map(|sql| TriggerInfo { name: e.name, sql }))
        .collect();

        let mut fk_rows: Vec<PragmaForeignKey> =
            diesel::sql_query(format!("PRAGMA foreign_key_list({})", quoted)).load(&mut conn)?;
        fk_rows.sort_by_key(|fk| (fk.id, fk.seq));

        let mut foreign_keys: Vec<ForeignKeyInfo> = Vec::new();
        let mut current_id = None;
        for fk in fk_rows {
            if current_id != Some(fk.id) {
                current_id = Some(fk.id);
                foreign_keys.push(ForeignKeyInfo {
                    table: fk.table.clone(),
                    from: Vec::new(),
                    to: Vec::new(),
                    on_update: fk.on_update.clone(),
                    on_delete: fk.on_delete.clone(),
                });
            }
            if let Some(last) = foreign_keys.last_mut() {
                last.from.push(fk.from);
                last.to.push(fk.to);
            }
        }

        Ok(SchemaDescriptor {
            table: entry.name,
            exists: true,
            columns,
            indexes,
            foreign_keys,
            triggers,
            create_sql: entry.sql,
        })
    }

    /// Like `describe_table`, but a failed read counts as "not there"
    pub fn probe(&self, table: &str) -> SchemaDescriptor {
        match self.describe_table(table) {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(table, error = %e, "schema probe failed, treating table as missing");
                SchemaDescriptor::missing(table)
            }
        }
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.probe(table).exists
    }

    pub fn column_exists(&self, table: &str, column: &str) -> bool {
        self.probe(table).has_column(column)
    }

    pub fn index_exists(&self, table: &str, index: &str) -> bool {
        self.probe(table).has_index(index)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Run one statement, returning affected rows
    pub fn execute(&self, stmt: &Statement) -> Result<usize> {
        let mut conn = self.get_conn()?;
        tracing::debug!(sql = %stmt, "execute");
        Ok(boxed(stmt).execute(&mut conn)?)
    }

    /// Run statements in order inside one transaction, returning per-statement counts.
    ///
    /// SQLite leaves the change counter untouched on DDL, so only the counts of
    /// INSERT/UPDATE/DELETE entries mean anything.
    pub fn execute_batch(&self, stmts: &[Statement]) -> Result<Vec<usize>> {
        let mut conn = self.get_conn()?;
        run_batch(&mut conn, stmts)
    }

    /// `execute_batch` for a drop-and-rename table rebuild.
    ///
    /// Foreign key enforcement is off for the duration, so dropping the old
    /// table does not cascade. `legacy_alter_table` keeps the final rename from
    /// re-validating views and triggers that name the table while it is gone.
    /// Both settings are restored on the connection afterwards.
    pub fn execute_rebuild(&self, stmts: &[Statement]) -> Result<Vec<usize>> {
        let mut conn = self.get_conn()?;
        let fk_enabled = diesel::sql_query("PRAGMA foreign_keys")
            .load::<ForeignKeysFlag>(&mut conn)?
            .first()
            .map(|f| f.foreign_keys != 0)
            .unwrap_or(false);

        diesel::sql_query("PRAGMA foreign_keys = OFF").execute(&mut conn)?;
        diesel::sql_query("PRAGMA legacy_alter_table = ON").execute(&mut conn)?;
        let result = run_batch(&mut conn, stmts);

        let mut restore = vec!["PRAGMA legacy_alter_table = OFF"];
        if fk_enabled {
            restore.push("PRAGMA foreign_keys = ON");
        }
        for pragma in restore {
            if let Err(e) = diesel::sql_query(pragma).execute(&mut conn) {
                tracing::warn!(pragma, error = %e, "could not restore connection setting");
            }
        }
        result
    }

    /// Insert a row with whatever columns `row` carries, returning the new rowid
    pub fn insert_row(&self, table: &str, row: &Row) -> Result<i64> {
        if row.is_empty() {
            return Err(DbError::Validation(format!(
                "Refusing to insert an empty row into {}",
                table
            )));
        }

        let columns = row
            .keys()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        let placeholders = vec!["?"; row.len()].join(", ");
        let mut stmt = Statement::new(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            columns.join(", "),
            placeholders
        ));
        stmt.binds = row.values().cloned().collect();

        // last_insert_rowid() is per connection, so both run on the same one
        let mut conn = self.get_conn()?;
        tracing::debug!(sql = %stmt, "insert");
        boxed(&stmt).execute(&mut conn)?;

        let id: i64 = diesel::select(diesel::dsl::sql::<BigInt>("last_insert_rowid()"))
            .first(&mut conn)?;
        Ok(id)
    }

    /// First `id_column` value of a row whose `column` equals `value`.
    ///
    /// `id_column` comes from the table's own metadata and may be any name.
    pub fn find_id_by(
        &self,
        table: &str,
        id_column: &str,
        column: &str,
        value: &SqlValue,
    ) -> Result<Option<i64>> {
        let stmt = Statement::new(format!(
            "SELECT CAST({} AS INTEGER) AS id FROM {} WHERE {} = ? LIMIT 1",
            quote_name(id_column),
            quote_ident(table)?,
            quote_ident(column)?
        ))
        .bind(value.clone());

        let mut conn = self.get_conn()?;
        let rows: Vec<IdOnly> = boxed(&stmt).load(&mut conn)?;
        Ok(rows.into_iter().next().and_then(|r| r.id))
    }

    /// One column of the row whose `key_column` (a name read from metadata)
    /// equals `key`, as text
    pub fn fetch_text(
        &self,
        table: &str,
        key_column: &str,
        key: &SqlValue,
        column: &str,
    ) -> Result<Option<String>> {
        let stmt = Statement::new(format!(
            "SELECT CAST({} AS TEXT) AS value FROM {} WHERE {} = ? LIMIT 1",
            quote_ident(column)?,
            quote_ident(table)?,
            quote_name(key_column)
        ))
        .bind(key.clone());

        let mut conn = self.get_conn()?;
        let rows: Vec<TextOnly> = boxed(&stmt).load(&mut conn)?;
        Ok(rows.into_iter().next().and_then(|r| r.value))
    }

    /// Every value of one column, in rowid order (used by tests and the CLI smoke checks)
    pub fn column_values(&self, table: &str, column: &str) -> Result<Vec<Option<String>>> {
        let stmt = Statement::new(format!(
            "SELECT CAST({} AS TEXT) AS value FROM {} ORDER BY rowid",
            quote_ident(column)?,
            quote_ident(table)?
        ));
        let mut conn = self.get_conn()?;
        let rows: Vec<TextOnly> = boxed(&stmt).load(&mut conn)?;
        Ok(rows.into_iter().map(|r| r.value).collect())
    }
}
