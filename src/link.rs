//! Worker login -> employee record linking
//!
//! When a worker signs in, the app needs an `employees` row tied to their
//! `users` account. Installations disagree on what `employees` looks like,
//! so every column used here is discovered first: existing links are looked
//! up by `user_id`, then `username`, then `email`, and a new row is only
//! built from the columns that are actually there.

use crate::config::LinkerConfig;
use crate::db::Database;
use crate::schema::{Row, SchemaDescriptor, SqlValue};
use crate::session::{Identity, SessionStore};
use serde::Serialize;
use std::fmt;

/// Columns that can tie an employee to a user, in lookup priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKey {
    UserId,
    Username,
    Email,
}

impl LinkKey {
    pub const PRIORITY: [LinkKey; 3] = [LinkKey::UserId, LinkKey::Username, LinkKey::Email];

    pub fn column(&self) -> &'static str {
        match self {
            LinkKey::UserId => "user_id",
            LinkKey::Username => "username",
            LinkKey::Email => "email",
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LinkOutcome {
    /// An employee row already pointed at this user
    Existing {
        employee_id: i64,
        matched_by: LinkKey,
        user_id: i64,
    },
    Created {
        employee_id: i64,
        user_id: i64,
    },
}

impl LinkOutcome {
    pub fn employee_id(&self) -> i64 {
        match self {
            LinkOutcome::Existing { employee_id, .. } | LinkOutcome::Created { employee_id, .. } => {
                *employee_id
            }
        }
    }

    pub fn user_id(&self) -> i64 {
        match self {
            LinkOutcome::Existing { user_id, .. } | LinkOutcome::Created { user_id, .. } => *user_id,
        }
    }
}

impl fmt::Display for LinkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkOutcome::Existing {
                employee_id,
                matched_by,
                user_id,
            } => write!(
                f,
                "user {} linked to existing employee {} (matched by {})",
                user_id, employee_id, matched_by
            ),
            LinkOutcome::Created { employee_id, user_id } => {
                write!(f, "user {} linked to new employee {}", user_id, employee_id)
            }
        }
    }
}

/// Why no link was produced. None of these should block a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum LinkError {
    #[error("role {role:?} does not get an employee record")]
    NotApplicable { role: String },
    #[error("no user id in session and none found for the username")]
    MissingIdentity,
    #[error("table {table} does not exist")]
    MissingTable { table: String },
    #[error("table {table} has no id column and no rowid")]
    NoIdColumn { table: String },
    #[error("employee lookup by {key} failed: {detail}")]
    LookupFailed { key: LinkKey, detail: String },
    #[error("employees table has none of the columns needed to create a record")]
    NoInsertableColumns,
    #[error("employee insert failed: {detail}")]
    InsertFailed { detail: String },
}

/// Whatever the `users` row can tell us about the person
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub name: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> Option<String> {
        display_name(
            self.full_name.as_deref(),
            self.name.as_deref(),
            self.first_name.as_deref(),
            self.last_name.as_deref(),
        )
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `full_name`, else `name`, else "first last" (either half may be missing)
pub fn display_name(
    full_name: Option<&str>,
    name: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> Option<String> {
    if let Some(full) = non_blank(full_name).or_else(|| non_blank(name)) {
        return Some(full.to_string());
    }
    let joined = [non_blank(first_name), non_blank(last_name)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Column used as a row's numeric identifier: `id`, else a one-column
/// primary key, else the implicit rowid (absent on WITHOUT ROWID tables)
fn id_column(desc: &SchemaDescriptor) -> Option<String> {
    if let Some(id) = desc.column("id") {
        return Some(id.name.clone());
    }
    match desc.primary_key().as_slice() {
        [pk] => Some(pk.name.clone()),
        _ if desc.is_without_rowid() => None,
        _ => Some("rowid".to_string()),
    }
}

/// Whether `last_insert_rowid()` reports the value of `id_column`
fn id_is_rowid(desc: &SchemaDescriptor, id_column: &str) -> bool {
    if desc.is_without_rowid() {
        return false;
    }
    if id_column.eq_ignore_ascii_case("rowid") {
        return true;
    }
    match desc.primary_key().as_slice() {
        [pk] => pk.name.eq_ignore_ascii_case(id_column) && pk.decl_type.eq_ignore_ascii_case("INTEGER"),
        _ => false,
    }
}

fn resolve_user_id(db: &Database, users: &SchemaDescriptor, username: Option<&str>) -> Option<i64> {
    let username = username?;
    if !users.exists || !users.has_column("username") {
        return None;
    }
    let Some(id_column) = id_column(users) else {
        tracing::warn!(table = %users.table, "users table has no id column");
        return None;
    };
    match db.find_id_by(&users.table, &id_column, "username", &username.into()) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(error = %e, "user lookup by username failed");
            None
        }
    }
}

fn fetch_profile(db: &Database, users: &SchemaDescriptor, user_id: i64) -> UserProfile {
    let Some(id_column) = id_column(users).filter(|_| users.exists) else {
        return UserProfile::default();
    };
    let key = SqlValue::Integer(user_id);
    let field = |column: &str| -> Option<String> {
        if !users.has_column(column) {
            return None;
        }
        match db.fetch_text(&users.table, &id_column, &key, column) {
            Ok(value) => non_blank(value.as_deref()).map(str::to_string),
            Err(e) => {
                tracing::warn!(column, error = %e, "profile lookup failed");
                None
            }
        }
    };

    UserProfile {
        username: field("username"),
        email: field("email"),
        first_name: field("first_name"),
        last_name: field("last_name"),
        full_name: field("full_name"),
        name: field("name"),
    }
}

/// Values available for each link key
struct LinkValues {
    user_id: i64,
    username: Option<String>,
    email: Option<String>,
}

impl LinkValues {
    fn get(&self, key: LinkKey) -> Option<SqlValue> {
        match key {
            LinkKey::UserId => Some(SqlValue::Integer(self.user_id)),
            LinkKey::Username => self.username.clone().map(SqlValue::Text),
            LinkKey::Email => self.email.clone().map(SqlValue::Text),
        }
    }
}

/// First employee matching a link key, in priority order. A lookup that
/// errors stops the search: a later key must not hide an unreadable earlier one.
fn find_existing(
    db: &Database,
    employees: &SchemaDescriptor,
    id_column: &str,
    values: &LinkValues,
) -> Result<Option<(i64, LinkKey)>, LinkError> {
    for key in LinkKey::PRIORITY {
        if !employees.has_column(key.column()) {
            continue;
        }
        let Some(value) = values.get(key) else {
            continue;
        };
        match db.find_id_by(&employees.table, id_column, key.column(), &value) {
            Ok(Some(id)) => return Ok(Some((id, key))),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "employee lookup failed");
                return Err(LinkError::LookupFailed {
                    key,
                    detail: e.to_string(),
                });
            }
        }
    }
    Ok(None)
}

/// Every value a new employee row could carry, before intersecting with the live columns
fn candidate_row(config: &LinkerConfig, values: &LinkValues, profile: &UserProfile) -> Row {
    let mut row = Row::new();
    for key in LinkKey::PRIORITY {
        if let Some(value) = values.get(key) {
            row.insert(key.column().to_string(), value);
        }
    }
    if let Some(display) = profile.display_name() {
        row.insert("full_name".to_string(), SqlValue::Text(display.clone()));
        row.insert("name".to_string(), SqlValue::Text(display));
    }
    if let Some(first) = &profile.first_name {
        row.insert("first_name".to_string(), SqlValue::Text(first.clone()));
    }
    if let Some(last) = &profile.last_name {
        row.insert("last_name".to_string(), SqlValue::Text(last.clone()));
    }
    if !config.default_status.trim().is_empty() {
        row.insert("status".to_string(), SqlValue::Text(config.default_status.clone()));
    }
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    row.insert("created_at".to_string(), SqlValue::Text(now));
    row
}

/// Find or create the employee record for a signed-in worker.
///
/// Lookup and insert are not atomic. If the insert fails (for example on a
/// unique index another request just satisfied) the lookups run once more
/// before giving up. A lookup that errors is reported as
/// [`LinkError::LookupFailed`] and nothing is inserted.
pub fn ensure_link(db: &Database, config: &LinkerConfig, identity: &Identity) -> Result<LinkOutcome, LinkError> {
    if !identity.role.trim().eq_ignore_ascii_case(config.worker_role.trim()) {
        return Err(LinkError::NotApplicable {
            role: identity.role.clone(),
        });
    }

    let users = db.probe(&config.users_table);
    let user_id = match identity.user_id {
        Some(id) => id,
        None => resolve_user_id(db, &users, identity.username.as_deref()).ok_or(LinkError::MissingIdentity)?,
    };

    let employees = db.probe(&config.employees_table);
    if !employees.exists {
        return Err(LinkError::MissingTable {
            table: config.employees_table.clone(),
        });
    }

    let id_column = id_column(&employees).ok_or_else(|| LinkError::NoIdColumn {
        table: employees.table.clone(),
    })?;

    let profile = fetch_profile(db, &users, user_id);
    let values = LinkValues {
        user_id,
        username: identity.username.clone().or_else(|| profile.username.clone()),
        email: profile.email.clone(),
    };

    if let Some((employee_id, matched_by)) = find_existing(db, &employees, &id_column, &values)? {
        tracing::info!(user_id, employee_id, %matched_by, "worker already linked");
        return Ok(LinkOutcome::Existing {
            employee_id,
            matched_by,
            user_id,
        });
    }

    let row = employees.project(candidate_row(config, &values, &profile));
    if row.is_empty() {
        return Err(LinkError::NoInsertableColumns);
    }
    if !LinkKey::PRIORITY.iter().any(|k| row.contains_key(k.column())) {
        tracing::warn!(table = %employees.table, "new employee row carries no link key");
    }

    match db.insert_row(&employees.table, &row) {
        Ok(rowid) => {
            let employee_id = if id_is_rowid(&employees, &id_column) {
                rowid
            } else {
                match find_existing(db, &employees, &id_column, &values)? {
                    Some((id, _)) => id,
                    None => {
                        return Err(LinkError::InsertFailed {
                            detail: format!("row inserted but its {} could not be read back", id_column),
                        })
                    }
                }
            };
            tracing::info!(user_id, employee_id, "created employee record for worker");
            Ok(LinkOutcome::Created { employee_id, user_id })
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "employee insert failed, checking for a concurrent link");
            match find_existing(db, &employees, &id_column, &values) {
                Ok(Some((employee_id, matched_by))) => Ok(LinkOutcome::Existing {
                    employee_id,
                    matched_by,
                    user_id,
                }),
                Ok(None) | Err(_) => Err(LinkError::InsertFailed { detail: e.to_string() }),
            }
        }
    }
}

/// Run `ensure_link` for a session, storing a user id recovered from the username
pub fn link_session<S: SessionStore>(
    db: &Database,
    config: &LinkerConfig,
    session: &mut S,
) -> Result<LinkOutcome, LinkError> {
    let identity = session.identity();
    let outcome = ensure_link(db, config, &identity)?;
    if identity.user_id.is_none() {
        session.remember_user_id(outcome.user_id());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Statement;
    use crate::session::MemorySession;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("farm.db")).unwrap();
        (dir, db)
    }

    fn exec(db: &Database, sql: &str) {
        db.execute(&Statement::new(sql)).unwrap();
    }

    fn with_users(db: &Database) {
        exec(
            db,
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT,
                email TEXT,
                first_name TEXT,
                last_name TEXT,
                role TEXT
            )",
        );
        exec(
            db,
            "INSERT INTO users (id, username, email, first_name, last_name, role) VALUES
                (7, 'ada', 'ada@farm.test', 'Ada', 'Obi', 'worker'),
                (8, 'kemi', 'kemi@farm.test', NULL, NULL, 'worker')",
        );
    }

    fn employee_count(db: &Database) -> usize {
        db.column_values("employees", "rowid").unwrap().len()
    }

    fn worker(user_id: Option<i64>, username: Option<&str>) -> Identity {
        Identity::new("worker", user_id, username)
    }

    #[test]
    fn test_non_worker_is_not_applicable() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(&db, "CREATE TABLE employees (id INTEGER PRIMARY KEY, user_id INTEGER)");

        let identity = Identity::new("accountant", Some(7), Some("ada"));
        let result = ensure_link(&db, &LinkerConfig::default(), &identity);
        assert_eq!(
            result,
            Err(LinkError::NotApplicable {
                role: "accountant".to_string()
            })
        );
        assert_eq!(employee_count(&db), 0);
    }

    #[test]
    fn test_worker_role_is_case_insensitive() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(&db, "CREATE TABLE employees (id INTEGER PRIMARY KEY, user_id INTEGER)");

        let identity = Identity::new(" Worker", Some(7), None);
        assert!(ensure_link(&db, &LinkerConfig::default(), &identity).is_ok());
    }

    #[test]
    fn test_missing_identity() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(&db, "CREATE TABLE employees (id INTEGER PRIMARY KEY, user_id INTEGER)");

        let config = LinkerConfig::default();
        assert_eq!(
            ensure_link(&db, &config, &worker(None, None)),
            Err(LinkError::MissingIdentity)
        );
        assert_eq!(
            ensure_link(&db, &config, &worker(None, Some("nobody"))),
            Err(LinkError::MissingIdentity)
        );
    }

    #[test]
    fn test_missing_employees_table() {
        let (_dir, db) = temp_db();
        with_users(&db);
        assert_eq!(
            ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), None)),
            Err(LinkError::MissingTable {
                table: "employees".to_string()
            })
        );
    }

    #[test]
    fn test_creates_then_finds_by_user_id() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                full_name TEXT,
                status TEXT,
                created_at TEXT,
                hire_date TEXT
            )",
        );
        let config = LinkerConfig::default();

        let first = ensure_link(&db, &config, &worker(Some(7), Some("ada"))).unwrap();
        assert_eq!(first, LinkOutcome::Created { employee_id: 1, user_id: 7 });
        assert_eq!(
            db.fetch_text("employees", "id", &SqlValue::Integer(1), "full_name").unwrap(),
            Some("Ada Obi".to_string())
        );
        assert_eq!(
            db.fetch_text("employees", "id", &SqlValue::Integer(1), "status").unwrap(),
            Some("active".to_string())
        );
        assert!(db
            .fetch_text("employees", "id", &SqlValue::Integer(1), "created_at")
            .unwrap()
            .is_some());
        assert_eq!(
            db.fetch_text("employees", "id", &SqlValue::Integer(1), "hire_date").unwrap(),
            None
        );

        let second = ensure_link(&db, &config, &worker(Some(7), Some("ada"))).unwrap();
        assert_eq!(
            second,
            LinkOutcome::Existing {
                employee_id: 1,
                matched_by: LinkKey::UserId,
                user_id: 7
            }
        );
        assert_eq!(employee_count(&db), 1);
    }

    #[test]
    fn test_email_match_is_returned_without_duplicate() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, email TEXT)",
        );
        exec(&db, "INSERT INTO employees (user_id, email) VALUES (NULL, 'ada@farm.test')");

        let outcome = ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), None)).unwrap();
        assert_eq!(
            outcome,
            LinkOutcome::Existing {
                employee_id: 1,
                matched_by: LinkKey::Email,
                user_id: 7
            }
        );
        assert_eq!(employee_count(&db), 1);
    }

    #[test]
    fn test_user_id_outranks_username() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, username TEXT, email TEXT)",
        );
        exec(
            &db,
            "INSERT INTO employees (user_id, username, email) VALUES
                (NULL, 'ada', NULL),
                (7, NULL, NULL)",
        );

        let outcome = ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), Some("ada"))).unwrap();
        assert_eq!(outcome.employee_id(), 2);
        assert!(matches!(
            outcome,
            LinkOutcome::Existing {
                matched_by: LinkKey::UserId,
                ..
            }
        ));
    }

    #[test]
    fn test_no_insertable_columns() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(&db, "CREATE TABLE employees (id INTEGER PRIMARY KEY, badge_no TEXT, hire_date TEXT)");

        assert_eq!(
            ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), Some("ada"))),
            Err(LinkError::NoInsertableColumns)
        );
        assert_eq!(employee_count(&db), 0);
    }

    #[test]
    fn test_name_column_left_out_when_no_name_source() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (id INTEGER PRIMARY KEY, username TEXT, name TEXT NOT NULL DEFAULT 'unnamed')",
        );

        let outcome = ensure_link(&db, &LinkerConfig::default(), &worker(Some(8), None)).unwrap();
        assert!(matches!(outcome, LinkOutcome::Created { .. }));
        assert_eq!(
            db.fetch_text("employees", "id", &SqlValue::Integer(outcome.employee_id()), "username")
                .unwrap(),
            Some("kemi".to_string())
        );
        assert_eq!(
            db.fetch_text("employees", "id", &SqlValue::Integer(outcome.employee_id()), "name")
                .unwrap(),
            Some("unnamed".to_string())
        );
    }

    #[test]
    fn test_insert_failure_is_reported() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (id INTEGER PRIMARY KEY, user_id INTEGER, status TEXT CHECK (status IN ('on', 'off')))",
        );

        match ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), None)) {
            Err(LinkError::InsertFailed { detail }) => assert!(detail.contains("CHECK")),
            other => panic!("expected InsertFailed, got {:?}", other),
        }
        assert_eq!(employee_count(&db), 0);
    }

    #[test]
    fn test_failed_lookup_does_not_insert() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (
                id INTEGER PRIMARY KEY,
                email TEXT,
                meta TEXT,
                user_id INTEGER GENERATED ALWAYS AS (json_extract(meta, '$.uid')) VIRTUAL
            )",
        );
        exec(&db, "INSERT INTO employees (email, meta) VALUES ('kemi@farm.test', 'not json')");

        match ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), None)) {
            Err(LinkError::LookupFailed { key, detail }) => {
                assert_eq!(key, LinkKey::UserId);
                assert!(detail.contains("JSON"), "{}", detail);
            }
            other => panic!("expected LookupFailed, got {:?}", other),
        }
        assert_eq!(employee_count(&db), 1);
    }

    #[test]
    fn test_without_rowid_employees_use_primary_key() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (user_id INTEGER PRIMARY KEY, email TEXT, full_name TEXT) WITHOUT ROWID",
        );
        let config = LinkerConfig::default();

        let first = ensure_link(&db, &config, &worker(Some(7), None)).unwrap();
        assert_eq!(first, LinkOutcome::Created { employee_id: 7, user_id: 7 });
        assert_eq!(
            db.fetch_text("employees", "user_id", &SqlValue::Integer(7), "full_name").unwrap(),
            Some("Ada Obi".to_string())
        );

        let second = ensure_link(&db, &config, &worker(Some(7), None)).unwrap();
        assert_eq!(
            second,
            LinkOutcome::Existing {
                employee_id: 7,
                matched_by: LinkKey::UserId,
                user_id: 7
            }
        );
        assert_eq!(db.column_values("employees", "email").unwrap().len(), 1);
    }

    #[test]
    fn test_without_rowid_and_composite_key_has_no_id() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (dept TEXT, badge INTEGER, user_id INTEGER, PRIMARY KEY (dept, badge)) WITHOUT ROWID",
        );

        assert_eq!(
            ensure_link(&db, &LinkerConfig::default(), &worker(Some(7), None)),
            Err(LinkError::NoIdColumn {
                table: "employees".to_string()
            })
        );
        assert!(db.column_values("employees", "dept").unwrap().is_empty());
    }

    #[test]
    fn test_employees_with_unusual_index_name() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(
            &db,
            "CREATE TABLE employees (id INTEGER PRIMARY KEY, user_id INTEGER, dept TEXT, full_name TEXT)",
        );
        exec(&db, "CREATE INDEX \"employees-dept\" ON employees (dept)");

        let outcome = ensure_link(&db, &LinkerConfig::default(), &worker(Some(8), None)).unwrap();
        assert_eq!(outcome, LinkOutcome::Created { employee_id: 1, user_id: 8 });
        assert_eq!(employee_count(&db), 1);
    }

    #[test]
    fn test_session_gets_resolved_user_id() {
        let (_dir, db) = temp_db();
        with_users(&db);
        exec(&db, "CREATE TABLE employees (id INTEGER PRIMARY KEY, user_id INTEGER)");

        let mut session = MemorySession::new(worker(None, Some("ada")));
        let outcome = link_session(&db, &LinkerConfig::default(), &mut session).unwrap();
        assert_eq!(outcome.user_id(), 7);
        assert_eq!(session.identity().user_id, Some(7));
    }

    #[test]
    fn test_custom_table_names() {
        let (_dir, db) = temp_db();
        exec(&db, "CREATE TABLE accounts (id INTEGER PRIMARY KEY, username TEXT, full_name TEXT)");
        exec(&db, "INSERT INTO accounts (id, username, full_name) VALUES (3, 'tunde', 'Tunde Bello')");
        exec(&db, "CREATE TABLE staff (id INTEGER PRIMARY KEY, user_id INTEGER, name TEXT)");

        let config = LinkerConfig {
            users_table: "accounts".to_string(),
            employees_table: "staff".to_string(),
            ..LinkerConfig::default()
        };
        let outcome = ensure_link(&db, &config, &worker(None, Some("tunde"))).unwrap();
        assert_eq!(outcome, LinkOutcome::Created { employee_id: 1, user_id: 3 });
        assert_eq!(
            db.fetch_text("staff", "id", &SqlValue::Integer(1), "name").unwrap(),
            Some("Tunde Bello".to_string())
        );
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(
            display_name(Some("Ada Obi"), Some("ada"), Some("A"), Some("O")),
            Some("Ada Obi".to_string())
        );
        assert_eq!(display_name(Some("  "), Some("ada"), None, None), Some("ada".to_string()));
        assert_eq!(display_name(None, None, Some(" Ada "), Some("Obi")), Some("Ada Obi".to_string()));
        assert_eq!(display_name(None, None, None, Some("Obi")), Some("Obi".to_string()));
        assert_eq!(display_name(None, Some(""), Some(" "), None), None);
    }

    proptest! {
        #[test]
        fn display_name_is_trimmed_and_never_blank(
            full in proptest::option::of("[ a-zA-Z]{0,8}"),
            name in proptest::option::of("[ a-zA-Z]{0,8}"),
            first in proptest::option::of("[ a-zA-Z]{0,8}"),
            last in proptest::option::of("[ a-zA-Z]{0,8}"),
        ) {
            let all_blank = [&full, &name, &first, &last]
                .iter()
                .all(|v| v.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true));
            match display_name(full.as_deref(), name.as_deref(), first.as_deref(), last.as_deref()) {
                Some(d) => {
                    prop_assert!(!all_blank);
                    prop_assert_eq!(d.trim(), d.as_str());
                    prop_assert!(!d.is_empty());
                }
                None => prop_assert!(all_blank),
            }
        }
    }
}
