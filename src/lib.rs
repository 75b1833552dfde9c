//! PoultryMetrics admin helpers
//!
//! Keeps a long-lived PoultryMetrics SQLite database in the shape the app
//! expects, and ties worker logins to employee records.
//!
//! # Overview
//!
//! Installations have drifted over the years: tables created by hand, date
//! columns with legacy names, employees tables with whatever columns the
//! farm needed at the time. Nothing here assumes a shape. Every step probes
//! the live schema first and adapts.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `reconcile` | Bring `egg_production` up to the canonical shape |
//! | `link` | Find or create the employee row for a worker login |
//! | `db` | Pooled SQLite access and schema introspection |
//! | `session` | Per-role session namespaces |
//! | `mail` | Best-effort outbound mail |
//!
//! # Quick Start
//!
//! ```no_run
//! use poultrymetrics_admin::{reconcile, Database, Identity, LinkerConfig, TargetTableSpec};
//!
//! let db = Database::open_at("poultrymetrics.db").unwrap();
//!
//! let report = reconcile(&db, &TargetTableSpec::egg_production());
//! for entry in &report.entries {
//!     println!("{}", entry);
//! }
//!
//! let identity = Identity::new("worker", Some(7), Some("ada"));
//! match poultrymetrics_admin::ensure_link(&db, &LinkerConfig::default(), &identity) {
//!     Ok(outcome) => println!("{}", outcome),
//!     Err(e) => eprintln!("not linked: {}", e),
//! }
//! ```

pub mod config;
pub mod db;
pub mod link;
pub mod mail;
pub mod reconcile;
pub mod schema;
pub mod session;

pub use config::{Config, LinkerConfig, MailConfig, MailTransportKind};
pub use db::{resolve_db_path, Database, DbError, DB_PATH_ENV};
pub use link::{display_name, ensure_link, link_session, LinkError, LinkKey, LinkOutcome};
pub use mail::{send_mail, transport_from_config, MailMessage, MailResult, MailTransport, Recipient};
pub use reconcile::{
    reconcile, ColumnDef, IndexDef, Outcome, ReconciliationReport, ReportEntry, Step, TargetTableSpec,
};
pub use schema::{quote_ident, quote_name, Row, SchemaDescriptor, SqlValue, Statement};
pub use session::{session_cookie_name, Identity, MemorySession, Role, SessionStore};
