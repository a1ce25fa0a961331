//! Postgres-backed implementations of the collaborator traits the core
//! deliberately leaves external: tenant directory, cost-history reader, and
//! the export data source. None of these own domain logic — they only
//! translate rows the same migrations already define into the shapes the
//! core/export crates consume.

pub mod cost_history;
pub mod export_source;
pub mod tenant_directory;

pub use cost_history::PostgresCostHistoryReader;
pub use export_source::PostgresExportDataSource;
pub use tenant_directory::PostgresTenantDirectory;
