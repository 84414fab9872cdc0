mod enrollments;
mod fees;
mod repository;

pub use fees::FeeRecordQuery;
pub use repository::*;

/// SQL migration for people, classes, years and enrollment history
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// SQL migration for fee records, payments, history and the ledger
pub const MIGRATION_002_FEES: &str = include_str!("migrations/002_fees.sql");

/// SQL migration for the security event log
pub const MIGRATION_003_SECURITY: &str = include_str!("migrations/003_security_events.sql");
