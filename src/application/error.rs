use thiserror::Error;

use crate::domain::{Cents, EnrollmentError, Permission, ReversalError, Role};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Student not found: {0}")]
    StudentNotFound(String),

    #[error("Student already exists: {0}")]
    StudentAlreadyExists(String),

    #[error("Student is archived: {0}")]
    StudentArchived(String),

    #[error("Student is not archived: {0}")]
    StudentNotArchived(String),

    #[error("Teacher not found: {0}")]
    TeacherNotFound(String),

    #[error("Teacher already exists: {0}")]
    TeacherAlreadyExists(String),

    #[error("Class not found: {0}")]
    ClassNotFound(String),

    #[error("Class already exists: {0}")]
    ClassAlreadyExists(String),

    #[error("Class {class} is full (capacity {capacity})")]
    ClassFull { class: String, capacity: i64 },

    #[error("Academic year not found: {0}")]
    YearNotFound(String),

    #[error("Academic year already exists: {0}")]
    YearAlreadyExists(String),

    #[error("No current academic year is set")]
    NoCurrentYear,

    #[error("{fee_type} is already assigned to {admission_number} for {year}")]
    FeeAlreadyAssigned {
        admission_number: String,
        year: String,
        fee_type: String,
    },

    #[error("Fee record not found: {0}")]
    FeeRecordNotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid fee type: {0:?}")]
    InvalidFeeType(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Amount {requested} exceeds outstanding balance {outstanding}")]
    ExceedsOutstanding { outstanding: Cents, requested: Cents },

    #[error("New amount {requested} is below discounts and payments already applied ({committed})")]
    AdjustmentBelowCommitted { committed: Cents, requested: Cents },

    #[error("Payment {0} has already been reversed")]
    PaymentAlreadyReversed(String),

    #[error("Reversal rejected: {0}")]
    Reversal(#[from] ReversalError),

    #[error("Enrollment change rejected: {0}")]
    Enrollment(#[from] EnrollmentError),

    #[error("Student {0} has ledger history and cannot be deleted; archive instead")]
    HasLedgerHistory(String),

    #[error("Permission denied: role {role} cannot {permission}")]
    PermissionDenied { role: Role, permission: Permission },

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}
