use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AcademicYear, Cents, Enrollment, FeeChangeHistory, FeePaymentRecord, LedgerTransaction,
    SchoolClass, Student, StudentBalance, StudentFeeRecord, YearSummary,
};

/// Everything billed to and paid by one student in one year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentStatement {
    pub student: Student,
    pub academic_year: AcademicYear,
    pub fees: Vec<StudentFeeRecord>,
    pub payments: Vec<FeePaymentRecord>,
    /// Derived from the ledger, not from the fee rows
    pub balance: StudentBalance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeRecordInfo {
    pub fee: StudentFeeRecord,
    pub student: Student,
    pub payments: Vec<FeePaymentRecord>,
    pub history: Vec<FeeChangeHistory>,
    pub transactions: Vec<LedgerTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub student: Student,
    pub balance: StudentBalance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentInfo {
    pub student: Student,
    pub current_enrollment: Option<EnrollmentInfo>,
}

/// An enrollment version with its class and year resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentInfo {
    pub enrollment: Enrollment,
    pub class_name: String,
    pub year_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRoster {
    pub class: SchoolClass,
    pub teacher_name: Option<String>,
    pub students: Vec<Student>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTypeSummary {
    pub fee_type: String,
    pub expected: Cents,
    pub collected: Cents,
    pub count: usize,
    /// Share of the year's expected total
    pub percentage: f64,
}

/// JSON export of a whole academic year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearSnapshot {
    pub academic_year: AcademicYear,
    pub generated_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub summary: YearSummary,
    pub by_fee_type: Vec<FeeTypeSummary>,
    pub fee_records: Vec<StudentFeeRecord>,
    pub payments: Vec<FeePaymentRecord>,
}

/// Group fee rows by fee type, largest expected amount first.
pub fn summarize_by_fee_type(rows: &[StudentFeeRecord]) -> Vec<FeeTypeSummary> {
    let mut grouped: BTreeMap<&str, (Cents, Cents, usize)> = BTreeMap::new();
    for row in rows {
        let entry = grouped.entry(row.fee_type.as_str()).or_insert((0, 0, 0));
        entry.0 += row.actual_amount - row.discount_amount;
        entry.1 += row.paid_amount;
        entry.2 += 1;
    }

    let total: Cents = grouped.values().map(|(expected, _, _)| expected).sum();

    let mut summaries: Vec<FeeTypeSummary> = grouped
        .into_iter()
        .map(|(fee_type, (expected, collected, count))| FeeTypeSummary {
            fee_type: fee_type.to_string(),
            expected,
            collected,
            count,
            percentage: if total > 0 {
                expected as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.expected.cmp(&a.expected));
    summaries
}
