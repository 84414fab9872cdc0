use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{AcademicYearId, Cents, FeeStatus, StudentFeeRecord};

/// Fee totals for one academic year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearSummary {
    pub academic_year_id: AcademicYearId,
    /// Sum of billed amounts before discounts
    pub total_actual: Cents,
    pub total_discount: Cents,
    /// Billed net of discounts
    pub total_expected: Cents,
    pub total_collected: Cents,
    pub total_pending: Cents,
    /// Percentage of `total_expected` collected, 0 when nothing is expected
    pub collection_rate: f64,
    pub overdue_count: usize,
    pub record_count: usize,
    pub pending_count: usize,
    pub partial_count: usize,
    pub paid_count: usize,
    pub student_count: usize,
}

/// Reduce fee rows to a year summary. Rows from other years are ignored.
///
/// `total_collected + total_pending + total_discount == total_actual` always
/// holds because pending is computed per row as `actual - discount - paid`.
pub fn summarize_year(
    academic_year_id: AcademicYearId,
    rows: &[StudentFeeRecord],
    today: NaiveDate,
) -> YearSummary {
    let mut summary = YearSummary {
        academic_year_id,
        total_actual: 0,
        total_discount: 0,
        total_expected: 0,
        total_collected: 0,
        total_pending: 0,
        collection_rate: 0.0,
        overdue_count: 0,
        record_count: 0,
        pending_count: 0,
        partial_count: 0,
        paid_count: 0,
        student_count: 0,
    };
    let mut students = HashSet::new();

    for row in rows.iter().filter(|r| r.academic_year_id == academic_year_id) {
        summary.record_count += 1;
        summary.total_actual += row.actual_amount;
        summary.total_discount += row.discount_amount;
        summary.total_collected += row.paid_amount;
        summary.total_pending += row.outstanding();

        match row.status {
            FeeStatus::Pending => summary.pending_count += 1,
            FeeStatus::Partial => summary.partial_count += 1,
            FeeStatus::Paid => summary.paid_count += 1,
        }
        if row.is_overdue(today) {
            summary.overdue_count += 1;
        }
        students.insert(row.student_id);
    }

    summary.student_count = students.len();
    summary.total_expected = summary.total_actual - summary.total_discount;
    if summary.total_expected > 0 {
        summary.collection_rate =
            summary.total_collected as f64 / summary.total_expected as f64 * 100.0;
    }

    summary
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::FeeAmounts;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(
        student: Uuid,
        year: AcademicYearId,
        amounts: (Cents, Cents, Cents),
        due: &str,
    ) -> StudentFeeRecord {
        let mut fee = StudentFeeRecord::new(student, year, "tuition".into(), amounts.0, date(due));
        fee.set_amounts(FeeAmounts {
            actual: amounts.0,
            discount: amounts.1,
            paid: amounts.2,
        });
        fee
    }

    #[test]
    fn test_empty_year() {
        let summary = summarize_year(Uuid::new_v4(), &[], date("2024-10-01"));
        assert_eq!(summary.record_count, 0);
        assert_eq!(summary.total_expected, 0);
        assert_eq!(summary.collection_rate, 0.0);
    }

    #[test]
    fn test_totals_balance() {
        let year = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let rows = vec![
            row(alice, year, (100000, 10000, 90000), "2024-09-15"),
            row(alice, year, (20000, 0, 5000), "2024-09-15"),
            row(bob, year, (100000, 0, 0), "2024-09-15"),
        ];

        let summary = summarize_year(year, &rows, date("2024-10-01"));

        assert_eq!(summary.total_actual, 220000);
        assert_eq!(summary.total_discount, 10000);
        assert_eq!(summary.total_collected, 95000);
        assert_eq!(summary.total_pending, 115000);
        assert_eq!(
            summary.total_collected + summary.total_pending + summary.total_discount,
            summary.total_actual
        );
        assert_eq!(summary.total_expected, 210000);
        assert!((summary.collection_rate - 95000.0 / 210000.0 * 100.0).abs() < 1e-9);
        assert_eq!(summary.paid_count, 1);
        assert_eq!(summary.partial_count, 1);
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.student_count, 2);
    }

    #[test]
    fn test_other_years_are_ignored() {
        let year = Uuid::new_v4();
        let last_year = Uuid::new_v4();
        let student = Uuid::new_v4();
        let rows = vec![
            row(student, year, (50000, 0, 0), "2024-12-01"),
            row(student, last_year, (70000, 0, 70000), "2023-12-01"),
        ];

        let summary = summarize_year(year, &rows, date("2024-10-01"));
        assert_eq!(summary.record_count, 1);
        assert_eq!(summary.total_actual, 50000);
        assert_eq!(summary.total_collected, 0);
    }

    #[test]
    fn test_overdue_counts_only_pending_past_due() {
        let year = Uuid::new_v4();
        let s = Uuid::new_v4();
        let rows = vec![
            row(s, year, (10000, 0, 0), "2024-09-01"),    // pending, past due
            row(s, year, (10000, 0, 0), "2024-10-01"),    // pending, due today
            row(s, year, (10000, 0, 0), "2024-12-01"),    // pending, future
            row(s, year, (10000, 0, 500), "2024-09-01"),  // partial, past due
            row(s, year, (10000, 0, 10000), "2024-09-01"), // paid, past due
        ];

        let summary = summarize_year(year, &rows, date("2024-10-01"));
        assert_eq!(summary.overdue_count, 1);
    }

    #[test]
    fn test_fully_discounted_year_has_zero_rate() {
        let year = Uuid::new_v4();
        let rows = vec![row(Uuid::new_v4(), year, (10000, 10000, 0), "2024-09-01")];

        let summary = summarize_year(year, &rows, date("2024-10-01"));
        assert_eq!(summary.total_expected, 0);
        assert_eq!(summary.collection_rate, 0.0);
        assert_eq!(summary.overdue_count, 0);
    }
}
