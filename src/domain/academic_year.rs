use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AcademicYearId = Uuid;

/// A school year such as "2024-2025". Fee records, payments and ledger
/// transactions are all scoped to one academic year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcademicYear {
    pub id: AcademicYearId,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// At most one year is current at a time
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

impl AcademicYear {
    pub fn new(name: String, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            start_date,
            end_date,
            is_current: false,
            created_at: Utc::now(),
        }
    }

    pub fn has_valid_range(&self) -> bool {
        self.start_date < self.end_date
    }

    /// The first calendar year of the academic year, used in receipt numbers.
    pub fn start_year(&self) -> i32 {
        use chrono::Datelike;
        self.start_date.year()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_valid_range_and_start_year() {
        let year = AcademicYear::new("2024-2025".into(), date("2024-09-01"), date("2025-06-30"));

        assert!(year.has_valid_range());
        assert_eq!(year.start_year(), 2024);
    }

    #[test]
    fn test_inverted_range_is_invalid() {
        let year = AcademicYear::new("bad".into(), date("2025-06-30"), date("2024-09-01"));
        assert!(!year.has_valid_range());
    }
}
