use std::collections::HashSet;
use std::io::Read;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use crate::application::{AppError, NewStudent, SchoolService};
use crate::cache::MutationEvent;
use crate::domain::{parse_cents, AcademicYearId, Cents, StudentId};

/// Result of an import operation
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<ImportError>,
}

/// Error that occurred during import
#[derive(Debug, Clone)]
pub struct ImportError {
    pub line: usize,
    pub field: Option<String>,
    pub error: String,
}

/// Options for import operations
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Validate every row but write nothing
    pub dry_run: bool,
    /// Count rows whose key already exists as skipped instead of failed
    pub skip_duplicates: bool,
}

/// One row of a student CSV file.
#[derive(Debug, Deserialize)]
struct StudentRow {
    admission_number: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    date_of_birth: Option<String>,
    #[serde(default)]
    guardian_name: Option<String>,
    #[serde(default)]
    guardian_phone: Option<String>,
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    year: Option<String>,
}

/// One row of a fee CSV file.
#[derive(Debug, Deserialize)]
struct FeeRow {
    admission_number: String,
    fee_type: String,
    amount: String,
    due_date: String,
    #[serde(default)]
    year: Option<String>,
}

/// Importer for loading students and fees through the service
pub struct Importer<'a> {
    service: &'a SchoolService,
}

impl<'a> Importer<'a> {
    pub fn new(service: &'a SchoolService) -> Self {
        Self { service }
    }

    /// Import students from CSV. Each row is registered (and optionally
    /// enrolled) on its own; a bad row does not stop the rest.
    pub async fn import_students_csv<R: Read>(
        &self,
        reader: R,
        options: ImportOptions,
        at: DateTime<Utc>,
    ) -> Result<ImportResult> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut result = ImportResult::default();
        let mut seen = HashSet::new();

        for (line_num, row) in csv_reader.deserialize::<StudentRow>().enumerate() {
            let line = line_num + 2; // +2 for header and 0-indexing

            let row = match row {
                Ok(r) => r,
                Err(e) => {
                    result.errors.push(ImportError {
                        line,
                        field: None,
                        error: format!("CSV parse error: {}", e),
                    });
                    continue;
                }
            };

            let date_of_birth = match non_empty(row.date_of_birth) {
                Some(s) => match parse_date(&s) {
                    Ok(d) => Some(d),
                    Err(e) => {
                        result.errors.push(ImportError {
                            line,
                            field: Some("date_of_birth".to_string()),
                            error: e.to_string(),
                        });
                        continue;
                    }
                },
                None => None,
            };

            if row.admission_number.trim().is_empty() {
                result.errors.push(ImportError {
                    line,
                    field: Some("admission_number".to_string()),
                    error: "Admission number is required".to_string(),
                });
                continue;
            }

            let new = NewStudent {
                admission_number: row.admission_number.trim().to_string(),
                first_name: row.first_name.trim().to_string(),
                last_name: row.last_name.trim().to_string(),
                date_of_birth,
                guardian_name: non_empty(row.guardian_name),
                guardian_phone: non_empty(row.guardian_phone),
                class: non_empty(row.class),
                year: non_empty(row.year),
            };

            match self.import_student(new, &options, at, &mut seen).await {
                Ok(RowOutcome::Imported) => result.imported += 1,
                Ok(RowOutcome::Skipped) => result.skipped += 1,
                Err(e @ AppError::PermissionDenied { .. }) => return Err(e.into()),
                Err(e) => result.errors.push(ImportError {
                    line,
                    field: None,
                    error: format!("Student creation failed: {}", e),
                }),
            }
        }

        if !options.dry_run && result.imported > 0 {
            self.service
                .cache()
                .invalidate(MutationEvent::StudentsImported)
                .await;
        }

        info!(
            imported = result.imported,
            skipped = result.skipped,
            errors = result.errors.len(),
            "student import finished"
        );
        Ok(result)
    }

    /// Import fee assignments from CSV. Amounts use the same format as the
    /// command line (`1500.00`).
    pub async fn import_fees_csv<R: Read>(
        &self,
        reader: R,
        options: ImportOptions,
    ) -> Result<ImportResult> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut result = ImportResult::default();
        let mut seen = HashSet::new();

        for (line_num, row) in csv_reader.deserialize::<FeeRow>().enumerate() {
            let line = line_num + 2;

            let row = match row {
                Ok(r) => r,
                Err(e) => {
                    result.errors.push(ImportError {
                        line,
                        field: None,
                        error: format!("CSV parse error: {}", e),
                    });
                    continue;
                }
            };

            let amount = match parse_cents(&row.amount) {
                Ok(a) => a,
                Err(e) => {
                    result.errors.push(ImportError {
                        line,
                        field: Some("amount".to_string()),
                        error: format!("Invalid amount: {}", e),
                    });
                    continue;
                }
            };

            let due_date = match parse_date(&row.due_date) {
                Ok(d) => d,
                Err(e) => {
                    result.errors.push(ImportError {
                        line,
                        field: Some("due_date".to_string()),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let fee = FeeAssignment {
                admission_number: row.admission_number.trim().to_string(),
                year: non_empty(row.year),
                fee_type: row.fee_type.trim().to_string(),
                amount,
                due_date,
            };

            match self.import_fee(fee, &options, &mut seen).await {
                Ok(RowOutcome::Imported) => result.imported += 1,
                Ok(RowOutcome::Skipped) => result.skipped += 1,
                Err(e @ AppError::PermissionDenied { .. }) => return Err(e.into()),
                Err(e) => result.errors.push(ImportError {
                    line,
                    field: None,
                    error: format!("Fee assignment failed: {}", e),
                }),
            }
        }

        info!(
            imported = result.imported,
            skipped = result.skipped,
            errors = result.errors.len(),
            "fee import finished"
        );
        Ok(result)
    }

    /// Register one student, or in a dry run only check that it would work.
    /// `seen` holds the admission numbers accepted earlier in the same file.
    async fn import_student(
        &self,
        new: NewStudent,
        options: &ImportOptions,
        at: DateTime<Utc>,
        seen: &mut HashSet<String>,
    ) -> Result<RowOutcome, AppError> {
        let admission_number = new.admission_number.clone();
        let outcome = if seen.contains(&admission_number) {
            Err(AppError::StudentAlreadyExists(admission_number.clone()))
        } else if options.dry_run {
            self.service.check_new_student(&new).await.map(|_| ())
        } else {
            self.service.add_student(new, at).await.map(|_| ())
        };

        match outcome {
            Ok(()) => {
                seen.insert(admission_number);
                Ok(RowOutcome::Imported)
            }
            Err(AppError::StudentAlreadyExists(_)) if options.skip_duplicates => {
                Ok(RowOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Assign one fee unless the student already has that fee type in the
    /// year. A dry run stops after the checks.
    async fn import_fee(
        &self,
        fee: FeeAssignment,
        options: &ImportOptions,
        seen: &mut HashSet<(StudentId, AcademicYearId, String)>,
    ) -> Result<RowOutcome, AppError> {
        let (student, year) = self
            .service
            .check_fee_assignment(
                &fee.admission_number,
                fee.year.as_deref(),
                &fee.fee_type,
                fee.amount,
            )
            .await?;

        let key = (student.id, year.id, fee.fee_type.clone());
        let duplicate = seen.contains(&key)
            || self
                .service
                .has_fee_record(student.id, year.id, &fee.fee_type)
                .await?;
        if duplicate {
            if options.skip_duplicates {
                return Ok(RowOutcome::Skipped);
            }
            return Err(AppError::FeeAlreadyAssigned {
                admission_number: fee.admission_number,
                year: year.name,
                fee_type: fee.fee_type,
            });
        }

        if !options.dry_run {
            self.service
                .assign_fee(
                    &fee.admission_number,
                    Some(&year.name),
                    &fee.fee_type,
                    fee.amount,
                    fee.due_date,
                )
                .await?;
        }
        seen.insert(key);
        Ok(RowOutcome::Imported)
    }
}

enum RowOutcome {
    Imported,
    Skipped,
}

/// A parsed fee row.
struct FeeAssignment {
    admission_number: String,
    year: Option<String>,
    fee_type: String,
    amount: Cents,
    due_date: NaiveDate,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid date (expected YYYY-MM-DD): {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(non_empty(Some(" 5A ".to_string())), Some("5A".to_string()));
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-09-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
        );
        assert!(parse_date("01/09/2024").is_err());
    }
}
