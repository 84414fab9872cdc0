use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use chrono::NaiveDate;

use crate::application::{FeeFilter, SchoolService, YearSnapshot};
use crate::domain::{Student, StudentId};

/// Exporter for writing fee data to CSV and JSON
pub struct Exporter<'a> {
    service: &'a SchoolService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a SchoolService) -> Self {
        Self { service }
    }

    async fn students_by_id(&self) -> Result<HashMap<StudentId, Student>> {
        Ok(self
            .service
            .list_students(true)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect())
    }

    /// Export fee records to CSV format
    pub async fn export_fee_records_csv<W: Write>(
        &self,
        writer: W,
        year: Option<&str>,
    ) -> Result<usize> {
        self.service.record_export("fee records csv").await?;

        let fees = self
            .service
            .list_fee_records(&FeeFilter {
                year: year.map(str::to_string),
                ..Default::default()
            })
            .await?;
        let students = self.students_by_id().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "admission_number",
            "student_name",
            "fee_type",
            "actual_amount",
            "discount_amount",
            "paid_amount",
            "outstanding",
            "due_date",
            "status",
            "discount_reason",
        ])?;

        let mut count = 0;
        for fee in &fees {
            let (admission, name) = students
                .get(&fee.student_id)
                .map(|s| (s.admission_number.clone(), s.full_name()))
                .unwrap_or_default();

            csv_writer.write_record([
                fee.id.to_string(),
                admission,
                name,
                fee.fee_type.clone(),
                fee.actual_amount.to_string(),
                fee.discount_amount.to_string(),
                fee.paid_amount.to_string(),
                fee.outstanding().to_string(),
                fee.due_date.to_string(),
                fee.status.as_str().to_string(),
                fee.discount_reason.clone().unwrap_or_default(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export payments to CSV format
    pub async fn export_payments_csv<W: Write>(
        &self,
        writer: W,
        year: Option<&str>,
    ) -> Result<usize> {
        self.service.record_export("payments csv").await?;

        let payments = self.service.list_payments(None, year).await?;
        let students = self.students_by_id().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "receipt_number",
            "admission_number",
            "fee_record_id",
            "amount",
            "method",
            "paid_at",
            "recorded_by",
            "reversed_at",
            "notes",
        ])?;

        let mut count = 0;
        for payment in &payments {
            let admission = students
                .get(&payment.student_id)
                .map(|s| s.admission_number.clone())
                .unwrap_or_default();

            csv_writer.write_record([
                payment.receipt_number.clone(),
                admission,
                payment.fee_record_id.to_string(),
                payment.amount.to_string(),
                payment.method.as_str().to_string(),
                payment.paid_at.to_rfc3339(),
                payment.recorded_by.clone(),
                payment
                    .reversed_at
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
                payment.notes.clone().unwrap_or_default(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export ledger transactions to CSV format, in sequence order
    pub async fn export_ledger_csv<W: Write>(
        &self,
        writer: W,
        year: Option<&str>,
    ) -> Result<usize> {
        self.service.record_export("ledger csv").await?;

        let transactions = self.service.list_ledger(None, year, None).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "sequence",
            "id",
            "occurred_at",
            "kind",
            "debit",
            "credit",
            "amount_cents",
            "student_id",
            "fee_record_id",
            "reverses",
            "reference",
            "description",
        ])?;

        let mut count = 0;
        for tx in &transactions {
            csv_writer.write_record([
                tx.sequence.to_string(),
                tx.id.to_string(),
                tx.occurred_at.to_rfc3339(),
                tx.kind.as_str().to_string(),
                tx.debit_account.as_str().to_string(),
                tx.credit_account.as_str().to_string(),
                tx.amount_cents.to_string(),
                tx.student_id.to_string(),
                tx.fee_record_id.to_string(),
                tx.reverses.map(|id| id.to_string()).unwrap_or_default(),
                tx.reference.clone().unwrap_or_default(),
                tx.description.clone().unwrap_or_default(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export a whole year as a JSON snapshot
    pub async fn export_year_json<W: Write>(
        &self,
        mut writer: W,
        year: Option<&str>,
        today: NaiveDate,
    ) -> Result<YearSnapshot> {
        let snapshot = self.service.year_snapshot(year, today).await?;

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}
