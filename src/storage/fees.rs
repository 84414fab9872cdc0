use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use crate::domain::{
    AcademicYearId, ChangeType, FeeAmounts, FeeChangeHistory, FeePaymentRecord, FeeRecordId,
    FeeStatus, LedgerAccount, LedgerTransaction, PaymentMethod, StudentFeeRecord,
    StudentId, TransactionKind,
};

use super::repository::{fmt_date, fmt_ts, parse_date, parse_opt_ts, parse_ts, parse_uuid};
use super::Repository;

const FEE_COLUMNS: &str = "id, student_id, academic_year_id, fee_type, actual_amount, discount_amount, paid_amount, due_date, status, discount_reason, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, fee_record_id, student_id, academic_year_id, amount, method, receipt_number, paid_at, notes, recorded_by, reversed_at";
const HISTORY_COLUMNS: &str = "id, fee_record_id, change_type, previous_actual, previous_discount, previous_paid, new_actual, new_discount, new_paid, amount, changed_by, reason, changed_at";
const LEDGER_COLUMNS: &str = "id, sequence, student_id, academic_year_id, fee_record_id, kind, debit_account, credit_account, amount_cents, occurred_at, recorded_at, reverses, reference, description";

/// Filter for querying fee records
#[derive(Debug, Clone, Default)]
pub struct FeeRecordQuery {
    pub student_id: Option<StudentId>,
    pub academic_year_id: Option<AcademicYearId>,
    pub status: Option<FeeStatus>,
    pub fee_type: Option<String>,
}

impl Repository {
    // ========================
    // Sequences
    // ========================

    /// Get the next value of a named counter and increment it.
    pub async fn next_sequence(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = ?
            RETURNING value
            "#,
        )
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("Failed to get next value of {}", name))?;

        Ok(row.get("value"))
    }

    // ========================
    // Fee records
    // ========================

    pub async fn insert_fee_record(conn: &mut SqliteConnection, fee: &StudentFeeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO student_fee_records (id, student_id, academic_year_id, fee_type, actual_amount, discount_amount, paid_amount, due_date, status, discount_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fee.id.to_string())
        .bind(fee.student_id.to_string())
        .bind(fee.academic_year_id.to_string())
        .bind(&fee.fee_type)
        .bind(fee.actual_amount)
        .bind(fee.discount_amount)
        .bind(fee.paid_amount)
        .bind(fmt_date(fee.due_date))
        .bind(fee.status.as_str())
        .bind(&fee.discount_reason)
        .bind(fmt_ts(fee.created_at))
        .bind(fmt_ts(fee.updated_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save fee record")?;
        Ok(())
    }

    /// Write the mutable columns of a fee record.
    pub async fn update_fee_record(conn: &mut SqliteConnection, fee: &StudentFeeRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE student_fee_records
            SET actual_amount = ?, discount_amount = ?, paid_amount = ?, status = ?, discount_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(fee.actual_amount)
        .bind(fee.discount_amount)
        .bind(fee.paid_amount)
        .bind(fee.status.as_str())
        .bind(&fee.discount_reason)
        .bind(fmt_ts(fee.updated_at))
        .bind(fee.id.to_string())
        .execute(&mut *conn)
        .await
        .context("Failed to update fee record")?;
        Ok(())
    }

    /// Read a fee record inside a transaction so the write that follows sees
    /// the same row.
    pub async fn fetch_fee_record(
        conn: &mut SqliteConnection,
        id: FeeRecordId,
    ) -> Result<Option<StudentFeeRecord>> {
        let sql = format!("SELECT {} FROM student_fee_records WHERE id = ?", FEE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch fee record")?;
        row.as_ref().map(Self::row_to_fee).transpose()
    }

    pub async fn get_fee_record(&self, id: FeeRecordId) -> Result<Option<StudentFeeRecord>> {
        let sql = format!("SELECT {} FROM student_fee_records WHERE id = ?", FEE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .context("Failed to fetch fee record")?;
        row.as_ref().map(Self::row_to_fee).transpose()
    }

    /// List fee records with optional filters, ordered by due date.
    pub async fn list_fee_records(&self, query: &FeeRecordQuery) -> Result<Vec<StudentFeeRecord>> {
        let mut sql = format!("SELECT {} FROM student_fee_records WHERE 1=1", FEE_COLUMNS);

        // Collect string bindings first so they live long enough
        let student_id_str = query.student_id.map(|id| id.to_string());
        let year_id_str = query.academic_year_id.map(|id| id.to_string());

        if student_id_str.is_some() {
            sql.push_str(" AND student_id = ?");
        }
        if year_id_str.is_some() {
            sql.push_str(" AND academic_year_id = ?");
        }
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.fee_type.is_some() {
            sql.push_str(" AND fee_type = ?");
        }
        sql.push_str(" ORDER BY due_date, created_at");

        let mut sql_query = sqlx::query(&sql);
        if let Some(ref sid) = student_id_str {
            sql_query = sql_query.bind(sid);
        }
        if let Some(ref yid) = year_id_str {
            sql_query = sql_query.bind(yid);
        }
        if let Some(status) = query.status {
            sql_query = sql_query.bind(status.as_str());
        }
        if let Some(ref fee_type) = query.fee_type {
            sql_query = sql_query.bind(fee_type);
        }

        let rows = sql_query
            .fetch_all(self.pool())
            .await
            .context("Failed to list fee records")?;
        rows.iter().map(Self::row_to_fee).collect()
    }

    fn row_to_fee(row: &SqliteRow) -> Result<StudentFeeRecord> {
        let status: String = row.get("status");
        Ok(StudentFeeRecord {
            id: parse_uuid(row.get("id"), "fee record ID")?,
            student_id: parse_uuid(row.get("student_id"), "student ID")?,
            academic_year_id: parse_uuid(row.get("academic_year_id"), "academic year ID")?,
            fee_type: row.get("fee_type"),
            actual_amount: row.get("actual_amount"),
            discount_amount: row.get("discount_amount"),
            paid_amount: row.get("paid_amount"),
            due_date: parse_date(row.get("due_date"))?,
            status: FeeStatus::from_str(&status)
                .ok_or_else(|| anyhow::anyhow!("Invalid fee status: {}", status))?,
            discount_reason: row.get("discount_reason"),
            created_at: parse_ts(row.get("created_at"))?,
            updated_at: parse_ts(row.get("updated_at"))?,
        })
    }

    // ========================
    // Payments
    // ========================

    pub async fn insert_payment(conn: &mut SqliteConnection, payment: &FeePaymentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fee_payment_records (id, fee_record_id, student_id, academic_year_id, amount, method, receipt_number, paid_at, notes, recorded_by, reversed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(payment.id.to_string())
        .bind(payment.fee_record_id.to_string())
        .bind(payment.student_id.to_string())
        .bind(payment.academic_year_id.to_string())
        .bind(payment.amount)
        .bind(payment.method.as_str())
        .bind(&payment.receipt_number)
        .bind(fmt_ts(payment.paid_at))
        .bind(&payment.notes)
        .bind(&payment.recorded_by)
        .bind(payment.reversed_at.map(fmt_ts))
        .execute(&mut *conn)
        .await
        .context("Failed to save payment")?;
        Ok(())
    }

    pub async fn mark_payment_reversed(
        conn: &mut SqliteConnection,
        payment: &FeePaymentRecord,
    ) -> Result<()> {
        let reversed_at = payment
            .reversed_at
            .ok_or_else(|| anyhow::anyhow!("Payment {} has no reversal time", payment.id))?;
        let result = sqlx::query(
            "UPDATE fee_payment_records SET reversed_at = ? WHERE id = ? AND reversed_at IS NULL",
        )
        .bind(fmt_ts(reversed_at))
        .bind(payment.id.to_string())
        .execute(&mut *conn)
        .await
        .context("Failed to mark payment reversed")?;

        if result.rows_affected() != 1 {
            anyhow::bail!("Payment {} was already reversed", payment.id);
        }
        Ok(())
    }

    pub async fn get_payment_by_receipt(&self, receipt_number: &str) -> Result<Option<FeePaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM fee_payment_records WHERE receipt_number = ?",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(receipt_number)
            .fetch_optional(self.pool())
            .await
            .context("Failed to fetch payment by receipt")?;
        row.as_ref().map(Self::row_to_payment).transpose()
    }

    pub async fn list_payments_for_fee(&self, fee_record_id: FeeRecordId) -> Result<Vec<FeePaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM fee_payment_records WHERE fee_record_id = ? ORDER BY paid_at",
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(fee_record_id.to_string())
            .fetch_all(self.pool())
            .await
            .context("Failed to list payments for fee record")?;
        rows.iter().map(Self::row_to_payment).collect()
    }

    pub async fn list_payments(
        &self,
        student_id: Option<StudentId>,
        academic_year_id: Option<AcademicYearId>,
    ) -> Result<Vec<FeePaymentRecord>> {
        let mut sql = format!("SELECT {} FROM fee_payment_records WHERE 1=1", PAYMENT_COLUMNS);
        let student_id_str = student_id.map(|id| id.to_string());
        let year_id_str = academic_year_id.map(|id| id.to_string());

        if student_id_str.is_some() {
            sql.push_str(" AND student_id = ?");
        }
        if year_id_str.is_some() {
            sql.push_str(" AND academic_year_id = ?");
        }
        sql.push_str(" ORDER BY paid_at, receipt_number");

        let mut sql_query = sqlx::query(&sql);
        if let Some(ref sid) = student_id_str {
            sql_query = sql_query.bind(sid);
        }
        if let Some(ref yid) = year_id_str {
            sql_query = sql_query.bind(yid);
        }

        let rows = sql_query
            .fetch_all(self.pool())
            .await
            .context("Failed to list payments")?;
        rows.iter().map(Self::row_to_payment).collect()
    }

    fn row_to_payment(row: &SqliteRow) -> Result<FeePaymentRecord> {
        let method: String = row.get("method");
        Ok(FeePaymentRecord {
            id: parse_uuid(row.get("id"), "payment ID")?,
            fee_record_id: parse_uuid(row.get("fee_record_id"), "fee record ID")?,
            student_id: parse_uuid(row.get("student_id"), "student ID")?,
            academic_year_id: parse_uuid(row.get("academic_year_id"), "academic year ID")?,
            amount: row.get("amount"),
            method: PaymentMethod::from_str(&method)
                .ok_or_else(|| anyhow::anyhow!("Invalid payment method: {}", method))?,
            receipt_number: row.get("receipt_number"),
            paid_at: parse_ts(row.get("paid_at"))?,
            notes: row.get("notes"),
            recorded_by: row.get("recorded_by"),
            reversed_at: parse_opt_ts(row.get("reversed_at"))?,
        })
    }

    // ========================
    // Fee change history
    // ========================

    pub async fn insert_history(conn: &mut SqliteConnection, entry: &FeeChangeHistory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fee_change_history (id, fee_record_id, change_type, previous_actual, previous_discount, previous_paid, new_actual, new_discount, new_paid, amount, changed_by, reason, changed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.fee_record_id.to_string())
        .bind(entry.change_type.as_str())
        .bind(entry.previous.actual)
        .bind(entry.previous.discount)
        .bind(entry.previous.paid)
        .bind(entry.current.actual)
        .bind(entry.current.discount)
        .bind(entry.current.paid)
        .bind(entry.amount)
        .bind(&entry.changed_by)
        .bind(&entry.reason)
        .bind(fmt_ts(entry.changed_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save fee history")?;
        Ok(())
    }

    pub async fn list_history_for_fee(&self, fee_record_id: FeeRecordId) -> Result<Vec<FeeChangeHistory>> {
        let sql = format!(
            "SELECT {} FROM fee_change_history WHERE fee_record_id = ? ORDER BY changed_at, rowid",
            HISTORY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(fee_record_id.to_string())
            .fetch_all(self.pool())
            .await
            .context("Failed to list fee history")?;

        rows.iter()
            .map(|row| {
                let change_type: String = row.get("change_type");
                Ok(FeeChangeHistory {
                    id: parse_uuid(row.get("id"), "history ID")?,
                    fee_record_id: parse_uuid(row.get("fee_record_id"), "fee record ID")?,
                    change_type: ChangeType::from_str(&change_type)
                        .ok_or_else(|| anyhow::anyhow!("Invalid change type: {}", change_type))?,
                    previous: FeeAmounts {
                        actual: row.get("previous_actual"),
                        discount: row.get("previous_discount"),
                        paid: row.get("previous_paid"),
                    },
                    current: FeeAmounts {
                        actual: row.get("new_actual"),
                        discount: row.get("new_discount"),
                        paid: row.get("new_paid"),
                    },
                    amount: row.get("amount"),
                    changed_by: row.get("changed_by"),
                    reason: row.get("reason"),
                    changed_at: parse_ts(row.get("changed_at"))?,
                })
            })
            .collect()
    }

    // ========================
    // Ledger
    // ========================

    /// Append a transaction. Assigns the next ledger sequence number.
    pub async fn append_transaction(
        conn: &mut SqliteConnection,
        transaction: &mut LedgerTransaction,
    ) -> Result<()> {
        transaction.sequence = Self::next_sequence(conn, "ledger_sequence").await?;

        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (id, sequence, student_id, academic_year_id, fee_record_id, kind, debit_account, credit_account, amount_cents, occurred_at, recorded_at, reverses, reference, description)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(transaction.id.to_string())
        .bind(transaction.sequence)
        .bind(transaction.student_id.to_string())
        .bind(transaction.academic_year_id.to_string())
        .bind(transaction.fee_record_id.to_string())
        .bind(transaction.kind.as_str())
        .bind(transaction.debit_account.as_str())
        .bind(transaction.credit_account.as_str())
        .bind(transaction.amount_cents)
        .bind(fmt_ts(transaction.occurred_at))
        .bind(fmt_ts(transaction.recorded_at))
        .bind(transaction.reverses.map(|id| id.to_string()))
        .bind(&transaction.reference)
        .bind(&transaction.description)
        .execute(&mut *conn)
        .await
        .context("Failed to append ledger transaction")?;

        Ok(())
    }

    /// All transactions of a fee record, read inside a transaction.
    pub async fn fetch_transactions_for_fee(
        conn: &mut SqliteConnection,
        fee_record_id: FeeRecordId,
    ) -> Result<Vec<LedgerTransaction>> {
        let sql = format!(
            "SELECT {} FROM ledger_transactions WHERE fee_record_id = ? ORDER BY sequence",
            LEDGER_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(fee_record_id.to_string())
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list transactions for fee record")?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// List ledger transactions in sequence order with optional scoping.
    pub async fn list_transactions(
        &self,
        student_id: Option<StudentId>,
        academic_year_id: Option<AcademicYearId>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerTransaction>> {
        let mut sql = format!("SELECT {} FROM ledger_transactions WHERE 1=1", LEDGER_COLUMNS);
        let student_id_str = student_id.map(|id| id.to_string());
        let year_id_str = academic_year_id.map(|id| id.to_string());

        if student_id_str.is_some() {
            sql.push_str(" AND student_id = ?");
        }
        if year_id_str.is_some() {
            sql.push_str(" AND academic_year_id = ?");
        }
        sql.push_str(" ORDER BY sequence");
        if let Some(lim) = limit {
            sql.push_str(&format!(" LIMIT {}", lim));
        }

        let mut sql_query = sqlx::query(&sql);
        if let Some(ref sid) = student_id_str {
            sql_query = sql_query.bind(sid);
        }
        if let Some(ref yid) = year_id_str {
            sql_query = sql_query.bind(yid);
        }

        let rows = sql_query
            .fetch_all(self.pool())
            .await
            .context("Failed to list ledger transactions")?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    pub async fn count_transactions_for_student(&self, student_id: StudentId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM ledger_transactions WHERE student_id = ?")
            .bind(student_id.to_string())
            .fetch_one(self.pool())
            .await
            .context("Failed to count ledger transactions")?;
        Ok(row.get("count"))
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<LedgerTransaction> {
        let kind: String = row.get("kind");
        let debit: String = row.get("debit_account");
        let credit: String = row.get("credit_account");
        let reverses: Option<String> = row.get("reverses");

        Ok(LedgerTransaction {
            id: parse_uuid(row.get("id"), "transaction ID")?,
            sequence: row.get("sequence"),
            student_id: parse_uuid(row.get("student_id"), "student ID")?,
            academic_year_id: parse_uuid(row.get("academic_year_id"), "academic year ID")?,
            fee_record_id: parse_uuid(row.get("fee_record_id"), "fee record ID")?,
            kind: TransactionKind::from_str(&kind)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction kind: {}", kind))?,
            debit_account: LedgerAccount::from_str(&debit)
                .ok_or_else(|| anyhow::anyhow!("Invalid account: {}", debit))?,
            credit_account: LedgerAccount::from_str(&credit)
                .ok_or_else(|| anyhow::anyhow!("Invalid account: {}", credit))?,
            amount_cents: row.get("amount_cents"),
            occurred_at: parse_ts(row.get("occurred_at"))?,
            recorded_at: parse_ts(row.get("recorded_at"))?,
            reverses: reverses
                .as_deref()
                .map(|s| parse_uuid(s, "reversed transaction ID"))
                .transpose()?,
            reference: row.get("reference"),
            description: row.get("description"),
        })
    }
}
