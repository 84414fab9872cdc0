use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AcademicYearId, Cents, StudentId};

pub type FeeRecordId = Uuid;
pub type PaymentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStatus {
    Pending,
    Partial,
    Paid,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeStatus::Pending => "pending",
            FeeStatus::Partial => "partial",
            FeeStatus::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(FeeStatus::Pending),
            "partial" => Some(FeeStatus::Partial),
            "paid" => Some(FeeStatus::Paid),
            _ => None,
        }
    }

    /// Status follows from the amounts, never the other way round.
    pub fn derive(actual: Cents, discount: Cents, paid: Cents) -> Self {
        if actual - discount - paid <= 0 {
            FeeStatus::Paid
        } else if paid > 0 {
            FeeStatus::Partial
        } else {
            FeeStatus::Pending
        }
    }
}

impl std::fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One fee a student owes for an academic year (tuition, transport, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentFeeRecord {
    pub id: FeeRecordId,
    pub student_id: StudentId,
    pub academic_year_id: AcademicYearId,
    pub fee_type: String,
    pub actual_amount: Cents,
    pub discount_amount: Cents,
    pub paid_amount: Cents,
    pub due_date: NaiveDate,
    pub status: FeeStatus,
    pub discount_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StudentFeeRecord {
    pub fn new(
        student_id: StudentId,
        academic_year_id: AcademicYearId,
        fee_type: String,
        actual_amount: Cents,
        due_date: NaiveDate,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            student_id,
            academic_year_id,
            fee_type,
            actual_amount,
            discount_amount: 0,
            paid_amount: 0,
            due_date,
            status: FeeStatus::derive(actual_amount, 0, 0),
            discount_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount still owed after discounts and payments.
    pub fn outstanding(&self) -> Cents {
        self.actual_amount - self.discount_amount - self.paid_amount
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == FeeStatus::Pending && self.due_date < today
    }

    pub fn amounts(&self) -> FeeAmounts {
        FeeAmounts {
            actual: self.actual_amount,
            discount: self.discount_amount,
            paid: self.paid_amount,
        }
    }

    /// Store new amounts and re-derive the status.
    pub fn set_amounts(&mut self, amounts: FeeAmounts) {
        self.actual_amount = amounts.actual;
        self.discount_amount = amounts.discount;
        self.paid_amount = amounts.paid;
        self.status = FeeStatus::derive(amounts.actual, amounts.discount, amounts.paid);
        self.updated_at = Utc::now();
    }
}

/// Snapshot of the three stored amounts of a fee record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeAmounts {
    pub actual: Cents,
    pub discount: Cents,
    pub paid: Cents,
}

impl FeeAmounts {
    pub fn outstanding(&self) -> Cents {
        self.actual - self.discount - self.paid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    Cheque,
    Online,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Cheque => "cheque",
            PaymentMethod::Online => "online",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "cash" => Some(PaymentMethod::Cash),
            "card" => Some(PaymentMethod::Card),
            "bank_transfer" | "bank" => Some(PaymentMethod::BankTransfer),
            "cheque" | "check" => Some(PaymentMethod::Cheque),
            "online" => Some(PaymentMethod::Online),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePaymentRecord {
    pub id: PaymentId,
    pub fee_record_id: FeeRecordId,
    pub student_id: StudentId,
    pub academic_year_id: AcademicYearId,
    pub amount: Cents,
    pub method: PaymentMethod,
    pub receipt_number: String,
    pub paid_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub recorded_by: String,
    /// Set once when the payment is reversed; the row itself is kept
    pub reversed_at: Option<DateTime<Utc>>,
}

impl FeePaymentRecord {
    pub fn new(
        fee: &StudentFeeRecord,
        amount: Cents,
        method: PaymentMethod,
        receipt_number: String,
        paid_at: DateTime<Utc>,
        recorded_by: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fee_record_id: fee.id,
            student_id: fee.student_id,
            academic_year_id: fee.academic_year_id,
            amount,
            method,
            receipt_number,
            paid_at,
            notes: None,
            recorded_by,
            reversed_at: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed_at.is_some()
    }
}

/// Receipt numbers look like `RCP-2024-000042`.
pub fn format_receipt_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:06}", prefix, year, sequence)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Discount,
    Payment,
    PaymentReversed,
    Adjustment,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Discount => "discount",
            ChangeType::Payment => "payment",
            ChangeType::PaymentReversed => "payment_reversed",
            ChangeType::Adjustment => "adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ChangeType::Created),
            "discount" => Some(ChangeType::Discount),
            "payment" => Some(ChangeType::Payment),
            "payment_reversed" => Some(ChangeType::PaymentReversed),
            "adjustment" => Some(ChangeType::Adjustment),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Audit row written alongside every fee record mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeChangeHistory {
    pub id: Uuid,
    pub fee_record_id: FeeRecordId,
    pub change_type: ChangeType,
    pub previous: FeeAmounts,
    pub current: FeeAmounts,
    pub amount: Cents,
    pub changed_by: String,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl FeeChangeHistory {
    pub fn new(
        fee_record_id: FeeRecordId,
        change_type: ChangeType,
        previous: FeeAmounts,
        current: FeeAmounts,
        amount: Cents,
        changed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fee_record_id,
            change_type,
            previous,
            current,
            amount,
            changed_by: changed_by.into(),
            reason: None,
            changed_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}
