use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    AcademicYear, AcademicYearId, ClassId, Role, SchoolClass, SecurityEvent, Severity, Student,
    StudentId, StudentStatus, Teacher, TeacherId,
};

use super::{MIGRATION_001_INITIAL, MIGRATION_002_FEES, MIGRATION_003_SECURITY};

const YEAR_COLUMNS: &str = "id, name, start_date, end_date, is_current, created_at";
const TEACHER_COLUMNS: &str =
    "id, staff_number, first_name, last_name, email, subject, created_at, archived_at";
const CLASS_COLUMNS: &str = "id, name, section, class_teacher_id, capacity, created_at";
const STUDENT_COLUMNS: &str = "id, admission_number, first_name, last_name, date_of_birth, guardian_name, guardian_phone, status, created_at, archived_at";

/// Rows removed by a cascading student delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedRows {
    pub enrollments: u64,
    pub history: u64,
    pub payments: u64,
    pub fee_records: u64,
}

/// Repository for persisting and querying school records, fees and the ledger.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        for (name, sql) in [
            ("001", MIGRATION_001_INITIAL),
            ("002", MIGRATION_002_FEES),
            ("003", MIGRATION_003_SECURITY),
        ] {
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to run migration {}", name))?;
            debug!(migration = name, "migration applied");
        }
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a database transaction for multi-row writes.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    // ========================
    // Academic years
    // ========================

    pub async fn save_academic_year(&self, year: &AcademicYear) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO academic_years (id, name, start_date, end_date, is_current, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(year.id.to_string())
        .bind(&year.name)
        .bind(fmt_date(year.start_date))
        .bind(fmt_date(year.end_date))
        .bind(year.is_current)
        .bind(fmt_ts(year.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to save academic year")?;
        Ok(())
    }

    pub async fn get_academic_year(&self, id: AcademicYearId) -> Result<Option<AcademicYear>> {
        let sql = format!("SELECT {} FROM academic_years WHERE id = ?", YEAR_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch academic year")?;
        row.as_ref().map(Self::row_to_year).transpose()
    }

    pub async fn get_academic_year_by_name(&self, name: &str) -> Result<Option<AcademicYear>> {
        let sql = format!("SELECT {} FROM academic_years WHERE name = ?", YEAR_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch academic year by name")?;
        row.as_ref().map(Self::row_to_year).transpose()
    }

    pub async fn get_current_academic_year(&self) -> Result<Option<AcademicYear>> {
        let sql = format!(
            "SELECT {} FROM academic_years WHERE is_current = 1",
            YEAR_COLUMNS
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch current academic year")?;
        row.as_ref().map(Self::row_to_year).transpose()
    }

    pub async fn list_academic_years(&self) -> Result<Vec<AcademicYear>> {
        let sql = format!(
            "SELECT {} FROM academic_years ORDER BY start_date",
            YEAR_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list academic years")?;
        rows.iter().map(Self::row_to_year).collect()
    }

    /// Make `id` the only current year.
    pub async fn set_current_academic_year(&self, id: AcademicYearId) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE academic_years SET is_current = 0 WHERE is_current = 1")
            .execute(&mut *tx)
            .await
            .context("Failed to clear current academic year")?;
        sqlx::query("UPDATE academic_years SET is_current = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to set current academic year")?;
        tx.commit().await.context("Failed to commit current year")?;
        Ok(())
    }

    fn row_to_year(row: &SqliteRow) -> Result<AcademicYear> {
        Ok(AcademicYear {
            id: parse_uuid(row.get("id"), "academic year ID")?,
            name: row.get("name"),
            start_date: parse_date(row.get("start_date"))?,
            end_date: parse_date(row.get("end_date"))?,
            is_current: row.get::<i32, _>("is_current") != 0,
            created_at: parse_ts(row.get("created_at"))?,
        })
    }

    // ========================
    // Teachers
    // ========================

    pub async fn save_teacher(&self, teacher: &Teacher) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO teachers (id, staff_number, first_name, last_name, email, subject, created_at, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(teacher.id.to_string())
        .bind(&teacher.staff_number)
        .bind(&teacher.first_name)
        .bind(&teacher.last_name)
        .bind(&teacher.email)
        .bind(&teacher.subject)
        .bind(fmt_ts(teacher.created_at))
        .bind(teacher.archived_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .context("Failed to save teacher")?;
        Ok(())
    }

    pub async fn get_teacher(&self, id: TeacherId) -> Result<Option<Teacher>> {
        let sql = format!("SELECT {} FROM teachers WHERE id = ?", TEACHER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch teacher")?;
        row.as_ref().map(Self::row_to_teacher).transpose()
    }

    pub async fn get_teacher_by_staff_number(&self, staff_number: &str) -> Result<Option<Teacher>> {
        let sql = format!(
            "SELECT {} FROM teachers WHERE staff_number = ?",
            TEACHER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(staff_number)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch teacher by staff number")?;
        row.as_ref().map(Self::row_to_teacher).transpose()
    }

    pub async fn list_teachers(&self, include_archived: bool) -> Result<Vec<Teacher>> {
        let filter = if include_archived {
            ""
        } else {
            "WHERE archived_at IS NULL"
        };
        let sql = format!(
            "SELECT {} FROM teachers {} ORDER BY last_name, first_name",
            TEACHER_COLUMNS, filter
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list teachers")?;
        rows.iter().map(Self::row_to_teacher).collect()
    }

    /// Archive a teacher and release any classes they were leading.
    pub async fn archive_teacher(&self, id: TeacherId, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE teachers SET archived_at = ? WHERE id = ?")
            .bind(fmt_ts(at))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to archive teacher")?;
        sqlx::query("UPDATE classes SET class_teacher_id = NULL WHERE class_teacher_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to release classes of archived teacher")?;
        tx.commit().await.context("Failed to commit teacher archive")?;
        Ok(())
    }

    fn row_to_teacher(row: &SqliteRow) -> Result<Teacher> {
        Ok(Teacher {
            id: parse_uuid(row.get("id"), "teacher ID")?,
            staff_number: row.get("staff_number"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            email: row.get("email"),
            subject: row.get("subject"),
            created_at: parse_ts(row.get("created_at"))?,
            archived_at: parse_opt_ts(row.get("archived_at"))?,
        })
    }

    // ========================
    // Classes
    // ========================

    pub async fn save_class(&self, class: &SchoolClass) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO classes (id, name, section, class_teacher_id, capacity, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(class.id.to_string())
        .bind(&class.name)
        .bind(&class.section)
        .bind(class.class_teacher_id.map(|id| id.to_string()))
        .bind(class.capacity)
        .bind(fmt_ts(class.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to save class")?;
        Ok(())
    }

    pub async fn get_class(&self, id: ClassId) -> Result<Option<SchoolClass>> {
        let sql = format!("SELECT {} FROM classes WHERE id = ?", CLASS_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch class")?;
        row.as_ref().map(Self::row_to_class).transpose()
    }

    pub async fn get_class_by_name(&self, name: &str) -> Result<Option<SchoolClass>> {
        let sql = format!("SELECT {} FROM classes WHERE name = ?", CLASS_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch class by name")?;
        row.as_ref().map(Self::row_to_class).transpose()
    }

    pub async fn list_classes(&self) -> Result<Vec<SchoolClass>> {
        let sql = format!("SELECT {} FROM classes ORDER BY name", CLASS_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list classes")?;
        rows.iter().map(Self::row_to_class).collect()
    }

    pub async fn set_class_teacher(
        &self,
        class_id: ClassId,
        teacher_id: Option<TeacherId>,
    ) -> Result<()> {
        sqlx::query("UPDATE classes SET class_teacher_id = ? WHERE id = ?")
            .bind(teacher_id.map(|id| id.to_string()))
            .bind(class_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to assign class teacher")?;
        Ok(())
    }

    fn row_to_class(row: &SqliteRow) -> Result<SchoolClass> {
        let teacher_id: Option<String> = row.get("class_teacher_id");
        Ok(SchoolClass {
            id: parse_uuid(row.get("id"), "class ID")?,
            name: row.get("name"),
            section: row.get("section"),
            class_teacher_id: teacher_id
                .as_deref()
                .map(|s| parse_uuid(s, "class teacher ID"))
                .transpose()?,
            capacity: row.get("capacity"),
            created_at: parse_ts(row.get("created_at"))?,
        })
    }

    // ========================
    // Students
    // ========================

    /// Insert a student inside an open transaction.
    pub async fn insert_student(conn: &mut SqliteConnection, student: &Student) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO students (id, admission_number, first_name, last_name, date_of_birth, guardian_name, guardian_phone, status, created_at, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(student.id.to_string())
        .bind(&student.admission_number)
        .bind(&student.first_name)
        .bind(&student.last_name)
        .bind(student.date_of_birth.map(fmt_date))
        .bind(&student.guardian_name)
        .bind(&student.guardian_phone)
        .bind(student.status.as_str())
        .bind(fmt_ts(student.created_at))
        .bind(student.archived_at.map(fmt_ts))
        .execute(&mut *conn)
        .await
        .context("Failed to save student")?;
        Ok(())
    }

    pub async fn get_student(&self, id: StudentId) -> Result<Option<Student>> {
        let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch student")?;
        row.as_ref().map(Self::row_to_student).transpose()
    }

    pub async fn get_student_by_admission_number(
        &self,
        admission_number: &str,
    ) -> Result<Option<Student>> {
        let sql = format!(
            "SELECT {} FROM students WHERE admission_number = ?",
            STUDENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(admission_number)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch student by admission number")?;
        row.as_ref().map(Self::row_to_student).transpose()
    }

    pub async fn list_students(&self, include_archived: bool) -> Result<Vec<Student>> {
        let filter = if include_archived {
            ""
        } else {
            "WHERE status = 'active'"
        };
        let sql = format!(
            "SELECT {} FROM students {} ORDER BY last_name, first_name",
            STUDENT_COLUMNS, filter
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list students")?;
        rows.iter().map(Self::row_to_student).collect()
    }

    /// Students whose open enrollment is in the given class.
    pub async fn list_students_in_class(&self, class_id: ClassId) -> Result<Vec<Student>> {
        let sql = format!(
            r#"
            SELECT {} FROM students
            WHERE id IN (SELECT student_id FROM enrollments WHERE class_id = ? AND valid_to IS NULL)
            ORDER BY last_name, first_name
            "#,
            STUDENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(class_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list students in class")?;
        rows.iter().map(Self::row_to_student).collect()
    }

    pub async fn set_student_status(
        conn: &mut SqliteConnection,
        id: StudentId,
        status: StudentStatus,
        archived_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE students SET status = ?, archived_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(archived_at.map(fmt_ts))
            .bind(id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to update student status")?;
        Ok(())
    }

    /// Remove a student and every dependent row in one transaction.
    /// The caller must have checked that no ledger transactions exist; the
    /// ledger triggers abort the transaction otherwise.
    pub async fn delete_student_cascade(&self, id: StudentId) -> Result<DeletedRows> {
        let id = id.to_string();
        let mut tx = self.begin().await?;

        let enrollments = sqlx::query("DELETE FROM enrollments WHERE student_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete enrollments")?
            .rows_affected();

        let history = sqlx::query(
            "DELETE FROM fee_change_history WHERE fee_record_id IN (SELECT id FROM student_fee_records WHERE student_id = ?)",
        )
        .bind(&id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete fee history")?
        .rows_affected();

        let payments = sqlx::query("DELETE FROM fee_payment_records WHERE student_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete payments")?
            .rows_affected();

        let fee_records = sqlx::query("DELETE FROM student_fee_records WHERE student_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete fee records")?
            .rows_affected();

        sqlx::query("DELETE FROM students WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete student")?;

        tx.commit().await.context("Failed to commit student delete")?;

        Ok(DeletedRows {
            enrollments,
            history,
            payments,
            fee_records,
        })
    }

    fn row_to_student(row: &SqliteRow) -> Result<Student> {
        let status: String = row.get("status");
        let date_of_birth: Option<String> = row.get("date_of_birth");
        Ok(Student {
            id: parse_uuid(row.get("id"), "student ID")?,
            admission_number: row.get("admission_number"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            date_of_birth: date_of_birth.as_deref().map(parse_date).transpose()?,
            guardian_name: row.get("guardian_name"),
            guardian_phone: row.get("guardian_phone"),
            status: StudentStatus::from_str(&status)
                .ok_or_else(|| anyhow::anyhow!("Invalid student status: {}", status))?,
            created_at: parse_ts(row.get("created_at"))?,
            archived_at: parse_opt_ts(row.get("archived_at"))?,
        })
    }

    // ========================
    // Security events
    // ========================

    pub async fn save_security_event(&self, event: &SecurityEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_events (id, event_type, actor, role, detail, severity, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.event_type)
        .bind(&event.actor)
        .bind(event.role.as_str())
        .bind(&event.detail)
        .bind(event.severity.as_str())
        .bind(fmt_ts(event.occurred_at))
        .execute(&self.pool)
        .await
        .context("Failed to save security event")?;
        Ok(())
    }

    /// Most recent events first.
    pub async fn list_security_events(&self, limit: Option<usize>) -> Result<Vec<SecurityEvent>> {
        let mut sql = String::from(
            "SELECT id, event_type, actor, role, detail, severity, occurred_at FROM security_events ORDER BY occurred_at DESC",
        );
        if let Some(lim) = limit {
            sql.push_str(&format!(" LIMIT {}", lim));
        }
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list security events")?;

        rows.iter()
            .map(|row| {
                let role: String = row.get("role");
                let severity: String = row.get("severity");
                Ok(SecurityEvent {
                    id: parse_uuid(row.get("id"), "security event ID")?,
                    event_type: row.get("event_type"),
                    actor: row.get("actor"),
                    role: Role::from_str(&role)
                        .ok_or_else(|| anyhow::anyhow!("Invalid role: {}", role))?,
                    detail: row.get("detail"),
                    severity: Severity::from_str(&severity)
                        .ok_or_else(|| anyhow::anyhow!("Invalid severity: {}", severity))?,
                    occurred_at: parse_ts(row.get("occurred_at"))?,
                })
            })
            .collect()
    }
}

// ========================
// Column codecs
// ========================

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

pub(crate) fn parse_opt_ts(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date: {}", s))
}

pub(crate) fn parse_uuid(s: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid {}: {}", what, s))
}
