use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use crate::domain::{
    AcademicYearId, ClassId, Enrollment, EnrollmentHistory, EnrollmentId, EnrollmentStatus,
    EnrollmentTransition, StudentId,
};

use super::repository::{fmt_ts, parse_opt_ts, parse_ts, parse_uuid};
use super::Repository;

const ENROLLMENT_COLUMNS: &str =
    "id, student_id, class_id, academic_year_id, status, valid_from, valid_to, recorded_at";

impl Repository {
    pub async fn insert_enrollment(conn: &mut SqliteConnection, enrollment: &Enrollment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO enrollments (id, student_id, class_id, academic_year_id, status, valid_from, valid_to, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(enrollment.id.to_string())
        .bind(enrollment.student_id.to_string())
        .bind(enrollment.class_id.to_string())
        .bind(enrollment.academic_year_id.to_string())
        .bind(enrollment.status.as_str())
        .bind(fmt_ts(enrollment.valid_from))
        .bind(enrollment.valid_to.map(fmt_ts))
        .bind(fmt_ts(enrollment.recorded_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save enrollment")?;
        Ok(())
    }

    /// Set `valid_to` on an open version. Fails if the version is already closed.
    pub async fn close_enrollment(
        conn: &mut SqliteConnection,
        id: EnrollmentId,
        valid_to: DateTime<Utc>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE enrollments SET valid_to = ? WHERE id = ? AND valid_to IS NULL")
                .bind(fmt_ts(valid_to))
                .bind(id.to_string())
                .execute(&mut *conn)
                .await
                .context("Failed to close enrollment")?;

        if result.rows_affected() != 1 {
            anyhow::bail!("Enrollment {} is not open", id);
        }
        Ok(())
    }

    /// Write a planned transition: close the current version, then open the next.
    pub async fn apply_enrollment_transition(
        conn: &mut SqliteConnection,
        transition: &EnrollmentTransition,
    ) -> Result<()> {
        if let Some(closing) = transition.closing {
            Self::close_enrollment(conn, closing, transition.closed_at).await?;
        }
        Self::insert_enrollment(conn, &transition.opening).await
    }

    /// Load a student's versions inside a transaction.
    pub async fn fetch_enrollment_history(
        conn: &mut SqliteConnection,
        student_id: StudentId,
    ) -> Result<EnrollmentHistory> {
        let sql = format!(
            "SELECT {} FROM enrollments WHERE student_id = ? ORDER BY valid_from",
            ENROLLMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(student_id.to_string())
            .fetch_all(&mut *conn)
            .await
            .context("Failed to load enrollment history")?;
        let versions = rows
            .iter()
            .map(Self::row_to_enrollment)
            .collect::<Result<Vec<_>>>()?;
        Ok(EnrollmentHistory::new(student_id, versions))
    }

    pub async fn get_enrollment_history(&self, student_id: StudentId) -> Result<EnrollmentHistory> {
        let mut conn = self
            .pool()
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_enrollment_history(&mut conn, student_id).await
    }

    /// Versions that cover `at`, optionally restricted to a class or year.
    pub async fn list_enrollments_as_of(
        &self,
        at: DateTime<Utc>,
        class_id: Option<ClassId>,
        academic_year_id: Option<AcademicYearId>,
    ) -> Result<Vec<Enrollment>> {
        let mut sql = format!(
            "SELECT {} FROM enrollments WHERE valid_from <= ? AND (valid_to IS NULL OR valid_to > ?)",
            ENROLLMENT_COLUMNS
        );
        let class_id_str = class_id.map(|id| id.to_string());
        let year_id_str = academic_year_id.map(|id| id.to_string());
        if class_id_str.is_some() {
            sql.push_str(" AND class_id = ?");
        }
        if year_id_str.is_some() {
            sql.push_str(" AND academic_year_id = ?");
        }
        sql.push_str(" ORDER BY valid_from");

        let at = fmt_ts(at);
        let mut sql_query = sqlx::query(&sql).bind(&at).bind(&at);
        if let Some(ref cid) = class_id_str {
            sql_query = sql_query.bind(cid);
        }
        if let Some(ref yid) = year_id_str {
            sql_query = sql_query.bind(yid);
        }

        let rows = sql_query
            .fetch_all(self.pool())
            .await
            .context("Failed to list enrollments")?;
        rows.iter().map(Self::row_to_enrollment).collect()
    }

    pub async fn count_open_enrollments_in_class(&self, class_id: ClassId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM enrollments WHERE class_id = ? AND valid_to IS NULL",
        )
        .bind(class_id.to_string())
        .fetch_one(self.pool())
        .await
        .context("Failed to count enrollments")?;
        Ok(row.get("count"))
    }

    fn row_to_enrollment(row: &SqliteRow) -> Result<Enrollment> {
        let status: String = row.get("status");
        Ok(Enrollment {
            id: parse_uuid(row.get("id"), "enrollment ID")?,
            student_id: parse_uuid(row.get("student_id"), "student ID")?,
            class_id: parse_uuid(row.get("class_id"), "class ID")?,
            academic_year_id: parse_uuid(row.get("academic_year_id"), "academic year ID")?,
            status: EnrollmentStatus::from_str(&status)
                .ok_or_else(|| anyhow::anyhow!("Invalid enrollment status: {}", status))?,
            valid_from: parse_ts(row.get("valid_from"))?,
            valid_to: parse_opt_ts(row.get("valid_to"))?,
            recorded_at: parse_ts(row.get("recorded_at"))?,
        })
    }
}
