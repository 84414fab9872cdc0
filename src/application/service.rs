use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheKind, MutationEvent, YearCache};
use crate::config::AppConfig;
use crate::domain::{
    account_balances, fold_amounts, format_receipt_number, project_balances, reconcile,
    student_balance, summarize_year, validate_reversal, AcademicYear, AcademicYearId, Actor,
    Cents, ChangeType, Enrollment, EnrollmentChange, EnrollmentHistory, EnrollmentStatus,
    FeeAmounts, FeeChangeHistory, FeePaymentRecord, FeeRecordId, FeeStatus, IntegrityReport,
    LedgerAccount, LedgerTransaction, PaymentMethod, Permission, SchoolClass, SecurityEvent,
    Severity, Student, StudentBalance, StudentFeeRecord, StudentId, StudentStatus, Teacher,
    TransactionKind, YearSummary,
};
use crate::storage::{DeletedRows, FeeRecordQuery, Repository};

use super::reporting::{
    summarize_by_fee_type, BalanceEntry, ClassRoster, EnrollmentInfo, FeeRecordInfo,
    StudentInfo, StudentStatement, YearSnapshot,
};
use super::AppError;

/// Application service for the school office.
/// Every client (CLI, importer, exporter) goes through this type so that
/// authorization, dual-writes and cache invalidation happen in one place.
pub struct SchoolService {
    repo: Repository,
    cache: YearCache,
    actor: Actor,
    receipt_prefix: String,
}

/// Details of a student to register.
#[derive(Debug, Clone, Default)]
pub struct NewStudent {
    pub admission_number: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub guardian_name: Option<String>,
    pub guardian_phone: Option<String>,
    /// Enroll into this class right away
    pub class: Option<String>,
    /// Year for the initial enrollment; the current year when `None`
    pub year: Option<String>,
}

/// Filter for listing fee records
#[derive(Debug, Clone, Default)]
pub struct FeeFilter {
    pub student: Option<String>,
    pub year: Option<String>,
    pub status: Option<FeeStatus>,
    pub fee_type: Option<String>,
}

impl SchoolService {
    pub fn new(repo: Repository, cache: YearCache, actor: Actor) -> Self {
        Self {
            repo,
            cache,
            actor,
            receipt_prefix: "RCP".to_string(),
        }
    }

    pub fn with_receipt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.receipt_prefix = prefix.into();
        self
    }

    /// Create the database if needed and run migrations.
    pub async fn init(config: &AppConfig, actor: Actor) -> Result<Self, AppError> {
        let repo = Repository::init(&config.database_url()).await?;
        Ok(Self::new(repo, YearCache::from_config(&config.cache), actor)
            .with_receipt_prefix(&config.fees.receipt_prefix))
    }

    /// Connect to an existing database.
    pub async fn connect(config: &AppConfig, actor: Actor) -> Result<Self, AppError> {
        let repo = Repository::connect(&config.existing_database_url()).await?;
        Ok(Self::new(repo, YearCache::from_config(&config.cache), actor)
            .with_receipt_prefix(&config.fees.receipt_prefix))
    }

    /// The same database and cache, operated by someone else.
    pub fn as_actor(&self, actor: Actor) -> Self {
        Self {
            repo: self.repo.clone(),
            cache: self.cache.clone(),
            actor,
            receipt_prefix: self.receipt_prefix.clone(),
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn cache(&self) -> &YearCache {
        &self.cache
    }

    // ========================
    // Access control
    // ========================

    /// Fail with `PermissionDenied` (and log the attempt) unless the actor's
    /// role grants `permission`.
    pub async fn authorize(&self, permission: Permission) -> Result<(), AppError> {
        if self.actor.can(permission) {
            return Ok(());
        }

        warn!(
            actor = %self.actor.name,
            role = %self.actor.role,
            %permission,
            "access denied"
        );
        self.log_security_event(
            "access_denied",
            format!("role {} attempted {}", self.actor.role, permission),
            Severity::Warning,
        )
        .await?;

        Err(AppError::PermissionDenied {
            role: self.actor.role,
            permission,
        })
    }

    /// Persist a security event and emit it as a log record.
    pub async fn log_security_event(
        &self,
        event_type: &str,
        detail: impl Into<String>,
        severity: Severity,
    ) -> Result<SecurityEvent, AppError> {
        let event = SecurityEvent::new(&self.actor, event_type, detail, severity);
        self.repo.save_security_event(&event).await?;

        match severity {
            Severity::Info => info!(
                event_type = %event.event_type,
                actor = %event.actor,
                detail = %event.detail,
                "security event"
            ),
            Severity::Warning | Severity::Critical => warn!(
                event_type = %event.event_type,
                actor = %event.actor,
                detail = %event.detail,
                %severity,
                "security event"
            ),
        }
        Ok(event)
    }

    pub async fn list_security_events(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<SecurityEvent>, AppError> {
        self.authorize(Permission::ViewSecurityLog).await?;
        Ok(self.repo.list_security_events(limit).await?)
    }

    /// Check the export permission and record that data left the system.
    pub async fn record_export(&self, what: &str) -> Result<(), AppError> {
        self.authorize(Permission::ExportData).await?;
        self.log_security_event("data_exported", what, Severity::Info)
            .await?;
        Ok(())
    }

    // ========================
    // Academic years
    // ========================

    pub async fn create_academic_year(
        &self,
        name: String,
        start_date: NaiveDate,
        end_date: NaiveDate,
        make_current: bool,
    ) -> Result<AcademicYear, AppError> {
        self.authorize(Permission::ManageAcademicYears).await?;

        if self.repo.get_academic_year_by_name(&name).await?.is_some() {
            return Err(AppError::YearAlreadyExists(name));
        }

        let mut year = AcademicYear::new(name, start_date, end_date);
        if !year.has_valid_range() {
            return Err(AppError::InvalidDate(format!(
                "Year must start before it ends ({} to {})",
                start_date, end_date
            )));
        }

        self.repo.save_academic_year(&year).await?;
        if make_current {
            self.repo.set_current_academic_year(year.id).await?;
            year.is_current = true;
        }

        info!(year = %year.name, current = year.is_current, "academic year created");
        Ok(year)
    }

    pub async fn list_academic_years(&self) -> Result<Vec<AcademicYear>, AppError> {
        Ok(self.repo.list_academic_years().await?)
    }

    pub async fn get_academic_year(&self, name: &str) -> Result<AcademicYear, AppError> {
        self.repo
            .get_academic_year_by_name(name)
            .await?
            .ok_or_else(|| AppError::YearNotFound(name.to_string()))
    }

    pub async fn current_academic_year(&self) -> Result<AcademicYear, AppError> {
        self.repo
            .get_current_academic_year()
            .await?
            .ok_or(AppError::NoCurrentYear)
    }

    /// Make the named year the only current year.
    pub async fn set_current_year(&self, name: &str) -> Result<AcademicYear, AppError> {
        self.authorize(Permission::ManageAcademicYears).await?;
        let mut year = self.get_academic_year(name).await?;
        self.repo.set_current_academic_year(year.id).await?;
        year.is_current = true;
        info!(year = %year.name, "current academic year changed");
        Ok(year)
    }

    /// The named year, or the current one.
    async fn resolve_year(&self, name: Option<&str>) -> Result<AcademicYear, AppError> {
        match name {
            Some(name) => self.get_academic_year(name).await,
            None => self.current_academic_year().await,
        }
    }

    // ========================
    // Teachers
    // ========================

    pub async fn add_teacher(
        &self,
        staff_number: String,
        first_name: String,
        last_name: String,
        email: Option<String>,
        subject: Option<String>,
    ) -> Result<Teacher, AppError> {
        self.authorize(Permission::ManageTeachers).await?;

        if self
            .repo
            .get_teacher_by_staff_number(&staff_number)
            .await?
            .is_some()
        {
            return Err(AppError::TeacherAlreadyExists(staff_number));
        }

        let mut teacher = Teacher::new(staff_number, first_name, last_name);
        if let Some(email) = email {
            teacher = teacher.with_email(email);
        }
        if let Some(subject) = subject {
            teacher = teacher.with_subject(subject);
        }

        self.repo.save_teacher(&teacher).await?;
        info!(staff_number = %teacher.staff_number, "teacher added");
        Ok(teacher)
    }

    pub async fn get_teacher(&self, staff_number: &str) -> Result<Teacher, AppError> {
        self.repo
            .get_teacher_by_staff_number(staff_number)
            .await?
            .ok_or_else(|| AppError::TeacherNotFound(staff_number.to_string()))
    }

    pub async fn list_teachers(&self, include_archived: bool) -> Result<Vec<Teacher>, AppError> {
        self.authorize(Permission::ViewClasses).await?;
        Ok(self.repo.list_teachers(include_archived).await?)
    }

    /// Archive a teacher. Classes they led lose their class teacher.
    pub async fn archive_teacher(&self, staff_number: &str) -> Result<Teacher, AppError> {
        self.authorize(Permission::ManageTeachers).await?;
        let mut teacher = self.get_teacher(staff_number).await?;
        let now = Utc::now();
        self.repo.archive_teacher(teacher.id, now).await?;
        teacher.archived_at = Some(now);
        info!(staff_number = %teacher.staff_number, "teacher archived");
        Ok(teacher)
    }

    // ========================
    // Classes
    // ========================

    pub async fn create_class(
        &self,
        name: String,
        section: Option<String>,
        capacity: Option<i64>,
    ) -> Result<SchoolClass, AppError> {
        self.authorize(Permission::ManageClasses).await?;

        if self.repo.get_class_by_name(&name).await?.is_some() {
            return Err(AppError::ClassAlreadyExists(name));
        }

        let mut class = SchoolClass::new(name);
        if let Some(section) = section {
            class = class.with_section(section);
        }
        if let Some(capacity) = capacity {
            if capacity <= 0 {
                return Err(AppError::InvalidAmount(
                    "Class capacity must be positive".to_string(),
                ));
            }
            class = class.with_capacity(capacity);
        }

        self.repo.save_class(&class).await?;
        info!(class = %class.name, "class created");
        Ok(class)
    }

    pub async fn get_class(&self, name: &str) -> Result<SchoolClass, AppError> {
        self.repo
            .get_class_by_name(name)
            .await?
            .ok_or_else(|| AppError::ClassNotFound(name.to_string()))
    }

    pub async fn list_classes(&self) -> Result<Vec<SchoolClass>, AppError> {
        self.authorize(Permission::ViewClasses).await?;
        Ok(self.repo.list_classes().await?)
    }

    /// Set or clear the class teacher.
    pub async fn assign_class_teacher(
        &self,
        class_name: &str,
        staff_number: Option<&str>,
    ) -> Result<SchoolClass, AppError> {
        self.authorize(Permission::ManageClasses).await?;
        let mut class = self.get_class(class_name).await?;

        let teacher_id = match staff_number {
            Some(staff_number) => {
                let teacher = self.get_teacher(staff_number).await?;
                if teacher.is_archived() {
                    return Err(AppError::TeacherNotFound(format!(
                        "{} (archived)",
                        staff_number
                    )));
                }
                Some(teacher.id)
            }
            None => None,
        };

        self.repo.set_class_teacher(class.id, teacher_id).await?;
        class.class_teacher_id = teacher_id;
        info!(class = %class.name, teacher = ?staff_number, "class teacher assigned");
        Ok(class)
    }

    /// Students in a class now, or at a point in the past.
    pub async fn class_roster(
        &self,
        class_name: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<ClassRoster, AppError> {
        self.authorize(Permission::ViewClasses).await?;
        let class = self.get_class(class_name).await?;

        let students = match as_of {
            None => self.repo.list_students_in_class(class.id).await?,
            Some(at) => {
                let mut students = Vec::new();
                for enrollment in self
                    .repo
                    .list_enrollments_as_of(at, Some(class.id), None)
                    .await?
                {
                    if let Some(student) = self.repo.get_student(enrollment.student_id).await? {
                        students.push(student);
                    }
                }
                students
            }
        };

        let teacher_name = match class.class_teacher_id {
            Some(id) => self.repo.get_teacher(id).await?.map(|t| t.full_name()),
            None => None,
        };

        Ok(ClassRoster {
            class,
            teacher_name,
            students,
        })
    }

    async fn check_capacity(&self, class: &SchoolClass) -> Result<(), AppError> {
        if let Some(capacity) = class.capacity {
            let enrolled = self.repo.count_open_enrollments_in_class(class.id).await?;
            if enrolled >= capacity {
                return Err(AppError::ClassFull {
                    class: class.name.clone(),
                    capacity,
                });
            }
        }
        Ok(())
    }

    // ========================
    // Students
    // ========================

    /// Register a student, optionally enrolling them in the same transaction.
    /// Run every check `add_student` makes without writing anything.
    /// Returns the initial placement when a class was given.
    pub async fn check_new_student(
        &self,
        new: &NewStudent,
    ) -> Result<Option<EnrollmentChange>, AppError> {
        self.authorize(Permission::ManageStudents).await?;

        if self
            .repo
            .get_student_by_admission_number(&new.admission_number)
            .await?
            .is_some()
        {
            return Err(AppError::StudentAlreadyExists(new.admission_number.clone()));
        }

        match new.class.as_deref() {
            Some(class_name) => {
                let class = self.get_class(class_name).await?;
                let year = self.resolve_year(new.year.as_deref()).await?;
                self.check_capacity(&class).await?;
                Ok(Some(EnrollmentChange {
                    class_id: class.id,
                    academic_year_id: year.id,
                    status: EnrollmentStatus::Enrolled,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn add_student(
        &self,
        new: NewStudent,
        at: DateTime<Utc>,
    ) -> Result<Student, AppError> {
        let placement = self.check_new_student(&new).await?;

        let mut student = Student::new(new.admission_number, new.first_name, new.last_name);
        if let Some(dob) = new.date_of_birth {
            student = student.with_date_of_birth(dob);
        }
        if let Some(guardian) = new.guardian_name {
            student = student.with_guardian(guardian, new.guardian_phone);
        }

        let mut tx = self.repo.begin().await?;
        Repository::insert_student(&mut tx, &student).await?;
        if let Some(change) = placement {
            let transition = EnrollmentHistory::new(student.id, Vec::new()).plan_change(change, at)?;
            Repository::apply_enrollment_transition(&mut tx, &transition).await?;
        }
        tx.commit().await.context("Failed to commit new student")?;

        if let Some(change) = placement {
            self.cache
                .invalidate(MutationEvent::EnrollmentChanged {
                    year: Some(change.academic_year_id),
                })
                .await;
        }

        info!(
            admission_number = %student.admission_number,
            enrolled = placement.is_some(),
            "student added"
        );
        Ok(student)
    }

    /// Look up a student without a permission check.
    async fn find_student(&self, admission_number: &str) -> Result<Student, AppError> {
        self.repo
            .get_student_by_admission_number(admission_number)
            .await?
            .ok_or_else(|| AppError::StudentNotFound(admission_number.to_string()))
    }

    pub async fn get_student(&self, admission_number: &str) -> Result<Student, AppError> {
        self.authorize(Permission::ViewStudents).await?;
        self.find_student(admission_number).await
    }

    pub async fn student_info(&self, admission_number: &str) -> Result<StudentInfo, AppError> {
        self.authorize(Permission::ViewStudents).await?;
        let student = self.find_student(admission_number).await?;
        let history = self.repo.get_enrollment_history(student.id).await?;
        let current = history.current().cloned();

        let current_enrollment = match current {
            Some(enrollment) => self.describe_enrollments(vec![enrollment]).await?.pop(),
            None => None,
        };

        Ok(StudentInfo {
            student,
            current_enrollment,
        })
    }

    pub async fn list_students(&self, include_archived: bool) -> Result<Vec<Student>, AppError> {
        self.authorize(Permission::ViewStudents).await?;
        Ok(self.repo.list_students(include_archived).await?)
    }

    /// Enroll, transfer or promote a student effective at `at`.
    /// The open version is closed and a new one opened; nothing is overwritten.
    pub async fn enroll_student(
        &self,
        admission_number: &str,
        class_name: &str,
        year_name: Option<&str>,
        status: EnrollmentStatus,
        at: DateTime<Utc>,
    ) -> Result<EnrollmentInfo, AppError> {
        self.authorize(Permission::ManageEnrollments).await?;

        let student = self.find_student(admission_number).await?;
        if student.is_archived() {
            return Err(AppError::StudentArchived(admission_number.to_string()));
        }
        let class = self.get_class(class_name).await?;
        let year = self.resolve_year(year_name).await?;

        let change = EnrollmentChange {
            class_id: class.id,
            academic_year_id: year.id,
            status,
        };

        let current = self.repo.get_enrollment_history(student.id).await?;
        let already_in_class = current
            .current()
            .is_some_and(|open| open.class_id == class.id);
        if !already_in_class {
            self.check_capacity(&class).await?;
        }

        let mut tx = self.repo.begin().await?;
        let history = Repository::fetch_enrollment_history(&mut tx, student.id).await?;
        let previous_year = history.current().map(|open| open.academic_year_id);
        let transition = history.plan_change(change, at)?;

        let mut planned = history.clone();
        planned.apply(transition.clone());
        planned.validate()?;
        Repository::apply_enrollment_transition(&mut tx, &transition).await?;
        tx.commit().await.context("Failed to commit enrollment change")?;

        // A change that crosses years makes both years stale
        let event_year = match previous_year {
            Some(previous) if previous != year.id => None,
            _ => Some(year.id),
        };
        self.cache
            .invalidate(MutationEvent::EnrollmentChanged { year: event_year })
            .await;

        info!(
            admission_number = %student.admission_number,
            class = %class.name,
            year = %year.name,
            %status,
            closed = ?transition.closing,
            "enrollment changed"
        );

        Ok(EnrollmentInfo {
            enrollment: transition.opening,
            class_name: class.name,
            year_name: year.name,
        })
    }

    /// Every enrollment version of a student, oldest first.
    pub async fn enrollment_history(
        &self,
        admission_number: &str,
    ) -> Result<Vec<EnrollmentInfo>, AppError> {
        self.authorize(Permission::ViewStudents).await?;
        let student = self.find_student(admission_number).await?;

        let key = CacheKey::new(CacheKind::Enrollments, None, student.id.to_string());
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let history = self.repo.get_enrollment_history(student.id).await?;
        let infos = self.describe_enrollments(history.into_versions()).await?;
        self.cache.insert(key, &infos).await;
        Ok(infos)
    }

    /// The version that was in effect at `at`.
    pub async fn enrollment_as_of(
        &self,
        admission_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EnrollmentInfo>, AppError> {
        self.authorize(Permission::ViewStudents).await?;
        let student = self.find_student(admission_number).await?;
        let history = self.repo.get_enrollment_history(student.id).await?;

        match history.as_of(at).cloned() {
            Some(version) => Ok(self.describe_enrollments(vec![version]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn describe_enrollments(
        &self,
        versions: Vec<Enrollment>,
    ) -> Result<Vec<EnrollmentInfo>, AppError> {
        let classes: HashMap<_, _> = self
            .repo
            .list_classes()
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();
        let years: HashMap<_, _> = self
            .repo
            .list_academic_years()
            .await?
            .into_iter()
            .map(|y| (y.id, y.name))
            .collect();

        Ok(versions
            .into_iter()
            .map(|enrollment| EnrollmentInfo {
                class_name: classes
                    .get(&enrollment.class_id)
                    .cloned()
                    .unwrap_or_else(|| enrollment.class_id.to_string()),
                year_name: years
                    .get(&enrollment.academic_year_id)
                    .cloned()
                    .unwrap_or_else(|| enrollment.academic_year_id.to_string()),
                enrollment,
            })
            .collect())
    }

    /// Archive a student and close their open enrollment at `at`.
    pub async fn archive_student(
        &self,
        admission_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Student, AppError> {
        self.authorize(Permission::ManageStudents).await?;
        let mut student = self.find_student(admission_number).await?;
        if student.is_archived() {
            return Err(AppError::StudentArchived(admission_number.to_string()));
        }

        let mut tx = self.repo.begin().await?;
        let history = Repository::fetch_enrollment_history(&mut tx, student.id).await?;
        if history.current().is_some() {
            let (id, closed_at) = history.plan_close(at)?;
            Repository::close_enrollment(&mut tx, id, closed_at).await?;
        }
        Repository::set_student_status(&mut tx, student.id, StudentStatus::Archived, Some(at))
            .await?;
        tx.commit().await.context("Failed to commit student archive")?;

        self.cache.invalidate(MutationEvent::StudentArchived).await;

        student.status = StudentStatus::Archived;
        student.archived_at = Some(at);
        info!(admission_number = %student.admission_number, "student archived");
        Ok(student)
    }

    /// Reactivate an archived student, reopening them in their last class and year.
    pub async fn restore_student(
        &self,
        admission_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Student, AppError> {
        self.authorize(Permission::ManageStudents).await?;
        let mut student = self.find_student(admission_number).await?;
        if !student.is_archived() {
            return Err(AppError::StudentNotArchived(admission_number.to_string()));
        }

        let mut tx = self.repo.begin().await?;
        let history = Repository::fetch_enrollment_history(&mut tx, student.id).await?;
        if let Some(last) = history.latest() {
            let change = EnrollmentChange {
                class_id: last.class_id,
                academic_year_id: last.academic_year_id,
                status: last.status,
            };
            let transition = history.plan_change(change, at)?;
            Repository::apply_enrollment_transition(&mut tx, &transition).await?;
        }
        Repository::set_student_status(&mut tx, student.id, StudentStatus::Active, None).await?;
        tx.commit().await.context("Failed to commit student restore")?;

        self.cache.invalidate(MutationEvent::StudentArchived).await;

        student.status = StudentStatus::Active;
        student.archived_at = None;
        info!(admission_number = %student.admission_number, "student restored");
        Ok(student)
    }

    /// Delete a student and everything that hangs off them, all or nothing.
    /// Students with ledger history must be archived instead.
    pub async fn delete_student(&self, admission_number: &str) -> Result<DeletedRows, AppError> {
        self.authorize(Permission::ManageStudents).await?;
        let student = self.find_student(admission_number).await?;

        if self.repo.count_transactions_for_student(student.id).await? > 0 {
            return Err(AppError::HasLedgerHistory(admission_number.to_string()));
        }

        let deleted = self.repo.delete_student_cascade(student.id).await?;
        self.cache.invalidate(MutationEvent::StudentDeleted).await;

        self.log_security_event(
            "student_deleted",
            format!(
                "{} ({}) with {} enrollment versions",
                student.full_name(),
                student.admission_number,
                deleted.enrollments
            ),
            Severity::Warning,
        )
        .await?;

        Ok(deleted)
    }

    // ========================
    // Fee engine
    // ========================

    /// Append `transaction`, re-derive the fee amounts from the ledger and
    /// write the fee row and a history row. Must run inside the caller's
    /// database transaction.
    async fn post(
        &self,
        conn: &mut SqliteConnection,
        fee: &mut StudentFeeRecord,
        previous: FeeAmounts,
        mut transaction: LedgerTransaction,
        change_type: ChangeType,
        reason: Option<String>,
    ) -> Result<LedgerTransaction, AppError> {
        Repository::append_transaction(conn, &mut transaction).await?;

        let ledger = Repository::fetch_transactions_for_fee(conn, fee.id).await?;
        fee.set_amounts(fold_amounts(&ledger));
        Repository::update_fee_record(conn, fee).await?;

        let history = FeeChangeHistory::new(
            fee.id,
            change_type,
            previous,
            fee.amounts(),
            transaction.amount_cents,
            &self.actor.name,
        )
        .with_reason(reason);
        Repository::insert_history(conn, &history).await?;

        debug!(
            fee_record = %fee.id,
            sequence = transaction.sequence,
            kind = %transaction.kind,
            "ledger posting written"
        );
        Ok(transaction)
    }

    async fn fetch_fee_for_update(
        conn: &mut SqliteConnection,
        id: FeeRecordId,
    ) -> Result<StudentFeeRecord, AppError> {
        Repository::fetch_fee_record(conn, id)
            .await?
            .ok_or_else(|| AppError::FeeRecordNotFound(id.to_string()))
    }

    /// Bill a fee to a student.
    /// Run every check `assign_fee` makes without writing anything.
    pub async fn check_fee_assignment(
        &self,
        admission_number: &str,
        year_name: Option<&str>,
        fee_type: &str,
        amount: Cents,
    ) -> Result<(Student, AcademicYear), AppError> {
        self.authorize(Permission::ManageFees).await?;

        if amount <= 0 {
            return Err(AppError::InvalidAmount(
                "Fee amount must be positive".to_string(),
            ));
        }
        if fee_type.trim().is_empty() {
            return Err(AppError::InvalidFeeType(fee_type.to_string()));
        }
        let student = self.find_student(admission_number).await?;
        if student.is_archived() {
            return Err(AppError::StudentArchived(admission_number.to_string()));
        }
        let year = self.resolve_year(year_name).await?;
        Ok((student, year))
    }

    /// Whether the student already has a fee of this type in the year.
    pub async fn has_fee_record(
        &self,
        student_id: StudentId,
        academic_year_id: AcademicYearId,
        fee_type: &str,
    ) -> Result<bool, AppError> {
        self.authorize(Permission::ViewFees).await?;
        let existing = self
            .repo
            .list_fee_records(&FeeRecordQuery {
                student_id: Some(student_id),
                academic_year_id: Some(academic_year_id),
                fee_type: Some(fee_type.trim().to_string()),
                ..Default::default()
            })
            .await?;
        Ok(!existing.is_empty())
    }

    pub async fn assign_fee(
        &self,
        admission_number: &str,
        year_name: Option<&str>,
        fee_type: &str,
        amount: Cents,
        due_date: NaiveDate,
    ) -> Result<StudentFeeRecord, AppError> {
        let (student, year) = self
            .check_fee_assignment(admission_number, year_name, fee_type, amount)
            .await?;

        let mut fee = StudentFeeRecord::new(
            student.id,
            year.id,
            fee_type.trim().to_string(),
            amount,
            due_date,
        );

        let mut tx = self.repo.begin().await?;
        Repository::insert_fee_record(&mut tx, &fee).await?;
        let charge = LedgerTransaction::charge(&fee, amount, Utc::now());
        self.post(
            &mut tx,
            &mut fee,
            FeeAmounts::default(),
            charge,
            ChangeType::Created,
            None,
        )
        .await?;
        tx.commit().await.context("Failed to commit fee assignment")?;

        self.cache
            .invalidate(MutationEvent::FeeAssigned { year: year.id })
            .await;

        info!(
            fee_record = %fee.id,
            admission_number = %student.admission_number,
            year = %year.name,
            fee_type = %fee.fee_type,
            amount,
            "fee assigned"
        );
        Ok(fee)
    }

    /// Reduce what is owed. Discounts accumulate and may not exceed the
    /// outstanding amount.
    pub async fn apply_discount(
        &self,
        fee_id: FeeRecordId,
        amount: Cents,
        reason: Option<String>,
    ) -> Result<StudentFeeRecord, AppError> {
        self.authorize(Permission::ApplyDiscounts).await?;

        if amount <= 0 {
            return Err(AppError::InvalidAmount(
                "Discount must be positive".to_string(),
            ));
        }

        let mut tx = self.repo.begin().await?;
        let mut fee = Self::fetch_fee_for_update(&mut tx, fee_id).await?;
        let outstanding = fee.outstanding();
        if amount > outstanding {
            return Err(AppError::ExceedsOutstanding {
                outstanding,
                requested: amount,
            });
        }

        let previous = fee.amounts();
        if reason.is_some() {
            fee.discount_reason = reason.clone();
        }
        let mut discount = LedgerTransaction::discount(&fee, amount, Utc::now());
        if let Some(ref reason) = reason {
            discount = discount.with_description(reason.clone());
        }
        self.post(
            &mut tx,
            &mut fee,
            previous,
            discount,
            ChangeType::Discount,
            reason,
        )
        .await?;
        tx.commit().await.context("Failed to commit discount")?;

        self.cache
            .invalidate(MutationEvent::DiscountApplied {
                year: fee.academic_year_id,
            })
            .await;

        info!(fee_record = %fee.id, amount, status = %fee.status, "discount applied");
        Ok(fee)
    }

    /// Record money received against a fee and issue a receipt.
    pub async fn record_payment(
        &self,
        fee_id: FeeRecordId,
        amount: Cents,
        method: PaymentMethod,
        paid_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<FeePaymentRecord, AppError> {
        self.authorize(Permission::RecordPayments).await?;

        if amount <= 0 {
            return Err(AppError::InvalidAmount(
                "Payment amount must be positive".to_string(),
            ));
        }

        let fee = self
            .repo
            .get_fee_record(fee_id)
            .await?
            .ok_or_else(|| AppError::FeeRecordNotFound(fee_id.to_string()))?;
        let year = self
            .repo
            .get_academic_year(fee.academic_year_id)
            .await?
            .ok_or_else(|| AppError::YearNotFound(fee.academic_year_id.to_string()))?;

        let mut tx = self.repo.begin().await?;
        let mut fee = Self::fetch_fee_for_update(&mut tx, fee_id).await?;
        let outstanding = fee.outstanding();
        if amount > outstanding {
            return Err(AppError::ExceedsOutstanding {
                outstanding,
                requested: amount,
            });
        }

        let sequence = Repository::next_sequence(&mut tx, "receipt_sequence").await?;
        let receipt_number =
            format_receipt_number(&self.receipt_prefix, year.start_year(), sequence);

        let mut payment = FeePaymentRecord::new(
            &fee,
            amount,
            method,
            receipt_number.clone(),
            paid_at,
            self.actor.name.clone(),
        );
        if let Some(notes) = notes.clone() {
            payment = payment.with_notes(notes);
        }
        Repository::insert_payment(&mut tx, &payment).await?;

        let previous = fee.amounts();
        let posting = LedgerTransaction::payment(&fee, amount, paid_at, &receipt_number)
            .with_description(format!("{} payment", method));
        self.post(
            &mut tx,
            &mut fee,
            previous,
            posting,
            ChangeType::Payment,
            notes,
        )
        .await?;
        tx.commit().await.context("Failed to commit payment")?;

        self.cache
            .invalidate(MutationEvent::PaymentRecorded {
                year: fee.academic_year_id,
            })
            .await;

        info!(
            fee_record = %fee.id,
            receipt = %payment.receipt_number,
            amount,
            %method,
            status = %fee.status,
            "payment recorded"
        );
        Ok(payment)
    }

    /// Undo a payment with a compensating ledger entry. The payment row is
    /// kept and marked reversed.
    pub async fn reverse_payment(
        &self,
        receipt_number: &str,
        reason: Option<String>,
    ) -> Result<FeePaymentRecord, AppError> {
        self.authorize(Permission::ReverseTransactions).await?;

        let mut payment = self
            .repo
            .get_payment_by_receipt(receipt_number)
            .await?
            .ok_or_else(|| AppError::PaymentNotFound(receipt_number.to_string()))?;
        if payment.is_reversed() {
            return Err(AppError::PaymentAlreadyReversed(receipt_number.to_string()));
        }

        let mut tx = self.repo.begin().await?;
        let mut fee = Self::fetch_fee_for_update(&mut tx, payment.fee_record_id).await?;
        let ledger = Repository::fetch_transactions_for_fee(&mut tx, fee.id).await?;
        let original = ledger
            .iter()
            .find(|t| {
                t.kind == TransactionKind::Payment
                    && t.reference.as_deref() == Some(receipt_number)
            })
            .ok_or_else(|| {
                anyhow::anyhow!("No ledger entry found for receipt {}", receipt_number)
            })?;
        validate_reversal(original, &ledger)?;

        let now = Utc::now();
        let mut reversal = original.create_reversal(now);
        if let Some(ref reason) = reason {
            reversal = reversal.with_description(reason.clone());
        }

        payment.reversed_at = Some(now);
        Repository::mark_payment_reversed(&mut tx, &payment).await?;

        let previous = fee.amounts();
        self.post(
            &mut tx,
            &mut fee,
            previous,
            reversal,
            ChangeType::PaymentReversed,
            reason,
        )
        .await?;
        tx.commit().await.context("Failed to commit payment reversal")?;

        self.cache
            .invalidate(MutationEvent::PaymentReversed {
                year: fee.academic_year_id,
            })
            .await;

        info!(
            fee_record = %fee.id,
            receipt = %payment.receipt_number,
            amount = payment.amount,
            status = %fee.status,
            "payment reversed"
        );
        Ok(payment)
    }

    /// Change the billed amount. It may not drop below what has already been
    /// discounted and paid.
    pub async fn adjust_fee(
        &self,
        fee_id: FeeRecordId,
        new_amount: Cents,
        reason: Option<String>,
    ) -> Result<StudentFeeRecord, AppError> {
        self.authorize(Permission::ManageFees).await?;

        let mut tx = self.repo.begin().await?;
        let mut fee = Self::fetch_fee_for_update(&mut tx, fee_id).await?;

        let committed = fee.discount_amount + fee.paid_amount;
        if new_amount < committed {
            return Err(AppError::AdjustmentBelowCommitted {
                committed,
                requested: new_amount,
            });
        }
        let delta = new_amount - fee.actual_amount;
        if delta == 0 {
            return Err(AppError::InvalidAmount(format!(
                "Fee is already {}",
                new_amount
            )));
        }

        let previous = fee.amounts();
        let mut adjustment = LedgerTransaction::adjustment(&fee, delta, Utc::now());
        if let Some(ref reason) = reason {
            adjustment = adjustment.with_description(reason.clone());
        }
        self.post(
            &mut tx,
            &mut fee,
            previous,
            adjustment,
            ChangeType::Adjustment,
            reason,
        )
        .await?;
        tx.commit().await.context("Failed to commit fee adjustment")?;

        self.cache
            .invalidate(MutationEvent::FeeAdjusted {
                year: fee.academic_year_id,
            })
            .await;

        info!(fee_record = %fee.id, delta, new_amount, "fee adjusted");
        Ok(fee)
    }

    // ========================
    // Fee queries
    // ========================

    pub async fn get_fee_record(&self, id: FeeRecordId) -> Result<StudentFeeRecord, AppError> {
        self.authorize(Permission::ViewFees).await?;
        self.repo
            .get_fee_record(id)
            .await?
            .ok_or_else(|| AppError::FeeRecordNotFound(id.to_string()))
    }

    /// A fee record with its payments, change history and ledger postings.
    pub async fn fee_record_info(&self, id: FeeRecordId) -> Result<FeeRecordInfo, AppError> {
        let fee = self.get_fee_record(id).await?;
        let student = self
            .repo
            .get_student(fee.student_id)
            .await?
            .ok_or_else(|| AppError::StudentNotFound(fee.student_id.to_string()))?;
        let payments = self.repo.list_payments_for_fee(fee.id).await?;
        let history = self.fee_history(fee.id).await?;
        let transactions = self
            .repo
            .list_transactions(Some(fee.student_id), Some(fee.academic_year_id), None)
            .await?
            .into_iter()
            .filter(|t| t.fee_record_id == fee.id)
            .collect();

        Ok(FeeRecordInfo {
            fee,
            student,
            payments,
            history,
            transactions,
        })
    }

    pub async fn list_fee_records(
        &self,
        filter: &FeeFilter,
    ) -> Result<Vec<StudentFeeRecord>, AppError> {
        self.authorize(Permission::ViewFees).await?;

        let student_id = match filter.student.as_deref() {
            Some(admission) => Some(self.find_student(admission).await?.id),
            None => None,
        };
        let year_id = match filter.year.as_deref() {
            Some(name) => Some(self.get_academic_year(name).await?.id),
            None => None,
        };

        if let (None, Some(year_id), None, None) =
            (student_id, year_id, filter.status, filter.fee_type.as_ref())
        {
            return self.year_fee_records(year_id).await;
        }

        Ok(self
            .repo
            .list_fee_records(&FeeRecordQuery {
                student_id,
                academic_year_id: year_id,
                status: filter.status,
                fee_type: filter.fee_type.clone(),
            })
            .await?)
    }

    /// All fee rows of a year, served from the cache when possible.
    async fn year_fee_records(
        &self,
        year_id: AcademicYearId,
    ) -> Result<Vec<StudentFeeRecord>, AppError> {
        let key = CacheKey::for_year(CacheKind::FeeRecords, year_id);
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let rows = self
            .repo
            .list_fee_records(&FeeRecordQuery {
                academic_year_id: Some(year_id),
                ..Default::default()
            })
            .await?;
        self.cache.insert(key, &rows).await;
        Ok(rows)
    }

    /// Pending fees whose due date has passed.
    pub async fn overdue_fees(
        &self,
        year_name: Option<&str>,
        today: NaiveDate,
    ) -> Result<Vec<StudentFeeRecord>, AppError> {
        self.authorize(Permission::ViewFees).await?;
        let year = self.resolve_year(year_name).await?;
        Ok(self
            .year_fee_records(year.id)
            .await?
            .into_iter()
            .filter(|fee| fee.is_overdue(today))
            .collect())
    }

    pub async fn list_payments(
        &self,
        student: Option<&str>,
        year_name: Option<&str>,
    ) -> Result<Vec<FeePaymentRecord>, AppError> {
        self.authorize(Permission::ViewFees).await?;

        let student_id = match student {
            Some(admission) => Some(self.find_student(admission).await?.id),
            None => None,
        };
        let year_id = match year_name {
            Some(name) => Some(self.get_academic_year(name).await?.id),
            None => None,
        };

        let key = match (student_id, year_id) {
            (None, Some(year_id)) => Some(CacheKey::for_year(CacheKind::Payments, year_id)),
            _ => None,
        };
        if let Some(ref key) = key {
            if let Some(cached) = self.cache.get(key).await {
                return Ok(cached);
            }
        }

        let payments = self.repo.list_payments(student_id, year_id).await?;
        if let Some(key) = key {
            self.cache.insert(key, &payments).await;
        }
        Ok(payments)
    }

    /// Change history of a fee record, oldest first.
    pub async fn fee_history(&self, id: FeeRecordId) -> Result<Vec<FeeChangeHistory>, AppError> {
        self.authorize(Permission::ViewFees).await?;
        let fee = self
            .repo
            .get_fee_record(id)
            .await?
            .ok_or_else(|| AppError::FeeRecordNotFound(id.to_string()))?;

        let key = CacheKey::new(
            CacheKind::FeeHistory,
            Some(fee.academic_year_id),
            fee.id.to_string(),
        );
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let history = self.repo.list_history_for_fee(fee.id).await?;
        self.cache.insert(key, &history).await;
        Ok(history)
    }

    /// Ledger-derived balance of one student for one year.
    pub async fn student_balance(
        &self,
        admission_number: &str,
        year_name: Option<&str>,
    ) -> Result<StudentBalance, AppError> {
        self.authorize(Permission::ViewFees).await?;
        let student = self.find_student(admission_number).await?;
        let year = self.resolve_year(year_name).await?;

        let key = CacheKey::new(
            CacheKind::StudentBalances,
            Some(year.id),
            student.id.to_string(),
        );
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let transactions = self
            .repo
            .list_transactions(Some(student.id), Some(year.id), None)
            .await?;
        let balance = student_balance(student.id, year.id, &transactions);
        self.cache.insert(key, &balance).await;
        Ok(balance)
    }

    pub async fn student_statement(
        &self,
        admission_number: &str,
        year_name: Option<&str>,
    ) -> Result<StudentStatement, AppError> {
        self.authorize(Permission::ViewFees).await?;
        let student = self.find_student(admission_number).await?;
        let academic_year = self.resolve_year(year_name).await?;

        let fees = self
            .repo
            .list_fee_records(&FeeRecordQuery {
                student_id: Some(student.id),
                academic_year_id: Some(academic_year.id),
                ..Default::default()
            })
            .await?;
        let payments = self
            .repo
            .list_payments(Some(student.id), Some(academic_year.id))
            .await?;
        let transactions = self
            .repo
            .list_transactions(Some(student.id), Some(academic_year.id), None)
            .await?;
        let balance = student_balance(student.id, academic_year.id, &transactions);

        Ok(StudentStatement {
            student,
            academic_year,
            fees,
            payments,
            balance,
        })
    }

    // ========================
    // Ledger and reports
    // ========================

    pub async fn list_ledger(
        &self,
        student: Option<&str>,
        year_name: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        self.authorize(Permission::ViewReports).await?;
        let student_id = match student {
            Some(admission) => Some(self.find_student(admission).await?.id),
            None => None,
        };
        let year_id = match year_name {
            Some(name) => Some(self.get_academic_year(name).await?.id),
            None => None,
        };
        Ok(self.repo.list_transactions(student_id, year_id, limit).await?)
    }

    /// Balance of every ledger account, optionally for one year.
    pub async fn account_balances(
        &self,
        year_name: Option<&str>,
    ) -> Result<Vec<(LedgerAccount, Cents)>, AppError> {
        self.authorize(Permission::ViewReports).await?;
        let year_id = match year_name {
            Some(name) => Some(self.get_academic_year(name).await?.id),
            None => None,
        };
        let transactions = self.repo.list_transactions(None, year_id, None).await?;
        let balances = account_balances(&transactions);
        Ok(LedgerAccount::ALL
            .iter()
            .map(|account| (*account, balances.get(account).copied().unwrap_or(0)))
            .collect())
    }

    /// Ledger balance of every student billed in a year, largest outstanding first.
    pub async fn year_balances(&self, year_name: Option<&str>) -> Result<Vec<BalanceEntry>, AppError> {
        self.authorize(Permission::ViewReports).await?;
        let year = self.resolve_year(year_name).await?;
        let transactions = self.repo.list_transactions(None, Some(year.id), None).await?;

        let mut entries = Vec::new();
        for ((student_id, _), balance) in project_balances(&transactions) {
            if let Some(student) = self.repo.get_student(student_id).await? {
                entries.push(BalanceEntry { student, balance });
            }
        }
        entries.sort_by(|a, b| {
            b.balance
                .outstanding
                .cmp(&a.balance.outstanding)
                .then_with(|| a.student.admission_number.cmp(&b.student.admission_number))
        });
        Ok(entries)
    }

    /// Fee totals for a year as of `today`.
    pub async fn year_summary(
        &self,
        year_name: Option<&str>,
        today: NaiveDate,
    ) -> Result<YearSummary, AppError> {
        self.authorize(Permission::ViewReports).await?;
        let year = self.resolve_year(year_name).await?;
        self.compute_year_summary(&year, today).await
    }

    async fn compute_year_summary(
        &self,
        year: &AcademicYear,
        today: NaiveDate,
    ) -> Result<YearSummary, AppError> {
        // Overdue counts depend on the day, so it is part of the key
        let key = CacheKey::new(CacheKind::YearSummary, Some(year.id), today.to_string());
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        let rows = self.year_fee_records(year.id).await?;
        let summary = summarize_year(year.id, &rows, today);
        self.cache.insert(key, &summary).await;
        Ok(summary)
    }

    /// Everything needed to archive a year as one JSON document.
    pub async fn year_snapshot(
        &self,
        year_name: Option<&str>,
        today: NaiveDate,
    ) -> Result<YearSnapshot, AppError> {
        let academic_year = self.resolve_year(year_name).await?;
        self.record_export(&format!("year snapshot {}", academic_year.name))
            .await?;

        let fee_records = self.year_fee_records(academic_year.id).await?;
        let payments = self.repo.list_payments(None, Some(academic_year.id)).await?;
        let summary = self.compute_year_summary(&academic_year, today).await?;

        Ok(YearSnapshot {
            generated_at: Utc::now(),
            as_of: today,
            summary,
            by_fee_type: summarize_by_fee_type(&fee_records),
            academic_year,
            fee_records,
            payments,
        })
    }

    /// Compare every fee row with the ledger and look for sequence gaps.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, AppError> {
        self.authorize(Permission::ViewReports).await?;
        let fee_records = self
            .repo
            .list_fee_records(&FeeRecordQuery::default())
            .await?;
        let transactions = self.repo.list_transactions(None, None, None).await?;

        let report = reconcile(&fee_records, &transactions);
        if report.is_ok() {
            debug!(
                fee_records = report.fee_record_count,
                transactions = report.transaction_count,
                "integrity check passed"
            );
        } else {
            warn!(
                mismatches = report.mismatches.len(),
                missing_sequences = report.missing_sequences.len(),
                orphans = report.orphan_transactions.len(),
                account_total = report.account_total,
                "integrity check failed"
            );
        }
        Ok(report)
    }
}
