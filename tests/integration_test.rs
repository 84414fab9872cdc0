mod common;

use anyhow::Result;
use bursar::application::AppError;
use bursar::config::existing_database_url;
use bursar::domain::PaymentMethod;
use bursar::Repository;
use common::{add_student, day, parse_date, test_service, StandardSchool};

#[tokio::test]
async fn test_academic_years() -> Result<()> {
    let (service, _temp) = test_service().await?;

    assert!(matches!(
        service.current_academic_year().await,
        Err(AppError::NoCurrentYear)
    ));

    StandardSchool::create_basic(&service).await?;
    assert_eq!(service.current_academic_year().await?.name, "2024-2025");

    let years = service.list_academic_years().await?;
    assert_eq!(years.len(), 2);
    assert_eq!(years[0].name, "2024-2025");

    service.set_current_year("2025-2026").await?;
    assert_eq!(service.current_academic_year().await?.name, "2025-2026");
    let current: Vec<_> = service
        .list_academic_years()
        .await?
        .into_iter()
        .filter(|y| y.is_current)
        .collect();
    assert_eq!(current.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_academic_year_validation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_basic(&service).await?;

    let result = service
        .create_academic_year("2024-2025".into(), day("2024-09-01"), day("2025-06-30"), false)
        .await;
    assert!(matches!(result, Err(AppError::YearAlreadyExists(_))));

    let result = service
        .create_academic_year("backwards".into(), day("2026-06-30"), day("2025-09-01"), false)
        .await;
    assert!(matches!(result, Err(AppError::InvalidDate(_))));

    Ok(())
}

#[tokio::test]
async fn test_teachers_and_class_assignment() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_basic(&service).await?;

    service
        .add_teacher(
            "T01".into(),
            "Maria".into(),
            "Montessori".into(),
            Some("maria@school.test".into()),
            Some("Science".into()),
        )
        .await?;
    let duplicate = service
        .add_teacher("T01".into(), "Other".into(), "Person".into(), None, None)
        .await;
    assert!(matches!(duplicate, Err(AppError::TeacherAlreadyExists(_))));

    service.assign_class_teacher("5A", Some("T01")).await?;
    let roster = service.class_roster("5A", None).await?;
    assert_eq!(roster.teacher_name.as_deref(), Some("Maria Montessori"));

    service.archive_teacher("T01").await?;
    assert!(service.list_teachers(false).await?.is_empty());
    assert_eq!(service.list_teachers(true).await?.len(), 1);

    // Archiving clears the class teacher
    let roster = service.class_roster("5A", None).await?;
    assert!(roster.teacher_name.is_none());

    let result = service.assign_class_teacher("5A", Some("T01")).await;
    assert!(matches!(result, Err(AppError::TeacherNotFound(_))));

    Ok(())
}

#[tokio::test]
async fn test_classes() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_basic(&service).await?;

    let classes = service.list_classes().await?;
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0].display_name(), "5A (A)");

    let result = service.create_class("5A".into(), None, None).await;
    assert!(matches!(result, Err(AppError::ClassAlreadyExists(_))));

    let result = service.create_class("Empty".into(), None, Some(0)).await;
    assert!(matches!(result, Err(AppError::InvalidAmount(_))));

    assert!(matches!(
        service.class_roster("9Z", None).await,
        Err(AppError::ClassNotFound(_))
    ));

    Ok(())
}

#[tokio::test]
async fn test_student_registration() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let info = service.student_info("S001").await?;
    assert_eq!(info.student.full_name(), "Ada Lovelace");
    let current = info.current_enrollment.expect("enrolled");
    assert_eq!(current.class_name, "5A");
    assert_eq!(current.year_name, "2024-2025");

    let result = add_student(&service, "S001", "Dup", "Licate", None).await;
    assert!(result.is_err());

    add_student(&service, "S004", "Barbara", "Liskov", None).await?;
    assert!(service.student_info("S004").await?.current_enrollment.is_none());
    assert_eq!(service.list_students(false).await?.len(), 4);

    Ok(())
}

#[tokio::test]
async fn test_delete_student_cascades() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    service
        .enroll_student(
            "S003",
            "5B",
            None,
            bursar::domain::EnrollmentStatus::Transferred,
            parse_date("2024-10-01"),
        )
        .await?;

    let deleted = service.delete_student("S003").await?;
    assert_eq!(deleted.enrollments, 2);
    assert_eq!(deleted.fee_records, 0);

    assert!(matches!(
        service.get_student("S003").await,
        Err(AppError::StudentNotFound(_))
    ));
    assert!(service.class_roster("5B", None).await?.students.is_empty());

    let events = service.list_security_events(None).await?;
    assert!(events.iter().any(|e| e.event_type == "student_deleted"));

    Ok(())
}

#[tokio::test]
async fn test_delete_refused_with_ledger_history() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let fee = service
        .assign_fee("S001", None, "tuition", 10_000, day("2024-10-01"))
        .await?;
    service
        .record_payment(fee.id, 5_000, PaymentMethod::Cash, parse_date("2024-09-10"), None)
        .await?;

    let result = service.delete_student("S001").await;
    assert!(matches!(result, Err(AppError::HasLedgerHistory(_))));

    // Everything is still there
    assert!(service.get_student("S001").await.is_ok());
    assert_eq!(service.list_ledger(Some("S001"), None, None).await?.len(), 2);
    assert!(service.check_integrity().await?.is_ok());

    Ok(())
}

#[tokio::test]
async fn test_cascade_delete_rolls_back_on_failure() -> Result<()> {
    let (service, temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    service
        .assign_fee("S001", None, "tuition", 10_000, day("2024-10-01"))
        .await?;
    let student = service.get_student("S001").await?;

    // Bypass the service pre-check so the transaction itself hits the ledger
    let db_path = temp.path().join("test.db");
    let repo = Repository::connect(&existing_database_url(db_path.to_str().unwrap())).await?;
    let result = repo.delete_student_cascade(student.id).await;
    assert!(result.is_err());

    // The enrollment deleted earlier in the same transaction is back
    assert!(service.get_student("S001").await.is_ok());
    assert_eq!(service.enrollment_history("S001").await?.len(), 1);
    assert_eq!(service.list_fee_records(&Default::default()).await?.len(), 1);
    assert!(service.check_integrity().await?.is_ok());

    Ok(())
}
