mod common;

use anyhow::Result;
use bursar::application::AppError;
use bursar::domain::{EnrollmentError, EnrollmentStatus, StudentStatus};
use common::{add_student, parse_date, test_service, StandardSchool};

#[tokio::test]
async fn test_transfer_closes_previous_version() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let info = service
        .enroll_student(
            "S001",
            "5B",
            None,
            EnrollmentStatus::Transferred,
            parse_date("2025-01-15"),
        )
        .await?;
    assert_eq!(info.class_name, "5B");
    assert!(info.enrollment.is_current());

    let history = service.enrollment_history("S001").await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].class_name, "5A");
    assert_eq!(history[0].enrollment.valid_from, parse_date("2024-09-01"));
    assert_eq!(history[0].enrollment.valid_to, Some(parse_date("2025-01-15")));
    assert_eq!(history[1].class_name, "5B");
    assert_eq!(history[1].enrollment.valid_to, None);
    assert_eq!(history[1].enrollment.status, EnrollmentStatus::Transferred);

    Ok(())
}

#[tokio::test]
async fn test_as_of_uses_half_open_intervals() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    service
        .enroll_student(
            "S001",
            "5B",
            None,
            EnrollmentStatus::Transferred,
            parse_date("2025-01-15"),
        )
        .await?;

    let before = service
        .enrollment_as_of("S001", parse_date("2024-12-01"))
        .await?;
    assert_eq!(before.map(|i| i.class_name), Some("5A".to_string()));

    let boundary = service
        .enrollment_as_of("S001", parse_date("2025-01-15"))
        .await?;
    assert_eq!(boundary.map(|i| i.class_name), Some("5B".to_string()));

    let too_early = service
        .enrollment_as_of("S001", parse_date("2024-08-01"))
        .await?;
    assert!(too_early.is_none());

    Ok(())
}

#[tokio::test]
async fn test_unchanged_or_backdated_changes_are_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let result = service
        .enroll_student(
            "S001",
            "5A",
            None,
            EnrollmentStatus::Enrolled,
            parse_date("2024-10-01"),
        )
        .await;
    assert!(matches!(
        result,
        Err(AppError::Enrollment(EnrollmentError::Unchanged))
    ));

    let result = service
        .enroll_student(
            "S001",
            "5B",
            None,
            EnrollmentStatus::Transferred,
            parse_date("2024-08-15"),
        )
        .await;
    assert!(matches!(
        result,
        Err(AppError::Enrollment(EnrollmentError::ChangeBeforeCurrent { .. }))
    ));

    // Rejected changes leave history untouched
    assert_eq!(service.enrollment_history("S001").await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_class_capacity_is_enforced() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    service.create_class("Tiny".into(), None, Some(1)).await?;

    add_student(&service, "S010", "Edsger", "Dijkstra", Some("Tiny")).await?;

    let result = service
        .enroll_student(
            "S001",
            "Tiny",
            None,
            EnrollmentStatus::Transferred,
            parse_date("2024-10-01"),
        )
        .await;
    assert!(matches!(
        result,
        Err(AppError::ClassFull { capacity: 1, .. })
    ));

    // A status change inside the same class does not need a free seat
    service
        .enroll_student(
            "S010",
            "Tiny",
            None,
            EnrollmentStatus::Promoted,
            parse_date("2024-10-01"),
        )
        .await?;

    Ok(())
}

#[tokio::test]
async fn test_archive_and_restore() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let archived = service
        .archive_student("S002", parse_date("2025-02-01"))
        .await?;
    assert_eq!(archived.status, StudentStatus::Archived);

    let info = service.student_info("S002").await?;
    assert!(info.current_enrollment.is_none());
    assert!(service
        .list_students(false)
        .await?
        .iter()
        .all(|s| s.admission_number != "S002"));

    let roster = service.class_roster("5A", None).await?;
    assert_eq!(roster.students.len(), 2);

    let result = service
        .enroll_student(
            "S002",
            "5B",
            None,
            EnrollmentStatus::Enrolled,
            parse_date("2025-02-10"),
        )
        .await;
    assert!(matches!(result, Err(AppError::StudentArchived(_))));

    let restored = service
        .restore_student("S002", parse_date("2025-03-01"))
        .await?;
    assert_eq!(restored.status, StudentStatus::Active);

    let history = service.enrollment_history("S002").await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].enrollment.valid_to, Some(parse_date("2025-02-01")));
    assert_eq!(history[1].class_name, "5A");
    assert_eq!(history[1].enrollment.valid_from, parse_date("2025-03-01"));

    // Nobody was enrolled during the gap
    let gap = service
        .enrollment_as_of("S002", parse_date("2025-02-15"))
        .await?;
    assert!(gap.is_none());

    let result = service
        .restore_student("S002", parse_date("2025-03-02"))
        .await;
    assert!(matches!(result, Err(AppError::StudentNotArchived(_))));

    Ok(())
}

#[tokio::test]
async fn test_roster_as_of_past_date() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    service
        .enroll_student(
            "S001",
            "5B",
            None,
            EnrollmentStatus::Transferred,
            parse_date("2025-01-15"),
        )
        .await?;

    let now = service.class_roster("5A", None).await?;
    assert_eq!(now.students.len(), 2);

    let then = service
        .class_roster("5A", Some(parse_date("2024-10-01")))
        .await?;
    assert_eq!(then.students.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_cross_year_promotion_refreshes_cached_history() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    // Warm the cache
    assert_eq!(service.enrollment_history("S003").await?.len(), 1);

    service
        .enroll_student(
            "S003",
            "5B",
            Some("2025-2026"),
            EnrollmentStatus::Promoted,
            parse_date("2025-09-01"),
        )
        .await?;

    let history = service.enrollment_history("S003").await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].year_name, "2025-2026");
    assert_eq!(history[1].enrollment.status, EnrollmentStatus::Promoted);

    Ok(())
}
