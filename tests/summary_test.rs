mod common;

use anyhow::Result;
use bursar::domain::PaymentMethod;
use common::{day, parse_date, test_service, StandardSchool};

/// S001 paid in full after a discount, S002 part paid, S003 untouched and late
async fn bill_standard_fees(service: &bursar::application::SchoolService) -> Result<()> {
    let s001 = service
        .assign_fee("S001", None, "tuition", 100_000, day("2024-10-01"))
        .await?;
    service.apply_discount(s001.id, 10_000, None).await?;
    service
        .record_payment(s001.id, 90_000, PaymentMethod::Cash, parse_date("2024-09-15"), None)
        .await?;

    let s002 = service
        .assign_fee("S002", None, "tuition", 100_000, day("2024-10-01"))
        .await?;
    service
        .record_payment(s002.id, 30_000, PaymentMethod::Card, parse_date("2024-09-20"), None)
        .await?;

    service
        .assign_fee("S003", None, "transport", 50_000, day("2024-10-01"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_year_summary_totals() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    bill_standard_fees(&service).await?;

    // Next year's billing stays out of this year's summary
    service
        .assign_fee("S001", Some("2025-2026"), "tuition", 120_000, day("2025-10-01"))
        .await?;

    let summary = service.year_summary(None, day("2024-11-01")).await?;

    assert_eq!(summary.record_count, 3);
    assert_eq!(summary.total_actual, 250_000);
    assert_eq!(summary.total_discount, 10_000);
    assert_eq!(summary.total_expected, 240_000);
    assert_eq!(summary.total_collected, 120_000);
    assert_eq!(summary.total_pending, 120_000);
    assert!((summary.collection_rate - 50.0).abs() < 0.001);
    assert_eq!(summary.paid_count, 1);
    assert_eq!(summary.partial_count, 1);
    assert_eq!(summary.pending_count, 1);
    assert_eq!(summary.overdue_count, 1);
    assert_eq!(summary.student_count, 3);

    assert_eq!(
        summary.total_collected + summary.total_pending + summary.total_discount,
        summary.total_actual
    );

    Ok(())
}

#[tokio::test]
async fn test_summary_for_empty_year() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_basic(&service).await?;

    let summary = service
        .year_summary(Some("2025-2026"), day("2025-10-01"))
        .await?;
    assert_eq!(summary.record_count, 0);
    assert_eq!(summary.total_expected, 0);
    assert_eq!(summary.collection_rate, 0.0);

    Ok(())
}

#[tokio::test]
async fn test_summary_cache_follows_mutations() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    bill_standard_fees(&service).await?;

    let today = day("2024-11-01");
    let before = service.year_summary(None, today).await?;
    assert_eq!(before.total_collected, 120_000);

    let s003 = service
        .list_fee_records(&bursar::application::FeeFilter {
            student: Some("S003".into()),
            ..Default::default()
        })
        .await?;
    service
        .record_payment(
            s003[0].id,
            50_000,
            PaymentMethod::Online,
            parse_date("2024-10-20"),
            None,
        )
        .await?;

    let after = service.year_summary(None, today).await?;
    assert_eq!(after.total_collected, 170_000);
    assert_eq!(after.overdue_count, 0);
    assert_eq!(after.paid_count, 2);

    Ok(())
}

#[tokio::test]
async fn test_year_balances_order_by_outstanding() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    bill_standard_fees(&service).await?;

    let balances = service.year_balances(None).await?;
    let order: Vec<&str> = balances
        .iter()
        .map(|entry| entry.student.admission_number.as_str())
        .collect();
    assert_eq!(order, vec!["S002", "S003", "S001"]);
    assert_eq!(balances[0].balance.outstanding, 70_000);
    assert_eq!(balances[2].balance.outstanding, 0);

    Ok(())
}
