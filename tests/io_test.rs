mod common;

use anyhow::Result;
use bursar::application::{AppError, YearSnapshot};
use bursar::domain::{Actor, PaymentMethod, Role};
use bursar::io::{Exporter, ImportOptions, Importer};
use common::{day, parse_date, test_service, StandardSchool};

#[tokio::test]
async fn test_export_fee_records_csv() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    let fee = service
        .assign_fee("S001", None, "tuition", 100_000, day("2024-10-01"))
        .await?;
    service.apply_discount(fee.id, 5_000, Some("early bird".into())).await?;
    service
        .assign_fee("S002", None, "transport", 20_000, day("2024-10-01"))
        .await?;

    let mut buffer = Vec::new();
    let count = Exporter::new(&service)
        .export_fee_records_csv(&mut buffer, Some("2024-2025"))
        .await?;
    assert_eq!(count, 2);

    let output = String::from_utf8(buffer)?;
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("id,admission_number,student_name,fee_type"));
    assert!(output.contains("S001,Ada Lovelace,tuition,100000,5000,0,95000,2024-10-01,pending,early bird"));

    Ok(())
}

#[tokio::test]
async fn test_export_payments_and_ledger_csv() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    let fee = service
        .assign_fee("S001", None, "tuition", 100_000, day("2024-10-01"))
        .await?;
    let payment = service
        .record_payment(fee.id, 40_000, PaymentMethod::Card, parse_date("2024-09-10"), None)
        .await?;
    service.reverse_payment(&payment.receipt_number, None).await?;

    let exporter = Exporter::new(&service);

    let mut payments = Vec::new();
    assert_eq!(exporter.export_payments_csv(&mut payments, None).await?, 1);
    let payments = String::from_utf8(payments)?;
    assert!(payments.contains("RCP-2024-000001,S001"));

    let mut ledger = Vec::new();
    assert_eq!(exporter.export_ledger_csv(&mut ledger, None).await?, 3);
    let ledger = String::from_utf8(ledger)?;
    let rows: Vec<&str> = ledger.lines().skip(1).collect();
    assert!(rows[0].starts_with("1,"));
    assert!(rows[2].starts_with("3,"));
    assert!(rows[2].contains(",reversal,"));

    // Every export is recorded
    let exports = service
        .list_security_events(None)
        .await?
        .into_iter()
        .filter(|e| e.event_type == "data_exported")
        .count();
    assert_eq!(exports, 2);

    Ok(())
}

#[tokio::test]
async fn test_export_year_json_round_trips() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;
    let fee = service
        .assign_fee("S001", None, "tuition", 100_000, day("2024-10-01"))
        .await?;
    service
        .assign_fee("S002", None, "transport", 25_000, day("2024-10-01"))
        .await?;
    service
        .record_payment(fee.id, 100_000, PaymentMethod::Cash, parse_date("2024-09-10"), None)
        .await?;

    let mut buffer = Vec::new();
    let snapshot = Exporter::new(&service)
        .export_year_json(&mut buffer, None, day("2024-11-01"))
        .await?;

    let parsed: YearSnapshot = serde_json::from_slice(&buffer)?;
    assert_eq!(parsed.academic_year.name, "2024-2025");
    assert_eq!(parsed.fee_records.len(), 2);
    assert_eq!(parsed.payments.len(), 1);
    assert_eq!(parsed.summary.total_collected, snapshot.summary.total_collected);
    assert_eq!(parsed.by_fee_type[0].fee_type, "tuition");
    assert_eq!(parsed.by_fee_type[0].collected, 100_000);

    Ok(())
}

#[tokio::test]
async fn test_export_requires_permission() -> Result<()> {
    let (admin, _temp) = test_service().await?;
    StandardSchool::create_with_students(&admin).await?;
    let teacher = admin.as_actor(Actor::new("tom", Role::Teacher));

    let mut buffer = Vec::new();
    let result = Exporter::new(&teacher)
        .export_fee_records_csv(&mut buffer, None)
        .await;
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::PermissionDenied { .. })
    ));
    assert!(buffer.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_import_students_csv() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let csv = "\
admission_number,first_name,last_name,date_of_birth,guardian_name,guardian_phone,class,year
S010,Linus,Torvalds,2014-12-28,Nils,555-1234,5A,
S011,Bad,Date,28/12/2014,,,,
S001,Ada,Lovelace,,,,,
S012,Ken,Thompson,,,,,
";
    let result = Importer::new(&service)
        .import_students_csv(
            csv.as_bytes(),
            ImportOptions {
                dry_run: false,
                skip_duplicates: true,
            },
            parse_date("2024-09-02"),
        )
        .await?;

    assert_eq!(result.imported, 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].line, 3);
    assert_eq!(result.errors[0].field.as_deref(), Some("date_of_birth"));

    let linus = service.student_info("S010").await?;
    assert_eq!(linus.student.guardian_name.as_deref(), Some("Nils"));
    assert_eq!(
        linus.current_enrollment.map(|e| e.class_name),
        Some("5A".to_string())
    );
    assert!(service.student_info("S012").await?.current_enrollment.is_none());

    Ok(())
}

#[tokio::test]
async fn test_import_students_dry_run_writes_nothing() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_basic(&service).await?;

    let csv = "admission_number,first_name,last_name\nS020,Dry,Run\n";
    let result = Importer::new(&service)
        .import_students_csv(
            csv.as_bytes(),
            ImportOptions {
                dry_run: true,
                skip_duplicates: false,
            },
            parse_date("2024-09-02"),
        )
        .await?;

    assert_eq!(result.imported, 1);
    assert!(service.list_students(true).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_import_fees_csv() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let csv = "\
admission_number,fee_type,amount,due_date,year
S001,tuition,1500.00,2024-10-01,
S002,lab,abc,2024-10-01,
S999,tuition,100,2024-10-01,
S003,transport,250,2025-10-01,2025-2026
";
    let result = Importer::new(&service)
        .import_fees_csv(csv.as_bytes(), ImportOptions::default())
        .await?;

    assert_eq!(result.imported, 2);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(result.errors[0].field.as_deref(), Some("amount"));
    assert!(result.errors[1].error.contains("Student not found"));

    let statement = service.student_statement("S001", None).await?;
    assert_eq!(statement.fees[0].actual_amount, 150_000);
    let next_year = service.student_statement("S003", Some("2025-2026")).await?;
    assert_eq!(next_year.balance.outstanding, 25_000);
    assert!(service.check_integrity().await?.is_ok());

    Ok(())
}

#[tokio::test]
async fn test_reimporting_fees_skips_existing_assignments() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let csv = "admission_number,fee_type,amount,due_date,year\nS001,tuition,1500.00,2024-10-01,\n";
    let importer = Importer::new(&service);
    let options = ImportOptions {
        dry_run: false,
        skip_duplicates: true,
    };

    let first = importer.import_fees_csv(csv.as_bytes(), options.clone()).await?;
    assert_eq!(first.imported, 1);

    let second = importer.import_fees_csv(csv.as_bytes(), options).await?;
    assert_eq!(second.imported, 0);
    assert_eq!(second.skipped, 1);
    assert!(second.errors.is_empty());

    let statement = service.student_statement("S001", None).await?;
    assert_eq!(statement.fees.len(), 1);
    assert_eq!(statement.balance.outstanding, 150_000);

    // Without skipping, the repeat is reported instead
    let third = importer
        .import_fees_csv(csv.as_bytes(), ImportOptions::default())
        .await?;
    assert_eq!(third.imported, 0);
    assert_eq!(third.errors.len(), 1);
    assert!(third.errors[0].error.contains("already assigned"));
    assert_eq!(service.list_ledger(Some("S001"), None, None).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_duplicate_fee_rows_in_one_file() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let csv = "\
admission_number,fee_type,amount,due_date,year
S002,transport,200,2024-10-01,
S002,transport,200,2024-10-01,
";
    for dry_run in [true, false] {
        let result = Importer::new(&service)
            .import_fees_csv(
                csv.as_bytes(),
                ImportOptions {
                    dry_run,
                    skip_duplicates: true,
                },
            )
            .await?;
        assert_eq!(result.imported, 1, "dry_run = {}", dry_run);
        assert_eq!(result.skipped, 1, "dry_run = {}", dry_run);
    }

    Ok(())
}

#[tokio::test]
async fn test_dry_run_reports_what_the_real_import_would() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let csv = "\
admission_number,first_name,last_name,date_of_birth,guardian_name,guardian_phone,class,year
S001,Ada,Lovelace,,,,,
S030,Nowhere,Kid,,,,NOPE,
S031,Repeat,Once,,,,5A,
S031,Repeat,Twice,,,,5A,
S032,Fine,Student,,,,5B,
";
    let importer = Importer::new(&service);
    let dry = importer
        .import_students_csv(
            csv.as_bytes(),
            ImportOptions {
                dry_run: true,
                skip_duplicates: false,
            },
            parse_date("2024-09-02"),
        )
        .await?;
    assert_eq!(service.list_students(true).await?.len(), 3);

    let real = importer
        .import_students_csv(csv.as_bytes(), ImportOptions::default(), parse_date("2024-09-02"))
        .await?;

    assert_eq!(dry.imported, 2);
    assert_eq!(dry.errors.len(), 3);
    assert_eq!((dry.imported, dry.skipped), (real.imported, real.skipped));
    let lines = |r: &bursar::io::ImportResult| r.errors.iter().map(|e| e.line).collect::<Vec<_>>();
    assert_eq!(lines(&dry), vec![2, 3, 5]);
    assert_eq!(lines(&dry), lines(&real));
    assert!(dry.errors[1].error.contains("Class not found"));

    Ok(())
}

#[tokio::test]
async fn test_fee_dry_run_checks_students_and_years() -> Result<()> {
    let (service, _temp) = test_service().await?;
    StandardSchool::create_with_students(&service).await?;

    let csv = "\
admission_number,fee_type,amount,due_date,year
S999,tuition,100,2024-10-01,
S001,tuition,100,2024-10-01,1999-2000
S001,,100,2024-10-01,
S001,tuition,100,2024-10-01,
";
    let result = Importer::new(&service)
        .import_fees_csv(
            csv.as_bytes(),
            ImportOptions {
                dry_run: true,
                skip_duplicates: false,
            },
        )
        .await?;

    assert_eq!(result.imported, 1);
    assert_eq!(result.errors.len(), 3);
    assert!(result.errors[0].error.contains("Student not found"));
    assert!(result.errors[1].error.contains("Academic year not found"));
    assert!(result.errors[2].error.contains("Invalid fee type"));
    assert!(service.list_ledger(None, None, None).await?.is_empty());

    Ok(())
}
