// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use bursar::application::{NewStudent, SchoolService};
use bursar::config::AppConfig;
use bursar::domain::{Actor, Role};
use chrono::{DateTime, NaiveDate, Utc};
use tempfile::TempDir;

/// Helper to create a test service with a temporary database, acting as admin
pub async fn test_service() -> Result<(SchoolService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");

    let mut config = AppConfig::default();
    config.database.path = db_path.to_str().unwrap().to_string();

    let service = SchoolService::init(&config, Actor::new("office", Role::Admin)).await?;
    Ok((service, temp_dir))
}

/// Helper to parse a date string into DateTime<Utc>
pub fn parse_date(date_str: &str) -> DateTime<Utc> {
    day(date_str).and_hms_opt(0, 0, 0).unwrap().and_utc()
}

pub fn day(date_str: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").unwrap()
}

/// Test fixture: one current year, two classes and a few enrolled students
pub struct StandardSchool;

impl StandardSchool {
    /// Current year 2024-2025 plus 2025-2026, classes 5A (capacity 30) and 5B
    pub async fn create_basic(service: &SchoolService) -> Result<()> {
        service
            .create_academic_year(
                "2024-2025".into(),
                day("2024-09-01"),
                day("2025-06-30"),
                true,
            )
            .await?;
        service
            .create_academic_year(
                "2025-2026".into(),
                day("2025-09-01"),
                day("2026-06-30"),
                false,
            )
            .await?;
        service
            .create_class("5A".into(), Some("A".into()), Some(30))
            .await?;
        service.create_class("5B".into(), None, None).await?;
        Ok(())
    }

    /// Basic school plus students S001..S003 enrolled in 5A on 2024-09-01
    pub async fn create_with_students(service: &SchoolService) -> Result<()> {
        Self::create_basic(service).await?;
        for (admission, first, last) in [
            ("S001", "Ada", "Lovelace"),
            ("S002", "Alan", "Turing"),
            ("S003", "Grace", "Hopper"),
        ] {
            add_student(service, admission, first, last, Some("5A")).await?;
        }
        Ok(())
    }
}

pub async fn add_student(
    service: &SchoolService,
    admission: &str,
    first: &str,
    last: &str,
    class: Option<&str>,
) -> Result<()> {
    service
        .add_student(
            NewStudent {
                admission_number: admission.into(),
                first_name: first.into(),
                last_name: last.into(),
                class: class.map(str::to_string),
                ..Default::default()
            },
            parse_date("2024-09-01"),
        )
        .await?;
    Ok(())
}
