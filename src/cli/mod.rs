use std::fs::File;
use std::io::{stdin, stdout, Read, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::application::{FeeFilter, NewStudent, SchoolService};
use crate::config::AppConfig;
use crate::domain::{
    format_cents, parse_cents, Actor, EnrollmentStatus, FeeStatus, PaymentMethod, Role,
    StudentFeeRecord,
};
use crate::io::{Exporter, ImportOptions, Importer};

/// Bursar - School office fee ledger
#[derive(Parser)]
#[command(name = "bursar")]
#[command(about = "A local-first school administration tool built around a fee ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides BURSAR_DATABASE)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Role to act as: admin, accountant, teacher, student, parent
    #[arg(long, global = true, default_value = "admin")]
    pub role: String,

    /// Name recorded on payments, history and security events
    #[arg(long, global = true, default_value = "office")]
    pub actor: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Academic year management
    #[command(subcommand)]
    Year(YearCommands),

    /// Teacher management
    #[command(subcommand)]
    Teacher(TeacherCommands),

    /// Class management
    #[command(subcommand)]
    Class(ClassCommands),

    /// Student records and enrollment
    #[command(subcommand)]
    Student(StudentCommands),

    /// Fees, discounts and payments
    #[command(subcommand)]
    Fee(FeeCommands),

    /// Ledger inspection
    #[command(subcommand)]
    Ledger(LedgerCommands),

    /// Fee totals for an academic year
    Summary {
        /// Academic year name (defaults to the current year)
        #[arg(long)]
        year: Option<String>,

        /// Output format: table, json
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show recent security events
    SecurityLog {
        /// Maximum number of events to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Export data to CSV or JSON
    Export {
        /// What to export: fees, payments, ledger, year
        export_type: String,

        /// Academic year name (all years when omitted, current year for `year`)
        #[arg(long)]
        year: Option<String>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Import students or fees from CSV
    Import {
        /// What to import: students, fees
        import_type: String,

        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<String>,

        /// Validate without importing
        #[arg(long)]
        dry_run: bool,

        /// Skip students that already exist
        #[arg(long)]
        skip_duplicates: bool,
    },
}

#[derive(Subcommand)]
pub enum YearCommands {
    /// Create an academic year
    Create {
        /// Year name, e.g. 2024-2025
        name: String,

        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Last day (YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// Make this the current year
        #[arg(long)]
        current: bool,
    },

    /// List academic years
    List,

    /// Show the current year, or make the named year current
    Current {
        /// Year to make current
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TeacherCommands {
    /// Add a teacher
    Add {
        /// Staff number (must be unique)
        staff_number: String,
        first_name: String,
        last_name: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        subject: Option<String>,
    },

    /// List teachers
    List {
        /// Include archived teachers
        #[arg(long)]
        all: bool,
    },

    /// Archive a teacher
    Archive { staff_number: String },
}

#[derive(Subcommand)]
pub enum ClassCommands {
    /// Create a class
    Create {
        /// Class name (must be unique)
        name: String,

        #[arg(long)]
        section: Option<String>,

        /// Maximum number of enrolled students
        #[arg(long)]
        capacity: Option<i64>,
    },

    /// List classes
    List,

    /// Set or clear the class teacher
    AssignTeacher {
        class: String,

        /// Staff number (omit to clear)
        #[arg(long)]
        teacher: Option<String>,
    },

    /// Students in a class
    Roster {
        class: String,

        /// Show the roster as it was on this date (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum StudentCommands {
    /// Register a student
    Add {
        /// Admission number (must be unique)
        admission_number: String,
        first_name: String,
        last_name: String,

        /// Date of birth (YYYY-MM-DD)
        #[arg(long)]
        dob: Option<String>,

        #[arg(long)]
        guardian: Option<String>,

        #[arg(long)]
        phone: Option<String>,

        /// Enroll into this class
        #[arg(long)]
        class: Option<String>,

        /// Academic year for the enrollment (defaults to the current year)
        #[arg(long)]
        year: Option<String>,
    },

    /// List students
    List {
        /// Include archived students
        #[arg(long)]
        all: bool,
    },

    /// Show a student with their current enrollment
    Show { admission_number: String },

    /// Enroll, transfer or promote a student
    Enroll {
        admission_number: String,

        #[arg(long)]
        class: String,

        #[arg(long)]
        year: Option<String>,

        /// enrolled, promoted, transferred
        #[arg(long, default_value = "enrolled")]
        status: String,

        /// Effective date (YYYY-MM-DD, defaults to now)
        #[arg(long)]
        date: Option<String>,
    },

    /// Enrollment history
    History {
        admission_number: String,

        /// Only the version in effect on this date (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Archive a student (closes their enrollment)
    Archive {
        admission_number: String,

        #[arg(long)]
        date: Option<String>,
    },

    /// Restore an archived student into their last class
    Restore {
        admission_number: String,

        #[arg(long)]
        date: Option<String>,
    },

    /// Permanently delete a student without ledger history
    Delete { admission_number: String },
}

#[derive(Subcommand)]
pub enum FeeCommands {
    /// Bill a fee to a student
    Assign {
        admission_number: String,

        /// Fee type, e.g. tuition, transport
        fee_type: String,

        /// Amount (e.g., "1500.00" or "1500")
        amount: String,

        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: String,

        #[arg(long)]
        year: Option<String>,
    },

    /// Apply a discount
    Discount {
        fee_id: String,
        amount: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Record a payment
    Pay {
        fee_id: String,
        amount: String,

        /// cash, card, bank_transfer, cheque, online
        #[arg(short, long, default_value = "cash")]
        method: String,

        /// Payment date (YYYY-MM-DD, defaults to now)
        #[arg(long)]
        date: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Reverse a payment by receipt number
    Reverse {
        receipt_number: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Change the billed amount
    Adjust {
        fee_id: String,
        new_amount: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// List fee records
    List {
        #[arg(long)]
        student: Option<String>,

        #[arg(long)]
        year: Option<String>,

        /// pending, partial, paid
        #[arg(long)]
        status: Option<String>,

        #[arg(long = "type")]
        fee_type: Option<String>,
    },

    /// Show a fee record with payments and history
    Show { fee_id: String },

    /// Pending fees past their due date
    Overdue {
        #[arg(long)]
        year: Option<String>,
    },

    /// Statement for one student
    Statement {
        admission_number: String,

        #[arg(long)]
        year: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// List ledger transactions
    List {
        #[arg(long)]
        student: Option<String>,

        #[arg(long)]
        year: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Outstanding balance of every student in a year
    Balances {
        #[arg(long)]
        year: Option<String>,
    },

    /// Balance of each ledger account
    Accounts {
        #[arg(long)]
        year: Option<String>,
    },

    /// Reconcile fee records against the ledger
    Check,
}

impl Cli {
    fn actor(&self) -> Result<Actor> {
        let role = Role::from_str(&self.role).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid role '{}'. Valid roles: admin, accountant, teacher, student, parent",
                self.role
            )
        })?;
        Ok(Actor::new(self.actor.clone(), role))
    }

    pub async fn run(self, mut config: AppConfig) -> Result<()> {
        if let Some(ref path) = self.database {
            config.database.path = path.clone();
        }
        let actor = self.actor()?;

        if matches!(self.command, Commands::Init) {
            SchoolService::init(&config, actor).await?;
            println!("Database initialized: {}", config.database.path);
            return Ok(());
        }

        let service = SchoolService::connect(&config, actor).await?;

        match self.command {
            Commands::Init => {}
            Commands::Year(cmd) => run_year_command(&service, cmd).await?,
            Commands::Teacher(cmd) => run_teacher_command(&service, cmd).await?,
            Commands::Class(cmd) => run_class_command(&service, cmd).await?,
            Commands::Student(cmd) => run_student_command(&service, cmd).await?,
            Commands::Fee(cmd) => run_fee_command(&service, cmd, &config.fees.currency).await?,
            Commands::Ledger(cmd) => run_ledger_command(&service, cmd).await?,
            Commands::Summary { year, format } => {
                run_summary_command(&service, year.as_deref(), &format).await?
            }
            Commands::SecurityLog { limit } => {
                let events = service.list_security_events(Some(limit)).await?;
                if events.is_empty() {
                    println!("No security events.");
                } else {
                    println!(
                        "{:<20} {:<9} {:<16} {:<12} DETAIL",
                        "TIME", "SEVERITY", "EVENT", "ACTOR"
                    );
                    println!("{}", "-".repeat(80));
                    for event in events {
                        println!(
                            "{:<20} {:<9} {:<16} {:<12} {}",
                            event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                            event.severity,
                            truncate(&event.event_type, 16),
                            truncate(&format!("{} ({})", event.actor, event.role), 12),
                            event.detail
                        );
                    }
                }
            }
            Commands::Export {
                export_type,
                year,
                output,
            } => {
                run_export_command(&service, &export_type, year.as_deref(), output.as_deref())
                    .await?
            }
            Commands::Import {
                import_type,
                input,
                dry_run,
                skip_duplicates,
            } => {
                run_import_command(
                    &service,
                    &import_type,
                    input.as_deref(),
                    ImportOptions {
                        dry_run,
                        skip_duplicates,
                    },
                )
                .await?
            }
        }

        Ok(())
    }
}

async fn run_year_command(service: &SchoolService, cmd: YearCommands) -> Result<()> {
    match cmd {
        YearCommands::Create {
            name,
            start,
            end,
            current,
        } => {
            let start = parse_date(&start).context("Invalid start date")?;
            let end = parse_date(&end).context("Invalid end date")?;
            let year = service
                .create_academic_year(name, start, end, current)
                .await?;
            println!(
                "Created academic year: {} ({} to {}){}",
                year.name,
                year.start_date,
                year.end_date,
                if year.is_current { " [current]" } else { "" }
            );
        }

        YearCommands::List => {
            let years = service.list_academic_years().await?;
            if years.is_empty() {
                println!("No academic years found.");
            } else {
                println!("{:<12} {:<12} {:<12} CURRENT", "NAME", "START", "END");
                println!("{}", "-".repeat(46));
                for year in years {
                    println!(
                        "{:<12} {:<12} {:<12} {}",
                        year.name,
                        year.start_date,
                        year.end_date,
                        if year.is_current { "*" } else { "" }
                    );
                }
            }
        }

        YearCommands::Current { name } => {
            let year = match name {
                Some(name) => service.set_current_year(&name).await?,
                None => service.current_academic_year().await?,
            };
            println!("Current academic year: {}", year.name);
        }
    }
    Ok(())
}

async fn run_teacher_command(service: &SchoolService, cmd: TeacherCommands) -> Result<()> {
    match cmd {
        TeacherCommands::Add {
            staff_number,
            first_name,
            last_name,
            email,
            subject,
        } => {
            let teacher = service
                .add_teacher(staff_number, first_name, last_name, email, subject)
                .await?;
            println!(
                "Added teacher: {} ({})",
                teacher.full_name(),
                teacher.staff_number
            );
        }

        TeacherCommands::List { all } => {
            let teachers = service.list_teachers(all).await?;
            if teachers.is_empty() {
                println!("No teachers found.");
            } else {
                println!("{:<10} {:<25} {:<15} EMAIL", "STAFF", "NAME", "SUBJECT");
                println!("{}", "-".repeat(70));
                for teacher in teachers {
                    println!(
                        "{:<10} {:<25} {:<15} {}{}",
                        teacher.staff_number,
                        truncate(&teacher.full_name(), 25),
                        teacher.subject.as_deref().unwrap_or(""),
                        teacher.email.as_deref().unwrap_or(""),
                        if teacher.is_archived() { " (archived)" } else { "" }
                    );
                }
            }
        }

        TeacherCommands::Archive { staff_number } => {
            service.archive_teacher(&staff_number).await?;
            println!("Archived teacher: {}", staff_number);
        }
    }
    Ok(())
}

async fn run_class_command(service: &SchoolService, cmd: ClassCommands) -> Result<()> {
    match cmd {
        ClassCommands::Create {
            name,
            section,
            capacity,
        } => {
            let class = service.create_class(name, section, capacity).await?;
            println!("Created class: {}", class.display_name());
        }

        ClassCommands::List => {
            let classes = service.list_classes().await?;
            if classes.is_empty() {
                println!("No classes found.");
            } else {
                println!("{:<15} {:<10} {:>8}", "NAME", "SECTION", "CAPACITY");
                println!("{}", "-".repeat(35));
                for class in classes {
                    println!(
                        "{:<15} {:<10} {:>8}",
                        class.name,
                        class.section.as_deref().unwrap_or(""),
                        class
                            .capacity
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }

        ClassCommands::AssignTeacher { class, teacher } => {
            service
                .assign_class_teacher(&class, teacher.as_deref())
                .await?;
            match teacher {
                Some(staff) => println!("Assigned {} as class teacher of {}", staff, class),
                None => println!("Cleared class teacher of {}", class),
            }
        }

        ClassCommands::Roster { class, as_of } => {
            let as_of = as_of
                .map(|s| parse_timestamp(&s))
                .transpose()
                .context("Invalid as-of date")?;
            let roster = service.class_roster(&class, as_of).await?;

            println!("Class: {}", roster.class.display_name());
            if let Some(teacher) = &roster.teacher_name {
                println!("Class teacher: {}", teacher);
            }
            println!();
            if roster.students.is_empty() {
                println!("No students enrolled.");
            } else {
                for student in &roster.students {
                    println!("  {:<12} {}", student.admission_number, student.full_name());
                }
                println!();
                println!("{} student(s)", roster.students.len());
            }
        }
    }
    Ok(())
}

async fn run_student_command(service: &SchoolService, cmd: StudentCommands) -> Result<()> {
    match cmd {
        StudentCommands::Add {
            admission_number,
            first_name,
            last_name,
            dob,
            guardian,
            phone,
            class,
            year,
        } => {
            let date_of_birth = dob
                .map(|s| parse_date(&s))
                .transpose()
                .context("Invalid date of birth")?;
            let enrolled_in = class.clone();
            let student = service
                .add_student(
                    NewStudent {
                        admission_number,
                        first_name,
                        last_name,
                        date_of_birth,
                        guardian_name: guardian,
                        guardian_phone: phone,
                        class,
                        year,
                    },
                    Utc::now(),
                )
                .await?;
            match enrolled_in {
                Some(class) => println!(
                    "Added student: {} ({}) in {}",
                    student.full_name(),
                    student.admission_number,
                    class
                ),
                None => println!(
                    "Added student: {} ({})",
                    student.full_name(),
                    student.admission_number
                ),
            }
        }

        StudentCommands::List { all } => {
            let students = service.list_students(all).await?;
            if students.is_empty() {
                println!("No students found.");
            } else {
                println!("{:<12} {:<30} STATUS", "ADMISSION", "NAME");
                println!("{}", "-".repeat(52));
                for student in students {
                    println!(
                        "{:<12} {:<30} {}",
                        student.admission_number,
                        truncate(&student.full_name(), 30),
                        student.status
                    );
                }
            }
        }

        StudentCommands::Show { admission_number } => {
            let info = service.student_info(&admission_number).await?;
            let student = &info.student;

            println!("Student: {}", student.full_name());
            println!("  Admission no: {}", student.admission_number);
            println!("  Status:       {}", student.status);
            if let Some(dob) = student.date_of_birth {
                println!("  Born:         {}", dob);
            }
            if let Some(guardian) = &student.guardian_name {
                println!(
                    "  Guardian:     {}{}",
                    guardian,
                    student
                        .guardian_phone
                        .as_ref()
                        .map(|p| format!(" ({})", p))
                        .unwrap_or_default()
                );
            }
            match &info.current_enrollment {
                Some(current) => println!(
                    "  Class:        {} ({}, {} since {})",
                    current.class_name,
                    current.year_name,
                    current.enrollment.status,
                    current.enrollment.valid_from.format("%Y-%m-%d")
                ),
                None => println!("  Class:        (not enrolled)"),
            }
        }

        StudentCommands::Enroll {
            admission_number,
            class,
            year,
            status,
            date,
        } => {
            let status = EnrollmentStatus::from_str(&status).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid status '{}'. Valid: enrolled, promoted, transferred",
                    status
                )
            })?;
            let at = effective_time(date)?;
            let info = service
                .enroll_student(&admission_number, &class, year.as_deref(), status, at)
                .await?;
            println!(
                "{} is now {} in {} ({}) from {}",
                admission_number,
                info.enrollment.status,
                info.class_name,
                info.year_name,
                info.enrollment.valid_from.format("%Y-%m-%d")
            );
        }

        StudentCommands::History {
            admission_number,
            as_of,
        } => {
            let versions = match as_of {
                Some(date) => {
                    let at = parse_timestamp(&date).context("Invalid as-of date")?;
                    service
                        .enrollment_as_of(&admission_number, at)
                        .await?
                        .into_iter()
                        .collect()
                }
                None => service.enrollment_history(&admission_number).await?,
            };

            if versions.is_empty() {
                println!("No enrollment history.");
            } else {
                println!(
                    "{:<12} {:<12} {:<15} {:<12} {:<12}",
                    "FROM", "TO", "CLASS", "YEAR", "STATUS"
                );
                println!("{}", "-".repeat(66));
                for info in versions {
                    println!(
                        "{:<12} {:<12} {:<15} {:<12} {:<12}",
                        info.enrollment.valid_from.format("%Y-%m-%d"),
                        info.enrollment
                            .valid_to
                            .map(|d| d.format("%Y-%m-%d").to_string())
                            .unwrap_or_else(|| "current".to_string()),
                        truncate(&info.class_name, 15),
                        info.year_name,
                        info.enrollment.status
                    );
                }
            }
        }

        StudentCommands::Archive {
            admission_number,
            date,
        } => {
            let at = effective_time(date)?;
            service.archive_student(&admission_number, at).await?;
            println!("Archived student: {}", admission_number);
        }

        StudentCommands::Restore {
            admission_number,
            date,
        } => {
            let at = effective_time(date)?;
            service.restore_student(&admission_number, at).await?;
            println!("Restored student: {}", admission_number);
        }

        StudentCommands::Delete { admission_number } => {
            let deleted = service.delete_student(&admission_number).await?;
            println!(
                "Deleted student {} ({} enrollment versions, {} fee records, {} payments, {} history rows)",
                admission_number,
                deleted.enrollments,
                deleted.fee_records,
                deleted.payments,
                deleted.history
            );
        }
    }
    Ok(())
}

async fn run_fee_command(service: &SchoolService, cmd: FeeCommands, currency: &str) -> Result<()> {
    match cmd {
        FeeCommands::Assign {
            admission_number,
            fee_type,
            amount,
            due,
            year,
        } => {
            let amount = parse_amount(&amount)?;
            let due = parse_date(&due).context("Invalid due date")?;
            let fee = service
                .assign_fee(&admission_number, year.as_deref(), &fee_type, amount, due)
                .await?;
            println!(
                "Assigned {} fee of {} {} to {} ({})",
                fee.fee_type,
                format_cents(fee.actual_amount),
                currency,
                admission_number,
                fee.id
            );
        }

        FeeCommands::Discount {
            fee_id,
            amount,
            reason,
        } => {
            let fee = service
                .apply_discount(parse_id(&fee_id)?, parse_amount(&amount)?, reason)
                .await?;
            println!(
                "Discount applied. Outstanding: {} {} ({})",
                format_cents(fee.outstanding()),
                currency,
                fee.status
            );
        }

        FeeCommands::Pay {
            fee_id,
            amount,
            method,
            date,
            notes,
        } => {
            let method = PaymentMethod::from_str(&method).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid payment method '{}'. Valid: cash, card, bank_transfer, cheque, online",
                    method
                )
            })?;
            let paid_at = effective_time(date)?;
            let payment = service
                .record_payment(
                    parse_id(&fee_id)?,
                    parse_amount(&amount)?,
                    method,
                    paid_at,
                    notes,
                )
                .await?;
            println!(
                "Payment recorded: {} {} (receipt {})",
                format_cents(payment.amount),
                currency,
                payment.receipt_number
            );
        }

        FeeCommands::Reverse {
            receipt_number,
            reason,
        } => {
            let payment = service.reverse_payment(&receipt_number, reason).await?;
            println!(
                "Reversed payment {} of {} {}",
                payment.receipt_number,
                format_cents(payment.amount),
                currency
            );
        }

        FeeCommands::Adjust {
            fee_id,
            new_amount,
            reason,
        } => {
            let fee = service
                .adjust_fee(parse_id(&fee_id)?, parse_amount(&new_amount)?, reason)
                .await?;
            println!(
                "Fee adjusted to {} {}. Outstanding: {}",
                format_cents(fee.actual_amount),
                currency,
                format_cents(fee.outstanding())
            );
        }

        FeeCommands::List {
            student,
            year,
            status,
            fee_type,
        } => {
            let status = status
                .map(|s| {
                    FeeStatus::from_str(&s).ok_or_else(|| {
                        anyhow::anyhow!("Invalid status '{}'. Valid: pending, partial, paid", s)
                    })
                })
                .transpose()?;
            let fees = service
                .list_fee_records(&FeeFilter {
                    student,
                    year,
                    status,
                    fee_type,
                })
                .await?;
            print_fee_table(&fees);
        }

        FeeCommands::Show { fee_id } => {
            let info = service.fee_record_info(parse_id(&fee_id)?).await?;
            let fee = &info.fee;

            println!("Fee record: {}", fee.id);
            println!(
                "  Student:     {} ({})",
                info.student.full_name(),
                info.student.admission_number
            );
            println!("  Type:        {}", fee.fee_type);
            println!("  Due:         {}", fee.due_date);
            println!("  Status:      {}", fee.status);
            println!("  Billed:      {:>12}", format_cents(fee.actual_amount));
            println!("  Discount:    {:>12}", format_cents(fee.discount_amount));
            println!("  Paid:        {:>12}", format_cents(fee.paid_amount));
            println!("  Outstanding: {:>12}", format_cents(fee.outstanding()));
            if let Some(reason) = &fee.discount_reason {
                println!("  Discount reason: {}", reason);
            }

            if !info.payments.is_empty() {
                println!();
                println!("  Payments:");
                for payment in &info.payments {
                    println!(
                        "    {} {:>12} {:<14} {}{}",
                        payment.paid_at.format("%Y-%m-%d"),
                        format_cents(payment.amount),
                        payment.method,
                        payment.receipt_number,
                        if payment.is_reversed() { " (reversed)" } else { "" }
                    );
                }
            }

            if !info.history.is_empty() {
                println!();
                println!("  History:");
                for entry in &info.history {
                    println!(
                        "    {} {:<17} {:>10} by {}{}",
                        entry.changed_at.format("%Y-%m-%d %H:%M"),
                        entry.change_type,
                        format_cents(entry.amount),
                        entry.changed_by,
                        entry
                            .reason
                            .as_ref()
                            .map(|r| format!(" ({})", r))
                            .unwrap_or_default()
                    );
                }
            }
        }

        FeeCommands::Overdue { year } => {
            let fees = service
                .overdue_fees(year.as_deref(), Utc::now().date_naive())
                .await?;
            print_fee_table(&fees);
        }

        FeeCommands::Statement {
            admission_number,
            year,
        } => {
            let statement = service
                .student_statement(&admission_number, year.as_deref())
                .await?;
            println!(
                "Statement for {} ({}), {}",
                statement.student.full_name(),
                statement.student.admission_number,
                statement.academic_year.name
            );
            println!();
            print_fee_table(&statement.fees);
            if !statement.payments.is_empty() {
                println!();
                println!("Payments:");
                for payment in &statement.payments {
                    println!(
                        "  {} {:>12} {}{}",
                        payment.paid_at.format("%Y-%m-%d"),
                        format_cents(payment.amount),
                        payment.receipt_number,
                        if payment.is_reversed() { " (reversed)" } else { "" }
                    );
                }
            }
            let balance = &statement.balance;
            println!();
            println!("  Charged:     {:>12}", format_cents(balance.charged));
            println!("  Discounted:  {:>12}", format_cents(balance.discounted));
            println!("  Paid:        {:>12}", format_cents(balance.paid));
            println!(
                "  Outstanding: {:>12} {}",
                format_cents(balance.outstanding),
                currency
            );
        }
    }
    Ok(())
}

fn print_fee_table(fees: &[StudentFeeRecord]) {
    if fees.is_empty() {
        println!("No fee records found.");
        return;
    }
    println!(
        "{:<36} {:<12} {:<12} {:>10} {:>10} {:<8}",
        "ID", "TYPE", "DUE", "BILLED", "OWED", "STATUS"
    );
    println!("{}", "-".repeat(94));
    for fee in fees {
        println!(
            "{:<36} {:<12} {:<12} {:>10} {:>10} {:<8}",
            fee.id,
            truncate(&fee.fee_type, 12),
            fee.due_date,
            format_cents(fee.actual_amount),
            format_cents(fee.outstanding()),
            fee.status
        );
    }
}

async fn run_ledger_command(service: &SchoolService, cmd: LedgerCommands) -> Result<()> {
    match cmd {
        LedgerCommands::List {
            student,
            year,
            limit,
        } => {
            let transactions = service
                .list_ledger(student.as_deref(), year.as_deref(), limit)
                .await?;
            if transactions.is_empty() {
                println!("No ledger transactions found.");
            } else {
                println!(
                    "{:>6} {:<12} {:<11} {:<18} {:<18} {:>10}",
                    "SEQ", "DATE", "KIND", "DEBIT", "CREDIT", "AMOUNT"
                );
                println!("{}", "-".repeat(80));
                for tx in transactions {
                    println!(
                        "{:>6} {:<12} {:<11} {:<18} {:<18} {:>10}",
                        tx.sequence,
                        tx.occurred_at.format("%Y-%m-%d"),
                        tx.kind,
                        tx.debit_account,
                        tx.credit_account,
                        format_cents(tx.amount_cents)
                    );
                }
            }
        }

        LedgerCommands::Balances { year } => {
            let entries = service.year_balances(year.as_deref()).await?;
            if entries.is_empty() {
                println!("No balances found.");
            } else {
                println!(
                    "{:<12} {:<25} {:>10} {:>10} {:>10} {:>10}",
                    "ADMISSION", "NAME", "CHARGED", "DISCOUNT", "PAID", "OWED"
                );
                println!("{}", "-".repeat(82));
                for entry in entries {
                    println!(
                        "{:<12} {:<25} {:>10} {:>10} {:>10} {:>10}",
                        entry.student.admission_number,
                        truncate(&entry.student.full_name(), 25),
                        format_cents(entry.balance.charged),
                        format_cents(entry.balance.discounted),
                        format_cents(entry.balance.paid),
                        format_cents(entry.balance.outstanding)
                    );
                }
            }
        }

        LedgerCommands::Accounts { year } => {
            let balances = service.account_balances(year.as_deref()).await?;
            let mut total = 0;
            for (account, balance) in balances {
                println!("  {:<20} {:>12}", format!("{}:", account), format_cents(balance));
                total += balance;
            }
            println!("  {}", "-".repeat(33));
            println!(
                "  {:<20} {:>12}  {}",
                "Total:",
                format_cents(total),
                if total == 0 { "OK" } else { "UNBALANCED!" }
            );
        }

        LedgerCommands::Check => {
            println!("Checking ledger integrity...\n");
            let report = service.check_integrity().await?;

            println!("Fee records:  {}", report.fee_record_count);
            println!("Transactions: {}", report.transaction_count);
            println!();

            if report.is_ok() {
                println!("Ledger is consistent with fee records.");
            } else {
                println!("Issues found:");
                for seq in &report.missing_sequences {
                    println!("  - Missing sequence number {}", seq);
                }
                for mismatch in &report.mismatches {
                    println!(
                        "  - Fee {}: stored {}/{}/{} but ledger says {}/{}/{}",
                        mismatch.fee_record_id,
                        format_cents(mismatch.stored.actual),
                        format_cents(mismatch.stored.discount),
                        format_cents(mismatch.stored.paid),
                        format_cents(mismatch.ledger.actual),
                        format_cents(mismatch.ledger.discount),
                        format_cents(mismatch.ledger.paid)
                    );
                }
                for id in &report.orphan_transactions {
                    println!("  - Transaction {} has no fee record", id);
                }
                if report.non_positive_amounts > 0 {
                    println!(
                        "  - {} transaction(s) with non-positive amounts",
                        report.non_positive_amounts
                    );
                }
                if report.account_total != 0 {
                    println!(
                        "  - Accounts do not balance: {}",
                        format_cents(report.account_total)
                    );
                }
                anyhow::bail!("Ledger integrity check failed");
            }
        }
    }
    Ok(())
}

async fn run_summary_command(
    service: &SchoolService,
    year: Option<&str>,
    format: &str,
) -> Result<()> {
    let today = Utc::now().date_naive();
    let summary = service.year_summary(year, today).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "table" => {
            println!("Fee summary (as of {})", today);
            println!();
            println!("  Billed:          {:>12}", format_cents(summary.total_actual));
            println!("  Discounts:       {:>12}", format_cents(summary.total_discount));
            println!("  Expected:        {:>12}", format_cents(summary.total_expected));
            println!("  Collected:       {:>12}", format_cents(summary.total_collected));
            println!("  Pending:         {:>12}", format_cents(summary.total_pending));
            println!("  Collection rate: {:>11.1}%", summary.collection_rate);
            println!();
            println!(
                "  Records: {} ({} pending, {} partial, {} paid), {} overdue",
                summary.record_count,
                summary.pending_count,
                summary.partial_count,
                summary.paid_count,
                summary.overdue_count
            );
            println!("  Students billed: {}", summary.student_count);
        }
        _ => anyhow::bail!("Invalid format '{}'. Valid formats: table, json", format),
    }
    Ok(())
}

async fn run_export_command(
    service: &SchoolService,
    export_type: &str,
    year: Option<&str>,
    output: Option<&str>,
) -> Result<()> {
    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "fees" => {
            let count = exporter.export_fee_records_csv(writer, year).await?;
            if output.is_some() {
                eprintln!("Exported {} fee records", count);
            }
        }
        "payments" => {
            let count = exporter.export_payments_csv(writer, year).await?;
            if output.is_some() {
                eprintln!("Exported {} payments", count);
            }
        }
        "ledger" => {
            let count = exporter.export_ledger_csv(writer, year).await?;
            if output.is_some() {
                eprintln!("Exported {} ledger transactions", count);
            }
        }
        "year" => {
            let snapshot = exporter
                .export_year_json(writer, year, Utc::now().date_naive())
                .await?;
            if output.is_some() {
                eprintln!(
                    "Exported {}: {} fee records, {} payments",
                    snapshot.academic_year.name,
                    snapshot.fee_records.len(),
                    snapshot.payments.len()
                );
            }
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: fees, payments, ledger, year",
                export_type
            );
        }
    }

    Ok(())
}

async fn run_import_command(
    service: &SchoolService,
    import_type: &str,
    input: Option<&str>,
    options: ImportOptions,
) -> Result<()> {
    let importer = Importer::new(service);

    let reader: Box<dyn Read> = match input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("Failed to open input file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdin()),
    };

    let dry_run = options.dry_run;
    let result = match import_type {
        "students" => {
            importer
                .import_students_csv(reader, options, Utc::now())
                .await?
        }
        "fees" => importer.import_fees_csv(reader, options).await?,
        _ => {
            anyhow::bail!(
                "Invalid import type '{}'. Valid types: students, fees",
                import_type
            );
        }
    };

    if dry_run {
        println!("Validation successful");
    } else {
        println!("Import complete");
    }
    println!("  Imported: {}", result.imported);
    println!("  Skipped:  {}", result.skipped);
    println!("  Errors:   {}", result.errors.len());

    if !result.errors.is_empty() {
        println!("\nErrors:");
        for error in result.errors.iter().take(10) {
            println!(
                "  Line {}: {}",
                error.line,
                error
                    .field
                    .as_ref()
                    .map(|f| format!("{}: ", f))
                    .unwrap_or_default()
                    + &error.error
            );
        }
        if result.errors.len() > 10 {
            println!("  ... and {} more errors", result.errors.len() - 10);
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn parse_amount(s: &str) -> Result<i64> {
    parse_cents(s).context("Invalid amount format. Use '1500.00' or '1500'")
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid fee record ID: {}", s))
}

fn parse_date(date_str: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").context("Date must be in YYYY-MM-DD format")
}

/// Midnight UTC of a YYYY-MM-DD date.
fn parse_timestamp(date_str: &str) -> Result<DateTime<Utc>> {
    let naive_datetime = parse_date(date_str)?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;
    Ok(naive_datetime.and_utc())
}

fn effective_time(date: Option<String>) -> Result<DateTime<Utc>> {
    match date {
        Some(s) => parse_timestamp(&s).with_context(|| format!("Invalid date '{}'", s)),
        None => Ok(Utc::now()),
    }
}
