use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type StudentId = Uuid;
pub type TeacherId = Uuid;
pub type ClassId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Active,
    /// Left the school; rows are kept for fee and enrollment history
    Archived,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(StudentStatus::Active),
            "archived" => Some(StudentStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    /// School-issued identifier, unique across active and archived students
    pub admission_number: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub guardian_name: Option<String>,
    pub guardian_phone: Option<String>,
    pub status: StudentStatus,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Student {
    pub fn new(admission_number: String, first_name: String, last_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            admission_number,
            first_name,
            last_name,
            date_of_birth: None,
            guardian_name: None,
            guardian_phone: None,
            status: StudentStatus::Active,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn with_date_of_birth(mut self, date_of_birth: NaiveDate) -> Self {
        self.date_of_birth = Some(date_of_birth);
        self
    }

    pub fn with_guardian(mut self, name: impl Into<String>, phone: Option<String>) -> Self {
        self.guardian_name = Some(name.into());
        self.guardian_phone = phone;
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_archived(&self) -> bool {
        self.status == StudentStatus::Archived
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teacher {
    pub id: TeacherId,
    pub staff_number: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Teacher {
    pub fn new(staff_number: String, first_name: String, last_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            staff_number,
            first_name,
            last_name,
            email: None,
            subject: None,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// A class (grade/form) that students enroll into, e.g. "Grade 5" section "B".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchoolClass {
    pub id: ClassId,
    pub name: String,
    pub section: Option<String>,
    pub class_teacher_id: Option<TeacherId>,
    pub capacity: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl SchoolClass {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            section: None,
            class_teacher_id: None,
            capacity: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn display_name(&self) -> String {
        match &self.section {
            Some(section) => format!("{} ({})", self.name, section),
            None => self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_student_status_roundtrip() {
        for status in [StudentStatus::Active, StudentStatus::Archived] {
            assert_eq!(StudentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(StudentStatus::from_str("ARCHIVED"), Some(StudentStatus::Archived));
        assert_eq!(StudentStatus::from_str("graduated"), None);
    }

    #[test]
    fn test_new_student_is_active() {
        let student = Student::new("ADM-001".into(), "Ada".into(), "Obi".into())
            .with_guardian("Grace Obi", Some("555-0100".into()));

        assert!(!student.is_archived());
        assert_eq!(student.full_name(), "Ada Obi");
        assert_eq!(student.guardian_phone.as_deref(), Some("555-0100"));
    }

    #[test]
    fn test_class_display_name() {
        let class = SchoolClass::new("Grade 5".into()).with_section("B");
        assert_eq!(class.display_name(), "Grade 5 (B)");
        assert_eq!(SchoolClass::new("Grade 6".into()).display_name(), "Grade 6");
    }
}
