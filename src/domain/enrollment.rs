//! Enrollment history kept as slowly-changing-dimension (type 2) versions.
//!
//! Each row states which class a student belonged to, for which academic
//! year, over the half-open interval `[valid_from, valid_to)`. A change never
//! rewrites a row: the open version gets its `valid_to` set and a new open
//! version starts at the same instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AcademicYearId, ClassId, StudentId};

pub type EnrollmentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Promoted,
    Transferred,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Promoted => "promoted",
            EnrollmentStatus::Transferred => "transferred",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "enrolled" => Some(EnrollmentStatus::Enrolled),
            "promoted" => Some(EnrollmentStatus::Promoted),
            "transferred" => Some(EnrollmentStatus::Transferred),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub student_id: StudentId,
    pub class_id: ClassId,
    pub academic_year_id: AcademicYearId,
    pub status: EnrollmentStatus,
    pub valid_from: DateTime<Utc>,
    /// `None` while this is the student's current placement
    pub valid_to: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn open(student_id: StudentId, change: &EnrollmentChange, valid_from: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            class_id: change.class_id,
            academic_year_id: change.academic_year_id,
            status: change.status,
            valid_from,
            valid_to: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// True when `at` falls inside `[valid_from, valid_to)`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        at >= self.valid_from && self.valid_to.is_none_or(|end| at < end)
    }

    fn matches(&self, change: &EnrollmentChange) -> bool {
        self.class_id == change.class_id
            && self.academic_year_id == change.academic_year_id
            && self.status == change.status
    }
}

/// The attributes a new version should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentChange {
    pub class_id: ClassId,
    pub academic_year_id: AcademicYearId,
    pub status: EnrollmentStatus,
}

/// What to write for a change: close `closing` at `closed_at`, then insert `opening`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentTransition {
    pub closing: Option<EnrollmentId>,
    pub closed_at: DateTime<Utc>,
    pub opening: Enrollment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    /// Changes must come strictly after the start of the current version
    ChangeBeforeCurrent {
        current_from: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
    /// The requested attributes equal the current version
    Unchanged,
    NotEnrolled,
    InvalidInterval(EnrollmentId),
    Overlap(EnrollmentId, EnrollmentId),
    MultipleOpen,
}

impl std::fmt::Display for EnrollmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentError::ChangeBeforeCurrent {
                current_from,
                requested,
            } => write!(
                f,
                "Change at {} must be after the current enrollment start {}",
                requested.format("%Y-%m-%d %H:%M:%S"),
                current_from.format("%Y-%m-%d %H:%M:%S")
            ),
            EnrollmentError::Unchanged => write!(f, "Student is already enrolled that way"),
            EnrollmentError::NotEnrolled => write!(f, "Student has no current enrollment"),
            EnrollmentError::InvalidInterval(id) => {
                write!(f, "Enrollment {} ends before it starts", id)
            }
            EnrollmentError::Overlap(a, b) => {
                write!(f, "Enrollments {} and {} overlap", a, b)
            }
            EnrollmentError::MultipleOpen => {
                write!(f, "More than one enrollment is open")
            }
        }
    }
}

impl std::error::Error for EnrollmentError {}

/// All versions for one student, ordered by `valid_from`.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentHistory {
    student_id: StudentId,
    versions: Vec<Enrollment>,
}

impl EnrollmentHistory {
    pub fn new(student_id: StudentId, mut versions: Vec<Enrollment>) -> Self {
        versions.sort_by_key(|v| v.valid_from);
        Self {
            student_id,
            versions,
        }
    }

    pub fn versions(&self) -> &[Enrollment] {
        &self.versions
    }

    pub fn into_versions(self) -> Vec<Enrollment> {
        self.versions
    }

    pub fn current(&self) -> Option<&Enrollment> {
        self.versions.iter().find(|v| v.is_current())
    }

    /// The most recent version, open or closed.
    pub fn latest(&self) -> Option<&Enrollment> {
        self.versions.last()
    }

    pub fn as_of(&self, at: DateTime<Utc>) -> Option<&Enrollment> {
        self.versions.iter().find(|v| v.covers(at))
    }

    /// Plan a change effective at `at`. A student with no open version is
    /// simply enrolled.
    pub fn plan_change(
        &self,
        change: EnrollmentChange,
        at: DateTime<Utc>,
    ) -> Result<EnrollmentTransition, EnrollmentError> {
        let closing = match self.current() {
            Some(current) => {
                if current.matches(&change) {
                    return Err(EnrollmentError::Unchanged);
                }
                if at <= current.valid_from {
                    return Err(EnrollmentError::ChangeBeforeCurrent {
                        current_from: current.valid_from,
                        requested: at,
                    });
                }
                Some(current.id)
            }
            None => {
                // Reopening must not reach back into closed history
                if let Some(end) = self.versions.iter().filter_map(|v| v.valid_to).max() {
                    if at < end {
                        return Err(EnrollmentError::ChangeBeforeCurrent {
                            current_from: end,
                            requested: at,
                        });
                    }
                }
                None
            }
        };

        Ok(EnrollmentTransition {
            closing,
            closed_at: at,
            opening: Enrollment::open(self.student_id, &change, at),
        })
    }

    /// Close the open version without opening another (archiving).
    pub fn plan_close(&self, at: DateTime<Utc>) -> Result<(EnrollmentId, DateTime<Utc>), EnrollmentError> {
        let current = self.current().ok_or(EnrollmentError::NotEnrolled)?;
        if at <= current.valid_from {
            return Err(EnrollmentError::ChangeBeforeCurrent {
                current_from: current.valid_from,
                requested: at,
            });
        }
        Ok((current.id, at))
    }

    /// Apply a planned transition in memory.
    pub fn apply(&mut self, transition: EnrollmentTransition) {
        if let Some(closing) = transition.closing {
            if let Some(version) = self.versions.iter_mut().find(|v| v.id == closing) {
                version.valid_to = Some(transition.closed_at);
            }
        }
        self.versions.push(transition.opening);
    }

    /// Check the temporal invariants over the whole history.
    pub fn validate(&self) -> Result<(), EnrollmentError> {
        if self.versions.iter().filter(|v| v.is_current()).count() > 1 {
            return Err(EnrollmentError::MultipleOpen);
        }
        for version in &self.versions {
            if let Some(end) = version.valid_to {
                if end <= version.valid_from {
                    return Err(EnrollmentError::InvalidInterval(version.id));
                }
            }
        }
        for pair in self.versions.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            match earlier.valid_to {
                Some(end) if end <= later.valid_from => {}
                _ => return Err(EnrollmentError::Overlap(earlier.id, later.id)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, 8, 0, 0).unwrap()
    }

    fn change(class_id: ClassId, year: AcademicYearId) -> EnrollmentChange {
        EnrollmentChange {
            class_id,
            academic_year_id: year,
            status: EnrollmentStatus::Enrolled,
        }
    }

    #[test]
    fn test_first_enrollment_opens_a_version() {
        let history = EnrollmentHistory::new(Uuid::new_v4(), vec![]);
        let transition = history
            .plan_change(change(Uuid::new_v4(), Uuid::new_v4()), at(1))
            .unwrap();

        assert!(transition.closing.is_none());
        assert!(transition.opening.is_current());
        assert_eq!(transition.opening.valid_from, at(1));
    }

    #[test]
    fn test_transfer_closes_without_overwriting() {
        let year = Uuid::new_v4();
        let grade_5a = Uuid::new_v4();
        let grade_5b = Uuid::new_v4();
        let mut history = EnrollmentHistory::new(Uuid::new_v4(), vec![]);

        let first = history.plan_change(change(grade_5a, year), at(1)).unwrap();
        history.apply(first);
        let original = history.current().cloned().unwrap();

        let second = history
            .plan_change(
                EnrollmentChange {
                    class_id: grade_5b,
                    academic_year_id: year,
                    status: EnrollmentStatus::Transferred,
                },
                at(15),
            )
            .unwrap();
        assert_eq!(second.closing, Some(original.id));
        history.apply(second);

        let versions = history.versions();
        assert_eq!(versions.len(), 2);
        // Old version keeps its class and start, only gains an end
        assert_eq!(versions[0].class_id, grade_5a);
        assert_eq!(versions[0].valid_from, original.valid_from);
        assert_eq!(versions[0].valid_to, Some(at(15)));
        assert_eq!(history.current().unwrap().class_id, grade_5b);
        assert!(history.validate().is_ok());
    }

    #[test]
    fn test_as_of_returns_historic_placement() {
        let year = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut history = EnrollmentHistory::new(Uuid::new_v4(), vec![]);
        history.apply(history.plan_change(change(a, year), at(1)).unwrap());
        history.apply(history.plan_change(change(b, year), at(10)).unwrap());

        assert_eq!(history.as_of(at(5)).unwrap().class_id, a);
        // Boundary belongs to the new version
        assert_eq!(history.as_of(at(10)).unwrap().class_id, b);
        assert_eq!(history.as_of(at(30)).unwrap().class_id, b);
        assert!(history.as_of(at(1) - Duration::days(1)).is_none());
    }

    #[test]
    fn test_rejects_backdated_and_noop_changes() {
        let year = Uuid::new_v4();
        let class = Uuid::new_v4();
        let mut history = EnrollmentHistory::new(Uuid::new_v4(), vec![]);
        history.apply(history.plan_change(change(class, year), at(10)).unwrap());

        assert_eq!(
            history.plan_change(change(class, year), at(20)),
            Err(EnrollmentError::Unchanged)
        );
        assert!(matches!(
            history.plan_change(change(Uuid::new_v4(), year), at(10)),
            Err(EnrollmentError::ChangeBeforeCurrent { .. })
        ));
    }

    #[test]
    fn test_close_then_reenroll() {
        let year = Uuid::new_v4();
        let class = Uuid::new_v4();
        let mut history = EnrollmentHistory::new(Uuid::new_v4(), vec![]);
        history.apply(history.plan_change(change(class, year), at(1)).unwrap());

        let (closing, closed_at) = history.plan_close(at(5)).unwrap();
        history.versions.iter_mut().find(|v| v.id == closing).unwrap().valid_to = Some(closed_at);
        assert!(history.current().is_none());
        assert_eq!(history.plan_close(at(6)), Err(EnrollmentError::NotEnrolled));

        // Re-enrolling cannot start inside the closed interval
        assert!(history.plan_change(change(class, year), at(3)).is_err());
        let reopen = history.plan_change(change(class, year), at(8)).unwrap();
        history.apply(reopen);
        assert!(history.validate().is_ok());
        assert!(history.as_of(at(6)).is_none());
    }

    #[test]
    fn test_validate_detects_overlap_and_multiple_open() {
        let student = Uuid::new_v4();
        let c = change(Uuid::new_v4(), Uuid::new_v4());
        let mut a = Enrollment::open(student, &c, at(1));
        a.valid_to = Some(at(10));
        let b = Enrollment::open(student, &c, at(5));
        let history = EnrollmentHistory::new(student, vec![a.clone(), b.clone()]);
        assert_eq!(history.validate(), Err(EnrollmentError::Overlap(a.id, b.id)));

        let open_a = Enrollment::open(student, &c, at(1));
        let history = EnrollmentHistory::new(student, vec![open_a, b]);
        assert_eq!(history.validate(), Err(EnrollmentError::MultipleOpen));
    }
}
