//! Year-scoped query cache.
//!
//! Query results are stored as JSON under a [`CacheKey`] that names the
//! bucket ([`CacheKind`]) and the academic year they were computed for. A
//! write to the database is described by a [`MutationEvent`], which knows
//! which buckets it makes stale.

use std::time::Duration;

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::CacheConfig;
use crate::domain::AcademicYearId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    FeeRecords,
    Payments,
    YearSummary,
    StudentBalances,
    FeeHistory,
    Enrollments,
}

impl CacheKind {
    pub const ALL: [CacheKind; 6] = [
        CacheKind::FeeRecords,
        CacheKind::Payments,
        CacheKind::YearSummary,
        CacheKind::StudentBalances,
        CacheKind::FeeHistory,
        CacheKind::Enrollments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::FeeRecords => "fee_records",
            CacheKind::Payments => "payments",
            CacheKind::YearSummary => "year_summary",
            CacheKind::StudentBalances => "student_balances",
            CacheKind::FeeHistory => "fee_history",
            CacheKind::Enrollments => "enrollments",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    /// `None` for results that span every year
    pub year: Option<AcademicYearId>,
    /// Distinguishes entries within a bucket, e.g. a student or fee record id
    pub scope: String,
}

impl CacheKey {
    pub fn new(kind: CacheKind, year: Option<AcademicYearId>, scope: impl Into<String>) -> Self {
        Self {
            kind,
            year,
            scope: scope.into(),
        }
    }

    pub fn for_year(kind: CacheKind, year: AcademicYearId) -> Self {
        Self::new(kind, Some(year), "")
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.year {
            Some(year) => write!(f, "{}:{}:{}", self.kind, year, self.scope),
            None => write!(f, "{}:*:{}", self.kind, self.scope),
        }
    }
}

/// A write that makes cached results stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    FeeAssigned { year: AcademicYearId },
    DiscountApplied { year: AcademicYearId },
    FeeAdjusted { year: AcademicYearId },
    PaymentRecorded { year: AcademicYearId },
    PaymentReversed { year: AcademicYearId },
    EnrollmentChanged { year: Option<AcademicYearId> },
    StudentArchived,
    StudentsImported,
    StudentDeleted,
}

impl MutationEvent {
    pub fn year(&self) -> Option<AcademicYearId> {
        match self {
            MutationEvent::FeeAssigned { year }
            | MutationEvent::DiscountApplied { year }
            | MutationEvent::FeeAdjusted { year }
            | MutationEvent::PaymentRecorded { year }
            | MutationEvent::PaymentReversed { year } => Some(*year),
            MutationEvent::EnrollmentChanged { year } => *year,
            MutationEvent::StudentArchived
            | MutationEvent::StudentsImported
            | MutationEvent::StudentDeleted => None,
        }
    }

    /// Buckets this mutation invalidates.
    pub fn kinds(&self) -> &'static [CacheKind] {
        match self {
            MutationEvent::FeeAssigned { .. }
            | MutationEvent::DiscountApplied { .. }
            | MutationEvent::FeeAdjusted { .. } => &[
                CacheKind::FeeRecords,
                CacheKind::YearSummary,
                CacheKind::StudentBalances,
                CacheKind::FeeHistory,
            ],
            MutationEvent::PaymentRecorded { .. } | MutationEvent::PaymentReversed { .. } => &[
                CacheKind::FeeRecords,
                CacheKind::Payments,
                CacheKind::YearSummary,
                CacheKind::StudentBalances,
                CacheKind::FeeHistory,
            ],
            MutationEvent::EnrollmentChanged { .. }
            | MutationEvent::StudentArchived
            | MutationEvent::StudentsImported => &[CacheKind::Enrollments],
            MutationEvent::StudentDeleted => &CacheKind::ALL,
        }
    }

    /// True when an entry under `key` is stale after this mutation.
    pub fn affects(&self, key: &CacheKey) -> bool {
        if !self.kinds().contains(&key.kind) {
            return false;
        }
        match (self.year(), key.year) {
            (Some(event_year), Some(key_year)) => event_year == key_year,
            _ => true,
        }
    }
}

/// Concurrent cache of serialized query results.
#[derive(Clone)]
pub struct YearCache {
    inner: Cache<CacheKey, String>,
}

impl YearCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        debug!(max_capacity, ttl_secs = ttl.as_secs(), "year cache initialized");
        Self { inner }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_capacity, Duration::from_secs(config.ttl_secs))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = self.inner.get(key).await;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!(key = %key, "cache hit");
                    Some(value)
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "discarding undecodable cache entry");
                    self.inner.invalidate(key).await;
                    None
                }
            },
            None => {
                debug!(key = %key, "cache miss");
                None
            }
        }
    }

    pub async fn insert<T: Serialize>(&self, key: CacheKey, value: &T) {
        // A value that cannot be serialized is simply not cached
        match serde_json::to_string(value) {
            Ok(raw) => self.inner.insert(key, raw).await,
            Err(e) => debug!(key = %key, error = %e, "skipping cache insert"),
        }
    }

    /// Drop every entry the mutation makes stale. Returns how many were removed.
    pub async fn invalidate(&self, event: MutationEvent) -> usize {
        let stale: Vec<CacheKey> = self
            .inner
            .iter()
            .filter(|(key, _)| event.affects(key))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &stale {
            self.inner.invalidate(key).await;
        }
        debug!(?event, removed = stale.len(), "cache invalidated");
        stale.len()
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.inner.get(key).await.is_some()
    }
}
