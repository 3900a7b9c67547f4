// pgvault/src/retention/policy.rs
//! Keep rules. Each rule is a pure function over artifacts sorted newest
//! first; the keep-set is the union of the active rules.

use chrono::{DateTime, Datelike, Months, TimeDelta, Utc};
use std::collections::HashSet;
use std::hash::Hash;

/// Multi-horizon retention policy. A count that is absent, zero or negative
/// disables its rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<i64>,
    pub keep_daily: Option<i64>,
    pub keep_weekly: Option<i64>,
    pub keep_monthly: Option<i64>,
}

fn active(count: Option<i64>) -> Option<u32> {
    count
        .filter(|n| *n > 0)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

impl RetentionPolicy {
    pub fn has_active_rule(&self) -> bool {
        active(self.keep_last).is_some()
            || active(self.keep_daily).is_some()
            || active(self.keep_weekly).is_some()
            || active(self.keep_monthly).is_some()
    }
}

/// A listed backup with its derived timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

pub fn keep_last(sorted: &[BackupArtifact], count: u32) -> HashSet<String> {
    sorted
        .iter()
        .take(count as usize)
        .map(|a| a.key.clone())
        .collect()
}

// Keeps the first artifact seen per bucket at or after `cutoff`. With the
// newest-first ordering that is the newest member of each bucket.
fn keep_first_per_bucket<K, F>(
    sorted: &[BackupArtifact],
    cutoff: DateTime<Utc>,
    bucket_of: F,
) -> HashSet<String>
where
    K: Eq + Hash,
    F: Fn(&DateTime<Utc>) -> K,
{
    let mut seen = HashSet::new();
    let mut kept = HashSet::new();
    for artifact in sorted {
        if artifact.timestamp < cutoff {
            continue;
        }
        if seen.insert(bucket_of(&artifact.timestamp)) {
            kept.insert(artifact.key.clone());
        }
    }
    kept
}

// `now - days`, saturating at the earliest representable instant.
fn days_before(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    TimeDelta::try_days(days)
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn keep_daily(sorted: &[BackupArtifact], days: u32, now: DateTime<Utc>) -> HashSet<String> {
    let cutoff = days_before(now, i64::from(days));
    keep_first_per_bucket(sorted, cutoff, |ts| ts.date_naive())
}

/// ISO calendar weeks, not a rolling seven-day window.
pub fn keep_weekly(sorted: &[BackupArtifact], weeks: u32, now: DateTime<Utc>) -> HashSet<String> {
    let cutoff = days_before(now, 7 * i64::from(weeks));
    keep_first_per_bucket(sorted, cutoff, |ts| {
        let week = ts.iso_week();
        (week.year(), week.week())
    })
}

pub fn keep_monthly(sorted: &[BackupArtifact], months: u32, now: DateTime<Utc>) -> HashSet<String> {
    let cutoff = now
        .checked_sub_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    keep_first_per_bucket(sorted, cutoff, |ts| (ts.year(), ts.month()))
}

/// Union of every active rule. An inactive policy keeps nothing.
pub fn compute_keep_set(
    sorted: &[BackupArtifact],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> HashSet<String> {
    let mut keep = HashSet::new();
    if let Some(n) = active(policy.keep_last) {
        keep.extend(keep_last(sorted, n));
    }
    if let Some(n) = active(policy.keep_daily) {
        keep.extend(keep_daily(sorted, n, now));
    }
    if let Some(n) = active(policy.keep_weekly) {
        keep.extend(keep_weekly(sorted, n, now));
    }
    if let Some(n) = active(policy.keep_monthly) {
        keep.extend(keep_monthly(sorted, n, now));
    }
    keep
}
