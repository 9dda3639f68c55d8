//! Error occurrence tracking by fingerprint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::classifier::{classify_error, fingerprint, ErrorClassification};
use crate::error::Error;

/// Repeat count after which a fingerprint stops being retried.
pub const DEFAULT_MAX_OCCURRENCES: u32 = 20;

const MAX_TRACKED: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub fingerprint: String,
    pub classification: ErrorClassification,
    pub message: String,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Retry decision for a record at a zero-based attempt number.
pub fn should_retry(record: &ErrorRecord, attempt: u32, max_occurrences: u32) -> bool {
    record.classification.is_retryable
        && attempt < record.classification.max_retries
        && record.occurrences < max_occurrences
}

#[derive(Debug)]
pub struct ErrorTracker {
    records: Mutex<HashMap<String, ErrorRecord>>,
    max_occurrences: u32,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::with_max_occurrences(DEFAULT_MAX_OCCURRENCES)
    }

    pub fn with_max_occurrences(max_occurrences: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_occurrences,
        }
    }

    /// Classify and count an error occurrence.
    pub fn record(&self, error: &Error) -> ErrorRecord {
        let classification = classify_error(error);
        let key = fingerprint(error, classification.category);
        let now = Utc::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if records.len() >= MAX_TRACKED && !records.contains_key(&key) {
            // Drop the stalest entry
            if let Some(oldest) = records
                .values()
                .min_by_key(|r| r.last_seen)
                .map(|r| r.fingerprint.clone())
            {
                records.remove(&oldest);
            }
        }

        let record = records.entry(key.clone()).or_insert_with(|| ErrorRecord {
            fingerprint: key,
            classification: classification.clone(),
            message: error.to_string(),
            occurrences: 0,
            first_seen: now,
            last_seen: now,
        });
        record.occurrences = record.occurrences.saturating_add(1);
        record.last_seen = now;
        record.message = error.to_string();
        record.classification = classification;
        record.clone()
    }

    pub fn should_retry(&self, record: &ErrorRecord, attempt: u32) -> bool {
        should_retry(record, attempt, self.max_occurrences)
    }

    pub fn get(&self, fingerprint: &str) -> Option<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    /// Records ordered by occurrence count, most frequent first.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ErrorRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        out
    }

    pub fn reset(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occurrences_accumulate_per_fingerprint() {
        let tracker = ErrorTracker::new();
        tracker.record(&Error::Node("connection refused (attempt 1)".into()));
        let second = tracker.record(&Error::Node("connection refused (attempt 2)".into()));
        let other = tracker.record(&Error::Node("request timed out".into()));

        assert_eq!(second.occurrences, 2);
        assert_eq!(other.occurrences, 1);
        assert_eq!(tracker.snapshot().len(), 2);
        assert_eq!(tracker.snapshot()[0].fingerprint, second.fingerprint);
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let tracker = ErrorTracker::new();
        let record = tracker.record(&Error::Node("connection reset".into()));
        assert!(tracker.should_retry(&record, 0));
        assert!(tracker.should_retry(&record, 2));
        assert!(!tracker.should_retry(&record, 3));

        let validation = tracker.record(&Error::Validation("bad input".into()));
        assert!(!tracker.should_retry(&validation, 0));
    }

    #[test]
    fn test_repeated_fingerprint_stops_retrying() {
        let tracker = ErrorTracker::with_max_occurrences(3);
        let mut record = tracker.record(&Error::Node("socket closed".into()));
        assert!(tracker.should_retry(&record, 0));
        for _ in 0..2 {
            record = tracker.record(&Error::Node("socket closed".into()));
        }
        assert_eq!(record.occurrences, 3);
        assert!(!tracker.should_retry(&record, 0));

        tracker.reset();
        assert!(tracker.snapshot().is_empty());
    }
}
