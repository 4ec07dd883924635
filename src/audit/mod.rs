//! Run fingerprints and the run log
//!
//! Every run is fingerprinted from its inputs and kept in memory so the API
//! can return it again and check it was not altered.

use crate::agent::RunReport;
use crate::models::InvestmentProfile;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Runs kept when no capacity is configured.
pub const DEFAULT_RUN_LOG_CAPACITY: usize = 256;

#[derive(Default)]
struct Records {
    by_id: HashMap<Uuid, RunReport>,
    /// Insertion order, oldest first.
    order: VecDeque<Uuid>,
}

/// Completed runs by run id, bounded. The oldest run is evicted first.
#[derive(Clone)]
pub struct RunLog {
    records: Arc<RwLock<Records>>,
    capacity: usize,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RUN_LOG_CAPACITY)
    }
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(Records::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.by_id.len()
    }

    pub async fn record(&self, report: RunReport) -> Uuid {
        let run_id = report.run_id;
        let mut records = self.records.write().await;

        if records.by_id.insert(run_id, report).is_none() {
            records.order.push_back(run_id);
        }

        while records.order.len() > self.capacity {
            if let Some(oldest) = records.order.pop_front() {
                records.by_id.remove(&oldest);
                debug!(run_id = %oldest, "Run evicted from log");
            }
        }

        run_id
    }

    pub async fn get(&self, run_id: Uuid) -> Option<RunReport> {
        self.records.read().await.by_id.get(&run_id).cloned()
    }

    /// Most recent runs first.
    pub async fn recent(&self, limit: usize) -> Vec<RunReport> {
        let records = self.records.read().await;
        let mut items: Vec<&RunReport> = records.by_id.values().collect();
        items.sort_by(|a, b| b.analysis_time.cmp(&a.analysis_time));
        items.into_iter().take(limit).cloned().collect()
    }

    /// Recompute the fingerprint of a stored run and compare.
    pub async fn verify_integrity(&self, run_id: Uuid) -> bool {
        match self.records.read().await.by_id.get(&run_id) {
            Some(report) => {
                compute_context_hash(&report.question, &report.profile, &report.analysis_time)
                    == report.context_hash
            }
            None => false,
        }
    }
}

#[derive(Serialize)]
struct ContextFingerprint<'a> {
    question: &'a str,
    profile: &'a InvestmentProfile,
    analysis_time: &'a DateTime<Utc>,
}

/// SHA256 over the inputs of a run.
/// Streams the JSON straight into the hasher.
pub fn compute_context_hash(
    question: &str,
    profile: &InvestmentProfile,
    analysis_time: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    let fingerprint = ContextFingerprint {
        question,
        profile,
        analysis_time,
    };

    if serde_json::to_writer(&mut HashWriter(&mut hasher), &fingerprint).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskTolerance;

    #[test]
    fn hash_changes_with_any_input() {
        let now = Utc::now();
        let profile = InvestmentProfile::default();
        let base = compute_context_hash("Should I buy AAPL?", &profile, &now);

        assert_eq!(base.len(), 64);
        assert_eq!(base, compute_context_hash("Should I buy AAPL?", &profile, &now));
        assert_ne!(base, compute_context_hash("Should I buy MSFT?", &profile, &now));

        let aggressive = InvestmentProfile {
            risk_tolerance: RiskTolerance::Aggressive,
            ..profile
        };
        assert_ne!(base, compute_context_hash("Should I buy AAPL?", &aggressive, &now));
    }

    #[tokio::test]
    async fn tampered_report_fails_verification() {
        let log = RunLog::new();
        let mut report = RunReport::for_test("What is AAPL's P/E ratio?");
        let run_id = log.record(report.clone()).await;

        assert!(log.verify_integrity(run_id).await);
        assert_eq!(log.recent(10).await.len(), 1);

        report.question = "What is MSFT's P/E ratio?".to_string();
        log.record(report).await;
        assert!(!log.verify_integrity(run_id).await);
        assert!(!log.verify_integrity(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn oldest_run_is_evicted_past_capacity() {
        let log = RunLog::with_capacity(2);
        let first = log.record(RunReport::for_test("first")).await;
        let second = log.record(RunReport::for_test("second")).await;

        // Re-recording an existing run does not take a new slot.
        log.record(log.get(first).await.unwrap()).await;
        assert_eq!(log.len().await, 2);

        let third = log.record(RunReport::for_test("third")).await;

        assert_eq!(log.len().await, 2);
        assert!(log.get(first).await.is_none());
        assert!(log.get(second).await.is_some());
        assert!(log.get(third).await.is_some());
        assert!(!log.verify_integrity(first).await);
    }
}
