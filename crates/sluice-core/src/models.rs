use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// Identity of one logical resource instance in the staging table.
///
/// All rows sharing a key belong to the same (connection, scope, task)
/// triple and are replaced together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub connection_id: u64,
    /// Scope parameters, e.g. `{"projectId": 37}`.
    pub params: serde_json::Value,
    /// Collecting task, e.g. `"gitlab_api_issues"`.
    pub task: String,
}

impl Partition {
    pub fn new(connection_id: u64, params: serde_json::Value, task: impl Into<String>) -> Self {
        Self {
            connection_id,
            params,
            task: task.into(),
        }
    }

    /// Deterministic 64-char hex key.
    ///
    /// `serde_json` objects serialize with sorted keys, so equal params
    /// always hash to the same key regardless of construction order.
    pub fn key(&self) -> String {
        compute_hash(&format!(
            "{}:{}:{}",
            self.connection_id, self.params, self.task
        ))
    }
}

/// A committed page of raw remote data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingRow {
    pub id: i64,
    pub partition_key: String,
    pub run_id: Uuid,
    /// Scope parameters of the partition (provenance for extractors).
    pub params: serde_json::Value,
    /// Echo of the request that produced this page, for replay.
    pub input: serde_json::Value,
    /// Raw page payload. Opaque to the engine.
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl StagingRow {
    /// Decode the payload as JSON.
    pub fn payload(&self) -> Result<serde_json::Value, AppError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// DTO for writing one page into the staging table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewStagingRow {
    pub partition_key: String,
    pub run_id: Uuid,
    /// Hash of the request echo; the upsert key within a run.
    pub request_key: String,
    pub params: serde_json::Value,
    pub input: serde_json::Value,
    pub data: Vec<u8>,
}

/// Publishes a finished collection run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCommit {
    pub partition_key: String,
    pub run_id: Uuid,
    /// Drop every row of the partition not written by this run.
    pub replace: bool,
    /// New watermark cursor to store alongside the commit.
    pub cursor: Option<DateTime<Utc>>,
    pub time_after: Option<DateTime<Utc>>,
}

/// Per-partition collector bookkeeping from the previous successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorState {
    pub partition_key: String,
    /// Latest watermark seen by a committed run.
    pub cursor: Option<DateTime<Utc>>,
    /// Lower time bound the last run was configured with.
    pub time_after: Option<DateTime<Utc>>,
    pub latest_run_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// User-facing synchronisation policy of a blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Ignore anything older than this.
    #[serde(default)]
    pub time_after: Option<DateTime<Utc>>,
    /// Force a full re-collection.
    #[serde(default)]
    pub full_sync: bool,
}

/// Whether a run collects incrementally and from which watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDecision {
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
}

impl SyncDecision {
    /// Resolve the mode of the next run.
    ///
    /// - incremental collection disabled or no stored cursor: full run from `time_after`
    /// - `full_sync` requested: full run from `time_after`
    /// - `time_after` moved earlier than the stored one: full run from `time_after`
    /// - otherwise: incremental from the stored cursor
    pub fn resolve(
        incremental: bool,
        policy: Option<&SyncPolicy>,
        state: Option<&CollectorState>,
    ) -> Self {
        let time_after = policy.and_then(|p| p.time_after);
        let full = Self {
            incremental: false,
            since: time_after,
        };

        if !incremental {
            return full;
        }
        let Some(cursor) = state.and_then(|s| s.cursor) else {
            return full;
        };
        if policy.is_some_and(|p| p.full_sync) {
            return full;
        }
        if let (Some(requested), Some(previous)) = (time_after, state.and_then(|s| s.time_after))
            && requested < previous
        {
            return full;
        }

        Self {
            incremental: true,
            since: Some(cursor),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn state(cursor: Option<DateTime<Utc>>, time_after: Option<DateTime<Utc>>) -> CollectorState {
        CollectorState {
            partition_key: "k".into(),
            cursor,
            time_after,
            latest_run_id: None,
            updated_at: Utc::now(),
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_partition_key_ignores_field_order() {
        let a = Partition::new(
            1,
            serde_json::json!({"projectId": 37, "group": "infra"}),
            "issues",
        );
        let b = Partition::new(
            1,
            serde_json::json!({"group": "infra", "projectId": 37}),
            "issues",
        );
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_partition_key_distinguishes_task_and_connection() {
        let params = serde_json::json!({"projectId": 37});
        let base = Partition::new(1, params.clone(), "issues").key();
        assert_ne!(base, Partition::new(2, params.clone(), "issues").key());
        assert_ne!(base, Partition::new(1, params, "merge_requests").key());
    }

    #[test]
    fn test_sync_decision_without_state_is_full() {
        let d = SyncDecision::resolve(true, None, None);
        assert!(!d.incremental);
        assert_eq!(d.since, None);
    }

    #[test]
    fn test_sync_decision_incremental_from_cursor() {
        let s = state(Some(at(10)), None);
        let d = SyncDecision::resolve(true, None, Some(&s));
        assert!(d.incremental);
        assert_eq!(d.since, Some(at(10)));
    }

    #[test]
    fn test_sync_decision_disabled_incremental_ignores_cursor() {
        let s = state(Some(at(10)), None);
        let d = SyncDecision::resolve(false, None, Some(&s));
        assert!(!d.incremental);
    }

    #[test]
    fn test_sync_decision_full_sync_uses_time_after() {
        let s = state(Some(at(10)), None);
        let policy = SyncPolicy {
            time_after: Some(at(1)),
            full_sync: true,
        };
        let d = SyncDecision::resolve(true, Some(&policy), Some(&s));
        assert!(!d.incremental);
        assert_eq!(d.since, Some(at(1)));
    }

    #[test]
    fn test_sync_decision_earlier_time_after_forces_full() {
        let s = state(Some(at(10)), Some(at(5)));
        let policy = SyncPolicy {
            time_after: Some(at(2)),
            full_sync: false,
        };
        let d = SyncDecision::resolve(true, Some(&policy), Some(&s));
        assert!(!d.incremental);
        assert_eq!(d.since, Some(at(2)));

        let later = SyncPolicy {
            time_after: Some(at(6)),
            full_sync: false,
        };
        let d = SyncDecision::resolve(true, Some(&later), Some(&s));
        assert!(d.incremental);
        assert_eq!(d.since, Some(at(10)));
    }
}
