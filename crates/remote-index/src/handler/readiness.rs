//! Readiness check: compares message version metadata with the primary store.
//!
//! A message is applied only when the primary store's current version of the
//! logical resource is exactly the version the message describes: same
//! version id, same parameter hash and same last-updated instant. Redelivered
//! messages are therefore safe to reprocess without tracking message ids.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::database::parse_timestamp;
use crate::database::schema::{is_valid_resource_type, logical_resources_table};
use crate::error::{IndexResult, MessageError};
use crate::message::IndexMessage;

/// Logical resource ids per snapshot query.
const MAX_IDS_PER_STATEMENT: usize = 256;

/// Current state of a logical resource in the primary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalResourceSnapshot {
    pub logical_resource_id: i64,
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    pub parameter_hash: String,
}

/// Why a message will never be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The primary store already holds a later version.
    Superseded { current_version: i32 },
    /// Same version but different hash or timestamp: the message was produced
    /// by a transaction that rolled back, and the version id was reused.
    Uncommitted,
    /// A later version of the same resource arrived in the same batch.
    Duplicate,
}

/// Classification of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Matches the primary store; apply it.
    Ready,
    /// The primary store has not caught up yet; retry later.
    Waiting,
    /// Never apply and never retry.
    Stale(StaleReason),
}

/// Classifies a message against the snapshot of its logical resource.
pub fn classify(message: &IndexMessage, snapshot: Option<&LogicalResourceSnapshot>) -> Readiness {
    let Some(snapshot) = snapshot else {
        return Readiness::Waiting;
    };

    if snapshot.version_id < message.version_id {
        Readiness::Waiting
    } else if snapshot.version_id > message.version_id {
        Readiness::Stale(StaleReason::Superseded {
            current_version: snapshot.version_id,
        })
    } else if snapshot.parameter_hash == message.parameter_hash
        && snapshot.last_updated == message.last_updated
    {
        Readiness::Ready
    } else {
        Readiness::Stale(StaleReason::Uncommitted)
    }
}

/// Messages partitioned by readiness.
#[derive(Debug, Default)]
pub struct ReadinessReport {
    pub ready: Vec<IndexMessage>,
    pub waiting: Vec<IndexMessage>,
    pub stale: Vec<(IndexMessage, StaleReason)>,
}

/// Reads snapshots for every message and classifies them.
pub fn check_ready(conn: &Connection, messages: Vec<IndexMessage>) -> IndexResult<ReadinessReport> {
    let snapshots = fetch_snapshots(conn, &messages)?;
    let mut report = ReadinessReport::default();
    for message in messages {
        match classify(&message, snapshots.get(&message.logical_resource_id)) {
            Readiness::Ready => report.ready.push(message),
            Readiness::Waiting => report.waiting.push(message),
            Readiness::Stale(reason) => report.stale.push((message, reason)),
        }
    }
    Ok(report)
}

/// Fetches snapshots with one query per resource type (chunked), keyed by
/// logical resource id.
pub fn fetch_snapshots(
    conn: &Connection,
    messages: &[IndexMessage],
) -> IndexResult<HashMap<i64, LogicalResourceSnapshot>> {
    let mut by_type: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for message in messages {
        by_type
            .entry(message.resource_type.as_str())
            .or_default()
            .push(message.logical_resource_id);
    }

    let mut snapshots = HashMap::with_capacity(messages.len());
    for (resource_type, mut ids) in by_type {
        if !is_valid_resource_type(resource_type) {
            return Err(MessageError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            }
            .into());
        }
        ids.sort_unstable();
        ids.dedup();

        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT lr.logical_resource_id, lr.logical_id, xlr.version_id, lr.last_updated, lr.parameter_hash
                   FROM logical_resources AS lr
                   JOIN {} AS xlr ON xlr.logical_resource_id = lr.logical_resource_id
                  WHERE lr.logical_resource_id IN ({})",
                logical_resources_table(resource_type),
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            for row in rows {
                let (logical_resource_id, logical_id, version_id, last_updated, parameter_hash) = row?;
                snapshots.insert(
                    logical_resource_id,
                    LogicalResourceSnapshot {
                        logical_resource_id,
                        resource_type: resource_type.to_string(),
                        logical_id,
                        version_id,
                        last_updated: parse_timestamp("last_updated", &last_updated)?,
                        parameter_hash,
                    },
                );
            }
        }
    }
    Ok(snapshots)
}

/// Keeps only the highest version of each logical resource. For equal
/// versions the later message wins, since a reused version id belongs to the
/// most recent attempt. Returns the kept messages (in arrival order) and the
/// superseded ones.
pub fn latest_versions(messages: Vec<IndexMessage>) -> (Vec<IndexMessage>, Vec<IndexMessage>) {
    let mut winner: HashMap<i64, (usize, i32)> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        let candidate = (index, message.version_id);
        winner
            .entry(message.logical_resource_id)
            .and_modify(|current| {
                if message.version_id >= current.1 {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    let mut kept = Vec::with_capacity(winner.len());
    let mut superseded = Vec::new();
    for (index, message) in messages.into_iter().enumerate() {
        if winner.get(&message.logical_resource_id).map(|w| w.0) == Some(index) {
            kept.push(message);
        } else {
            superseded.push(message);
        }
    }
    (kept, superseded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 1, 10, 0, 0).unwrap()
    }

    fn message(version_id: i32) -> IndexMessage {
        IndexMessage {
            resource_type: "Patient".to_string(),
            logical_id: "p42".to_string(),
            logical_resource_id: 42,
            version_id,
            last_updated: t(),
            parameter_hash: "abc".to_string(),
            ..Default::default()
        }
    }

    fn snapshot(version_id: i32) -> LogicalResourceSnapshot {
        LogicalResourceSnapshot {
            logical_resource_id: 42,
            resource_type: "Patient".to_string(),
            logical_id: "p42".to_string(),
            version_id,
            last_updated: t(),
            parameter_hash: "abc".to_string(),
        }
    }

    #[test]
    fn test_matching_snapshot_is_ready() {
        assert_eq!(classify(&message(3), Some(&snapshot(3))), Readiness::Ready);
    }

    #[test]
    fn test_older_snapshot_is_waiting() {
        assert_eq!(classify(&message(3), Some(&snapshot(2))), Readiness::Waiting);
    }

    #[test]
    fn test_missing_snapshot_is_waiting() {
        assert_eq!(classify(&message(1), None), Readiness::Waiting);
    }

    #[test]
    fn test_newer_snapshot_is_stale() {
        assert_eq!(
            classify(&message(3), Some(&snapshot(4))),
            Readiness::Stale(StaleReason::Superseded { current_version: 4 })
        );
    }

    #[test]
    fn test_hash_mismatch_is_stale() {
        let mut snap = snapshot(3);
        snap.parameter_hash = "xyz".to_string();
        assert_eq!(
            classify(&message(3), Some(&snap)),
            Readiness::Stale(StaleReason::Uncommitted)
        );
    }

    #[test]
    fn test_timestamp_mismatch_is_stale() {
        let mut snap = snapshot(3);
        snap.last_updated = t() + chrono::Duration::milliseconds(1);
        assert_eq!(
            classify(&message(3), Some(&snap)),
            Readiness::Stale(StaleReason::Uncommitted)
        );
    }

    #[test]
    fn test_classification_grid() {
        for message_version in 1..6 {
            for snapshot_version in 1..6 {
                let readiness = classify(&message(message_version), Some(&snapshot(snapshot_version)));
                let expected = match snapshot_version.cmp(&message_version) {
                    std::cmp::Ordering::Less => Readiness::Waiting,
                    std::cmp::Ordering::Equal => Readiness::Ready,
                    std::cmp::Ordering::Greater => Readiness::Stale(StaleReason::Superseded {
                        current_version: snapshot_version,
                    }),
                };
                assert_eq!(readiness, expected);
            }
        }
    }

    #[test]
    fn test_latest_versions() {
        let mut other = message(1);
        other.logical_resource_id = 7;
        let mut reused = message(3);
        reused.parameter_hash = "retry".to_string();

        let (kept, superseded) =
            latest_versions(vec![message(2), other.clone(), message(3), message(1), reused.clone()]);

        assert_eq!(kept, vec![other, reused]);
        assert_eq!(superseded.len(), 3);
    }
}
