//! Replication-log records for index-build coordination.

use keel_db_core::{BuildId, CollectionId, IndexSpec, Namespace, Timestamp};
use serde::{Deserialize, Serialize};

/// Which lifecycle point a record marks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OplogEntryKind {
    StartIndexBuild,
    CommitIndexBuild,
    AbortIndexBuild,
}

/// One index-build log record.
///
/// Every record carries the build id, the collection id, the namespace at the
/// time of writing, and the normalized specs. `commitIndexBuild` additionally
/// carries the commit timestamp assigned by its surrounding oplog entry;
/// `abortIndexBuild` carries the cause message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexBuildOplogEntry {
    pub kind: OplogEntryKind,
    pub build_id: BuildId,
    pub collection_id: CollectionId,
    pub namespace: Namespace,
    pub specs: Vec<IndexSpec>,
    #[serde(default, skip_serializing_if = "ts_is_null")]
    pub commit_timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_cause: Option<String>,
}

fn ts_is_null(ts: &Timestamp) -> bool {
    ts.is_null()
}

impl IndexBuildOplogEntry {
    pub fn start(
        build_id: BuildId,
        collection_id: CollectionId,
        namespace: Namespace,
        specs: Vec<IndexSpec>,
    ) -> Self {
        Self {
            kind: OplogEntryKind::StartIndexBuild,
            build_id,
            collection_id,
            namespace,
            specs,
            commit_timestamp: Timestamp::NULL,
            abort_cause: None,
        }
    }

    pub fn commit(
        build_id: BuildId,
        collection_id: CollectionId,
        namespace: Namespace,
        specs: Vec<IndexSpec>,
        commit_timestamp: Timestamp,
    ) -> Self {
        Self {
            kind: OplogEntryKind::CommitIndexBuild,
            build_id,
            collection_id,
            namespace,
            specs,
            commit_timestamp,
            abort_cause: None,
        }
    }

    pub fn abort(
        build_id: BuildId,
        collection_id: CollectionId,
        namespace: Namespace,
        specs: Vec<IndexSpec>,
        cause: String,
    ) -> Self {
        Self {
            kind: OplogEntryKind::AbortIndexBuild,
            build_id,
            collection_id,
            namespace,
            specs,
            commit_timestamp: Timestamp::NULL,
            abort_cause: Some(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_entry_round_trips_with_timestamp() {
        let entry = IndexBuildOplogEntry::commit(
            BuildId::new(),
            CollectionId::new(),
            Namespace::new("app", "events"),
            vec![IndexSpec::ascending("by_ts", &["ts"])],
            Timestamp(9),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "commitIndexBuild");
        let back: IndexBuildOplogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.commit_timestamp, Timestamp(9));
        assert_eq!(back.kind, OplogEntryKind::CommitIndexBuild);
    }
}
