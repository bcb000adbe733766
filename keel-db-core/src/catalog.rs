//! In-memory collection catalog.
//!
//! The catalog is the single writer of index state: collections, their
//! documents, and their index entries (ready or unfinished). The index-builds
//! subsystem never mutates index state directly; it goes through the entry
//! operations here, which stand in for the durable catalog's
//! write-units-of-work.
//!
//! An index entry is *unfinished* from the moment setup places it in the
//! catalog until the build commits and flips it to *ready*. Unfinished
//! entries remember the build that owns them so teardown and recovery can
//! find them again.

use crate::error::{Error, Result};
use crate::ids::{BuildId, CollectionId};
use crate::index_spec::IndexSpec;
use crate::namespace::Namespace;
use crate::timestamp::{LogicalClock, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One stored document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub record_id: u64,
    pub body: serde_json::Value,
}

/// One index entry in a collection's catalog.
#[derive(Clone, Debug)]
pub struct IndexCatalogEntry {
    pub spec: IndexSpec,
    /// False until the owning build commits.
    pub ready: bool,
    /// Set while the entry is unfinished; cleared on commit.
    pub build_id: Option<BuildId>,
    /// Timestamp of the catalog write that flipped `ready`.
    pub commit_timestamp: Timestamp,
}

/// Creation-time collection settings.
#[derive(Clone, Debug, Default)]
pub struct CollectionOptions {
    pub default_collation: Option<String>,
    /// Shard-key pattern field names, when the collection is sharded.
    pub shard_key: Option<Vec<String>>,
}

/// A live collection: namespace, documents, and index entries.
#[derive(Debug)]
pub struct Collection {
    id: CollectionId,
    namespace: RwLock<Namespace>,
    default_collation: Option<String>,
    shard_key: Option<Vec<String>>,
    documents: RwLock<Vec<Document>>,
    indexes: RwLock<Vec<IndexCatalogEntry>>,
    next_record_id: AtomicU64,
}

impl Collection {
    fn new(id: CollectionId, namespace: Namespace, options: CollectionOptions) -> Self {
        Self {
            id,
            namespace: RwLock::new(namespace),
            default_collation: options.default_collation,
            shard_key: options.shard_key,
            documents: RwLock::new(Vec::new()),
            indexes: RwLock::new(Vec::new()),
            next_record_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace.read().clone()
    }

    /// Rename. Coordination is unaffected: everything keys on the id.
    pub fn set_namespace(&self, namespace: Namespace) {
        *self.namespace.write() = namespace;
    }

    pub fn default_collation(&self) -> Option<&str> {
        self.default_collation.as_deref()
    }

    pub fn shard_key(&self) -> Option<&[String]> {
        self.shard_key.as_deref()
    }

    // -- documents ----------------------------------------------------------

    pub fn insert_document(&self, body: serde_json::Value) -> u64 {
        let record_id = self.next_record_id.fetch_add(1, Ordering::Relaxed);
        self.documents.write().push(Document { record_id, body });
        record_id
    }

    pub fn num_records(&self) -> u64 {
        self.documents.read().len() as u64
    }

    /// Total serialized size of stored documents, in bytes.
    pub fn data_size(&self) -> u64 {
        self.documents
            .read()
            .iter()
            .map(|d| d.body.to_string().len() as u64)
            .sum()
    }

    /// Snapshot of all documents, for a builder's collection scan.
    pub fn scan(&self) -> Vec<Document> {
        self.documents.read().clone()
    }

    // -- index entries ------------------------------------------------------

    /// Total index count, unfinished entries included.
    pub fn num_indexes_total(&self) -> usize {
        self.indexes.read().len()
    }

    pub fn find_index_by_name(&self, name: &str) -> Option<IndexCatalogEntry> {
        self.indexes
            .read()
            .iter()
            .find(|e| e.spec.name == name)
            .cloned()
    }

    pub fn index_entries(&self) -> Vec<IndexCatalogEntry> {
        self.indexes.read().clone()
    }

    /// Place an unfinished entry owned by `build_id`.
    ///
    /// A ready or in-progress entry with the same name conflicts: an
    /// identical spec is `IndexExists`; a different key pattern is
    /// `IndexKeySpecsConflict`; anything else is `IndexOptionsConflict`.
    pub fn add_unfinished_index(&self, spec: IndexSpec, build_id: BuildId) -> Result<()> {
        let mut indexes = self.indexes.write();
        if let Some(existing) = indexes.iter().find(|e| e.spec.name == spec.name) {
            return Err(if existing.spec.same_index(&spec) {
                Error::index_exists(format!(
                    "index {} already exists in catalog for collection {}",
                    spec, self.id
                ))
            } else if existing.spec.keys != spec.keys {
                Error::IndexKeySpecsConflict(format!(
                    "index {} conflicts with existing key pattern of {}",
                    spec, existing.spec
                ))
            } else {
                Error::IndexOptionsConflict(format!(
                    "index {} conflicts with existing options of {}",
                    spec, existing.spec
                ))
            });
        }
        indexes.push(IndexCatalogEntry {
            spec,
            ready: false,
            build_id: Some(build_id),
            commit_timestamp: Timestamp::NULL,
        });
        Ok(())
    }

    /// Flip an unfinished entry to ready at `ts`.
    pub fn mark_index_ready(&self, name: &str, ts: Timestamp) -> Result<()> {
        let mut indexes = self.indexes.write();
        let entry = indexes
            .iter_mut()
            .find(|e| e.spec.name == name)
            .ok_or_else(|| Error::not_found(format!("index '{name}' not in catalog")))?;
        entry.ready = true;
        entry.build_id = None;
        entry.commit_timestamp = ts;
        Ok(())
    }

    /// Remove an entry by name, ready or not. Returns whether it existed.
    pub fn remove_index(&self, name: &str) -> bool {
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|e| e.spec.name != name);
        indexes.len() != before
    }

    /// Remove every unfinished entry owned by `build_id`. Returns the names
    /// removed.
    pub fn remove_unfinished_indexes(&self, build_id: BuildId) -> Vec<String> {
        let mut indexes = self.indexes.write();
        let mut removed = Vec::new();
        indexes.retain(|e| {
            if e.build_id == Some(build_id) && !e.ready {
                removed.push(e.spec.name.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

/// The server-wide catalog: id → collection, plus the logical clock that
/// stamps local catalog writes.
#[derive(Debug)]
pub struct CollectionCatalog {
    collections: RwLock<HashMap<CollectionId, Arc<Collection>>>,
    clock: LogicalClock,
}

impl CollectionCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collections: RwLock::new(HashMap::new()),
            clock: LogicalClock::new(),
        })
    }

    pub fn create_collection(
        &self,
        namespace: Namespace,
        options: CollectionOptions,
    ) -> Arc<Collection> {
        let id = CollectionId::new();
        let collection = Arc::new(Collection::new(id, namespace, options));
        self.collections.write().insert(id, collection.clone());
        collection
    }

    pub fn lookup_by_id(&self, id: CollectionId) -> Option<Arc<Collection>> {
        self.collections.read().get(&id).cloned()
    }

    pub fn lookup_by_namespace(&self, namespace: &Namespace) -> Option<Arc<Collection>> {
        self.collections
            .read()
            .values()
            .find(|c| &c.namespace() == namespace)
            .cloned()
    }

    pub fn drop_collection(&self, id: CollectionId) -> bool {
        self.collections.write().remove(&id).is_some()
    }

    /// Draw a ghost timestamp for a local catalog write.
    pub fn next_timestamp(&self) -> Timestamp {
        self.clock.tick()
    }

    /// Keep ghost timestamps ahead of replicated ones.
    pub fn observe_timestamp(&self, ts: Timestamp) {
        self.clock.observe(ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_spec::IndexSpec;

    fn catalog_with_collection() -> (Arc<CollectionCatalog>, Arc<Collection>) {
        let catalog = CollectionCatalog::new();
        let coll = catalog.create_collection(
            Namespace::new("app", "events"),
            CollectionOptions::default(),
        );
        (catalog, coll)
    }

    #[test]
    fn unfinished_then_ready_lifecycle() {
        let (catalog, coll) = catalog_with_collection();
        let build = BuildId::new();
        coll.add_unfinished_index(IndexSpec::ascending("by_ts", &["ts"]), build)
            .unwrap();

        let entry = coll.find_index_by_name("by_ts").unwrap();
        assert!(!entry.ready);
        assert_eq!(entry.build_id, Some(build));
        assert_eq!(coll.num_indexes_total(), 1);

        let ts = catalog.next_timestamp();
        coll.mark_index_ready("by_ts", ts).unwrap();
        let entry = coll.find_index_by_name("by_ts").unwrap();
        assert!(entry.ready);
        assert_eq!(entry.build_id, None);
        assert_eq!(entry.commit_timestamp, ts);
    }

    #[test]
    fn add_conflicts_are_distinguished() {
        let (_catalog, coll) = catalog_with_collection();
        let spec = IndexSpec::ascending("by_ts", &["ts"]);
        coll.add_unfinished_index(spec.clone(), BuildId::new()).unwrap();

        // Identical spec: already exists.
        let err = coll
            .add_unfinished_index(spec.clone(), BuildId::new())
            .unwrap_err();
        assert!(matches!(err, Error::IndexExists(_)));

        // Same name, different keys.
        let err = coll
            .add_unfinished_index(IndexSpec::ascending("by_ts", &["other"]), BuildId::new())
            .unwrap_err();
        assert!(matches!(err, Error::IndexKeySpecsConflict(_)));

        // Same name and keys, different options.
        let err = coll
            .add_unfinished_index(IndexSpec::ascending("by_ts", &["ts"]).unique(), BuildId::new())
            .unwrap_err();
        assert!(matches!(err, Error::IndexOptionsConflict(_)));
    }

    #[test]
    fn remove_unfinished_scopes_to_build() {
        let (_catalog, coll) = catalog_with_collection();
        let mine = BuildId::new();
        let theirs = BuildId::new();
        coll.add_unfinished_index(IndexSpec::ascending("a", &["a"]), mine)
            .unwrap();
        coll.add_unfinished_index(IndexSpec::ascending("b", &["b"]), theirs)
            .unwrap();
        coll.mark_index_ready("b", Timestamp(7)).unwrap();

        let removed = coll.remove_unfinished_indexes(mine);
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(coll.find_index_by_name("a").is_none());
        assert!(coll.find_index_by_name("b").unwrap().ready);
    }

    #[test]
    fn rename_keeps_id_lookup() {
        let (catalog, coll) = catalog_with_collection();
        let id = coll.id();
        coll.set_namespace(Namespace::new("app", "events_v2"));
        assert_eq!(catalog.lookup_by_id(id).unwrap().id(), id);
        assert!(catalog
            .lookup_by_namespace(&Namespace::new("app", "events_v2"))
            .is_some());
        assert!(catalog
            .lookup_by_namespace(&Namespace::new("app", "events"))
            .is_none());
    }
}
