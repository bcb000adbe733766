//! Namespace strings: `db.collection`.
//!
//! Namespaces are display and lookup conveniences; coordination paths key on
//! `CollectionId` so that a concurrent rename cannot detach an operation from
//! its collection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified collection namespace.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a `db.collection` string. The first `.` separates the database
    /// from the collection; the collection part may itself contain dots.
    pub fn parse(s: &str) -> Option<Self> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self::new(db, coll))
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_dot() {
        let ns = Namespace::parse("app.events.2024").unwrap();
        assert_eq!(ns.db(), "app");
        assert_eq!(ns.coll(), "events.2024");
        assert_eq!(ns.to_string(), "app.events.2024");
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(Namespace::parse("app").is_none());
        assert!(Namespace::parse(".coll").is_none());
        assert!(Namespace::parse("db.").is_none());
    }
}
