//! Per-revision cycle cache.
//!
//! Carries the parsed source and the partial-progress flags of the current
//! revision. A transient downstream error must not force re-declaration of
//! an already-installed snapshot: the next trigger resumes where the
//! previous cycle left off. Flags reset only when the revision advances.

use rudder_core::MultiError;
use serde_json::Value;

/// Cached source push plus partial-progress flags for one revision.
#[derive(Debug, Default)]
pub struct CommitCache {
    /// Source revision this cache belongs to.
    pub revision: String,
    /// Parsed object set as pushed by the source fetcher.
    pub objects: Vec<Value>,
    /// Non-blocking parser errors. While present, completed steps are not
    /// marked done, forcing retry until parsing fully succeeds.
    pub parse_errors: MultiError,
    /// The declared-resource store holds this revision's snapshot.
    pub declared_resources_updated: bool,
    /// The applier finished cleanly for this revision.
    pub applied: bool,
    /// Remediator watches match this revision's kinds.
    pub watches_updated: bool,
}

impl CommitCache {
    /// Creates a cache for a first push.
    #[must_use]
    pub fn new(revision: impl Into<String>, objects: Vec<Value>, parse_errors: MultiError) -> Self {
        Self {
            revision: revision.into(),
            objects,
            parse_errors,
            declared_resources_updated: false,
            applied: false,
            watches_updated: false,
        }
    }

    /// Installs a new push. Progress flags survive only when the revision is
    /// unchanged.
    pub fn advance(&mut self, revision: &str, objects: Vec<Value>, parse_errors: MultiError) {
        if self.revision != revision {
            self.declared_resources_updated = false;
            self.applied = false;
            self.watches_updated = false;
            self.revision = revision.to_string();
        }
        self.objects = objects;
        self.parse_errors = parse_errors;
    }

    /// Whether every cycle step has completed for this revision.
    #[must_use]
    pub fn fully_synced(&self) -> bool {
        self.declared_resources_updated && self.applied && self.watches_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_revision_keeps_flags() {
        let mut cache = CommitCache::new("rev-1", Vec::new(), MultiError::new());
        cache.declared_resources_updated = true;
        cache.applied = true;

        cache.advance("rev-1", Vec::new(), MultiError::new());
        assert!(cache.declared_resources_updated);
        assert!(cache.applied);
        assert!(!cache.fully_synced());
    }

    #[test]
    fn test_new_revision_resets_flags() {
        let mut cache = CommitCache::new("rev-1", Vec::new(), MultiError::new());
        cache.declared_resources_updated = true;
        cache.applied = true;
        cache.watches_updated = true;
        assert!(cache.fully_synced());

        cache.advance("rev-2", Vec::new(), MultiError::new());
        assert_eq!(cache.revision, "rev-2");
        assert!(!cache.declared_resources_updated);
        assert!(!cache.applied);
        assert!(!cache.watches_updated);
    }
}
