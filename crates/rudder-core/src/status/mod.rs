//! Error taxonomy and aggregation.
//!
//! Every subsystem returns error values to its coordinator; nothing unwinds.
//! Non-fatal errors accumulate in a [`MultiError`] per cycle, which is merged
//! with remediator-held conflict and fight errors when surfaced externally.

use std::fmt;
use std::sync::RwLock;

use crate::object::ObjectId;

/// One classified sync error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SyncError {
    /// Source parsing failed. Non-blocking: the cycle proceeds but does not
    /// clear partial-progress flags, forcing a retry.
    #[error("parse error: {message}")]
    Parse {
        /// Parser failure description.
        message: String,
    },

    /// Unexpected invariant violation. The cycle aborts and retries under
    /// normal backoff.
    #[error("internal error: {message}")]
    Internal {
        /// Invariant violation description.
        message: String,
    },

    /// The declared update would remove every declared namespace along with
    /// its contents. Safety abort before any mutation.
    #[error("namespace retention: {message}")]
    NamespaceRetention {
        /// Retention rule description.
        message: String,
    },

    /// Applying one object failed. The cycle continues for independents.
    #[error("failed to apply {id}: {message}")]
    Apply {
        /// The object that failed to apply.
        id: ObjectId,
        /// Failure description.
        message: String,
    },

    /// Pruning one object failed. The cycle continues for independents.
    #[error("failed to prune {id}: {message}")]
    Prune {
        /// The object that failed to prune.
        id: ObjectId,
        /// Failure description.
        message: String,
    },

    /// Two distinct managers compete for one object. The losing side never
    /// overwrites.
    #[error(
        "detected a management conflict for {id}: object is managed by {current_manager:?}, declared by {other_manager:?}"
    )]
    ManagementConflict {
        /// The contested object.
        id: ObjectId,
        /// Manager currently recorded on the live object.
        current_manager: String,
        /// Manager attempting the write.
        other_manager: String,
    },

    /// The same object was corrected repeatedly within the fight window.
    /// Reported for alerting; behavior is otherwise unchanged.
    #[error("resource fight for {id}: corrected {corrections} times within the window")]
    ResourceFight {
        /// The oscillating object.
        id: ObjectId,
        /// Corrections observed within the window.
        corrections: u32,
    },

    /// Structural rejection of a declared object.
    #[error("validation failed: {message}")]
    Validation {
        /// The invalid objects, when known.
        ids: Vec<ObjectId>,
        /// Rejection description.
        message: String,
    },
}

impl SyncError {
    /// A stable classification key used for stall detection: repeated cycle
    /// failures with the same root cause raise the stalled condition.
    #[must_use]
    pub fn root_cause(&self) -> String {
        match self {
            Self::Parse { .. } => "parse".to_string(),
            Self::Internal { message } => format!("internal:{message}"),
            Self::NamespaceRetention { .. } => "namespace-retention".to_string(),
            Self::Apply { id, .. } => format!("apply:{id}"),
            Self::Prune { id, .. } => format!("prune:{id}"),
            Self::ManagementConflict { id, .. } => format!("conflict:{id}"),
            Self::ResourceFight { id, .. } => format!("fight:{id}"),
            Self::Validation { message, .. } => format!("validation:{message}"),
        }
    }
}

/// An ordered, deduplicating collection of sync errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<SyncError>,
}

impl MultiError {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error, skipping exact duplicates.
    pub fn push(&mut self, err: SyncError) {
        if !self.errors.contains(&err) {
            self.errors.push(err);
        }
    }

    /// Appends every error from `other`, preserving order and deduplicating.
    pub fn merge(&mut self, other: MultiError) {
        for err in other.errors {
            self.push(err);
        }
    }

    /// Appends errors from an iterator.
    pub fn extend(&mut self, errs: impl IntoIterator<Item = SyncError>) {
        for err in errs {
            self.push(err);
        }
    }

    /// Whether the collection holds no errors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of collected errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Borrows the collected errors in order.
    #[must_use]
    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    /// Converts into `Err(self)` when non-empty.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no errors");
        }
        write!(f, "{} error(s):", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n  {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl From<SyncError> for MultiError {
    fn from(err: SyncError) -> Self {
        let mut multi = Self::new();
        multi.push(err);
        multi
    }
}

impl IntoIterator for MultiError {
    type Item = SyncError;
    type IntoIter = std::vec::IntoIter<SyncError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

/// Thread-safe holder for the latest known error set of a subsystem.
///
/// Writers replace the whole set; readers take a clone. Safe to call from any
/// task while a cycle is running.
#[derive(Debug, Default)]
pub struct ErrorBuffer {
    inner: RwLock<MultiError>,
}

impl ErrorBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the held error set.
    pub fn set(&self, errs: MultiError) {
        *self.inner.write().expect("error buffer lock poisoned") = errs;
    }

    /// Returns a copy of the held error set.
    #[must_use]
    pub fn get(&self) -> MultiError {
        self.inner.read().expect("error buffer lock poisoned").clone()
    }

    /// Clears the held error set.
    pub fn clear(&self) {
        self.set(MultiError::new());
    }
}

/// Detects stalled syncs: consecutive cycle failures sharing one root cause.
#[derive(Debug)]
pub struct StallDetector {
    threshold: u32,
    last_cause: Option<String>,
    consecutive: u32,
}

impl StallDetector {
    /// Creates a detector that reports a stall after `threshold` consecutive
    /// failures with the same root cause.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last_cause: None,
            consecutive: 0,
        }
    }

    /// Records a failed cycle. Returns `true` while the sync is stalled.
    pub fn observe_failure(&mut self, errs: &MultiError) -> bool {
        let cause = errs
            .errors()
            .first()
            .map(SyncError::root_cause)
            .unwrap_or_default();
        if self.last_cause.as_deref() == Some(cause.as_str()) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.last_cause = Some(cause);
            self.consecutive = 1;
        }
        self.consecutive >= self.threshold
    }

    /// Records a successful cycle, clearing any stall.
    pub fn observe_success(&mut self) {
        self.last_cause = None;
        self.consecutive = 0;
    }
}
