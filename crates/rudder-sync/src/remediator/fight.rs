//! Resource fight detection.
//!
//! An external actor repeatedly corrupting an object the remediator keeps
//! correcting shows up as a high correction rate. Corrections are counted
//! per object over a sliding window; at the threshold a fight is recorded.
//! Fights are reported for alerting and do not alter remediation behavior;
//! the set is cumulative until the revision changes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use indexmap::IndexMap;
use rudder_core::{ObjectId, SyncError};
use tokio::time::Instant;

/// Sliding-window correction counter with hysteresis against oscillation.
#[derive(Debug)]
pub struct FightDetector {
    threshold: u32,
    window: Duration,
    corrections: Mutex<HashMap<ObjectId, VecDeque<Instant>>>,
    fights: Mutex<IndexMap<ObjectId, u32>>,
}

impl FightDetector {
    /// Creates a detector flagging `threshold` corrections of one object
    /// within `window`. A zero threshold disables detection.
    #[must_use]
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            corrections: Mutex::new(HashMap::new()),
            fights: Mutex::new(IndexMap::new()),
        }
    }

    /// Records one correction of `id`. Returns the fight error when the
    /// threshold is reached within the window.
    pub fn record_correction(&self, id: &ObjectId) -> Option<SyncError> {
        if self.threshold == 0 {
            return None;
        }
        let now = Instant::now();
        let count = {
            let mut corrections = self.corrections.lock().expect("fight detector lock poisoned");
            let timestamps = corrections.entry(id.clone()).or_default();
            timestamps.push_back(now);
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.window)
            {
                timestamps.pop_front();
            }
            u32::try_from(timestamps.len()).unwrap_or(u32::MAX)
        };
        if count < self.threshold {
            return None;
        }
        self.fights
            .lock()
            .expect("fight detector lock poisoned")
            .insert(id.clone(), count);
        Some(SyncError::ResourceFight {
            id: id.clone(),
            corrections: count,
        })
    }

    /// The recorded fights, in first-detection order.
    #[must_use]
    pub fn fight_errors(&self) -> Vec<SyncError> {
        self.fights
            .lock()
            .expect("fight detector lock poisoned")
            .iter()
            .map(|(id, corrections)| SyncError::ResourceFight {
                id: id.clone(),
                corrections: *corrections,
            })
            .collect()
    }

    /// Clears counters and recorded fights. Called when the revision
    /// advances.
    pub fn reset(&self) {
        self.corrections
            .lock()
            .expect("fight detector lock poisoned")
            .clear();
        self.fights.lock().expect("fight detector lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ObjectId {
        ObjectId::new("", "ConfigMap", "ns", "cm")
    }

    #[tokio::test]
    async fn test_threshold_within_window() {
        let detector = FightDetector::new(3, Duration::from_secs(60));
        assert!(detector.record_correction(&id()).is_none());
        assert!(detector.record_correction(&id()).is_none());
        let fight = detector.record_correction(&id()).unwrap();
        assert!(matches!(
            fight,
            SyncError::ResourceFight { corrections: 3, .. }
        ));
        assert_eq!(detector.fight_errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_corrections_age_out() {
        let detector = FightDetector::new(3, Duration::from_secs(10));
        detector.record_correction(&id());
        detector.record_correction(&id());

        tokio::time::advance(Duration::from_secs(11)).await;
        // The first two corrections fell out of the window.
        assert!(detector.record_correction(&id()).is_none());
        assert!(detector.fight_errors().is_empty());
    }

    #[tokio::test]
    async fn test_fights_cumulative_until_reset() {
        let detector = FightDetector::new(1, Duration::from_secs(60));
        detector.record_correction(&id());
        assert_eq!(detector.fight_errors().len(), 1);

        detector.reset();
        assert!(detector.fight_errors().is_empty());
    }

    #[tokio::test]
    async fn test_zero_threshold_disables() {
        let detector = FightDetector::new(0, Duration::from_secs(60));
        assert!(detector.record_correction(&id()).is_none());
        assert!(detector.fight_errors().is_empty());
    }
}
