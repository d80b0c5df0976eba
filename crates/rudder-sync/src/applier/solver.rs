//! Task queue construction.
//!
//! Turns dependency waves into the ordered task list a run executes:
//! inventory upsert, apply waves each followed by a current-status wait,
//! prune waves each followed by a gone-status wait, inventory finalize.

use std::time::Duration;

use rudder_core::ObjectId;

use super::task::{InventoryPhase, Task};

/// Builds the ordered task queue for one run.
#[derive(Debug, Clone)]
pub struct TaskQueueBuilder {
    /// Per-wave deadline for current-status waits.
    pub reconcile_timeout: Duration,
    /// Per-wave deadline for gone-status waits.
    pub prune_timeout: Duration,
}

impl TaskQueueBuilder {
    /// Assembles the queue from apply waves (topological order) and prune
    /// waves (reverse topological order). Empty waves are dropped.
    #[must_use]
    pub fn build(&self, apply_waves: &[Vec<ObjectId>], prune_waves: &[Vec<ObjectId>]) -> Vec<Task> {
        let mut tasks = vec![Task::InventoryUpsert(InventoryPhase::Pre)];
        for wave in apply_waves.iter().filter(|wave| !wave.is_empty()) {
            tasks.push(Task::ApplyWave { ids: wave.clone() });
            tasks.push(Task::WaitCurrent {
                ids: wave.clone(),
                timeout: self.reconcile_timeout,
            });
        }
        for wave in prune_waves.iter().filter(|wave| !wave.is_empty()) {
            tasks.push(Task::PruneWave { ids: wave.clone() });
            tasks.push(Task::WaitGone {
                ids: wave.clone(),
                timeout: self.prune_timeout,
            });
        }
        tasks.push(Task::InventoryUpsert(InventoryPhase::Post));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ObjectId {
        ObjectId::new("", "ConfigMap", "ns", name)
    }

    #[test]
    fn test_queue_shape() {
        let builder = TaskQueueBuilder {
            reconcile_timeout: Duration::from_secs(60),
            prune_timeout: Duration::from_secs(30),
        };
        let tasks = builder.build(
            &[vec![id("a")], vec![id("b")]],
            &[vec![id("old")]],
        );

        assert_eq!(tasks.len(), 8);
        assert_eq!(tasks[0], Task::InventoryUpsert(InventoryPhase::Pre));
        assert!(matches!(&tasks[1], Task::ApplyWave { ids } if ids == &vec![id("a")]));
        assert!(matches!(&tasks[2], Task::WaitCurrent { timeout, .. } if *timeout == Duration::from_secs(60)));
        assert!(matches!(&tasks[3], Task::ApplyWave { ids } if ids == &vec![id("b")]));
        assert!(matches!(&tasks[5], Task::PruneWave { ids } if ids == &vec![id("old")]));
        assert!(matches!(&tasks[6], Task::WaitGone { timeout, .. } if *timeout == Duration::from_secs(30)));
        assert_eq!(tasks[7], Task::InventoryUpsert(InventoryPhase::Post));
    }

    #[test]
    fn test_empty_waves_dropped() {
        let builder = TaskQueueBuilder {
            reconcile_timeout: Duration::from_secs(60),
            prune_timeout: Duration::from_secs(30),
        };
        let tasks = builder.build(&[Vec::new()], &[]);
        assert_eq!(
            tasks,
            vec![
                Task::InventoryUpsert(InventoryPhase::Pre),
                Task::InventoryUpsert(InventoryPhase::Post),
            ]
        );
    }
}
