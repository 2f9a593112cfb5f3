//! Node progress and roadmap unlocking.
//!
//! A node's progress is derived from its tasks; when a node reaches 100% it
//! becomes `complete`, and a sweep over the roadmap unlocks the node right after
//! every complete one. Both writes go through the version-conditioned
//! [`NodeStore::update_node_state`], so concurrent toggles on the same node can
//! no longer silently overwrite each other.

use serde::Serialize;
use thiserror::Error;

use crate::storage::{NodeStore, StoreError, TaskStore};
use crate::types::{Node, NodeStateUpdate, NodeStatus, Task};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Node {node_id} kept changing underneath us ({attempts} attempts)")]
    Contended { node_id: String, attempts: u32 },
}

/// Result of recomputing one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub node_id: String,
    pub roadmap_id: String,
    pub progress: u8,
    pub is_complete: bool,
    pub status: NodeStatus,
}

/// `round(100 * completed / total)`, or 0 for a node without tasks.
pub fn completion_percent(tasks: &[Task]) -> u8 {
    if tasks.is_empty() {
        return 0;
    }
    let completed = tasks.iter().filter(|t| t.completed).count();
    ((completed as f64 / tasks.len() as f64) * 100.0).round() as u8
}

/// Status a node should move to after its tasks changed.
///
/// Never moves backwards, and a node without tasks keeps whatever status it had.
pub fn next_status(current: NodeStatus, task_count: usize, is_complete: bool) -> NodeStatus {
    if is_complete {
        NodeStatus::Complete
    } else if current == NodeStatus::Locked && task_count > 0 {
        NodeStatus::Current
    } else {
        current
    }
}

/// Runs the progress rules against an injected store.
pub struct ProgressTracker<'s, S: ?Sized> {
    store: &'s S,
    max_attempts: u32,
}

impl<'s, S> ProgressTracker<'s, S>
where
    S: TaskStore + NodeStore + ?Sized,
{
    pub fn new(store: &'s S) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Recomputes a node's progress from its tasks and persists status and progress.
    ///
    /// The node is read before its tasks so that whichever writer wins the
    /// conditional update has seen every toggle committed before its read.
    pub fn recompute_node_progress(&self, node_id: &str) -> Result<ProgressUpdate, ProgressError> {
        for attempt in 1..=self.max_attempts {
            let node = self
                .store
                .get_node(node_id)?
                .ok_or_else(|| ProgressError::NodeNotFound(node_id.to_string()))?;
            let tasks = self.store.list_tasks(node_id)?;

            let progress = completion_percent(&tasks);
            let is_complete = progress == 100;
            let status = next_status(node.status, tasks.len(), is_complete);

            if status == node.status && progress == node.progress {
                return Ok(ProgressUpdate {
                    node_id: node.id,
                    roadmap_id: node.roadmap_id,
                    progress,
                    is_complete,
                    status,
                });
            }

            match self.store.update_node_state(NodeStateUpdate {
                node_id: node.id.clone(),
                expected_version: node.version,
                status,
                progress,
            }) {
                Ok(updated) => {
                    tracing::debug!(
                        node_id,
                        progress,
                        from = %node.status,
                        to = %updated.status,
                        "node progress recomputed"
                    );
                    return Ok(ProgressUpdate {
                        node_id: updated.id,
                        roadmap_id: updated.roadmap_id,
                        progress,
                        is_complete,
                        status: updated.status,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(node_id, attempt, "node changed during recompute, retrying");
                }
                Err(StoreError::NotFound { .. }) => {
                    return Err(ProgressError::NodeNotFound(node_id.to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ProgressError::Contended {
            node_id: node_id.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// One left-to-right pass that unlocks the successor of every complete node.
    ///
    /// Works on a single snapshot: a node unlocked here is `current`, not
    /// `complete`, so its own successor waits for the next sweep. Returns whether
    /// anything was unlocked.
    pub fn sweep_roadmap_progression(&self, roadmap_id: &str) -> Result<bool, ProgressError> {
        let nodes = self.store.list_nodes(roadmap_id)?;
        let mut changed = false;

        for pair in nodes.windows(2) {
            let (node, next) = (&pair[0], &pair[1]);
            if node.status == NodeStatus::Complete
                && next.status == NodeStatus::Locked
                && self.unlock(next)?
            {
                tracing::info!(
                    roadmap_id,
                    node_id = %next.id,
                    position = next.position,
                    "node unlocked"
                );
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Moves a locked node to `current`. Returns `false` if someone else already
    /// moved it past `locked`.
    fn unlock(&self, snapshot: &Node) -> Result<bool, ProgressError> {
        let mut expected = snapshot.version;
        let mut progress = snapshot.progress;

        for attempt in 1..=self.max_attempts {
            match self.store.update_node_state(NodeStateUpdate {
                node_id: snapshot.id.clone(),
                expected_version: expected,
                status: NodeStatus::Current,
                progress,
            }) {
                Ok(_) => return Ok(true),
                Err(StoreError::VersionConflict { .. }) => {
                    let Some(fresh) = self.store.get_node(&snapshot.id)? else {
                        return Err(ProgressError::NodeNotFound(snapshot.id.clone()));
                    };
                    if fresh.status != NodeStatus::Locked {
                        return Ok(false);
                    }
                    tracing::debug!(node_id = %snapshot.id, attempt, "unlock raced, retrying");
                    expected = fresh.version;
                    progress = fresh.progress;
                }
                Err(StoreError::NotFound { .. }) => {
                    return Err(ProgressError::NodeNotFound(snapshot.id.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ProgressError::Contended {
            node_id: snapshot.id.clone(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccountStore, MemoryStore, StoreResult};
    use crate::types::{NewNode, NewTask, NodeDraft, RoadmapDraft};
    use std::cell::Cell;

    fn task(completed: bool) -> Task {
        Task {
            id: "t".to_string(),
            node_id: "n".to_string(),
            title: "t".to_string(),
            description: None,
            priority: "medium".to_string(),
            completed,
            completed_at: None,
            created_at: String::new(),
        }
    }

    fn roadmap_with(store: &MemoryStore, tasks_per_node: &[usize]) -> (String, Vec<Node>) {
        let nodes = tasks_per_node
            .iter()
            .enumerate()
            .map(|(i, &count)| NodeDraft {
                key: format!("step_{}", i + 1),
                title: format!("Step {}", i + 1),
                description: String::new(),
                position: i as u32,
                status: if i == 0 {
                    NodeStatus::Current
                } else {
                    NodeStatus::Locked
                },
                phase: None,
                estimated_weeks: None,
                ai_insight: None,
                tasks: (0..count).map(|t| format!("task {t}")).collect(),
            })
            .collect();
        let roadmap = store
            .create_roadmap(RoadmapDraft {
                user_id: "u1".to_string(),
                title: "Roadmap".to_string(),
                idea: "idea".to_string(),
                market_summary: None,
                nodes,
            })
            .unwrap();
        let nodes = store.list_nodes(&roadmap.id).unwrap();
        (roadmap.id, nodes)
    }

    fn complete_all(store: &MemoryStore, node_id: &str) {
        for t in store.list_tasks(node_id).unwrap() {
            store.set_task_completed(&t.id, true, None).unwrap();
        }
    }

    fn statuses(store: &MemoryStore, roadmap_id: &str) -> Vec<NodeStatus> {
        store
            .list_nodes(roadmap_id)
            .unwrap()
            .iter()
            .map(|n| n.status)
            .collect()
    }

    #[test]
    fn percent_rounds_half_up() {
        assert_eq!(completion_percent(&[]), 0);
        assert_eq!(completion_percent(&[task(true), task(false), task(false)]), 33);
        assert_eq!(completion_percent(&[task(true), task(true), task(false)]), 67);
        assert_eq!(completion_percent(&[task(true), task(false)]), 50);
        assert_eq!(completion_percent(&[task(true)]), 100);
        let mut eight = vec![task(true)];
        eight.extend((0..7).map(|_| task(false)));
        // 12.5 rounds away from zero
        assert_eq!(completion_percent(&eight), 13);
    }

    #[test]
    fn next_status_never_regresses() {
        assert_eq!(next_status(NodeStatus::Complete, 3, false), NodeStatus::Complete);
        assert_eq!(next_status(NodeStatus::Locked, 2, false), NodeStatus::Current);
        assert_eq!(next_status(NodeStatus::Locked, 0, false), NodeStatus::Locked);
        assert_eq!(next_status(NodeStatus::Current, 2, true), NodeStatus::Complete);
        assert_eq!(next_status(NodeStatus::Current, 2, false), NodeStatus::Current);
    }

    #[test]
    fn two_task_scenario() {
        let store = MemoryStore::new();
        let (roadmap_id, nodes) = roadmap_with(&store, &[2, 1]);
        let tracker = ProgressTracker::new(&store);
        let tasks = store.list_tasks(&nodes[0].id).unwrap();

        store.set_task_completed(&tasks[0].id, true, None).unwrap();
        let half = tracker.recompute_node_progress(&nodes[0].id).unwrap();
        assert_eq!(half.progress, 50);
        assert!(!half.is_complete);
        assert_eq!(half.status, NodeStatus::Current);
        assert_eq!(half.roadmap_id, roadmap_id);

        store.set_task_completed(&tasks[1].id, true, None).unwrap();
        let done = tracker.recompute_node_progress(&nodes[0].id).unwrap();
        assert_eq!(done.progress, 100);
        assert!(done.is_complete);
        assert_eq!(done.status, NodeStatus::Complete);

        assert!(tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
        assert_eq!(
            statuses(&store, &roadmap_id),
            vec![NodeStatus::Complete, NodeStatus::Current]
        );
    }

    #[test]
    fn zero_task_node_keeps_status() {
        let store = MemoryStore::new();
        let (_, nodes) = roadmap_with(&store, &[1, 0]);
        let tracker = ProgressTracker::new(&store);

        let update = tracker.recompute_node_progress(&nodes[1].id).unwrap();
        assert_eq!(update.progress, 0);
        assert!(!update.is_complete);
        assert_eq!(update.status, NodeStatus::Locked);
        assert_eq!(store.get_node(&nodes[1].id).unwrap().unwrap().version, nodes[1].version);
    }

    #[test]
    fn unlock_cascades_one_step_per_sweep() {
        let store = MemoryStore::new();
        let (roadmap_id, nodes) = roadmap_with(&store, &[2, 2, 2, 2]);
        let tracker = ProgressTracker::new(&store);

        complete_all(&store, &nodes[0].id);
        tracker.recompute_node_progress(&nodes[0].id).unwrap();
        assert!(tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
        assert_eq!(
            statuses(&store, &roadmap_id),
            vec![
                NodeStatus::Complete,
                NodeStatus::Current,
                NodeStatus::Locked,
                NodeStatus::Locked
            ]
        );
    }

    #[test]
    fn backfilled_completions_need_one_sweep_per_boundary() {
        let store = MemoryStore::new();
        let (roadmap_id, nodes) = roadmap_with(&store, &[1, 1, 1]);
        let tracker = ProgressTracker::new(&store);

        // Node 1 completed while still locked: recompute jumps it straight to complete.
        complete_all(&store, &nodes[1].id);
        tracker.recompute_node_progress(&nodes[1].id).unwrap();
        assert!(tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
        assert_eq!(
            statuses(&store, &roadmap_id),
            vec![NodeStatus::Current, NodeStatus::Complete, NodeStatus::Current]
        );
        assert!(!tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
    }

    #[test]
    fn sweep_is_idempotent() {
        let store = MemoryStore::new();
        let (roadmap_id, nodes) = roadmap_with(&store, &[1, 1, 1]);
        let tracker = ProgressTracker::new(&store);
        complete_all(&store, &nodes[0].id);
        tracker.recompute_node_progress(&nodes[0].id).unwrap();

        assert!(tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
        let after_first = store.list_nodes(&roadmap_id).unwrap();
        assert!(!tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
        assert_eq!(store.list_nodes(&roadmap_id).unwrap(), after_first);
    }

    #[test]
    fn single_node_roadmap_sweep_is_a_no_op() {
        let store = MemoryStore::new();
        let (roadmap_id, nodes) = roadmap_with(&store, &[1]);
        let tracker = ProgressTracker::new(&store);
        complete_all(&store, &nodes[0].id);
        assert!(tracker.recompute_node_progress(&nodes[0].id).unwrap().is_complete);
        assert!(!tracker.sweep_roadmap_progression(&roadmap_id).unwrap());
    }

    #[test]
    fn empty_roadmap_sweep_is_a_no_op() {
        let store = MemoryStore::new();
        let tracker = ProgressTracker::new(&store);
        assert!(!tracker.sweep_roadmap_progression("missing").unwrap());
    }

    #[test]
    fn unticking_a_task_keeps_node_complete() {
        let store = MemoryStore::new();
        let (_, nodes) = roadmap_with(&store, &[2]);
        let tracker = ProgressTracker::new(&store);
        complete_all(&store, &nodes[0].id);
        tracker.recompute_node_progress(&nodes[0].id).unwrap();

        let first = store.list_tasks(&nodes[0].id).unwrap().remove(0);
        store.set_task_completed(&first.id, false, None).unwrap();
        let update = tracker.recompute_node_progress(&nodes[0].id).unwrap();
        assert_eq!(update.progress, 50);
        assert!(!update.is_complete);
        assert_eq!(update.status, NodeStatus::Complete);
    }

    #[test]
    fn missing_node_is_an_error() {
        let store = MemoryStore::new();
        let err = ProgressTracker::new(&store)
            .recompute_node_progress("nope")
            .unwrap_err();
        assert!(matches!(err, ProgressError::NodeNotFound(id) if id == "nope"));
    }

    /// Store wrapper that lets another writer slip in before the first N state writes.
    struct RacingStore {
        inner: MemoryStore,
        interleave: Cell<u32>,
    }

    impl TaskStore for RacingStore {
        fn list_tasks(&self, node_id: &str) -> StoreResult<Vec<Task>> {
            self.inner.list_tasks(node_id)
        }
        fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
            self.inner.get_task(task_id)
        }
        fn set_task_completed(
            &self,
            task_id: &str,
            completed: bool,
            completed_at: Option<String>,
        ) -> StoreResult<Task> {
            self.inner.set_task_completed(task_id, completed, completed_at)
        }
        fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
            self.inner.insert_tasks(tasks)
        }
        fn count_completed_tasks(&self, user_id: &str) -> StoreResult<u64> {
            self.inner.count_completed_tasks(user_id)
        }
    }

    impl NodeStore for RacingStore {
        fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
            self.inner.get_node(node_id)
        }
        fn list_nodes(&self, roadmap_id: &str) -> StoreResult<Vec<Node>> {
            self.inner.list_nodes(roadmap_id)
        }
        fn update_node_state(&self, update: NodeStateUpdate) -> StoreResult<Node> {
            if self.interleave.get() > 0 {
                self.interleave.set(self.interleave.get() - 1);
                // A concurrent writer bumps the version first.
                let current = self.inner.get_node(&update.node_id)?.unwrap();
                self.inner.update_node_state(NodeStateUpdate {
                    node_id: current.id.clone(),
                    expected_version: current.version,
                    status: current.status,
                    progress: current.progress,
                })?;
            }
            self.inner.update_node_state(update)
        }
        fn update_node_description(&self, node_id: &str, description: &str) -> StoreResult<Node> {
            self.inner.update_node_description(node_id, description)
        }
        fn insert_node(&self, node: NewNode) -> StoreResult<Node> {
            self.inner.insert_node(node)
        }
    }

    #[test]
    fn recompute_retries_after_conflict() {
        let inner = MemoryStore::new();
        let (_, nodes) = roadmap_with(&inner, &[2]);
        complete_all(&inner, &nodes[0].id);
        let store = RacingStore {
            inner,
            interleave: Cell::new(1),
        };

        let update = ProgressTracker::new(&store)
            .recompute_node_progress(&nodes[0].id)
            .unwrap();
        assert!(update.is_complete);
        let node = store.get_node(&nodes[0].id).unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Complete);
        assert_eq!(node.version, nodes[0].version + 2);
    }

    #[test]
    fn recompute_gives_up_when_contention_persists() {
        let inner = MemoryStore::new();
        let (_, nodes) = roadmap_with(&inner, &[1]);
        complete_all(&inner, &nodes[0].id);
        let store = RacingStore {
            inner,
            interleave: Cell::new(10),
        };

        let err = ProgressTracker::new(&store)
            .with_max_attempts(2)
            .recompute_node_progress(&nodes[0].id)
            .unwrap_err();
        assert!(matches!(err, ProgressError::Contended { attempts: 2, .. }));
    }

    #[test]
    fn unlock_retries_while_successor_is_still_locked() {
        let inner = MemoryStore::new();
        let (roadmap_id, nodes) = roadmap_with(&inner, &[1, 1]);
        complete_all(&inner, &nodes[0].id);
        ProgressTracker::new(&inner)
            .recompute_node_progress(&nodes[0].id)
            .unwrap();
        let store = RacingStore {
            inner,
            interleave: Cell::new(1),
        };

        assert!(ProgressTracker::new(&store)
            .sweep_roadmap_progression(&roadmap_id)
            .unwrap());
        assert_eq!(
            store.get_node(&nodes[1].id).unwrap().unwrap().status,
            NodeStatus::Current
        );
    }
}
