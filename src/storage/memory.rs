use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use ulid::Ulid;

use super::{AccountStore, NodeStore, StoreError, StoreResult, TaskStore};
use crate::types::{
    BadgeType, NewNode, NewTask, Node, NodeStateUpdate, Roadmap, RoadmapDraft, StorageData, Task,
    UserAccount, UserBadge,
};

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn new_id() -> String {
    Ulid::new().to_string()
}

/// In-process store. Every operation runs under one mutex, so the conditional
/// node update is trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StorageData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: StorageData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn snapshot(&self) -> StorageData {
        self.lock().clone()
    }

    pub fn into_data(self) -> StorageData {
        self.data
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swaps in a whole document, e.g. one staged and persisted elsewhere.
    pub fn replace(&self, data: StorageData) {
        *self.lock() = data;
    }

    /// Inserts or replaces an account. Accounts are provisioned by the auth
    /// provider in production; locally they are seeded through here.
    pub fn upsert_user(&self, user: UserAccount) {
        let mut data = self.lock();
        match data.users.iter_mut().find(|u| u.id == user.id) {
            Some(existing) => *existing = user,
            None => data.users.push(user),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StorageData> {
        // Mutations below never span a panic point, so poisoned data is still consistent.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TaskStore for MemoryStore {
    fn list_tasks(&self, node_id: &str) -> StoreResult<Vec<Task>> {
        Ok(self
            .lock()
            .tasks
            .iter()
            .filter(|t| t.node_id == node_id)
            .cloned()
            .collect())
    }

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self.lock().tasks.iter().find(|t| t.id == task_id).cloned())
    }

    fn set_task_completed(
        &self,
        task_id: &str,
        completed: bool,
        completed_at: Option<String>,
    ) -> StoreResult<Task> {
        let mut data = self.lock();
        let task = data
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::not_found("Task", task_id))?;
        task.completed = completed;
        task.completed_at = completed_at;
        Ok(task.clone())
    }

    fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        let mut data = self.lock();
        if let Some(missing) = tasks
            .iter()
            .find(|t| !data.nodes.iter().any(|n| n.id == t.node_id))
        {
            return Err(StoreError::not_found("Node", missing.node_id.clone()));
        }
        let created: Vec<Task> = tasks
            .into_iter()
            .map(|t| Task {
                id: new_id(),
                node_id: t.node_id,
                title: t.title,
                description: None,
                priority: t.priority,
                completed: false,
                completed_at: None,
                created_at: now(),
            })
            .collect();
        data.tasks.extend(created.iter().cloned());
        Ok(created)
    }

    fn count_completed_tasks(&self, user_id: &str) -> StoreResult<u64> {
        let data = self.lock();
        let roadmaps: HashSet<&str> = data
            .roadmaps
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.id.as_str())
            .collect();
        let nodes: HashSet<&str> = data
            .nodes
            .iter()
            .filter(|n| roadmaps.contains(n.roadmap_id.as_str()))
            .map(|n| n.id.as_str())
            .collect();
        Ok(data
            .tasks
            .iter()
            .filter(|t| t.completed && nodes.contains(t.node_id.as_str()))
            .count() as u64)
    }
}

impl NodeStore for MemoryStore {
    fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
        Ok(self.lock().nodes.iter().find(|n| n.id == node_id).cloned())
    }

    fn list_nodes(&self, roadmap_id: &str) -> StoreResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .lock()
            .nodes
            .iter()
            .filter(|n| n.roadmap_id == roadmap_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.position);
        Ok(nodes)
    }

    fn update_node_state(&self, update: NodeStateUpdate) -> StoreResult<Node> {
        let mut data = self.lock();
        let node = data
            .nodes
            .iter_mut()
            .find(|n| n.id == update.node_id)
            .ok_or_else(|| StoreError::not_found("Node", update.node_id.clone()))?;
        if node.version != update.expected_version {
            return Err(StoreError::VersionConflict {
                node_id: update.node_id,
                expected: update.expected_version,
            });
        }
        node.status = update.status;
        node.progress = update.progress;
        node.version += 1;
        Ok(node.clone())
    }

    fn update_node_description(&self, node_id: &str, description: &str) -> StoreResult<Node> {
        let mut data = self.lock();
        let node = data
            .nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| StoreError::not_found("Node", node_id))?;
        node.description = description.to_string();
        Ok(node.clone())
    }

    fn insert_node(&self, node: NewNode) -> StoreResult<Node> {
        let mut data = self.lock();
        let position = data
            .nodes
            .iter()
            .filter(|n| n.roadmap_id == node.roadmap_id)
            .map(|n| n.position + 1)
            .max()
            .unwrap_or(0);
        let mut display = Map::new();
        display.insert("label".to_string(), Value::String(node.title.clone()));
        let created = Node {
            id: new_id(),
            roadmap_id: node.roadmap_id,
            key: node.key,
            title: node.title,
            description: node.description,
            position,
            status: node.status,
            progress: 0,
            phase: node.phase,
            estimated_weeks: node.estimated_weeks,
            ai_insight: None,
            version: 0,
            data: display,
            created_at: now(),
        };
        data.nodes.push(created.clone());
        Ok(created)
    }
}

impl AccountStore for MemoryStore {
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        Ok(self.lock().users.iter().find(|u| u.id == user_id).cloned())
    }

    fn get_roadmap(&self, roadmap_id: &str) -> StoreResult<Option<Roadmap>> {
        Ok(self
            .lock()
            .roadmaps
            .iter()
            .find(|r| r.id == roadmap_id)
            .cloned())
    }

    fn list_roadmaps(&self, user_id: &str) -> StoreResult<Vec<Roadmap>> {
        Ok(self
            .lock()
            .roadmaps
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    fn create_roadmap(&self, draft: RoadmapDraft) -> StoreResult<Roadmap> {
        let created_at = now();
        let roadmap = Roadmap {
            id: new_id(),
            user_id: draft.user_id,
            title: draft.title,
            idea: draft.idea,
            market_summary: draft.market_summary,
            created_at: created_at.clone(),
        };

        let mut nodes = Vec::with_capacity(draft.nodes.len());
        let mut tasks = Vec::new();
        for node in draft.nodes {
            let mut display = Map::new();
            display.insert("label".to_string(), Value::String(node.title.clone()));
            let id = new_id();
            tasks.extend(node.tasks.into_iter().map(|title| Task {
                id: new_id(),
                node_id: id.clone(),
                title,
                description: None,
                priority: crate::types::default_priority(),
                completed: false,
                completed_at: None,
                created_at: created_at.clone(),
            }));
            nodes.push(Node {
                id,
                roadmap_id: roadmap.id.clone(),
                key: node.key,
                title: node.title,
                description: node.description,
                position: node.position,
                status: node.status,
                progress: 0,
                phase: node.phase,
                estimated_weeks: node.estimated_weeks,
                ai_insight: node.ai_insight,
                version: 0,
                data: display,
                created_at: created_at.clone(),
            });
        }

        let mut data = self.lock();
        data.roadmaps.push(roadmap.clone());
        data.nodes.extend(nodes);
        data.tasks.extend(tasks);
        Ok(roadmap)
    }

    fn list_badges(&self, user_id: &str) -> StoreResult<Vec<UserBadge>> {
        Ok(self
            .lock()
            .badges
            .iter()
            .rev()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect())
    }

    fn insert_badge(&self, user_id: &str, badge: BadgeType) -> StoreResult<bool> {
        let mut data = self.lock();
        if data
            .badges
            .iter()
            .any(|b| b.user_id == user_id && b.badge == badge)
        {
            return Ok(false);
        }
        data.badges.push(UserBadge {
            id: new_id(),
            user_id: user_id.to_string(),
            badge,
            earned_at: now(),
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeDraft, NodeStatus};

    fn draft(user_id: &str, nodes: usize) -> RoadmapDraft {
        RoadmapDraft {
            user_id: user_id.to_string(),
            title: "Coffee subscriptions".to_string(),
            idea: "Specialty coffee delivered weekly".to_string(),
            market_summary: None,
            nodes: (0..nodes)
                .map(|i| NodeDraft {
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
                    tasks: vec!["a".to_string(), "b".to_string()],
                })
                .collect(),
        }
    }

    #[test]
    fn inserted_nodes_go_after_the_last_position() {
        let store = MemoryStore::new();
        let roadmap = store.create_roadmap(draft("u1", 2)).unwrap();
        let node = store
            .insert_node(NewNode {
                roadmap_id: roadmap.id.clone(),
                key: "extra".to_string(),
                title: "Extra".to_string(),
                description: String::new(),
                status: NodeStatus::Locked,
                phase: None,
                estimated_weeks: Some(1),
            })
            .unwrap();
        assert_eq!(node.position, 2);
        assert_eq!(store.list_nodes(&roadmap.id).unwrap().last(), Some(&node));
    }

    #[test]
    fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let roadmap = store.create_roadmap(draft("u1", 1)).unwrap();
        let node = store.list_nodes(&roadmap.id).unwrap().remove(0);

        let first = store
            .update_node_state(NodeStateUpdate {
                node_id: node.id.clone(),
                expected_version: node.version,
                status: NodeStatus::Current,
                progress: 50,
            })
            .unwrap();
        assert_eq!(first.version, node.version + 1);

        let stale = store.update_node_state(NodeStateUpdate {
            node_id: node.id.clone(),
            expected_version: node.version,
            status: NodeStatus::Complete,
            progress: 100,
        });
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));
        assert_eq!(store.get_node(&node.id).unwrap().unwrap().progress, 50);
    }

    #[test]
    fn nodes_come_back_in_position_order() {
        let store = MemoryStore::new();
        let roadmap = store.create_roadmap(draft("u1", 4)).unwrap();
        let positions: Vec<u32> = store
            .list_nodes(&roadmap.id)
            .unwrap()
            .iter()
            .map(|n| n.position)
            .collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[test]
    fn completed_tasks_are_counted_per_owner() {
        let store = MemoryStore::new();
        let mine = store.create_roadmap(draft("u1", 1)).unwrap();
        let theirs = store.create_roadmap(draft("u2", 1)).unwrap();
        for roadmap in [&mine, &theirs] {
            let node = store.list_nodes(&roadmap.id).unwrap().remove(0);
            let task = store.list_tasks(&node.id).unwrap().remove(0);
            store.set_task_completed(&task.id, true, None).unwrap();
        }
        assert_eq!(store.count_completed_tasks("u1").unwrap(), 1);
        assert_eq!(store.count_completed_tasks("nobody").unwrap(), 0);
    }

    #[test]
    fn badges_are_only_inserted_once() {
        let store = MemoryStore::new();
        assert!(store.insert_badge("u1", BadgeType::FirstTask).unwrap());
        assert!(!store.insert_badge("u1", BadgeType::FirstTask).unwrap());
        assert!(store.insert_badge("u2", BadgeType::FirstTask).unwrap());
        assert_eq!(store.list_badges("u1").unwrap().len(), 1);
    }

    #[test]
    fn inserting_tasks_for_unknown_node_fails() {
        let store = MemoryStore::new();
        let err = store
            .insert_tasks(vec![NewTask::new("missing", "Interview 5 people")])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "Node", .. }));
    }
}
