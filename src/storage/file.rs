use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{AccountStore, MemoryStore, NodeStore, StoreResult, TaskStore};
use crate::types::{
    BadgeType, NewNode, NewTask, Node, NodeStateUpdate, Roadmap, RoadmapDraft, StorageData, Task,
    UserAccount, UserBadge,
};

/// JSON-file backed store for single-user local runs.
///
/// Reads are served from memory. Every write is applied in memory and then the
/// whole document is flushed through a temporary file and an atomic rename, so
/// a crash never leaves a partially written data file behind.
pub struct FileStore {
    storage_path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// `~/.roadmap-mcp/data.json`, falling back to the working directory when
    /// no home directory is known.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".roadmap-mcp")
            .join("data.json")
    }

    /// Opens the data file, creating an empty one when it does not exist yet.
    pub fn open(storage_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let storage_path = storage_path.into();
        if let Some(data_dir) = storage_path.parent() {
            fs::create_dir_all(data_dir)?;
        }

        let data = if storage_path.exists() {
            let mut file = File::open(&storage_path)?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            if contents.trim().is_empty() {
                StorageData::default()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            StorageData::default()
        };

        let store = Self {
            storage_path,
            inner: MemoryStore::from_data(data),
            write_lock: Mutex::new(()),
        };
        if !store.storage_path.exists() {
            store.save()?;
        }
        tracing::debug!(path = %store.storage_path.display(), "opened roadmap data file");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    pub fn upsert_user(&self, user: UserAccount) -> StoreResult<()> {
        self.write(|inner| {
            inner.upsert_user(user);
            Ok(())
        })
    }

    /// Persist the current content using a temporary file and an atomic rename.
    pub fn save(&self) -> StoreResult<()> {
        write_snapshot(&self.storage_path, &self.inner.snapshot())
    }

    /// Applies a mutation to a staged copy, flushes the copy, and only then
    /// publishes it in memory. A failed flush leaves memory and disk as they were.
    fn write<T>(&self, op: impl FnOnce(&MemoryStore) -> StoreResult<T>) -> StoreResult<T> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let staged = MemoryStore::from_data(self.inner.snapshot());
        let out = op(&staged)?;
        let data = staged.into_data();
        write_snapshot(&self.storage_path, &data)?;
        self.inner.replace(data);
        Ok(out)
    }
}

fn write_snapshot(storage_path: &Path, data: &StorageData) -> StoreResult<()> {
    if let Some(parent) = storage_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp = storage_path.with_extension("tmp");
    let mut f = File::create(&temp)?;
    let content = serde_json::to_string_pretty(data)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(temp, storage_path)?;
    Ok(())
}

impl TaskStore for FileStore {
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
        self.write(|inner| inner.set_task_completed(task_id, completed, completed_at))
    }

    fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        self.write(|inner| inner.insert_tasks(tasks))
    }

    fn count_completed_tasks(&self, user_id: &str) -> StoreResult<u64> {
        self.inner.count_completed_tasks(user_id)
    }
}

impl NodeStore for FileStore {
    fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
        self.inner.get_node(node_id)
    }

    fn list_nodes(&self, roadmap_id: &str) -> StoreResult<Vec<Node>> {
        self.inner.list_nodes(roadmap_id)
    }

    fn update_node_state(&self, update: NodeStateUpdate) -> StoreResult<Node> {
        self.write(|inner| inner.update_node_state(update))
    }

    fn update_node_description(&self, node_id: &str, description: &str) -> StoreResult<Node> {
        self.write(|inner| inner.update_node_description(node_id, description))
    }

    fn insert_node(&self, node: NewNode) -> StoreResult<Node> {
        self.write(|inner| inner.insert_node(node))
    }
}

impl AccountStore for FileStore {
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        self.inner.get_user(user_id)
    }

    fn get_roadmap(&self, roadmap_id: &str) -> StoreResult<Option<Roadmap>> {
        self.inner.get_roadmap(roadmap_id)
    }

    fn list_roadmaps(&self, user_id: &str) -> StoreResult<Vec<Roadmap>> {
        self.inner.list_roadmaps(user_id)
    }

    fn create_roadmap(&self, draft: RoadmapDraft) -> StoreResult<Roadmap> {
        self.write(|inner| inner.create_roadmap(draft))
    }

    fn list_badges(&self, user_id: &str) -> StoreResult<Vec<UserBadge>> {
        self.inner.list_badges(user_id)
    }

    fn insert_badge(&self, user_id: &str, badge: BadgeType) -> StoreResult<bool> {
        self.write(|inner| inner.insert_badge(user_id, badge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeDraft, NodeStatus};

    fn one_node_draft() -> RoadmapDraft {
        RoadmapDraft {
            user_id: "u1".to_string(),
            title: "Launch".to_string(),
            idea: "A marketplace for used lab equipment".to_string(),
            market_summary: Some("Fragmented supply".to_string()),
            nodes: vec![NodeDraft {
                key: "step_1".to_string(),
                title: "Talk to labs".to_string(),
                description: String::new(),
                position: 0,
                status: NodeStatus::Current,
                phase: None,
                estimated_weeks: Some(2),
                ai_insight: None,
                tasks: vec!["Call 10 lab managers".to_string()],
            }],
        }
    }

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        let roadmap_id = {
            let store = FileStore::open(&path).unwrap();
            let roadmap = store.create_roadmap(one_node_draft()).unwrap();
            let node = store.list_nodes(&roadmap.id).unwrap().remove(0);
            let task = store.list_tasks(&node.id).unwrap().remove(0);
            store.set_task_completed(&task.id, true, None).unwrap();
            roadmap.id
        };

        let reopened = FileStore::open(&path).unwrap();
        let node = reopened.list_nodes(&roadmap_id).unwrap().remove(0);
        let tasks = reopened.list_tasks(&node.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].completed);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn failed_flush_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = FileStore::open(&path).unwrap();
        let roadmap = store.create_roadmap(one_node_draft()).unwrap();
        let node = store.list_nodes(&roadmap.id).unwrap().remove(0);
        let task = store.list_tasks(&node.id).unwrap().remove(0);

        // A directory where the temp file goes makes the flush fail.
        let blocker = path.with_extension("tmp");
        fs::create_dir(&blocker).unwrap();
        assert!(store.set_task_completed(&task.id, true, None).is_err());
        assert!(!store.get_task(&task.id).unwrap().unwrap().completed);
        let on_disk = FileStore::open(&path).unwrap();
        assert!(!on_disk.get_task(&task.id).unwrap().unwrap().completed);

        fs::remove_dir(&blocker).unwrap();
        assert!(store.set_task_completed(&task.id, true, None).unwrap().completed);
        assert!(store.get_task(&task.id).unwrap().unwrap().completed);
    }

    #[test]
    fn open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = FileStore::open(&path).unwrap();
        assert!(store.path().exists());
        assert!(store.list_roadmaps("anyone").unwrap().is_empty());
    }
}
