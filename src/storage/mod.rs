//! Persistence contracts for roadmaps, nodes, tasks and accounts.
//!
//! Three backends implement them:
//! - [`MemoryStore`]: process-local, used by tests and `--store memory`
//! - [`FileStore`]: the memory model flushed to a JSON file after each write
//! - [`RestStore`]: a hosted PostgREST-style database reached over HTTP

pub mod file;
pub mod memory;
pub mod rest;

use thiserror::Error;

use crate::types::{
    BadgeType, NewNode, NewTask, Node, NodeStateUpdate, Roadmap, RoadmapDraft, Task, UserAccount,
    UserBadge,
};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use rest::{RestConfig, RestStore};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Backend returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Node {node_id} changed concurrently (expected version {expected})")]
    VersionConflict { node_id: String, expected: u64 },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub trait TaskStore {
    /// Tasks of a node in creation order.
    fn list_tasks(&self, node_id: &str) -> StoreResult<Vec<Task>>;

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;

    fn set_task_completed(
        &self,
        task_id: &str,
        completed: bool,
        completed_at: Option<String>,
    ) -> StoreResult<Task>;

    fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>>;

    /// Completed tasks across every roadmap owned by `user_id`.
    fn count_completed_tasks(&self, user_id: &str) -> StoreResult<u64>;
}

pub trait NodeStore {
    fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>>;

    /// Nodes of a roadmap ordered by `position` ascending.
    fn list_nodes(&self, roadmap_id: &str) -> StoreResult<Vec<Node>>;

    /// Writes status and progress only if the stored version still equals
    /// `update.expected_version`, bumping the version on success.
    ///
    /// Returns [`StoreError::VersionConflict`] when the version moved and
    /// [`StoreError::NotFound`] when the node does not exist.
    fn update_node_state(&self, update: NodeStateUpdate) -> StoreResult<Node>;

    fn update_node_description(&self, node_id: &str, description: &str) -> StoreResult<Node>;

    /// Appends a node at one past the roadmap's highest position (0 when empty).
    fn insert_node(&self, node: NewNode) -> StoreResult<Node>;
}

pub trait AccountStore {
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>>;

    fn get_roadmap(&self, roadmap_id: &str) -> StoreResult<Option<Roadmap>>;

    fn list_roadmaps(&self, user_id: &str) -> StoreResult<Vec<Roadmap>>;

    /// Creates the roadmap with all of its nodes and tasks, or nothing at all.
    fn create_roadmap(&self, draft: RoadmapDraft) -> StoreResult<Roadmap>;

    /// Badges of a user, most recent first.
    fn list_badges(&self, user_id: &str) -> StoreResult<Vec<UserBadge>>;

    /// Returns `false` when the user already holds the badge.
    fn insert_badge(&self, user_id: &str, badge: BadgeType) -> StoreResult<bool>;
}

/// Full backend used by the service layer.
pub trait Store: TaskStore + NodeStore + AccountStore + Send + Sync {}

impl<T> Store for T where T: TaskStore + NodeStore + AccountStore + Send + Sync {}
