//! Hosted database client
//!
//! Talks to a PostgREST-compatible endpoint (`<base>/rest/v1/<table>`), the
//! dialect used by managed Postgres providers. Tables:
//! - `projects`: roadmaps
//! - `canvas_nodes`: roadmap nodes, with a `version` column for conditional writes
//! - `tasks`, `users`, `badges`
//!
//! Roadmap creation goes through the `create_complete_project` database
//! function so the roadmap, its nodes and its tasks land in one transaction.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;

use super::{AccountStore, NodeStore, StoreError, StoreResult, TaskStore};
use crate::types::{
    BadgeType, NewNode, NewTask, Node, NodeStateUpdate, NodeStatus, Phase, Roadmap, RoadmapDraft, Task,
    UserAccount, UserBadge, default_priority,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

pub struct RestStore {
    base_url: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ProjectRow {
    id: String,
    user_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    market_summary: Option<String>,
    created_at: String,
}

impl From<ProjectRow> for Roadmap {
    fn from(row: ProjectRow) -> Self {
        Roadmap {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            idea: row.description.unwrap_or_default(),
            market_summary: row.market_summary,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeRow {
    id: String,
    project_id: String,
    node_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    position: u32,
    #[serde(default)]
    status: Option<NodeStatus>,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    phase: Option<Phase>,
    #[serde(default)]
    estimated_weeks: Option<u32>,
    #[serde(default)]
    ai_insight: Option<String>,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    created_at: String,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Node {
            id: row.id,
            roadmap_id: row.project_id,
            key: row.node_id,
            title: row.title,
            description: row.description.unwrap_or_default(),
            position: row.position,
            status: row.status.unwrap_or(NodeStatus::Locked),
            progress: row.progress.unwrap_or(0),
            phase: row.phase,
            estimated_weeks: row.estimated_weeks,
            ai_insight: row.ai_insight,
            version: row.version.unwrap_or(0),
            data: row.data.unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskRow {
    id: String,
    node_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    completed_at: Option<String>,
    created_at: String,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            node_id: row.node_id,
            title: row.title,
            description: row.description,
            priority: row.priority.unwrap_or_else(default_priority),
            completed: row.completed.unwrap_or(false),
            completed_at: row.completed_at,
            created_at: row.created_at,
        }
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

fn map_ureq_error(context: &str, err: ureq::Error) -> StoreError {
    match err {
        ureq::Error::Status(status, response) => StoreError::Api {
            status,
            message: response
                .into_string()
                .unwrap_or_else(|_| format!("{context} failed")),
        },
        ureq::Error::Transport(transport) => StoreError::Network(format!("{context}: {transport}")),
    }
}

impl RestStore {
    pub fn new(config: RestConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build();
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            agent,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, mut request: ureq::Request) -> ureq::Request {
        if let Some(api_key) = &self.api_key {
            request = request
                .set("apikey", api_key)
                .set("Authorization", &format!("Bearer {}", api_key));
        }
        request
    }

    fn select<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> StoreResult<Vec<T>> {
        let mut request = self.authorize(self.agent.get(&self.table_url(table)));
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request
            .call()
            .map_err(|e| map_ureq_error(&format!("select from {table}"), e))?;
        Ok(response.into_json::<Vec<T>>()?)
    }

    fn select_one<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> StoreResult<Option<T>> {
        Ok(self.select(table, query)?.into_iter().next())
    }

    /// Sends a write and returns the affected rows (`Prefer: return=representation`).
    fn write<T: DeserializeOwned>(
        &self,
        method: &str,
        table: &str,
        query: &[(&str, String)],
        body: Value,
    ) -> StoreResult<Vec<T>> {
        let mut request = self
            .authorize(self.agent.request(method, &self.table_url(table)))
            .set("Prefer", "return=representation");
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request
            .send_json(body)
            .map_err(|e| map_ureq_error(&format!("{method} {table}"), e))?;
        Ok(response.into_json::<Vec<T>>()?)
    }

    /// Exact row count from `Content-Range`, without transferring any rows.
    fn count(&self, table: &str, query: &[(&str, String)]) -> StoreResult<u64> {
        let mut request = self
            .authorize(self.agent.head(&self.table_url(table)))
            .set("Prefer", "count=exact");
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request
            .call()
            .map_err(|e| map_ureq_error(&format!("count {table}"), e))?;
        content_range_total(response.header("Content-Range"))
    }

    fn rpc(&self, function: &str, body: Value) -> StoreResult<Value> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let response = self
            .authorize(self.agent.post(&url))
            .send_json(body)
            .map_err(|e| map_ureq_error(&format!("rpc {function}"), e))?;
        Ok(response.into_json::<Value>()?)
    }
}

/// Total from a PostgREST `Content-Range` header such as `0-24/3573` or `*/0`.
fn content_range_total(header: Option<&str>) -> StoreResult<u64> {
    header
        .and_then(|range| range.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
        .ok_or_else(|| StoreError::Api {
            status: 200,
            message: format!("missing or unreadable Content-Range: {header:?}"),
        })
}

/// Build a store from a connection string such as `db.example.com` or
/// `https://project.supabase.co`.
pub fn create_rest_store(connection_string: &str, api_key: Option<String>) -> RestStore {
    let base_url = if connection_string.starts_with("http") {
        connection_string.to_string()
    } else {
        format!("https://{}", connection_string)
    };
    RestStore::new(RestConfig {
        base_url,
        api_key,
        timeout_secs: 30,
    })
}

impl TaskStore for RestStore {
    fn list_tasks(&self, node_id: &str) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> = self.select(
            "tasks",
            &[
                ("select", "*".to_string()),
                ("node_id", eq(node_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let row: Option<TaskRow> =
            self.select_one("tasks", &[("select", "*".to_string()), ("id", eq(task_id))])?;
        Ok(row.map(Task::from))
    }

    fn set_task_completed(
        &self,
        task_id: &str,
        completed: bool,
        completed_at: Option<String>,
    ) -> StoreResult<Task> {
        let rows: Vec<TaskRow> = self.write(
            "PATCH",
            "tasks",
            &[("id", eq(task_id))],
            json!({ "completed": completed, "completed_at": completed_at }),
        )?;
        rows.into_iter()
            .next()
            .map(Task::from)
            .ok_or_else(|| StoreError::not_found("Task", task_id))
    }

    fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let body: Vec<Value> = tasks
            .into_iter()
            .map(|t| {
                json!({
                    "node_id": t.node_id,
                    "title": t.title,
                    "completed": false,
                    "priority": t.priority,
                })
            })
            .collect();
        let rows: Vec<TaskRow> = self.write("POST", "tasks", &[], Value::Array(body))?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    fn count_completed_tasks(&self, user_id: &str) -> StoreResult<u64> {
        self.count(
            "tasks",
            &[
                (
                    "select",
                    "id,canvas_nodes!inner(project_id,projects!inner(user_id))".to_string(),
                ),
                ("completed", "eq.true".to_string()),
                ("canvas_nodes.projects.user_id", eq(user_id)),
            ],
        )
    }
}

impl NodeStore for RestStore {
    fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
        let row: Option<NodeRow> = self.select_one(
            "canvas_nodes",
            &[("select", "*".to_string()), ("id", eq(node_id))],
        )?;
        Ok(row.map(Node::from))
    }

    fn list_nodes(&self, roadmap_id: &str) -> StoreResult<Vec<Node>> {
        let rows: Vec<NodeRow> = self.select(
            "canvas_nodes",
            &[
                ("select", "*".to_string()),
                ("project_id", eq(roadmap_id)),
                ("order", "position.asc".to_string()),
            ],
        )?;
        Ok(rows.into_iter().map(Node::from).collect())
    }

    fn update_node_state(&self, update: NodeStateUpdate) -> StoreResult<Node> {
        let rows: Vec<NodeRow> = self.write(
            "PATCH",
            "canvas_nodes",
            &[
                ("id", eq(&update.node_id)),
                ("version", eq(&update.expected_version.to_string())),
            ],
            json!({
                "status": update.status,
                "progress": update.progress,
                "version": update.expected_version + 1,
            }),
        )?;
        if let Some(row) = rows.into_iter().next() {
            return Ok(Node::from(row));
        }
        // Nothing matched: either the node is gone or the version moved on.
        match self.get_node(&update.node_id)? {
            Some(_) => Err(StoreError::VersionConflict {
                node_id: update.node_id,
                expected: update.expected_version,
            }),
            None => Err(StoreError::not_found("Node", update.node_id)),
        }
    }

    fn update_node_description(&self, node_id: &str, description: &str) -> StoreResult<Node> {
        let rows: Vec<NodeRow> = self.write(
            "PATCH",
            "canvas_nodes",
            &[("id", eq(node_id))],
            json!({ "description": description }),
        )?;
        rows.into_iter()
            .next()
            .map(Node::from)
            .ok_or_else(|| StoreError::not_found("Node", node_id))
    }

    fn insert_node(&self, node: NewNode) -> StoreResult<Node> {
        let last: Option<Value> = self.select_one(
            "canvas_nodes",
            &[
                ("select", "position".to_string()),
                ("project_id", eq(&node.roadmap_id)),
                ("order", "position.desc".to_string()),
                ("limit", "1".to_string()),
            ],
        )?;
        let position = last
            .and_then(|row| row.get("position").and_then(Value::as_u64))
            .map_or(0, |p| p + 1);

        let rows: Vec<NodeRow> = self.write(
            "POST",
            "canvas_nodes",
            &[],
            json!({
                "project_id": node.roadmap_id,
                "node_id": node.key,
                "title": node.title,
                "description": node.description,
                "position": position,
                "status": node.status,
                "phase": node.phase,
                "estimated_weeks": node.estimated_weeks,
                "data": { "label": node.title },
            }),
        )?;
        rows.into_iter().next().map(Node::from).ok_or_else(|| StoreError::Api {
            status: 200,
            message: "node insert returned no row".to_string(),
        })
    }
}

impl AccountStore for RestStore {
    fn get_user(&self, user_id: &str) -> StoreResult<Option<UserAccount>> {
        self.select_one("users", &[("select", "*".to_string()), ("id", eq(user_id))])
    }

    fn get_roadmap(&self, roadmap_id: &str) -> StoreResult<Option<Roadmap>> {
        let row: Option<ProjectRow> = self.select_one(
            "projects",
            &[("select", "*".to_string()), ("id", eq(roadmap_id))],
        )?;
        Ok(row.map(Roadmap::from))
    }

    fn list_roadmaps(&self, user_id: &str) -> StoreResult<Vec<Roadmap>> {
        let rows: Vec<ProjectRow> = self.select(
            "projects",
            &[
                ("select", "*".to_string()),
                ("user_id", eq(user_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )?;
        Ok(rows.into_iter().map(Roadmap::from).collect())
    }

    fn create_roadmap(&self, draft: RoadmapDraft) -> StoreResult<Roadmap> {
        let nodes: Vec<Value> = draft
            .nodes
            .iter()
            .map(|n| {
                json!({
                    "node_id": n.key,
                    "title": n.title,
                    "description": n.description,
                    "position": n.position,
                    "status": n.status,
                    "phase": n.phase,
                    "estimated_weeks": n.estimated_weeks,
                    "ai_insight": n.ai_insight,
                    "data": { "label": n.title },
                })
            })
            .collect();
        let tasks: Vec<Value> = draft
            .nodes
            .iter()
            .flat_map(|n| {
                n.tasks
                    .iter()
                    .map(move |title| json!({ "node_id": n.key, "title": title }))
            })
            .collect();

        let result = self.rpc(
            "create_complete_project",
            json!({
                "p_user_id": draft.user_id,
                "p_title": draft.title,
                "p_description": draft.idea,
                "p_market_summary": draft.market_summary,
                "p_nodes": nodes,
                "p_tasks": tasks,
            }),
        )?;
        let roadmap_id = result.as_str().ok_or_else(|| StoreError::Api {
            status: 200,
            message: format!("create_complete_project returned {result} instead of an id"),
        })?;
        self.get_roadmap(roadmap_id)?
            .ok_or_else(|| StoreError::not_found("Roadmap", roadmap_id))
    }

    fn list_badges(&self, user_id: &str) -> StoreResult<Vec<UserBadge>> {
        self.select(
            "badges",
            &[
                ("select", "*".to_string()),
                ("user_id", eq(user_id)),
                ("order", "earned_at.desc".to_string()),
            ],
        )
    }

    fn insert_badge(&self, user_id: &str, badge: BadgeType) -> StoreResult<bool> {
        let existing: Option<Value> = self.select_one(
            "badges",
            &[
                ("select", "id".to_string()),
                ("user_id", eq(user_id)),
                ("badge_type", eq(badge.as_str())),
            ],
        )?;
        if existing.is_some() {
            return Ok(false);
        }
        match self.write::<Value>(
            "POST",
            "badges",
            &[],
            json!({ "user_id": user_id, "badge_type": badge }),
        ) {
            Ok(_) => Ok(true),
            // Unique (user_id, badge_type) constraint: someone else won the race.
            Err(StoreError::Api { status: 409, .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creation() {
        let store = RestStore::new(RestConfig {
            base_url: "http://localhost:54321/".to_string(),
            api_key: Some("service-key".to_string()),
            timeout_secs: 5,
        });
        assert_eq!(store.base_url, "http://localhost:54321");
        assert_eq!(store.table_url("tasks"), "http://localhost:54321/rest/v1/tasks");
        assert_eq!(store.api_key.as_deref(), Some("service-key"));
    }

    #[test]
    fn test_connection_string_parsing() {
        let store = create_rest_store("db.example.com", None);
        assert_eq!(store.base_url, "https://db.example.com");

        let store = create_rest_store("http://127.0.0.1:54321", Some("key".to_string()));
        assert_eq!(store.base_url, "http://127.0.0.1:54321");
    }

    #[test]
    fn counts_come_from_content_range() {
        assert_eq!(content_range_total(Some("0-24/3573")).unwrap(), 3573);
        assert_eq!(content_range_total(Some("*/0")).unwrap(), 0);
        assert!(content_range_total(Some("0-24/*")).is_err());
        assert!(content_range_total(None).is_err());
    }

    #[test]
    fn node_rows_fill_missing_state_columns() {
        let row: NodeRow = serde_json::from_value(json!({
            "id": "n1",
            "project_id": "p1",
            "node_id": "step_1",
            "title": "Validate demand",
            "description": null,
            "position": 0,
            "status": null,
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let node = Node::from(row);
        assert_eq!(node.roadmap_id, "p1");
        assert_eq!(node.key, "step_1");
        assert_eq!(node.status, NodeStatus::Locked);
        assert_eq!(node.progress, 0);
        assert_eq!(node.version, 0);
        assert!(node.description.is_empty());
    }

    #[test]
    fn task_rows_default_priority_and_completion() {
        let row: TaskRow = serde_json::from_value(json!({
            "id": "t1",
            "node_id": "n1",
            "title": "Draft landing page",
            "priority": null,
            "completed": null,
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let task = Task::from(row);
        assert_eq!(task.priority, "medium");
        assert!(!task.completed);
    }
}
