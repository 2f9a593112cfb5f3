use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle of a roadmap node. Ordering follows the only legal direction of travel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Locked,
    Current,
    Complete,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Locked => "locked",
            NodeStatus::Current => "current",
            NodeStatus::Complete => "complete",
        }
    }

    /// True when moving from `self` to `next` keeps the state machine forward-only.
    pub fn can_advance_to(&self, next: NodeStatus) -> bool {
        next >= *self
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Validate,
    Build,
    Launch,
    Grow,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Roadmap {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub idea: String,
    #[serde(default)]
    pub market_summary: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub roadmap_id: String,
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub position: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub estimated_weeks: Option<u32>,
    #[serde(default)]
    pub ai_insight: Option<String>,
    #[serde(default)]
    pub version: u64,
    /// Display-only fields (label and friends). Never consulted for status or progress.
    #[serde(default)]
    pub data: Map<String, Value>,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub node_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<String>,
    pub created_at: String,
}

pub fn default_priority() -> String {
    "medium".to_string()
}

/// Insert shape for tasks; the store assigns id and timestamps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub node_id: String,
    pub title: String,
    #[serde(default = "default_priority")]
    pub priority: String,
}

impl NewTask {
    pub fn new(node_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            title: title.into(),
            priority: default_priority(),
        }
    }
}

/// Conditional write of a node's derived state; applied only while `expected_version` matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStateUpdate {
    pub node_id: String,
    pub expected_version: u64,
    pub status: NodeStatus,
    pub progress: u8,
}

/// A node appended to an existing roadmap. The store places it after the
/// current last node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub roadmap_id: String,
    pub key: String,
    pub title: String,
    pub description: String,
    pub status: NodeStatus,
    pub phase: Option<Phase>,
    pub estimated_weeks: Option<u32>,
}

/// Node as requested at roadmap creation, already validated and positioned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    pub key: String,
    pub title: String,
    pub description: String,
    pub position: u32,
    pub status: NodeStatus,
    pub phase: Option<Phase>,
    pub estimated_weeks: Option<u32>,
    pub ai_insight: Option<String>,
    pub tasks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoadmapDraft {
    pub user_id: String,
    pub title: String,
    pub idea: String,
    pub market_summary: Option<String>,
    pub nodes: Vec<NodeDraft>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub subscription_tier: Option<String>,
    #[serde(default)]
    pub subscription_status: Option<String>,
    #[serde(default)]
    pub current_period_end: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum BadgeType {
    #[serde(rename = "first_task")]
    FirstTask,
    #[serde(rename = "task_master_10")]
    TaskMaster10,
    #[serde(rename = "task_master_50")]
    TaskMaster50,
    #[serde(rename = "node_complete")]
    NodeComplete,
    #[serde(rename = "streak_3")]
    Streak3,
    #[serde(rename = "streak_7")]
    Streak7,
    #[serde(rename = "streak_30")]
    Streak30,
    #[serde(rename = "early_adopter")]
    EarlyAdopter,
}

impl BadgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeType::FirstTask => "first_task",
            BadgeType::TaskMaster10 => "task_master_10",
            BadgeType::TaskMaster50 => "task_master_50",
            BadgeType::NodeComplete => "node_complete",
            BadgeType::Streak3 => "streak_3",
            BadgeType::Streak7 => "streak_7",
            BadgeType::Streak30 => "streak_30",
            BadgeType::EarlyAdopter => "early_adopter",
        }
    }
}

impl fmt::Display for BadgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserBadge {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "badge_type")]
    pub badge: BadgeType,
    pub earned_at: String,
}

/// Everything the local stores keep on disk or in memory.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StorageData {
    #[serde(default)]
    pub users: Vec<UserAccount>,
    #[serde(default)]
    pub roadmaps: Vec<Roadmap>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub badges: Vec<UserBadge>,
}
