//! Request-scoped operations behind the MCP tools.
//!
//! Every method takes the [`Caller`] explicitly and verifies ownership before
//! touching the store. Task toggles drive the progress chain: recompute the
//! node, then sweep the roadmap when the node completed.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::ai::{AiError, SubstepGenerator};
use crate::error::{ServiceError, ServiceResult};
use crate::gamification::{self, LevelInfo};
use crate::guard::{
    Caller, require_node_ownership, require_roadmap_ownership, require_task_ownership,
};
use crate::progress::{self, DEFAULT_MAX_ATTEMPTS, ProgressTracker, ProgressUpdate};
use crate::prompts;
use crate::storage::{Store, StoreError};
use crate::subscription::{self, LimitCheck, LimitKind, SubscriptionStatus};
use crate::types::{
    BadgeType, NewNode, NewTask, Node, NodeDraft, NodeStateUpdate, NodeStatus, Phase, Roadmap,
    RoadmapDraft, Task,
};

pub const MAX_TASK_TITLE_CHARS: usize = 500;
pub const MAX_NODE_TITLE_CHARS: usize = 50;
const FALLBACK_ROADMAP_TITLE: &str = "My Startup";
const ADDED_NODE_DESCRIPTION: &str = "Added by AI Companion";
const LOCKED_NODE: &str = "This step is locked until the previous one is complete";

/// One AI-proposed milestone, as produced by the roadmap generator.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NodeInput {
    /// Step identifier such as `step_1`.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default, alias = "estimatedWeeks")]
    pub estimated_weeks: Option<u32>,
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct RoadmapInput {
    pub idea: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "marketSummary")]
    pub market_summary: Option<String>,
    pub nodes: Vec<NodeInput>,
}

/// A milestone appended to an existing roadmap.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct AddNodeInput {
    pub roadmap_id: String,
    /// Node title, 1 to 50 characters.
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phase: Option<Phase>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RoadmapStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    /// Rounded percentage of completed tasks, 0 when there are none.
    pub completion_rate: u8,
    pub total_nodes: u64,
    pub completed_nodes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub tasks: Vec<Task>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoadmapView {
    pub roadmap: Roadmap,
    pub nodes: Vec<NodeView>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToggleOutcome {
    pub task: Task,
    pub progress: Option<ProgressUpdate>,
    pub unlocked_next: bool,
    pub badges_awarded: Vec<BadgeType>,
    /// Set when the toggle was saved but the follow-up progress update failed.
    pub progress_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeStatusChange {
    pub node: Node,
    pub unlocked_next: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EarnedBadge {
    #[serde(rename = "type")]
    pub badge: BadgeType,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    pub earned_at: String,
}

fn clean_task_title(raw: &str) -> ServiceResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ServiceError::validation("Task title is required"));
    }
    if title.chars().count() > MAX_TASK_TITLE_CHARS {
        return Err(ServiceError::validation(format!(
            "Task title must be at most {MAX_TASK_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

/// Validates a generated roadmap and lays it out: node `i` gets position `i`,
/// the first node starts `current`, every other node `locked`.
pub fn build_roadmap_draft(user_id: &str, input: RoadmapInput) -> ServiceResult<RoadmapDraft> {
    let idea = input.idea.trim().to_string();
    if idea.is_empty() {
        return Err(ServiceError::validation("Describe the idea behind the roadmap"));
    }
    if input.nodes.is_empty() {
        return Err(ServiceError::validation("A roadmap needs at least one node"));
    }

    let mut keys = HashSet::new();
    let mut nodes = Vec::with_capacity(input.nodes.len());
    for (index, node) in input.nodes.into_iter().enumerate() {
        let key = node.id.trim().to_string();
        if key.is_empty() {
            return Err(ServiceError::validation(format!("Node {} has no id", index + 1)));
        }
        if !keys.insert(key.clone()) {
            return Err(ServiceError::validation(format!("Duplicate node id \"{key}\"")));
        }
        let title = node.title.trim().to_string();
        if title.is_empty() {
            return Err(ServiceError::validation(format!("Node \"{key}\" has no title")));
        }
        let tasks = node
            .tasks
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| clean_task_title(t))
            .collect::<ServiceResult<Vec<_>>>()?;

        nodes.push(NodeDraft {
            key,
            title,
            description: node.description.trim().to_string(),
            position: index as u32,
            status: if index == 0 {
                NodeStatus::Current
            } else {
                NodeStatus::Locked
            },
            phase: node.phase,
            estimated_weeks: node.estimated_weeks,
            ai_insight: input.market_summary.clone(),
            tasks,
        });
    }

    let title = input
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| nodes.first().map(|n| n.title.clone()))
        .unwrap_or_else(|| FALLBACK_ROADMAP_TITLE.to_string());

    Ok(RoadmapDraft {
        user_id: user_id.to_string(),
        title,
        idea,
        market_summary: input.market_summary,
        nodes,
    })
}

pub struct RoadmapService {
    store: Arc<dyn Store>,
    generator: Option<Arc<dyn SubstepGenerator>>,
}

impl RoadmapService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            generator: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn SubstepGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn tracker(&self) -> ProgressTracker<'_, dyn Store + '_> {
        ProgressTracker::new(self.store())
    }

    // --- roadmaps ---

    pub fn create_roadmap(&self, caller: &Caller, input: RoadmapInput) -> ServiceResult<RoadmapView> {
        let limit = subscription::check_resource_limit(self.store(), &caller.user_id, &LimitKind::Roadmaps)?;
        if !limit.allowed {
            return Err(ServiceError::LimitReached(
                limit.message.unwrap_or_else(|| "Project limit reached".to_string()),
            ));
        }

        let draft = build_roadmap_draft(&caller.user_id, input)?;
        let roadmap = self.store.create_roadmap(draft)?;
        tracing::info!(roadmap_id = %roadmap.id, user_id = %caller.user_id, "roadmap created");
        self.roadmap_view(roadmap)
    }

    pub fn list_roadmaps(&self, caller: &Caller) -> ServiceResult<Vec<Roadmap>> {
        Ok(self.store.list_roadmaps(&caller.user_id)?)
    }

    pub fn get_roadmap(&self, caller: &Caller, roadmap_id: &str) -> ServiceResult<RoadmapView> {
        let roadmap = require_roadmap_ownership(self.store(), caller, roadmap_id)?;
        self.roadmap_view(roadmap)
    }

    fn roadmap_view(&self, roadmap: Roadmap) -> ServiceResult<RoadmapView> {
        let nodes = self
            .store
            .list_nodes(&roadmap.id)?
            .into_iter()
            .map(|node| {
                let tasks = self.store.list_tasks(&node.id)?;
                Ok(NodeView { node, tasks })
            })
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(RoadmapView { roadmap, nodes })
    }

    // --- tasks ---

    pub fn list_tasks(&self, caller: &Caller, node_id: &str) -> ServiceResult<Vec<Task>> {
        require_node_ownership(self.store(), caller, node_id)?;
        Ok(self.store.list_tasks(node_id)?)
    }

    pub fn add_task(&self, caller: &Caller, node_id: &str, title: &str) -> ServiceResult<Task> {
        let (_, node) = require_node_ownership(self.store(), caller, node_id)?;
        let title = clean_task_title(title)?;

        let task = self
            .store
            .insert_tasks(vec![NewTask::new(node_id, title)])?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::FromString("Failed to create task".to_string()))?;
        tracing::info!(task_id = %task.id, node_id, "task added");
        self.refresh_after_new_tasks(&node);
        Ok(task)
    }

    pub fn generate_substeps(
        &self,
        caller: &Caller,
        node_id: &str,
        context: &str,
    ) -> ServiceResult<Vec<Task>> {
        let generator = self.generator.as_ref().ok_or(AiError::NotConfigured)?;
        let (_, node) = require_node_ownership(self.store(), caller, node_id)?;

        let titles = generator.generate_substeps(&node.title, context)?;
        let new_tasks = titles
            .iter()
            .filter_map(|t| prompts::clean_title(t))
            .filter_map(|t| clean_task_title(&t).ok())
            .map(|title| NewTask::new(node_id, title))
            .collect::<Vec<_>>();
        if !new_tasks.is_empty() {
            let created = self.store.insert_tasks(new_tasks)?;
            tracing::info!(node_id, count = created.len(), "generated tasks inserted");
            self.refresh_after_new_tasks(&node);
        }
        Ok(self.store.list_tasks(node_id)?)
    }

    /// New, incomplete tasks lower a started node's percentage. Locked nodes
    /// stay untouched so adding work does not unlock them.
    fn refresh_after_new_tasks(&self, node: &Node) {
        if node.status == NodeStatus::Locked {
            return;
        }
        if let Err(err) = self.tracker().recompute_node_progress(&node.id) {
            tracing::warn!(node_id = %node.id, error = %err, "progress refresh after adding tasks failed");
        }
    }

    /// Saves the completion flag, then recomputes the node and, if it completed,
    /// sweeps the roadmap. A failure after the save is reported in
    /// [`ToggleOutcome::progress_error`] rather than undoing the toggle.
    pub fn toggle_task(
        &self,
        caller: &Caller,
        task_id: &str,
        completed: bool,
    ) -> ServiceResult<ToggleOutcome> {
        let (node, _) = require_task_ownership(self.store(), caller, task_id)?;
        if node.status == NodeStatus::Locked {
            return Err(ServiceError::validation(LOCKED_NODE));
        }
        let completed_at = completed.then(|| Utc::now().to_rfc3339());
        let task = self.store.set_task_completed(task_id, completed, completed_at)?;
        tracing::info!(task_id, completed, node_id = %node.id, "task toggled");

        let mut outcome = ToggleOutcome {
            task,
            progress: None,
            unlocked_next: false,
            badges_awarded: Vec::new(),
            progress_error: None,
        };

        if completed {
            match self.award_task_badges(caller) {
                Ok(badges) => outcome.badges_awarded.extend(badges),
                Err(err) => tracing::warn!(user_id = %caller.user_id, error = %err, "badge check failed"),
            }
        }

        if let Err(err) = self.advance_progress(caller, &node.id, &mut outcome) {
            tracing::warn!(task_id, node_id = %node.id, error = %err, "progress update after toggle failed");
            outcome.progress_error = Some(err.to_string());
        }
        Ok(outcome)
    }

    fn award_task_badges(&self, caller: &Caller) -> ServiceResult<Vec<BadgeType>> {
        let completed = self.store.count_completed_tasks(&caller.user_id)?;
        Ok(gamification::award_badges(
            self.store(),
            &caller.user_id,
            &gamification::task_badges_for(completed),
        )?)
    }

    fn advance_progress(
        &self,
        caller: &Caller,
        node_id: &str,
        outcome: &mut ToggleOutcome,
    ) -> ServiceResult<()> {
        let tracker = self.tracker();
        let update = tracker.recompute_node_progress(node_id)?;
        let is_complete = update.is_complete;
        let roadmap_id = update.roadmap_id.clone();
        outcome.progress = Some(update);

        if is_complete {
            outcome.unlocked_next = tracker.sweep_roadmap_progression(&roadmap_id)?;
            outcome.badges_awarded.extend(gamification::award_badges(
                self.store(),
                &caller.user_id,
                &[BadgeType::NodeComplete],
            )?);
        }
        Ok(())
    }

    // --- nodes ---

    pub fn recompute_node_progress(
        &self,
        caller: &Caller,
        node_id: &str,
    ) -> ServiceResult<ProgressUpdate> {
        require_node_ownership(self.store(), caller, node_id)?;
        Ok(self.tracker().recompute_node_progress(node_id)?)
    }

    pub fn sweep_roadmap(&self, caller: &Caller, roadmap_id: &str) -> ServiceResult<bool> {
        require_roadmap_ownership(self.store(), caller, roadmap_id)?;
        Ok(self.tracker().sweep_roadmap_progression(roadmap_id)?)
    }

    /// Manual status change. Only forward moves are accepted; moving a node to
    /// `complete` unlocks its successor.
    pub fn update_node_status(
        &self,
        caller: &Caller,
        node_id: &str,
        status: NodeStatus,
    ) -> ServiceResult<NodeStatusChange> {
        let (_, mut node) = require_node_ownership(self.store(), caller, node_id)?;

        let mut attempts = 0;
        let node = loop {
            if !node.status.can_advance_to(status) {
                return Err(ServiceError::validation(format!(
                    "Node status cannot move from {} back to {}",
                    node.status, status
                )));
            }
            if node.status == NodeStatus::Locked && status == NodeStatus::Complete {
                return Err(ServiceError::validation(LOCKED_NODE));
            }
            if node.status == status {
                break node;
            }
            attempts += 1;
            match self.store.update_node_state(NodeStateUpdate {
                node_id: node.id.clone(),
                expected_version: node.version,
                status,
                progress: node.progress,
            }) {
                Ok(updated) => break updated,
                Err(StoreError::VersionConflict { .. }) if attempts < DEFAULT_MAX_ATTEMPTS => {
                    node = self
                        .store
                        .get_node(node_id)?
                        .ok_or_else(|| ServiceError::NotFound {
                            entity: "Node",
                            id: node_id.to_string(),
                        })?;
                }
                Err(err) => return Err(err.into()),
            }
        };
        tracing::info!(node_id, status = %node.status, "node status updated");

        let unlocked_next = if node.status == NodeStatus::Complete {
            self.tracker().sweep_roadmap_progression(&node.roadmap_id)?
        } else {
            false
        };
        Ok(NodeStatusChange {
            node,
            unlocked_next,
        })
    }

    /// Appends a node after the last one. It starts `locked` unless the roadmap
    /// is empty; if the previous last node is already complete, the sweep
    /// unlocks it right away.
    pub fn add_node(&self, caller: &Caller, input: AddNodeInput) -> ServiceResult<Node> {
        let roadmap = require_roadmap_ownership(self.store(), caller, &input.roadmap_id)?;
        let title = input.title.trim().to_string();
        if title.is_empty() || title.chars().count() > MAX_NODE_TITLE_CHARS {
            return Err(ServiceError::validation(format!(
                "Node title must be 1 to {MAX_NODE_TITLE_CHARS} characters"
            )));
        }

        let limit = subscription::check_resource_limit(
            self.store(),
            &caller.user_id,
            &LimitKind::Nodes {
                roadmap_id: roadmap.id.clone(),
            },
        )?;
        if !limit.allowed {
            return Err(ServiceError::LimitReached(
                limit.message.unwrap_or_else(|| "Step limit reached".to_string()),
            ));
        }

        let existing = self.store.list_nodes(&roadmap.id)?;
        let status = if existing.is_empty() {
            NodeStatus::Current
        } else {
            NodeStatus::Locked
        };
        let description = input
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| ADDED_NODE_DESCRIPTION.to_string());

        let node = self.store.insert_node(NewNode {
            roadmap_id: roadmap.id.clone(),
            key: format!("ai_{}", ulid::Ulid::new().to_string().to_lowercase()),
            title,
            description,
            status,
            phase: input.phase,
            estimated_weeks: Some(1),
        })?;
        tracing::info!(roadmap_id = %roadmap.id, node_id = %node.id, position = node.position, "node added");

        if existing.last().is_some_and(|n| n.status == NodeStatus::Complete)
            && self.tracker().sweep_roadmap_progression(&roadmap.id)?
        {
            return Ok(self.store.get_node(&node.id)?.unwrap_or(node));
        }
        Ok(node)
    }

    pub fn update_node_description(
        &self,
        caller: &Caller,
        node_id: &str,
        description: &str,
    ) -> ServiceResult<Node> {
        require_node_ownership(self.store(), caller, node_id)?;
        Ok(self
            .store
            .update_node_description(node_id, description.trim())?)
    }

    /// Task and node totals for one roadmap.
    pub fn roadmap_stats(&self, caller: &Caller, roadmap_id: &str) -> ServiceResult<RoadmapStats> {
        require_roadmap_ownership(self.store(), caller, roadmap_id)?;
        let nodes = self.store.list_nodes(roadmap_id)?;
        let mut tasks = Vec::new();
        for node in &nodes {
            tasks.extend(self.store.list_tasks(&node.id)?);
        }
        Ok(RoadmapStats {
            total_tasks: tasks.len() as u64,
            completed_tasks: tasks.iter().filter(|t| t.completed).count() as u64,
            completion_rate: progress::completion_percent(&tasks),
            total_nodes: nodes.len() as u64,
            completed_nodes: nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Complete)
                .count() as u64,
        })
    }

    // --- account ---

    pub fn user_level(&self, caller: &Caller) -> ServiceResult<LevelInfo> {
        let total = self.store.count_completed_tasks(&caller.user_id)?;
        Ok(gamification::level_for(total))
    }

    pub fn list_badges(&self, caller: &Caller) -> ServiceResult<Vec<EarnedBadge>> {
        Ok(self
            .store
            .list_badges(&caller.user_id)?
            .into_iter()
            .map(|earned| {
                let def = gamification::definition(earned.badge);
                EarnedBadge {
                    badge: earned.badge,
                    name: def.name,
                    description: def.description,
                    icon: def.icon,
                    earned_at: earned.earned_at,
                }
            })
            .collect())
    }

    pub fn subscription(&self, caller: &Caller) -> ServiceResult<SubscriptionStatus> {
        let account = self.store.get_user(&caller.user_id)?;
        Ok(SubscriptionStatus::from_account(account.as_ref()))
    }

    pub fn check_limit(&self, caller: &Caller, kind: &LimitKind) -> ServiceResult<LimitCheck> {
        if let LimitKind::Nodes { roadmap_id } = kind {
            require_roadmap_ownership(self.store(), caller, roadmap_id)?;
        }
        Ok(subscription::check_resource_limit(
            self.store(),
            &caller.user_id,
            kind,
        )?)
    }
}
