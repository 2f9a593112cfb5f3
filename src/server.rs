use rmcp::{
    ErrorData, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ServiceError, ServiceResult};
use crate::guard::Caller;
use crate::service::{AddNodeInput, RoadmapInput, RoadmapService};
use crate::subscription::LimitKind;
use crate::types::NodeStatus;

const INSTRUCTIONS: &str = "Startup roadmap tracker. A roadmap is an ordered list of nodes \
(milestones); each node holds tasks. Completing every task of a node completes it and unlocks \
the next node. Use get_roadmap to see nodes and tasks, toggle_task to tick tasks off, and \
add_task or generate_substeps to add work.";

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct RoadmapIdArgs {
    pub roadmap_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct NodeIdArgs {
    pub node_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct AddTaskArgs {
    pub node_id: String,
    /// Task title, 1 to 500 characters.
    pub title: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ToggleTaskArgs {
    pub task_id: String,
    pub completed: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct GenerateSubstepsArgs {
    pub node_id: String,
    /// Extra context for the generator, usually the startup idea.
    #[serde(default)]
    pub context: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct UpdateNodeStatusArgs {
    pub node_id: String,
    pub status: NodeStatus,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct UpdateNodeDescriptionArgs {
    pub node_id: String,
    pub description: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LimitResource {
    Roadmaps,
    Nodes,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct CheckLimitArgs {
    pub resource: LimitResource,
    /// Required when `resource` is `nodes`.
    #[serde(default)]
    pub roadmap_id: Option<String>,
}

impl CheckLimitArgs {
    fn into_kind(self) -> ServiceResult<LimitKind> {
        match (self.resource, self.roadmap_id) {
            (LimitResource::Roadmaps, _) => Ok(LimitKind::Roadmaps),
            (LimitResource::Nodes, Some(roadmap_id)) => Ok(LimitKind::Nodes { roadmap_id }),
            (LimitResource::Nodes, None) => Err(ServiceError::validation(
                "roadmap_id is required when checking the node limit",
            )),
        }
    }
}

/// Renders a service result as tool output. Domain failures become tool
/// errors the model can read, not protocol errors.
fn tool_result<T: Serialize>(result: ServiceResult<T>) -> CallToolResult {
    match result.and_then(|value| serde_json::to_string_pretty(&value).map_err(ServiceError::from))
    {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(err) => {
            tracing::debug!(error = %err, "tool call failed");
            CallToolResult::error(vec![Content::text(err.to_string())])
        }
    }
}

#[derive(Clone)]
pub struct RoadmapServer {
    tool_router: ToolRouter<Self>,
    service: Arc<RoadmapService>,
    caller: Caller,
}

#[tool_router]
impl RoadmapServer {
    pub fn new(service: Arc<RoadmapService>, caller: Caller) -> Self {
        Self {
            tool_router: Self::tool_router(),
            service,
            caller,
        }
    }

    /// Store access and LLM calls block, so every tool runs on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<CallToolResult, ErrorData>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&RoadmapService, &Caller) -> ServiceResult<T> + Send + 'static,
    {
        let service = self.service.clone();
        let caller = self.caller.clone();
        let result = tokio::task::spawn_blocking(move || op(&service, &caller))
            .await
            .map_err(|e| ErrorData::internal_error(format!("Tool task failed: {e}"), None))?;
        Ok(tool_result(result))
    }

    #[tool(
        description = "Create a roadmap from generated milestones. The first node starts as current, the rest locked."
    )]
    async fn create_roadmap(
        &self,
        Parameters(input): Parameters<RoadmapInput>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.create_roadmap(caller, input))
            .await
    }

    #[tool(description = "List the caller's roadmaps")]
    async fn list_roadmaps(&self) -> Result<CallToolResult, ErrorData> {
        self.run(|svc, caller| svc.list_roadmaps(caller)).await
    }

    #[tool(description = "Get a roadmap with its nodes in order and each node's tasks")]
    async fn get_roadmap(
        &self,
        Parameters(args): Parameters<RoadmapIdArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.get_roadmap(caller, &args.roadmap_id))
            .await
    }

    #[tool(description = "List the tasks of a node, oldest first")]
    async fn list_tasks(
        &self,
        Parameters(args): Parameters<NodeIdArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.list_tasks(caller, &args.node_id))
            .await
    }

    #[tool(description = "Add a task to a node")]
    async fn add_task(
        &self,
        Parameters(args): Parameters<AddTaskArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.add_task(caller, &args.node_id, &args.title))
            .await
    }

    #[tool(
        description = "Mark a task complete or incomplete. Recomputes the node's progress and unlocks the next node when it completes."
    )]
    async fn toggle_task(
        &self,
        Parameters(args): Parameters<ToggleTaskArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.toggle_task(caller, &args.task_id, args.completed))
            .await
    }

    #[tool(description = "Ask the AI to break a node into 3-5 tasks and add them")]
    async fn generate_substeps(
        &self,
        Parameters(args): Parameters<GenerateSubstepsArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.generate_substeps(caller, &args.node_id, &args.context))
            .await
    }

    #[tool(description = "Move a node forward (locked -> current -> complete)")]
    async fn update_node_status(
        &self,
        Parameters(args): Parameters<UpdateNodeStatusArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.update_node_status(caller, &args.node_id, args.status))
            .await
    }

    #[tool(
        description = "Append a node to the end of a roadmap. It starts locked unless the roadmap is empty or its last node is complete."
    )]
    async fn add_node(
        &self,
        Parameters(input): Parameters<AddNodeInput>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.add_node(caller, input))
            .await
    }

    #[tool(description = "Replace a node's description")]
    async fn update_node_description(
        &self,
        Parameters(args): Parameters<UpdateNodeDescriptionArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| {
            svc.update_node_description(caller, &args.node_id, &args.description)
        })
        .await
    }

    #[tool(description = "Recompute a node's progress and status from its tasks")]
    async fn recompute_node_progress(
        &self,
        Parameters(args): Parameters<NodeIdArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.recompute_node_progress(caller, &args.node_id))
            .await
    }

    #[tool(description = "Unlock the node following each completed node of a roadmap")]
    async fn sweep_roadmap(
        &self,
        Parameters(args): Parameters<RoadmapIdArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| {
            svc.sweep_roadmap(caller, &args.roadmap_id)
                .map(|unlocked| serde_json::json!({ "unlocked": unlocked }))
        })
        .await
    }

    #[tool(description = "Count a roadmap's tasks and nodes and report its completion rate")]
    async fn get_roadmap_stats(
        &self,
        Parameters(args): Parameters<RoadmapIdArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.roadmap_stats(caller, &args.roadmap_id))
            .await
    }

    #[tool(description = "Get the caller's level, derived from completed tasks")]
    async fn get_user_level(&self) -> Result<CallToolResult, ErrorData> {
        self.run(|svc, caller| svc.user_level(caller)).await
    }

    #[tool(description = "List the badges the caller has earned")]
    async fn list_badges(&self) -> Result<CallToolResult, ErrorData> {
        self.run(|svc, caller| svc.list_badges(caller)).await
    }

    #[tool(description = "Get the caller's subscription tier and status")]
    async fn get_subscription(&self) -> Result<CallToolResult, ErrorData> {
        self.run(|svc, caller| svc.subscription(caller)).await
    }

    #[tool(description = "Check whether the caller's plan allows another roadmap or node")]
    async fn check_limit(
        &self,
        Parameters(args): Parameters<CheckLimitArgs>,
    ) -> Result<CallToolResult, ErrorData> {
        self.run(move |svc, caller| svc.check_limit(caller, &args.into_kind()?))
            .await
    }
}

#[tool_handler]
impl ServerHandler for RoadmapServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: crate::metadata::PKG_NAME.to_string(),
                version: crate::metadata::PKG_VERSION.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
