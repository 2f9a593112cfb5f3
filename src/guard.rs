//! Ownership checks run before any read or write on behalf of a caller.
//!
//! Failures use one opaque message whether the id is unknown or belongs to
//! someone else, so probing ids reveals nothing.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{ServiceError, ServiceResult};
use crate::storage::Store;
use crate::types::{Node, Roadmap, Task};

const ACCESS_DENIED: &str = "Resource not found or access denied";

/// The authenticated user an operation runs for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // ULID (Crockford base32) or hyphenated UUID.
        Regex::new(
            r"^(?:[0-7][0-9A-HJKMNP-TV-Z]{25}|[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})$",
        )
        .expect("id pattern is valid")
    })
}

/// Rejects anything that is not a ULID or UUID before it reaches a store query.
pub fn validate_id(kind: &str, id: &str) -> ServiceResult<()> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(ServiceError::validation(format!("{kind} id \"{id}\" is not a valid identifier")))
    }
}

fn denied() -> ServiceError {
    ServiceError::Unauthorized(ACCESS_DENIED.to_string())
}

pub fn require_roadmap_ownership(
    store: &dyn Store,
    caller: &Caller,
    roadmap_id: &str,
) -> ServiceResult<Roadmap> {
    validate_id("Roadmap", roadmap_id)?;
    match store.get_roadmap(roadmap_id)? {
        Some(roadmap) if roadmap.user_id == caller.user_id => Ok(roadmap),
        _ => Err(denied()),
    }
}

pub fn require_node_ownership(
    store: &dyn Store,
    caller: &Caller,
    node_id: &str,
) -> ServiceResult<(Roadmap, Node)> {
    validate_id("Node", node_id)?;
    let node = store.get_node(node_id)?.ok_or_else(denied)?;
    let roadmap = require_roadmap_ownership(store, caller, &node.roadmap_id)?;
    Ok((roadmap, node))
}

pub fn require_task_ownership(
    store: &dyn Store,
    caller: &Caller,
    task_id: &str,
) -> ServiceResult<(Node, Task)> {
    validate_id("Task", task_id)?;
    let task = store.get_task(task_id)?.ok_or_else(denied)?;
    let (_, node) = require_node_ownership(store, caller, &task.node_id)?;
    Ok((node, task))
}
