use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::storage::{StoreResult, Store};
use crate::types::UserAccount;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub roadmaps: Option<usize>,
    pub nodes_per_roadmap: Option<usize>,
}

impl Tier {
    /// Pro only counts while the subscription is active.
    pub fn of(account: Option<&UserAccount>) -> Tier {
        match account {
            Some(a)
                if a.subscription_status.as_deref() == Some("active")
                    && a.subscription_tier.as_deref() == Some("pro") =>
            {
                Tier::Pro
            }
            _ => Tier::Free,
        }
    }

    pub fn limits(&self) -> Limits {
        match self {
            Tier::Free => Limits {
                roadmaps: Some(1),
                nodes_per_roadmap: Some(5),
            },
            Tier::Pro => Limits {
                roadmaps: None,
                nodes_per_roadmap: None,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub tier: Tier,
    pub status: String,
    pub renews_at: Option<String>,
}

impl SubscriptionStatus {
    pub fn from_account(account: Option<&UserAccount>) -> Self {
        Self {
            tier: Tier::of(account),
            status: account
                .and_then(|a| a.subscription_status.clone())
                .unwrap_or_else(|| "inactive".to_string()),
            renews_at: account.and_then(|a| a.current_period_end.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimitKind {
    Roadmaps,
    Nodes { roadmap_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LimitCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    fn denied(message: String) -> Self {
        Self {
            allowed: false,
            message: Some(message),
        }
    }
}

/// Checks whether `user_id` may create one more roadmap or node.
pub fn check_resource_limit(
    store: &dyn Store,
    user_id: &str,
    kind: &LimitKind,
) -> StoreResult<LimitCheck> {
    let account = store.get_user(user_id)?;
    let limits = Tier::of(account.as_ref()).limits();

    match kind {
        LimitKind::Roadmaps => {
            let Some(max) = limits.roadmaps else {
                return Ok(LimitCheck::allowed());
            };
            if store.list_roadmaps(user_id)?.len() >= max {
                return Ok(LimitCheck::denied(format!(
                    "Free Plan limited to {max} project. Upgrade for unlimited."
                )));
            }
        }
        LimitKind::Nodes { roadmap_id } => {
            let Some(max) = limits.nodes_per_roadmap else {
                return Ok(LimitCheck::allowed());
            };
            if store.list_nodes(roadmap_id)?.len() >= max {
                return Ok(LimitCheck::denied(format!(
                    "Free Plan limited to {max} steps per project. Upgrade to add more."
                )));
            }
        }
    }
    Ok(LimitCheck::allowed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccountStore, MemoryStore};
    use crate::types::RoadmapDraft;

    fn account(tier: &str, status: &str) -> UserAccount {
        UserAccount {
            id: "u1".to_string(),
            subscription_tier: Some(tier.to_string()),
            subscription_status: Some(status.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn pro_requires_active_status() {
        assert_eq!(Tier::of(Some(&account("pro", "active"))), Tier::Pro);
        assert_eq!(Tier::of(Some(&account("pro", "canceled"))), Tier::Free);
        assert_eq!(Tier::of(Some(&account("free", "active"))), Tier::Free);
        assert_eq!(Tier::of(None), Tier::Free);
    }

    #[test]
    fn free_tier_allows_a_single_roadmap() {
        let store = MemoryStore::new();
        assert!(check_resource_limit(&store, "u1", &LimitKind::Roadmaps).unwrap().allowed);

        store
            .create_roadmap(RoadmapDraft {
                user_id: "u1".to_string(),
                title: "First".to_string(),
                idea: "idea".to_string(),
                market_summary: None,
                nodes: Vec::new(),
            })
            .unwrap();
        let check = check_resource_limit(&store, "u1", &LimitKind::Roadmaps).unwrap();
        assert!(!check.allowed);
        assert!(check.message.unwrap().contains("limited to 1 project"));

        store.upsert_user(account("pro", "active"));
        assert!(check_resource_limit(&store, "u1", &LimitKind::Roadmaps).unwrap().allowed);
    }

    #[test]
    fn subscription_status_defaults_to_inactive_free() {
        let status = SubscriptionStatus::from_account(None);
        assert_eq!(status.tier, Tier::Free);
        assert_eq!(status.status, "inactive");
        assert!(status.renews_at.is_none());
    }
}
