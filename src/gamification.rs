use serde::Serialize;

use crate::storage::{Store, StoreResult};
use crate::types::BadgeType;

pub const TASKS_PER_LEVEL: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LevelInfo {
    pub level: u64,
    /// Percentage of the way to the next level.
    pub progress: u8,
    pub next_level_at: u64,
    pub total_tasks: u64,
}

/// Level 1 at zero completed tasks, one more level every [`TASKS_PER_LEVEL`].
pub fn level_for(total_tasks: u64) -> LevelInfo {
    let level = total_tasks / TASKS_PER_LEVEL + 1;
    let in_level = total_tasks % TASKS_PER_LEVEL;
    LevelInfo {
        level,
        progress: (in_level * 100 / TASKS_PER_LEVEL) as u8,
        next_level_at: level * TASKS_PER_LEVEL,
        total_tasks,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BadgeDefinition {
    #[serde(rename = "type")]
    pub badge: BadgeType,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
}

pub const BADGE_DEFINITIONS: [BadgeDefinition; 8] = [
    BadgeDefinition {
        badge: BadgeType::FirstTask,
        name: "First Step",
        description: "Completed your first task",
        icon: "🎯",
    },
    BadgeDefinition {
        badge: BadgeType::TaskMaster10,
        name: "Task Master",
        description: "Completed 10 tasks",
        icon: "⚡",
    },
    BadgeDefinition {
        badge: BadgeType::TaskMaster50,
        name: "Productivity Pro",
        description: "Completed 50 tasks",
        icon: "🏆",
    },
    BadgeDefinition {
        badge: BadgeType::NodeComplete,
        name: "Milestone Maker",
        description: "Completed your first milestone",
        icon: "🚀",
    },
    BadgeDefinition {
        badge: BadgeType::Streak3,
        name: "Getting Started",
        description: "3-day activity streak",
        icon: "🔥",
    },
    BadgeDefinition {
        badge: BadgeType::Streak7,
        name: "Week Warrior",
        description: "7-day activity streak",
        icon: "💪",
    },
    BadgeDefinition {
        badge: BadgeType::Streak30,
        name: "Unstoppable",
        description: "30-day activity streak",
        icon: "👑",
    },
    BadgeDefinition {
        badge: BadgeType::EarlyAdopter,
        name: "Early Adopter",
        description: "Joined during beta",
        icon: "✨",
    },
];

pub fn definition(badge: BadgeType) -> &'static BadgeDefinition {
    BADGE_DEFINITIONS
        .iter()
        .find(|d| d.badge == badge)
        .unwrap_or(&BADGE_DEFINITIONS[0])
}

const TASK_MILESTONES: [(u64, BadgeType); 3] = [
    (1, BadgeType::FirstTask),
    (10, BadgeType::TaskMaster10),
    (50, BadgeType::TaskMaster50),
];

/// Task-count badges the user qualifies for at `completed_tasks`.
pub fn task_badges_for(completed_tasks: u64) -> Vec<BadgeType> {
    TASK_MILESTONES
        .iter()
        .filter(|(threshold, _)| completed_tasks >= *threshold)
        .map(|(_, badge)| *badge)
        .collect()
}

/// Awards every badge in `candidates` the user does not hold yet, returning the new ones.
pub fn award_badges(
    store: &dyn Store,
    user_id: &str,
    candidates: &[BadgeType],
) -> StoreResult<Vec<BadgeType>> {
    let mut awarded = Vec::new();
    for badge in candidates {
        if store.insert_badge(user_id, *badge)? {
            tracing::info!(user_id, badge = %badge, "badge awarded");
            awarded.push(*badge);
        }
    }
    Ok(awarded)
}
