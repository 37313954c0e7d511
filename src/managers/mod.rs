//! 内置管理器：洞察与人格

pub mod insight;
pub mod personality;

pub use insight::{
    InsightConfig, InsightManager, ACTOR_INSIGHTS, INSIGHT_CREATED, INSIGHT_MANAGER_ID,
    RELEVANT_INTERACTIONS, SESSION_INSIGHTS,
};
pub use personality::{Personality, PersonalityManager, BASE_PERSONALITY, PERSONALITY_MANAGER_ID};
