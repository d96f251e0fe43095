// src/models/mod.rs

pub mod chat;
pub mod plan;
pub mod routing;
pub mod usage;

pub use chat::{CoachMessage, CoachPersona, CoachReply, MessageRole, SessionType};
pub use plan::{FamilyRole, PlanLimits, PlanTier, UserProfile};
pub use routing::{BudgetMode, MessageComplexity, ModelTier, RoutingDecision};
pub use usage::{
    AiAvailability, AvailabilityReason, FamilyLedger, MessageCounters, UsageCategory, UserAiUsage,
};
