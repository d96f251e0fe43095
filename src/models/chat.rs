// src/models/chat.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::routing::ModelTier;

/// Where a chat request originated. Weekly reviews bias routing toward the
/// most capable tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    Chat,
    WeeklyReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Coach,
}

/// One message in a coaching session, persisted as part of session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl CoachMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// The coach persona descriptor passed to whichever backend handles the
/// request. Copy content beyond the descriptor is owned by the excluded
/// content layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachPersona {
    pub name: String,
    pub style: String,
}

impl Default for CoachPersona {
    fn default() -> Self {
        Self {
            name: "Wells".to_string(),
            style: "warm, practical, evidence-based wellness coach".to_string(),
        }
    }
}

/// The post-processed reply handed back to the (excluded) chat UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachReply {
    pub text: String,
    /// The backend that actually produced the reply, after any fallback.
    pub served_by: ModelTier,
    pub low_balance_warning: bool,
}
