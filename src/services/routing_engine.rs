// src/services/routing_engine.rs
// Per-request backend selection: complexity classification, plan gating,
// budget-aware tier choice, and fallback chain construction.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::llm::fallback::BreakerSet;
use crate::llm::registry::ModelRegistry;
use crate::models::chat::SessionType;
use crate::models::plan::PlanTier;
use crate::models::routing::{BudgetMode, MessageComplexity, ModelTier, RoutingDecision};
use crate::models::usage::AiAvailability;

/// Report/summary requests that warrant the most capable tier.
const HEAVY_KEYWORDS: &[&str] = &[
    "summary",
    "summarize",
    "analyze",
    "analysis",
    "report",
    "review my week",
    "my progress",
    "trends",
];

/// Deep-personalization or explanation requests.
const COMPLEX_KEYWORDS: &[&str] = &[
    "why",
    "explain",
    "plan for me",
    "personalized",
    "tailored",
    "in depth",
    "specifically for me",
    "based on my",
];

/// Greetings and acknowledgments the local model handles fine.
const SIMPLE_PATTERNS: &[&str] = &[
    "hi", "hey", "hello", "thanks", "thank you", "ok", "okay", "yes", "no", "cool", "great",
    "good morning", "good night", "nice",
];

const SIMPLE_MAX_WORDS: usize = 3;
const COMPLEX_MIN_WORDS: usize = 30;

/// Output budget when the wallet is in constrained mode.
const CONSTRAINED_MAX_OUTPUT_TOKENS: u32 = 256;

pub struct AiRoutingEngine {
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerSet>,
}

impl AiRoutingEngine {
    pub fn new(registry: Arc<ModelRegistry>, breakers: Arc<BreakerSet>) -> Self {
        Self { registry, breakers }
    }

    /// Heuristic complexity bucket for one message.
    pub fn classify(&self, text: &str, session_type: SessionType) -> MessageComplexity {
        let lowered = text.trim().to_lowercase();
        let words = lowered.split_whitespace().count();

        if session_type == SessionType::WeeklyReview
            || HEAVY_KEYWORDS.iter().any(|kw| lowered.contains(kw))
        {
            return MessageComplexity::Heavy;
        }
        if words <= SIMPLE_MAX_WORDS
            || SIMPLE_PATTERNS
                .iter()
                .any(|p| lowered == *p || lowered.trim_end_matches('!') == *p)
        {
            return MessageComplexity::Simple;
        }
        if words > COMPLEX_MIN_WORDS || COMPLEX_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return MessageComplexity::Complex;
        }
        MessageComplexity::Moderate
    }

    /// Computes a fresh routing decision for one request.
    ///
    /// Plan gating is primary: without cloud entitlement (free plan, expired
    /// trial, or a wallet denial) the local tier is chosen unconditionally,
    /// whatever the classified complexity.
    #[instrument(skip(self, availability, text))]
    pub async fn decide(
        &self,
        effective_plan: PlanTier,
        availability: &AiAvailability,
        text: &str,
        session_type: SessionType,
    ) -> RoutingDecision {
        let complexity = self.classify(text, session_type);

        if !effective_plan.has_cloud_entitlement() || !availability.can_use_cloud {
            return RoutingDecision {
                tier: ModelTier::Local,
                fallback_chain: Vec::new(),
                budget_mode: BudgetMode::Normal,
                complexity,
                max_output_tokens: self.registry.capabilities(ModelTier::Local).max_output_tokens,
            };
        }

        let budget_mode = if availability.low_balance_warning {
            BudgetMode::Constrained
        } else {
            BudgetMode::Normal
        };

        let mut desired = match complexity {
            MessageComplexity::Simple => ModelTier::Local,
            MessageComplexity::Moderate => ModelTier::CloudLite,
            MessageComplexity::Complex => ModelTier::CloudStandard,
            MessageComplexity::Heavy => ModelTier::CloudPro,
        };

        // Low balance: shave one tier off the cloud choice.
        if budget_mode == BudgetMode::Constrained && !desired.is_local() {
            if let Some(cheaper) = desired.next_cheaper() {
                if !cheaper.is_local() {
                    desired = cheaper;
                }
            }
        }

        // Skip down past tripped tiers so the primary choice is attemptable.
        let mut tier = desired;
        while !tier.is_local() && !self.breakers.tier_available(tier).await {
            debug!(?tier, "tier excluded by circuit breaker");
            tier = tier.next_cheaper().unwrap_or(ModelTier::Local);
        }

        let fallback_chain = self.build_fallback_chain(tier).await;
        let max_output_tokens = match budget_mode {
            BudgetMode::Normal => self.registry.capabilities(tier).max_output_tokens,
            BudgetMode::Constrained => self
                .registry
                .capabilities(tier)
                .max_output_tokens
                .min(CONSTRAINED_MAX_OUTPUT_TOKENS),
        };

        RoutingDecision {
            tier,
            fallback_chain,
            budget_mode,
            complexity,
            max_output_tokens,
        }
    }

    /// Progressively cheaper alternatives, excluding tripped tiers, always
    /// terminated by the local tier.
    async fn build_fallback_chain(&self, from: ModelTier) -> Vec<ModelTier> {
        let mut chain = Vec::new();
        let mut tier = from;
        while let Some(next) = tier.next_cheaper() {
            if next.is_local() || self.breakers.tier_available(next).await {
                chain.push(next);
            }
            tier = next;
        }
        if from != ModelTier::Local && chain.last() != Some(&ModelTier::Local) {
            chain.push(ModelTier::Local);
        }
        chain
    }
}
