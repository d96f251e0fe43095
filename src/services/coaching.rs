// src/services/coaching.rs
// The coaching façade: context assembly, wallet check, routing, execution
// with fallback, reply shaping, and history bookkeeping. Called by the
// (excluded) chat UI.
//
// Within one session, messages are appended in submission order; the UI is
// assumed to hold a single active session per user, so no cross-device
// ordering is enforced here.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::errors::AppError;
use crate::llm::fallback::BreakerSet;
use crate::llm::local::acquisition::ModelAcquisition;
use crate::llm::local::DownloadState;
use crate::llm::registry::ModelRegistry;
use crate::llm::{AiClient, CompletionRequest, CompletionResponse};
use crate::models::chat::{CoachMessage, CoachPersona, CoachReply, MessageRole, SessionType};
use crate::models::routing::{ModelTier, RoutingDecision};
use crate::models::usage::UsageCategory;
use crate::models::UserProfile;
use crate::services::routing_engine::AiRoutingEngine;
use crate::services::usage_ledger::UsageLedger;
use crate::storage::{keys, KeyValueStore, PersistenceQueue};

/// Marker that opens the single concrete-action sentence in every reply.
const NEXT_STEP_MARKER: &str = "Next step:";

/// Token estimates for the weekly report pre-flight affordability check.
const REPORT_EST_PROMPT_TOKENS: u32 = 2_000;
const REPORT_EST_COMPLETION_TOKENS: u32 = 1_200;

pub struct CoachingService {
    config: Arc<Config>,
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerSet>,
    router: AiRoutingEngine,
    ledger: Arc<UsageLedger>,
    cloud_client: Arc<dyn AiClient>,
    local_client: Arc<dyn AiClient>,
    acquisition: Arc<ModelAcquisition>,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PersistenceQueue>,
    persona: CoachPersona,
    /// Authoritative session history; the store is an async mirror.
    history_cache: Mutex<HashMap<String, Vec<CoachMessage>>>,
}

impl CoachingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ModelRegistry>,
        breakers: Arc<BreakerSet>,
        ledger: Arc<UsageLedger>,
        cloud_client: Arc<dyn AiClient>,
        local_client: Arc<dyn AiClient>,
        acquisition: Arc<ModelAcquisition>,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<PersistenceQueue>,
        persona: CoachPersona,
    ) -> Self {
        let router = AiRoutingEngine::new(registry.clone(), breakers.clone());
        Self {
            config,
            registry,
            breakers,
            router,
            ledger,
            cloud_client,
            local_client,
            acquisition,
            store,
            queue,
            persona,
            history_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one user message end to end. Denial and failure paths still
    /// produce a friendly reply; this never surfaces a raw error to the UI.
    #[instrument(skip(self, profile, text), fields(user = %profile.user_id))]
    pub async fn send_message(
        &self,
        profile: &UserProfile,
        text: &str,
        session_type: SessionType,
    ) -> Result<CoachReply, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidInput("empty message".to_string()));
        }

        let context = self.build_context(profile).await;
        let availability = self.ledger.check_availability(profile).await;
        let today = chrono::Utc::now().date_naive();
        let decision = self
            .router
            .decide(profile.effective_plan(today), &availability, text, session_type)
            .await;
        debug!(?decision.tier, ?decision.complexity, "routing decided");

        let request = CompletionRequest {
            prompt: text.to_string(),
            system_prompt: self.build_system_prompt(&context),
            max_output_tokens: decision.max_output_tokens,
            temperature: 0.7,
        };

        let category = match session_type {
            SessionType::Chat => UsageCategory::Chat,
            SessionType::WeeklyReview => UsageCategory::Report,
        };

        let (served_by, reply_text) = match self.execute_with_fallback(&decision, request).await {
            Some((tier, response)) => {
                self.ledger
                    .record_usage(
                        profile,
                        tier,
                        response.prompt_tokens,
                        response.completion_tokens,
                        category,
                    )
                    .await;
                (tier, self.normalize_reply(&response.text, text))
            }
            None => (ModelTier::Local, self.degraded_reply()),
        };

        self.append_history(profile, text, &reply_text).await;

        Ok(CoachReply {
            text: reply_text,
            served_by,
            low_balance_warning: availability.low_balance_warning,
        })
    }

    /// Long-form weekly report. Pre-flights affordability before launching
    /// the expensive call so it is never started and then cut off mid-spend.
    pub async fn generate_weekly_report(&self, profile: &UserProfile) -> Result<CoachReply, AppError> {
        let affordable = self
            .ledger
            .can_afford(
                profile,
                ModelTier::CloudPro,
                REPORT_EST_PROMPT_TOKENS,
                REPORT_EST_COMPLETION_TOKENS,
            )
            .await;
        if !affordable {
            debug!("weekly report deferred: insufficient budget headroom");
            return self
                .send_message(
                    profile,
                    "Give me a short recap of my week",
                    SessionType::Chat,
                )
                .await;
        }
        self.send_message(
            profile,
            "Give me a summary and analysis of my week across habits, sleep, and workouts",
            SessionType::WeeklyReview,
        )
        .await
    }

    /// Stores a long-term memory used in future context summaries. Not on
    /// the chat hot path, so this writes through synchronously.
    pub async fn remember(&self, profile: &UserProfile, note: &str) -> Result<(), AppError> {
        let key = keys::memories(&profile.user_id);
        let mut memories: Vec<String> = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        memories.push(note.trim().to_string());
        self.store.put(&key, serde_json::to_string(&memories)?).await
    }

    /// Walks primary choice plus fallback chain, recording breaker outcomes.
    /// Returns `None` only when every tier, local included, has failed.
    async fn execute_with_fallback(
        &self,
        decision: &RoutingDecision,
        request: CompletionRequest,
    ) -> Option<(ModelTier, CompletionResponse)> {
        let mut tiers = Vec::with_capacity(1 + decision.fallback_chain.len());
        tiers.push(decision.tier);
        tiers.extend(decision.fallback_chain.iter().copied());

        for tier in tiers {
            if !tier.is_local() && !self.breakers.tier_available(tier).await {
                if let Some(breaker) = self.breakers.breaker(tier) {
                    breaker.record_attempt_blocked().await;
                }
                continue;
            }

            let client = if tier.is_local() {
                &self.local_client
            } else {
                &self.cloud_client
            };
            let model_id = self.registry.model_id(tier);

            match client.complete(model_id, request.clone()).await {
                Ok(response) => {
                    self.breakers.record_success(tier).await;
                    return Some((tier, response));
                }
                Err(err) => {
                    warn!(?tier, %err, "backend failed, walking fallback chain");
                    self.breakers.record_failure(tier).await;
                }
            }
        }
        None
    }

    /// Deterministic user-facing text for total exhaustion, derived from the
    /// model acquisition state. Never a raw error.
    fn degraded_reply(&self) -> String {
        match self.acquisition.state() {
            DownloadState::Completed => {
                "Your coach is catching its breath. Give it another try in a moment.".to_string()
            }
            state => state.user_message(),
        }
    }

    async fn build_context(&self, profile: &UserProfile) -> String {
        let mut parts = Vec::new();

        if let Ok(Some(raw)) = self.store.get(&keys::memories(&profile.user_id)).await {
            if let Ok(memories) = serde_json::from_str::<Vec<String>>(&raw) {
                if !memories.is_empty() {
                    parts.push(format!("Known about this user: {}", memories.join("; ")));
                }
            }
        }

        let history = self.load_history(profile).await;
        let recent: Vec<String> = history
            .iter()
            .rev()
            .take(self.config.history_messages_in_context)
            .rev()
            .map(|m| {
                let who = match m.role {
                    MessageRole::User => "User",
                    MessageRole::Coach => "Coach",
                };
                format!("{who}: {}", m.content)
            })
            .collect();
        if !recent.is_empty() {
            parts.push(format!("Recent conversation:\n{}", recent.join("\n")));
        }

        let mut context = parts.join("\n\n");
        if context.len() > self.config.context_max_chars {
            // Keep the tail: the most recent turns matter most.
            let cut = context.len() - self.config.context_max_chars;
            let boundary = context
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= cut)
                .unwrap_or(0);
            context = context.split_off(boundary);
        }
        context
    }

    fn build_system_prompt(&self, context: &str) -> String {
        let mut prompt = format!(
            "You are {}, a {}. Reply in 2-3 sentences. Exactly one sentence must start with \
             \"{NEXT_STEP_MARKER}\" and name one concrete action. You may end with one short question.",
            self.persona.name, self.persona.style
        );
        if !context.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(context);
        }
        prompt
    }

    /// Normalizes any backend's raw reply into the fixed presentation shape:
    /// 2-3 sentences with exactly one next-step sentence. Empty or malformed
    /// output falls back to a template keyed off the user's message.
    fn normalize_reply(&self, raw: &str, user_text: &str) -> String {
        let sentences = split_sentences(raw);
        if sentences.is_empty() {
            return format!(
                "Got it. {} What feels doable today?",
                templated_next_step(user_text)
            );
        }

        let mut body: Vec<String> = Vec::new();
        let mut next_step: Option<String> = None;
        for sentence in sentences {
            if sentence.starts_with(NEXT_STEP_MARKER) {
                // Keep only the first next-step sentence the backend produced.
                if next_step.is_none() {
                    next_step = Some(sentence);
                }
            } else {
                body.push(sentence);
            }
        }

        let next_step = next_step.unwrap_or_else(|| templated_next_step(user_text));
        let trailing_question = body.last().map(|s| s.ends_with('?')).unwrap_or(false);

        let mut out: Vec<String> = Vec::new();
        if trailing_question && body.len() >= 2 {
            out.push(body[0].clone());
            out.push(next_step);
            out.push(body[body.len() - 1].clone());
        } else {
            out.extend(body.into_iter().take(2));
            out.push(next_step);
        }
        if out.len() < 2 {
            out.insert(0, "Got it.".to_string());
        }
        out.truncate(3);
        out.join(" ")
    }

    /// Session history from the in-memory cache, hydrated from the store on
    /// first access after a restart.
    async fn load_history(&self, profile: &UserProfile) -> Vec<CoachMessage> {
        let mut cache = self.history_cache.lock().await;
        if let Some(history) = cache.get(&profile.user_id) {
            return history.clone();
        }
        let loaded: Vec<CoachMessage> = match self
            .store
            .get(&keys::session_history(&profile.user_id))
            .await
        {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            _ => Vec::new(),
        };
        cache.insert(profile.user_id.clone(), loaded.clone());
        loaded
    }

    async fn append_history(&self, profile: &UserProfile, user_text: &str, reply_text: &str) {
        // Hydrate the cache before mutating so a restart doesn't clobber
        // persisted history.
        self.load_history(profile).await;
        let mut cache = self.history_cache.lock().await;
        let history = cache.entry(profile.user_id.clone()).or_default();
        history.push(CoachMessage::new(MessageRole::User, user_text));
        history.push(CoachMessage::new(MessageRole::Coach, reply_text));
        match serde_json::to_string(history) {
            Ok(json) => self.queue.put(keys::session_history(&profile.user_id), json),
            Err(err) => warn!(%err, "session history serialization failed"),
        }
    }
}

/// Splits text into trimmed sentences, keeping terminal punctuation.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.trim().chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(format!("{trimmed}."));
    }
    sentences
}

/// Canned next-step suggestions keyed by topic words in the user's message,
/// used when a backend returns nothing usable.
fn templated_next_step(user_text: &str) -> String {
    let lowered = user_text.to_lowercase();
    let step = if lowered.contains("sleep") || lowered.contains("tired") {
        "pick a consistent lights-out time tonight and charge your phone outside the bedroom"
    } else if lowered.contains("stress") || lowered.contains("anxious") || lowered.contains("calm") {
        "take five slow breaths, four counts in and six counts out"
    } else if lowered.contains("eat") || lowered.contains("food") || lowered.contains("meal") || lowered.contains("nutrition") {
        "add one palm-sized portion of protein to your next meal"
    } else if lowered.contains("workout") || lowered.contains("exercise") || lowered.contains("run") || lowered.contains("gym") {
        "schedule a 10-minute walk before lunch today"
    } else if lowered.contains("water") || lowered.contains("hydrat") {
        "fill a water bottle now and keep it within reach"
    } else {
        "write down one small win from today before bed"
    };
    format!("{NEXT_STEP_MARKER} {step}.")
}
