// tests/coaching_flow.rs
// End-to-end coaching scenarios over mock backends.

use std::sync::Arc;

use tempfile::TempDir;

use dailywell_ai::errors::AppError;
use dailywell_ai::models::chat::{CoachMessage, MessageRole, SessionType};
use dailywell_ai::models::plan::{PlanTier, UserProfile};
use dailywell_ai::models::routing::ModelTier;
use dailywell_ai::models::usage::UsageCategory;
use dailywell_ai::storage::{keys, KeyValueStore};
use dailywell_ai::test_helpers::{build_harness, MockAiClient};

const NEXT_STEP_MARKER: &str = "Next step:";

fn forty_word_question() -> String {
    "I have been waking up exhausted every single day this month even though I go to bed \
     early, so can you look at what I am doing wrong and build a realistic evening routine \
     that actually fits my schedule"
        .to_string()
}

#[tokio::test]
async fn scenario_a_free_user_is_served_locally_at_no_cost() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always("Cloud should never see this."));
    let local = Arc::new(MockAiClient::always(
        "Better sleep starts with rhythm. Next step: set a consistent bedtime tonight.",
    ));
    let harness = build_harness(dir.path(), cloud.clone(), local.clone());

    let profile = UserProfile::new("free-user", PlanTier::Free);
    let reply = harness
        .coaching
        .send_message(&profile, "How do I sleep better?", SessionType::Chat)
        .await
        .unwrap();

    assert_eq!(reply.served_by, ModelTier::Local);
    assert_eq!(cloud.call_count().await, 0);
    assert_eq!(local.call_count().await, 1);

    let wallet = harness.ledger.wallet_snapshot(&profile).await;
    assert_eq!(wallet.current_month_cost_usd, 0.0);
    assert_eq!(wallet.local_messages.chat, 1);
    assert_eq!(wallet.cloud_messages.total(), 0);
}

#[tokio::test]
async fn scenario_b_premium_complex_question_uses_cloud_and_accrues_cost() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always(
        "Your sleep debt is real. Next step: move your last screen time 30 minutes earlier. \
         Want me to check in tomorrow?",
    ));
    let local = Arc::new(MockAiClient::always("local"));
    let harness = build_harness(dir.path(), cloud.clone(), local.clone());

    let profile = UserProfile::new("premium-user", PlanTier::Premium);
    let reply = harness
        .coaching
        .send_message(&profile, &forty_word_question(), SessionType::Chat)
        .await
        .unwrap();

    assert_eq!(reply.served_by, ModelTier::CloudStandard);
    assert_eq!(local.call_count().await, 0);

    let wallet = harness.ledger.wallet_snapshot(&profile).await;
    assert!(wallet.current_month_cost_usd > 0.0);
    assert_eq!(wallet.cloud_messages.chat, 1);

    let breaker = harness.breakers.breaker(ModelTier::CloudStandard).unwrap();
    assert_eq!(breaker.metrics().await.consecutive_failures, 0);
}

#[tokio::test]
async fn scenario_d_hard_capped_premium_user_still_gets_a_friendly_reply() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always("cloud"));
    let local = Arc::new(MockAiClient::always(
        "We can keep going together right here. Next step: log tonight's bedtime.",
    ));
    let harness = build_harness(dir.path(), cloud.clone(), local.clone());

    let profile = UserProfile::new("capped-user", PlanTier::Premium);
    // One oversized paid call drives the wallet past its hard cap.
    harness
        .ledger
        .record_usage(&profile, ModelTier::CloudPro, 1_000_000, 1_000_000, UsageCategory::Chat)
        .await;
    let wallet = harness.ledger.wallet_snapshot(&profile).await;
    assert!(wallet.current_month_cost_usd >= wallet.hard_cap_usd);

    let availability = harness.ledger.check_availability(&profile).await;
    assert!(!availability.can_use_cloud);
    assert_eq!(availability.recommended_tier, ModelTier::Local);

    let reply = harness
        .coaching
        .send_message(&profile, "Plan my training week in detail", SessionType::Chat)
        .await
        .unwrap();

    assert_eq!(reply.served_by, ModelTier::Local);
    assert!(!reply.text.is_empty());
    // The denied request never reached the cloud backend.
    assert_eq!(cloud.call_count().await, 0);
}

#[tokio::test]
async fn fallback_chain_walks_to_local_and_records_breaker_failures() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::failing());
    let local = Arc::new(MockAiClient::always(
        "Still here for you. Next step: drink a glass of water.",
    ));
    let harness = build_harness(dir.path(), cloud.clone(), local.clone());

    let profile = UserProfile::new("premium-user", PlanTier::Premium);
    let reply = harness
        .coaching
        .send_message(&profile, &forty_word_question(), SessionType::Chat)
        .await
        .unwrap();

    // CloudStandard then CloudLite fail, Local serves.
    assert_eq!(reply.served_by, ModelTier::Local);
    assert_eq!(cloud.call_count().await, 2);
    for tier in [ModelTier::CloudStandard, ModelTier::CloudLite] {
        let metrics = harness.breakers.breaker(tier).unwrap().metrics().await;
        assert_eq!(metrics.consecutive_failures, 1, "tier: {tier:?}");
    }

    // A failed cloud walk that lands on Local records a local message only.
    let wallet = harness.ledger.wallet_snapshot(&profile).await;
    assert_eq!(wallet.cloud_messages.total(), 0);
    assert_eq!(wallet.local_messages.chat, 1);
}

#[tokio::test]
async fn total_exhaustion_returns_status_text_never_an_error() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::failing());
    let local = Arc::new(MockAiClient::failing());
    let harness = build_harness(dir.path(), cloud, local);

    let profile = UserProfile::new("premium-user", PlanTier::Premium);
    let reply = harness
        .coaching
        .send_message(&profile, &forty_word_question(), SessionType::Chat)
        .await
        .unwrap();

    assert_eq!(reply.served_by, ModelTier::Local);
    assert!(!reply.text.is_empty());
    // The text describes setup state, not an exception.
    assert!(!reply.text.to_lowercase().contains("error"));
}

#[tokio::test]
async fn replies_are_normalized_to_the_next_step_shape() {
    let dir = TempDir::new().unwrap();
    // Backend rambles with no marker sentence at all.
    let cloud = Arc::new(MockAiClient::always(
        "Sleep is influenced by light, temperature, caffeine, stress, and consistency. \
         Many people underestimate caffeine half-life. Research shows evening light matters. \
         Also naps can interfere. And alcohol fragments sleep.",
    ));
    let local = Arc::new(MockAiClient::always("ok"));
    let harness = build_harness(dir.path(), cloud, local);

    let profile = UserProfile::new("premium-user", PlanTier::Premium);
    let reply = harness
        .coaching
        .send_message(&profile, "Please explain why my sleep is bad", SessionType::Chat)
        .await
        .unwrap();

    let marker_count = reply.text.matches(NEXT_STEP_MARKER).count();
    assert_eq!(marker_count, 1, "reply: {}", reply.text);
    let sentence_count = reply
        .text
        .matches(|c| matches!(c, '.' | '!' | '?'))
        .count();
    assert!((2..=3).contains(&sentence_count), "reply: {}", reply.text);
}

#[tokio::test]
async fn empty_backend_reply_falls_back_to_topic_template() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always(""));
    let local = Arc::new(MockAiClient::always("ok"));
    let harness = build_harness(dir.path(), cloud, local);

    let profile = UserProfile::new("premium-user", PlanTier::Premium);
    let reply = harness
        .coaching
        .send_message(
            &profile,
            "Please explain what is wrong with my sleep",
            SessionType::Chat,
        )
        .await
        .unwrap();

    assert!(reply.text.contains(NEXT_STEP_MARKER));
    assert!(reply.text.to_lowercase().contains("lights-out"));
}

#[tokio::test]
async fn session_history_is_appended_in_order() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always("Nice work. Next step: keep it up."));
    let local = Arc::new(MockAiClient::always("ok"));
    let harness = build_harness(dir.path(), cloud, local);

    let profile = UserProfile::new("premium-user", PlanTier::Premium);
    harness
        .coaching
        .send_message(&profile, "I walked today and it felt good somehow", SessionType::Chat)
        .await
        .unwrap();
    harness
        .coaching
        .send_message(&profile, "What should I try for tomorrow then", SessionType::Chat)
        .await
        .unwrap();
    harness.queue.shutdown().await;

    let raw = harness
        .store
        .get(&keys::session_history("premium-user"))
        .await
        .unwrap()
        .expect("history persisted");
    let history: Vec<CoachMessage> = serde_json::from_str(&raw).unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].role, MessageRole::User);
    assert!(history[0].content.contains("walked today"));
    assert_eq!(history[1].role, MessageRole::Coach);
    assert!(history[2].content.contains("tomorrow"));
}

#[tokio::test]
async fn weekly_report_downgrades_when_unaffordable() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always(
        "Strong week overall. Next step: plan three workouts for next week.",
    ));
    let local = Arc::new(MockAiClient::always(
        "Solid effort this week. Next step: pick one habit to repeat tomorrow.",
    ));
    let harness = build_harness(dir.path(), cloud.clone(), local.clone());

    let profile = UserProfile::new("premium-user", PlanTier::Premium);

    // Affordable: the report runs on the pro tier.
    let reply = harness.coaching.generate_weekly_report(&profile).await.unwrap();
    assert_eq!(reply.served_by, ModelTier::CloudPro);
    let wallet = harness.ledger.wallet_snapshot(&profile).await;
    assert_eq!(wallet.cloud_messages.report, 1);

    // Exhaust the budget; the pre-flight must stop the expensive call.
    harness
        .ledger
        .record_usage(&profile, ModelTier::CloudPro, 1_000_000, 1_000_000, UsageCategory::Chat)
        .await;
    let reply = harness.coaching.generate_weekly_report(&profile).await.unwrap();
    assert_eq!(reply.served_by, ModelTier::Local);
}

#[tokio::test]
async fn empty_message_is_rejected_as_invalid_input() {
    let dir = TempDir::new().unwrap();
    let cloud = Arc::new(MockAiClient::always("x"));
    let local = Arc::new(MockAiClient::always("x"));
    let harness = build_harness(dir.path(), cloud, local);

    let profile = UserProfile::new("u", PlanTier::Free);
    let result = harness
        .coaching
        .send_message(&profile, "   ", SessionType::Chat)
        .await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));
}
