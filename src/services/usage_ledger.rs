// src/services/usage_ledger.rs
// Gates and accounts for every paid-backend call against the monthly dollar
// budget. The in-memory wallet map is authoritative; persistence is mirrored
// through the best-effort write queue.
//
// Wallet mutations are read-then-write under one async lock, which is
// adequate under the single-active-session-per-user assumption. Concurrent
// multi-device writes to the same ledger are not race-free; that limitation
// is inherited deliberately rather than papered over with a lock service.

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::llm::registry::ModelRegistry;
use crate::models::plan::{PlanLimits, PlanTier, UserProfile};
use crate::models::routing::ModelTier;
use crate::models::usage::{
    AiAvailability, AvailabilityReason, FamilyLedger, UsageCategory, UserAiUsage,
};
use crate::storage::{keys, KeyValueStore, PersistenceQueue};

pub struct UsageLedger {
    config: Arc<Config>,
    registry: Arc<ModelRegistry>,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PersistenceQueue>,
    wallets: Mutex<HashMap<String, UserAiUsage>>,
    families: Mutex<HashMap<String, FamilyLedger>>,
    daily_counts: Mutex<HashMap<String, u32>>,
}

impl UsageLedger {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ModelRegistry>,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<PersistenceQueue>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            queue,
            wallets: Mutex::new(HashMap::new()),
            families: Mutex::new(HashMap::new()),
            daily_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether cloud AI is available for this user right now.
    pub async fn check_availability(&self, profile: &UserProfile) -> AiAvailability {
        self.check_availability_on(profile, Utc::now().date_naive())
            .await
    }

    /// Date-injected variant of [`check_availability`], evaluated in strict
    /// order: monthly reset, plan entitlement, hard cap, family share,
    /// soft-cap warning, legacy token ceiling, daily ceiling.
    #[instrument(skip(self, profile), fields(user = %profile.user_id))]
    pub async fn check_availability_on(
        &self,
        profile: &UserProfile,
        today: NaiveDate,
    ) -> AiAvailability {
        let mut wallets = self.wallets.lock().await;
        let wallet = self.wallet_entry(&mut wallets, profile, today).await;

        if wallet.apply_monthly_reset(today) {
            debug!("monthly wallet reset applied");
            self.persist_wallet(wallet);
        }

        // Plan entitlement is primary and can never be overridden by quota
        // math: a free plan has no cloud access to run out of.
        let effective = profile.effective_plan(today);
        if !effective.has_cloud_entitlement() {
            let reason = if profile.plan == PlanTier::Trial {
                AvailabilityReason::TrialExpired
            } else {
                AvailabilityReason::FreePlan
            };
            return AiAvailability::local_only(
                reason,
                "Your coach runs right on your device. Upgrade to unlock cloud insights.",
            );
        }

        if wallet.current_month_cost_usd >= wallet.hard_cap_usd {
            let mut denial = AiAvailability::local_only(
                AvailabilityReason::HardCapReached,
                format!(
                    "You've used this month's cloud coaching budget. Full access returns on {}.",
                    wallet.reset_date
                ),
            );
            denial.resets_on = Some(wallet.reset_date);
            return denial;
        }

        let low_balance = wallet.current_month_cost_usd >= wallet.soft_cap_usd;
        let remaining = wallet.remaining_usd();
        let reset_date = wallet.reset_date;
        drop(wallets);

        if let Some(denial) = self.check_family_share(profile, today).await {
            return denial;
        }

        let mut wallets = self.wallets.lock().await;
        let wallet = self.wallet_entry(&mut wallets, profile, today).await;

        if wallet.tokens_used >= wallet.monthly_token_budget {
            let mut denial = AiAvailability::local_only(
                AvailabilityReason::TokenBudgetExhausted,
                format!(
                    "You've reached this month's usage limit. Full access returns on {reset_date}."
                ),
            );
            denial.resets_on = Some(reset_date);
            return denial;
        }
        drop(wallets);

        let limits = PlanLimits::for_plan(effective, &self.config);
        let used_today = self.daily_count(&profile.user_id, today).await;
        if used_today >= limits.daily_message_limit {
            return AiAvailability::local_only(
                AvailabilityReason::DailyLimitReached,
                "You've hit today's coaching limit. Come back tomorrow!",
            );
        }

        let mut verdict = AiAvailability::cloud_ok(remaining);
        if low_balance {
            verdict.reason = AvailabilityReason::SoftCapWarning;
            verdict.low_balance_warning = true;
            verdict.message = format!(
                "Heads up: about ${remaining:.2} of cloud coaching left this month."
            );
        }
        verdict
    }

    /// Records a completed call. Local calls count messages only and never
    /// accrue cost. Returns the USD amount charged.
    #[instrument(skip(self, profile), fields(user = %profile.user_id))]
    pub async fn record_usage(
        &self,
        profile: &UserProfile,
        tier: ModelTier,
        prompt_tokens: u32,
        completion_tokens: u32,
        category: UsageCategory,
    ) -> f64 {
        self.record_usage_on(
            profile,
            tier,
            prompt_tokens,
            completion_tokens,
            category,
            Utc::now().date_naive(),
        )
        .await
    }

    pub async fn record_usage_on(
        &self,
        profile: &UserProfile,
        tier: ModelTier,
        prompt_tokens: u32,
        completion_tokens: u32,
        category: UsageCategory,
        today: NaiveDate,
    ) -> f64 {
        let mut wallets = self.wallets.lock().await;
        let wallet = self.wallet_entry(&mut wallets, profile, today).await;

        if tier.is_local() {
            wallet.record_local_call(category);
            self.persist_wallet(wallet);
            return 0.0;
        }

        let cost = self.charged_cost(tier, prompt_tokens, completion_tokens);
        let tokens = u64::from(prompt_tokens) + u64::from(completion_tokens);
        wallet.record_cloud_call(cost, tokens, category);
        self.persist_wallet(wallet);
        drop(wallets);

        if let Some(family_id) = &profile.family_id {
            let mut families = self.families.lock().await;
            let family = self.family_entry(&mut families, family_id, today).await;
            family.record_spend(&profile.user_id, cost);
            self.persist_family(family);
        }

        self.bump_daily_count(&profile.user_id, today).await;
        cost
    }

    /// Pre-flight affordability check for expensive scheduled calls. Never
    /// launch a call the wallet cannot afford to complete.
    pub async fn can_afford(
        &self,
        profile: &UserProfile,
        tier: ModelTier,
        estimated_prompt_tokens: u32,
        estimated_completion_tokens: u32,
    ) -> bool {
        let today = Utc::now().date_naive();
        let estimate = self.charged_cost(tier, estimated_prompt_tokens, estimated_completion_tokens);
        let mut wallets = self.wallets.lock().await;
        let wallet = self.wallet_entry(&mut wallets, profile, today).await;
        wallet.remaining_usd() >= estimate
    }

    /// Published rate times the internal markup.
    pub fn charged_cost(&self, tier: ModelTier, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.registry.raw_cost_usd(tier, prompt_tokens, completion_tokens) * self.config.cost_markup
    }

    /// Snapshot of the wallet, for status surfaces and tests.
    pub async fn wallet_snapshot(&self, profile: &UserProfile) -> UserAiUsage {
        let today = Utc::now().date_naive();
        let mut wallets = self.wallets.lock().await;
        self.wallet_entry(&mut wallets, profile, today).await.clone()
    }

    /// Both the member's slice of the family pool and their individual caps
    /// must pass; this covers the family half.
    async fn check_family_share(
        &self,
        profile: &UserProfile,
        today: NaiveDate,
    ) -> Option<AiAvailability> {
        let family_id = profile.family_id.as_ref()?;
        let role = profile.family_role?;

        let mut families = self.families.lock().await;
        let family = self.family_entry(&mut families, family_id, today).await;
        if family.apply_monthly_reset(today) {
            self.persist_family(family);
        }

        let allocation = family.member_allocation_usd(
            role,
            self.config.family_owner_share_pct,
            self.config.family_member_share_pct,
        );
        if family.member_spend(&profile.user_id) >= allocation {
            let mut denial = AiAvailability::local_only(
                AvailabilityReason::FamilyShareExhausted,
                format!(
                    "Your share of the family coaching budget is used up. It refills on {}.",
                    family.reset_date
                ),
            );
            denial.resets_on = Some(family.reset_date);
            return Some(denial);
        }
        None
    }

    async fn wallet_entry<'a>(
        &self,
        wallets: &'a mut HashMap<String, UserAiUsage>,
        profile: &UserProfile,
        today: NaiveDate,
    ) -> &'a mut UserAiUsage {
        if !wallets.contains_key(&profile.user_id) {
            let loaded = self.load_wallet(profile, today).await;
            wallets.insert(profile.user_id.clone(), loaded);
        }
        let wallet = wallets
            .get_mut(&profile.user_id)
            .expect("wallet inserted above");
        // Caps follow the current plan, not the plan at wallet creation.
        let limits = PlanLimits::for_plan(profile.effective_plan(today), &self.config);
        wallet.plan = profile.plan;
        wallet.soft_cap_usd = limits.soft_cap_usd;
        wallet.hard_cap_usd = limits.hard_cap_usd;
        wallet.monthly_token_budget = limits.monthly_token_budget;
        wallet
    }

    async fn load_wallet(&self, profile: &UserProfile, today: NaiveDate) -> UserAiUsage {
        match self.store.get(&keys::wallet(&profile.user_id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(wallet) => return wallet,
                Err(err) => warn!(%err, "stored wallet unreadable, starting fresh"),
            },
            Ok(None) => {}
            Err(err) => warn!(%err, "wallet load failed, starting fresh"),
        }
        let limits = PlanLimits::for_plan(profile.effective_plan(today), &self.config);
        UserAiUsage::new(profile.user_id.clone(), profile.plan, limits, today)
    }

    async fn family_entry<'a>(
        &self,
        families: &'a mut HashMap<String, FamilyLedger>,
        family_id: &str,
        today: NaiveDate,
    ) -> &'a mut FamilyLedger {
        if !families.contains_key(family_id) {
            let loaded = match self.store.get(&keys::family_ledger(family_id)).await {
                Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|_| {
                    FamilyLedger::new(family_id, self.config.family_pool_usd, today)
                }),
                _ => FamilyLedger::new(family_id, self.config.family_pool_usd, today),
            };
            families.insert(family_id.to_string(), loaded);
        }
        families.get_mut(family_id).expect("family inserted above")
    }

    async fn daily_count(&self, user_id: &str, today: NaiveDate) -> u32 {
        let key = keys::daily_cloud_calls(user_id, today);
        let mut counts = self.daily_counts.lock().await;
        if let Some(count) = counts.get(&key) {
            return *count;
        }
        let loaded = match self.store.get(&key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            _ => 0,
        };
        counts.insert(key, loaded);
        loaded
    }

    async fn bump_daily_count(&self, user_id: &str, today: NaiveDate) {
        let current = self.daily_count(user_id, today).await;
        let key = keys::daily_cloud_calls(user_id, today);
        let next = current + 1;
        self.daily_counts.lock().await.insert(key.clone(), next);
        self.queue.put(key, next.to_string());
    }

    fn persist_wallet(&self, wallet: &UserAiUsage) {
        match serde_json::to_string(wallet) {
            Ok(json) => self.queue.put(keys::wallet(&wallet.user_id), json),
            Err(err) => warn!(%err, "wallet serialization failed"),
        }
    }

    fn persist_family(&self, family: &FamilyLedger) {
        match serde_json::to_string(family) {
            Ok(json) => self.queue.put(keys::family_ledger(&family.family_id), json),
            Err(err) => warn!(%err, "family ledger serialization failed"),
        }
    }
}
