// src/models/usage.rs
// Wallet ledger types: per-user monetary/quota state and availability verdicts.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::plan::{FamilyRole, PlanLimits, PlanTier};
use super::routing::ModelTier;

/// What a paid-backend call was spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageCategory {
    Chat,
    Scan,
    Report,
}

/// Message counts broken out by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounters {
    pub chat: u32,
    pub scan: u32,
    pub report: u32,
}

impl MessageCounters {
    pub fn increment(&mut self, category: UsageCategory) {
        match category {
            UsageCategory::Chat => self.chat += 1,
            UsageCategory::Scan => self.scan += 1,
            UsageCategory::Report => self.report += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.chat + self.scan + self.report
    }
}

/// The monetary/quota ledger for one user.
///
/// `current_month_cost_usd` only ever increases within a billing period;
/// the only thing that lowers it is the scheduled monthly reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAiUsage {
    pub user_id: String,
    pub plan: PlanTier,
    pub monthly_token_budget: u64,
    pub tokens_used: u64,
    pub local_messages: MessageCounters,
    pub cloud_messages: MessageCounters,
    pub current_month_cost_usd: f64,
    pub soft_cap_usd: f64,
    pub hard_cap_usd: f64,
    pub reset_date: NaiveDate,
}

impl UserAiUsage {
    /// A fresh wallet with zero usage, resetting one month from `today`.
    pub fn new(user_id: impl Into<String>, plan: PlanTier, limits: PlanLimits, today: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            plan,
            monthly_token_budget: limits.monthly_token_budget,
            tokens_used: 0,
            local_messages: MessageCounters::default(),
            cloud_messages: MessageCounters::default(),
            current_month_cost_usd: 0.0,
            soft_cap_usd: limits.soft_cap_usd,
            hard_cap_usd: limits.hard_cap_usd,
            reset_date: next_month(today),
        }
    }

    /// Zeroes all counters and rolls the reset date forward if `today` has
    /// reached it. Idempotent: a second call in the same period is a no-op
    /// because the advanced reset date is already in the future.
    pub fn apply_monthly_reset(&mut self, today: NaiveDate) -> bool {
        if today < self.reset_date {
            return false;
        }
        self.tokens_used = 0;
        self.local_messages = MessageCounters::default();
        self.cloud_messages = MessageCounters::default();
        self.current_month_cost_usd = 0.0;
        // Roll forward until the reset date is in the future, so a wallet
        // untouched for several months lands on the right period.
        while self.reset_date <= today {
            self.reset_date = next_month(self.reset_date);
        }
        true
    }

    pub fn remaining_usd(&self) -> f64 {
        (self.hard_cap_usd - self.current_month_cost_usd).max(0.0)
    }

    pub fn record_cloud_call(&mut self, cost_usd: f64, tokens: u64, category: UsageCategory) {
        debug_assert!(cost_usd >= 0.0);
        self.current_month_cost_usd += cost_usd;
        self.tokens_used += tokens;
        self.cloud_messages.increment(category);
    }

    pub fn record_local_call(&mut self, category: UsageCategory) {
        self.local_messages.increment(category);
    }
}

/// One calendar month later, day clamped to the target month's length
/// (Jan 31 -> Feb 28/29).
pub fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    for day in (1..=date.day()).rev() {
        if let Some(next) = NaiveDate::from_ymd_opt(year, month, day) {
            return next;
        }
    }
    // day >= 1 always yields a valid date above.
    unreachable!("no valid day in month {year}-{month}")
}

/// Why cloud access was granted or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityReason {
    Ok,
    SoftCapWarning,
    FreePlan,
    TrialExpired,
    HardCapReached,
    TokenBudgetExhausted,
    DailyLimitReached,
    FamilyShareExhausted,
}

/// The ledger's verdict for one user, returned as a value — never an error.
/// `message` is always forward-looking, user-facing text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAvailability {
    pub can_use_cloud: bool,
    pub recommended_tier: ModelTier,
    pub reason: AvailabilityReason,
    pub message: String,
    pub remaining_usd: Option<f64>,
    pub resets_on: Option<NaiveDate>,
    pub low_balance_warning: bool,
}

impl AiAvailability {
    pub fn cloud_ok(remaining_usd: f64) -> Self {
        Self {
            can_use_cloud: true,
            recommended_tier: ModelTier::CloudLite,
            reason: AvailabilityReason::Ok,
            message: "Your coach is ready.".to_string(),
            remaining_usd: Some(remaining_usd),
            resets_on: None,
            low_balance_warning: false,
        }
    }

    pub fn local_only(reason: AvailabilityReason, message: impl Into<String>) -> Self {
        Self {
            can_use_cloud: false,
            recommended_tier: ModelTier::Local,
            reason,
            message: message.into(),
            remaining_usd: None,
            resets_on: None,
            low_balance_warning: false,
        }
    }
}

/// Optional shared ledger for family plans. The pool is apportioned across
/// members with per-role percentage shares; a member's cloud call must fit
/// inside both their slice and their individual caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyLedger {
    pub family_id: String,
    pub monthly_pool_usd: f64,
    pub member_spend_usd: HashMap<String, f64>,
    pub reset_date: NaiveDate,
}

impl FamilyLedger {
    pub fn new(family_id: impl Into<String>, monthly_pool_usd: f64, today: NaiveDate) -> Self {
        Self {
            family_id: family_id.into(),
            monthly_pool_usd,
            member_spend_usd: HashMap::new(),
            reset_date: next_month(today),
        }
    }

    /// Dollar slice allocated to one member by role share.
    pub fn member_allocation_usd(&self, role: FamilyRole, owner_pct: f64, member_pct: f64) -> f64 {
        let pct = match role {
            FamilyRole::Owner => owner_pct,
            FamilyRole::Member => member_pct,
        };
        self.monthly_pool_usd * pct / 100.0
    }

    pub fn member_spend(&self, user_id: &str) -> f64 {
        self.member_spend_usd.get(user_id).copied().unwrap_or(0.0)
    }

    pub fn record_spend(&mut self, user_id: &str, cost_usd: f64) {
        *self.member_spend_usd.entry(user_id.to_string()).or_insert(0.0) += cost_usd;
    }

    pub fn apply_monthly_reset(&mut self, today: NaiveDate) -> bool {
        if today < self.reset_date {
            return false;
        }
        self.member_spend_usd.clear();
        while self.reset_date <= today {
            self.reset_date = next_month(self.reset_date);
        }
        true
    }
}
