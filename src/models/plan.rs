// src/models/plan.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Subscription plan tiers.
///
/// `Free` and an expired `Trial` have no cloud entitlement at all: cloud
/// tiers are categorically unavailable to them, not merely rate-limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanTier {
    Free,
    Trial,
    Plus,
    Premium,
    Family,
}

impl PlanTier {
    /// Whether this tier ever gets cloud access (before quota checks).
    pub fn has_cloud_entitlement(self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Role inside a family plan, used to apportion the shared budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FamilyRole {
    Owner,
    Member,
}

/// Minimal profile the AI core needs about a user. Account data beyond this
/// is owned by the excluded auth/profile layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub plan: PlanTier,
    /// Set only for `Trial`; a past date makes the effective plan `Free`.
    pub trial_expires: Option<NaiveDate>,
    /// Set only for `Family` members.
    pub family_role: Option<FamilyRole>,
    pub family_id: Option<String>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, plan: PlanTier) -> Self {
        Self {
            user_id: user_id.into(),
            plan,
            trial_expires: None,
            family_role: None,
            family_id: None,
        }
    }

    /// The plan used for every entitlement decision. An expired trial
    /// collapses to `Free`.
    pub fn effective_plan(&self, today: NaiveDate) -> PlanTier {
        match (self.plan, self.trial_expires) {
            (PlanTier::Trial, Some(expires)) if today > expires => PlanTier::Free,
            (plan, _) => plan,
        }
    }
}

/// Budget limits for one plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub soft_cap_usd: f64,
    pub hard_cap_usd: f64,
    pub daily_message_limit: u32,
    pub monthly_token_budget: u64,
}

impl PlanLimits {
    /// Limits for a plan, from the injectable policy configuration.
    pub fn for_plan(plan: PlanTier, config: &Config) -> Self {
        match plan {
            PlanTier::Free => Self {
                soft_cap_usd: 0.0,
                hard_cap_usd: 0.0,
                daily_message_limit: 0,
                monthly_token_budget: 0,
            },
            // Trials get Plus-level budgets while active.
            PlanTier::Trial | PlanTier::Plus => Self {
                soft_cap_usd: config.plus_soft_cap_usd,
                hard_cap_usd: config.plus_hard_cap_usd,
                daily_message_limit: config.plus_daily_message_limit,
                monthly_token_budget: config.monthly_token_budget,
            },
            PlanTier::Premium | PlanTier::Family => Self {
                soft_cap_usd: config.premium_soft_cap_usd,
                hard_cap_usd: config.premium_hard_cap_usd,
                daily_message_limit: config.premium_daily_message_limit,
                monthly_token_budget: config.monthly_token_budget,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn expired_trial_collapses_to_free() {
        let mut profile = UserProfile::new("u1", PlanTier::Trial);
        profile.trial_expires = Some(date(2025, 6, 1));

        assert_eq!(profile.effective_plan(date(2025, 5, 20)), PlanTier::Trial);
        assert_eq!(profile.effective_plan(date(2025, 6, 1)), PlanTier::Trial);
        assert_eq!(profile.effective_plan(date(2025, 6, 2)), PlanTier::Free);
    }

    #[test]
    fn free_plan_has_zero_budgets() {
        let limits = PlanLimits::for_plan(PlanTier::Free, &Config::default());
        assert_eq!(limits.hard_cap_usd, 0.0);
        assert_eq!(limits.daily_message_limit, 0);
        assert!(!PlanTier::Free.has_cloud_entitlement());
    }

    #[test]
    fn premium_caps_come_from_config() {
        let config = Config::default();
        let limits = PlanLimits::for_plan(PlanTier::Premium, &config);
        assert_eq!(limits.soft_cap_usd, config.premium_soft_cap_usd);
        assert_eq!(limits.hard_cap_usd, config.premium_hard_cap_usd);
    }
}
