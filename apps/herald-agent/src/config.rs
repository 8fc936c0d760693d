//! Env-driven runtime configuration.
//!
//! All knobs default to usable values; `HERALD_*` variables override them.
//! Parsed once at startup into an immutable [`Config`] held by `AppState`.

use serde::Serialize;

use crate::budget::BudgetCheckPolicy;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Daily activity target (posts + replies).
    pub daily_target: u64,
    pub cycle_min_minutes: u64,
    pub cycle_max_minutes: u64,
    /// Shorter fixed wait once the day's quota is met.
    pub quota_met_wait_minutes: u64,
    pub max_actions_per_cycle: u64,
    pub max_posts_per_cycle: u64,
    pub min_post_gap_minutes: u64,
    pub max_generation_attempts: u32,
    pub min_candidate_chars: usize,

    pub digest_min_score: f64,
    pub digest_max_intake: usize,

    pub budget_enabled: bool,
    pub budget_daily_max_usd: f64,
    pub read_cost_usd: f64,
    pub create_cost_usd: f64,
    pub read_daily_limit: u64,
    pub create_daily_limit: u64,
    pub read_min_interval_minutes: u64,
    pub create_min_interval_minutes: u64,

    /// Fixed offset string such as `+09:00`; drives bucket keys and pacing.
    pub timezone_offset: String,
    pub enforce_korean_posts: bool,
    pub risk_threshold: u32,
    pub budget_ceiling_ratio: f64,
    pub mandate_onchain_evidence: bool,
    pub mandate_cross_source: bool,

    /// When set, the dispatcher logs instead of performing side effects.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daily_target: 7,
            cycle_min_minutes: 35,
            cycle_max_minutes: 80,
            quota_met_wait_minutes: 20,
            max_actions_per_cycle: 3,
            max_posts_per_cycle: 2,
            min_post_gap_minutes: 45,
            max_generation_attempts: 3,
            min_candidate_chars: 40,
            digest_min_score: 0.5,
            digest_max_intake: 6,
            budget_enabled: true,
            budget_daily_max_usd: 1.4,
            read_cost_usd: 0.005,
            create_cost_usd: 0.02,
            read_daily_limit: 160,
            create_daily_limit: 24,
            read_min_interval_minutes: 2,
            create_min_interval_minutes: 8,
            timezone_offset: "+09:00".to_string(),
            enforce_korean_posts: true,
            risk_threshold: 6,
            budget_ceiling_ratio: 0.92,
            mandate_onchain_evidence: false,
            mandate_cross_source: false,
            dry_run: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            daily_target: env_u64("HERALD_DAILY_TARGET", defaults.daily_target),
            cycle_min_minutes: env_u64("HERALD_CYCLE_MIN_MINUTES", defaults.cycle_min_minutes),
            cycle_max_minutes: env_u64("HERALD_CYCLE_MAX_MINUTES", defaults.cycle_max_minutes),
            quota_met_wait_minutes: env_u64(
                "HERALD_QUOTA_MET_WAIT_MINUTES",
                defaults.quota_met_wait_minutes,
            ),
            max_actions_per_cycle: env_u64(
                "HERALD_MAX_ACTIONS_PER_CYCLE",
                defaults.max_actions_per_cycle,
            ),
            max_posts_per_cycle: env_u64(
                "HERALD_MAX_POSTS_PER_CYCLE",
                defaults.max_posts_per_cycle,
            ),
            min_post_gap_minutes: env_u64(
                "HERALD_MIN_POST_GAP_MINUTES",
                defaults.min_post_gap_minutes,
            ),
            max_generation_attempts: env_u64(
                "HERALD_MAX_GENERATION_ATTEMPTS",
                defaults.max_generation_attempts as u64,
            ) as u32,
            min_candidate_chars: env_u64(
                "HERALD_MIN_CANDIDATE_CHARS",
                defaults.min_candidate_chars as u64,
            ) as usize,
            digest_min_score: env_f64("HERALD_DIGEST_MIN_SCORE", defaults.digest_min_score),
            digest_max_intake: env_u64(
                "HERALD_DIGEST_MAX_INTAKE",
                defaults.digest_max_intake as u64,
            ) as usize,
            budget_enabled: env_bool("HERALD_BUDGET_ENABLED", defaults.budget_enabled),
            budget_daily_max_usd: env_f64(
                "HERALD_BUDGET_DAILY_USD",
                defaults.budget_daily_max_usd,
            ),
            read_cost_usd: env_f64("HERALD_READ_COST_USD", defaults.read_cost_usd),
            create_cost_usd: env_f64("HERALD_CREATE_COST_USD", defaults.create_cost_usd),
            read_daily_limit: env_u64("HERALD_READ_DAILY_LIMIT", defaults.read_daily_limit),
            create_daily_limit: env_u64("HERALD_CREATE_DAILY_LIMIT", defaults.create_daily_limit),
            read_min_interval_minutes: env_u64(
                "HERALD_READ_MIN_INTERVAL_MINUTES",
                defaults.read_min_interval_minutes,
            ),
            create_min_interval_minutes: env_u64(
                "HERALD_CREATE_MIN_INTERVAL_MINUTES",
                defaults.create_min_interval_minutes,
            ),
            timezone_offset: env_string("HERALD_TIMEZONE_OFFSET", &defaults.timezone_offset),
            enforce_korean_posts: env_bool(
                "HERALD_ENFORCE_KOREAN",
                defaults.enforce_korean_posts,
            ),
            risk_threshold: env_u64("HERALD_RISK_THRESHOLD", defaults.risk_threshold as u64)
                as u32,
            budget_ceiling_ratio: env_f64(
                "HERALD_BUDGET_CEILING_RATIO",
                defaults.budget_ceiling_ratio,
            ),
            mandate_onchain_evidence: env_bool(
                "HERALD_MANDATE_ONCHAIN_EVIDENCE",
                defaults.mandate_onchain_evidence,
            ),
            mandate_cross_source: env_bool(
                "HERALD_MANDATE_CROSS_SOURCE",
                defaults.mandate_cross_source,
            ),
            dry_run: env_bool("HERALD_DRY_RUN", defaults.dry_run),
        }
    }

    /// Admission policy for a read-class request of the given kind.
    pub fn read_policy(&self, kind: &str) -> BudgetCheckPolicy {
        BudgetCheckPolicy {
            enabled: self.budget_enabled,
            timezone: self.timezone_offset.clone(),
            daily_max_usd: self.budget_daily_max_usd,
            estimated_cost_usd: self.read_cost_usd,
            daily_request_limit: self.read_daily_limit,
            kind: kind.to_string(),
            min_interval_minutes: self.read_min_interval_minutes,
        }
    }

    /// Admission policy for a create-class request of the given kind.
    pub fn create_policy(&self, kind: &str) -> BudgetCheckPolicy {
        BudgetCheckPolicy {
            enabled: self.budget_enabled,
            timezone: self.timezone_offset.clone(),
            daily_max_usd: self.budget_daily_max_usd,
            estimated_cost_usd: self.create_cost_usd,
            daily_request_limit: self.create_daily_limit,
            kind: kind.to_string(),
            min_interval_minutes: self.create_min_interval_minutes,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|raw| {
            let trimmed = raw.trim();
            !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false"))
        })
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env;

    #[test]
    fn defaults_without_env() {
        let mut guard = env::guard();
        guard.remove("HERALD_DAILY_TARGET");
        guard.remove("HERALD_BUDGET_DAILY_USD");
        let cfg = Config::from_env();
        assert_eq!(cfg.daily_target, 7);
        assert!((cfg.budget_daily_max_usd - 1.4).abs() < f64::EPSILON);
        assert!(cfg.enforce_korean_posts);
    }

    #[test]
    fn env_overrides_apply() {
        let mut guard = env::guard();
        guard.set("HERALD_DAILY_TARGET", "12");
        guard.set("HERALD_BUDGET_DAILY_USD", "2.5");
        guard.set("HERALD_ENFORCE_KOREAN", "false");
        guard.set("HERALD_TIMEZONE_OFFSET", "+02:00");
        let cfg = Config::from_env();
        assert_eq!(cfg.daily_target, 12);
        assert!((cfg.budget_daily_max_usd - 2.5).abs() < f64::EPSILON);
        assert!(!cfg.enforce_korean_posts);
        assert_eq!(cfg.timezone_offset, "+02:00");
    }

    #[test]
    fn malformed_values_fall_back() {
        let mut guard = env::guard();
        guard.set("HERALD_DAILY_TARGET", "many");
        guard.set("HERALD_READ_COST_USD", "cheap");
        let cfg = Config::from_env();
        assert_eq!(cfg.daily_target, 7);
        assert!((cfg.read_cost_usd - 0.005).abs() < f64::EPSILON);
    }

    #[test]
    fn policies_carry_class_costs() {
        let cfg = Config::default();
        let read = cfg.read_policy("signals.news");
        assert_eq!(read.kind, "signals.news");
        assert!((read.estimated_cost_usd - cfg.read_cost_usd).abs() < f64::EPSILON);
        let create = cfg.create_policy("post.create");
        assert_eq!(create.daily_request_limit, cfg.create_daily_limit);
        assert!((create.estimated_cost_usd - cfg.create_cost_usd).abs() < f64::EPSILON);
    }
}
