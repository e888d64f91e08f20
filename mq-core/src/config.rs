//! Process configuration, loaded from `MALLQUEST_*` environment
//! variables with serviceable defaults for development.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use crate::policy::TenantPolicy;

fn default_shard_count() -> usize {
    4
}

fn default_access_ttl() -> i64 {
    24 * 3_600
}

fn default_refresh_ttl() -> i64 {
    7 * 24 * 3_600
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timezone() -> String {
    "+04:00".to_string()
}

/// Per-action rate limit: max requests per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSetting {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitSetting {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    /// Parse "max/window_secs".
    fn parse(s: &str) -> Option<Self> {
        let (max, window) = s.split_once('/')?;
        Some(Self {
            max_requests: max.trim().parse().ok()?,
            window_secs: window.trim().parse().ok()?,
        })
    }
}

/// Default per-action limits from the public API contract.
pub fn default_rate_limits() -> BTreeMap<String, RateLimitSetting> {
    let mut limits = BTreeMap::new();
    for (action, setting) in [
        ("login", RateLimitSetting::new(5, 300)),
        ("refresh", RateLimitSetting::new(10, 60)),
        ("mfa_setup", RateLimitSetting::new(3, 3_600)),
        ("mfa_verify", RateLimitSetting::new(10, 300)),
        ("submit_receipt", RateLimitSetting::new(10, 60)),
        ("pos_purchase", RateLimitSetting::new(100, 60)),
        ("read_user", RateLimitSetting::new(30, 60)),
        ("gen_mission", RateLimitSetting::new(5, 300)),
        ("claim_mission", RateLimitSetting::new(30, 60)),
        ("read_board", RateLimitSetting::new(30, 60)),
    ] {
        limits.insert(action.to_string(), setting);
    }
    limits
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MallConfig {
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Sled data directory; `None` selects the in-memory store.
    #[serde(default)]
    pub data_dir: Option<String>,

    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub redis_enabled: bool,

    /// Token signing secret. Required for `serve`; startup fails
    /// without it.
    #[serde(default)]
    pub auth_secret: Option<String>,
    /// Previous secret, honored for one token lifetime after rotation.
    #[serde(default)]
    pub auth_secret_prev: Option<String>,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: i64,

    #[serde(default = "default_rate_limits")]
    pub rate_limits: BTreeMap<String, RateLimitSetting>,

    // Policy overrides applied on top of `TenantPolicy::default()`.
    #[serde(default)]
    pub policy_base_rate: Option<Decimal>,
    #[serde(default)]
    pub policy_xp_rate: Option<Decimal>,
    #[serde(default)]
    pub policy_xp_per_level: Option<u64>,
    #[serde(default)]
    pub policy_event_cap: Option<Decimal>,
    #[serde(default)]
    pub policy_max_receipt: Option<Decimal>,
    #[serde(default)]
    pub policy_suspicious_amount: Option<Decimal>,

    #[serde(default = "default_timezone")]
    pub timezone_default: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for MallConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            data_dir: None,
            redis_url: None,
            redis_enabled: false,
            auth_secret: None,
            auth_secret_prev: None,
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            rate_limits: default_rate_limits(),
            policy_base_rate: None,
            policy_xp_rate: None,
            policy_xp_per_level: None,
            policy_event_cap: None,
            policy_max_receipt: None,
            policy_suspicious_amount: None,
            timezone_default: default_timezone(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl MallConfig {
    /// Load configuration from `MALLQUEST_*` environment variables.
    ///
    /// Recognized variables:
    /// - `MALLQUEST_SHARD_COUNT`
    /// - `MALLQUEST_DATA_DIR`
    /// - `MALLQUEST_REDIS_URL`, `MALLQUEST_REDIS_ENABLED`
    /// - `MALLQUEST_AUTH_SECRET`, `MALLQUEST_AUTH_SECRET_PREV`
    /// - `MALLQUEST_ACCESS_TTL_SECS`, `MALLQUEST_REFRESH_TTL_SECS`
    /// - `MALLQUEST_RATE_LIMIT_<ACTION>` as "max/window_secs"
    /// - `MALLQUEST_POLICY_BASE_RATE`, `MALLQUEST_POLICY_XP_RATE`,
    ///   `MALLQUEST_POLICY_XP_PER_LEVEL`, `MALLQUEST_POLICY_EVENT_CAP`,
    ///   `MALLQUEST_POLICY_MAX_RECEIPT`,
    ///   `MALLQUEST_POLICY_SUSPICIOUS_AMOUNT`
    /// - `MALLQUEST_TIMEZONE_DEFAULT`
    /// - `MALLQUEST_LISTEN_ADDR`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("MALLQUEST_SHARD_COUNT") {
            config.shard_count = n.max(1);
        }
        config.data_dir = env::var("MALLQUEST_DATA_DIR").ok();
        config.redis_url = env::var("MALLQUEST_REDIS_URL").ok();
        config.redis_enabled = env::var("MALLQUEST_REDIS_ENABLED")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        config.auth_secret = env::var("MALLQUEST_AUTH_SECRET").ok();
        config.auth_secret_prev = env::var("MALLQUEST_AUTH_SECRET_PREV").ok();
        if let Some(ttl) = env_parse::<i64>("MALLQUEST_ACCESS_TTL_SECS") {
            config.access_ttl_secs = ttl;
        }
        if let Some(ttl) = env_parse::<i64>("MALLQUEST_REFRESH_TTL_SECS") {
            config.refresh_ttl_secs = ttl;
        }

        let actions: Vec<String> = config.rate_limits.keys().cloned().collect();
        for action in actions {
            let var = format!("MALLQUEST_RATE_LIMIT_{}", action.to_uppercase());
            if let Some(setting) = env::var(&var).ok().and_then(|v| RateLimitSetting::parse(&v))
            {
                config.rate_limits.insert(action, setting);
            }
        }

        config.policy_base_rate = env_parse("MALLQUEST_POLICY_BASE_RATE");
        config.policy_xp_rate = env_parse("MALLQUEST_POLICY_XP_RATE");
        config.policy_xp_per_level = env_parse("MALLQUEST_POLICY_XP_PER_LEVEL");
        config.policy_event_cap = env_parse("MALLQUEST_POLICY_EVENT_CAP");
        config.policy_max_receipt = env_parse("MALLQUEST_POLICY_MAX_RECEIPT");
        config.policy_suspicious_amount = env_parse("MALLQUEST_POLICY_SUSPICIOUS_AMOUNT");

        if let Ok(tz) = env::var("MALLQUEST_TIMEZONE_DEFAULT") {
            config.timezone_default = tz;
        }
        if let Ok(addr) = env::var("MALLQUEST_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        config
    }

    /// Default tenant policy with configuration overrides applied.
    pub fn default_policy(&self) -> TenantPolicy {
        let mut policy = TenantPolicy::default();
        if let Some(rate) = self.policy_base_rate {
            policy.base_rate = rate;
        }
        if let Some(rate) = self.policy_xp_rate {
            policy.xp_rate = rate;
        }
        if let Some(xp) = self.policy_xp_per_level {
            policy.xp_per_level = xp;
        }
        if let Some(cap) = self.policy_event_cap {
            policy.event_multiplier_cap = cap;
        }
        if let Some(max) = self.policy_max_receipt {
            policy.max_receipt_amount = max;
        }
        if let Some(amount) = self.policy_suspicious_amount {
            policy.suspicious_amount = amount;
        }
        policy.timezone = self.timezone_default.clone();
        policy
    }

    pub fn rate_limit(&self, action: &str) -> Option<RateLimitSetting> {
        self.rate_limits.get(action).copied()
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.parse().ok())
}
