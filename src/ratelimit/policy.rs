//! Quota policy table.
//!
//! Maps a quota class and caller tier to the [`QuotaConfig`] enforced for it.
//! The table is validated once at construction and is read-only afterwards.
//! Unknown classes resolve to the [`GLOBAL_CLASS`] entry of the same tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{QuotaError, Result};

/// Class whose policy applies to every class the table does not define.
pub const GLOBAL_CLASS: &str = "global";

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 3600;

/// Quota-checking algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Count requests per aligned window
    #[default]
    FixedWindow,
    /// Track request timestamps over a trailing window
    SlidingWindow,
    /// Refill tokens continuously at `limit / window`
    TokenBucket,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::FixedWindow => write!(f, "fixed_window"),
            Strategy::SlidingWindow => write!(f, "sliding_window"),
            Strategy::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

/// Caller classification selecting which policy applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    Premium,
}

impl Tier {
    /// Both tiers, standard first.
    pub const ALL: [Tier; 2] = [Tier::Standard, Tier::Premium];

    /// Map the caller's premium flag to a tier.
    pub fn from_premium(premium: bool) -> Self {
        if premium {
            Tier::Premium
        } else {
            Tier::Standard
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Standard => write!(f, "standard"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

/// Limit, window and algorithm for one class and tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Algorithm used to enforce the limit
    #[serde(default)]
    pub strategy: Strategy,
    /// Token bucket capacity; defaults to `limit`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,
}

impl QuotaConfig {
    /// A fixed-window quota.
    pub const fn fixed_window(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
            strategy: Strategy::FixedWindow,
            burst: None,
        }
    }

    /// A sliding-window quota.
    pub const fn sliding_window(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
            strategy: Strategy::SlidingWindow,
            burst: None,
        }
    }

    /// A token-bucket quota with an optional burst capacity.
    pub const fn token_bucket(limit: u64, window_seconds: u64, burst: Option<u64>) -> Self {
        Self {
            limit,
            window_seconds,
            strategy: Strategy::TokenBucket,
            burst,
        }
    }

    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Maximum number of tokens a bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.limit as f64 / self.window_seconds as f64
    }

    fn validate(&self, class: &str, tier: Tier) -> Result<()> {
        if self.limit == 0 || self.window_seconds == 0 || self.burst == Some(0) {
            return Err(QuotaError::Config(format!(
                "quota class '{}' ({}): limit, window_seconds and burst must be greater than zero",
                class, tier
            )));
        }
        if self.window_seconds > MAX_WINDOW_SECONDS {
            return Err(QuotaError::Config(format!(
                "quota class '{}' ({}): window_seconds must be at most {}",
                class, tier, MAX_WINDOW_SECONDS
            )));
        }
        Ok(())
    }
}

/// The standard and premium policies of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierQuotas {
    pub standard: QuotaConfig,
    pub premium: QuotaConfig,
}

impl TierQuotas {
    pub const fn new(standard: QuotaConfig, premium: QuotaConfig) -> Self {
        Self { standard, premium }
    }

    /// Fixed-window quotas sharing one window.
    pub const fn fixed_window(standard: u64, premium: u64, window_seconds: u64) -> Self {
        Self::new(
            QuotaConfig::fixed_window(standard, window_seconds),
            QuotaConfig::fixed_window(premium, window_seconds),
        )
    }

    /// The policy for `tier`.
    pub fn get(&self, tier: Tier) -> &QuotaConfig {
        match tier {
            Tier::Standard => &self.standard,
            Tier::Premium => &self.premium,
        }
    }

    /// Premium must admit at least as much as standard, both per window and
    /// in sustained rate.
    fn premium_dominates(&self) -> bool {
        let (standard, premium) = (&self.standard, &self.premium);
        premium.limit >= standard.limit
            && premium.capacity() >= standard.capacity()
            && premium.refill_rate() >= standard.refill_rate()
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    classes: HashMap<String, TierQuotas>,
}

/// Static mapping from `(quota class, tier)` to [`QuotaConfig`].
#[derive(Debug, Clone)]
pub struct QuotaPolicyTable {
    classes: HashMap<String, TierQuotas>,
}

impl QuotaPolicyTable {
    /// Build a table, validating every entry.
    ///
    /// Fails when `global` is missing, a quota is zero, a class name contains
    /// `:` (reserved as the counter key separator), or premium admits less
    /// than standard.
    pub fn new<I, S>(classes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, TierQuotas)>,
        S: Into<String>,
    {
        let classes: HashMap<String, TierQuotas> = classes
            .into_iter()
            .map(|(name, quotas)| (name.into(), quotas))
            .collect();

        if !classes.contains_key(GLOBAL_CLASS) {
            return Err(QuotaError::Config(format!(
                "policy table must define the '{}' class for both tiers",
                GLOBAL_CLASS
            )));
        }

        for (class, quotas) in &classes {
            if class.is_empty() || class.contains(':') {
                return Err(QuotaError::Config(format!(
                    "invalid quota class name '{}'",
                    class
                )));
            }
            for tier in Tier::ALL {
                quotas.get(tier).validate(class, tier)?;
            }
            if !quotas.premium_dominates() {
                return Err(QuotaError::Config(format!(
                    "quota class '{}': premium tier must allow at least as much as standard",
                    class
                )));
            }
        }

        Ok(Self { classes })
    }

    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quota policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse policy table: {}", e)))?;
        Self::new(file.classes)
    }

    /// Policy for `quota_class` and `tier`, falling back to `global`.
    pub fn lookup(&self, quota_class: &str, tier: Tier) -> &QuotaConfig {
        self.quotas(quota_class).get(tier)
    }

    /// Both tiers' policies for `quota_class`, falling back to `global`.
    pub fn quotas(&self, quota_class: &str) -> &TierQuotas {
        match self.classes.get(quota_class) {
            Some(quotas) => quotas,
            None => {
                debug!(quota_class = %quota_class, "Unknown quota class, using global policy");
                &self.classes[GLOBAL_CLASS]
            }
        }
    }

    /// Whether the table defines `quota_class` itself.
    pub fn contains(&self, quota_class: &str) -> bool {
        self.classes.contains_key(quota_class)
    }

    /// Names of all defined classes.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

impl Default for QuotaPolicyTable {
    /// The built-in policies: hourly limits per class, premium at ten times
    /// standard, and a tighter five-minute window for authentication.
    fn default() -> Self {
        let classes = [
            (GLOBAL_CLASS, TierQuotas::fixed_window(1000, 10000, 3600)),
            ("per_ip", TierQuotas::fixed_window(100, 1000, 3600)),
            ("per_user", TierQuotas::fixed_window(500, 5000, 3600)),
            ("upload", TierQuotas::fixed_window(10, 100, 3600)),
            ("ai_query", TierQuotas::fixed_window(50, 500, 3600)),
            ("auth", TierQuotas::fixed_window(5, 10, 300)),
        ];

        Self {
            classes: classes
                .into_iter()
                .map(|(name, quotas)| (name.to_string(), quotas))
                .collect(),
        }
    }
}
