//! Gateway policy and per-subject group configuration.

use crate::{AbuseCategory, MitigationAction};
use serde::{Deserialize, Serialize};

/// Defines the operational policy of a Warden gateway instance.
///
/// These are operator-level knobs that apply across tenants. Per-subject
/// overrides live in [`GroupConfig`], which falls back to the values here
/// when a subject has no stored configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayPolicy {
    /// Defaults applied to subjects without a stored group config.
    #[serde(default)]
    pub default_group: GroupConfig,
    /// How long a platform delivery id suppresses duplicates, in seconds.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Per-handler module execution time box, in milliseconds.
    #[serde(default = "default_module_timeout_ms")]
    pub module_timeout_ms: u64,
    /// Capacity of the ack-then-process queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of pipeline worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retry schedule for mitigation execution.
    #[serde(default)]
    pub mitigation_retry: RetryConfig,
}

fn default_dedup_ttl_secs() -> u64 {
    600
}

fn default_module_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_workers() -> usize {
    4
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            default_group: GroupConfig::default(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            module_timeout_ms: default_module_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            mitigation_retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff schedule for mitigation execution.
///
/// After `max_attempts` exhausted attempts the failure escalates to an
/// operator-visible alarm instead of retrying indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
        }
    }
}

/// Per-(tenant, subject) configuration loaded by the GroupConfig stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    /// Module ids enabled for this subject.
    #[serde(default)]
    pub enabled_modules: Vec<String>,
    /// Abuse detection thresholds.
    #[serde(default)]
    pub thresholds: AbuseThresholds,
    /// Token-bucket admission settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Actor ids exempt from rate limiting and abuse checks.
    #[serde(default)]
    pub trust_exemptions: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled_modules: Vec::new(),
            thresholds: AbuseThresholds::default(),
            rate_limit: RateLimitConfig::default(),
            trust_exemptions: Vec::new(),
        }
    }
}

impl GroupConfig {
    /// Returns the window rule for the given abuse category.
    pub fn rule(&self, category: AbuseCategory) -> &WindowRule {
        match category {
            AbuseCategory::MessageFlood => &self.thresholds.message_flood,
            AbuseCategory::MediaFlood => &self.thresholds.media_flood,
            AbuseCategory::Raid => &self.thresholds.raid,
        }
    }
}

/// Trailing-window thresholds per abuse category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbuseThresholds {
    /// Message flood: qualifying messages per actor per subject.
    #[serde(default = "default_message_flood_rule")]
    pub message_flood: WindowRule,
    /// Media flood: qualifying media messages per actor per subject.
    #[serde(default = "default_media_flood_rule")]
    pub media_flood: WindowRule,
    /// Raid: joins per subject.
    #[serde(default = "default_raid_rule")]
    pub raid: WindowRule,
}

fn default_message_flood_rule() -> WindowRule {
    WindowRule {
        limit: 10,
        window_secs: 10,
        mitigation_secs: 300,
        action: None,
    }
}

fn default_media_flood_rule() -> WindowRule {
    WindowRule {
        limit: 5,
        window_secs: 10,
        mitigation_secs: 300,
        action: None,
    }
}

// Auto-unlock falls back to 300 seconds; operators are expected to tune
// this per subject.
fn default_raid_rule() -> WindowRule {
    WindowRule {
        limit: 10,
        window_secs: 60,
        mitigation_secs: 300,
        action: None,
    }
}

impl Default for AbuseThresholds {
    fn default() -> Self {
        Self {
            message_flood: default_message_flood_rule(),
            media_flood: default_media_flood_rule(),
            raid: default_raid_rule(),
        }
    }
}

/// One trailing-window rule: `limit` qualifying events per `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowRule {
    /// Count at which the category triggers.
    pub limit: u32,
    /// Trailing window length in seconds.
    pub window_secs: u64,
    /// How long the applied mitigation stays active, in seconds.
    pub mitigation_secs: u64,
    /// Override for the applied action. `None` uses the category default
    /// (flood categories mute the actor, raid locks the subject).
    #[serde(default)]
    pub action: Option<MitigationAction>,
}

impl WindowRule {
    /// The mitigation applied when this rule triggers.
    pub fn effective_action(&self, category: AbuseCategory) -> MitigationAction {
        self.action.unwrap_or(match category {
            AbuseCategory::MessageFlood | AbuseCategory::MediaFlood => MitigationAction::Mute,
            AbuseCategory::Raid => MitigationAction::Lock,
        })
    }
}

/// Token-bucket admission settings for one subject.
///
/// The actor-wide bucket applies to every event; the command bucket
/// additionally applies to command messages so one spammy command cannot
/// silently exhaust an actor's whole allowance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Actor-wide bucket capacity.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Actor-wide refill rate, tokens per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Per-(actor, command) bucket capacity.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: u32,
    /// Per-(actor, command) refill rate, tokens per second.
    #[serde(default = "default_command_refill_per_sec")]
    pub command_refill_per_sec: f64,
}

fn default_capacity() -> u32 {
    20
}

fn default_refill_per_sec() -> f64 {
    0.5
}

fn default_command_capacity() -> u32 {
    5
}

fn default_command_refill_per_sec() -> f64 {
    0.2
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            command_capacity: default_command_capacity(),
            command_refill_per_sec: default_command_refill_per_sec(),
        }
    }
}
