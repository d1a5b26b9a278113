//! Subscription-tier resource limits.
//!
//! Containers are sized by the user's subscription tier. Unknown tiers get
//! the free limits so a billing hiccup degrades service instead of denying
//! it.

/// Resource limits applied to a user container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    /// Hard memory cap in bytes.
    pub memory_bytes: i64,
    /// CPU quota in microseconds per period.
    pub cpu_quota: i64,
    /// CPU period in microseconds.
    pub cpu_period: i64,
}

const MIB: i64 = 1024 * 1024;
const CPU_PERIOD_US: i64 = 100_000;

const FREE: TierLimits = TierLimits {
    memory_bytes: 2048 * MIB,
    cpu_quota: CPU_PERIOD_US,
    cpu_period: CPU_PERIOD_US,
};

const PRO: TierLimits = TierLimits {
    memory_bytes: 4096 * MIB,
    cpu_quota: 2 * CPU_PERIOD_US,
    cpu_period: CPU_PERIOD_US,
};

const ENTERPRISE: TierLimits = TierLimits {
    memory_bytes: 8192 * MIB,
    cpu_quota: 4 * CPU_PERIOD_US,
    cpu_period: CPU_PERIOD_US,
};

/// Limits for a subscription tier, falling back to free for unknown tiers.
pub fn limits_for_tier(tier: &str) -> TierLimits {
    match tier {
        "pro" => PRO,
        "enterprise" => ENTERPRISE,
        "free" => FREE,
        other => {
            tracing::debug!(tier = other, "unknown subscription tier, using free limits");
            FREE
        }
    }
}
