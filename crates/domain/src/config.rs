//! Service configuration loaded from environment variables.

use std::time::Duration;

use common::Currency;

use crate::deadline::Deadline;
use crate::order::OrderStatus;

/// Which order statuses may be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CancellationPolicy {
    /// Only unpaid orders can be cancelled.
    CreatedOnly,

    /// Unpaid and paid (not yet shipped) orders can be cancelled.
    #[default]
    CreatedOrPaid,
}

impl CancellationPolicy {
    /// Returns true if an order in `status` may be cancelled.
    pub fn allows(&self, status: OrderStatus) -> bool {
        match self {
            CancellationPolicy::CreatedOnly => status == OrderStatus::Created,
            CancellationPolicy::CreatedOrPaid => {
                matches!(status, OrderStatus::Created | OrderStatus::Paid)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationPolicy::CreatedOnly => "created_only",
            CancellationPolicy::CreatedOrPaid => "created_or_paid",
        }
    }
}

impl std::fmt::Display for CancellationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CancellationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created_only" => Ok(CancellationPolicy::CreatedOnly),
            "created_or_paid" => Ok(CancellationPolicy::CreatedOrPaid),
            other => Err(format!("unknown cancellation policy: {other}")),
        }
    }
}

const DEFAULT_CURRENCY: &str = "CNY";
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 16;

/// Configuration shared by the order and product services.
///
/// Reads from environment variables:
/// - `ORDER_CURRENCY`: currency of new orders (default: `"CNY"`)
/// - `ORDER_CANCEL_POLICY`: `created_only` or `created_or_paid` (default: `created_or_paid`)
/// - `ORDER_OPERATION_TIMEOUT_MS`: deadline per service operation, `0` disables (default: `5000`)
/// - `STOCK_MAX_CONFLICT_RETRIES`: retries of a stock write after a version conflict (default: `16`)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub currency: Currency,
    pub cancellation_policy: CancellationPolicy,
    pub operation_timeout: Option<Duration>,
    pub max_conflict_retries: u32,
}

impl ServiceConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to the default and are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let currency = lookup("ORDER_CURRENCY")
            .map(Currency::new)
            .filter(|c| !c.is_empty())
            .unwrap_or(defaults.currency);

        let cancellation_policy = parse_or(
            "ORDER_CANCEL_POLICY",
            lookup("ORDER_CANCEL_POLICY"),
            defaults.cancellation_policy,
        );

        let timeout_ms = parse_or(
            "ORDER_OPERATION_TIMEOUT_MS",
            lookup("ORDER_OPERATION_TIMEOUT_MS"),
            DEFAULT_OPERATION_TIMEOUT_MS,
        );

        let max_conflict_retries = parse_or(
            "STOCK_MAX_CONFLICT_RETRIES",
            lookup("STOCK_MAX_CONFLICT_RETRIES"),
            defaults.max_conflict_retries,
        );

        Self {
            currency,
            cancellation_policy,
            operation_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            max_conflict_retries,
        }
    }

    /// Sets the operation timeout; `None` disables it.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<Currency>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Starts a new deadline for one service operation.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.operation_timeout)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            currency: Currency::new(DEFAULT_CURRENCY),
            cancellation_policy: CancellationPolicy::default(),
            operation_timeout: Some(Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS)),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e: T::Err| {
            tracing::warn!(key, value = %raw, error = %e, "invalid configuration value, using default");
            default
        }),
    }
}
