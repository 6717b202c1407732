//! Shared router state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use verdia_core::config::ServiceConfig;
use verdia_core::inference::InferenceProvider;
use verdia_core::policy::PolicyFilter;
use verdia_core::usage::UsageTracker;

/// Process-wide state handed to every handler.
///
/// Constructed once in `main` and cloned per request (all fields are
/// shared). The tracker and provider are injected rather than reached
/// globally so tests can substitute deterministic fakes.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration, fixed for the process lifetime.
    pub config: Arc<ServiceConfig>,
    /// Per-client usage tracker; the only shared mutable state.
    pub tracker: Arc<UsageTracker>,
    /// External inference capability.
    pub provider: Arc<dyn InferenceProvider>,
    /// Organic-only treatment filter.
    pub policy: Arc<PolicyFilter>,
    /// Server start time, for the health probe.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds state from a configuration and a provider.
    #[must_use]
    pub fn new(config: ServiceConfig, provider: Arc<dyn InferenceProvider>) -> Self {
        let tracker = Arc::new(UsageTracker::new(config.usage.clone()));
        let policy = Arc::new(PolicyFilter::new(config.policy.clone()));
        Self {
            config: Arc::new(config),
            tracker,
            provider,
            policy,
            started_at: Utc::now(),
        }
    }

    /// Server uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
