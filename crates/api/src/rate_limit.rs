//! Rate Limiting Middleware using GCRA Algorithm
//!
//! Per-IP limits on the prediction trigger via tower_governor. GCRA needs no
//! background process to replenish quota.

use std::sync::Arc;

use governor::middleware::StateInformationMiddleware;
use serde::{Deserialize, Serialize};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::GovernorLayer;

use crate::error::StartupError;

/// Governor config keyed by peer IP, reporting quota in `X-RateLimit-*` headers
pub type TriggerGovernorConfig =
    tower_governor::governor::GovernorConfig<PeerIpKeyExtractor, StateInformationMiddleware>;

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Seconds between quota replenishments
    pub per_second: u64,
    /// Requests allowed immediately
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 2,
            burst_size: 5,
        }
    }
}

/// Build the governor config
///
/// The service must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()` for IP extraction.
pub fn create_governor_config(
    config: &RateLimitConfig,
) -> Result<Arc<TriggerGovernorConfig>, StartupError> {
    GovernorConfigBuilder::default()
        .per_second(config.per_second)
        .burst_size(config.burst_size)
        .use_headers()
        .finish()
        .map(Arc::new)
        .ok_or_else(|| {
            StartupError::RateLimit(format!(
                "per_second={} burst_size={} (both must be non-zero)",
                config.per_second, config.burst_size
            ))
        })
}

/// Layer applied to the prediction trigger route
pub fn trigger_layer(
    config: &RateLimitConfig,
) -> Result<GovernorLayer<PeerIpKeyExtractor, StateInformationMiddleware>, StartupError> {
    Ok(GovernorLayer {
        config: create_governor_config(config)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.per_second, 2);
        assert_eq!(config.burst_size, 5);
    }

    #[test]
    fn test_create_governor_config() {
        let governor = create_governor_config(&RateLimitConfig::default()).unwrap();
        assert_eq!(Arc::strong_count(&governor), 1);
    }

    #[test]
    fn test_zero_burst_rejected() {
        let config = RateLimitConfig {
            per_second: 1,
            burst_size: 0,
        };
        assert!(matches!(
            create_governor_config(&config),
            Err(StartupError::RateLimit(_))
        ));
    }
}
