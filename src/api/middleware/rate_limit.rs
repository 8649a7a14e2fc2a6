use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::json;
use std::num::NonZeroU32;

use crate::config::IngestSettings;
use crate::core::DomId;

/// Per-domain throttle on guest memory reports. A chatty or hostile guest
/// cannot force a balance pass more often than its quota allows.
pub struct MeminfoLimiter {
    limiter: DefaultKeyedRateLimiter<DomId>,
}

impl MeminfoLimiter {
    pub fn new(reports_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(reports_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    pub fn from_settings(settings: &IngestSettings) -> Self {
        Self::new(settings.reports_per_second, settings.burst)
    }

    /// Take one report slot for `domid`.
    pub fn check(&self, domid: DomId) -> Result<(), RateLimitExceeded> {
        self.limiter
            .check_key(&domid)
            .map_err(|_| RateLimitExceeded { domid })
    }

    /// Drop state for domains whose quota has fully replenished.
    pub fn forget_stale(&self) {
        self.limiter.retain_recent();
    }

    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }
}

#[derive(Debug)]
pub struct RateLimitExceeded {
    pub domid: DomId,
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": format!("Too many memory reports from domain {}", self.domid),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_each_domain_separately() {
        let limiter = MeminfoLimiter::new(1, 2);
        assert!(limiter.check(1).is_ok());
        assert!(limiter.check(1).is_ok());
        assert!(limiter.check(1).is_err());

        assert!(limiter.check(2).is_ok());
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn zero_quota_falls_back_to_one() {
        let limiter = MeminfoLimiter::new(0, 0);
        assert!(limiter.check(7).is_ok());
        assert!(limiter.check(7).is_err());
    }
}
