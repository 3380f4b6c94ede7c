//! Throttling for the directive webhook.
//!
//! A single process-wide `governor` bucket: the webhook is called by one
//! alerting source, so there is no per-client keying. Rejected deliveries get
//! a 429 with a `Retry-After` of one replenish interval.

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_DIRECTIVES_PER_MINUTE: u32 = 120;

pub struct WebhookThrottle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    per_minute: NonZeroU32,
}

impl WebhookThrottle {
    /// Allow `per_minute` deliveries per minute; zero is raised to one
    pub fn per_minute(per_minute: u32) -> Arc<Self> {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Arc::new(Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            per_minute,
        })
    }

    pub fn limit_per_minute(&self) -> u32 {
        self.per_minute.get()
    }

    /// Time until the bucket regains one delivery
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(60u64.div_ceil(u64::from(self.per_minute.get())))
    }

    /// Take one delivery from the bucket
    pub fn admit(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Route layer for `/webhook/directive`
pub async fn throttle_webhook(
    State(throttle): State<Arc<WebhookThrottle>>,
    request: Request,
    next: Next,
) -> Response {
    if throttle.admit() {
        return next.run(request).await;
    }

    let retry_after = throttle.retry_after().as_secs();
    warn!(
        limit_per_minute = throttle.limit_per_minute(),
        retry_after, "Directive delivery throttled"
    );
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limited",
            "details": format!(
                "More than {} directives per minute; retry in {}s",
                throttle.limit_per_minute(),
                retry_after
            ),
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}
