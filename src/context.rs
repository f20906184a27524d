//! State shared by feed runs: transport, rate limits, endpoints and policy.
//!
//! There are no process-wide singletons; callers build a [`FeedContext`] and
//! pass it to every run that should share its rate-limit accounting.
use crate::config::Config;
use crate::engine::RateLimiter;
use crate::error::TransportError;
use crate::feed::Endpoints;
use crate::transport::{ReqwestTransport, Transport, TransportSettings};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// How page workers react to exhausted rate-limit budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Longest wait accepted before a page faults as rate limited
    pub max_wait: Duration,
    /// Retries of a page answered with HTTP 429
    pub max_retries: u32,
    /// Pause before a 429 retry when the response carried no reset time
    pub retry_backoff: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct FeedContext {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    endpoints: Arc<Endpoints>,
    throttle: ThrottlePolicy,
    shared_slots: Option<Arc<Semaphore>>,
}

impl FeedContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            limiter: Arc::new(RateLimiter::new()),
            endpoints: Arc::new(Endpoints::default()),
            throttle: ThrottlePolicy::default(),
            shared_slots: None,
        }
    }

    /// Builds a context with a [`ReqwestTransport`] configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(TransportSettings {
            user_agent: config.user_agent.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            max_response_bytes: config.max_response_bytes,
        })?;

        let mut ctx = Self::new(Arc::new(transport))
            .with_endpoints(config.endpoints.to_endpoints())
            .with_throttle(ThrottlePolicy {
                max_wait: Duration::from_secs(config.max_throttle_wait_secs),
                ..ThrottlePolicy::default()
            });
        if config.max_total_fetches > 0 {
            ctx = ctx.with_shared_slots(config.max_total_fetches);
        }
        Ok(ctx)
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = Arc::new(endpoints);
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottlePolicy) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Caps fetches in flight across every run using this context.
    pub fn with_shared_slots(mut self, slots: usize) -> Self {
        self.shared_slots = Some(Arc::new(Semaphore::new(slots.max(1))));
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn throttle(&self) -> ThrottlePolicy {
        self.throttle
    }

    pub fn shared_slots(&self) -> Option<&Arc<Semaphore>> {
        self.shared_slots.as_ref()
    }
}

impl fmt::Debug for FeedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedContext")
            .field("endpoints", &self.endpoints)
            .field("throttle", &self.throttle)
            .field("routes", &self.limiter.len())
            .field(
                "shared_slots",
                &self.shared_slots.as_ref().map(|s| s.available_permits()),
            )
            .finish()
    }
}
