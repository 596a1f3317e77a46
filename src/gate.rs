//! Path policies and the identity resolver, wired together for the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{QuotaConfig, RateLimitingConfig, StoreBackend, TollgateConfig};
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::ratelimit::{CounterStore, FileStore, MemoryStore, RateLimiter};

/// Policy name of the API surface.
pub const API_POLICY: &str = "api";
/// Policy name of all other traffic.
pub const WEB_POLICY: &str = "web";

/// A path prefix bound to its own limiter.
#[derive(Debug)]
pub struct Policy {
    prefix: String,
    limiter: RateLimiter,
}

impl Policy {
    /// The path prefix this policy covers.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The limiter enforcing this policy.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn matches(&self, path: &str) -> bool {
        path_has_prefix(path, &self.prefix)
    }
}

/// Everything the boundary layer needs to rate limit a request.
#[derive(Debug)]
pub struct Gate {
    resolver: IdentityResolver,
    /// Ordered longest prefix first
    policies: Vec<Policy>,
}

impl Gate {
    /// Create a gate with no policies; every path passes unmetered.
    pub fn new(resolver: IdentityResolver) -> Self {
        Self {
            resolver,
            policies: Vec::new(),
        }
    }

    /// Add a policy for requests whose path starts with `prefix`.
    ///
    /// The most specific prefix wins when several match.
    pub fn with_policy(mut self, prefix: impl Into<String>, limiter: RateLimiter) -> Self {
        self.policies.push(Policy {
            prefix: prefix.into(),
            limiter,
        });
        self.policies
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        self
    }

    /// Build the resolver, stores and limiters described by `config`.
    pub async fn from_config(config: &TollgateConfig) -> Result<Self> {
        config.validate()?;
        let limits = &config.rate_limiting;
        let mut gate = Gate::new(IdentityResolver::new(&config.identity)?);

        if limits.api.enabled {
            let limiter = build_limiter(API_POLICY, &limits.api, limits).await?;
            gate = gate.with_policy(limits.api_prefix.clone(), limiter);
        }
        if limits.web.enabled {
            let limiter = build_limiter(WEB_POLICY, &limits.web, limits).await?;
            gate = gate.with_policy("/", limiter);
        }

        for policy in &gate.policies {
            let quota = policy.limiter.quota();
            info!(
                policy = %policy.limiter.name(),
                prefix = %policy.prefix,
                max_requests = quota.max_requests(),
                window_secs = quota.window_secs(),
                "Rate limit policy configured"
            );
        }

        Ok(gate)
    }

    /// The identity resolver.
    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// The policies, most specific first.
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// The limiter for a request path, if any policy covers it.
    pub fn limiter_for(&self, path: &str) -> Option<&RateLimiter> {
        self.policies
            .iter()
            .find(|policy| policy.matches(path))
            .map(|policy| &policy.limiter)
    }

    /// Run cleanup on every policy.
    ///
    /// Every policy is attempted; the first failure is returned after all
    /// have run, and the records the other policies purged stay purged. On
    /// success returns the total number of purged records.
    pub async fn cleanup(&self) -> Result<usize> {
        let results = join_all(self.policies.iter().map(|p| p.limiter.cleanup())).await;

        let mut total = 0;
        let mut first_error = None;
        for (policy, result) in self.policies.iter().zip(results) {
            match result {
                Ok(removed) => total += removed,
                Err(e) => {
                    warn!(policy = %policy.limiter.name(), error = %e, "Cleanup failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                warn!(removed = total, "Cleanup incomplete, some policies failed");
                Err(e)
            }
            None => Ok(total),
        }
    }
}

/// Run [`Gate::cleanup`] every `interval` until the task is aborted.
pub fn spawn_cleanup_task(gate: Arc<Gate>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match gate.cleanup().await {
                Ok(removed) => debug!(removed, "Periodic cleanup finished"),
                Err(e) => warn!(error = %e, "Periodic cleanup failed"),
            }
        }
    })
}

async fn build_limiter(
    name: &str,
    quota: &QuotaConfig,
    limits: &RateLimitingConfig,
) -> Result<RateLimiter> {
    let store: Arc<dyn CounterStore> = match limits.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(limits.store.path.join(name)).await?),
    };

    Ok(RateLimiter::new(name, quota.quota()?, store)
        .with_store_timeout(limits.store.timeout())
        .with_grace_multiplier(limits.grace_multiplier))
}

/// Segment-aware prefix match: `/api` covers `/api` and `/api/x`, not `/apix`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
