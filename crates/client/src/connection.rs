//! Connection: the host-owned handle to one remote app.
//!
//! The core holds no process-wide mutable state; everything scoped to a
//! remote app (spec cache, standing decisions, rate limiter buckets) lives
//! here, and the host passes the connection into every core call. Lifetime
//! is until the host drops it.

use crate::approval::{ApprovalMediator, ConsentHandler, StandingDecision};
use crate::credentials::Credential;
use crate::discovery::{DiscoveryDocument, discover};
use crate::error::Result;
use crate::ratelimit::TokenBucket;
use crate::spec::{ApprovalPolicy, ParsedSpec, parse_spec};
use opentools_http_guard::FetchGuard;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Host-tunable knobs. The spec-cache TTL and the user approval preference
/// are deliberately configuration points.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a resolved discovery document + parsed spec may be served
    /// from cache. A stale spec is never used (it could bypass a newly
    /// tightened approval policy).
    pub spec_cache_ttl: Duration,
    /// User preference: may only raise strictness above the site-declared
    /// minimum, never lower it.
    pub user_approval: ApprovalPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            spec_cache_ttl: Duration::from_secs(300),
            user_approval: ApprovalPolicy::Auto,
        }
    }
}

struct CachedSpec {
    discovery: DiscoveryDocument,
    spec: Arc<ParsedSpec>,
    expires_at: Instant,
}

pub(crate) struct ConnectionInner {
    pub(crate) base_url: Url,
    pub(crate) guard: FetchGuard,
    pub(crate) credential: Credential,
    pub(crate) consent: Arc<dyn ConsentHandler>,
    pub(crate) config: ConnectionConfig,
    pub(crate) mediator: ApprovalMediator,
    pub(crate) limiters: parking_lot::Mutex<HashMap<String, TokenBucket>>,
    // Async mutex: held across the discover+parse round trip so concurrent
    // callers coalesce into a single in-flight fetch.
    spec_cache: tokio::sync::Mutex<Option<CachedSpec>>,
}

/// One remote app the host has connected to. Cheap to clone; all clones
/// share the same per-connection state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    #[must_use]
    pub fn new(
        base_url: Url,
        credential: Credential,
        consent: Arc<dyn ConsentHandler>,
        guard: FetchGuard,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                base_url,
                guard,
                credential,
                consent,
                config,
                mediator: ApprovalMediator::default(),
                limiters: parking_lot::Mutex::new(HashMap::new()),
                spec_cache: tokio::sync::Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Resolve the discovery document and parsed spec, serving the cache
    /// while fresh.
    ///
    /// Concurrent callers within the TTL share one network round trip: the
    /// cache slot is guarded by an async mutex held across the fetch, so
    /// late arrivals observe the freshly filled cache instead of fetching
    /// again.
    ///
    /// # Errors
    ///
    /// Propagates discovery and parse failures (see [`crate::discovery::discover`]
    /// and [`crate::spec::parse_spec`]).
    pub(crate) async fn resolved_spec(&self) -> Result<(DiscoveryDocument, Arc<ParsedSpec>)> {
        let mut slot = self.inner.spec_cache.lock().await;

        if let Some(cached) = slot.as_ref()
            && cached.expires_at > Instant::now()
        {
            return Ok((cached.discovery.clone(), cached.spec.clone()));
        }

        let discovery = discover(&self.inner.guard, &self.inner.base_url).await?;
        let spec = Arc::new(parse_spec(&self.inner.guard, &discovery.spec_url).await?);

        *slot = Some(CachedSpec {
            discovery: discovery.clone(),
            spec: spec.clone(),
            expires_at: Instant::now() + self.inner.config.spec_cache_ttl,
        });

        Ok((discovery, spec))
    }

    /// Drop the cached spec so the next call re-discovers and re-parses.
    pub async fn invalidate_spec_cache(&self) {
        *self.inner.spec_cache.lock().await = None;
    }

    /// Snapshot of the standing approval decisions, for the host to persist
    /// across sessions (the host owns storage).
    #[must_use]
    pub fn standing_decisions(&self) -> HashMap<String, StandingDecision> {
        self.inner.mediator.standing_decisions()
    }

    /// Restore standing decisions the host persisted earlier.
    pub fn restore_standing_decisions(&self, decisions: HashMap<String, StandingDecision>) {
        self.inner.mediator.restore_standing_decisions(decisions);
    }
}
