//! Limit evaluation and request lifecycle hooks.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::key::RateLimitKey;
use super::policy::{Checkpoint, RateLimitPolicy};
use super::quota::RequestQuota;
use super::routes::RouteTable;
use super::store::CounterStore;
use super::subject::{client_address, RequestContext};
use crate::config::{GatekeeperConfig, MissingIdentity, NonPositiveOverride};
use crate::error::{GatekeeperError, Result};

/// Subject used when the identity path does not resolve.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";
/// Subject used when no client address is available.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Outcome of a single checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No policy applies; nothing was counted
    Skipped,
    /// Within the limit
    Admitted(RequestQuota),
    /// Over the limit; the hit was still counted
    Rejected(RequestQuota),
}

impl Decision {
    /// The quota computed by this checkpoint, if a policy applied.
    pub fn quota(&self) -> Option<&RequestQuota> {
        match self {
            Decision::Skipped => None,
            Decision::Admitted(quota) | Decision::Rejected(quota) => Some(quota),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Rejected(_))
    }
}

/// The limit evaluator.
///
/// Holds the merged settings, the route overrides and a shared handle to
/// the counter store. It keeps no mutable state of its own; concurrent
/// requests only meet inside the store.
pub struct RateLimiter<S: CounterStore + ?Sized> {
    config: Arc<GatekeeperConfig>,
    routes: Arc<RouteTable>,
    store: Arc<S>,
}

impl<S: CounterStore + ?Sized> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            routes: Arc::clone(&self.routes),
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CounterStore + ?Sized> RateLimiter<S> {
    /// Create a new rate limiter.
    pub fn new(config: GatekeeperConfig, routes: RouteTable, store: Arc<S>) -> Self {
        Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
            store,
        }
    }

    /// The settings this limiter was built with.
    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    /// The counter store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Pick the policy for a checkpoint.
    ///
    /// A route override wins. Without one, the global default applies only
    /// if its limit is positive.
    pub fn resolve_policy<'a>(
        &'a self,
        checkpoint: Checkpoint,
        route_override: Option<&'a RateLimitPolicy>,
    ) -> Option<&'a RateLimitPolicy> {
        if let Some(policy) = route_override {
            if !policy.is_enabled()
                && self.config.non_positive_override == NonPositiveOverride::Disable
            {
                return None;
            }
            return Some(policy);
        }

        let global = match checkpoint {
            Checkpoint::Ip => &self.config.global.ip,
            Checkpoint::Auth => &self.config.global.auth,
        };
        global.is_enabled().then_some(global)
    }

    /// Derive the subject for a checkpoint.
    fn subject<C: RequestContext + ?Sized>(
        &self,
        checkpoint: Checkpoint,
        ctx: &C,
        policy: &RateLimitPolicy,
    ) -> Result<String> {
        match checkpoint {
            Checkpoint::Ip => Ok(client_address(ctx).unwrap_or_else(|| {
                warn!(
                    method = %ctx.method(),
                    path = %ctx.route_path(),
                    "No client address available, limiting under a shared subject"
                );
                UNKNOWN_ADDRESS.to_string()
            })),
            Checkpoint::Auth => {
                let path = policy.id_path.as_deref().unwrap_or_default();
                if let Some(subject) = ctx.reach(path) {
                    return Ok(subject);
                }
                match self.config.missing_identity {
                    MissingIdentity::Shared => {
                        warn!(
                            id_path = %path,
                            method = %ctx.method(),
                            path = %ctx.route_path(),
                            "Identity path did not resolve, limiting under a shared subject"
                        );
                        Ok(ANONYMOUS_SUBJECT.to_string())
                    }
                    MissingIdentity::Reject => Err(GatekeeperError::MissingIdentity {
                        path: path.to_string(),
                    }),
                }
            }
        }
    }

    /// Build the counter key for a checkpoint.
    pub fn key_for<C: RequestContext + ?Sized>(
        &self,
        checkpoint: Checkpoint,
        ctx: &C,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitKey> {
        let subject = self.subject(checkpoint, ctx, policy)?;
        Ok(RateLimitKey::new(
            &self.config.namespace,
            &subject,
            ctx.method(),
            ctx.route_path(),
        ))
    }

    /// Evaluate one checkpoint against an explicit route override.
    ///
    /// Counts one hit when a policy applies. Store failures propagate as
    /// `StoreUnavailable`; they are never turned into a decision.
    pub async fn evaluate<C: RequestContext + ?Sized>(
        &self,
        checkpoint: Checkpoint,
        ctx: &C,
        route_override: Option<&RateLimitPolicy>,
    ) -> Result<Decision> {
        let Some(policy) = self.resolve_policy(checkpoint, route_override) else {
            trace!(
                checkpoint = %checkpoint,
                method = %ctx.method(),
                path = %ctx.route_path(),
                "No policy applies"
            );
            return Ok(Decision::Skipped);
        };

        let key = self.key_for(checkpoint, ctx, policy)?;

        trace!(
            checkpoint = %checkpoint,
            key = %key,
            limit = policy.limit,
            duration = policy.duration,
            "Checking rate limit"
        );

        let status = self
            .store
            .increment(&key, policy.limit, policy.window())
            .await?;

        let quota = RequestQuota {
            limit: policy.limit,
            remaining: status.remaining - 1,
            reset_at: status.reset_at,
        };

        if status.remaining <= 0 {
            debug!(
                checkpoint = %checkpoint,
                key = %key,
                count = status.count,
                limit = policy.limit,
                "Rate limit exceeded"
            );
            Ok(Decision::Rejected(quota))
        } else {
            Ok(Decision::Admitted(quota))
        }
    }

    /// Run a checkpoint for a request, using the route table for overrides.
    ///
    /// The computed quota is recorded on the request, replacing any earlier
    /// one. A rejection becomes `LimitExceeded`.
    pub async fn check<C: RequestContext + ?Sized>(
        &self,
        checkpoint: Checkpoint,
        ctx: &mut C,
    ) -> Result<()> {
        let route_override = self
            .routes
            .find(ctx.method(), ctx.route_path())
            .and_then(|route| route.policy(checkpoint));

        match self.evaluate(checkpoint, &*ctx, route_override).await? {
            Decision::Skipped => Ok(()),
            Decision::Admitted(quota) => {
                ctx.set_quota(quota);
                Ok(())
            }
            Decision::Rejected(quota) => {
                ctx.set_quota(quota.clone());
                Err(GatekeeperError::LimitExceeded(quota))
            }
        }
    }

    /// Address-based checkpoint, run before authentication.
    pub async fn on_pre_auth<C: RequestContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        self.check(Checkpoint::Ip, ctx).await
    }

    /// Identity-based checkpoint, run after authentication.
    pub async fn on_post_auth<C: RequestContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        self.check(Checkpoint::Auth, ctx).await
    }

    /// Run both checkpoints in order, stopping at the first error.
    pub async fn run_checkpoints<C: RequestContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        self.on_pre_auth(ctx).await?;
        self.on_post_auth(ctx).await
    }

    /// Decorate a handler's response with the recorded quota.
    ///
    /// Error responses (4xx/5xx) are left untouched, as are requests for
    /// which no checkpoint recorded a quota.
    pub fn on_post_handler<C: RequestContext + ?Sized, B>(
        &self,
        ctx: &C,
        response: &mut http::Response<B>,
    ) {
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return;
        }
        if let Some(quota) = ctx.quota() {
            quota.apply_headers(response.headers_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalPolicies;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::counter::MemoryStore;
    use crate::ratelimit::key::RateLimitKey;
    use crate::ratelimit::quota::{HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET};
    use crate::ratelimit::store::WindowStatus;
    use crate::ratelimit::subject::{RequestInfo, FORWARDED_FOR};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use http::{HeaderValue, Response, StatusCode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn request() -> RequestInfo {
        let mut ctx = RequestInfo::new("GET", "/x").with_remote_addr([10, 0, 0, 1].into());
        ctx.headers
            .insert(FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        ctx
    }

    fn limiter_with(
        config: GatekeeperConfig,
        routes: &str,
    ) -> (RateLimiter<MemoryStore>, MockClock) {
        let clock = MockClock::new(start());
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let routes = RouteTable::from_yaml(routes).unwrap();
        (RateLimiter::new(config, routes, store), clock)
    }

    /// A store that counts calls and always fails.
    #[derive(Default)]
    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(
            &self,
            _key: &RateLimitKey,
            _limit: i64,
            _window: Duration,
        ) -> Result<WindowStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GatekeeperError::StoreUnavailable("connection refused".to_string()))
        }
    }

    const IP_ROUTE: &str = r#"
routes:
  - method: GET
    path: /x
    ip:
      limit: 2
      duration: 1
"#;

    #[tokio::test]
    async fn test_admits_limit_then_rejects() {
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), IP_ROUTE);

        let mut first = request();
        limiter.on_pre_auth(&mut first).await.unwrap();
        assert_eq!(first.quota.as_ref().unwrap().remaining, 1);

        let mut second = request();
        limiter.on_pre_auth(&mut second).await.unwrap();
        assert_eq!(second.quota.as_ref().unwrap().remaining, 0);

        let mut third = request();
        let err = limiter.on_pre_auth(&mut third).await.unwrap_err();
        match err {
            GatekeeperError::LimitExceeded(quota) => {
                assert_eq!(quota.limit, 2);
                assert_eq!(quota.remaining, -1);
                assert_eq!(quota.reset_at, start() + chrono::Duration::seconds(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejections_still_count() {
        let (limiter, clock) = limiter_with(GatekeeperConfig::default(), IP_ROUTE);

        for _ in 0..5 {
            let _ = limiter.on_pre_auth(&mut request()).await;
        }
        let key = RateLimitKey::new("clhr", "1.2.3.4", "GET", "/x");
        assert_eq!(limiter.store().window(&key).unwrap().count, 5);

        clock.advance(Duration::from_secs(1));
        let mut ctx = request();
        limiter.on_pre_auth(&mut ctx).await.unwrap();
        assert_eq!(ctx.quota.unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_admits_exactly_limit_per_window() {
        let config = GatekeeperConfig {
            global: GlobalPolicies {
                ip: RateLimitPolicy::new(7, 60),
                ..GlobalPolicies::default()
            },
            ..GatekeeperConfig::default()
        };
        let (limiter, _clock) = limiter_with(config, "routes: []");

        let mut admitted = 0;
        for _ in 0..20 {
            if limiter.on_pre_auth(&mut request()).await.is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
    }

    #[tokio::test]
    async fn test_zero_duration_global_is_an_error() {
        let config = GatekeeperConfig {
            global: GlobalPolicies {
                ip: RateLimitPolicy::new(2, 0),
                ..GlobalPolicies::default()
            },
            ..GatekeeperConfig::default()
        };
        let (limiter, _clock) = limiter_with(config, "routes: []");

        for _ in 0..3 {
            let mut ctx = request();
            let err = limiter.on_pre_auth(&mut ctx).await.unwrap_err();
            assert!(matches!(err, GatekeeperError::Config(_)));
            assert!(ctx.quota.is_none());
        }
        assert!(limiter.store().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_global_never_touches_store() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(GatekeeperConfig::default(), RouteTable::new(), store.clone());

        let mut ctx = request();
        limiter.run_checkpoints(&mut ctx).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.quota.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(FailingStore::default());
        let routes = RouteTable::from_yaml(IP_ROUTE).unwrap();
        let limiter = RateLimiter::new(GatekeeperConfig::default(), routes, store.clone());

        let mut ctx = request();
        let err = limiter.on_pre_auth(&mut ctx).await.unwrap_err();

        assert!(matches!(err, GatekeeperError::StoreUnavailable(_)));
        assert!(ctx.quota.is_none());

        let mut response = Response::new(());
        limiter.on_post_handler(&ctx, &mut response);
        assert!(response.headers().is_empty());
    }

    #[tokio::test]
    async fn test_identity_checkpoint_uses_id_path() {
        let routes = r#"
routes:
  - method: POST
    path: /orders
    auth:
      limit: 1
      duration: 60
      id_path: auth.credentials.id
"#;
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), routes);

        let alice = || {
            RequestInfo::new("POST", "/orders")
                .with_identity(json!({"auth": {"credentials": {"id": "alice"}}}))
        };
        let bob = RequestInfo::new("POST", "/orders")
            .with_identity(json!({"auth": {"credentials": {"id": "bob"}}}));

        limiter.on_post_auth(&mut alice()).await.unwrap();
        assert!(limiter.on_post_auth(&mut alice()).await.unwrap_err().is_rejection());
        limiter.on_post_auth(&mut bob.clone()).await.unwrap();

        let key = RateLimitKey::new("clhr", "alice", "POST", "/orders");
        assert_eq!(limiter.store().window(&key).unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_missing_identity_shared_subject() {
        let config = GatekeeperConfig {
            global: GlobalPolicies {
                auth: RateLimitPolicy::with_id_path(10, 60, "auth.credentials.id"),
                ..GlobalPolicies::default()
            },
            ..GatekeeperConfig::default()
        };
        let (limiter, _clock) = limiter_with(config, "routes: []");

        limiter.on_post_auth(&mut request()).await.unwrap();
        limiter.on_post_auth(&mut request()).await.unwrap();

        let key = RateLimitKey::new("clhr", ANONYMOUS_SUBJECT, "GET", "/x");
        assert_eq!(limiter.store().window(&key).unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_missing_identity_reject() {
        let store = Arc::new(FailingStore::default());
        let config = GatekeeperConfig {
            global: GlobalPolicies {
                auth: RateLimitPolicy::with_id_path(10, 60, "auth.credentials.id"),
                ..GlobalPolicies::default()
            },
            missing_identity: MissingIdentity::Reject,
            ..GatekeeperConfig::default()
        };
        let limiter = RateLimiter::new(config, RouteTable::new(), store.clone());

        let err = limiter.on_post_auth(&mut request()).await.unwrap_err();

        assert!(matches!(err, GatekeeperError::MissingIdentity { ref path } if path == "auth.credentials.id"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_positive_override() {
        let routes = r#"
routes:
  - path: /x
    ip:
      limit: 0
      duration: 1
"#;
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), routes);
        assert!(limiter.on_pre_auth(&mut request()).await.unwrap_err().is_rejection());

        let config = GatekeeperConfig {
            non_positive_override: NonPositiveOverride::Disable,
            ..GatekeeperConfig::default()
        };
        let (limiter, _clock) = limiter_with(config, routes);
        let mut ctx = request();
        limiter.on_pre_auth(&mut ctx).await.unwrap();
        assert!(ctx.quota.is_none());
    }

    #[tokio::test]
    async fn test_route_override_beats_global() {
        let config = GatekeeperConfig {
            global: GlobalPolicies {
                ip: RateLimitPolicy::new(100, 60),
                ..GlobalPolicies::default()
            },
            ..GatekeeperConfig::default()
        };
        let (limiter, _clock) = limiter_with(config, IP_ROUTE);

        let mut ctx = request();
        limiter.on_pre_auth(&mut ctx).await.unwrap();
        assert_eq!(ctx.quota.unwrap().limit, 2);

        let mut other = RequestInfo::new("GET", "/y").with_remote_addr([10, 0, 0, 1].into());
        limiter.on_pre_auth(&mut other).await.unwrap();
        assert_eq!(other.quota.unwrap().limit, 100);
    }

    #[tokio::test]
    async fn test_auth_quota_replaces_ip_quota() {
        let routes = r#"
routes:
  - method: GET
    path: /x
    ip:
      limit: 10
      duration: 60
    auth:
      limit: 3
      duration: 60
      id_path: user
"#;
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), routes);

        let mut ctx = request().with_identity(json!({"user": "carol"}));
        limiter.run_checkpoints(&mut ctx).await.unwrap();

        let quota = ctx.quota.unwrap();
        assert_eq!(quota.limit, 3);
        assert_eq!(quota.remaining, 2);
    }

    #[tokio::test]
    async fn test_ip_rejection_short_circuits_auth() {
        let routes = r#"
routes:
  - method: GET
    path: /x
    ip:
      limit: 1
      duration: 60
    auth:
      limit: 10
      duration: 60
      id_path: user
"#;
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), routes);
        let identity = json!({"user": "dave"});

        limiter
            .run_checkpoints(&mut request().with_identity(identity.clone()))
            .await
            .unwrap();
        let err = limiter
            .run_checkpoints(&mut request().with_identity(identity))
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let key = RateLimitKey::new("clhr", "dave", "GET", "/x");
        assert_eq!(limiter.store().window(&key).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_post_handler_decorates_success_only() {
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), IP_ROUTE);
        let mut ctx = request();
        limiter.on_pre_auth(&mut ctx).await.unwrap();

        let mut ok = Response::new(());
        limiter.on_post_handler(&ctx, &mut ok);
        assert_eq!(ok.headers()[HEADER_LIMIT], "2");
        assert_eq!(ok.headers()[HEADER_REMAINING], "1");
        assert_eq!(ok.headers()[HEADER_RESET], "1700000001");

        let mut failed = Response::new(());
        *failed.status_mut() = StatusCode::NOT_FOUND;
        limiter.on_post_handler(&ctx, &mut failed);
        assert!(failed.headers().is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_with_explicit_override() {
        let (limiter, _clock) = limiter_with(GatekeeperConfig::default(), "routes: []");
        let policy = RateLimitPolicy::new(1, 10);
        let ctx = request();

        let first = limiter.evaluate(Checkpoint::Ip, &ctx, Some(&policy)).await.unwrap();
        let second = limiter.evaluate(Checkpoint::Ip, &ctx, Some(&policy)).await.unwrap();
        let skipped = limiter.evaluate(Checkpoint::Ip, &ctx, None).await.unwrap();

        assert!(matches!(first, Decision::Admitted(_)));
        assert!(second.is_rejected());
        assert_eq!(skipped, Decision::Skipped);
        assert!(skipped.quota().is_none());
    }
}
