//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, trace, warn};

use super::audit::{self, AuditEvent, AuditEventType};
use super::bucket;
use super::clock::{Clock, SystemClock};
use super::idempotency::{fingerprint, IdempotencyEntry};
use super::key::{idempotency_key, StateKey};
use super::policy::{Limit, Policy, PolicyInput, PolicyPatch};
use super::request::{ConsumeRequest, Decision, LimitResult};
use super::selector::{priority_order, select_policy};
use super::window;
use super::StateCommit;
use crate::config::{EngineConfig, StorageBackendKind};
use crate::error::{Result, TurnstileError};
use crate::storage::{FileStorage, MemoryStorage, StorageProvider};
use crate::sync::KeyedMutex;

/// How long a cached idempotent decision stays replayable by default.
const DEFAULT_IDEMPOTENCY_TTL_MS: i64 = 10 * 60 * 1000;
/// Audit events retained by default.
const DEFAULT_MAX_AUDIT_EVENTS: usize = 10_000;

/// The decision engine: policy management, request evaluation, idempotency,
/// and audit logging over an injected storage provider.
///
/// This struct is thread-safe and can be shared across multiple tasks. All
/// evaluation work for one tenant is serialized through a per-tenant
/// exclusive section; different tenants proceed in parallel.
pub struct RateLimiter {
    storage: Arc<dyn StorageProvider>,
    mutex: KeyedMutex,
    clock: Arc<dyn Clock>,
    idempotency_ttl_ms: i64,
    max_audit_events: usize,
}

impl RateLimiter {
    /// Create a rate limiter over the given storage provider.
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            mutex: KeyedMutex::new(),
            clock: Arc::new(SystemClock),
            idempotency_ttl_ms: DEFAULT_IDEMPOTENCY_TTL_MS,
            max_audit_events: DEFAULT_MAX_AUDIT_EVENTS,
        }
    }

    /// Create a rate limiter with volatile storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Create a rate limiter with the storage backend selected by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let storage: Arc<dyn StorageProvider> = match config.storage.backend {
            StorageBackendKind::Memory => Arc::new(MemoryStorage::new()),
            StorageBackendKind::File => Arc::new(FileStorage::open(&config.storage.state_file)?),
        };

        info!(
            storage = %storage.describe(),
            idempotency_ttl_ms = config.idempotency_ttl_ms,
            "Rate limiter initialized"
        );

        Ok(Self::new(storage)
            .with_idempotency_ttl(Duration::from_millis(config.idempotency_ttl_ms))
            .with_max_audit_events(config.max_audit_events))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn with_max_audit_events(mut self, max_events: usize) -> Self {
        self.max_audit_events = max_events;
        self
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// Create or replace a policy.
    ///
    /// `created_at` survives repeat calls for the same id; `updated_at` is
    /// refreshed. Nothing is written if validation fails.
    pub fn upsert_policy(&self, input: PolicyInput) -> Result<Policy> {
        input.validate()?;

        let now = self.clock.now();
        let (policy, created) = {
            let mut policies = self.storage.stores().policies.write();
            let existing = policies.get(&input.policy_id);
            let created = existing.is_none();
            let created_at = existing.map_or(now, |p| p.created_at);
            let updated_at = existing.map_or(now, |p| p.updated_at.max(now));

            let policy = Arc::new(Policy::from_input(input, created_at, updated_at));
            policies.insert(policy.policy_id.clone(), Arc::clone(&policy));
            (policy, created)
        };

        info!(
            tenant_id = %policy.tenant_id,
            policy_id = %policy.policy_id,
            priority = policy.priority,
            created = created,
            "Policy upserted"
        );

        self.record_audit(AuditEvent::new(
            AuditEventType::PolicyUpsert,
            policy.tenant_id.clone(),
            now,
            json!({
                "policy_id": policy.policy_id,
                "status": policy.status,
                "priority": policy.priority,
                "created": created,
            }),
        ));
        self.storage.persist()?;

        Ok((*policy).clone())
    }

    /// Merge a partial update over an existing policy.
    pub fn patch_policy(&self, policy_id: &str, patch: PolicyPatch) -> Result<Policy> {
        let now = self.clock.now();
        let fields = patch.field_names();

        let policy = {
            let mut policies = self.storage.stores().policies.write();
            let current = policies
                .get(policy_id)
                .ok_or_else(|| TurnstileError::NotFound(format!("policy not found: {}", policy_id)))?;

            let next = current.merged(patch, current.updated_at.max(now));
            next.validate()?;

            let next = Arc::new(next);
            policies.insert(policy_id.to_string(), Arc::clone(&next));
            next
        };

        info!(
            tenant_id = %policy.tenant_id,
            policy_id = %policy.policy_id,
            fields = ?fields,
            "Policy patched"
        );

        self.record_audit(AuditEvent::new(
            AuditEventType::PolicyPatch,
            policy.tenant_id.clone(),
            now,
            json!({
                "policy_id": policy.policy_id,
                "status": policy.status,
                "priority": policy.priority,
                "fields": fields,
            }),
        ));
        self.storage.persist()?;

        Ok((*policy).clone())
    }

    /// Look up one policy by id.
    pub fn get_policy(&self, policy_id: &str) -> Option<Policy> {
        self.storage
            .stores()
            .policies
            .read()
            .get(policy_id)
            .map(|p| (**p).clone())
    }

    /// Policies, optionally for one tenant, by descending priority then id.
    pub fn list_policies(&self, tenant_id: Option<&str>) -> Vec<Policy> {
        let mut policies: Vec<Policy> = self
            .storage
            .stores()
            .policies
            .read()
            .values()
            .filter(|p| tenant_id.map_or(true, |t| p.tenant_id == t))
            .map(|p| (**p).clone())
            .collect();
        policies.sort_by(priority_order);
        policies
    }

    /// Audit events, optionally for one tenant, most recent first.
    pub fn list_audit_events(&self, tenant_id: Option<&str>, limit: Option<usize>) -> Vec<AuditEvent> {
        audit::query(&self.storage.stores().audit.read(), tenant_id, limit)
    }

    /// Evaluate a request and consume quota if it is allowed.
    pub async fn consume(&self, request: ConsumeRequest) -> Result<Decision> {
        self.evaluate(request).await
    }

    /// Evaluate a request without consuming anything.
    pub async fn check(&self, mut request: ConsumeRequest) -> Result<Decision> {
        request.dry_run = true;
        self.evaluate(request).await
    }

    async fn evaluate(&self, request: ConsumeRequest) -> Result<Decision> {
        let explicit_now = request.parse_now()?;
        request.validate()?;
        let now = explicit_now.unwrap_or_else(|| self.clock.now());

        let section_key = format!("tenant:{}", request.tenant_id);
        let _section = self.mutex.lock(&section_key).await;

        let mut dirty = false;
        let outcome = self.evaluate_exclusive(&request, now, &mut dirty);
        if dirty {
            self.storage.persist()?;
        }
        outcome
    }

    /// Body of the exclusive section. Sets `dirty` whenever stores change.
    fn evaluate_exclusive(
        &self,
        request: &ConsumeRequest,
        now: DateTime<Utc>,
        dirty: &mut bool,
    ) -> Result<Decision> {
        let stores = self.storage.stores();
        let now_ms = now.timestamp_millis();
        let cost = request.cost();

        let evicted = stores.evict_expired_idempotency(now_ms);
        if evicted > 0 {
            trace!(evicted = evicted, "Expired idempotency entries removed");
            *dirty = true;
        }

        let cache_slot = match &request.request_id {
            Some(request_id) => {
                let key = idempotency_key(&request.tenant_id, request_id);
                let payload_fingerprint = fingerprint(
                    &request.tenant_id,
                    &request.subject,
                    &request.resource,
                    cost,
                    request.dry_run,
                )?;

                if let Some(entry) = stores.idempotency.get(&key) {
                    if entry.is_live(now_ms) {
                        if entry.payload_fingerprint != payload_fingerprint {
                            drop(entry);
                            warn!(
                                tenant_id = %request.tenant_id,
                                request_id = %request_id,
                                "Idempotency key reused with a different payload"
                            );
                            self.record_audit(AuditEvent::new(
                                AuditEventType::IdempotencyConflict,
                                request.tenant_id.clone(),
                                now,
                                json!({ "request_id": request_id }),
                            ));
                            *dirty = true;
                            return Err(TurnstileError::IdempotencyConflict(
                                "IDEMPOTENCY_KEY_REUSE: payload mismatch for request_id".to_string(),
                            ));
                        }

                        debug!(
                            tenant_id = %request.tenant_id,
                            request_id = %request_id,
                            "Replaying cached decision"
                        );
                        return Ok(entry.decision.clone());
                    }
                }

                Some((key, payload_fingerprint))
            }
            None => None,
        };

        let policy = select_policy(
            stores.policies.read().values(),
            &request.tenant_id,
            &request.subject,
            &request.resource,
        );

        let decision = match policy {
            None => {
                trace!(
                    tenant_id = %request.tenant_id,
                    resource = %request.resource.name,
                    "No matching policy, allowing"
                );
                Decision::unlimited()
            }
            Some(policy) => {
                let (results, commits) = self.evaluate_limits(&policy, request, now_ms, cost)?;
                let decision = Decision::aggregate(&policy.policy_id, results);

                if decision.allowed && !request.dry_run {
                    for commit in commits {
                        commit.apply(stores);
                    }
                    *dirty = true;
                } else if !decision.allowed {
                    debug!(
                        tenant_id = %request.tenant_id,
                        policy_id = %policy.policy_id,
                        subject = %request.subject.id,
                        retry_after_ms = ?decision.retry_after_ms,
                        "Rate limit exceeded"
                    );
                    self.record_audit(AuditEvent::new(
                        AuditEventType::RequestDenied,
                        request.tenant_id.clone(),
                        now,
                        json!({
                            "policy_id": policy.policy_id,
                            "request_id": request.request_id,
                            "subject": request.subject,
                            "resource": request.resource,
                            "cost": cost,
                            "dry_run": request.dry_run,
                            "retry_after_ms": decision.retry_after_ms,
                        }),
                    ));
                    *dirty = true;
                }

                decision
            }
        };

        if let Some((key, payload_fingerprint)) = cache_slot {
            stores.idempotency.insert(
                key,
                IdempotencyEntry {
                    payload_fingerprint,
                    decision: decision.clone(),
                    expires_at_ms: now_ms.saturating_add(self.idempotency_ttl_ms),
                },
            );
            *dirty = true;
        }

        Ok(decision)
    }

    /// Evaluate every limit of `policy` in declared order.
    fn evaluate_limits(
        &self,
        policy: &Policy,
        request: &ConsumeRequest,
        now_ms: i64,
        cost: f64,
    ) -> Result<(Vec<LimitResult>, Vec<StateCommit>)> {
        let stores = self.storage.stores();
        let mut results = Vec::with_capacity(policy.limits.len());
        let mut commits = Vec::with_capacity(policy.limits.len());

        for (index, limit) in policy.limits.iter().enumerate() {
            let key = StateKey::new(policy, request, limit.kind(), index).to_string_key();

            let (result, commit) = match limit {
                Limit::TokenBucket(config) => {
                    let state = stores.buckets.get(&key).map(|s| s.value().clone());
                    let eval = bucket::evaluate(config, &key, state.as_ref(), now_ms, cost)?;
                    (eval.result, eval.commit)
                }
                Limit::FixedWindow(config) => {
                    let state = stores.windows.get(&key).map(|s| s.value().clone());
                    let eval = window::evaluate(config, &key, state.as_ref(), now_ms, cost);
                    (eval.result, eval.commit)
                }
            };

            trace!(
                key = %key,
                allowed = result.allowed,
                remaining = ?result.remaining,
                "Limit evaluated"
            );

            results.push(result);
            commits.extend(commit);
        }

        Ok((results, commits))
    }

    fn record_audit(&self, event: AuditEvent) {
        let mut log = self.storage.stores().audit.write();
        audit::append(&mut log, event, self.max_audit_events);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("storage", &self.storage.describe())
            .field("idempotency_ttl_ms", &self.idempotency_ttl_ms)
            .field("max_audit_events", &self.max_audit_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::FixedClock;
    use crate::ratelimit::policy::tests::sample_input;
    use crate::ratelimit::policy::{
        FixedWindowLimit, PolicyStatus, ResourceType, SubjectType, TokenBucketLimit,
    };
    use crate::ratelimit::request::{Resource, Subject};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap()
    }

    fn at(offset_ms: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(offset_ms)
    }

    fn create_test_limiter() -> (RateLimiter, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let limiter = RateLimiter::in_memory().with_clock(clock.clone());
        (limiter, clock)
    }

    /// Token bucket (10, 1/s, initial 10) plus fixed window (20 per 60s).
    fn create_seeded_limiter() -> RateLimiter {
        let (limiter, _clock) = create_test_limiter();
        limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();
        limiter
    }

    fn request(subject_id: &str) -> ConsumeRequest {
        ConsumeRequest::new(
            "T-1",
            Subject::new(SubjectType::User, subject_id),
            Resource::new(ResourceType::Endpoint, "/api/v1/orders"),
        )
        .at(t0())
    }

    fn bucket_tokens(limiter: &RateLimiter, subject_id: &str) -> Option<f64> {
        let key = format!(
            "T-1:P-1:USER:{}:ENDPOINT:/api/v1/orders:TOKEN_BUCKET:0",
            subject_id
        );
        limiter
            .storage()
            .stores()
            .buckets
            .get(&key)
            .map(|s| s.tokens)
    }

    fn window_used(limiter: &RateLimiter, subject_id: &str) -> Option<f64> {
        let key = format!(
            "T-1:P-1:USER:{}:ENDPOINT:/api/v1/orders:FIXED_WINDOW:1",
            subject_id
        );
        limiter
            .storage()
            .stores()
            .windows
            .get(&key)
            .map(|s| s.used)
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let (limiter, clock) = create_test_limiter();

        let first = limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();
        assert_eq!(first.created_at, t0());
        assert_eq!(first.updated_at, t0());

        clock.advance(chrono::Duration::seconds(30));
        let mut input = sample_input("P-1", "T-1");
        input.priority = 70;
        let second = limiter.upsert_policy(input).unwrap();

        assert_eq!(second.created_at, t0());
        assert_eq!(second.updated_at, at(30_000));
        assert_eq!(second.priority, 70);
        assert_eq!(limiter.list_policies(None).len(), 1);
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let (limiter, clock) = create_test_limiter();
        limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();

        clock.set(at(-60_000));
        let patched = limiter
            .patch_policy("P-1", PolicyPatch { priority: Some(3), ..Default::default() })
            .unwrap();
        assert_eq!(patched.updated_at, t0());
    }

    #[test]
    fn test_returned_policy_is_a_copy() {
        let (limiter, _clock) = create_test_limiter();
        let mut returned = limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();
        returned.priority = 9_999;
        returned.limits.clear();

        let stored = limiter.get_policy("P-1").unwrap();
        assert_eq!(stored.priority, 10);
        assert_eq!(stored.limits.len(), 2);
    }

    #[test]
    fn test_invalid_upsert_writes_nothing() {
        let (limiter, _clock) = create_test_limiter();
        let mut input = sample_input("P-1", "T-1");
        input.limits = vec![Limit::FixedWindow(FixedWindowLimit::new(0, 10.0))];

        let err = limiter.upsert_policy(input).unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));
        assert!(limiter.list_policies(None).is_empty());
        assert!(limiter.list_audit_events(None, None).is_empty());
    }

    #[test]
    fn test_patch_policy() {
        let (limiter, clock) = create_test_limiter();
        limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();

        let err = limiter
            .patch_policy("P-404", PolicyPatch::default())
            .unwrap_err();
        assert!(matches!(err, TurnstileError::NotFound(_)));

        let err = limiter
            .patch_policy(
                "P-1",
                PolicyPatch {
                    limits: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));
        assert_eq!(limiter.get_policy("P-1").unwrap().limits.len(), 2);

        clock.advance(chrono::Duration::seconds(5));
        let patched = limiter
            .patch_policy(
                "P-1",
                PolicyPatch {
                    status: Some(PolicyStatus::Inactive),
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(patched.policy_id, "P-1");
        assert_eq!(patched.tenant_id, "T-1");
        assert_eq!(patched.status, PolicyStatus::Inactive);
        assert_eq!(patched.name, "renamed");
        assert_eq!(patched.created_at, t0());
        assert_eq!(patched.updated_at, at(5_000));
    }

    #[test]
    fn test_list_policies_order_and_filter() {
        let (limiter, _clock) = create_test_limiter();
        for (id, tenant, priority) in [
            ("P-C", "T-1", 10),
            ("P-A", "T-1", 50),
            ("P-B", "T-1", 50),
            ("P-X", "T-2", 99),
        ] {
            let mut input = sample_input(id, tenant);
            input.priority = priority;
            limiter.upsert_policy(input).unwrap();
        }

        let ids: Vec<String> = limiter
            .list_policies(Some("T-1"))
            .into_iter()
            .map(|p| p.policy_id)
            .collect();
        assert_eq!(ids, vec!["P-A", "P-B", "P-C"]);
        assert_eq!(limiter.list_policies(None)[0].policy_id, "P-X");
    }

    #[tokio::test]
    async fn test_composite_scenario() {
        let limiter = create_seeded_limiter();

        let first = limiter.consume(request("U-1").with_cost(10.0)).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.policy_id.as_deref(), Some("P-1"));
        assert_eq!(first.remaining, Some(0.0));
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.reset_at, Some(at(60_000)));

        let second = limiter.consume(request("U-1").with_cost(1.0)).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.retry_after_ms, Some(1_000));
        assert_eq!(second.remaining, None);
        assert!(!second.results[0].allowed);
        assert!(second.results[1].allowed);
    }

    #[tokio::test]
    async fn test_denial_leaves_every_limit_untouched() {
        let (limiter, _clock) = create_test_limiter();
        let mut input = sample_input("P-1", "T-1");
        input.limits = vec![
            Limit::TokenBucket(TokenBucketLimit::new(100.0, 1.0)),
            Limit::FixedWindow(FixedWindowLimit::new(60, 2.0)),
        ];
        limiter.upsert_policy(input).unwrap();

        for _ in 0..2 {
            assert!(limiter.consume(request("U-1")).await.unwrap().allowed);
        }
        assert_eq!(bucket_tokens(&limiter, "U-1"), Some(98.0));

        let denied = limiter.consume(request("U-1")).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.results[0].allowed);
        // the bucket would have allowed, but nothing was taken from it
        assert_eq!(bucket_tokens(&limiter, "U-1"), Some(98.0));
        assert_eq!(window_used(&limiter, "U-1"), Some(2.0));
    }

    #[tokio::test]
    async fn test_check_never_mutates() {
        let limiter = create_seeded_limiter();

        for _ in 0..5 {
            let decision = limiter.check(request("U-1").with_cost(4.0)).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(6.0));
        }
        assert_eq!(bucket_tokens(&limiter, "U-1"), None);
        assert_eq!(window_used(&limiter, "U-1"), None);

        let mut dry = request("U-1").with_cost(4.0);
        dry.dry_run = true;
        assert!(limiter.consume(dry).await.unwrap().allowed);
        assert_eq!(bucket_tokens(&limiter, "U-1"), None);
    }

    #[tokio::test]
    async fn test_no_matching_policy_is_unlimited() {
        let limiter = create_seeded_limiter();
        let req = ConsumeRequest::new(
            "T-1",
            Subject::new(SubjectType::User, "U-1"),
            Resource::new(ResourceType::Endpoint, "/health"),
        )
        .with_request_id("health-1");

        let decision = limiter.consume(req.clone()).await.unwrap();
        assert_eq!(decision, Decision::unlimited());
        assert_eq!(limiter.storage().stores().idempotency.len(), 1);

        let conflict = limiter.consume(req.with_cost(2.0)).await.unwrap_err();
        assert!(matches!(conflict, TurnstileError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_idempotent_replay_consumes_once() {
        let limiter = create_seeded_limiter();
        let req = request("U-2").with_request_id("req-1").with_cost(2.0);

        let first = limiter.consume(req.clone()).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, Some(8.0));

        let replay = limiter.consume(req.clone().at(at(20_000))).await.unwrap();
        assert_eq!(replay, first);
        assert_eq!(bucket_tokens(&limiter, "U-2"), Some(8.0));
        assert_eq!(window_used(&limiter, "U-2"), Some(2.0));

        let next = limiter.consume(request("U-2")).await.unwrap();
        assert_eq!(next.remaining, Some(7.0));
    }

    #[tokio::test]
    async fn test_conflicting_reuse_fails_and_mutates_nothing() {
        let limiter = create_seeded_limiter();
        limiter
            .consume(request("U-3").with_request_id("req-1").with_cost(2.0))
            .await
            .unwrap();

        for changed in [
            request("U-3").with_request_id("req-1").with_cost(3.0),
            request("U-4").with_request_id("req-1").with_cost(2.0),
            request("U-3").with_request_id("req-1").with_cost(2.0).dry_run(),
        ] {
            let err = limiter.consume(changed).await.unwrap_err();
            assert!(matches!(err, TurnstileError::IdempotencyConflict(_)));
        }

        assert_eq!(bucket_tokens(&limiter, "U-3"), Some(8.0));
        assert_eq!(bucket_tokens(&limiter, "U-4"), None);

        let conflicts = limiter
            .list_audit_events(Some("T-1"), None)
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::IdempotencyConflict)
            .count();
        assert_eq!(conflicts, 3);
    }

    #[tokio::test]
    async fn test_expired_idempotency_entries_are_evicted() {
        let (limiter, _clock) = create_test_limiter();
        let limiter = limiter.with_idempotency_ttl(Duration::from_secs(1));
        limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();

        limiter
            .consume(request("U-5").with_request_id("req-1"))
            .await
            .unwrap();

        // same id, different payload, but the entry expired at t0 + 1s
        let later = limiter
            .consume(request("U-5").with_request_id("req-1").with_cost(3.0).at(at(1_000)))
            .await
            .unwrap();
        assert!(later.allowed);
        assert_eq!(bucket_tokens(&limiter, "U-5"), Some(7.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_respect_composite_bound() {
        let limiter = Arc::new(create_seeded_limiter());

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    let req = request("U-ACC")
                        .with_request_id(format!("acc-{}", i))
                        .at(at(10_000));
                    limiter.consume(req).await
                })
            })
            .collect();

        let mut allowed = 0;
        for result in futures::future::join_all(handles).await {
            if result.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }

        assert!(allowed <= 10, "allowed {} requests", allowed);
        assert_eq!(allowed, 10);
        assert_eq!(window_used(&limiter, "U-ACC"), Some(10.0));
    }

    #[tokio::test]
    async fn test_window_resets_at_boundary() {
        let (limiter, _clock) = create_test_limiter();
        let mut input = sample_input("P-1", "T-1");
        input.limits = vec![Limit::FixedWindow(FixedWindowLimit::new(60, 3.0))];
        limiter.upsert_policy(input).unwrap();

        let key_used = |limiter: &RateLimiter| {
            limiter
                .storage()
                .stores()
                .windows
                .get("T-1:P-1:USER:U-6:ENDPOINT:/api/v1/orders:FIXED_WINDOW:0")
                .map(|s| s.used)
        };

        for offset in [1_000, 20_000, 40_000] {
            assert!(limiter.consume(request("U-6").at(at(offset))).await.unwrap().allowed);
        }
        let denied = limiter.consume(request("U-6").at(at(59_999))).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(1));
        assert_eq!(key_used(&limiter), Some(3.0));

        let fresh = limiter.consume(request("U-6").at(at(60_000))).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, Some(2.0));
        assert_eq!(key_used(&limiter), Some(1.0));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_before_evaluation() {
        let limiter = create_seeded_limiter();

        let mut bad_now = request("U-7");
        bad_now.now = Some("yesterday-ish".to_string());
        let err = limiter.consume(bad_now).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));

        let err = limiter.consume(request("U-7").with_cost(0.0)).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));

        assert!(limiter.storage().stores().buckets.is_empty());
    }

    #[tokio::test]
    async fn test_max_cost_rejects_without_mutation() {
        let (limiter, _clock) = create_test_limiter();
        let mut input = sample_input("P-1", "T-1");
        input.limits = vec![
            Limit::FixedWindow(FixedWindowLimit::new(60, 100.0)),
            Limit::TokenBucket(TokenBucketLimit {
                max_cost: Some(5.0),
                ..TokenBucketLimit::new(50.0, 1.0)
            }),
        ];
        limiter.upsert_policy(input).unwrap();

        let err = limiter
            .consume(request("U-8").with_cost(6.0).with_request_id("big"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Validation(_)));
        assert!(limiter.storage().stores().windows.is_empty());
        assert!(limiter.storage().stores().idempotency.is_empty());
    }

    #[tokio::test]
    async fn test_subject_filter_routes_to_policy() {
        let (limiter, _clock) = create_test_limiter();
        limiter.upsert_policy(sample_input("P-DEFAULT", "T-1")).unwrap();

        let mut pro = sample_input("P-PRO", "T-1");
        pro.priority = 100;
        pro.match_rule.subject_filter =
            Some([("plan".to_string(), json!("pro"))].into_iter().collect());
        limiter.upsert_policy(pro).unwrap();

        let mut req = request("U-9");
        req.subject = req.subject.with_attribute("plan", json!("pro"));
        let decision = limiter.consume(req).await.unwrap();
        assert_eq!(decision.policy_id.as_deref(), Some("P-PRO"));

        let decision = limiter.consume(request("U-9")).await.unwrap();
        assert_eq!(decision.policy_id.as_deref(), Some("P-DEFAULT"));
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let limiter = create_seeded_limiter();
        limiter.upsert_policy(sample_input("P-2", "T-2")).unwrap();

        let exhaust = limiter.consume(request("U-1").with_cost(10.0)).await.unwrap();
        assert!(exhaust.allowed);

        let mut other = request("U-1").with_cost(10.0);
        other.tenant_id = "T-2".to_string();
        let decision = limiter.consume(other).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.policy_id.as_deref(), Some("P-2"));
    }

    #[tokio::test]
    async fn test_audit_log_records_required_events() {
        let (limiter, _clock) = create_test_limiter();
        let mut input = sample_input("P-AUDIT", "T-AUDIT");
        input.limits = vec![Limit::TokenBucket(TokenBucketLimit::new(1.0, 1.0))];
        limiter.upsert_policy(input).unwrap();
        limiter
            .patch_policy("P-AUDIT", PolicyPatch { priority: Some(101), ..Default::default() })
            .unwrap();

        let mut req = request("U-AUDIT");
        req.tenant_id = "T-AUDIT".to_string();

        assert!(limiter.consume(req.clone().with_request_id("allow-1")).await.unwrap().allowed);
        assert!(!limiter.consume(req.clone().with_request_id("deny-1")).await.unwrap().allowed);
        let conflict = limiter
            .consume(req.clone().with_request_id("deny-1").with_cost(2.0))
            .await;
        assert!(conflict.is_err());

        let events = limiter.list_audit_events(Some("T-AUDIT"), Some(50));
        let types: HashSet<AuditEventType> = events.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&AuditEventType::PolicyUpsert));
        assert!(types.contains(&AuditEventType::PolicyPatch));
        assert!(types.contains(&AuditEventType::RequestDenied));
        assert!(types.contains(&AuditEventType::IdempotencyConflict));

        // most recent first, capped
        let latest = limiter.list_audit_events(Some("T-AUDIT"), Some(1));
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].event_type, AuditEventType::IdempotencyConflict);
        assert!(limiter.list_audit_events(Some("T-1"), None).is_empty());
    }

    #[tokio::test]
    async fn test_request_ids_do_not_collide_across_tenants() {
        let (limiter, _clock) = create_test_limiter();

        let mut first = request("U-1").with_request_id("c");
        first.tenant_id = "a:b".to_string();
        assert!(limiter.consume(first).await.unwrap().allowed);

        let mut second = request("U-1").with_request_id("b:c").with_cost(2.0);
        second.tenant_id = "a".to_string();
        let decision = limiter.consume(second).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(limiter.storage().stores().idempotency.len(), 2);
    }

    #[tokio::test]
    async fn test_limit_state_does_not_collide_across_tenants() {
        let (limiter, _clock) = create_test_limiter();
        limiter.upsert_policy(sample_input("c", "a:b")).unwrap();
        limiter.upsert_policy(sample_input("b:c", "a")).unwrap();

        let mut exhaust = request("U-1").with_cost(10.0);
        exhaust.tenant_id = "a:b".to_string();
        let decision = limiter.consume(exhaust).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.policy_id.as_deref(), Some("c"));

        let mut other = request("U-1");
        other.tenant_id = "a".to_string();
        let decision = limiter.consume(other).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.policy_id.as_deref(), Some("b:c"));
        assert_eq!(decision.remaining, Some(9.0));
    }

    #[tokio::test]
    async fn test_state_survives_restart_with_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime-state.json");

        let (first_decision, policies, audit_events) = {
            let storage = Arc::new(FileStorage::open(&path).unwrap());
            let clock = Arc::new(FixedClock::new(t0()));
            let limiter = RateLimiter::new(storage).with_clock(clock);
            limiter.upsert_policy(sample_input("P-1", "T-1")).unwrap();

            let decision = limiter
                .consume(request("U-1").with_request_id("persist-1").with_cost(3.0))
                .await
                .unwrap();
            (
                decision,
                limiter.list_policies(None),
                limiter.list_audit_events(None, None),
            )
        };

        let storage = Arc::new(FileStorage::open(&path).unwrap());
        let limiter = RateLimiter::new(storage);
        assert_eq!(limiter.list_policies(None), policies);

        let restored_events = limiter.list_audit_events(None, None);
        assert_eq!(restored_events, audit_events);
        let upsert = restored_events
            .iter()
            .find(|e| e.event_type == AuditEventType::PolicyUpsert)
            .expect("upsert event restored");
        assert_eq!(upsert.tenant_id, "T-1");
        assert_eq!(upsert.payload["policy_id"], "P-1");

        let replay = limiter
            .consume(request("U-1").with_request_id("persist-1").with_cost(3.0).at(at(1)))
            .await
            .unwrap();
        assert_eq!(replay, first_decision);

        let next = limiter.consume(request("U-1")).await.unwrap();
        assert_eq!(next.remaining, Some(6.0));

        let err = limiter
            .consume(request("U-1").with_request_id("persist-1").with_cost(4.0).at(at(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::IdempotencyConflict(_)));
        assert!(!limiter.list_audit_events(Some("T-1"), None).is_empty());
    }

    #[test]
    fn test_from_config_selects_backend() {
        let limiter = RateLimiter::from_config(&EngineConfig::default()).unwrap();
        assert_eq!(limiter.storage().describe(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.storage.backend = StorageBackendKind::File;
        config.storage.state_file = dir.path().join("state.json");
        let limiter = RateLimiter::from_config(&config).unwrap();
        assert!(limiter.storage().describe().starts_with("file:"));
    }
}
