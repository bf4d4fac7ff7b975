//! Token bucket evaluation.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_tokens_per_sec`. Evaluation is pure: it reads the current state and
//! returns a result plus the state that should be stored if the composite
//! decision ends up allowing the request.

use serde::{Deserialize, Serialize};

use super::policy::{LimitKind, TokenBucketLimit};
use super::request::{round6, LimitResult};
use super::StateCommit;
use crate::error::{Result, TurnstileError};

/// Persisted state of one token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Always within `[0, capacity]`
    pub tokens: f64,
    pub last_refill_at_ms: i64,
    pub updated_at_ms: i64,
}

impl BucketState {
    /// A bucket that has never been evaluated.
    pub fn fresh(limit: &TokenBucketLimit, now_ms: i64) -> Self {
        Self {
            tokens: limit.initial_tokens(),
            last_refill_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// Result of evaluating a bucket, with the deferred state write.
#[derive(Debug, Clone)]
pub struct BucketEvaluation {
    pub result: LimitResult,
    /// Present only when this limit allowed the request
    pub commit: Option<StateCommit>,
}

/// Evaluate a token bucket for `cost` at `now_ms`.
///
/// Time never runs backwards for refill purposes: if `now_ms` is earlier than
/// the last refill, the last refill instant is used instead.
pub fn evaluate(
    limit: &TokenBucketLimit,
    key: &str,
    state: Option<&BucketState>,
    now_ms: i64,
    cost: f64,
) -> Result<BucketEvaluation> {
    if let Some(max_cost) = limit.max_cost {
        if cost > max_cost {
            return Err(TurnstileError::validation(format!(
                "cost exceeds max_cost for TOKEN_BUCKET: {}",
                max_cost
            )));
        }
    }

    let base = state
        .cloned()
        .unwrap_or_else(|| BucketState::fresh(limit, now_ms));

    let effective_now_ms = now_ms.max(base.last_refill_at_ms);
    let elapsed_secs = (effective_now_ms - base.last_refill_at_ms) as f64 / 1000.0;
    let refilled = limit
        .capacity
        .min(base.tokens + elapsed_secs * limit.refill_tokens_per_sec);

    let allowed = refilled >= cost;
    let next_tokens = if allowed { refilled - cost } else { refilled };
    let tokens_after = next_tokens.clamp(0.0, limit.capacity);

    let retry_after_ms = if allowed {
        None
    } else {
        let wait_ms = ((cost - refilled) / limit.refill_tokens_per_sec * 1000.0).ceil();
        Some(wait_ms.max(0.0) as u64)
    };

    let commit = allowed.then(|| StateCommit::Bucket {
        key: key.to_string(),
        state: BucketState {
            tokens: tokens_after,
            last_refill_at_ms: effective_now_ms,
            updated_at_ms: effective_now_ms,
        },
    });

    Ok(BucketEvaluation {
        result: LimitResult {
            kind: LimitKind::TokenBucket,
            allowed,
            remaining: Some(round6(tokens_after)),
            retry_after_ms,
            reset_at: None,
        },
        commit,
    })
}
