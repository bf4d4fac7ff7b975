//! Fixed window evaluation.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::policy::{FixedWindowLimit, LimitKind};
use super::request::{round6, LimitResult};
use super::StateCommit;

/// Persisted counter for one fixed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCounterState {
    /// Epoch-aligned start of the window `used` belongs to
    pub window_start_ms: i64,
    pub used: f64,
    pub updated_at_ms: i64,
}

/// Result of evaluating a window, with the deferred state write.
#[derive(Debug, Clone)]
pub struct WindowEvaluation {
    pub result: LimitResult,
    pub commit: Option<StateCommit>,
}

/// Start of the window containing `now_ms`, aligned to the epoch.
pub fn window_start(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.div_euclid(window_ms) * window_ms
}

/// Evaluate a fixed window for `cost` at `now_ms`.
///
/// A stored counter from a different window is treated as empty.
pub fn evaluate(
    limit: &FixedWindowLimit,
    key: &str,
    state: Option<&WindowCounterState>,
    now_ms: i64,
    cost: f64,
) -> WindowEvaluation {
    let window_ms = i64::try_from(limit.window_seconds)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    let start_ms = window_start(now_ms, window_ms);

    let used = match state {
        Some(s) if s.window_start_ms == start_ms => s.used,
        _ => 0.0,
    };

    let candidate_used = used + cost;
    let allowed = candidate_used <= limit.limit;
    let used_after = if allowed { candidate_used } else { used };

    let reset_at_ms = start_ms.saturating_add(window_ms);
    let retry_after_ms = if allowed {
        None
    } else {
        Some((reset_at_ms - now_ms).max(0) as u64)
    };

    let commit = allowed.then(|| StateCommit::Window {
        key: key.to_string(),
        state: WindowCounterState {
            window_start_ms: start_ms,
            used: used_after,
            updated_at_ms: now_ms,
        },
    });

    WindowEvaluation {
        result: LimitResult {
            kind: LimitKind::FixedWindow,
            allowed,
            remaining: Some(round6((limit.limit - used_after).max(0.0))),
            retry_after_ms,
            reset_at: Utc.timestamp_millis_opt(reset_at_ms).single(),
        },
        commit,
    }
}
