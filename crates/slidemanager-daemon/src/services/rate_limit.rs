//! Dual token-bucket limiter (requests/min + tokens/min) and retry backoff.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BACKOFF_BASE_SEC: f64 = 0.5;
const BACKOFF_CAP_SEC: f64 = 20.0;
/// Longest single sleep while waiting on the buckets; keeps cancellation
/// checks in callers responsive.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(2);
const MIN_WAIT_SLICE: Duration = Duration::from_millis(50);

struct BucketState {
    req_tokens: f64,
    tok_tokens: f64,
    last: Instant,
}

/// Two independent buckets refilled continuously; `acquire` deducts from
/// both or sleeps for the computed shortfall. Burst capacity is one minute
/// of budget.
pub struct DualTokenBucket {
    req_rate: f64,
    tok_rate: f64,
    req_capacity: f64,
    tok_capacity: f64,
    state: Mutex<BucketState>,
}

impl DualTokenBucket {
    pub fn new(req_per_min: u32, tok_per_min: u32) -> Self {
        let req_capacity = f64::from(req_per_min);
        let tok_capacity = f64::from(tok_per_min);
        Self {
            req_rate: req_capacity / 60.0,
            tok_rate: tok_capacity / 60.0,
            req_capacity,
            tok_capacity,
            state: Mutex::new(BucketState {
                req_tokens: req_capacity,
                tok_tokens: tok_capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Block cooperatively until both buckets can cover the cost, then
    /// deduct. Sleeps for the computed shortfall rather than spinning.
    pub async fn acquire(&self, req_cost: f64, tok_cost: f64) {
        debug_assert!(req_cost >= 0.0);
        debug_assert!(tok_cost >= 0.0);
        debug_assert!(req_cost <= self.req_capacity || self.req_capacity == 0.0);

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last).as_secs_f64();
                state.last = now;
                state.req_tokens =
                    (state.req_tokens + elapsed * self.req_rate).min(self.req_capacity);
                state.tok_tokens =
                    (state.tok_tokens + elapsed * self.tok_rate).min(self.tok_capacity);

                if state.req_tokens >= req_cost && state.tok_tokens >= tok_cost {
                    state.req_tokens -= req_cost;
                    state.tok_tokens -= tok_cost;
                    return;
                }

                let need_req = (req_cost - state.req_tokens).max(0.0);
                let need_tok = (tok_cost - state.tok_tokens).max(0.0);
                let wait_req = if self.req_rate > 0.0 {
                    need_req / self.req_rate
                } else {
                    0.5
                };
                let wait_tok = if self.tok_rate > 0.0 {
                    need_tok / self.tok_rate
                } else {
                    0.5
                };
                Duration::from_secs_f64(wait_req.max(wait_tok))
            };
            tokio::time::sleep(wait.clamp(MIN_WAIT_SLICE, MAX_WAIT_SLICE)).await;
        }
    }
}

/// Exponential backoff with jitter: `min(cap, base * 2^attempt)` scaled by a
/// factor in `[0.5, 1.0)`. Production callers use the thread RNG.
pub fn backoff_delay(attempt: u32) -> Duration {
    backoff_delay_with(&mut rand::thread_rng(), attempt)
}

/// Same as [`backoff_delay`], with the jitter source injected so tests can
/// pin a seed.
pub fn backoff_delay_with<R: Rng>(rng: &mut R, attempt: u32) -> Duration {
    let exponent = attempt.min(20);
    let raw = BACKOFF_BASE_SEC * f64::from(2_u32.saturating_pow(exponent));
    let capped = raw.min(BACKOFF_CAP_SEC);
    let jitter = 0.5 + rng.gen_range(0.0..0.5);
    Duration::from_secs_f64(capped * jitter)
}
