use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};

/// Token bucket gating outbound EC2 calls with a configured sustained rate
/// and burst. Waiters queue on the internal lock, so acquisition is fair
/// in arrival order.
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            qps: qps.max(1) as f64,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
            state.refilled_at = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }
            let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.qps);
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let limiter = RateLimiter::new(10, 2);

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third call has to wait for a refill at 10 qps.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let limiter = RateLimiter::new(10, 1);
        limiter.acquire().await;

        tokio::time::advance(Duration::from_millis(200)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
