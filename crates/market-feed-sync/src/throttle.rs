use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::error::UpstreamError;

/// Enforces a minimum spacing between consecutive requests.
///
/// Not a token bucket: idle time earns no credit, it only guarantees that
/// two requests are never closer together than `min_interval`.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// At most `rate` requests per second.
    pub fn per_second(rate: f64) -> Result<Self, UpstreamError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(UpstreamError::Config(format!(
                "rate limit must be a positive number of requests per second, got {rate}"
            )));
        }
        let interval = Duration::try_from_secs_f64(1.0 / rate).map_err(|e| {
            UpstreamError::Config(format!("rate limit {rate} is too small: {e}"))
        })?;
        Ok(Self::new(interval))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleep until `min_interval` has passed since the previous request,
    /// then record now as the latest request time. The lock is held while
    /// sleeping so callers are released one at a time.
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let remaining = self.min_interval - elapsed;
                trace!("throttling for {remaining:?}");
                tokio::time::sleep(remaining).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_second_rejects_bad_rates() {
        assert!(Throttle::per_second(0.0).is_err());
        assert!(Throttle::per_second(-3.0).is_err());
        assert!(Throttle::per_second(f64::NAN).is_err());
        assert!(Throttle::per_second(f64::INFINITY).is_err());
    }

    #[test]
    fn per_second_rejects_rates_too_small_to_represent() {
        match Throttle::per_second(1e-20) {
            Err(UpstreamError::Config(msg)) => assert!(msg.contains("too small"), "{msg}"),
            other => panic!("expected Config error, got {other:?}"),
        }
        assert!(Throttle::per_second(f64::MIN_POSITIVE).is_err());
        assert_eq!(
            Throttle::per_second(0.01).unwrap().min_interval(),
            Duration::from_secs(100)
        );
    }

    #[test]
    fn per_second_sets_interval() {
        let throttle = Throttle::per_second(10.0).unwrap();
        assert_eq!(throttle.min_interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_is_not_delayed() {
        let throttle = Throttle::per_second(1.0).unwrap();
        let start = Instant::now();
        throttle.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn n_requests_take_at_least_n_minus_one_intervals() {
        let rate = 4.0;
        let n = 9;
        let throttle = Throttle::per_second(rate).unwrap();

        let start = Instant::now();
        for _ in 0..n {
            throttle.wait().await;
        }
        let min = Duration::from_secs_f64((n - 1) as f64 / rate);
        assert!(start.elapsed() >= min, "elapsed {:?} < {min:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_earns_no_burst() {
        let throttle = Throttle::new(Duration::from_millis(500));
        throttle.wait().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let start = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        let throttle = std::sync::Arc::new(Throttle::new(Duration::from_millis(200)));
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let t = throttle.clone();
                tokio::spawn(async move { t.wait().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(800));
    }
}
