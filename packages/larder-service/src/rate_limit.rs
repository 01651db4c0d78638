//! Token bucket gating language-model calls.
//!
//! One limiter is shared by every call site of a service instance. Callers over budget wait for a
//! token instead of failing.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

const MIN_RATE: f64 = 0.001;

pub struct RateLimiter {
	bucket: Mutex<TokenBucket>,
}
impl RateLimiter {
	/// Refills at `requests_per_second` up to `burst` tokens. The bucket starts full.
	pub fn new(requests_per_second: f64, burst: u32) -> Self {
		let rate = if requests_per_second.is_finite() {
			requests_per_second.max(MIN_RATE)
		} else {
			MIN_RATE
		};
		let capacity = f64::from(burst.max(1));

		Self {
			bucket: Mutex::new(TokenBucket {
				tokens: capacity,
				last_refill: Instant::now(),
				capacity,
				rate,
			}),
		}
	}

	pub fn from_config(cfg: &larder_config::RateLimit) -> Self {
		Self::new(cfg.requests_per_second, cfg.burst)
	}

	/// Waits until a token is available and consumes it.
	pub async fn acquire(&self) {
		loop {
			let wait = {
				let mut bucket = self.bucket.lock().await;

				match bucket.take() {
					Ok(()) => return,
					Err(wait) => wait,
				}
			};

			tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limited; waiting for a token.");
			tokio::time::sleep(wait).await;
		}
	}

	/// Consumes a token if one is available right now.
	pub async fn try_acquire(&self) -> bool {
		self.bucket.lock().await.take().is_ok()
	}
}

struct TokenBucket {
	tokens: f64,
	last_refill: Instant,
	capacity: f64,
	rate: f64,
}
impl TokenBucket {
	/// Takes one token, or returns how long until one is available.
	fn take(&mut self) -> Result<(), Duration> {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();

		self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
		self.last_refill = now;

		if self.tokens >= 1.0 {
			self.tokens -= 1.0;

			return Ok(());
		}

		Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
	}
}
