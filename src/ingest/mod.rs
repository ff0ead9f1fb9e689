pub mod backfill;
pub mod hydrate;
pub mod messages;
pub mod normalize;
pub mod polymarket_ws;
pub mod rest_poller;
pub mod subscription;

use async_trait::async_trait;

use crate::config::RATE_LIMIT_BACKOFF_MS;

/// Common outward contract for every venue adapter, streaming or polling.
/// Normalized events are delivered over the mpsc sender handed to the
/// adapter at construction; the adapter never blocks on a full channel.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn the adapter's internal tasks. Idempotent.
    async fn start(&self);

    /// Stop accepting work and wind down connections.
    async fn stop(&self);

    fn subscribe(&self, instrument: &str);

    fn unsubscribe(&self, instrument: &str);

    fn subscribed(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Bounded exponential backoff. Rate-limit responses jump the delay to at
/// least 30 s before the usual doubling/clamping.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            current_ms: base_ms,
        }
    }

    /// Delay to apply before the next attempt, without jitter.
    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// Delay with up to 25% additive jitter.
    pub fn jittered_ms(&self) -> u64 {
        let jitter_span = (self.current_ms / 4).max(1);
        self.current_ms + rand::random::<u64>() % jitter_span
    }

    pub fn on_success(&mut self) {
        self.current_ms = self.base_ms;
    }

    pub fn on_failure(&mut self) {
        self.current_ms = (self.current_ms.saturating_mul(2)).min(self.max_ms);
    }

    /// Venue said "Too Many Requests": double, but never below 30 s.
    pub fn on_rate_limit(&mut self) {
        let doubled = self.current_ms.saturating_mul(2).max(RATE_LIMIT_BACKOFF_MS);
        self.current_ms = doubled.min(self.max_ms.max(RATE_LIMIT_BACKOFF_MS));
    }
}

/// Matches the venue's throttling responses at handshake or mid-stream.
pub fn is_rate_limited(msg: &str) -> bool {
    msg.contains("Too Many Requests") || msg.contains("429")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut b = BackoffPolicy::new(500, 8_000);
        assert_eq!(b.current_ms(), 500);
        b.on_failure();
        assert_eq!(b.current_ms(), 1_000);
        for _ in 0..10 {
            b.on_failure();
        }
        assert_eq!(b.current_ms(), 8_000);
        b.on_success();
        assert_eq!(b.current_ms(), 500);
    }

    #[test]
    fn rate_limit_jumps_to_thirty_seconds_then_doubles() {
        let mut b = BackoffPolicy::new(500, 120_000);
        b.on_rate_limit();
        assert_eq!(b.current_ms(), 30_000);
        // Subsequent offense doubles to at least 60 s.
        b.on_rate_limit();
        assert_eq!(b.current_ms(), 60_000);
        b.on_rate_limit();
        b.on_rate_limit();
        // Clamped at max_backoff_ms.
        assert_eq!(b.current_ms(), 120_000);
    }

    #[test]
    fn rate_limit_respects_floor_even_with_small_max() {
        let mut b = BackoffPolicy::new(500, 5_000);
        b.on_rate_limit();
        assert_eq!(b.current_ms(), 30_000);
    }

    #[test]
    fn detects_throttling_responses() {
        assert!(is_rate_limited("HTTP error: 429 Too Many Requests"));
        assert!(is_rate_limited("429"));
        assert!(!is_rate_limited("connection reset by peer"));
    }
}
