//! Redis-aligned clock.
//!
//! Scores written by different nodes must agree on "now", so every node
//! derives its clock from Redis `TIME`. The offset between Redis and the local
//! wall clock is cached for a short period and refreshed once per tick.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Local wall clock in epoch milliseconds.
pub fn local_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whole-second score for a point `delay_ms` after `now_ms`.
pub fn score_at(now_ms: i64, delay_ms: i64) -> i64 {
    (now_ms + delay_ms).div_euclid(1000)
}

/// Cached offset between Redis `TIME` and the local clock.
pub struct TimeSource {
    redis: ConnectionManager,
    cache_duration: Duration,
    offset_ms: AtomicI64,
    last_sync: Mutex<Option<Instant>>,
}

impl TimeSource {
    pub fn new(redis: ConnectionManager, cache_duration: Duration) -> Self {
        Self {
            redis,
            cache_duration,
            offset_ms: AtomicI64::new(0),
            last_sync: Mutex::new(None),
        }
    }

    /// Re-reads Redis `TIME` when the cached offset has expired.
    pub async fn refresh(&self) {
        let fresh = self
            .last_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() < self.cache_duration);
        if !fresh {
            self.sync().await;
        }
    }

    /// Re-reads Redis `TIME` unconditionally. On failure the previous offset
    /// stays in use.
    pub async fn sync(&self) {
        let mut conn = self.redis.clone();
        let before = local_now_ms();
        match redis::cmd("TIME")
            .query_async::<_, (i64, i64)>(&mut conn)
            .await
        {
            Ok((secs, micros)) => {
                let after = local_now_ms();
                let redis_ms = secs * 1000 + micros / 1000;
                let offset = redis_ms - (before + after) / 2;
                self.offset_ms.store(offset, Ordering::Relaxed);
                *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                debug!(offset_ms = offset, "Synchronized with Redis TIME");
            }
            Err(e) => {
                warn!(error = %e, "Redis TIME failed, keeping previous clock offset");
            }
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Current Redis-aligned time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        local_now_ms() + self.offset_ms()
    }

    /// Current Redis-aligned time in whole epoch seconds.
    pub fn now_seconds(&self) -> i64 {
        score_at(self.now_ms(), 0)
    }

    /// Score for a point `delay_ms` from now.
    pub fn score_after(&self, delay_ms: i64) -> i64 {
        score_at(self.now_ms(), delay_ms)
    }
}
