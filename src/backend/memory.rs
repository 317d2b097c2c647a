use crate::backend::{Backend, RateLimitDecision, SlidingWindowInput, Unavailable};
use crate::clock::{Clock, SystemClock};
use actix_web::rt::task::JoinHandle;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A sliding window log [Backend] that keeps its state in process memory.
///
/// This is the last resort tier. It is only correct within a single process: every instance
/// keeps its own independent windows, so when several instances fall back to memory at the same
/// time the effective global admission rate can exceed the configured limit.
///
/// Keys are guarded by the shard locks of the [DashMap], so concurrent checks of the same key
/// within this process are serialized.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Window>>,
    gc_handle: Option<Arc<JoinHandle<()>>>,
}

struct Window {
    timestamps: VecDeque<u64>,
    expires_at: u64,
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            clock: Arc::new(SystemClock),
        }
    }

    fn garbage_collector(
        map: Arc<DashMap<String, Window>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = clock.now_millis();
                map.retain(|_k, v| v.expires_at > now);
                actix_web::rt::time::sleep(interval).await;
            }
        })
    }

    /// Runs one sliding window step for the key. Never fails.
    pub fn check(&self, input: &SlidingWindowInput, now_millis: u64) -> RateLimitDecision {
        let window = input.window_millis();
        let cutoff = now_millis.saturating_sub(window);
        let mut entry = self
            .map
            .entry(input.key.clone())
            .or_insert_with(|| Window {
                timestamps: VecDeque::new(),
                expires_at: input.window_end(now_millis),
            });
        while entry.timestamps.front().is_some_and(|t| *t <= cutoff) {
            entry.timestamps.pop_front();
        }
        let mut count = entry.timestamps.len() as u64;
        let allowed = count < input.max_requests;
        if allowed {
            entry.timestamps.push_back(now_millis);
            count += 1;
        }
        entry.expires_at = input.window_end(now_millis);
        input.decide(allowed, count, now_millis)
    }

    /// Removes the window for a given rate limit key.
    pub fn remove_key(&self, key: &str) {
        self.map.remove(key);
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn request(
        &self,
        input: &SlidingWindowInput,
        now_millis: u64,
    ) -> Result<RateLimitDecision, Unavailable> {
        Ok(self.check(input, now_millis))
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        // Only the last clone stops the collector.
        if let Some(handle) = &self.gc_handle {
            if Arc::strong_count(handle) == 1 {
                handle.abort();
            }
        }
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired windows.
    /// A sweep may race with a live check of a key that is just expiring, which only drops
    /// timestamps that would have been pruned anyway.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Clock consulted by the garbage collector.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Must be called from within an actix (or tokio `LocalSet`) runtime when garbage collection
    /// is enabled.
    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Window>::new());
        let clock = self.clock;
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(InMemoryBackend::garbage_collector(
                map.clone(),
                clock,
                gc_interval,
            ))
        });
        InMemoryBackend { map, gc_handle }
    }
}
