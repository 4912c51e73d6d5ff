//! Shared cache/queue adapter.
//!
//! One abstraction serves three roles for the whole engine: short-lived
//! key/value status mirrors, the global FIFO pending queue of subtask
//! ids (with its companion in-progress set), and the pub/sub channel
//! space with per-client mailboxes for briefly disconnected consumers.
//!
//! [`CacheBackend`] is the seam: [`MemoryBackend`] keeps everything
//! in-process (moka for TTL'd mirrors, one mutex for the queue + set so
//! requeue is atomic, broadcast channels for fan-out); a networked
//! backend can implement the same trait for multi-replica deployments.
//!
//! [`CacheService`] wraps the backend with the cache circuit breaker.
//! When the breaker is open, rate-limit checks degrade to an in-process
//! fixed window, status reads report a miss (callers fall back to the
//! authoritative store), and mirror writes are dropped; queue
//! operations propagate the failure because the engine must not guess
//! about queue state.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::error::KernelResult;

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

/// The operations every cache/queue backend must provide.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    // Pending queue and in-progress set.
    async fn queue_push(&self, id: Uuid) -> KernelResult<()>;
    async fn queue_pop(&self) -> KernelResult<Option<Uuid>>;
    async fn queue_len(&self) -> KernelResult<usize>;
    /// Remove `id` from the pending queue and add it to the in-progress
    /// set, as one step (the bind-side half of the queue script).
    async fn mark_in_progress(&self, id: Uuid) -> KernelResult<()>;
    /// Remove `id` from the in-progress set and push it to the queue
    /// tail, as one step; never observable as both or neither.
    async fn requeue_atomic(&self, id: Uuid) -> KernelResult<()>;
    /// Drop `id` from both structures (terminal subtask or cancellation).
    async fn remove_live(&self, id: Uuid) -> KernelResult<()>;
    async fn in_progress_count(&self) -> KernelResult<usize>;

    // Status mirrors.
    async fn set_status(
        &self,
        entity: &str,
        id: Uuid,
        value: &str,
        ttl: Duration,
    ) -> KernelResult<()>;
    async fn get_status(&self, entity: &str, id: Uuid) -> KernelResult<Option<String>>;
    async fn get_many_statuses(
        &self,
        entity: &str,
        ids: &[Uuid],
    ) -> KernelResult<Vec<Option<String>>>;
    async fn clear_status(&self, entity: &str, id: Uuid) -> KernelResult<()>;

    // Pub/sub.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> KernelResult<usize>;
    async fn subscribe(&self, channel: &str)
        -> KernelResult<broadcast::Receiver<Arc<ChannelMessage>>>;

    // Per-client mailboxes.
    async fn mailbox_push(&self, client: &str, payload: Vec<u8>, ttl: Duration)
        -> KernelResult<()>;
    /// Pop every entry and delete the mailbox, atomically.
    async fn mailbox_drain(&self, client: &str) -> KernelResult<Vec<Vec<u8>>>;

    // Rate limiting (fixed window).
    async fn check_rate_limit(
        &self,
        scope: &str,
        limit: u32,
        window: Duration,
    ) -> KernelResult<RateLimitDecision>;
}

// ── in-process backend ───────────────────────────────────────────────

struct StatusExpiry;

impl Expiry<String, (String, Duration)> for StatusExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &(String, Duration),
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.1)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    in_progress: HashSet<Uuid>,
}

/// In-process implementation of [`CacheBackend`].
pub struct MemoryBackend {
    queue: Mutex<QueueState>,
    statuses: Cache<String, (String, Duration)>,
    channels: DashMap<String, broadcast::Sender<Arc<ChannelMessage>>>,
    mailboxes: DashMap<String, Vec<(Instant, Vec<u8>)>>,
    windows: DashMap<String, (Instant, u32)>,
    channel_capacity: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(QueueState::default()),
            statuses: Cache::builder()
                .max_capacity(100_000)
                .expire_after(StatusExpiry)
                .build(),
            channels: DashMap::new(),
            mailboxes: DashMap::new(),
            windows: DashMap::new(),
            channel_capacity: 256,
        }
    }

    fn queue_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status_key(entity: &str, id: Uuid) -> String {
        format!("{entity}:{id}:status")
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Arc<ChannelMessage>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn queue_push(&self, id: Uuid) -> KernelResult<()> {
        let mut state = self.queue_state();
        if !state.pending.contains(&id) {
            state.pending.push_back(id);
        }
        Ok(())
    }

    async fn queue_pop(&self) -> KernelResult<Option<Uuid>> {
        Ok(self.queue_state().pending.pop_front())
    }

    async fn queue_len(&self) -> KernelResult<usize> {
        Ok(self.queue_state().pending.len())
    }

    async fn mark_in_progress(&self, id: Uuid) -> KernelResult<()> {
        let mut state = self.queue_state();
        state.pending.retain(|queued| *queued != id);
        state.in_progress.insert(id);
        Ok(())
    }

    async fn requeue_atomic(&self, id: Uuid) -> KernelResult<()> {
        let mut state = self.queue_state();
        state.in_progress.remove(&id);
        if !state.pending.contains(&id) {
            state.pending.push_back(id);
        }
        Ok(())
    }

    async fn remove_live(&self, id: Uuid) -> KernelResult<()> {
        let mut state = self.queue_state();
        state.pending.retain(|queued| *queued != id);
        state.in_progress.remove(&id);
        Ok(())
    }

    async fn in_progress_count(&self) -> KernelResult<usize> {
        Ok(self.queue_state().in_progress.len())
    }

    async fn set_status(
        &self,
        entity: &str,
        id: Uuid,
        value: &str,
        ttl: Duration,
    ) -> KernelResult<()> {
        self.statuses
            .insert(Self::status_key(entity, id), (value.to_string(), ttl))
            .await;
        Ok(())
    }

    async fn get_status(&self, entity: &str, id: Uuid) -> KernelResult<Option<String>> {
        Ok(self
            .statuses
            .get(&Self::status_key(entity, id))
            .await
            .map(|(value, _)| value))
    }

    async fn get_many_statuses(
        &self,
        entity: &str,
        ids: &[Uuid],
    ) -> KernelResult<Vec<Option<String>>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(
                self.statuses
                    .get(&Self::status_key(entity, *id))
                    .await
                    .map(|(value, _)| value),
            );
        }
        Ok(out)
    }

    async fn clear_status(&self, entity: &str, id: Uuid) -> KernelResult<()> {
        self.statuses.invalidate(&Self::status_key(entity, id)).await;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> KernelResult<usize> {
        let message = Arc::new(ChannelMessage {
            channel: channel.to_string(),
            payload,
        });
        let receivers = match self.channels.get(channel) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        };
        trace!(channel, receivers, "message published");
        Ok(receivers)
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> KernelResult<broadcast::Receiver<Arc<ChannelMessage>>> {
        Ok(self.sender_for(channel).subscribe())
    }

    async fn mailbox_push(
        &self,
        client: &str,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> KernelResult<()> {
        let deadline = Instant::now() + ttl;
        self.mailboxes
            .entry(client.to_string())
            .or_default()
            .push((deadline, payload));
        Ok(())
    }

    async fn mailbox_drain(&self, client: &str) -> KernelResult<Vec<Vec<u8>>> {
        let now = Instant::now();
        let drained = self
            .mailboxes
            .remove(client)
            .map(|(_, entries)| {
                entries
                    .into_iter()
                    .filter(|(deadline, _)| *deadline > now)
                    .map(|(_, payload)| payload)
                    .collect()
            })
            .unwrap_or_default();
        Ok(drained)
    }

    async fn check_rate_limit(
        &self,
        scope: &str,
        limit: u32,
        window: Duration,
    ) -> KernelResult<RateLimitDecision> {
        Ok(fixed_window(&self.windows, scope, limit, window))
    }
}

/// Shared fixed-window arithmetic, also used by the degraded fallback.
fn fixed_window(
    windows: &DashMap<String, (Instant, u32)>,
    scope: &str,
    limit: u32,
    window: Duration,
) -> RateLimitDecision {
    let now = Instant::now();
    let mut entry = windows.entry(scope.to_string()).or_insert((now, 0));
    let (start, count) = *entry;

    if now.duration_since(start) >= window {
        *entry = (now, 1);
        return RateLimitDecision {
            allowed: true,
            remaining: limit.saturating_sub(1),
            retry_after_secs: 0,
        };
    }

    if count >= limit {
        let retry_after = window.saturating_sub(now.duration_since(start));
        return RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs: retry_after.as_secs().max(1),
        };
    }

    *entry = (start, count + 1);
    RateLimitDecision {
        allowed: true,
        remaining: limit.saturating_sub(count + 1),
        retry_after_secs: 0,
    }
}

// ── breaker-wrapped service ──────────────────────────────────────────

/// The engine-facing cache handle: backend + breaker + degraded-mode
/// fallbacks.
#[derive(Clone)]
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    breaker: CircuitBreaker,
    fallback_windows: Arc<DashMap<String, (Instant, u32)>>,
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>, breaker: CircuitBreaker) -> Self {
        Self {
            backend,
            breaker,
            fallback_windows: Arc::new(DashMap::new()),
        }
    }

    /// In-process backend behind a cache-profile breaker, for tests and
    /// single-replica deployments.
    pub fn in_memory(breaker: CircuitBreaker) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), breaker)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T>(
        &self,
        result: impl std::future::Future<Output = KernelResult<T>>,
    ) -> KernelResult<T> {
        self.breaker.check()?;
        match result.await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    // Queue operations: failures propagate, the engine must not guess.

    pub async fn queue_push(&self, id: Uuid) -> KernelResult<()> {
        self.guarded(self.backend.queue_push(id)).await
    }

    pub async fn queue_pop(&self) -> KernelResult<Option<Uuid>> {
        self.guarded(self.backend.queue_pop()).await
    }

    pub async fn queue_len(&self) -> KernelResult<usize> {
        self.guarded(self.backend.queue_len()).await
    }

    pub async fn mark_in_progress(&self, id: Uuid) -> KernelResult<()> {
        self.guarded(self.backend.mark_in_progress(id)).await
    }

    pub async fn requeue_atomic(&self, id: Uuid) -> KernelResult<()> {
        self.guarded(self.backend.requeue_atomic(id)).await
    }

    pub async fn remove_live(&self, id: Uuid) -> KernelResult<()> {
        self.guarded(self.backend.remove_live(id)).await
    }

    pub async fn in_progress_count(&self) -> KernelResult<usize> {
        self.guarded(self.backend.in_progress_count()).await
    }

    // Status mirrors: advisory, degrade silently.

    pub async fn set_status(&self, entity: &str, id: Uuid, value: &str, ttl: Duration) {
        if let Err(err) = self
            .guarded(self.backend.set_status(entity, id, value, ttl))
            .await
        {
            debug!(entity, %id, %err, "status mirror write dropped");
        }
    }

    pub async fn get_status(&self, entity: &str, id: Uuid) -> Option<String> {
        match self.guarded(self.backend.get_status(entity, id)).await {
            Ok(value) => value,
            Err(err) => {
                debug!(entity, %id, %err, "status mirror read degraded to store");
                None
            }
        }
    }

    pub async fn get_many_statuses(&self, entity: &str, ids: &[Uuid]) -> Vec<Option<String>> {
        match self.guarded(self.backend.get_many_statuses(entity, ids)).await {
            Ok(values) => values,
            Err(_) => vec![None; ids.len()],
        }
    }

    pub async fn clear_status(&self, entity: &str, id: Uuid) {
        let _ = self.guarded(self.backend.clear_status(entity, id)).await;
    }

    // Pub/sub and mailboxes.

    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> KernelResult<usize> {
        self.guarded(self.backend.publish(channel, payload)).await
    }

    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> KernelResult<broadcast::Receiver<Arc<ChannelMessage>>> {
        self.guarded(self.backend.subscribe(channel)).await
    }

    pub async fn mailbox_push(&self, client: &str, payload: Vec<u8>, ttl: Duration) {
        if let Err(err) = self
            .guarded(self.backend.mailbox_push(client, payload, ttl))
            .await
        {
            debug!(client, %err, "mailbox push dropped");
        }
    }

    pub async fn mailbox_drain(&self, client: &str) -> Vec<Vec<u8>> {
        self.guarded(self.backend.mailbox_drain(client))
            .await
            .unwrap_or_default()
    }

    /// Rate-limit check; degrades to an in-process window while the
    /// cache is unavailable so limits stay roughly enforced per replica.
    pub async fn check_rate_limit(
        &self,
        scope: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        match self.breaker.check() {
            Ok(()) => match self.backend.check_rate_limit(scope, limit, window).await {
                Ok(decision) => {
                    self.breaker.record_success();
                    decision
                }
                Err(err) => {
                    self.breaker.record_failure();
                    warn!(scope, %err, "rate limit degraded to in-process window");
                    fixed_window(&self.fallback_windows, scope, limit, window)
                }
            },
            Err(_) => fixed_window(&self.fallback_windows, scope, limit, window),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    fn service() -> CacheService {
        CacheService::in_memory(CircuitBreaker::new("cache", BreakerConfig::cache()))
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let cache = service();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());

        cache.queue_push(a).await.unwrap();
        cache.queue_push(b).await.unwrap();
        assert_eq!(cache.queue_len().await.unwrap(), 2);

        assert_eq!(cache.queue_pop().await.unwrap(), Some(a));
        assert_eq!(cache.queue_pop().await.unwrap(), Some(b));
        assert_eq!(cache.queue_pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_push_ignored() {
        let cache = service();
        let id = Uuid::now_v7();
        cache.queue_push(id).await.unwrap();
        cache.queue_push(id).await.unwrap();
        assert_eq!(cache.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_moves_between_structures() {
        let cache = service();
        let id = Uuid::now_v7();

        cache.queue_push(id).await.unwrap();
        cache.mark_in_progress(id).await.unwrap();
        assert_eq!(cache.queue_len().await.unwrap(), 0);
        assert_eq!(cache.in_progress_count().await.unwrap(), 1);

        cache.requeue_atomic(id).await.unwrap();
        assert_eq!(cache.queue_len().await.unwrap(), 1);
        assert_eq!(cache.in_progress_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_live_clears_both() {
        let cache = service();
        let (queued, running) = (Uuid::now_v7(), Uuid::now_v7());
        cache.queue_push(queued).await.unwrap();
        cache.mark_in_progress(running).await.unwrap();

        cache.remove_live(queued).await.unwrap();
        cache.remove_live(running).await.unwrap();
        assert_eq!(cache.queue_len().await.unwrap(), 0);
        assert_eq!(cache.in_progress_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_mirror_round_trip() {
        let cache = service();
        let id = Uuid::now_v7();

        cache
            .set_status("task", id, "in_progress", Duration::from_secs(60))
            .await;
        assert_eq!(
            cache.get_status("task", id).await.as_deref(),
            Some("in_progress")
        );

        cache.clear_status("task", id).await;
        assert_eq!(cache.get_status("task", id).await, None);
    }

    #[tokio::test]
    async fn status_mirror_expires() {
        let cache = service();
        let id = Uuid::now_v7();

        cache
            .set_status("subtask", id, "queued", Duration::from_millis(20))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get_status("subtask", id).await, None);
    }

    #[tokio::test]
    async fn batched_status_reads() {
        let cache = service();
        let known = Uuid::now_v7();
        let unknown = Uuid::now_v7();
        cache
            .set_status("subtask", known, "completed", Duration::from_secs(60))
            .await;

        let values = cache.get_many_statuses("subtask", &[known, unknown]).await;
        assert_eq!(values, vec![Some("completed".to_string()), None]);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let cache = service();
        let mut rx = cache.subscribe("task:abc").await.unwrap();

        let receivers = cache
            .publish("task:abc", b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "task:abc");
        assert_eq!(message.payload, b"hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_zero() {
        let cache = service();
        let receivers = cache.publish("task:lonely", vec![1]).await.unwrap();
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn mailbox_drain_is_destructive() {
        let cache = service();
        cache
            .mailbox_push("client-1", b"one".to_vec(), Duration::from_secs(60))
            .await;
        cache
            .mailbox_push("client-1", b"two".to_vec(), Duration::from_secs(60))
            .await;

        let drained = cache.mailbox_drain("client-1").await;
        assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(cache.mailbox_drain("client-1").await.is_empty());
    }

    #[tokio::test]
    async fn expired_mailbox_entries_dropped() {
        let cache = service();
        cache
            .mailbox_push("client-2", b"stale".to_vec(), Duration::from_millis(1))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.mailbox_drain("client-2").await.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_fixed_window() {
        let cache = service();
        let window = Duration::from_secs(60);

        for i in 0..3 {
            let decision = cache.check_rate_limit("ip:1.2.3.4:/tasks", 3, window).await;
            assert!(decision.allowed, "call {i} should pass");
        }

        let decision = cache.check_rate_limit("ip:1.2.3.4:/tasks", 3, window).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_secs >= 1);

        // Other scopes are unaffected.
        let other = cache.check_rate_limit("ip:5.6.7.8:/tasks", 3, window).await;
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn rate_limit_survives_open_breaker() {
        let cache = service();
        // Trip the breaker manually.
        for _ in 0..3 {
            cache.breaker().record_failure();
        }

        let decision = cache
            .check_rate_limit("ip:9.9.9.9:/tasks", 2, Duration::from_secs(60))
            .await;
        assert!(decision.allowed);
        let decision = cache
            .check_rate_limit("ip:9.9.9.9:/tasks", 2, Duration::from_secs(60))
            .await;
        assert!(decision.allowed);
        let decision = cache
            .check_rate_limit("ip:9.9.9.9:/tasks", 2, Duration::from_secs(60))
            .await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn status_reads_degrade_when_breaker_open() {
        let cache = service();
        let id = Uuid::now_v7();
        cache
            .set_status("task", id, "pending", Duration::from_secs(60))
            .await;

        for _ in 0..3 {
            cache.breaker().record_failure();
        }
        // Miss rather than error: the caller falls back to the store.
        assert_eq!(cache.get_status("task", id).await, None);
        assert!(cache.queue_push(id).await.is_err());
    }
}
