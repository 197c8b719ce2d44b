//! Batched acknowledgment, an optional performance aid layered on top of the
//! router's per-message delivery. Nothing in [`crate::router`] or
//! [`crate::correlation`] depends on acks being batched or even sent; a
//! caller wires an [`AckBatcher`] in front of its own ack channel only when
//! it wants fewer, larger flushes instead of one wakeup per message.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How acknowledgments are released to the flush callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every recorded id flushes on its own, immediately.
    Immediate,
    /// Ids accumulate until `max_batch_size` is reached or `flush_interval`
    /// elapses since the oldest unflushed id was recorded.
    Batch,
    /// Ids accumulate indefinitely; only an explicit `flush()` releases them.
    Deferred,
}

struct BatchState {
    pending: Vec<String>,
    oldest: Option<Instant>,
}

/// Groups correlation ids awaiting acknowledgment according to an
/// [`AckPolicy`]. `record` returns the ids that are ready to flush right
/// now, which may be empty under `Batch`/`Deferred` until a threshold trips.
pub struct AckBatcher {
    policy: AckPolicy,
    max_batch_size: usize,
    flush_interval: Duration,
    state: Mutex<BatchState>,
}

impl AckBatcher {
    pub fn new(policy: AckPolicy, max_batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            policy,
            max_batch_size,
            flush_interval,
            state: Mutex::new(BatchState { pending: Vec::new(), oldest: None }),
        }
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// Record one acknowledged correlation id. Returns the batch to flush,
    /// if any threshold was crossed.
    pub async fn record(&self, correlation_id: String) -> Vec<String> {
        match self.policy {
            AckPolicy::Immediate => vec![correlation_id],
            AckPolicy::Batch => {
                let mut state = self.state.lock().await;
                if state.pending.is_empty() {
                    state.oldest = Some(Instant::now());
                }
                state.pending.push(correlation_id);

                let size_tripped = state.pending.len() >= self.max_batch_size;
                let age_tripped = state
                    .oldest
                    .map(|t| t.elapsed() >= self.flush_interval)
                    .unwrap_or(false);

                if size_tripped || age_tripped {
                    state.oldest = None;
                    std::mem::take(&mut state.pending)
                } else {
                    Vec::new()
                }
            }
            AckPolicy::Deferred => {
                let mut state = self.state.lock().await;
                state.pending.push(correlation_id);
                Vec::new()
            }
        }
    }

    /// Release whatever is currently pending, regardless of policy.
    pub async fn flush(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.oldest = None;
        std::mem::take(&mut state.pending)
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_policy_never_buffers() {
        let batcher = AckBatcher::new(AckPolicy::Immediate, 32, Duration::from_millis(5));
        let flushed = batcher.record("c1".into()).await;
        assert_eq!(flushed, vec!["c1".to_string()]);
        assert_eq!(batcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn batch_policy_flushes_at_max_size() {
        let batcher = AckBatcher::new(AckPolicy::Batch, 3, Duration::from_secs(60));
        assert!(batcher.record("c1".into()).await.is_empty());
        assert!(batcher.record("c2".into()).await.is_empty());
        let flushed = batcher.record("c3".into()).await;
        assert_eq!(flushed, vec!["c1".to_string(), "c2".to_string(), "c3".to_string()]);
        assert_eq!(batcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn batch_policy_flushes_after_interval_elapses() {
        let batcher = AckBatcher::new(AckPolicy::Batch, 32, Duration::from_millis(20));
        assert!(batcher.record("c1".into()).await.is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let flushed = batcher.record("c2".into()).await;
        assert_eq!(flushed, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn deferred_policy_only_releases_on_explicit_flush() {
        let batcher = AckBatcher::new(AckPolicy::Deferred, 1, Duration::from_millis(1));
        assert!(batcher.record("c1".into()).await.is_empty());
        assert!(batcher.record("c2".into()).await.is_empty());
        assert_eq!(batcher.pending_count().await, 2);
        let flushed = batcher.flush().await;
        assert_eq!(flushed, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(batcher.pending_count().await, 0);
    }
}
