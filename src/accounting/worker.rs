use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::accounting::{UsageRecord, UsageStore};
use crate::config::AccountingConfig;

/// Spawn the task that drains usage records into the store in batches.
///
/// Batches are written when `batch_size` records are buffered or every
/// `flush_interval_ms`, whichever comes first. A failed batch is set aside
/// and retried on later flushes ahead of newer records; each batch gets
/// `max_flush_attempts` writes before it is dropped with an error log.
/// Records arriving during an outage form their own batches with their own
/// attempts. The task exits once every
/// [`UsageAccountant`](crate::accounting::UsageAccountant) is dropped and the
/// buffer has been flushed.
pub fn spawn_usage_worker(
    store: Arc<dyn UsageStore>,
    mut rx: mpsc::UnboundedReceiver<UsageRecord>,
    config: &AccountingConfig,
) -> tokio::task::JoinHandle<()> {
    let batch_size = config.batch_size.max(1);
    let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
    let max_attempts = config.max_flush_attempts.max(1);

    tokio::spawn(async move {
        let mut batches = Batches::new(batch_size, max_attempts);
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => {
                    match record {
                        Some(record) => {
                            batches.buffer.push(record);
                            if batches.buffer.len() >= batch_size {
                                batches.flush(store.as_ref()).await;
                            }
                        }
                        None => {
                            // Shutdown: keep trying until every batch lands or
                            // its attempts run out.
                            while !batches.is_empty() {
                                batches.flush(store.as_ref()).await;
                            }
                            tracing::info!("Usage worker shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !batches.is_empty() {
                        batches.flush(store.as_ref()).await;
                    }
                }
            }
        }
    })
}

/// A sealed batch and the writes it has already failed.
struct Pending {
    records: Vec<UsageRecord>,
    failures: u32,
}

struct Batches {
    /// Records not yet part of any write.
    buffer: Vec<UsageRecord>,
    /// Failed batches, oldest first.
    pending: VecDeque<Pending>,
    capacity: usize,
    max_attempts: u32,
}

impl Batches {
    fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            pending: VecDeque::new(),
            capacity,
            max_attempts,
        }
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_empty()
    }

    /// Seal the buffer, then write batches oldest first until one fails.
    async fn flush(&mut self, store: &dyn UsageStore) {
        if !self.buffer.is_empty() {
            let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
            self.pending.push_back(Pending {
                records,
                failures: 0,
            });
        }

        while let Some(batch) = self.pending.front_mut() {
            let count = batch.records.len();
            match store.append_usage_records(&batch.records) {
                Ok(()) => {
                    tracing::debug!(count, "Flushed usage batch");
                    self.pending.pop_front();
                }
                Err(e) => {
                    batch.failures += 1;
                    if batch.failures >= self.max_attempts {
                        let exchange_ids: Vec<&str> =
                            batch.records.iter().map(|r| r.exchange_id.as_str()).collect();
                        tracing::error!(
                            count,
                            attempts = batch.failures,
                            error = %e,
                            ?exchange_ids,
                            "Dropping usage batch after repeated store failures"
                        );
                        self.pending.pop_front();
                    } else {
                        tracing::warn!(
                            count,
                            attempt = batch.failures,
                            error = %e,
                            "Failed to flush usage batch; will retry"
                        );
                    }
                    // Back off briefly so shutdown draining does not spin.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::UsageStatus;
    use crate::error::StoreError;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory store that fails its first `fail_first` writes.
    #[derive(Default)]
    struct MemoryStore {
        written: Mutex<Vec<UsageRecord>>,
        calls: AtomicU32,
        fail_first: u32,
    }

    impl UsageStore for MemoryStore {
        fn append_usage_records(&self, records: &[UsageRecord]) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(StoreError::Task("locked".into()));
            }
            self.written.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
    }

    fn record(exchange_id: &str) -> UsageRecord {
        UsageRecord {
            exchange_id: exchange_id.into(),
            request_id: exchange_id.into(),
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            model: "m".into(),
            provider: "openai".into(),
            upstream_model: "m".into(),
            input_tokens: 1,
            output_tokens: 1,
            cost_in: 0.0,
            cost_out: 0.0,
            messages_cnt: 1,
            finish_reason: None,
            status: UsageStatus::Completed,
            latency_ms: 1,
            created_at: Utc::now(),
        }
    }

    fn config(batch_size: usize, max_flush_attempts: u32) -> AccountingConfig {
        AccountingConfig {
            batch_size,
            flush_interval_ms: 60_000,
            max_flush_attempts,
        }
    }

    #[tokio::test]
    async fn test_flushes_on_close() {
        let store = Arc::new(MemoryStore::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_usage_worker(store.clone(), rx, &config(100, 3));

        tx.send(record("r1")).unwrap();
        tx.send(record("r2")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.written.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_flushes_when_batch_full() {
        let store = Arc::new(MemoryStore::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = spawn_usage_worker(store.clone(), rx, &config(2, 3));

        tx.send(record("r1")).unwrap();
        tx.send(record("r2")).unwrap();

        for _ in 0..50 {
            if store.written.lock().unwrap().len() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch was not flushed");
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let store = Arc::new(MemoryStore::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = AccountingConfig {
            batch_size: 100,
            flush_interval_ms: 20,
            max_flush_attempts: 3,
        };
        let _handle = spawn_usage_worker(store.clone(), rx, &cfg);

        tx.send(record("r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore {
            fail_first: 2,
            ..Default::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_usage_worker(store.clone(), rx, &config(100, 5));

        tx.send(record("r1")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.written.lock().unwrap().len(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batch_dropped_after_max_attempts() {
        let store = Arc::new(MemoryStore {
            fail_first: u32::MAX,
            ..Default::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_usage_worker(store.clone(), rx, &config(100, 2));

        tx.send(record("r1")).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(store.written.lock().unwrap().is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_late_records_get_their_own_attempts() {
        let store = MemoryStore {
            fail_first: 2,
            ..Default::default()
        };
        let mut batches = Batches::new(10, 2);

        batches.buffer.push(record("early"));
        batches.flush(&store).await;
        // Arrives during the outage, just before the early batch runs out.
        batches.buffer.push(record("late"));
        batches.flush(&store).await;
        assert_eq!(batches.pending.len(), 1);

        batches.flush(&store).await;
        assert!(batches.is_empty());
        let written = store.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].exchange_id, "late");
    }
}
