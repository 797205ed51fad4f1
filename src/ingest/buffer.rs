//! Batched ingestion buffer.
//!
//! Producers append one record at a time; a single background flusher
//! writes the accumulated batch to SQLite as one bulk insert, triggered by
//! whichever fires first: the flush interval or the size threshold. The
//! buffer mutex guards only the append and the swap, never the insert I/O.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::ingest::{IngestError, NewLogRecord};
use crate::storage::{self, Pool};

pub struct LogBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
    cfg: IngestConfig,
}

#[derive(Default)]
struct BufferState {
    queue: Vec<NewLogRecord>,
    /// Records swapped out but not yet confirmed written. Counted against
    /// the capacity bound so a down store cannot grow memory without limit.
    in_flight: usize,
}

impl LogBuffer {
    pub fn new(cfg: IngestConfig) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
            cfg,
        }
    }

    /// Accept one record. Returns as soon as the record is queued;
    /// persistence happens on the next flush.
    pub async fn submit(&self, record: NewLogRecord) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        if state.queue.len() + state.in_flight >= self.cfg.max_pending {
            return Err(IngestError::AtCapacity {
                max: self.cfg.max_pending,
            });
        }
        state.queue.push(record);
        if state.queue.len() >= self.cfg.flush_threshold {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Queued + in-flight record count.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.queue.len() + state.in_flight
    }

    /// Swap the current queue out. The caller owns the batch until it calls
    /// `complete`; until then the records still count against capacity, and
    /// producers accumulate into a fresh queue without blocking.
    async fn take_batch(&self) -> Vec<NewLogRecord> {
        let mut state = self.state.lock().await;
        let batch = std::mem::take(&mut state.queue);
        state.in_flight += batch.len();
        batch
    }

    async fn complete(&self, written: usize) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(written);
    }

    async fn wait_trigger(&self, interval: &mut tokio::time::Interval) {
        tokio::select! {
            _ = interval.tick() => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Background flusher loop. Spawned once from the composition root.
pub async fn run_flush_loop(buffer: Arc<LogBuffer>, pool: Pool) {
    info!(
        interval_secs = buffer.cfg.flush_interval_secs,
        threshold = buffer.cfg.flush_threshold,
        "Ingest flusher started"
    );
    let mut interval = tokio::time::interval(buffer.cfg.flush_interval());
    loop {
        buffer.wait_trigger(&mut interval).await;
        flush_once(&buffer, &pool).await;
    }
}

/// Run a single flush cycle: swap the queue out and write it in one bulk
/// insert. An empty queue produces no write call. A failed insert is
/// retried with the same batch until the store accepts it; records are
/// never dropped.
pub async fn flush_once(buffer: &LogBuffer, pool: &Pool) {
    let batch = buffer.take_batch().await;
    if batch.is_empty() {
        return;
    }
    let len = batch.len();
    let batch = Arc::new(batch);

    let mut attempt: u32 = 0;
    loop {
        let pool = pool.clone();
        let batch = Arc::clone(&batch);
        match tokio::task::spawn_blocking(move || storage::insert_logs(&pool, &batch)).await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => warn!(attempt, records = len, "Flush failed, will retry: {e:#}"),
            Err(e) => error!("Flush task panicked: {e}"),
        }
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(retry_backoff(attempt)).await;
    }

    buffer.complete(len).await;
    debug!(records = len, "Flushed log batch");
}

/// Capped exponential backoff with jitter.
fn retry_backoff(attempt: u32) -> Duration {
    let exp = Duration::from_millis(500).saturating_mul(2u32.saturating_pow(attempt.min(5)));
    exp.min(Duration::from_secs(10)) + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}
