use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::log_warn;

use super::{connection::Database, models::StoredReading};

const ENABLE_LOGS: bool = true;
/// Upper bound on unwritten rows while the database keeps failing. About a
/// week of one-minute polls for a single subject.
const MAX_PENDING: usize = 10_000;

/// Write-behind queue for readings. Batches go to the database once
/// `flush_every` rows are pending or when a flush is forced. A failed write
/// keeps the batch for the next attempt, up to [`MAX_PENDING`] rows; past
/// that the oldest rows are dropped.
pub struct ReadingBuffer {
    db: Database,
    pending: Mutex<Vec<StoredReading>>,
    flush_every: AtomicUsize,
}

impl ReadingBuffer {
    pub fn new(db: Database, flush_every: usize) -> Self {
        Self {
            db,
            pending: Mutex::new(Vec::new()),
            flush_every: AtomicUsize::new(flush_every.max(1)),
        }
    }

    pub fn set_flush_every(&self, flush_every: usize) {
        self.flush_every.store(flush_every.max(1), Ordering::Relaxed);
    }

    pub async fn push(&self, readings: Vec<StoredReading>) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }
        let mut pending = self.pending.lock().await;
        pending.extend(readings);
        let dropped = drop_oldest(&mut pending, MAX_PENDING);
        if dropped > 0 {
            log_warn!("Reading buffer full, dropped {dropped} oldest unwritten rows");
        }
        if pending.len() >= self.flush_every.load(Ordering::Relaxed) {
            if let Err(err) = Self::write(&self.db, &mut pending).await {
                log_warn!("Deferred reading flush failed, {} rows kept: {err:#}", pending.len());
            }
        }
        Ok(())
    }

    /// Write everything pending now. Returns how many new rows landed.
    pub async fn flush(&self) -> Result<usize> {
        let mut pending = self.pending.lock().await;
        Self::write(&self.db, &mut pending).await
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Unwritten readings for one subject in `[start, end)`, so live views
    /// see them before the next flush.
    pub async fn pending_for(
        &self,
        subject: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<StoredReading> {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|r| r.subject == subject && r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect()
    }

    async fn write(db: &Database, pending: &mut Vec<StoredReading>) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(pending);
        match db.insert_readings(batch.clone()).await {
            Ok(inserted) => Ok(inserted),
            Err(err) => {
                let newer = std::mem::replace(pending, batch);
                pending.extend(newer);
                Err(err)
            }
        }
    }
}

fn drop_oldest(pending: &mut Vec<StoredReading>, limit: usize) -> usize {
    let excess = pending.len().saturating_sub(limit);
    pending.drain(..excess);
    excess
}
