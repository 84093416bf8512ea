//! Preload queue: pending asset loads ordered by urgency.
//!
//! Strategies and the viewport trigger push candidates here; the preloader
//! drains it in batches bounded by its concurrency cap. A URL is queued at
//! most once; re-queuing it at a more urgent priority moves it forward.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::cache::asset::{AssetRequest, Priority};

/// A queued load and the producer that asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAsset {
    pub request: AssetRequest,
    pub origin: String,
}

/// Outcome of [`PreloadQueue::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Queued,
    /// Already queued; priority raised.
    Upgraded,
    /// Already queued at the same or a more urgent priority.
    Duplicate,
    /// Queue full.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub total_scheduled: u64,
    pub total_dispatched: u64,
    pub total_cancelled: u64,
    pub total_dropped: u64,
}

pub struct PreloadQueue {
    /// Most urgent first; FIFO within a priority.
    queue: VecDeque<QueuedAsset>,

    capacity: usize,

    stats: QueueStats,
}

impl PreloadQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            stats: QueueStats::default(),
        }
    }

    pub fn schedule(&mut self, request: AssetRequest, origin: &str) -> ScheduleOutcome {
        if let Some(pos) = self.queue.iter().position(|q| q.request.url == request.url) {
            if request.priority.level() >= self.queue[pos].request.priority.level() {
                return ScheduleOutcome::Duplicate;
            }
            let mut existing = match self.queue.remove(pos) {
                Some(existing) => existing,
                None => return ScheduleOutcome::Duplicate,
            };
            existing.request.priority = request.priority;
            self.insert(existing);
            debug!(url = %request.url, priority = %request.priority, "Raised queued asset priority");
            return ScheduleOutcome::Upgraded;
        }

        if self.queue.len() >= self.capacity {
            self.stats.total_dropped += 1;
            debug!(url = %request.url, origin, "Preload queue full, dropping candidate");
            return ScheduleOutcome::Dropped;
        }

        debug!(url = %request.url, priority = %request.priority, origin, "Queued asset");
        self.insert(QueuedAsset {
            request,
            origin: origin.to_string(),
        });
        self.stats.total_scheduled += 1;
        ScheduleOutcome::Queued
    }

    fn insert(&mut self, item: QueuedAsset) {
        let level = item.request.priority.level();
        let pos = self
            .queue
            .iter()
            .position(|existing| existing.request.priority.level() > level)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, item);
    }

    /// Take up to `max` of the most urgent entries.
    pub fn next_batch(&mut self, max: usize) -> Vec<QueuedAsset> {
        let n = max.min(self.queue.len());
        let batch: Vec<_> = self.queue.drain(..n).collect();
        self.stats.total_dispatched += batch.len() as u64;
        batch
    }

    /// Drop every pending lazy load (e.g. after navigating away).
    pub fn cancel_lazy(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|q| q.request.priority != Priority::Lazy);
        let cancelled = before - self.queue.len();
        self.stats.total_cancelled += cancelled as u64;
        cancelled
    }

    pub fn cancel(&mut self, url: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.request.url != url);
        let removed = before != self.queue.len();
        if removed {
            self.stats.total_cancelled += 1;
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
