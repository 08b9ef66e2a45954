//! Per-container record of shell output, replayed to newly attached viewers.
//!
//! Every chunk read from a backend is appended under one lock shared by all
//! containers, and a viewer receives a copy of the sequence taken under that
//! same lock. Chunks are never split: a snapshot holds whole chunks in the
//! order they were appended.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Default retention per container, in bytes.
pub const DEFAULT_HISTORY_LIMIT: usize = 200_000;

#[derive(Default)]
struct Backlog {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
}

impl Backlog {
    /// Appends `chunk` and drops the oldest chunks while over `limit`.
    /// The newest chunk is always kept. A `limit` of zero keeps everything.
    fn push(&mut self, chunk: Bytes, limit: usize) {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        if limit == 0 {
            return;
        }
        while self.total_bytes > limit && self.chunks.len() > 1 {
            if let Some(removed) = self.chunks.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(removed.len());
            }
        }
    }

    fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }
}

#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Mutex<HashMap<String, Backlog>>>,
    limit: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl HistoryStore {
    /// Creates a store that keeps at most `limit` bytes per container.
    /// `0` disables the cap.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            limit,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        (self.limit > 0).then_some(self.limit)
    }

    pub fn append(&self, container_id: &str, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        guard
            .entry(container_id.to_string())
            .or_default()
            .push(chunk, self.limit);
    }

    /// Point-in-time copy of the chunks recorded for `container_id`.
    pub fn replay(&self, container_id: &str) -> Vec<Bytes> {
        let guard = self.inner.lock();
        guard
            .get(container_id)
            .map(Backlog::snapshot)
            .unwrap_or_default()
    }

    pub fn len(&self, container_id: &str) -> usize {
        let guard = self.inner.lock();
        guard.get(container_id).map_or(0, |b| b.chunks.len())
    }

    /// Forgets everything recorded for `container_id`. Returns whether
    /// anything was recorded.
    pub fn clear(&self, container_id: &str) -> bool {
        self.inner.lock().remove(container_id).is_some()
    }

    pub fn containers(&self) -> Vec<String> {
        let guard = self.inner.lock();
        let mut ids: Vec<String> = guard.keys().cloned().collect();
        ids.sort();
        ids
    }
}
