use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Identities of tips that have already been emitted.
///
/// Without a window the store only grows. With a window, an identity older
/// than the window counts as unseen and may be claimed again.
pub struct DedupStore {
    seen: DashMap<String, Instant>,
    window: Option<Duration>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self {
            seen: DashMap::new(),
            window: None,
        }
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window: Some(window),
        }
    }

    fn is_live(&self, seen_at: Instant) -> bool {
        match self.window {
            Some(window) => seen_at.elapsed() <= window,
            None => true,
        }
    }

    /// Whether the key has been claimed and has not expired.
    pub fn contains(&self, key: &str) -> bool {
        self.seen
            .get(key)
            .map(|entry| self.is_live(*entry))
            .unwrap_or(false)
    }

    /// Atomically record `key`. Returns `false` when it was already live.
    pub fn claim(&self, key: String) -> bool {
        match self.seen.entry(key) {
            Entry::Occupied(mut entry) => {
                if self.is_live(*entry.get()) {
                    false
                } else {
                    entry.insert(Instant::now());
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }

    /// Drop expired identities. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(window) = self.window else {
            return 0;
        };

        let before = self.seen.len();
        self.seen.retain(|_, seen_at| seen_at.elapsed() <= window);
        before - self.seen.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}
