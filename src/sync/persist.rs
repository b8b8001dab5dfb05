use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::scene::{SceneId, TokenId, TokenPatch};
use crate::timer::TimerQueue;

#[derive(Debug, Clone, PartialEq)]
pub struct PersistRequest {
    pub scene_id: SceneId,
    pub patch: TokenPatch,
}

/// Trailing per-token debounce for outbound token edits.
///
/// Each `schedule` for a token restarts its window and merges into the edit
/// already waiting, so a burst of moves leaves as one request carrying the
/// latest values.
#[derive(Debug)]
pub struct TokenPersistQueue {
    debounce: Duration,
    waiting: HashMap<TokenId, PersistRequest>,
    timers: TimerQueue<TokenId>,
}

impl TokenPersistQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            waiting: HashMap::new(),
            timers: TimerQueue::new(),
        }
    }

    pub fn schedule(&mut self, scene_id: SceneId, patch: TokenPatch, now: Instant) {
        let token_id = patch.id.clone();
        match self.waiting.get_mut(&token_id) {
            Some(request) if request.scene_id == scene_id => request.patch.absorb(patch),
            _ => {
                self.waiting
                    .insert(token_id.clone(), PersistRequest { scene_id, patch });
            }
        }
        self.timers.cancel_key(&token_id);
        self.timers.arm(token_id, now + self.debounce);
    }

    /// Requests whose quiet window has elapsed, earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<PersistRequest> {
        self.timers
            .fire_due(now)
            .into_iter()
            .filter_map(|token_id| self.waiting.remove(&token_id))
            .collect()
    }

    pub fn cancel(&mut self, token_id: &TokenId) -> bool {
        self.timers.cancel_key(token_id);
        self.waiting.remove(token_id).is_some()
    }

    /// Drops every waiting edit; returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.waiting.len();
        self.waiting.clear();
        self.timers.clear();
        dropped
    }

    pub fn is_waiting(&self, token_id: &TokenId) -> bool {
        self.waiting.contains_key(token_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
