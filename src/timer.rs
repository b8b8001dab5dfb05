use std::time::Instant;

/// Handle returned by [`TimerQueue::arm`]. Cancelling a handle twice, or after
/// it fired, is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct TimerEntry<K> {
    handle: TimerHandle,
    key: K,
    deadline: Instant,
}

/// Deadline queue driven by the owner's event loop through [`fire_due`].
///
/// [`fire_due`]: TimerQueue::fire_due
#[derive(Debug)]
pub struct TimerQueue<K> {
    entries: Vec<TimerEntry<K>>,
    next_handle: u64,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerQueue<K> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 1,
        }
    }

    pub fn arm(&mut self, key: K, deadline: Instant) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.entries.push(TimerEntry {
            handle,
            key,
            deadline,
        });
        handle
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        before != self.entries.len()
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.entries.iter().any(|entry| entry.handle == handle)
    }

    /// Removes and returns every entry whose deadline is at or before `now`,
    /// earliest first.
    pub fn fire_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].deadline <= now {
                due.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|entry| entry.deadline);
        due.into_iter().map(|entry| entry.key).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: PartialEq> TimerQueue<K> {
    /// Cancels every entry with `key`, returning how many were removed.
    pub fn cancel_key(&mut self, key: &K) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.key != key);
        before - self.entries.len()
    }

    pub fn deadline_for(&self, key: &K) -> Option<Instant> {
        self.entries
            .iter()
            .find(|entry| &entry.key == key)
            .map(|entry| entry.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fire_due_returns_expired_entries_in_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.arm("late", start + Duration::from_millis(30));
        timers.arm("early", start + Duration::from_millis(10));
        timers.arm("future", start + Duration::from_millis(500));

        assert!(timers.fire_due(start).is_empty());
        assert_eq!(
            timers.fire_due(start + Duration::from_millis(40)),
            vec!["early", "late"]
        );
        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers.next_deadline(),
            Some(start + Duration::from_millis(500))
        );
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_firing() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        let handle = timers.arm(1_u8, start);

        assert!(timers.is_armed(handle));
        assert!(timers.cancel(handle));
        assert!(!timers.cancel(handle));
        assert!(timers.fire_due(start + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn cancel_key_removes_all_matching_entries() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.arm("a", start);
        timers.arm("a", start);
        timers.arm("b", start);
        assert_eq!(timers.cancel_key(&"a"), 2);
        assert_eq!(timers.deadline_for(&"b"), Some(start));
        assert_eq!(timers.fire_due(start), vec!["b"]);
    }
}
