//! 按截止时间排序的定时器队列
//! Deadline-ordered timer queue
//!
//! Each connection owns one `TimerQueue`. The owner asks for the earliest deadline,
//! collects due entries with [`TimerQueue::pop_due`] and then claims each one with
//! [`TimerQueue::fire`]. An entry cancelled between those two steps is no longer
//! claimable, so a handler can safely cancel timers that are due in the same batch.
//!
//! 每个连接拥有一个 `TimerQueue`。在 `pop_due` 和 `fire` 之间被取消的条目不会再触发。

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// Identifies one scheduled timer.
/// 标识一个已调度的定时器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// A queue of timers carrying an event payload of type `E`.
/// 携带 `E` 类型事件的定时器队列。
#[derive(Debug)]
pub struct TimerQueue<E> {
    next_id: u64,
    entries: BTreeMap<(Instant, TimerHandle), E>,
    armed: HashMap<TimerHandle, Instant>,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
            armed: HashMap::new(),
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `event` to fire at `deadline`.
    /// 调度 `event` 在 `deadline` 触发。
    pub fn schedule(&mut self, deadline: Instant, event: E) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        self.entries.insert((deadline, handle), event);
        self.armed.insert(handle, deadline);
        handle
    }

    /// Cancels a timer. Returns `false` if it had already fired or been cancelled.
    /// 取消定时器。如果已经触发或已取消，返回 `false`。
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.armed.remove(&handle) {
            Some(deadline) => {
                self.entries.remove(&(deadline, handle));
                true
            }
            None => false,
        }
    }

    /// True once the timer has fired or been cancelled.
    /// 定时器已触发或已取消时为真。
    pub fn is_expired(&self, handle: TimerHandle) -> bool {
        !self.armed.contains_key(&handle)
    }

    /// The earliest pending deadline.
    /// 最早的待处理截止时间。
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes every entry due at or before `now`, in deadline order. The returned
    /// entries stay armed until claimed with [`TimerQueue::fire`].
    ///
    /// 按截止时间顺序移除所有在 `now` 或之前到期的条目。
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerHandle, E)> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, handle), event) = entry.remove_entry();
            due.push((handle, event));
        }
        due
    }

    /// Claims a due entry. Returns `false` if it was cancelled after being popped.
    /// 认领一个到期条目。如果它在弹出后被取消，返回 `false`。
    pub fn fire(&mut self, handle: TimerHandle) -> bool {
        self.armed.remove(&handle).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.armed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_due_entries_pop_in_deadline_order() {
        let start = Instant::now();
        let mut queue = TimerQueue::new();
        queue.schedule(start + Duration::from_millis(30), "c");
        queue.schedule(start + Duration::from_millis(10), "a");
        queue.schedule(start + Duration::from_millis(20), "b");
        queue.schedule(start + Duration::from_millis(50), "late");

        assert_eq!(queue.next_deadline(), Some(start + Duration::from_millis(10)));
        let due: Vec<_> = queue
            .pop_due(start + Duration::from_millis(30))
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        assert_eq!(due, vec!["a", "b", "c"]);
        assert_eq!(queue.next_deadline(), Some(start + Duration::from_millis(50)));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let start = Instant::now();
        let mut queue = TimerQueue::new();
        let handle = queue.schedule(start, ());
        assert!(!queue.is_expired(handle));
        assert!(queue.cancel(handle));
        assert!(queue.is_expired(handle));
        assert!(queue.pop_due(start).is_empty());
        assert!(!queue.cancel(handle));
    }

    #[test]
    fn test_cancel_between_pop_and_fire_is_a_noop() {
        let start = Instant::now();
        let mut queue = TimerQueue::new();
        let first = queue.schedule(start, 1);
        let second = queue.schedule(start, 2);
        let due = queue.pop_due(start);
        assert_eq!(due.len(), 2);

        assert!(queue.fire(first));
        // The first handler cancels the second timer.
        assert!(queue.cancel(second));
        assert!(!queue.fire(second));
        assert!(queue.is_expired(first));
    }
}
