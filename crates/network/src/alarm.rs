//! Deadline-ordered alarm queue.
//!
//! Alarms are callbacks scheduled relative to now. The queue is owned
//! by the event loop task, which drains due alarms between socket
//! events; nothing here is shared across tasks. Cancellation is lazy:
//! an [`AlarmId`] flips an active flag and the heap entry is discarded
//! when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

/// Callback invoked when an alarm fires. Returning `Some(delay)`
/// reschedules the same alarm that far in the future.
pub type AlarmCallback = Box<dyn FnMut() -> Option<Duration> + Send>;

/// Handle to a scheduled alarm. Cancellation through the handle is
/// idempotent and safe after the alarm has fired.
#[derive(Debug, Clone)]
pub struct AlarmId {
    active: Arc<AtomicBool>,
}

impl AlarmId {
    /// Deactivates the alarm. The queue drops the entry the next time
    /// it reaches the top of the heap.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether the alarm is still scheduled.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct Entry {
    fire_at: Instant,
    seq: u64,
    active: Arc<AtomicBool>,
    name: Option<&'static str>,
    callback: AlarmCallback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties on the deadline break by registration order.
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

/// Min-heap of pending alarms.
pub struct AlarmQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    approx: HashMap<&'static str, AlarmId>,
    next_seq: u64,
}

impl Default for AlarmQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            approx: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Schedules `callback` to run after `delay`.
    pub fn register_alarm(&mut self, delay: Duration, callback: AlarmCallback) -> AlarmId {
        self.register_at(Instant::now() + delay, None, callback)
    }

    /// Schedules a named alarm unless one with the same name is already
    /// pending within `slop` of the requested deadline. Returns the
    /// surviving handle either way.
    pub fn register_approx_alarm(
        &mut self,
        delay: Duration,
        slop: Duration,
        name: &'static str,
        callback: AlarmCallback,
    ) -> AlarmId {
        let fire_at = Instant::now() + delay;
        if let Some(existing) = self.approx.get(name) {
            if existing.is_active() {
                if let Some(pending) = self.deadline_of(&existing.active) {
                    let gap = if pending > fire_at {
                        pending - fire_at
                    } else {
                        fire_at - pending
                    };
                    if gap <= slop {
                        trace!(name, "approx alarm already pending, skipping");
                        return existing.clone();
                    }
                }
            }
        }
        let id = self.register_at(fire_at, Some(name), callback);
        self.approx.insert(name, id.clone());
        id
    }

    /// Runs `callback` synchronously, bypassing the heap. If it asks to
    /// repeat, the repetition is scheduled normally.
    pub fn fire_immediately(&mut self, mut callback: AlarmCallback) -> AlarmId {
        match callback() {
            Some(delay) => self.register_alarm(delay, callback),
            None => AlarmId {
                active: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Deactivates the alarm behind `id`. Equivalent to
    /// [`AlarmId::cancel`]; idempotent.
    pub fn unregister_alarm(&mut self, id: &AlarmId) {
        id.cancel();
    }

    fn register_at(
        &mut self,
        fire_at: Instant,
        name: Option<&'static str>,
        callback: AlarmCallback,
    ) -> AlarmId {
        let active = Arc::new(AtomicBool::new(true));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            fire_at,
            seq,
            active: Arc::clone(&active),
            name,
            callback,
        }));
        AlarmId { active }
    }

    fn deadline_of(&self, active: &Arc<AtomicBool>) -> Option<Instant> {
        self.heap
            .iter()
            .find(|Reverse(entry)| Arc::ptr_eq(&entry.active, active))
            .map(|Reverse(entry)| entry.fire_at)
    }

    /// Runs every alarm due at or before now. Returns how many fired.
    pub fn fire_ready_alarms(&mut self) -> usize {
        self.fire_ready_at(Instant::now())
    }

    /// Deterministic variant of [`Self::fire_ready_alarms`] with an
    /// injected clock reading.
    pub fn fire_ready_at(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(Reverse(top)) = self.heap.peek() {
            if !top.active.load(Ordering::Acquire) {
                let Some(Reverse(entry)) = self.heap.pop() else {
                    break;
                };
                if let Some(name) = entry.name {
                    self.forget_approx(name, &entry.active);
                }
                continue;
            }
            if top.fire_at > now {
                break;
            }
            let Some(Reverse(mut entry)) = self.heap.pop() else {
                break;
            };
            fired += 1;
            match (entry.callback)() {
                Some(next_delay) => {
                    // Periodic alarm: same handle stays valid.
                    entry.fire_at = now + next_delay;
                    entry.seq = self.next_seq;
                    self.next_seq += 1;
                    self.heap.push(Reverse(entry));
                }
                None => {
                    entry.active.store(false, Ordering::Release);
                    if let Some(name) = entry.name {
                        self.forget_approx(name, &entry.active);
                    }
                }
            }
        }
        fired
    }

    fn forget_approx(&mut self, name: &'static str, active: &Arc<AtomicBool>) {
        if let Some(current) = self.approx.get(name) {
            if Arc::ptr_eq(&current.active, active) {
                self.approx.remove(name);
            }
        }
    }

    /// Delay until the earliest pending alarm, if any. Cancelled
    /// entries at the top are discarded first.
    pub fn time_to_next_alarm(&mut self) -> Option<Duration> {
        self.time_to_next_alarm_at(Instant::now())
    }

    /// Deterministic variant of [`Self::time_to_next_alarm`].
    pub fn time_to_next_alarm_at(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.active.load(Ordering::Acquire) {
                return Some(top.fire_at.saturating_duration_since(now));
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if let Some(name) = entry.name {
                self.forget_approx(name, &entry.active);
            }
        }
        None
    }

    /// Number of entries in the heap, including lazily cancelled ones.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> AlarmCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
    }

    #[test]
    fn test_fires_in_deadline_order_not_registration_order() {
        let mut queue = AlarmQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, delay_ms) in [("late", 200u64), ("early", 50)] {
            let order = Arc::clone(&order);
            queue.register_at(
                now + Duration::from_millis(delay_ms),
                None,
                Box::new(move || {
                    order.lock().expect("lock should be ok").push(label);
                    None
                }),
            );
        }

        assert_eq!(queue.fire_ready_at(now + Duration::from_secs(1)), 2);
        assert_eq!(
            *order.lock().expect("lock should be ok"),
            vec!["early", "late"]
        );
    }

    #[test]
    fn test_not_due_alarm_does_not_fire() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();
        queue.register_at(
            now + Duration::from_secs(10),
            None,
            counter_callback(&counter),
        );

        assert_eq!(queue.fire_ready_at(now), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let next = queue
            .time_to_next_alarm_at(now)
            .expect("alarm should be pending");
        assert!(next > Duration::from_secs(9));
    }

    #[test]
    fn test_cancel_is_lazy_and_idempotent() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();
        let id = queue.register_at(now, None, counter_callback(&counter));

        id.cancel();
        id.cancel();
        assert!(!id.is_active());
        // Entry stays in the heap until it surfaces.
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.fire_ready_at(now + Duration::from_secs(1)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_harmless() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();
        let id = queue.register_at(now, None, counter_callback(&counter));

        assert_eq!(queue.fire_ready_at(now), 1);
        id.cancel();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_approx_alarm_dedupes_within_slop() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = queue.register_approx_alarm(
            Duration::from_millis(100),
            Duration::from_millis(500),
            "retry-connect",
            counter_callback(&counter),
        );
        let second = queue.register_approx_alarm(
            Duration::from_millis(150),
            Duration::from_millis(500),
            "retry-connect",
            counter_callback(&counter),
        );

        assert!(Arc::ptr_eq(&first.active, &second.active));
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.fire_ready_at(Instant::now() + Duration::from_secs(1)),
            1
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_approx_alarm_outside_slop_schedules_again() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.register_approx_alarm(
            Duration::from_millis(10),
            Duration::from_millis(5),
            "flush",
            counter_callback(&counter),
        );
        queue.register_approx_alarm(
            Duration::from_secs(5),
            Duration::from_millis(5),
            "flush",
            counter_callback(&counter),
        );

        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_periodic_alarm_keeps_handle_alive() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();
        let cb_counter = Arc::clone(&counter);
        let id = queue.register_at(
            now,
            None,
            Box::new(move || {
                let runs = cb_counter.fetch_add(1, Ordering::SeqCst) + 1;
                if runs < 3 {
                    Some(Duration::from_millis(10))
                } else {
                    None
                }
            }),
        );

        assert_eq!(queue.fire_ready_at(now), 1);
        assert!(id.is_active());
        assert_eq!(queue.fire_ready_at(now + Duration::from_secs(1)), 1);
        assert_eq!(queue.fire_ready_at(now + Duration::from_secs(2)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!id.is_active());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fire_immediately_runs_synchronously() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = queue.fire_immediately(counter_callback(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!id.is_active());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fire_immediately_can_schedule_repeat() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cb_counter = Arc::clone(&counter);
        let id = queue.fire_immediately(Box::new(move || {
            cb_counter.fetch_add(1, Ordering::SeqCst);
            Some(Duration::from_millis(10))
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(id.is_active());
        assert_eq!(queue.len(), 1);
        queue.unregister_alarm(&id);
        assert!(!id.is_active());
    }

    #[test]
    fn test_cancelled_periodic_alarm_stops() {
        let mut queue = AlarmQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();
        let cb_counter = Arc::clone(&counter);
        let id = queue.register_at(
            now,
            None,
            Box::new(move || {
                cb_counter.fetch_add(1, Ordering::SeqCst);
                Some(Duration::from_millis(10))
            }),
        );

        assert_eq!(queue.fire_ready_at(now), 1);
        id.cancel();
        assert_eq!(queue.fire_ready_at(now + Duration::from_secs(1)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
