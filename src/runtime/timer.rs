//! Recurring timers for heartbeat scheduling.
//!
//! Timers live on the reactor thread. Entries are slab-allocated for O(1)
//! cancellation and ordered by deadline in a `BTreeSet` so the reactor can
//! bound its poll timeout by the nearest deadline.

use crate::runtime::session::SessionId;
use slab::Slab;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Shortest period a timer runs at. A zero period would rearm forever.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a scheduled timer.
///
/// The generation makes every handle unique, so a handle that was already
/// cancelled can never match a new timer occupying the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    key: usize,
    generation: u64,
}

#[derive(Debug)]
struct Entry {
    session: SessionId,
    period: Duration,
    deadline: Instant,
    generation: u64,
}

/// Fixed-rate timer queue.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Slab<Entry>,
    order: BTreeSet<(Instant, usize)>,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer for `session` firing every `period`, first at
    /// `now + period`. Periods below [`MIN_PERIOD`] are raised to it.
    pub fn schedule_recurring(
        &mut self,
        session: SessionId,
        period: Duration,
        now: Instant,
    ) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        let generation = self.next_generation;
        self.next_generation += 1;

        let deadline = now + period;
        let key = self.entries.insert(Entry {
            session,
            period,
            deadline,
            generation,
        });
        self.order.insert((deadline, key));

        TimerHandle { key, generation }
    }

    /// Cancel a timer. Returns `false` if it was already gone.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.entries.get(handle.key) {
            Some(entry) if entry.generation == handle.generation => {
                let entry = self.entries.remove(handle.key);
                self.order.remove(&(entry.deadline, handle.key));
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        matches!(self.entries.get(handle.key), Some(e) if e.generation == handle.generation)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.first().map(|(deadline, _)| *deadline)
    }

    /// Collect every timer due at `now` and rearm it for its next period.
    ///
    /// Ticks missed while the loop was busy are skipped, not replayed.
    pub fn expired(&mut self, now: Instant) -> Vec<(TimerHandle, SessionId)> {
        let mut fired = Vec::new();

        while let Some(&(deadline, key)) = self.order.first() {
            if deadline > now {
                break;
            }
            self.order.remove(&(deadline, key));

            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            let mut next = entry.deadline + entry.period;
            while next <= now {
                next += entry.period;
            }
            entry.deadline = next;
            fired.push((
                TimerHandle {
                    key,
                    generation: entry.generation,
                },
                entry.session,
            ));
        }

        for (handle, _) in &fired {
            if let Some(entry) = self.entries.get(handle.key) {
                self.order.insert((entry.deadline, handle.key));
            }
        }

        fired
    }

    /// Number of live timers owned by `session`.
    pub fn active_for(&self, session: SessionId) -> usize {
        self.entries
            .iter()
            .filter(|(_, e)| e.session == session)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
