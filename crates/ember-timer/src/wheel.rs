//! Hierarchical timer wheel: four wheels of 255 slots each, 10 ms tick.
//!
//! Grounded in `moon::timer`/`timer_wheel` (the C++ source this runtime is
//! derived from): entries are placed by converting a delay into ticks and
//! descending wheel levels, carrying the quotient into the next wheel until
//! the remainder fits in the current one. Firing drains the slot the tick
//! counter just reached; whenever a wheel completes a full revolution the
//! next wheel's current slot is cascaded down and re-placed, which is what
//! gives O(1) insert/cancel instead of a min-heap's O(log n).
//!
//! The wheel cursors are never stored explicitly — wheel `k`'s cursor is
//! always `(current_tick / 255^k) % 255`, so cascading is just "pull the
//! slot at that position, clear it, re-place every entry using its absolute
//! deadline tick".

use std::collections::HashMap;

pub const WHEEL_SIZE: u64 = 255;
pub const NUM_WHEELS: usize = 4;
pub const TICK_MS: u64 = 10;

pub type TimerId = u64;

/// How many more times a timer fires after the current expiry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Repeat {
    /// Fires once, then is dropped.
    Once,
    /// Fires `n` more times, then is dropped.
    Times(u32),
    /// Fires until cancelled.
    Forever,
}

#[derive(Debug, Clone)]
struct TimerEntry {
    owner: u32,
    subtype: u8,
    period_ticks: u64,
    repeat: Repeat,
    deadline_tick: u64,
    cancelled: bool,
}

/// One timer that reached its deadline this `advance()` call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FiredTimer {
    pub id: TimerId,
    pub owner: u32,
    pub subtype: u8,
}

#[derive(Default)]
struct Wheel {
    slots: Vec<Vec<TimerId>>,
}

impl Wheel {
    fn new() -> Wheel {
        Wheel {
            slots: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
        }
    }
}

pub struct TimerWheel {
    wheels: [Wheel; NUM_WHEELS],
    entries: HashMap<TimerId, TimerEntry>,
    current_tick: u64,
    next_id: TimerId,
    /// Sub-tick milliseconds left over from the previous `advance()` call,
    /// since a worker's elapsed wall-clock time rarely lands on an exact
    /// 10 ms boundary.
    carry_ms: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            wheels: [Wheel::new(), Wheel::new(), Wheel::new(), Wheel::new()],
            entries: HashMap::new(),
            current_tick: 0,
            next_id: 1,
            carry_ms: 0,
        }
    }

    #[inline]
    fn ticks_for(delay_ms: u64) -> u64 {
        // ceil(delay_ms / TICK_MS), at least 1: a timer inserted with a
        // deadline already in the past still fires on the next tick, never
        // synchronously during insertion.
        ((delay_ms + TICK_MS - 1) / TICK_MS).max(1)
    }

    pub fn insert_once(&mut self, owner: u32, delay_ms: u64) -> TimerId {
        self.insert(owner, 0, delay_ms, Repeat::Once)
    }

    pub fn insert_repeat(&mut self, owner: u32, period_ms: u64, repeat: Repeat) -> TimerId {
        self.insert(owner, 0, period_ms, repeat)
    }

    pub fn insert_with_subtype(&mut self, owner: u32, subtype: u8, delay_ms: u64, repeat: Repeat) -> TimerId {
        self.insert(owner, subtype, delay_ms, repeat)
    }

    fn insert(&mut self, owner: u32, subtype: u8, delay_ms: u64, repeat: Repeat) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        let period_ticks = Self::ticks_for(delay_ms);
        let deadline_tick = self.current_tick + period_ticks;

        self.entries.insert(
            id,
            TimerEntry {
                owner,
                subtype,
                period_ticks,
                repeat,
                deadline_tick,
                cancelled: false,
            },
        );
        self.place(id, deadline_tick);
        id
    }

    /// Marks a timer cancelled. O(1): the id is left in its wheel slot and
    /// silently dropped when that slot is eventually drained.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.cancelled).count()
    }

    /// Places `id` (already present in `entries`) into the wheel whose span
    /// covers `deadline_tick`, given the current tick counter.
    fn place(&mut self, id: TimerId, deadline_tick: u64) {
        let mut span = WHEEL_SIZE;
        for level in 0..NUM_WHEELS {
            let window_end = self.current_tick - (self.current_tick % span) + span;
            if deadline_tick < window_end || level == NUM_WHEELS - 1 {
                let level_divisor = WHEEL_SIZE.pow(level as u32);
                let slot = ((deadline_tick / level_divisor) % WHEEL_SIZE) as usize;
                self.wheels[level].slots[slot].push(id);
                return;
            }
            span *= WHEEL_SIZE;
        }
    }

    /// Advances the wheel by one 10 ms tick: fires the slot the tick counter
    /// just reached, then cascades any wheel that completed a revolution.
    fn advance_tick(&mut self) -> Vec<FiredTimer> {
        let slot0 = (self.current_tick % WHEEL_SIZE) as usize;
        let due: Vec<TimerId> = std::mem::take(&mut self.wheels[0].slots[slot0]);

        self.current_tick += 1;

        for level in 1..NUM_WHEELS {
            let span = WHEEL_SIZE.pow(level as u32);
            if self.current_tick % span != 0 {
                break;
            }
            let slot = ((self.current_tick / span) % WHEEL_SIZE) as usize;
            let cascaded: Vec<TimerId> = std::mem::take(&mut self.wheels[level].slots[slot]);
            for id in cascaded {
                if let Some(entry) = self.entries.get(&id) {
                    let deadline = entry.deadline_tick;
                    self.place(id, deadline);
                }
            }
        }

        let mut fired = Vec::new();
        for id in due {
            let entry = match self.entries.get(&id).cloned() {
                Some(entry) => entry,
                None => continue,
            };

            if entry.cancelled {
                self.entries.remove(&id);
                continue;
            }

            fired.push(FiredTimer {
                id,
                owner: entry.owner,
                subtype: entry.subtype,
            });

            let next_repeat = match entry.repeat {
                Repeat::Once => None,
                Repeat::Times(0) => None,
                Repeat::Times(n) => Some(Repeat::Times(n - 1)),
                Repeat::Forever => Some(Repeat::Forever),
            };

            match next_repeat {
                Some(repeat) => {
                    let deadline_tick = self.current_tick + entry.period_ticks;
                    self.entries.insert(
                        id,
                        TimerEntry {
                            deadline_tick,
                            repeat,
                            ..entry
                        },
                    );
                    self.place(id, deadline_tick);
                }
                None => {
                    self.entries.remove(&id);
                }
            }
        }

        fired
    }

    /// Advances the wheel by `elapsed_ms`, floored to whole 10 ms ticks; the
    /// remainder carries forward to the next call. Returns every timer that
    /// fired, in slot (tick) order.
    pub fn advance(&mut self, elapsed_ms: u64) -> Vec<FiredTimer> {
        self.carry_ms += elapsed_ms;
        let ticks = self.carry_ms / TICK_MS;
        self.carry_ms %= TICK_MS;

        let mut fired = Vec::new();
        for _ in 0..ticks {
            fired.extend(self.advance_tick());
        }
        fired
    }
}

impl Default for TimerWheel {
    fn default() -> TimerWheel {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_after_delay() {
        let mut wheel = TimerWheel::new();
        wheel.insert_once(7, 50);

        let fired = wheel.advance(40);
        assert!(fired.is_empty());

        let fired = wheel.advance(20);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].owner, 7);
    }

    #[test]
    fn fires_between_t_plus_d_and_t_plus_d_plus_10ms() {
        // spec S-property: a timer inserted with delay d fires in [t+d, t+d+10ms]
        let mut wheel = TimerWheel::new();
        wheel.insert_once(1, 33);

        let mut elapsed = 0u64;
        let mut fired_at = None;
        for _ in 0..10 {
            elapsed += 10;
            if !wheel.advance(10).is_empty() {
                fired_at = Some(elapsed);
                break;
            }
        }
        let fired_at = fired_at.expect("timer never fired");
        assert!(fired_at >= 33 && fired_at <= 43, "fired at {}", fired_at);
    }

    #[test]
    fn repeat_fires_exact_count_with_expected_spacing() {
        let mut wheel = TimerWheel::new();
        wheel.insert_repeat(3, 50, Repeat::Times(3));

        let mut fire_ticks = Vec::new();
        let mut elapsed = 0u64;
        for _ in 0..40 {
            elapsed += 10;
            let fired = wheel.advance(10);
            for f in fired {
                assert_eq!(f.owner, 3);
                fire_ticks.push(elapsed);
            }
        }

        assert_eq!(fire_ticks.len(), 3);
        let mut prev = 0u64;
        for t in fire_ticks {
            let delta = t - prev;
            assert!(delta >= 50 && delta <= 60, "delta {} out of range", delta);
            prev = t;
        }
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut wheel = TimerWheel::new();
        let id = wheel.insert_once(1, 20);
        assert!(wheel.cancel(id));

        let fired = wheel.advance(100);
        assert!(fired.is_empty());
    }

    #[test]
    fn cancel_unknown_id_returns_false() {
        let mut wheel = TimerWheel::new();
        assert!(!wheel.cancel(999));
    }

    #[test]
    fn forever_repeat_keeps_firing() {
        let mut wheel = TimerWheel::new();
        wheel.insert_repeat(1, 10, Repeat::Forever);

        let mut fires = 0;
        for _ in 0..20 {
            fires += wheel.advance(10).len();
        }
        assert!(fires >= 15, "expected roughly 20 fires, got {}", fires);
    }

    #[test]
    fn past_deadline_fires_on_next_tick_not_synchronously() {
        let mut wheel = TimerWheel::new();
        wheel.insert_once(5, 0);
        // never fires synchronously inside insert()
        assert_eq!(wheel.pending_count(), 1);
        let fired = wheel.advance(10);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn long_delay_cascades_across_wheel_boundaries() {
        let mut wheel = TimerWheel::new();
        // beyond wheel 0's 255-tick (2550ms) span, forces cascading
        wheel.insert_once(9, 3000);

        let mut total = 0u64;
        let mut fired = false;
        while total < 3100 {
            total += 10;
            if !wheel.advance(10).is_empty() {
                fired = true;
                break;
            }
        }
        assert!(fired, "timer scheduled across wheel levels never fired");
        assert!(total >= 3000 && total <= 3010);
    }

    #[test]
    fn same_tick_timers_fire_in_insertion_order() {
        let mut wheel = TimerWheel::new();
        wheel.insert_once(1, 20);
        wheel.insert_once(2, 20);
        wheel.insert_once(3, 20);

        let fired = wheel.advance(30);
        let owners: Vec<u32> = fired.iter().map(|f| f.owner).collect();
        assert_eq!(owners, vec![1, 2, 3]);
    }

    #[test]
    fn pending_count_excludes_cancelled() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert_once(1, 1000);
        wheel.insert_once(2, 1000);
        assert_eq!(wheel.pending_count(), 2);
        wheel.cancel(a);
        assert_eq!(wheel.pending_count(), 1);
    }
}
