//! Discrete-event scheduler with a deterministic virtual clock.
//!
//! Events are plain payload values ordered by `(scheduled_time, priority,
//! order)`; `order` is a monotone counter assigned at enqueue time so that
//! events sharing a timestamp and priority run in FIFO order. The caller
//! drives dispatch through [`Simulator::pop_due`] or [`Simulator::run`].

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::error::{SimError, SimResult};

#[derive(Debug, Clone)]
pub struct ScheduledEvent<E> {
    pub scheduled_time: f64,
    pub priority: i32,
    pub order: u64,
    pub payload: E,
}

impl<E> PartialEq for ScheduledEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<E> Eq for ScheduledEvent<E> {}

impl<E> PartialOrd for ScheduledEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for ScheduledEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.scheduled_time
            .total_cmp(&other.scheduled_time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.order.cmp(&other.order))
    }
}

pub struct Simulator<E> {
    clock: f64,
    queue: BinaryHeap<Reverse<ScheduledEvent<E>>>,
    order_counter: u64,
    running: bool,
}

impl<E> Simulator<E> {
    pub fn new() -> Self {
        Self::starting_at(0.0)
    }

    pub fn starting_at(start_time: f64) -> Self {
        Self {
            clock: start_time,
            queue: BinaryHeap::new(),
            order_counter: 0,
            running: false,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> f64 {
        self.clock
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Schedule a payload at an absolute simulated time.
    pub fn schedule_at(&mut self, scheduled_time: f64, payload: E) -> SimResult<()> {
        self.schedule_at_priority(scheduled_time, 0, payload)
    }

    pub fn schedule_at_priority(
        &mut self,
        scheduled_time: f64,
        priority: i32,
        payload: E,
    ) -> SimResult<()> {
        if scheduled_time < self.clock {
            return Err(SimError::InvalidTime {
                scheduled: scheduled_time,
                now: self.clock,
            });
        }
        let order = self.order_counter;
        self.order_counter += 1;
        self.queue.push(Reverse(ScheduledEvent {
            scheduled_time,
            priority,
            order,
            payload,
        }));
        Ok(())
    }

    /// Schedule a payload relative to the current simulated time.
    pub fn schedule_in(&mut self, delay: f64, payload: E) -> SimResult<()> {
        self.schedule_in_priority(delay, 0, payload)
    }

    pub fn schedule_in_priority(&mut self, delay: f64, priority: i32, payload: E) -> SimResult<()> {
        if delay < 0.0 {
            return Err(SimError::InvalidDelay(delay));
        }
        self.schedule_at_priority(self.clock + delay, priority, payload)
    }

    /// Pop the next due event, advancing the clock to its scheduled time.
    ///
    /// With `until` set, an event scheduled past the horizon stays queued and
    /// `None` is returned.
    pub fn pop_due(&mut self, until: Option<f64>) -> Option<ScheduledEvent<E>> {
        if let Some(horizon) = until {
            let next_time = self.queue.peek()?.0.scheduled_time;
            if next_time > horizon {
                return None;
            }
        }
        let Reverse(event) = self.queue.pop()?;
        self.clock = event.scheduled_time;
        Some(event)
    }

    /// Run until the queue empties, the horizon passes, `max_events` fire, or
    /// [`Simulator::stop`] is called from within a dispatch.
    pub fn run<F>(&mut self, until: Option<f64>, max_events: Option<u64>, mut dispatch: F)
    where
        F: FnMut(&mut Self, E),
    {
        let mut processed = 0u64;
        self.running = true;
        while self.running {
            let Some(event) = self.pop_due(until) else {
                break;
            };
            dispatch(self, event.payload);
            processed += 1;
            if let Some(limit) = max_events {
                if processed >= limit {
                    break;
                }
            }
        }
        self.running = false;
    }

    /// Stop processing after the current event.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Remove all scheduled events.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<E> Default for Simulator<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_run_in_time_order() {
        let mut sim: Simulator<u32> = Simulator::new();
        sim.schedule_at(3.0, 3).unwrap();
        sim.schedule_at(1.0, 1).unwrap();
        sim.schedule_at(2.0, 2).unwrap();

        let mut seen = Vec::new();
        sim.run(None, None, |_, n| seen.push(n));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(sim.now(), 3.0);
    }

    #[test]
    fn ties_break_by_priority_then_fifo() {
        let mut sim: Simulator<&str> = Simulator::new();
        sim.schedule_at_priority(1.0, 5, "low").unwrap();
        sim.schedule_at_priority(1.0, 0, "first").unwrap();
        sim.schedule_at_priority(1.0, 0, "second").unwrap();

        let mut seen = Vec::new();
        sim.run(None, None, |_, s| seen.push(s));
        assert_eq!(seen, vec!["first", "second", "low"]);
    }

    #[test]
    fn rejects_events_in_the_past() {
        let mut sim: Simulator<u32> = Simulator::new();
        sim.schedule_at(5.0, 1).unwrap();
        sim.run(None, None, |_, _| {});
        assert!(matches!(
            sim.schedule_at(2.0, 2),
            Err(SimError::InvalidTime { .. })
        ));
        assert!(matches!(
            sim.schedule_in(-0.5, 3),
            Err(SimError::InvalidDelay(_))
        ));
    }

    #[test]
    fn until_leaves_future_events_queued() {
        let mut sim: Simulator<u32> = Simulator::new();
        sim.schedule_at(1.0, 1).unwrap();
        sim.schedule_at(10.0, 2).unwrap();

        let mut seen = Vec::new();
        sim.run(Some(5.0), None, |_, n| seen.push(n));
        assert_eq!(seen, vec![1]);
        assert_eq!(sim.pending(), 1);
        assert_eq!(sim.now(), 1.0);

        sim.run(None, None, |_, n| seen.push(n));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn callbacks_can_schedule_followups() {
        let mut sim: Simulator<u32> = Simulator::new();
        sim.schedule_at(1.0, 1).unwrap();
        let mut seen = Vec::new();
        sim.run(None, None, |sim, n| {
            seen.push((sim.now(), n));
            if n < 3 {
                sim.schedule_in(1.0, n + 1).unwrap();
            }
        });
        assert_eq!(seen, vec![(1.0, 1), (2.0, 2), (3.0, 3)]);
    }

    #[test]
    fn max_events_and_stop_halt_the_run() {
        let mut sim: Simulator<u32> = Simulator::new();
        for i in 0..5 {
            sim.schedule_at(i as f64, i).unwrap();
        }
        let mut count = 0;
        sim.run(None, Some(2), |_, _| count += 1);
        assert_eq!(count, 2);

        sim.run(None, None, |sim, _| {
            count += 1;
            sim.stop();
        });
        assert_eq!(count, 3);
        assert_eq!(sim.pending(), 2);
    }

    #[test]
    fn identical_enqueue_histories_replay_identically() {
        let script = |sim: &mut Simulator<u64>| {
            for i in 0..50u64 {
                sim.schedule_at((i % 7) as f64, i).unwrap();
            }
        };
        let collect = |sim: &mut Simulator<u64>| {
            let mut seen = Vec::new();
            sim.run(None, None, |_, n| seen.push(n));
            seen
        };

        let mut a: Simulator<u64> = Simulator::new();
        script(&mut a);
        let mut b: Simulator<u64> = Simulator::new();
        script(&mut b);
        assert_eq!(collect(&mut a), collect(&mut b));
        assert_eq!(a.now(), b.now());
    }
}
