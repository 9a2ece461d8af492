/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::error::{SkeletonCrewError, SkeletonCrewResult};
use libc::{CLOCK_MONOTONIC, CLOCK_REALTIME, clock_gettime, clockid_t, timespec};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

fn system_time_for_clock_id(clock_id: clockid_t) -> SkeletonCrewResult<timespec> {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(clock_id, &mut tp) } == -1 {
        Err(SkeletonCrewError::Other(
            "could not get system time".to_owned(),
        ))
    } else {
        Ok(tp)
    }
}

/// Wall clock in microseconds since the Unix epoch. Used for everything that
/// crosses node boundaries; its quality depends on the LAN's time sync.
pub fn wall_micros() -> SkeletonCrewResult<u64> {
    let tp = system_time_for_clock_id(CLOCK_REALTIME)?;
    Ok(tp.tv_sec as u64 * 1_000_000 + tp.tv_nsec as u64 / 1_000)
}

/// Monotonic clock in microseconds. Never goes backward; used for durations.
pub fn monotonic_micros() -> SkeletonCrewResult<u64> {
    let tp = system_time_for_clock_id(CLOCK_MONOTONIC)?;
    Ok(tp.tv_sec as u64 * 1_000_000 + tp.tv_nsec as u64 / 1_000)
}

/// Transport wire timestamps are seconds-since-epoch as doubles.
pub fn micros_to_wire_seconds(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

pub fn wire_seconds_to_micros(seconds: f64) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * 1_000_000.0) as u64
}

/// Reported to every fired action: how far behind its target it actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewReport {
    pub target_micros: u64,
    pub fired_micros: u64,
}

impl SkewReport {
    pub fn skew_micros(&self) -> i64 {
        self.fired_micros as i64 - self.target_micros as i64
    }
}

pub type ScheduledFn = Box<dyn FnOnce(SkewReport) + Send + 'static>;

struct Entry {
    target_micros: u64,
    seq: u64,
    id: u64,
    action: ScheduledFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.target_micros == other.target_micros && self.seq == other.seq
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
        (self.target_micros, self.seq).cmp(&(other.target_micros, other.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Reverse<Entry>>,
    live: HashSet<u64>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Future-action queue: a min-heap keyed by target wall-clock instant,
/// drained by one worker thread that sleeps until the next deadline or a
/// wake-up. Actions run on the worker and receive their skew.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
    next_seq: Arc<AtomicU64>,
}

pub struct ScheduleHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl ScheduleHandle {
    /// Cancels the action. Returns `false` if it already fired or is about
    /// to (popped by the worker for the current tick).
    pub fn cancel(&self) -> bool {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("scheduler state poisoned");
        state.live.remove(&self.id)
    }
}

impl Scheduler {
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });

        let worker_shared = shared.clone();
        thread::Builder::new()
            .name("scheduler".to_owned())
            .spawn(move || run_worker(worker_shared))
            .expect("no dynamic input, cannot fail");

        Self {
            shared,
            next_id: Arc::new(AtomicU64::new(1)),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs `action` as soon after `target_micros` (wall clock) as the OS
    /// allows. A target in the past fires immediately.
    pub fn schedule(&self, target_micros: u64, action: ScheduledFn) -> ScheduleHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("scheduler state poisoned");
            state.live.insert(id);
            state.queue.push(Reverse(Entry {
                target_micros,
                seq,
                id,
                action,
            }));
        }
        self.shared.wakeup.notify_all();
        ScheduleHandle {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Drops all queued actions and stops the worker.
    pub fn shutdown(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("scheduler state poisoned");
        state.shutdown = true;
        state.queue.clear();
        state.live.clear();
        drop(state);
        self.shared.wakeup.notify_all();
        info!("Scheduler stopped.");
    }
}

fn run_worker(shared: Arc<Shared>) {
    debug!("Scheduler worker started.");
    // Scheduled transport actions want sub-millisecond firing.
    crate::utils::set_realtime_priority();
    let mut state = shared.state.lock().expect("scheduler state poisoned");
    loop {
        if state.shutdown {
            break;
        }

        let next_target = state.queue.peek().map(|Reverse(e)| e.target_micros);

        let Some(target) = next_target else {
            state = shared
                .wakeup
                .wait(state)
                .expect("scheduler state poisoned");
            continue;
        };

        let now = match wall_micros() {
            Ok(it) => it,
            Err(e) => {
                warn!("Scheduler cannot read the wall clock: {e}");
                break;
            }
        };

        if now < target {
            let (guard, _) = shared
                .wakeup
                .wait_timeout(state, Duration::from_micros(target - now))
                .expect("scheduler state poisoned");
            state = guard;
            continue;
        }

        let Some(Reverse(entry)) = state.queue.pop() else {
            continue;
        };
        // A missing live entry means the handle cancelled it.
        if !state.live.remove(&entry.id) {
            continue;
        }
        drop(state);

        let fired = wall_micros().unwrap_or(now);
        (entry.action)(SkewReport {
            target_micros: entry.target_micros,
            fired_micros: fired,
        });

        state = shared.state.lock().expect("scheduler state poisoned");
    }
    debug!("Scheduler worker stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn in_millis(ms: u64) -> u64 {
        wall_micros().expect("wall clock") + ms * 1_000
    }

    #[test]
    fn actions_fire_in_target_order() {
        let scheduler = Scheduler::start();
        let (tx, rx) = mpsc::channel();

        for (label, delay) in [("c", 90u64), ("a", 30), ("b", 60)] {
            let tx = tx.clone();
            scheduler.schedule(
                in_millis(delay),
                Box::new(move |_| {
                    tx.send(label).ok();
                }),
            );
        }

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(rx.recv_timeout(Duration::from_secs(2)).expect("action fired"));
        }
        assert_eq!(fired, vec!["a", "b", "c"]);
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_actions_never_fire() {
        let scheduler = Scheduler::start();
        let (tx, rx) = mpsc::channel();

        let tx_keep = tx.clone();
        scheduler.schedule(
            in_millis(60),
            Box::new(move |_| {
                tx_keep.send("keep").ok();
            }),
        );
        let handle = scheduler.schedule(
            in_millis(30),
            Box::new(move |_| {
                tx.send("cancelled").ok();
            }),
        );

        assert!(handle.cancel());
        // Second cancel is a no-op.
        assert!(!handle.cancel());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).expect("action fired"),
            "keep"
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        scheduler.shutdown();
    }

    #[test]
    fn past_targets_fire_immediately_and_report_skew() {
        let scheduler = Scheduler::start();
        let (tx, rx) = mpsc::channel();

        let target = wall_micros().expect("wall clock").saturating_sub(5_000);
        scheduler.schedule(
            target,
            Box::new(move |report| {
                tx.send(report).ok();
            }),
        );

        let report = rx.recv_timeout(Duration::from_secs(2)).expect("action fired");
        assert!(report.skew_micros() >= 0);
        scheduler.shutdown();
    }

    #[test]
    fn wire_seconds_round_trip_at_microsecond_precision() {
        let micros = 1_754_000_123_456_789u64;
        let secs = micros_to_wire_seconds(micros);
        let back = wire_seconds_to_micros(secs);
        assert!((back as i64 - micros as i64).abs() < 2);
    }
}
