//! Named event timers, driving the cooperative single-threaded port loop (spec.md §5).
//!
//! The original source models timers as an intrusive doubly-linked list of `EventTimer` structs
//! threaded through process-global `_first`/`_last` pointers. Per the redesign flags this crate
//! instead holds an owned registry keyed by name; timers are addressed by name, never by pointer,
//! and the registry itself decides the next wakeup deadline for the port loop's socket wait.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone)]
struct Timer {
    interval: Duration,
    next_fire: Instant,
    running: bool,
    expired: bool,
    random_range: Option<Duration>,
}

/// An owned collection of named timers. One instance lives per PTP port.
#[derive(Debug, Default)]
pub struct TimerSet {
    timers: HashMap<String, Timer>,
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet { timers: HashMap::new() }
    }

    /// Starts (or restarts) `name` to fire after `interval_seconds`.
    pub fn start(&mut self, name: &str, interval_seconds: f64) {
        let interval = Duration::from_secs_f64(interval_seconds.max(0.0));
        self.timers.insert(
            name.to_string(),
            Timer { interval, next_fire: Instant::now() + interval, running: true, expired: false, random_range: None },
        );
    }

    /// Starts `name` to fire once at a uniformly random instant in `[0, 2*interval_seconds]`,
    /// per IEEE 1588 §9.5.11.2 (used for Delay_Req re-arm to avoid client synchronization).
    pub fn start_random(&mut self, name: &str, interval_seconds: f64) {
        let span = Duration::from_secs_f64((interval_seconds * 2.0).max(0.0));
        let delay = if span.is_zero() { span } else { rand::thread_rng().gen_range(Duration::ZERO..span) };
        self.timers.insert(
            name.to_string(),
            Timer {
                interval: Duration::from_secs_f64(interval_seconds.max(0.0)),
                next_fire: Instant::now() + delay,
                running: true,
                expired: false,
                random_range: Some(span),
            },
        );
    }

    pub fn stop(&mut self, name: &str) {
        if let Some(timer) = self.timers.get_mut(name) {
            timer.running = false;
        }
    }

    pub fn running(&self, name: &str) -> bool {
        self.timers.get(name).map(|t| t.running).unwrap_or(false)
    }

    /// Level-triggered poll: returns true at most once per fire, clearing the flag on read.
    /// Re-arms the same-duration timer (or a fresh random draw, for `start_random` timers) so
    /// periodic timers keep firing without an explicit `start` call each time.
    pub fn expired(&mut self, name: &str) -> bool {
        let now = Instant::now();
        let Some(timer) = self.timers.get_mut(name) else { return false };
        if !timer.running {
            return false;
        }
        if !timer.expired && now >= timer.next_fire {
            timer.expired = true;
        }
        if timer.expired {
            timer.expired = false;
            let delay = match timer.random_range {
                Some(span) if !span.is_zero() => rand::thread_rng().gen_range(Duration::ZERO..span),
                _ => timer.interval,
            };
            timer.next_fire = now + delay;
            true
        } else {
            false
        }
    }

    /// The soonest deadline across all running timers, for bounding the port loop's socket wait.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter(|t| t.running).map(|t| t.next_fire).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn start_and_expire() {
        let mut timers = TimerSet::new();
        timers.start("announce", 0.01);
        assert!(!timers.expired("announce"));
        sleep(Duration::from_millis(20));
        assert!(timers.expired("announce"));
        // level-triggered: cleared after one read, re-armed for the next interval
        assert!(!timers.expired("announce"));
    }

    #[test]
    fn stop_prevents_expiration() {
        let mut timers = TimerSet::new();
        timers.start("sync", 0.001);
        timers.stop("sync");
        sleep(Duration::from_millis(5));
        assert!(!timers.expired("sync"));
        assert!(!timers.running("sync"));
    }

    #[test]
    fn unknown_timer_never_expires() {
        let mut timers = TimerSet::new();
        assert!(!timers.expired("nonexistent"));
    }

    #[test]
    fn random_start_fires_within_double_interval() {
        let mut timers = TimerSet::new();
        timers.start_random("delayreq", 0.001);
        assert!(timers.running("delayreq"));
        sleep(Duration::from_millis(5));
        assert!(timers.expired("delayreq"));
    }

    #[test]
    fn next_deadline_picks_soonest_running_timer() {
        let mut timers = TimerSet::new();
        timers.start("slow", 10.0);
        timers.start("fast", 0.001);
        timers.stop("slow");
        let deadline = timers.next_deadline().expect("a running timer exists");
        assert!(deadline <= Instant::now() + Duration::from_secs(1));
    }
}
