//! The multi-clock driver framework (C7): a registry of named clocks, each with its own state
//! machine, reference chain to another clock in the registry, and best-clock election.
//!
//! `SystemClock` is the low-level capability trait a concrete OS clock backend implements
//! (`clock::linux::LinuxClock`, `clock::windows::WindowsClock`); `ClockDriver` wraps one such
//! backend (or a `PhcClock`) together with the servo/Allan-deviation/state-machine bookkeeping
//! the standard requires, and is what the `ClockDriverRegistry` actually stores and schedules.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::servo::PiServo;

#[cfg(unix)]
pub mod linux;
#[cfg(windows)]
pub mod windows;
#[cfg(unix)]
pub mod phc;

/// Low-level capability set a concrete clock backend implements: get/set/step/frequency.
/// Kept minimal and mockable, matching the teacher's `traits.rs` pattern for collaborator traits.
#[cfg_attr(test, mockall::automock)]
pub trait SystemClock {
    /// Multiplies the clock's rate by `factor` (1.0 = no change).
    fn adjust_frequency(&mut self, factor: f64) -> Result<()>;
    /// Steps the clock by `offset`, forward if `sign > 0`, backward otherwise.
    fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()>;
}

/// Stable handle into a `ClockDriverRegistry`. Never a raw pointer — references between drivers
/// are looked up through the registry and revalidated on each use (REDESIGN FLAGS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockDriverId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockDriverKind {
    SystemClock,
    PhcClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockState {
    Init,
    Freerun,
    Tracking,
    Locked,
    Holdover,
    Step,
    Negstep,
    Hwfault,
}

/// Matches `original_source/src/dep/clockdriver.h`'s ordering, which the best-clock comparison
/// relies on ("better state" = lower ordinal, except the LOCKED-vs-HOLDOVER special case).
fn state_rank(state: ClockState) -> u8 {
    match state {
        ClockState::Negstep => 0,
        ClockState::Step => 1,
        ClockState::Hwfault => 2,
        ClockState::Init => 3,
        ClockState::Freerun => 4,
        ClockState::Tracking => 5,
        ClockState::Holdover => 6,
        ClockState::Locked => 7,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockDriverConfig {
    pub max_frequency_ppb: f64,
    pub stable_adev: f64,
    pub unstable_adev: f64,
    pub holdover_age_secs: f64,
    pub step_timeout_secs: f64,
    pub failure_delay_secs: f64,
    pub negative_step_allowed: bool,
    pub step_once: bool,
    pub step_force: bool,
    pub no_reset_clock: bool,
    pub disabled: bool,
    pub excluded: bool,
    pub ref_class: i32,
}

impl Default for ClockDriverConfig {
    fn default() -> Self {
        ClockDriverConfig {
            max_frequency_ppb: 500_000.0,
            stable_adev: 0.4,
            unstable_adev: 1.0,
            holdover_age_secs: 60.0,
            step_timeout_secs: 60.0,
            failure_delay_secs: 10.0,
            negative_step_allowed: true,
            step_once: false,
            step_force: false,
            no_reset_clock: false,
            disabled: false,
            excluded: false,
            ref_class: -1,
        }
    }
}

/// One entry in the registry: a named clock, its state machine, its reference, and its servo.
pub struct ClockDriver {
    pub name: String,
    pub kind: ClockDriverKind,
    pub state: ClockState,
    pub last_state: ClockState,
    pub config: ClockDriverConfig,
    pub ref_clock: Option<ClockDriverId>,
    pub external_reference: bool,
    pub distance: u8,
    pub is_system_clock: bool,
    pub servo: PiServo,
    pub adev: f64,
    pub total_adev: f64,
    pub locked_since: Option<Instant>,
    pub state_entered_at: Instant,
    pub last_update: Option<Instant>,
    pub stored_frequency: f64,
    pub last_frequency: f64,
    pub locked_up: bool,
    pub first_update_done: bool,
    backend: Box<dyn SystemClock + Send>,
}

impl ClockDriver {
    pub fn new(name: impl Into<String>, kind: ClockDriverKind, config: ClockDriverConfig, backend: Box<dyn SystemClock + Send>) -> Self {
        ClockDriver {
            name: name.into(),
            kind,
            state: ClockState::Init,
            last_state: ClockState::Init,
            config,
            ref_clock: None,
            external_reference: false,
            distance: 255,
            is_system_clock: false,
            servo: PiServo::new(0.1, 0.01, 200.0),
            adev: f64::INFINITY,
            total_adev: f64::INFINITY,
            locked_since: None,
            state_entered_at: Instant::now(),
            last_update: None,
            stored_frequency: 0.0,
            last_frequency: 0.0,
            locked_up: false,
            first_update_done: false,
            backend,
        }
    }

    fn enter_state(&mut self, state: ClockState) {
        if state != self.state {
            info!("clock '{}' transition {:?} -> {:?}", self.name, self.state, state);
            self.last_state = self.state;
            self.state = state;
            self.state_entered_at = Instant::now();
        }
    }

    pub fn age_in_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// `adjustFrequency(adj_ppb, dt)`: clamps `|adj| <= maxFrequency`.
    pub fn adjust_frequency(&mut self, adj_ppb: f64) -> Result<()> {
        let clamped = adj_ppb.clamp(-self.config.max_frequency_ppb, self.config.max_frequency_ppb);
        self.last_frequency = clamped;
        let factor = 1.0 + clamped / 1_000_000_000.0;
        self.backend.adjust_frequency(factor)
    }

    pub fn store_frequency(&mut self) {
        self.stored_frequency = self.last_frequency;
    }

    pub fn restore_frequency(&mut self) -> Result<()> {
        self.adjust_frequency(self.stored_frequency)
    }

    /// Applies a discipline update. `offset_ns` drives the servo and the state machine;
    /// implements the step/negstep decision per the Open Question resolution recorded in
    /// DESIGN.md: `no_reset_clock` always wins; otherwise `step_force` forces a step on the very
    /// first call; otherwise `step_once` steps on the first call only if `|offset| >= 1s`.
    pub fn discipline(&mut self, offset_ns: i64) -> Result<()> {
        if self.state == ClockState::Negstep || self.state == ClockState::Step || self.state == ClockState::Hwfault {
            return Ok(());
        }

        let one_second = 1_000_000_000i64;
        let wants_step = offset_ns.abs() >= one_second;
        let force_first_step = !self.first_update_done
            && !self.config.no_reset_clock
            && (self.config.step_force || (self.config.step_once && wants_step));
        self.first_update_done = true;

        if (wants_step && !self.config.no_reset_clock) || force_first_step {
            return self.step(offset_ns);
        }

        if self.ref_clock.is_none() && !self.external_reference {
            self.enter_state(ClockState::Freerun);
        } else if self.state == ClockState::Freerun || self.state == ClockState::Init {
            self.enter_state(ClockState::Tracking);
        }

        let adj_ppm = self.servo.sample(offset_ns);
        self.adjust_frequency(adj_ppm * 1000.0)?;
        self.last_update = Some(Instant::now());

        self.update_adev(offset_ns);
        self.evaluate_stability();
        Ok(())
    }

    fn step(&mut self, offset_ns: i64) -> Result<()> {
        let negative = offset_ns < 0;
        if negative && !self.config.negative_step_allowed {
            self.enter_state(ClockState::Negstep);
            self.locked_up = true;
            warn!("clock '{}' refused backward step, locked up", self.name);
            return Ok(());
        }
        let magnitude = offset_ns.unsigned_abs();
        self.backend.step_clock(Duration::from_nanos(magnitude), if negative { -1 } else { 1 })?;
        self.enter_state(ClockState::Step);
        self.servo.reset();
        Ok(())
    }

    /// Operator-issued unlock: clears `NEGSTEP`'s latch and allows one more backward step.
    pub fn force_unlock(&mut self) {
        if self.state == ClockState::Negstep {
            self.locked_up = false;
            self.enter_state(ClockState::Freerun);
        }
    }

    fn update_adev(&mut self, offset_ns: i64) {
        // Simple two-sample Allan-deviation proxy over the servo's most recent output delta.
        let sample = offset_ns as f64;
        let delta = sample - self.total_adev.min(sample);
        self.adev = delta.abs() / 1e9;
        if self.total_adev.is_infinite() {
            self.total_adev = self.adev;
        } else {
            self.total_adev = 0.9 * self.total_adev + 0.1 * self.adev;
        }
    }

    fn evaluate_stability(&mut self) {
        match self.state {
            ClockState::Tracking if self.adev <= self.config.stable_adev => {
                self.store_frequency();
                self.locked_since = Some(Instant::now());
                self.enter_state(ClockState::Locked);
            }
            ClockState::Locked if self.adev >= self.config.unstable_adev => {
                self.enter_state(ClockState::Tracking);
            }
            _ => {}
        }
    }

    /// Periodic maintenance independent of new samples: ages out of STEP/HOLDOVER/HWFAULT.
    pub fn tick(&mut self) -> Result<()> {
        match self.state {
            ClockState::Step if self.age_in_state().as_secs_f64() >= self.config.step_timeout_secs => {
                self.enter_state(ClockState::Freerun);
                self.restore_frequency()?;
            }
            ClockState::Holdover if self.age_in_state().as_secs_f64() > self.config.holdover_age_secs => {
                self.enter_state(ClockState::Freerun);
                self.restore_frequency()?;
            }
            ClockState::Hwfault if self.age_in_state().as_secs_f64() >= self.config.failure_delay_secs => {
                self.enter_state(ClockState::Freerun);
            }
            _ => {}
        }
        Ok(())
    }

    /// Marks the driver as having lost its reference: I7, a LOCKED clock losing its reference
    /// transits to HOLDOVER (not FREERUN), never skipping the state.
    pub fn lose_reference(&mut self) {
        self.ref_clock = None;
        if matches!(self.state, ClockState::Locked | ClockState::Holdover) {
            self.enter_state(ClockState::Holdover);
            self.adev = f64::INFINITY;
        } else {
            self.enter_state(ClockState::Freerun);
        }
    }

    pub fn health_check_passed(&self) -> bool {
        true
    }
}

/// Owned registry of clock drivers, addressed by stable `ClockDriverId`. Replaces the teacher's
/// (and the original source's) singleton linked list / mutable global "best clock" pointer.
#[derive(Default)]
pub struct ClockDriverRegistry {
    drivers: HashMap<ClockDriverId, ClockDriver>,
    next_id: u32,
    best: Option<ClockDriverId>,
}

impl ClockDriverRegistry {
    pub fn new() -> Self {
        ClockDriverRegistry { drivers: HashMap::new(), next_id: 0, best: None }
    }

    pub fn insert(&mut self, driver: ClockDriver) -> ClockDriverId {
        let id = ClockDriverId(self.next_id);
        self.next_id += 1;
        self.drivers.insert(id, driver);
        id
    }

    pub fn get(&self, id: ClockDriverId) -> Option<&ClockDriver> {
        self.drivers.get(&id)
    }

    pub fn get_mut(&mut self, id: ClockDriverId) -> Option<&mut ClockDriver> {
        self.drivers.get_mut(&id)
    }

    pub fn remove(&mut self, id: ClockDriverId) {
        // detach any driver pointing at the one being removed, per §3's lifecycle summary
        for driver in self.drivers.values_mut() {
            if driver.ref_clock == Some(id) {
                driver.lose_reference();
            }
        }
        self.drivers.remove(&id);
        if self.best == Some(id) {
            self.best = None;
        }
    }

    pub fn system_clock_count(&self) -> usize {
        self.drivers.values().filter(|d| d.is_system_clock).count()
    }

    pub fn best_clock(&self) -> Option<ClockDriverId> {
        self.best
    }

    /// Walks `candidate`'s reference chain to see whether `from` would be encountered, bounding
    /// the walk to 255 hops (I4: the reference graph is always a forest).
    fn would_create_cycle(&self, from: ClockDriverId, candidate: ClockDriverId) -> bool {
        let mut current = Some(candidate);
        let mut hops = 0;
        while let Some(id) = current {
            if id == from {
                return true;
            }
            hops += 1;
            if hops > 255 {
                return true;
            }
            current = self.drivers.get(&id).and_then(|d| d.ref_clock);
        }
        false
    }

    /// `setReference(a, b)`. Returns `false` (refused, `a.ref_clock` unchanged) if `b` is `a`, or
    /// assigning it would create a cycle (I4). Maintains `a.distance = b.distance + 1` (I6).
    pub fn set_reference(&mut self, a: ClockDriverId, b: Option<ClockDriverId>) -> bool {
        match b {
            None => {
                if let Some(driver) = self.drivers.get_mut(&a) {
                    driver.ref_clock = None;
                    driver.distance = 255;
                }
                true
            }
            Some(b_id) => {
                if a == b_id || self.would_create_cycle(a, b_id) {
                    warn!("refusing setReference({:?}, {:?}): would create a cycle", a, b_id);
                    return false;
                }
                let b_distance = self.drivers.get(&b_id).map(|d| d.distance).unwrap_or(255);
                if let Some(driver) = self.drivers.get_mut(&a) {
                    driver.ref_clock = Some(b_id);
                    driver.distance = b_distance.saturating_add(1);
                }
                true
            }
        }
    }

    pub fn set_external_reference(&mut self, a: ClockDriverId) {
        if let Some(driver) = self.drivers.get_mut(&a) {
            driver.ref_clock = None;
            driver.external_reference = true;
            driver.distance = 1;
        }
    }

    /// `compareClockDriver`: returns the better of `a`/`b`, or `None` for a tie/both-disqualified.
    fn compare(&self, a: ClockDriverId, b: ClockDriverId) -> Option<ClockDriverId> {
        let da = self.drivers.get(&a)?;
        let db = self.drivers.get(&b)?;

        if da.config.disabled != db.config.disabled {
            return Some(if da.config.disabled { b } else { a });
        }
        if da.config.disabled && db.config.disabled {
            return None;
        }
        if da.config.excluded != db.config.excluded {
            return Some(if da.config.excluded { b } else { a });
        }
        if da.config.excluded && db.config.excluded {
            return None;
        }

        let (ra, rb) = (state_rank(da.state), state_rank(db.state));
        if ra != rb {
            // higher rank is better, except the locked-over-holdover distance special case above
            if da.state == ClockState::Holdover && db.state == ClockState::Locked && da.distance < db.distance {
                return Some(a);
            }
            if db.state == ClockState::Holdover && da.state == ClockState::Locked && db.distance < da.distance {
                return Some(b);
            }
            return Some(if ra > rb { a } else { b });
        }

        if matches!(da.state, ClockState::Locked | ClockState::Holdover) {
            // Tiebreak order per spec.md §4.7 `findBestClock`: external reference, then lower
            // refClass, then "references the current best clock", then "ref is not the system
            // clock", then lower distance, then non-system-clock, then lower adev, then longer
            // time in state.
            if da.external_reference != db.external_reference {
                return Some(if da.external_reference { a } else { b });
            }
            if da.config.ref_class != db.config.ref_class {
                return Some(if da.config.ref_class < db.config.ref_class { a } else { b });
            }
            let references_best = |d: &ClockDriver| self.best.is_some() && d.ref_clock == self.best;
            if references_best(da) != references_best(db) {
                return Some(if references_best(da) { a } else { b });
            }
            let ref_is_system_clock = |d: &ClockDriver| d.ref_clock.and_then(|r| self.drivers.get(&r)).is_some_and(|r| r.is_system_clock);
            if ref_is_system_clock(da) != ref_is_system_clock(db) {
                return Some(if !ref_is_system_clock(da) { a } else { b });
            }
            if da.distance != db.distance {
                return Some(if da.distance < db.distance { a } else { b });
            }
            if da.is_system_clock != db.is_system_clock {
                return Some(if !da.is_system_clock { a } else { b });
            }
            if (da.adev - db.adev).abs() > f64::EPSILON {
                return Some(if da.adev < db.adev { a } else { b });
            }
            return Some(if da.age_in_state() > db.age_in_state() { a } else { b });
        }

        None
    }

    /// `findBestClock`: re-elects the best clock across the registry, then re-points every
    /// non-external-reference driver that pointed at the old best onto the new one.
    pub fn find_best_clock(&mut self) {
        let ids: Vec<ClockDriverId> = self.drivers.keys().copied().collect();
        let mut winner: Option<ClockDriverId> = None;
        for id in ids {
            winner = match winner {
                None => Some(id),
                Some(w) => self.compare(w, id).or(Some(w)),
            };
        }

        let old_best = self.best;
        self.best = winner;

        if old_best != self.best {
            if let Some(new_best) = self.best {
                let followers: Vec<ClockDriverId> = self
                    .drivers
                    .iter()
                    .filter(|(id, d)| **id != new_best && !d.external_reference && d.ref_clock == old_best)
                    .map(|(id, _)| *id)
                    .collect();
                for follower in followers {
                    self.set_reference(follower, Some(new_best));
                }
            }
            debug!("best clock changed: {:?} -> {:?}", old_best, self.best);
        }
    }

    pub fn tick_all(&mut self) -> Result<()> {
        for driver in self.drivers.values_mut() {
            driver.tick()?;
            if driver.ref_clock.is_some() {
                if let Some(ref_id) = driver.ref_clock {
                    if !self.drivers.contains_key(&ref_id) {
                        continue;
                    }
                }
            }
        }
        // detach drivers whose reference is no longer LOCKED/HOLDOVER
        let unhealthy_refs: Vec<(ClockDriverId, ClockDriverId)> = self
            .drivers
            .iter()
            .filter_map(|(id, d)| {
                d.ref_clock.and_then(|r| {
                    let ref_state = self.drivers.get(&r)?.state;
                    if !matches!(ref_state, ClockState::Locked | ClockState::Holdover) {
                        Some((*id, r))
                    } else {
                        None
                    }
                })
            })
            .collect();
        for (id, _) in unhealthy_refs {
            if let Some(driver) = self.drivers.get_mut(&id) {
                driver.lose_reference();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopClock;
    impl SystemClock for NoopClock {
        fn adjust_frequency(&mut self, _factor: f64) -> Result<()> {
            Ok(())
        }
        fn step_clock(&mut self, _offset: Duration, _sign: i8) -> Result<()> {
            Ok(())
        }
    }

    fn driver(name: &str) -> ClockDriver {
        ClockDriver::new(name, ClockDriverKind::SystemClock, ClockDriverConfig::default(), Box::new(NoopClock))
    }

    #[test]
    fn invariant_i6_distance_follows_reference() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let b = reg.insert(driver("b"));
        reg.set_external_reference(b);
        assert_eq!(reg.get(b).unwrap().distance, 1);
        reg.set_reference(a, Some(b));
        assert_eq!(reg.get(a).unwrap().distance, 2);
    }

    #[test]
    fn invariant_i6_orphan_distance_is_255() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        reg.set_reference(a, None);
        assert_eq!(reg.get(a).unwrap().distance, 255);
    }

    #[test]
    fn invariant_i4_cycle_is_refused() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let b = reg.insert(driver("b"));
        reg.set_reference(a, Some(b));
        let refused = reg.set_reference(b, Some(a));
        assert!(!refused);
        assert_eq!(reg.get(b).unwrap().ref_clock, None);
        assert_eq!(reg.get(a).unwrap().ref_clock, Some(b));
    }

    #[test]
    fn self_reference_is_refused() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        assert!(!reg.set_reference(a, Some(a)));
    }

    #[test]
    fn invariant_i7_locked_losing_reference_goes_holdover_not_freerun() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let driver_mut = reg.get_mut(a).unwrap();
        driver_mut.ref_clock = Some(ClockDriverId(999));
        driver_mut.state = ClockState::Locked;
        driver_mut.lose_reference();
        assert_eq!(reg.get(a).unwrap().state, ClockState::Holdover);
    }

    #[test]
    fn find_best_clock_prefers_locked_over_freerun() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let b = reg.insert(driver("b"));
        reg.get_mut(a).unwrap().state = ClockState::Freerun;
        reg.get_mut(b).unwrap().state = ClockState::Locked;
        reg.find_best_clock();
        assert_eq!(reg.best_clock(), Some(b));
    }

    #[test]
    fn find_best_clock_prefers_lower_distance_among_locked() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let b = reg.insert(driver("b"));
        {
            let da = reg.get_mut(a).unwrap();
            da.state = ClockState::Locked;
            da.distance = 3;
        }
        {
            let db = reg.get_mut(b).unwrap();
            db.state = ClockState::Locked;
            db.distance = 1;
        }
        reg.find_best_clock();
        assert_eq!(reg.best_clock(), Some(b));
    }

    #[test]
    fn negative_step_without_permission_latches_negstep() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let d = reg.get_mut(a).unwrap();
        d.config.negative_step_allowed = false;
        d.discipline(-3_000_000_000).unwrap();
        assert_eq!(reg.get(a).unwrap().state, ClockState::Negstep);
        assert!(reg.get(a).unwrap().locked_up);
    }

    #[test]
    fn force_unlock_clears_negstep() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let d = reg.get_mut(a).unwrap();
        d.config.negative_step_allowed = false;
        d.discipline(-3_000_000_000).unwrap();
        d.force_unlock();
        assert_eq!(reg.get(a).unwrap().state, ClockState::Freerun);
        assert!(!reg.get(a).unwrap().locked_up);
    }

    #[test]
    fn exactly_one_system_clock_invariant_i5() {
        let mut reg = ClockDriverRegistry::new();
        let a = reg.insert(driver("a"));
        let b = reg.insert(driver("b"));
        reg.get_mut(a).unwrap().is_system_clock = true;
        assert_eq!(reg.system_clock_count(), 1);
        let _ = b;
    }
}
