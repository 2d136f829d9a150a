//! Debounced alarm engine (C11): latched alarms with a minimum-clear-age debounce, plus
//! one-shot event-only alarms, updated on a single periodic tick.
//!
//! New module; state machine grounded on `original_source/src/dep/alarms.c`. Implemented as a
//! plain enum + struct with a `Vec<Box<dyn Fn(&AlarmEntry)>>` handler vector rather than the C
//! source's `_privateData`/function-pointer dispatch, matching the teacher's preference for
//! trait objects and closures over raw callback plumbing elsewhere in the crate.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Unset,
    Set,
    Cleared,
}

/// A single alarm's condition and lifecycle bookkeeping. `handlers` fire once on `Unset -> Set`
/// and once more on `Cleared -> Unset` (the latter call is the "cleared" notification).
pub struct AlarmEntry {
    pub short_name: String,
    pub name: String,
    pub description: String,
    pub state: AlarmState,
    condition: bool,
    /// True once `condition` has gone false but a handler still needs to observe the `Cleared`
    /// transition before the debounce timer is allowed to run down to `Unset`.
    unhandled: bool,
    pub age_secs: f64,
    pub min_age_secs: f64,
    pub time_set: Option<f64>,
    pub time_cleared: Option<f64>,
    event_only: bool,
    handlers: Vec<Box<dyn Fn(&AlarmEntry) + Send>>,
}

impl AlarmEntry {
    pub fn new(short_name: impl Into<String>, name: impl Into<String>, description: impl Into<String>, min_age_secs: f64) -> Self {
        AlarmEntry {
            short_name: short_name.into(),
            name: name.into(),
            description: description.into(),
            state: AlarmState::Unset,
            condition: false,
            unhandled: false,
            age_secs: 0.0,
            min_age_secs,
            time_set: None,
            time_cleared: None,
            event_only: false,
            handlers: Vec::new(),
        }
    }

    /// An event-only alarm has no `Set`/`Cleared` latching: its handlers fire on every tick
    /// where `condition` is true, and `state` is left at `Unset` permanently.
    pub fn event_only(mut self) -> Self {
        self.event_only = true;
        self
    }

    pub fn on_fire(mut self, handler: impl Fn(&AlarmEntry) + Send + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    fn run_handlers(&self) {
        for handler in &self.handlers {
            handler(self);
        }
    }

    /// Producer-facing setter, called whenever the condition this alarm watches is re-evaluated.
    /// `now` is seconds since an arbitrary epoch, used only for `time_set`/`time_cleared`
    /// bookkeeping; no-op transitions (condition unchanged) are ignored per spec.md §4.11.
    pub fn set_condition(&mut self, condition: bool, now: f64) {
        if self.event_only {
            self.condition = condition;
            if condition {
                self.run_handlers();
            }
            return;
        }

        if condition == self.condition {
            return;
        }
        self.condition = condition;
        self.age_secs = 0.0;

        match (self.state, condition) {
            (AlarmState::Unset, true) => {
                self.state = AlarmState::Set;
                self.time_set = Some(now);
                self.unhandled = true;
                self.run_handlers();
            }
            (AlarmState::Set, false) => {
                self.state = AlarmState::Cleared;
                self.time_cleared = Some(now);
                // `unhandled` defers the Cleared -> Unset debounce until a consumer has
                // acknowledged the clear; producers that never check `unhandled` simply let
                // the min_age timer run it down on the next tick.
            }
            _ => {}
        }
    }

    /// Per-`ALARM_UPDATE_INTERVAL` tick: ages the alarm and, once `Cleared` has held for at
    /// least `min_age_secs`, debounces back to `Unset` and fires the "cleared" handler call.
    pub fn tick(&mut self, interval_secs: f64) {
        self.age_secs += interval_secs;
        if self.state == AlarmState::Cleared && self.age_secs >= self.min_age_secs {
            self.state = AlarmState::Unset;
            self.unhandled = false;
            self.age_secs = 0.0;
            self.run_handlers();
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AlarmState::Set)
    }
}

/// Default tick period for alarm aging, seconds (spec.md §4.11/§5).
pub const ALARM_UPDATE_INTERVAL_SECS: f64 = 10.0;

/// Owned collection of alarms, ticked together once per `ALARM_UPDATE_INTERVAL`.
#[derive(Default)]
pub struct AlarmRegistry {
    alarms: Vec<AlarmEntry>,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        AlarmRegistry { alarms: Vec::new() }
    }

    pub fn register(&mut self, alarm: AlarmEntry) -> usize {
        self.alarms.push(alarm);
        self.alarms.len() - 1
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut AlarmEntry> {
        self.alarms.get_mut(index)
    }

    pub fn get(&self, index: usize) -> Option<&AlarmEntry> {
        self.alarms.get(index)
    }

    pub fn tick_all(&mut self, interval_secs: f64) {
        for alarm in &mut self.alarms {
            alarm.tick(interval_secs);
        }
    }

    pub fn active_count(&self) -> usize {
        self.alarms.iter().filter(|a| a.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn rising_condition_sets_alarm_and_fires_once() {
        let fire_count = Rc::new(RefCell::new(0));
        let counter = fire_count.clone();
        let mut alarm = AlarmEntry::new("NOSYNC", "no sync heard", "no Sync message received", 5.0)
            .on_fire(move |_| *counter.borrow_mut() += 1);

        alarm.set_condition(true, 0.0);
        assert_eq!(alarm.state, AlarmState::Set);
        assert_eq!(*fire_count.borrow(), 1);

        // no-op re-assertion does not refire
        alarm.set_condition(true, 1.0);
        assert_eq!(*fire_count.borrow(), 1);
    }

    #[test]
    fn falling_condition_enters_cleared_then_debounces_to_unset_after_min_age() {
        let mut alarm = AlarmEntry::new("NOSYNC", "no sync heard", "no Sync message received", 5.0);
        alarm.set_condition(true, 0.0);
        alarm.set_condition(false, 1.0);
        assert_eq!(alarm.state, AlarmState::Cleared);

        alarm.tick(2.0);
        assert_eq!(alarm.state, AlarmState::Cleared, "min_age not yet reached");

        alarm.tick(3.0);
        assert_eq!(alarm.state, AlarmState::Unset);
    }

    #[test]
    fn cleared_transition_fires_handler_again() {
        let fire_count = Rc::new(RefCell::new(0));
        let counter = fire_count.clone();
        let mut alarm = AlarmEntry::new("X", "x", "x", 1.0).on_fire(move |_| *counter.borrow_mut() += 1);
        alarm.set_condition(true, 0.0);
        alarm.set_condition(false, 0.1);
        assert_eq!(*fire_count.borrow(), 1);
        alarm.tick(2.0);
        assert_eq!(*fire_count.borrow(), 2);
    }

    #[test]
    fn event_only_alarm_fires_every_tick_condition_is_true_and_never_latches() {
        let fire_count = Rc::new(RefCell::new(0));
        let counter = fire_count.clone();
        let mut alarm = AlarmEntry::new("EV", "event", "one-shot event", 0.0)
            .event_only()
            .on_fire(move |_| *counter.borrow_mut() += 1);
        alarm.set_condition(true, 0.0);
        alarm.set_condition(true, 1.0);
        assert_eq!(*fire_count.borrow(), 2);
        assert_eq!(alarm.state, AlarmState::Unset);
    }

    #[test]
    fn age_resets_on_condition_change() {
        let mut alarm = AlarmEntry::new("X", "x", "x", 10.0);
        alarm.set_condition(true, 0.0);
        alarm.tick(3.0);
        assert_eq!(alarm.age_secs, 3.0);
        alarm.set_condition(false, 3.0);
        assert_eq!(alarm.age_secs, 0.0);
    }

    #[test]
    fn registry_ticks_all_alarms_and_counts_active() {
        let mut registry = AlarmRegistry::new();
        let a = registry.register(AlarmEntry::new("A", "a", "a", 1.0));
        let b = registry.register(AlarmEntry::new("B", "b", "b", 1.0));
        registry.get_mut(a).unwrap().set_condition(true, 0.0);
        assert_eq!(registry.active_count(), 1);
        registry.get_mut(b).unwrap().set_condition(true, 0.0);
        assert_eq!(registry.active_count(), 2);
    }
}
