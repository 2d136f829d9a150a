//! Clock discipline: the PI servo (§4.8), the one-way-delay IIR filter, the offset-from-master
//! FIR filter, and `maxDelay` enforcement.

use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::stats::PermanentStdDev;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtMethod {
    /// `dt` is the measured wall-clock interval since the last sample, clamped.
    Measured,
    /// `dt` is always the configured constant.
    Constant,
    /// `dt` is always 1.0.
    None,
}

/// Two-term proportional-integral controller with a clamped integrator, matching the formula in
/// `original_source/src/dep/servo.c`: `observedDrift += dt * x * kI`, clamped to `maxOutput`, then
/// `output = kP * x + observedDrift`, returned negated (so a positive offset — local ahead of
/// master — produces a negative/slow-down adjustment).
pub struct PiServo {
    kp: f64,
    ki: f64,
    max_output: f64,
    observed_drift: f64,
    running_max_output: bool,
    dt_method: DtMethod,
    dt_constant: f64,
    max_dt: f64,
    last_update: Option<Instant>,
    stability_threshold: f64,
    stability_period: u32,
    stability_timeout: u32,
    stable_count: u32,
    updates_since_stable_reset: u32,
    drift_stats: PermanentStdDev,
    pub is_stable: bool,
}

/// Minimum magnitude `kP`/`kI` are clamped to, per spec.md §4.8 step 2 (never allow a
/// configured-zero gain to silently disable a term).
const MIN_GAIN: f64 = 1e-6;

impl PiServo {
    pub fn new(kp: f64, ki: f64, max_output: f64) -> Self {
        PiServo {
            kp: clamp_gain(kp),
            ki: clamp_gain(ki),
            max_output,
            observed_drift: 0.0,
            running_max_output: false,
            dt_method: DtMethod::None,
            dt_constant: 1.0,
            max_dt: 10.0,
            last_update: None,
            stability_threshold: 1.0,
            stability_period: 30,
            stability_timeout: 120,
            stable_count: 0,
            updates_since_stable_reset: 0,
            drift_stats: PermanentStdDev::default(),
            is_stable: false,
        }
    }

    pub fn with_dt_method(mut self, method: DtMethod, constant: f64, max_dt: f64) -> Self {
        self.dt_method = method;
        self.dt_constant = constant;
        self.max_dt = max_dt;
        self
    }

    pub fn with_stability(mut self, threshold: f64, period: u32, timeout: u32) -> Self {
        self.stability_threshold = threshold;
        self.stability_period = period;
        self.stability_timeout = timeout;
        self
    }

    pub fn reset(&mut self) {
        self.observed_drift = 0.0;
        self.running_max_output = false;
        self.last_update = None;
        self.stable_count = 0;
        self.updates_since_stable_reset = 0;
        self.drift_stats.reset();
        self.is_stable = false;
    }

    fn resolve_dt(&mut self, now: Instant) -> f64 {
        match self.dt_method {
            DtMethod::Constant => self.dt_constant,
            DtMethod::None => 1.0,
            DtMethod::Measured => {
                let dt = match self.last_update {
                    Some(prev) => now.duration_since(prev).as_secs_f64(),
                    None => self.dt_constant,
                };
                self.last_update = Some(now);
                dt.clamp(1.0 / 1000.0, self.max_dt * self.dt_constant)
            }
        }
    }

    /// Runs one servo step with input `x` (ns), returning the frequency adjustment in ppm
    /// (negated per spec.md §4.8 step 5).
    pub fn sample(&mut self, offset_ns: i64) -> f64 {
        self.sample_at(offset_ns, Instant::now())
    }

    pub fn sample_at(&mut self, offset_ns: i64, now: Instant) -> f64 {
        let dt = self.resolve_dt(now);
        let x = offset_ns as f64;

        self.observed_drift += dt * x * self.ki;
        self.running_max_output = false;
        if self.observed_drift > self.max_output {
            self.observed_drift = self.max_output;
            self.running_max_output = true;
        } else if self.observed_drift < -self.max_output {
            self.observed_drift = -self.max_output;
            self.running_max_output = true;
        }

        let proportional = self.kp * x;
        let output = proportional + self.observed_drift;

        self.update_stability();

        debug!(
            "servo: x={}ns dt={:.6}s P={:.3} I={:.3} out={:.3}ppm stable={}",
            offset_ns, dt, proportional, self.observed_drift, -output, self.is_stable
        );

        -output
    }

    fn update_stability(&mut self) {
        let std_dev = self.drift_stats.update(self.observed_drift);
        self.updates_since_stable_reset += 1;
        if self.drift_stats.count() < 2 {
            return;
        }
        if std_dev <= self.stability_threshold {
            self.stable_count += 1;
        } else {
            self.stable_count = 0;
        }
        if self.stable_count >= self.stability_period {
            self.is_stable = true;
        } else if self.updates_since_stable_reset >= self.stability_timeout && self.stable_count < self.stability_period {
            self.is_stable = false;
        }
    }

    pub fn observed_drift(&self) -> f64 {
        self.observed_drift
    }

    pub fn running_max_output(&self) -> bool {
        self.running_max_output
    }
}

fn clamp_gain(gain: f64) -> f64 {
    if gain.abs() < MIN_GAIN {
        if gain < 0.0 {
            -MIN_GAIN
        } else {
            MIN_GAIN
        }
    } else {
        gain
    }
}

/// One-way-delay IIR filter: `y <- ((s-1)/s) * y + (sample/2 + prev/2) / s`, with an adaptive
/// shift `s_exp` that grows by one each update (up to `max_shift`), and shrinks early if `|y|`
/// would overflow a 31-bit signed accumulator. `s_exp` resets whenever a delay of a full second
/// or more is observed, since the filter state is no longer meaningful.
pub struct DelayFilter {
    y: i64,
    prev_sample: i64,
    s_exp: u32,
    max_shift: u32,
}

impl DelayFilter {
    pub fn new(max_shift: u32) -> Self {
        DelayFilter { y: 0, prev_sample: 0, s_exp: 0, max_shift: max_shift.max(1) }
    }

    pub fn reset(&mut self) {
        self.y = 0;
        self.prev_sample = 0;
        self.s_exp = 0;
    }

    /// `sample_ns` is the raw one-way-delay measurement in nanoseconds. Returns the filtered
    /// value. `seconds_component` is the whole-seconds part of the raw sample; a nonzero value
    /// invalidates the filter state (treated as a full reset before filtering this sample).
    pub fn update(&mut self, sample_ns: i64, seconds_component: i32) -> i64 {
        if seconds_component != 0 {
            self.reset();
        }

        if self.s_exp < self.max_shift {
            self.s_exp += 1;
        }

        // shrink s_exp while it would push y's accumulation into the sign bit of a 31-bit value
        while self.s_exp > 0 && (self.y.unsigned_abs() >> (31 - self.s_exp.min(30))) != 0 {
            self.s_exp -= 1;
        }

        let s = self.s_exp.max(1) as i64;
        self.y = ((s - 1) * self.y + sample_ns / 2 + self.prev_sample / 2) / s;
        self.prev_sample = sample_ns;
        self.y
    }

    pub fn value(&self) -> i64 {
        self.y
    }
}

/// Offset-from-master two-sample FIR filter: `y = (sample + prev) / 2`. If the raw offset
/// carries a nonzero whole-seconds component, the filter is bypassed (the raw value is returned
/// unfiltered) and the caller is told a step may be warranted.
pub struct OffsetFilter {
    prev_sample: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetFilterResult {
    pub value_ns: i64,
    pub bypass_step_candidate: bool,
}

impl OffsetFilter {
    pub fn new() -> Self {
        OffsetFilter { prev_sample: 0 }
    }

    pub fn update(&mut self, sample_ns: i64, seconds_component: i32) -> OffsetFilterResult {
        if seconds_component != 0 {
            self.prev_sample = sample_ns;
            return OffsetFilterResult { value_ns: sample_ns, bypass_step_candidate: true };
        }
        let y = (sample_ns + self.prev_sample) / 2;
        self.prev_sample = sample_ns;
        OffsetFilterResult { value_ns: y, bypass_step_candidate: false }
    }
}

impl Default for OffsetFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of submitting a delay sample through `MaxDelayGate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySampleOutcome {
    Accepted,
    RejectedByMaxDelay,
    RejectedByOutlier,
}

/// Enforces spec.md §4.8's `maxDelay` policy: samples whose magnitude exceeds `max_delay_ns`
/// (only once the servo is stable, if `stable_only` is set) are discarded and counted.
/// `max_rejected` consecutive rejections signal the caller to force the port back to LISTENING.
/// Mirrors the documented coupling with the statistical outlier filter (DESIGN.md Open
/// Questions): when the *outlier* filter later independently rejects a sample that had already
/// been counted here as a max-delay rejection, the caller should undo that earlier count via
/// `undo_last_rejection` to avoid double-counting.
pub struct MaxDelayGate {
    max_delay_ns: Option<i64>,
    stable_only: bool,
    max_rejected: u32,
    consecutive_rejections: u32,
    total_rejections: u64,
}

impl MaxDelayGate {
    pub fn new(max_delay_ns: Option<i64>, stable_only: bool, max_rejected: u32) -> Self {
        MaxDelayGate { max_delay_ns, stable_only, max_rejected, consecutive_rejections: 0, total_rejections: 0 }
    }

    /// Returns `Some(outcome)` describing the verdict, and whether the port should reset to
    /// LISTENING (second element) because `max_rejected` consecutive rejections were hit.
    pub fn check(&mut self, delay_ns: i64, servo_is_stable: bool) -> (DelaySampleOutcome, bool) {
        let gate_active = !self.stable_only || servo_is_stable;
        let exceeds = self.max_delay_ns.is_some_and(|max| delay_ns.abs() > max);

        if gate_active && exceeds {
            self.consecutive_rejections += 1;
            self.total_rejections += 1;
            let force_listening = self.consecutive_rejections >= self.max_rejected;
            (DelaySampleOutcome::RejectedByMaxDelay, force_listening)
        } else {
            self.consecutive_rejections = 0;
            (DelaySampleOutcome::Accepted, false)
        }
    }

    /// Called when the statistical outlier filter rejects a sample that `check` had just
    /// counted as a max-delay rejection, to avoid double-counting the same sample.
    pub fn undo_last_rejection(&mut self) {
        if self.consecutive_rejections > 0 {
            self.consecutive_rejections -= 1;
        }
        if self.total_rejections > 0 {
            self.total_rejections -= 1;
        }
    }

    pub fn total_rejections(&self) -> u64 {
        self.total_rejections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servo_proportional() {
        let mut servo = PiServo::new(0.001, 0.0, 200.0);
        let adj = servo.sample(1000);
        assert!((adj - -1.0).abs() < 0.0001);
    }

    #[test]
    fn test_servo_output_clamping_via_integral() {
        let mut servo = PiServo::new(0.0, 1.0, 200.0).with_dt_method(DtMethod::Constant, 1.0, 10.0);
        servo.sample(-1_000_000_000);
        assert_eq!(servo.observed_drift(), 200.0);
        assert!(servo.running_max_output());
    }

    #[test]
    fn test_servo_integral_accumulation() {
        let mut servo = PiServo::new(0.0, 0.001, 200.0).with_dt_method(DtMethod::Constant, 1.0, 10.0);
        let adj1 = servo.sample(1000);
        assert!((adj1 - -1.0).abs() < 0.0001);
        let adj2 = servo.sample(1000);
        assert!((adj2 - -2.0).abs() < 0.0001);
    }

    #[test]
    fn test_servo_reset() {
        let mut servo = PiServo::new(0.0, 0.001, 200.0).with_dt_method(DtMethod::Constant, 1.0, 10.0);
        servo.sample(1000);
        assert!(servo.observed_drift().abs() > 0.0);
        servo.reset();
        assert_eq!(servo.observed_drift(), 0.0);
        assert_eq!(servo.sample(0), 0.0);
    }

    #[test]
    fn invariant_i8_integrator_never_exceeds_max_output() {
        let mut servo = PiServo::new(0.0, 1.0, 50.0).with_dt_method(DtMethod::Constant, 1.0, 10.0);
        for _ in 0..100 {
            servo.sample(1_000_000);
            assert!(servo.observed_drift().abs() <= 50.0 + 1e-9);
        }
    }

    #[test]
    fn gain_below_minimum_is_clamped_not_zeroed() {
        let mut servo = PiServo::new(0.0, 0.0, 200.0).with_dt_method(DtMethod::Constant, 1.0, 10.0);
        let adj = servo.sample(1_000_000);
        assert_ne!(adj, 0.0);
    }

    #[test]
    fn delay_filter_converges_on_constant_input() {
        let mut filter = DelayFilter::new(6);
        let mut last = 0;
        for _ in 0..20 {
            last = filter.update(1000, 0);
        }
        assert!((last - 1000).abs() < 50);
    }

    #[test]
    fn delay_filter_resets_on_full_second_component() {
        let mut filter = DelayFilter::new(6);
        filter.update(1000, 0);
        filter.update(1000, 0);
        filter.update(500_000_000, 1);
        assert_eq!(filter.value(), 500_000_000);
    }

    #[test]
    fn offset_filter_averages_two_samples() {
        let mut filter = OffsetFilter::new();
        filter.update(100, 0);
        let result = filter.update(200, 0);
        assert_eq!(result.value_ns, 150);
        assert!(!result.bypass_step_candidate);
    }

    #[test]
    fn offset_filter_bypasses_on_whole_seconds() {
        let mut filter = OffsetFilter::new();
        let result = filter.update(2_000_000_000, 2);
        assert_eq!(result.value_ns, 2_000_000_000);
        assert!(result.bypass_step_candidate);
    }

    #[test]
    fn max_delay_gate_rejects_and_forces_listening_after_threshold() {
        let mut gate = MaxDelayGate::new(Some(1000), false, 3);
        assert_eq!(gate.check(500, true).0, DelaySampleOutcome::Accepted);
        assert_eq!(gate.check(5000, true), (DelaySampleOutcome::RejectedByMaxDelay, false));
        assert_eq!(gate.check(5000, true), (DelaySampleOutcome::RejectedByMaxDelay, false));
        assert_eq!(gate.check(5000, true), (DelaySampleOutcome::RejectedByMaxDelay, true));
    }

    #[test]
    fn max_delay_gate_stable_only_ignores_gate_until_stable() {
        let mut gate = MaxDelayGate::new(Some(1000), true, 3);
        assert_eq!(gate.check(5000, false).0, DelaySampleOutcome::Accepted);
        assert_eq!(gate.check(5000, true).0, DelaySampleOutcome::RejectedByMaxDelay);
    }

    #[test]
    fn undo_last_rejection_avoids_double_count() {
        let mut gate = MaxDelayGate::new(Some(1000), false, 2);
        gate.check(5000, true);
        assert_eq!(gate.total_rejections(), 1);
        gate.undo_last_rejection();
        assert_eq!(gate.total_rejections(), 0);
    }
}
