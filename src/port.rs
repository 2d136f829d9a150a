//! PTP port state machine and message dispatch (C10): the nine-state FSM, per-exchange
//! timestamp bookkeeping, and the offset/delay computations that feed the clock discipline layer.
//!
//! The loop shape (`recv` → parse → dispatch by type → periodic housekeeping) is the one
//! `controller.rs`'s `process_loop_iteration` already uses for PTPv1 Sync/Follow_Up; this module
//! generalizes it to the full PTPv2 message set and the standard's nine port states, with
//! per-state entry/exit actions grounded on `original_source/src/protocol.c`.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bmca::{ComparisonDataset, ForeignMasterTable};
use crate::servo::{DelayFilter, DelaySampleOutcome, MaxDelayGate, OffsetFilter};
use crate::stats::{is_peirces_outlier, PermanentStdDev, StatFilter, StatFilterKind, WindowType};
use crate::timers::TimerSet;
use crate::wire::{AnnounceBody, ClockIdentity, DelayRespBody, FlagField, Header, MessageType, PortIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayMechanism {
    EndToEnd,
    PeerToPeer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub port_identity: PortIdentity,
    pub domain_number: u8,
    pub delay_mechanism: DelayMechanism,
    pub log_announce_interval: i8,
    pub log_sync_interval: i8,
    pub log_min_delay_req_interval: i8,
    pub log_min_pdelay_req_interval: i8,
    pub announce_receipt_timeout: u8,
    pub announce_timeout_grace_period: u8,
    pub slave_only: bool,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub require_utc_valid: bool,
    pub foreign_master_capacity: usize,
    pub max_delay_ns: Option<i64>,
    pub max_delay_stable_only: bool,
    pub max_delay_max_rejected: u32,
    /// Peirce's-criterion rejection threshold applied to raw path-delay samples, independently of
    /// `max_delay_ns`; a sample more than this many estimated standard deviations from the running
    /// mean is dropped before it reaches the delay filter. `0.0` disables the test (every sample
    /// passes, matching the pre-outlier-filter behavior).
    pub delay_peirce_threshold: f64,
    /// C2 statistics-filter policy (spec.md §4.2) applied to the raw offset and path-delay sample
    /// streams before they reach the inline offset/delay filters below. `StatFilterKind::None`
    /// passes every sample through unchanged.
    pub stat_filter_kind: StatFilterKind,
    pub stat_filter_window_type: WindowType,
    pub stat_filter_window_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            port_identity: PortIdentity { clock_identity: ClockIdentity([0; 8]), port_number: 1 },
            domain_number: 0,
            delay_mechanism: DelayMechanism::EndToEnd,
            log_announce_interval: 1,
            log_sync_interval: 0,
            log_min_delay_req_interval: 0,
            log_min_pdelay_req_interval: 0,
            announce_receipt_timeout: 3,
            announce_timeout_grace_period: 0,
            slave_only: false,
            priority1: 128,
            priority2: 128,
            clock_class: 248,
            clock_accuracy: 0xfe,
            offset_scaled_log_variance: 0xffff,
            require_utc_valid: false,
            foreign_master_capacity: 8,
            max_delay_ns: None,
            max_delay_stable_only: false,
            max_delay_max_rejected: 3,
            delay_peirce_threshold: 0.0,
            stat_filter_kind: StatFilterKind::Mean,
            stat_filter_window_type: WindowType::Sliding,
            stat_filter_window_size: 8,
        }
    }
}

/// A discipline input produced by the port for the clock driver layer to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisciplineSample {
    pub offset_ns: i64,
    pub mean_path_delay_ns: i64,
    /// True when `offset_ns` is a fresh Sync/Follow_Up offset estimate the clock driver should
    /// discipline against; false for a Delay_Resp-only sample, where `offset_ns` is meaningless
    /// (the path delay has already been folded into `mean_path_delay_ns`).
    pub is_offset_update: bool,
}

/// Time properties dataset (§8.2.4): carried in every Announce and adopted wholesale from the
/// parent's Announce while in UNCALIBRATED/SLAVE (the "S1" update of §9.3.3), or sourced from
/// this port's own configuration while acting as grandmaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeProperties {
    pub current_utc_offset: i16,
    pub leap59: bool,
    pub leap61: bool,
    pub utc_offset_valid: bool,
    pub ptp_timescale: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
    pub time_source: u8,
}

impl Default for TimeProperties {
    fn default() -> Self {
        TimeProperties {
            current_utc_offset: 37,
            leap59: false,
            leap61: false,
            utc_offset_valid: true,
            ptp_timescale: true,
            time_traceable: false,
            frequency_traceable: false,
            time_source: 0xa0,
        }
    }
}

const TIMER_ANNOUNCE_RECEIPT: &str = "announce_receipt";
const TIMER_ANNOUNCE_SEND: &str = "announce_send";
const TIMER_SYNC_SEND: &str = "sync_send";
const TIMER_DELAY_REQ: &str = "delay_req";
const TIMER_PDELAY_REQ: &str = "pdelay_req";
const TIMER_NET_REFRESH: &str = "net_refresh";

struct PendingSync {
    sequence_id: u16,
    t1: Option<crate::time::PtpTimestamp>,
    t2: crate::time::PtpTimestamp,
    correction_ns: i64,
}

struct PendingDelayReq {
    sequence_id: u16,
    t3: crate::time::PtpTimestamp,
}

pub struct Port {
    pub state: PortState,
    pub last_state: PortState,
    pub config: PortConfig,
    pub timers: TimerSet,
    pub foreign_masters: ForeignMasterTable,
    pub parent_port_identity: Option<PortIdentity>,
    pub parent_dataset: Option<ComparisonDataset>,
    pub grandmaster_identity: Option<ClockIdentity>,
    pub announce_grace_count: u8,
    pub time_properties: TimeProperties,
    offset_stat_filter: StatFilter,
    delay_stat_filter: StatFilter,
    offset_filter: OffsetFilter,
    delay_filter: DelayFilter,
    max_delay_gate: MaxDelayGate,
    pending_sync: Option<PendingSync>,
    pending_delay_req: Option<PendingDelayReq>,
    servo_is_stable: bool,
    delay_stats: PermanentStdDev,
    pub max_delay_drops: u64,
    pub message_format_errors: u64,
    pub delay_outlier_rejections: u64,
    pub acl_timing_discarded: u64,
    pub acl_management_discarded: u64,
    announce_seq: u16,
    sync_seq: u16,
    last_sync_seq: u16,
    delay_req_seq: u16,
    pdelay_req_seq: u16,
}

impl Port {
    pub fn new(config: PortConfig) -> Self {
        let foreign_masters = ForeignMasterTable::new(config.foreign_master_capacity);
        let max_delay_gate = MaxDelayGate::new(config.max_delay_ns, config.max_delay_stable_only, config.max_delay_max_rejected);
        let offset_stat_filter = StatFilter::new(config.stat_filter_kind, config.stat_filter_window_type, config.stat_filter_window_size);
        let delay_stat_filter = StatFilter::new(config.stat_filter_kind, config.stat_filter_window_type, config.stat_filter_window_size);
        Port {
            state: PortState::Initializing,
            last_state: PortState::Initializing,
            config,
            timers: TimerSet::new(),
            foreign_masters,
            parent_port_identity: None,
            parent_dataset: None,
            grandmaster_identity: None,
            announce_grace_count: 0,
            time_properties: TimeProperties::default(),
            offset_stat_filter,
            delay_stat_filter,
            offset_filter: OffsetFilter::new(),
            delay_filter: DelayFilter::new(4),
            max_delay_gate,
            pending_sync: None,
            pending_delay_req: None,
            servo_is_stable: false,
            delay_stats: PermanentStdDev::default(),
            max_delay_drops: 0,
            message_format_errors: 0,
            delay_outlier_rejections: 0,
            acl_timing_discarded: 0,
            acl_management_discarded: 0,
            announce_seq: 0,
            sync_seq: 0,
            last_sync_seq: 0,
            delay_req_seq: 0,
            pdelay_req_seq: 0,
        }
    }

    pub fn set_servo_stability(&mut self, stable: bool) {
        self.servo_is_stable = stable;
    }

    fn announce_receipt_timeout_secs(&self) -> f64 {
        self.config.announce_receipt_timeout as f64 * 2f64.powi(self.config.log_announce_interval as i32)
    }

    /// Drives a state transition, running the exit action for `self.state` and the entry action
    /// for `next`.
    pub fn transition_to(&mut self, next: PortState) {
        if next == self.state {
            return;
        }
        self.exit_state(self.state);
        info!("port {:?} transition {:?} -> {:?}", self.config.port_identity.port_number, self.state, next);
        self.last_state = self.state;
        self.state = next;
        self.enter_state(next);
    }

    fn exit_state(&mut self, state: PortState) {
        match state {
            PortState::Master => {
                self.timers.stop(TIMER_ANNOUNCE_SEND);
                self.timers.stop(TIMER_SYNC_SEND);
                self.timers.stop(TIMER_PDELAY_REQ);
                self.timers.stop(TIMER_NET_REFRESH);
            }
            PortState::Slave => {
                self.timers.stop(TIMER_ANNOUNCE_RECEIPT);
                self.timers.stop(TIMER_DELAY_REQ);
                self.timers.stop(TIMER_PDELAY_REQ);
                self.offset_filter = OffsetFilter::new();
                self.delay_filter.reset();
                self.offset_stat_filter.reset();
                self.delay_stat_filter.reset();
                self.pending_sync = None;
                self.pending_delay_req = None;
            }
            _ => {}
        }
    }

    fn enter_state(&mut self, state: PortState) {
        match state {
            PortState::Listening => {
                self.timers.start(TIMER_ANNOUNCE_RECEIPT, self.announce_receipt_timeout_secs());
                self.announce_grace_count = 0;
            }
            PortState::Master => {
                self.timers.start(TIMER_ANNOUNCE_SEND, 2f64.powi(self.config.log_announce_interval as i32));
                self.timers.start(TIMER_SYNC_SEND, 2f64.powi(self.config.log_sync_interval as i32));
                if self.config.delay_mechanism == DelayMechanism::PeerToPeer {
                    self.timers.start(TIMER_PDELAY_REQ, 2f64.powi(self.config.log_min_pdelay_req_interval as i32));
                }
                self.timers.start(TIMER_NET_REFRESH, 120.0);
            }
            PortState::Slave | PortState::Uncalibrated => {
                self.timers.start(TIMER_ANNOUNCE_RECEIPT, self.announce_receipt_timeout_secs());
                // Delay_Req is armed only after the first Sync arrives, to avoid Delay_Resp
                // starvation against a master that has not yet sent anything.
            }
            PortState::Disabled | PortState::Faulty => {
                self.timers.stop(TIMER_ANNOUNCE_RECEIPT);
                self.timers.stop(TIMER_ANNOUNCE_SEND);
                self.timers.stop(TIMER_SYNC_SEND);
                self.timers.stop(TIMER_DELAY_REQ);
                self.timers.stop(TIMER_PDELAY_REQ);
            }
            _ => {}
        }
    }

    /// Message entry point: `header` has already been unpacked; `buf`/`message_length` let the
    /// caller unpack the appropriate body. `rx_time` is the local timestamp for this message
    /// (hardware/kernel timestamp in SLAVE Sync handling, wall clock otherwise).
    pub fn dispatch(&mut self, header: &Header, buf: &[u8], rx_time: crate::time::PtpTimestamp) -> Option<DisciplineSample> {
        if header.domain_number != self.config.domain_number {
            return None;
        }
        match header.message_type {
            MessageType::Announce => {
                self.handle_announce(header, buf);
                None
            }
            MessageType::Sync => {
                self.handle_sync(header, rx_time);
                None
            }
            MessageType::FollowUp => self.handle_follow_up(header, buf),
            MessageType::DelayReq => {
                self.handle_delay_req_echo(header, rx_time);
                None
            }
            MessageType::DelayResp => self.handle_delay_resp(header, buf),
            MessageType::PdelayReq | MessageType::PdelayResp | MessageType::PdelayRespFollowUp => {
                debug!("peer-delay exchange message received (structural handling only)");
                None
            }
            MessageType::Signaling | MessageType::Management => {
                debug!("dropping {:?} (management TLVs out of core scope)", header.message_type);
                None
            }
        }
    }

    fn handle_announce(&mut self, header: &Header, buf: &[u8]) {
        let body = match crate::wire::unpack_announce_body(buf, header.message_length) {
            Ok(b) => b,
            Err(_) => {
                self.message_format_errors += 1;
                return;
            }
        };
        if header.source_port_identity == self.config.port_identity {
            return;
        }
        if self.config.require_utc_valid && !header.flags.utc_offset_valid {
            return;
        }

        let dataset = ComparisonDataset::from_announce(header.source_port_identity, &body);
        self.foreign_masters.record_announce(header.source_port_identity, dataset);

        if self.state == PortState::Slave && Some(header.source_port_identity) == self.parent_port_identity {
            self.parent_dataset = Some(dataset);
            self.grandmaster_identity = Some(body.grandmaster_identity);
            self.time_properties = TimeProperties {
                current_utc_offset: body.current_utc_offset,
                leap59: header.flags.leap59,
                leap61: header.flags.leap61,
                utc_offset_valid: header.flags.utc_offset_valid,
                ptp_timescale: header.flags.ptp_timescale,
                time_traceable: header.flags.time_traceable,
                frequency_traceable: header.flags.frequency_traceable,
                time_source: body.time_source,
            };
            self.timers.start(TIMER_ANNOUNCE_RECEIPT, self.announce_receipt_timeout_secs());
            self.announce_grace_count = 0;
        }

        self.run_bmca();
    }

    /// IEEE 1588 §9.3.2/§J.1: compares the best foreign master against this port's own dataset
    /// (when it is eligible to be a master) and recommends a state. Slave-only ports never
    /// recommend MASTER.
    pub fn run_bmca(&mut self) {
        let own = if self.config.slave_only {
            None
        } else {
            Some(ComparisonDataset {
                grandmaster_identity: self.config.port_identity.clock_identity,
                grandmaster_priority1: self.config.priority1,
                grandmaster_clock_class: self.config.clock_class,
                grandmaster_clock_accuracy: self.config.clock_accuracy,
                grandmaster_offset_scaled_log_variance: self.config.offset_scaled_log_variance,
                grandmaster_priority2: self.config.priority2,
                steps_removed: 0,
                sender_identity: self.config.port_identity,
            })
        };

        match self.foreign_masters.best_foreign_master(own.as_ref()) {
            Some(best) => {
                if Some(best.sender_identity) != self.parent_port_identity {
                    info!("new parent selected: {:?}", best.sender_identity);
                    self.parent_port_identity = Some(best.sender_identity);
                    self.parent_dataset = Some(*best);
                    self.grandmaster_identity = Some(best.grandmaster_identity);
                }
                match self.state {
                    PortState::Listening | PortState::Passive | PortState::Uncalibrated => {
                        self.transition_to(PortState::Uncalibrated);
                    }
                    PortState::Master | PortState::PreMaster => {
                        self.transition_to(PortState::Uncalibrated);
                    }
                    _ => {}
                }
            }
            None if !self.config.slave_only => {
                if !matches!(self.state, PortState::Master | PortState::PreMaster) {
                    self.transition_to(PortState::PreMaster);
                }
            }
            None => {
                // slave-only with no viable master: stay put, rely on announce timeout
            }
        }
    }

    fn handle_sync(&mut self, header: &Header, rx_time: crate::time::PtpTimestamp) {
        if self.state != PortState::Slave && self.state != PortState::Uncalibrated {
            return;
        }
        if !self.timers.running(TIMER_DELAY_REQ) && self.config.delay_mechanism == DelayMechanism::EndToEnd {
            self.timers.start_random(TIMER_DELAY_REQ, 2f64.powi(self.config.log_min_delay_req_interval as i32));
        }

        let correction_ns = header.correction_field_ns >> 16;
        if header.flags.two_step {
            self.pending_sync = Some(PendingSync { sequence_id: header.sequence_id, t1: None, t2: rx_time, correction_ns });
        } else {
            // one-step: the origin timestamp travels in the Sync body itself, but this module
            // treats its body uniformly with Follow_Up via `unpack_timestamp_body`.
            self.pending_sync = Some(PendingSync { sequence_id: header.sequence_id, t1: None, t2: rx_time, correction_ns });
        }
    }

    fn handle_follow_up(&mut self, header: &Header, buf: &[u8]) -> Option<DisciplineSample> {
        let body = match crate::wire::unpack_follow_up_body(buf, header.message_length) {
            Ok(b) => b,
            Err(_) => {
                self.message_format_errors += 1;
                return None;
            }
        };
        let pending = self.pending_sync.take()?;
        if pending.sequence_id != header.sequence_id {
            return None;
        }
        let t1 = body.origin_timestamp;
        self.process_sync_pair(t1, pending.t2, pending.correction_ns + (header.correction_field_ns >> 16))
    }

    fn process_sync_pair(&mut self, t1: crate::time::PtpTimestamp, t2: crate::time::PtpTimestamp, correction_ns: i64) -> Option<DisciplineSample> {
        let raw_offset_ns = nanos(t2) - nanos(t1) - correction_ns - self.mean_path_delay_ns();
        // C2 statistics filter (spec.md §4.2) reduces the raw offset stream before it reaches the
        // inline offset filter below; `Interval` windows only emit once per window, in which case
        // this Sync/Follow_Up exchange produces no discipline sample.
        let reduced_offset_ns = self.offset_stat_filter.update(raw_offset_ns as f64)? as i64;
        let result = self.offset_filter.update(reduced_offset_ns, t1.seconds);
        let sample = DisciplineSample {
            offset_ns: result.value_ns,
            mean_path_delay_ns: self.mean_path_delay_ns(),
            is_offset_update: true,
        };
        Some(sample)
    }

    fn mean_path_delay_ns(&self) -> i64 {
        self.delay_filter.value()
    }

    fn handle_delay_req_echo(&mut self, header: &Header, rx_time: crate::time::PtpTimestamp) {
        // A port only processes its own looped-back Delay_Req (the transport layer surfaces the
        // TX timestamp via the socket error queue and redelivers it here as a synthetic receipt).
        if header.source_port_identity != self.config.port_identity {
            return;
        }
        self.pending_delay_req = Some(PendingDelayReq { sequence_id: header.sequence_id, t3: rx_time });
    }

    fn handle_delay_resp(&mut self, header: &Header, buf: &[u8]) -> Option<DisciplineSample> {
        let body: DelayRespBody = match crate::wire::unpack_delay_resp_body(buf, header.message_length) {
            Ok(b) => b,
            Err(_) => {
                self.message_format_errors += 1;
                return None;
            }
        };
        if body.requesting_port_identity != self.config.port_identity {
            return None;
        }
        if Some(header.source_port_identity) != self.parent_port_identity {
            return None;
        }
        let pending = self.pending_delay_req.take()?;
        if pending.sequence_id != header.sequence_id {
            return None;
        }
        let t4 = body.receive_timestamp;
        let raw_delay_ns = nanos(t4) - nanos(pending.t3) - (header.correction_field_ns >> 16);
        // C2 statistics filter (spec.md §4.2) reduces the raw path-delay stream before it reaches
        // the Peirce outlier test and the inline delay filter below.
        let raw_delay_ns = self.delay_stat_filter.update(raw_delay_ns as f64)? as i64;

        let is_outlier = is_peirces_outlier(
            self.delay_stats.mean.mean,
            self.delay_stats.std_dev,
            self.delay_stats.count(),
            raw_delay_ns as f64,
            self.config.delay_peirce_threshold,
        );
        let (gate_outcome, force_listening) = self.max_delay_gate.check(raw_delay_ns, self.servo_is_stable);
        let outcome = if is_outlier {
            if gate_outcome == DelaySampleOutcome::RejectedByMaxDelay {
                // Already counted as a maxDelay rejection; don't also count it there, count it
                // once as an outlier instead.
                self.max_delay_gate.undo_last_rejection();
            }
            DelaySampleOutcome::RejectedByOutlier
        } else {
            gate_outcome
        };

        match outcome {
            DelaySampleOutcome::RejectedByMaxDelay => {
                self.max_delay_drops += 1;
                if force_listening {
                    warn!("maxDelay rejections exceeded threshold, forcing port to LISTENING");
                    self.foreign_masters.clear();
                    self.transition_to(PortState::Listening);
                }
                return None;
            }
            DelaySampleOutcome::RejectedByOutlier => {
                self.delay_outlier_rejections += 1;
                return None;
            }
            DelaySampleOutcome::Accepted => {}
        }

        self.delay_stats.update(raw_delay_ns as f64);
        let delay = self.delay_filter.update(raw_delay_ns, t4.seconds);
        Some(DisciplineSample { offset_ns: 0, mean_path_delay_ns: delay, is_offset_update: false })
    }

    /// `ANNOUNCE_RECEIPT` expiry per spec.md §4.10: grace period disqualifies the current parent
    /// before the table is cleared and the port falls back to LISTENING.
    pub fn on_announce_receipt_timeout(&mut self) {
        if self.announce_grace_count < self.config.announce_timeout_grace_period {
            self.announce_grace_count += 1;
            if let Some(dataset) = self.parent_dataset.as_mut() {
                dataset.grandmaster_priority1 = 255;
                dataset.grandmaster_clock_class = 255;
                dataset.grandmaster_priority2 = 255;
            }
            self.timers.start(TIMER_ANNOUNCE_RECEIPT, self.announce_receipt_timeout_secs());
        } else {
            self.foreign_masters.clear();
            self.parent_port_identity = None;
            self.parent_dataset = None;
            self.transition_to(PortState::Listening);
        }
    }

    /// Periodic housekeeping: checks expired timers and reports which outgoing messages are due.
    /// Message construction is left to `build_announce`/`build_sync`/etc below and transmission to
    /// the caller's transport, keeping this module free of socket I/O.
    pub fn poll_timers(&mut self) -> PortTimerEvents {
        PortTimerEvents {
            announce_receipt: self.timers.expired(TIMER_ANNOUNCE_RECEIPT),
            send_announce: self.timers.expired(TIMER_ANNOUNCE_SEND),
            send_sync: self.timers.expired(TIMER_SYNC_SEND),
            send_delay_req: self.timers.expired(TIMER_DELAY_REQ),
            send_pdelay_req: self.timers.expired(TIMER_PDELAY_REQ),
            net_refresh: self.timers.expired(TIMER_NET_REFRESH),
        }
    }

    fn next_seq(counter: &mut u16) -> u16 {
        let seq = *counter;
        *counter = counter.wrapping_add(1);
        seq
    }

    /// Builds an outgoing Announce (general channel), carrying this port's own dataset as
    /// grandmaster (steps removed 0: boundary-clock relay of a parent's grandmaster identity is
    /// out of scope here, see spec.md's Non-goals).
    pub fn build_announce(&mut self) -> Vec<u8> {
        let seq = Self::next_seq(&mut self.announce_seq);
        let header = Header {
            message_type: MessageType::Announce,
            version_ptp: 2,
            message_length: crate::wire::ANNOUNCE_LEN as u16,
            domain_number: self.config.domain_number,
            flags: FlagField {
                utc_offset_valid: self.time_properties.utc_offset_valid,
                leap59: self.time_properties.leap59,
                leap61: self.time_properties.leap61,
                ptp_timescale: self.time_properties.ptp_timescale,
                time_traceable: self.time_properties.time_traceable,
                frequency_traceable: self.time_properties.frequency_traceable,
                ..Default::default()
            },
            correction_field_ns: 0,
            source_port_identity: self.config.port_identity,
            sequence_id: seq,
            control_field: crate::wire::control_field_for(MessageType::Announce),
            log_message_interval: self.config.log_announce_interval,
        };
        let body = AnnounceBody {
            origin_timestamp: crate::time::PtpTimestamp::ZERO,
            current_utc_offset: self.time_properties.current_utc_offset,
            grandmaster_priority1: self.config.priority1,
            grandmaster_clock_class: self.config.clock_class,
            grandmaster_clock_accuracy: self.config.clock_accuracy,
            grandmaster_offset_scaled_log_variance: self.config.offset_scaled_log_variance,
            grandmaster_priority2: self.config.priority2,
            grandmaster_identity: self.config.port_identity.clock_identity,
            steps_removed: 0,
            time_source: self.time_properties.time_source,
        };
        let mut buf = vec![0u8; crate::wire::ANNOUNCE_LEN];
        let _ = crate::wire::pack_header(&header, &mut buf);
        let _ = crate::wire::pack_announce_body(&body, &mut buf);
        buf
    }

    /// Builds an outgoing two-step Sync (event channel). The origin timestamp field is left zero
    /// since two-step Syncs carry their precise send time in the matching Follow_Up instead; the
    /// caller must invoke `build_follow_up` with the actual TX timestamp once `send` returns it.
    pub fn build_sync(&mut self) -> Vec<u8> {
        let seq = Self::next_seq(&mut self.sync_seq);
        self.last_sync_seq = seq;
        let header = Header {
            message_type: MessageType::Sync,
            version_ptp: 2,
            message_length: crate::wire::SYNC_LEN as u16,
            domain_number: self.config.domain_number,
            flags: FlagField { two_step: true, ..Default::default() },
            correction_field_ns: 0,
            source_port_identity: self.config.port_identity,
            sequence_id: seq,
            control_field: crate::wire::control_field_for(MessageType::Sync),
            log_message_interval: self.config.log_sync_interval,
        };
        let body = crate::wire::TimestampBody { origin_timestamp: crate::time::PtpTimestamp::ZERO };
        let mut buf = vec![0u8; crate::wire::SYNC_LEN];
        let _ = crate::wire::pack_header(&header, &mut buf);
        let _ = crate::wire::pack_timestamp_body(&body, &mut buf);
        buf
    }

    /// Builds the Follow_Up (general channel) matching the most recently built Sync, carrying its
    /// actual TX timestamp as `preciseOriginTimestamp`.
    pub fn build_follow_up(&self, precise_origin_timestamp: crate::time::PtpTimestamp) -> Vec<u8> {
        let header = Header {
            message_type: MessageType::FollowUp,
            version_ptp: 2,
            message_length: crate::wire::FOLLOW_UP_LEN as u16,
            domain_number: self.config.domain_number,
            flags: FlagField::default(),
            correction_field_ns: 0,
            source_port_identity: self.config.port_identity,
            sequence_id: self.last_sync_seq,
            control_field: crate::wire::control_field_for(MessageType::FollowUp),
            log_message_interval: self.config.log_sync_interval,
        };
        let body = crate::wire::FollowUpBody { origin_timestamp: precise_origin_timestamp };
        let mut buf = vec![0u8; crate::wire::FOLLOW_UP_LEN];
        let _ = crate::wire::pack_header(&header, &mut buf);
        let _ = crate::wire::pack_follow_up_body(&body, &mut buf);
        buf
    }

    /// Builds an outgoing Delay_Req (event channel), sent by a SLAVE/UNCALIBRATED port on its
    /// `TIMER_DELAY_REQ` firing. The transport has multicast loopback disabled, so the caller
    /// must synthesize this port's own receipt of its TX timestamp by re-dispatching the same
    /// header/buf with the TX time once `send` returns it — mirroring `handle_delay_req_echo`'s
    /// own-identity check.
    pub fn build_delay_req(&mut self) -> Vec<u8> {
        let seq = Self::next_seq(&mut self.delay_req_seq);
        let header = Header {
            message_type: MessageType::DelayReq,
            version_ptp: 2,
            message_length: crate::wire::DELAY_REQ_LEN as u16,
            domain_number: self.config.domain_number,
            flags: FlagField::default(),
            correction_field_ns: 0,
            source_port_identity: self.config.port_identity,
            sequence_id: seq,
            control_field: crate::wire::control_field_for(MessageType::DelayReq),
            log_message_interval: crate::wire::LOG_MESSAGE_INTERVAL_UNKNOWN,
        };
        let body = crate::wire::TimestampBody { origin_timestamp: crate::time::PtpTimestamp::ZERO };
        let mut buf = vec![0u8; crate::wire::DELAY_REQ_LEN];
        let _ = crate::wire::pack_header(&header, &mut buf);
        let _ = crate::wire::pack_timestamp_body(&body, &mut buf);
        buf
    }

    /// Builds an outgoing Pdelay_Req (event channel) for the peer-to-peer delay mechanism.
    /// Response handling stays structural-only per spec.md's Non-goals on peer delay.
    pub fn build_pdelay_req(&mut self) -> Vec<u8> {
        let seq = Self::next_seq(&mut self.pdelay_req_seq);
        let header = Header {
            message_type: MessageType::PdelayReq,
            version_ptp: 2,
            message_length: crate::wire::PDELAY_REQ_LEN as u16,
            domain_number: self.config.domain_number,
            flags: FlagField::default(),
            correction_field_ns: 0,
            source_port_identity: self.config.port_identity,
            sequence_id: seq,
            control_field: crate::wire::control_field_for(MessageType::PdelayReq),
            log_message_interval: crate::wire::LOG_MESSAGE_INTERVAL_UNKNOWN,
        };
        let body = crate::wire::PdelayReqBody { origin_timestamp: crate::time::PtpTimestamp::ZERO };
        let mut buf = vec![0u8; crate::wire::PDELAY_REQ_LEN];
        let _ = crate::wire::pack_header(&header, &mut buf);
        let _ = crate::wire::pack_pdelay_req_body(&body, &mut buf);
        buf
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortTimerEvents {
    pub announce_receipt: bool,
    pub send_announce: bool,
    pub send_sync: bool,
    pub send_delay_req: bool,
    pub send_pdelay_req: bool,
    pub net_refresh: bool,
}

fn nanos(t: crate::time::PtpTimestamp) -> i64 {
    t.seconds as i64 * 1_000_000_000 + t.nanoseconds as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmca::{compare_datasets, ComparisonResult};
    use crate::time::PtpTimestamp;

    fn port_identity(byte: u8, num: u16) -> PortIdentity {
        PortIdentity { clock_identity: ClockIdentity([byte; 8]), port_number: num }
    }

    fn base_header(message_type: MessageType, source: PortIdentity, seq: u16) -> Header {
        Header {
            message_type,
            version_ptp: 2,
            message_length: 64,
            domain_number: 0,
            flags: FlagField::default(),
            correction_field_ns: 0,
            source_port_identity: source,
            sequence_id: seq,
            control_field: 0,
            log_message_interval: 1,
        }
    }

    fn announce_buf(header: &Header, body: &AnnounceBody) -> Vec<u8> {
        let mut buf = vec![0u8; crate::wire::ANNOUNCE_LEN];
        crate::wire::pack_header(header, &mut buf).unwrap();
        crate::wire::pack_announce_body(body, &mut buf).unwrap();
        buf
    }

    fn sample_announce(gm: u8, priority1: u8) -> AnnounceBody {
        AnnounceBody {
            origin_timestamp: PtpTimestamp::ZERO,
            current_utc_offset: 37,
            grandmaster_priority1: priority1,
            grandmaster_clock_class: 6,
            grandmaster_clock_accuracy: 0x20,
            grandmaster_offset_scaled_log_variance: 0x4000,
            grandmaster_priority2: 128,
            grandmaster_identity: ClockIdentity([gm; 8]),
            steps_removed: 0,
            time_source: 0xa0,
        }
    }

    #[test]
    fn initializing_is_the_default_state() {
        let port = Port::new(PortConfig::default());
        assert_eq!(port.state, PortState::Initializing);
    }

    #[test]
    fn entering_listening_arms_announce_receipt_timer() {
        let mut port = Port::new(PortConfig::default());
        port.transition_to(PortState::Listening);
        assert!(port.timers.running(TIMER_ANNOUNCE_RECEIPT));
    }

    #[test]
    fn announce_from_self_is_ignored() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        port.transition_to(PortState::Listening);
        let header = base_header(MessageType::Announce, port.config.port_identity, 1);
        let body = sample_announce(9, 10);
        let buf = announce_buf(&header, &body);
        port.handle_announce(&header, &buf);
        assert!(port.foreign_masters.is_empty());
    }

    /// Mirrors spec.md §8 S1: the first two Announces only populate/refresh the foreign master
    /// table (`announceCount` 0 then 1, below the threshold of 2); only the third elects a parent.
    #[test]
    fn announce_from_foreign_master_populates_table_and_elects_parent_on_third_announce() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        port.transition_to(PortState::Listening);
        let sender = port_identity(9, 1);
        let header = base_header(MessageType::Announce, sender, 1);
        let body = sample_announce(9, 10);
        let buf = announce_buf(&header, &body);

        port.handle_announce(&header, &buf);
        assert_eq!(port.foreign_masters.len(), 1);
        assert_eq!(port.parent_port_identity, None);
        assert_eq!(port.state, PortState::Listening);

        port.handle_announce(&header, &buf);
        assert_eq!(port.parent_port_identity, None);
        assert_eq!(port.state, PortState::Listening);

        port.handle_announce(&header, &buf);
        assert_eq!(port.parent_port_identity, Some(sender));
        assert_eq!(port.state, PortState::Uncalibrated);
    }

    #[test]
    fn non_slave_only_port_with_no_foreign_masters_goes_premaster() {
        let mut port = Port::new(PortConfig::default());
        port.transition_to(PortState::Listening);
        port.run_bmca();
        assert_eq!(port.state, PortState::PreMaster);
    }

    #[test]
    fn slave_only_port_never_recommends_master() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        port.transition_to(PortState::Listening);
        port.run_bmca();
        assert_eq!(port.state, PortState::Listening);
    }

    #[test]
    fn announce_receipt_timeout_without_grace_clears_table_and_returns_to_listening() {
        let mut port = Port::new(PortConfig { slave_only: true, announce_timeout_grace_period: 0, ..PortConfig::default() });
        port.transition_to(PortState::Listening);
        let sender = port_identity(9, 1);
        let header = base_header(MessageType::Announce, sender, 1);
        let body = sample_announce(9, 10);
        let buf = announce_buf(&header, &body);
        for _ in 0..3 {
            port.handle_announce(&header, &buf);
        }
        assert_eq!(port.state, PortState::Uncalibrated);

        port.on_announce_receipt_timeout();
        assert_eq!(port.state, PortState::Listening);
        assert!(port.foreign_masters.is_empty());
    }

    #[test]
    fn announce_receipt_timeout_with_grace_disqualifies_before_clearing() {
        let mut port = Port::new(PortConfig { slave_only: true, announce_timeout_grace_period: 1, ..PortConfig::default() });
        port.transition_to(PortState::Listening);
        let sender = port_identity(9, 1);
        let header = base_header(MessageType::Announce, sender, 1);
        let body = sample_announce(9, 10);
        let buf = announce_buf(&header, &body);
        for _ in 0..3 {
            port.handle_announce(&header, &buf);
        }

        port.on_announce_receipt_timeout();
        assert_eq!(port.announce_grace_count, 1);
        assert_eq!(port.parent_dataset.unwrap().grandmaster_priority1, 255);
        assert_ne!(port.state, PortState::Listening);
    }

    #[test]
    fn sync_then_follow_up_produces_discipline_sample() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);

        let sync_header = Header { flags: FlagField { two_step: true, ..Default::default() }, ..base_header(MessageType::Sync, parent, 5) };
        let rx_time = PtpTimestamp::new(1000, 500_000_500);
        port.handle_sync(&sync_header, rx_time);
        assert!(port.pending_sync.is_some());

        let follow_header = base_header(MessageType::FollowUp, parent, 5);
        let t1 = PtpTimestamp::new(1000, 500_000_000);
        let mut buf = vec![0u8; crate::wire::FOLLOW_UP_LEN];
        crate::wire::pack_header(&follow_header, &mut buf).unwrap();
        crate::wire::pack_follow_up_body(&crate::wire::FollowUpBody { origin_timestamp: t1 }, &mut buf).unwrap();

        let sample = port.dispatch(&follow_header, &buf, rx_time);
        assert!(sample.is_some());
        assert_eq!(sample.unwrap().offset_ns, 250);
    }

    #[test]
    fn follow_up_with_mismatched_sequence_is_dropped() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);
        let sync_header = Header { flags: FlagField { two_step: true, ..Default::default() }, ..base_header(MessageType::Sync, parent, 5) };
        port.handle_sync(&sync_header, PtpTimestamp::new(1, 0));

        let follow_header = base_header(MessageType::FollowUp, parent, 6);
        let mut buf = vec![0u8; crate::wire::FOLLOW_UP_LEN];
        crate::wire::pack_header(&follow_header, &mut buf).unwrap();
        crate::wire::pack_follow_up_body(&crate::wire::FollowUpBody { origin_timestamp: PtpTimestamp::ZERO }, &mut buf).unwrap();
        assert!(port.dispatch(&follow_header, &buf, PtpTimestamp::new(1, 0)).is_none());
    }

    #[test]
    fn delay_resp_from_wrong_requester_is_ignored() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);
        port.pending_delay_req = Some(PendingDelayReq { sequence_id: 1, t3: PtpTimestamp::ZERO });

        let header = base_header(MessageType::DelayResp, parent, 1);
        let body = DelayRespBody {
            receive_timestamp: PtpTimestamp::new(5, 0),
            requesting_port_identity: port_identity(200, 9),
        };
        let mut buf = vec![0u8; crate::wire::DELAY_RESP_LEN];
        crate::wire::pack_header(&header, &mut buf).unwrap();
        crate::wire::pack_delay_resp_body(&body, &mut buf).unwrap();
        assert!(port.dispatch(&header, &buf, PtpTimestamp::ZERO).is_none());
    }

    #[test]
    fn message_from_wrong_domain_is_dropped_before_dispatch() {
        let mut port = Port::new(PortConfig::default());
        let mut header = base_header(MessageType::Announce, port_identity(1, 1), 1);
        header.domain_number = 7;
        let buf = vec![0u8; crate::wire::ANNOUNCE_LEN];
        assert!(port.dispatch(&header, &buf, PtpTimestamp::ZERO).is_none());
    }

    #[test]
    fn build_announce_sequence_ids_increase_monotonically() {
        let mut port = Port::new(PortConfig::default());
        let first = crate::wire::unpack_header(&port.build_announce()).unwrap();
        let second = crate::wire::unpack_header(&port.build_announce()).unwrap();
        assert_eq!(first.sequence_id, 0);
        assert_eq!(second.sequence_id, 1);
    }

    #[test]
    fn build_announce_carries_own_dataset_as_grandmaster() {
        let mut port = Port::new(PortConfig { priority1: 50, ..PortConfig::default() });
        let buf = port.build_announce();
        let header = crate::wire::unpack_header(&buf).unwrap();
        let body = crate::wire::unpack_announce_body(&buf, header.message_length).unwrap();
        assert_eq!(body.grandmaster_priority1, 50);
        assert_eq!(body.grandmaster_identity, port.config.port_identity.clock_identity);
        assert_eq!(body.steps_removed, 0);
    }

    #[test]
    fn build_sync_is_two_step_and_follow_up_carries_matching_sequence_and_timestamp() {
        let mut port = Port::new(PortConfig::default());
        let sync_buf = port.build_sync();
        let sync_header = crate::wire::unpack_header(&sync_buf).unwrap();
        assert!(sync_header.flags.two_step);

        let tx_time = PtpTimestamp::new(123, 456);
        let follow_buf = port.build_follow_up(tx_time);
        let follow_header = crate::wire::unpack_header(&follow_buf).unwrap();
        let follow_body = crate::wire::unpack_follow_up_body(&follow_buf, follow_header.message_length).unwrap();
        assert_eq!(follow_header.sequence_id, sync_header.sequence_id);
        assert_eq!(follow_body.origin_timestamp, tx_time);
    }

    #[test]
    fn announce_adopts_time_properties_from_parent_while_slave() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);

        let header = Header {
            flags: FlagField { leap59: true, utc_offset_valid: true, ptp_timescale: true, ..Default::default() },
            ..base_header(MessageType::Announce, parent, 1)
        };
        let body = AnnounceBody { current_utc_offset: 36, time_source: 0x10, ..sample_announce(9, 10) };
        let buf = announce_buf(&header, &body);
        port.handle_announce(&header, &buf);

        assert_eq!(port.time_properties.current_utc_offset, 36);
        assert!(port.time_properties.leap59);
        assert_eq!(port.time_properties.time_source, 0x10);
    }

    fn dispatch_delay_resp(port: &mut Port, parent: PortIdentity, seq: u16, receive_ns: i64) -> Option<DisciplineSample> {
        port.pending_delay_req = Some(PendingDelayReq { sequence_id: seq, t3: PtpTimestamp::ZERO });
        let header = base_header(MessageType::DelayResp, parent, seq);
        let body = DelayRespBody {
            receive_timestamp: PtpTimestamp::new(0, receive_ns as i32),
            requesting_port_identity: port.config.port_identity,
        };
        let mut buf = vec![0u8; crate::wire::DELAY_RESP_LEN];
        crate::wire::pack_header(&header, &mut buf).unwrap();
        crate::wire::pack_delay_resp_body(&body, &mut buf).unwrap();
        port.dispatch(&header, &buf, PtpTimestamp::ZERO)
    }

    #[test]
    fn peirces_outlier_test_rejects_a_wildly_divergent_delay_sample() {
        let mut port = Port::new(PortConfig { slave_only: true, delay_peirce_threshold: 3.0, ..PortConfig::default() });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);

        for (seq, ns) in [(1, 1000), (2, 1010), (3, 990)] {
            assert!(dispatch_delay_resp(&mut port, parent, seq, ns).is_some());
        }
        assert_eq!(port.delay_outlier_rejections, 0);

        let rejected = dispatch_delay_resp(&mut port, parent, 4, 50_000_000);
        assert!(rejected.is_none());
        assert_eq!(port.delay_outlier_rejections, 1);
    }

    #[test]
    fn zero_peirce_threshold_disables_the_outlier_test() {
        let mut port = Port::new(PortConfig { slave_only: true, ..PortConfig::default() });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);

        for (seq, ns) in [(1, 1000), (2, 1010), (3, 990)] {
            assert!(dispatch_delay_resp(&mut port, parent, seq, ns).is_some());
        }
        assert!(dispatch_delay_resp(&mut port, parent, 4, 50_000_000).is_some());
        assert_eq!(port.delay_outlier_rejections, 0);
    }

    #[test]
    fn interval_stat_filter_withholds_a_discipline_sample_until_the_window_fills() {
        let mut port = Port::new(PortConfig {
            slave_only: true,
            stat_filter_kind: StatFilterKind::Mean,
            stat_filter_window_type: WindowType::Interval,
            stat_filter_window_size: 3,
            ..PortConfig::default()
        });
        let parent = port_identity(9, 1);
        port.parent_port_identity = Some(parent);
        port.transition_to(PortState::Slave);

        assert!(dispatch_delay_resp(&mut port, parent, 1, 1000).is_none());
        assert!(dispatch_delay_resp(&mut port, parent, 2, 1010).is_none());
        assert!(dispatch_delay_resp(&mut port, parent, 3, 990).is_some());
    }

    #[test]
    fn invariant_i9_bmca_recommendation_matches_dataset_comparison() {
        let a = ComparisonDataset {
            grandmaster_identity: ClockIdentity([1; 8]),
            grandmaster_priority1: 10,
            grandmaster_clock_class: 6,
            grandmaster_clock_accuracy: 0x20,
            grandmaster_offset_scaled_log_variance: 0x4000,
            grandmaster_priority2: 128,
            steps_removed: 0,
            sender_identity: port_identity(1, 1),
        };
        let b = ComparisonDataset { grandmaster_identity: ClockIdentity([2; 8]), grandmaster_priority1: 200, ..a };
        assert_eq!(compare_datasets(&a, &b), ComparisonResult::ABetterByGrandmaster);
    }
}
