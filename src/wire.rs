//! PTP message header, body, and (minimal) management TLV codec.
//!
//! Bit-exact to IEEE 1588-2008 Table 18 (header) and the per-message body tables. Every unpack
//! routine verifies the field it is about to read lies within both the declared
//! `header.message_length` and the physical capture buffer before touching the bytes; a
//! violation increments `messageFormatErrors` territory by returning `WireError::Truncated`
//! rather than panicking. This module replaces the teacher's X-macro-generated pack/unpack pair
//! per field with one explicit, hand-written routine per message type — the "preserve the bit
//! layout, drop the preprocessor" redesign spec.md calls for.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::time::PtpTimestamp;

pub const HEADER_LEN: usize = 34;

pub const SYNC_LEN: usize = 44;
pub const DELAY_REQ_LEN: usize = 44;
pub const PDELAY_REQ_LEN: usize = 54;
pub const PDELAY_RESP_LEN: usize = 54;
pub const FOLLOW_UP_LEN: usize = 44;
pub const DELAY_RESP_LEN: usize = 54;
pub const PDELAY_RESP_FOLLOW_UP_LEN: usize = 54;
pub const ANNOUNCE_LEN: usize = 64;
pub const SIGNALING_LEN: usize = 44;
pub const MANAGEMENT_LEN: usize = 48;

pub const PTP_ETHER_DST: [u8; 6] = [0x01, 0x1b, 0x19, 0x00, 0x00, 0x00];
pub const PTP_ETHER_PEER: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e];
pub const PTP_ETHER_TYPE: u16 = 0x88f7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Truncated,
    UnknownMessageType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockIdentity(pub [u8; 8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    PdelayReq = 0x2,
    PdelayResp = 0x3,
    FollowUp = 0x8,
    DelayResp = 0x9,
    PdelayRespFollowUp = 0xa,
    Announce = 0xb,
    Signaling = 0xc,
    Management = 0xd,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v & 0x0f {
            0x0 => MessageType::Sync,
            0x1 => MessageType::DelayReq,
            0x2 => MessageType::PdelayReq,
            0x3 => MessageType::PdelayResp,
            0x8 => MessageType::FollowUp,
            0x9 => MessageType::DelayResp,
            0xa => MessageType::PdelayRespFollowUp,
            0xb => MessageType::Announce,
            0xc => MessageType::Signaling,
            0xd => MessageType::Management,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

/// Flag field bits, byte 0: bit0 alternateMaster, bit1 twoStep, bit2 unicast.
/// Byte 1: bits 0..5 leap61, leap59, utcOffsetValid, ptpTimescale, timeTraceable, frequencyTraceable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagField {
    pub alternate_master: bool,
    pub two_step: bool,
    pub unicast: bool,
    pub leap61: bool,
    pub leap59: bool,
    pub utc_offset_valid: bool,
    pub ptp_timescale: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
}

impl FlagField {
    fn from_bytes(b0: u8, b1: u8) -> Self {
        FlagField {
            alternate_master: b0 & 0x01 != 0,
            two_step: b0 & 0x02 != 0,
            unicast: b0 & 0x04 != 0,
            leap61: b1 & 0x01 != 0,
            leap59: b1 & 0x02 != 0,
            utc_offset_valid: b1 & 0x04 != 0,
            ptp_timescale: b1 & 0x08 != 0,
            time_traceable: b1 & 0x10 != 0,
            frequency_traceable: b1 & 0x20 != 0,
        }
    }

    fn to_bytes(self) -> [u8; 2] {
        let mut b0 = 0u8;
        if self.alternate_master {
            b0 |= 0x01;
        }
        if self.two_step {
            b0 |= 0x02;
        }
        if self.unicast {
            b0 |= 0x04;
        }
        let mut b1 = 0u8;
        if self.leap61 {
            b1 |= 0x01;
        }
        if self.leap59 {
            b1 |= 0x02;
        }
        if self.utc_offset_valid {
            b1 |= 0x04;
        }
        if self.ptp_timescale {
            b1 |= 0x08;
        }
        if self.time_traceable {
            b1 |= 0x10;
        }
        if self.frequency_traceable {
            b1 |= 0x20;
        }
        [b0, b1]
    }
}

/// The common 34-byte PTP header, present at the start of every message (Table 18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub version_ptp: u8,
    pub message_length: u16,
    pub domain_number: u8,
    pub flags: FlagField,
    pub correction_field_ns: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

/// Per spec.md §4.5 Table 24: outgoing master messages get their configured interval; all other
/// cases use the "unknown"/non-periodic sentinel.
pub const LOG_MESSAGE_INTERVAL_UNKNOWN: i8 = 0x7f_u8 as i8;

fn require(buf: &[u8], message_length: u16, end: usize) -> Result<(), WireError> {
    if end > buf.len() || end > message_length as usize {
        return Err(WireError::Truncated);
    }
    Ok(())
}

pub fn pack_header(h: &Header, buf: &mut [u8]) -> Result<(), WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    buf[0] = h.message_type as u8 & 0x0f;
    buf[1] = h.version_ptp & 0x0f;
    BigEndian::write_u16(&mut buf[2..4], h.message_length);
    buf[4] = h.domain_number;
    buf[5] = 0;
    let flags = h.flags.to_bytes();
    buf[6] = flags[0];
    buf[7] = flags[1];
    BigEndian::write_i64(&mut buf[8..16], h.correction_field_ns);
    buf[16..20].fill(0);
    buf[20..28].copy_from_slice(&h.source_port_identity.clock_identity.0);
    BigEndian::write_u16(&mut buf[28..30], h.source_port_identity.port_number);
    BigEndian::write_u16(&mut buf[30..32], h.sequence_id);
    buf[32] = h.control_field;
    buf[33] = h.log_message_interval as u8;
    Ok(())
}

pub fn unpack_header(buf: &[u8]) -> Result<Header, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let message_type = MessageType::from_u8(buf[0])?;
    let message_length = BigEndian::read_u16(&buf[2..4]);
    let mut clock_identity = [0u8; 8];
    clock_identity.copy_from_slice(&buf[20..28]);
    Ok(Header {
        message_type,
        version_ptp: buf[1] & 0x0f,
        message_length,
        domain_number: buf[4],
        flags: FlagField::from_bytes(buf[6], buf[7]),
        correction_field_ns: BigEndian::read_i64(&buf[8..16]),
        source_port_identity: PortIdentity {
            clock_identity: ClockIdentity(clock_identity),
            port_number: BigEndian::read_u16(&buf[28..30]),
        },
        sequence_id: BigEndian::read_u16(&buf[30..32]),
        control_field: buf[32],
        log_message_interval: buf[33] as i8,
    })
}

/// Sync / Delay_Req body: a single 10-byte `originTimestamp`, at offset 34, 10 bytes (total 44).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampBody {
    pub origin_timestamp: PtpTimestamp,
}

pub fn pack_timestamp_body(body: &TimestampBody, buf: &mut [u8]) -> Result<(), WireError> {
    if buf.len() < SYNC_LEN {
        return Err(WireError::Truncated);
    }
    let mut wire = [0u8; 10];
    body.origin_timestamp.to_wire_timestamp(&mut wire);
    buf[HEADER_LEN..HEADER_LEN + 10].copy_from_slice(&wire);
    Ok(())
}

pub fn unpack_timestamp_body(buf: &[u8], message_length: u16) -> Result<TimestampBody, WireError> {
    require(buf, message_length, HEADER_LEN + 10)?;
    let mut wire = [0u8; 10];
    wire.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 10]);
    Ok(TimestampBody { origin_timestamp: PtpTimestamp::from_wire_timestamp(&wire) })
}

/// Follow_Up body: `preciseOriginTimestamp`, same 10-byte shape as `TimestampBody`.
pub type FollowUpBody = TimestampBody;
pub fn pack_follow_up_body(body: &FollowUpBody, buf: &mut [u8]) -> Result<(), WireError> {
    pack_timestamp_body(body, buf)
}
pub fn unpack_follow_up_body(buf: &[u8], message_length: u16) -> Result<FollowUpBody, WireError> {
    unpack_timestamp_body(buf, message_length)
}

/// Delay_Resp / Pdelay_Resp body: `receiveTimestamp` (10 bytes) + `requestingPortIdentity` (10
/// bytes), total 20 bytes of body after the header (message length 54).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRespBody {
    pub receive_timestamp: PtpTimestamp,
    pub requesting_port_identity: PortIdentity,
}

pub fn pack_delay_resp_body(body: &DelayRespBody, buf: &mut [u8]) -> Result<(), WireError> {
    if buf.len() < DELAY_RESP_LEN {
        return Err(WireError::Truncated);
    }
    let mut wire = [0u8; 10];
    body.receive_timestamp.to_wire_timestamp(&mut wire);
    buf[HEADER_LEN..HEADER_LEN + 10].copy_from_slice(&wire);
    buf[HEADER_LEN + 10..HEADER_LEN + 18].copy_from_slice(&body.requesting_port_identity.clock_identity.0);
    BigEndian::write_u16(&mut buf[HEADER_LEN + 18..HEADER_LEN + 20], body.requesting_port_identity.port_number);
    Ok(())
}

pub fn unpack_delay_resp_body(buf: &[u8], message_length: u16) -> Result<DelayRespBody, WireError> {
    require(buf, message_length, HEADER_LEN + 20)?;
    let mut wire = [0u8; 10];
    wire.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 10]);
    let mut clock_identity = [0u8; 8];
    clock_identity.copy_from_slice(&buf[HEADER_LEN + 10..HEADER_LEN + 18]);
    Ok(DelayRespBody {
        receive_timestamp: PtpTimestamp::from_wire_timestamp(&wire),
        requesting_port_identity: PortIdentity {
            clock_identity: ClockIdentity(clock_identity),
            port_number: BigEndian::read_u16(&buf[HEADER_LEN + 18..HEADER_LEN + 20]),
        },
    })
}

pub type PdelayRespBody = DelayRespBody;
pub fn pack_pdelay_resp_body(body: &PdelayRespBody, buf: &mut [u8]) -> Result<(), WireError> {
    pack_delay_resp_body(body, buf)
}
pub fn unpack_pdelay_resp_body(buf: &[u8], message_length: u16) -> Result<PdelayRespBody, WireError> {
    unpack_delay_resp_body(buf, message_length)
}
pub type PdelayRespFollowUpBody = DelayRespBody;
pub fn pack_pdelay_resp_follow_up_body(body: &PdelayRespFollowUpBody, buf: &mut [u8]) -> Result<(), WireError> {
    pack_delay_resp_body(body, buf)
}
pub fn unpack_pdelay_resp_follow_up_body(buf: &[u8], message_length: u16) -> Result<PdelayRespFollowUpBody, WireError> {
    unpack_delay_resp_body(buf, message_length)
}

/// Announce body: `originTimestamp` (10) + `currentUtcOffset` (2) + reserved (1) +
/// `grandmasterPriority1` (1) + `grandmasterClockQuality` (4: clockClass, clockAccuracy,
/// offsetScaledLogVariance[2]) + `grandmasterPriority2` (1) + `grandmasterIdentity` (8) +
/// `stepsRemoved` (2) + `timeSource` (1) = 30 bytes of body (total 64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin_timestamp: PtpTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_class: u8,
    pub grandmaster_clock_accuracy: u8,
    pub grandmaster_offset_scaled_log_variance: u16,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

pub fn pack_announce_body(body: &AnnounceBody, buf: &mut [u8]) -> Result<(), WireError> {
    if buf.len() < ANNOUNCE_LEN {
        return Err(WireError::Truncated);
    }
    let o = HEADER_LEN;
    let mut wire = [0u8; 10];
    body.origin_timestamp.to_wire_timestamp(&mut wire);
    buf[o..o + 10].copy_from_slice(&wire);
    BigEndian::write_i16(&mut buf[o + 10..o + 12], body.current_utc_offset);
    buf[o + 12] = 0;
    buf[o + 13] = body.grandmaster_priority1;
    buf[o + 14] = body.grandmaster_clock_class;
    buf[o + 15] = body.grandmaster_clock_accuracy;
    BigEndian::write_u16(&mut buf[o + 16..o + 18], body.grandmaster_offset_scaled_log_variance);
    buf[o + 18] = body.grandmaster_priority2;
    buf[o + 19..o + 27].copy_from_slice(&body.grandmaster_identity.0);
    BigEndian::write_u16(&mut buf[o + 27..o + 29], body.steps_removed);
    buf[o + 29] = body.time_source;
    Ok(())
}

pub fn unpack_announce_body(buf: &[u8], message_length: u16) -> Result<AnnounceBody, WireError> {
    let o = HEADER_LEN;
    require(buf, message_length, o + 30)?;
    let mut wire = [0u8; 10];
    wire.copy_from_slice(&buf[o..o + 10]);
    let mut gm_identity = [0u8; 8];
    gm_identity.copy_from_slice(&buf[o + 19..o + 27]);
    Ok(AnnounceBody {
        origin_timestamp: PtpTimestamp::from_wire_timestamp(&wire),
        current_utc_offset: BigEndian::read_i16(&buf[o + 10..o + 12]),
        grandmaster_priority1: buf[o + 13],
        grandmaster_clock_class: buf[o + 14],
        grandmaster_clock_accuracy: buf[o + 15],
        grandmaster_offset_scaled_log_variance: BigEndian::read_u16(&buf[o + 16..o + 18]),
        grandmaster_priority2: buf[o + 18],
        grandmaster_identity: ClockIdentity(gm_identity),
        steps_removed: BigEndian::read_u16(&buf[o + 27..o + 29]),
        time_source: buf[o + 29],
    })
}

/// Pdelay_Req body: `originTimestamp` (10) + reserved (10), total message length 54.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdelayReqBody {
    pub origin_timestamp: PtpTimestamp,
}

pub fn pack_pdelay_req_body(body: &PdelayReqBody, buf: &mut [u8]) -> Result<(), WireError> {
    if buf.len() < PDELAY_REQ_LEN {
        return Err(WireError::Truncated);
    }
    let mut wire = [0u8; 10];
    body.origin_timestamp.to_wire_timestamp(&mut wire);
    buf[HEADER_LEN..HEADER_LEN + 10].copy_from_slice(&wire);
    buf[HEADER_LEN + 10..HEADER_LEN + 20].fill(0);
    Ok(())
}

pub fn unpack_pdelay_req_body(buf: &[u8], message_length: u16) -> Result<PdelayReqBody, WireError> {
    require(buf, message_length, HEADER_LEN + 10)?;
    let mut wire = [0u8; 10];
    wire.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 10]);
    Ok(PdelayReqBody { origin_timestamp: PtpTimestamp::from_wire_timestamp(&wire) })
}

/// Minimal management body: just enough of the common management fields to bound-check and
/// acknowledge with a "not supported" response; TLV payload interpretation is out of scope
/// (spec.md §9, Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementBody {
    pub target_port_identity: PortIdentity,
    pub starting_boundary_hops: u8,
    pub boundary_hops: u8,
    pub action_field: u8,
}

pub fn unpack_management_body(buf: &[u8], message_length: u16) -> Result<ManagementBody, WireError> {
    let o = HEADER_LEN;
    require(buf, message_length, o + 12)?;
    let mut clock_identity = [0u8; 8];
    clock_identity.copy_from_slice(&buf[o..o + 8]);
    Ok(ManagementBody {
        target_port_identity: PortIdentity {
            clock_identity: ClockIdentity(clock_identity),
            port_number: BigEndian::read_u16(&buf[o + 8..o + 10]),
        },
        starting_boundary_hops: buf[o + 10],
        boundary_hops: buf[o + 11],
        action_field: if buf.len() > o + 12 { buf[o + 12] & 0x0f } else { 0 },
    })
}

/// `logMessageInterval` policy for outgoing messages per Table 24: configured interval while
/// multicast master, `0x7F` otherwise.
pub fn out_log_message_interval(is_multicast_master: bool, configured: i8) -> i8 {
    if is_multicast_master {
        configured
    } else {
        LOG_MESSAGE_INTERVAL_UNKNOWN
    }
}

/// `controlField` per Table 23: a legacy PTPv1-compatibility byte, fixed per message type.
pub fn control_field_for(message_type: MessageType) -> u8 {
    match message_type {
        MessageType::Sync => 0,
        MessageType::DelayReq => 1,
        MessageType::FollowUp => 2,
        MessageType::DelayResp => 3,
        MessageType::Management => 4,
        _ => 5,
    }
}
