//! NTP decoder.
//!
//! The mode field selects the message layout: modes 1-5 carry the 48-byte
//! timestamp format, mode 6 is a control message and mode 7 a private
//! (implementation-specific) message.

use std::sync::Arc;

use super::app_context;
use crate::address::ProtocolTag;
use crate::context::{ContextNode, ContextState};
use crate::dispatch::{read_u16, read_u32, Pdu};
use crate::engine::Engine;
use crate::error::{ProtocolError, Result};
use crate::event::EventPayload;

const PROTOCOL: &str = "NTP";

const TIMESTAMP_LEN: usize = 48;
const CONTROL_HEADER: usize = 12;
const PRIVATE_HEADER: usize = 4;

/// Seconds between the NTP era start (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u32 = 2_208_988_800;

pub mod mode {
    pub const CONTROL: u8 = 6;
    pub const PRIVATE: u8 = 7;
}

/// Fields of the first octet, common to all modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpHeader {
    pub leap_indicator: u8,
    pub version: u8,
    pub mode: u8,
}

impl NtpHeader {
    fn parse(first: u8) -> Self {
        Self {
            leap_indicator: (first & 0xc0) >> 6,
            version: (first & 0x38) >> 3,
            mode: first & 0x07,
        }
    }
}

/// Client, server, symmetric and broadcast messages.
#[derive(Debug, Clone, PartialEq)]
pub struct NtpTimestamp {
    pub header: NtpHeader,
    pub stratum: u8,
    /// Poll interval in seconds.
    pub poll: f64,
    /// Clock precision in seconds.
    pub precision: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub reference_id: u32,
    /// Timestamps as seconds since the Unix epoch; zero when unset.
    pub reference_timestamp: f64,
    pub originate_timestamp: f64,
    pub receive_timestamp: f64,
    pub transmit_timestamp: f64,
    /// Extension fields or a MAC follow the fixed header.
    pub has_extension: bool,
}

/// Mode 6 control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpControl {
    pub header: NtpHeader,
    pub is_response: bool,
    pub is_error: bool,
    pub is_fragment: bool,
    pub opcode: u8,
    pub sequence: u16,
    pub status: u16,
    pub association_id: u16,
    pub offset: u16,
    pub count: u16,
    pub has_authentication: bool,
}

/// Mode 7 private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpPrivate {
    pub header: NtpHeader,
    pub auth_flag: bool,
    pub sequence: u8,
    pub implementation: u8,
    pub request_code: u8,
}

/// Signed log2 seconds to seconds.
fn log2_seconds(value: u8) -> f64 {
    2f64.powi(i32::from(value as i8))
}

/// 16.16 fixed point seconds.
fn short_format(value: u32) -> f64 {
    f64::from(value) / 65536.0
}

/// 32.32 fixed point NTP timestamp to Unix seconds.
fn timestamp(data: &[u8], offset: usize) -> f64 {
    let secs = read_u32(data, offset);
    let frac = read_u32(data, offset + 4);
    if secs == 0 && frac == 0 {
        return 0.0;
    }
    f64::from(secs.wrapping_sub(NTP_UNIX_OFFSET)) + f64::from(frac) / 4_294_967_296.0
}

/// Decode one NTP message.
pub fn parse(data: &[u8]) -> std::result::Result<EventPayload, ProtocolError> {
    let first = *data.first().ok_or_else(|| ProtocolError::too_short(PROTOCOL, 1, 0))?;
    let header = NtpHeader::parse(first);
    match header.mode {
        mode::CONTROL => parse_control(header, data).map(EventPayload::NtpControl),
        mode::PRIVATE => parse_private(header, data).map(EventPayload::NtpPrivate),
        _ => parse_timestamp(header, data).map(EventPayload::NtpTimestamp),
    }
}

fn parse_timestamp(header: NtpHeader, data: &[u8]) -> std::result::Result<NtpTimestamp, ProtocolError> {
    if data.len() < TIMESTAMP_LEN {
        return Err(ProtocolError::too_short(PROTOCOL, TIMESTAMP_LEN, data.len()));
    }
    Ok(NtpTimestamp {
        header,
        stratum: data[1],
        poll: log2_seconds(data[2]),
        precision: log2_seconds(data[3]),
        root_delay: short_format(read_u32(data, 4)),
        root_dispersion: short_format(read_u32(data, 8)),
        reference_id: read_u32(data, 12),
        reference_timestamp: timestamp(data, 16),
        originate_timestamp: timestamp(data, 24),
        receive_timestamp: timestamp(data, 32),
        transmit_timestamp: timestamp(data, 40),
        has_extension: data.len() > TIMESTAMP_LEN,
    })
}

fn parse_control(header: NtpHeader, data: &[u8]) -> std::result::Result<NtpControl, ProtocolError> {
    if data.len() < CONTROL_HEADER {
        return Err(ProtocolError::too_short(PROTOCOL, CONTROL_HEADER, data.len()));
    }
    let count = read_u16(data, 10);
    // Data is padded to a 32-bit boundary before any authenticator.
    let padded = (usize::from(count) + 3) & !3;
    Ok(NtpControl {
        header,
        is_response: data[1] & 0x80 != 0,
        is_error: data[1] & 0x40 != 0,
        is_fragment: data[1] & 0x20 != 0,
        opcode: data[1] & 0x1f,
        sequence: read_u16(data, 2),
        status: read_u16(data, 4),
        association_id: read_u16(data, 6),
        offset: read_u16(data, 8),
        count,
        has_authentication: data.len() > CONTROL_HEADER + padded,
    })
}

fn parse_private(header: NtpHeader, data: &[u8]) -> std::result::Result<NtpPrivate, ProtocolError> {
    if data.len() < PRIVATE_HEADER {
        return Err(ProtocolError::too_short(PROTOCOL, PRIVATE_HEADER, data.len()));
    }
    Ok(NtpPrivate {
        header,
        auth_flag: data[1] & 0x80 != 0,
        sequence: data[1] & 0x7f,
        implementation: data[2],
        request_code: data[3],
    })
}

pub fn process(engine: &Engine, transport: &Arc<ContextNode>, pdu: Pdu<'_>) -> Result<()> {
    let event = parse(pdu.data)?;
    let context = app_context(transport, ProtocolTag::Ntp, pdu.direction, || ContextState::Ntp);
    engine.emit(&context, pdu.timestamp_us, event);
    Ok(())
}
