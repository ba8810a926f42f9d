// src/broadcast.rs
//
// Passive broadcast capture and the degenerate-RTR-response healing
// strategy (§4.H). The heat pump periodically broadcasts certain values
// (outdoor temperature across circuits, etc.) unsolicited; `base = can_id
// & 0x3FFF` groups frames by sensor/circuit and `idx = (can_id >> 14) &
// 0xFFF` recovers the parameter index when one exists.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codec::{self, DecodedValue};
use crate::error::Error;
use crate::frame::CanFrame;
use crate::slcan::SlcanLink;
use crate::table::Parameter;
use crate::transport::SerialTransport;

/// One captured broadcast frame, decoded as far as the bare bytes allow.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastReading {
    pub can_id: u32,
    pub base: u32,
    pub idx: u32,
    pub dlc: u8,
    pub raw_bytes: Vec<u8>,
    /// Big-endian signed value over `raw_bytes[0:2]` when `dlc >= 2`,
    /// tenths of a unit for `tem`-shaped broadcasts; `0` otherwise.
    pub raw_value: i32,
    pub timestamp_us: Option<u64>,
}

impl BroadcastReading {
    fn from_frame(frame: &CanFrame) -> Self {
        let (base, idx) = frame.broadcast_layout();
        let raw_value = if frame.data.len() >= 2 {
            i16::from_be_bytes([frame.data[0], frame.data[1]]) as i32
        } else {
            0
        };
        Self {
            can_id: frame.id,
            base,
            idx,
            dlc: frame.dlc(),
            raw_bytes: frame.data.clone(),
            raw_value,
            timestamp_us: frame.timestamp_us,
        }
    }

    /// A 2-byte payload whose signed value sits within the plausible
    /// tenths-of-a-degree range for this protocol's `tem` format.
    pub fn is_temperature(&self) -> bool {
        self.dlc == 2 && (-500..=1500).contains(&self.raw_value)
    }

    pub fn decode_as(&self, format: &str) -> crate::error::Result<DecodedValue> {
        codec::decode(format, &self.raw_bytes)
    }
}

/// Snapshot of the most recently observed reading per CAN ID.
#[derive(Default)]
pub struct BroadcastCache {
    latest: HashMap<u32, BroadcastReading>,
}

impl BroadcastCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, frame: &CanFrame) {
        let reading = BroadcastReading::from_frame(frame);
        self.latest.insert(reading.can_id, reading);
    }

    pub fn get(&self, can_id: u32) -> Option<&BroadcastReading> {
        self.latest.get(&can_id)
    }

    pub fn by_base(&self, base: u32) -> Vec<&BroadcastReading> {
        let mut v: Vec<&BroadcastReading> = self
            .latest
            .values()
            .filter(|r| r.base == base)
            .collect();
        v.sort_by_key(|r| r.can_id);
        v
    }

    /// Readings whose recovered `idx` matches a parameter index, across
    /// every circuit base that broadcasts it.
    pub fn by_idx(&self, idx: u32) -> Vec<&BroadcastReading> {
        let mut v: Vec<&BroadcastReading> = self.latest.values().filter(|r| r.idx == idx).collect();
        v.sort_by_key(|r| r.can_id);
        v
    }

    /// Every captured reading, sorted by CAN ID.
    pub fn all(&self) -> Vec<&BroadcastReading> {
        let mut v: Vec<&BroadcastReading> = self.latest.values().collect();
        v.sort_by_key(|r| r.can_id);
        v
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Passively capture broadcast traffic for `duration`, skipping frames
/// that don't match `filter` (when given). Non-broadcast traffic (e.g.
/// stray RTR echoes) is recorded too — callers filter by base/idx.
pub fn collect<T: SerialTransport>(
    link: &mut SlcanLink<T>,
    duration: Duration,
    filter: Option<&dyn Fn(&CanFrame) -> bool>,
) -> crate::error::Result<BroadcastCache> {
    let mut cache = BroadcastCache::new();
    let deadline = Instant::now() + duration;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match link.receive(remaining) {
            Ok(frame) => {
                if filter.map(|f| f(&frame)).unwrap_or(true) {
                    cache.record(&frame);
                }
            }
            Err(Error::Timeout { .. }) => break,
            Err(e) => return Err(e),
        }
    }

    Ok(cache)
}

/// A read response is "degenerate" when it carries fewer bytes than the
/// parameter's format requires to decode unambiguously — observed for
/// `tem` parameters that reply with 1 byte instead of 2. When this
/// happens, fall back to broadcast capture instead of trusting the RTR
/// reply.
pub fn is_degenerate_response(parameter: &Parameter, frame: &CanFrame) -> bool {
    parameter.format == "tem" && frame.data.len() < 2
}

/// Recover a value for `parameter` from broadcast traffic already
/// collected in `cache`. Tries the parameter's own CAN ID first; if that
/// reading is missing or doesn't look like a temperature, tries every
/// other circuit base sharing the same recovered `idx` in turn, returning
/// the first one whose `is_temperature` predicate holds — broadcasts for
/// multi-circuit sensors (e.g. outdoor temperature) show up on whichever
/// base that circuit uses, not necessarily the parameter's own ID.
pub fn lookup<'a>(cache: &'a BroadcastCache, parameter: &Parameter) -> Option<&'a BroadcastReading> {
    if let Some(reading) = cache.get(parameter.write_id()) {
        if reading.is_temperature() {
            return Some(reading);
        }
    }
    cache
        .by_idx(parameter.index)
        .into_iter()
        .find(|r| r.is_temperature())
}
