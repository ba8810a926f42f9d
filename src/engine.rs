// src/engine.rs
//
// Ties slcan + table + codec + cache + discovery + broadcast together
// into the three CAN flows (§4.E): RTR read, write, and broadcast
// capture, plus the startup three-tier parameter load policy
// (cache -> discovery -> embedded fallback, §3/§4.G).

use std::time::{Duration, Instant};

use crate::broadcast::{self, BroadcastCache};
use crate::cache::ParameterCache;
use crate::codec::{self, DecodedValue, EncodeInput};
use crate::discovery;
use crate::error::{Error, Result};
use crate::fallback_table;
use crate::frame::CanFrame;
use crate::slcan::SlcanLink;
use crate::table::{Parameter, ParameterTable};
use crate::transport::SerialTransport;

/// Default timeout for a single RTR read (§4.E, "default 5 s").
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Collection window for the broadcast-fallback healing strategy after a
/// degenerate RTR response. Short relative to `DEFAULT_READ_TIMEOUT`
/// since most sensors broadcast at least once every second or two.
const FALLBACK_COLLECT_WINDOW: Duration = Duration::from_millis(500);

/// Where the active parameter table came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterSource {
    Cache,
    Discovery,
    Fallback,
}

impl ParameterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterSource::Cache => "cache",
            ParameterSource::Discovery => "discovery",
            ParameterSource::Fallback => "fallback",
        }
    }
}

/// Where a read's value actually came from: a direct RTR reply, or a
/// healed broadcast capture after a degenerate RTR response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    Rtr,
    Broadcast,
}

impl ReadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadSource::Rtr => "rtr",
            ReadSource::Broadcast => "broadcast",
        }
    }
}

/// Outcome of a single parameter read, matching the CLI's `{name, idx,
/// raw, decoded, source}` output shape.
#[derive(Clone, Debug)]
pub struct ReadOutcome {
    pub name: String,
    pub idx: u32,
    pub raw: Vec<u8>,
    pub decoded: DecodedValue,
    pub source: ReadSource,
}

/// Tuning knobs for discovery, broken out so callers (and tests) can pick
/// short windows without touching the default production values.
#[derive(Clone, Copy, Debug)]
pub struct DiscoveryTimeouts {
    pub per_frame: Duration,
    pub collect_window: Duration,
}

impl Default for DiscoveryTimeouts {
    fn default() -> Self {
        Self {
            per_frame: Duration::from_secs(2),
            collect_window: Duration::from_millis(500),
        }
    }
}

/// Owns the slcan link and the active parameter table; the single point
/// of entry for reads, writes, and broadcast captures.
pub struct Engine<T: SerialTransport> {
    link: SlcanLink<T>,
    table: ParameterTable,
    source: ParameterSource,
}

impl<T: SerialTransport> Engine<T> {
    /// Open the link and resolve the parameter table via the three-tier
    /// load policy: a valid disk cache first, then live discovery
    /// (persisted back to the cache on success), then the embedded
    /// fallback table.
    pub fn open(
        transport: T,
        device: impl Into<String>,
        read_only: bool,
        cache: &ParameterCache,
        discovery_timeouts: DiscoveryTimeouts,
    ) -> Result<Self> {
        let mut link = SlcanLink::new(transport, device, read_only);
        link.open()?;
        let (table, source) = Self::load_parameters(&mut link, cache, discovery_timeouts)?;
        Ok(Self {
            link,
            table,
            source,
        })
    }

    fn load_parameters(
        link: &mut SlcanLink<T>,
        cache: &ParameterCache,
        timeouts: DiscoveryTimeouts,
    ) -> Result<(ParameterTable, ParameterSource)> {
        if let Some(params) = cache.load() {
            if let Ok(table) = ParameterTable::build(params) {
                tracing::info!(count = table.len(), "loaded parameter table from cache");
                return Ok((table, ParameterSource::Cache));
            }
            tracing::warn!("cached parameters failed to build a consistent table, discarding");
        }

        match discovery::discover(link, timeouts.per_frame, timeouts.collect_window)
            .and_then(discovery::require_near_complete)
        {
            Ok(elements) => {
                let params: Vec<Parameter> = elements.into_iter().map(Into::into).collect();
                match ParameterTable::build(params.clone()) {
                    Ok(table) => {
                        tracing::info!(count = table.len(), "loaded parameter table via discovery");
                        if !cache.save(&params, None, None) {
                            tracing::warn!("failed to persist discovered parameters to cache");
                        }
                        return Ok((table, ParameterSource::Discovery));
                    }
                    Err(e) => tracing::warn!(error = %e, "discovered parameters failed to build a table"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "parameter discovery failed"),
        }

        tracing::warn!("falling back to the embedded parameter table");
        let table = ParameterTable::build(fallback_table::parameters())?;
        Ok((table, ParameterSource::Fallback))
    }

    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub fn source(&self) -> ParameterSource {
        self.source
    }

    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }

    /// RTR read of a single parameter by name or index, healing a
    /// degenerate response by falling back to a broadcast capture unless
    /// `no_fallback` is set (§4.H).
    pub fn read(&mut self, name: &str, timeout: Duration, no_fallback: bool) -> Result<ReadOutcome> {
        let parameter = self.table.resolve(name)?.clone();
        let frame = self.read_rtr_frame(&parameter, timeout)?;

        if !no_fallback && broadcast::is_degenerate_response(&parameter, &frame) {
            tracing::warn!(
                parameter = %parameter.name,
                "degenerate RTR response, falling back to broadcast capture"
            );
            match self.read_via_broadcast(&parameter, FALLBACK_COLLECT_WINDOW) {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    tracing::warn!(
                        parameter = %parameter.name,
                        error = %e,
                        "broadcast fallback found nothing, returning degenerate value"
                    );
                }
            }
        }

        let decoded = codec::decode(&parameter.format, &frame.data)?;
        Ok(ReadOutcome {
            name: parameter.name,
            idx: parameter.index,
            raw: frame.data,
            decoded,
            source: ReadSource::Rtr,
        })
    }

    /// Read a parameter purely from broadcast traffic, skipping the RTR
    /// request entirely (the CLI's explicit `--broadcast` mode).
    pub fn read_broadcast_only(&mut self, name: &str, window: Duration) -> Result<ReadOutcome> {
        let parameter = self.table.resolve(name)?.clone();
        self.read_via_broadcast(&parameter, window)
    }

    fn read_rtr_frame(&mut self, parameter: &Parameter, timeout: Duration) -> Result<CanFrame> {
        self.link.flush_input()?;
        self.link.send(&CanFrame::rtr(parameter.read_id())?)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    operation: format!("read {}", parameter.name),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let frame = self.link.receive(remaining)?;
            if frame.id == parameter.write_id() {
                return Ok(frame);
            }
        }
    }

    fn read_via_broadcast(&mut self, parameter: &Parameter, window: Duration) -> Result<ReadOutcome> {
        let cache = broadcast::collect(&mut self.link, window, None)?;
        let reading = broadcast::lookup(&cache, parameter).ok_or_else(|| Error::Protocol {
            details: format!("no broadcast reading found for {}", parameter.name),
        })?;
        let decoded = codec::decode(&parameter.format, &reading.raw_bytes)?;
        Ok(ReadOutcome {
            name: parameter.name.clone(),
            idx: parameter.index,
            raw: reading.raw_bytes.clone(),
            decoded,
            source: ReadSource::Broadcast,
        })
    }

    /// Write a value to a parameter by name or index. Rejects read-only
    /// parameters and parameters with an inconsistent range before ever
    /// touching the wire.
    pub fn write(&mut self, name: &str, input: EncodeInput) -> Result<()> {
        let parameter = self.table.resolve(name)?.clone();
        if !parameter.is_writable() {
            return Err(Error::ReadOnly {
                details: format!("{} is read-only", parameter.name),
            });
        }
        if parameter.has_inconsistent_range() {
            return Err(Error::InconsistentRange(parameter.name));
        }
        let bytes = codec::encode(&parameter.format, parameter.min, parameter.max, input)?;
        // Per the reference driver, writes target the read-id base.
        self.link.send(&CanFrame::data(parameter.read_id(), bytes)?)?;
        Ok(())
    }

    /// Passively capture broadcast traffic for `duration`.
    pub fn monitor(&mut self, duration: Duration) -> Result<BroadcastCache> {
        broadcast::collect(&mut self.link, duration, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::MockTransport;

    fn make_cache(dir: &tempfile::TempDir) -> ParameterCache {
        ParameterCache::new(dir.path().join("params.json"))
    }

    fn line_bytes(id: u32, dlc: u8, data: &[u8]) -> Vec<u8> {
        let mut s = format!("T{:08X}{:X}", id, dlc);
        for b in data {
            s.push_str(&format!("{:02X}", b));
        }
        s.push('\r');
        s.into_bytes()
    }

    #[test]
    fn open_falls_back_to_embedded_table_when_cache_and_discovery_fail() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(&dir);
        let transport = MockTransport::new(); // no frames queued at all: discovery times out
        let engine = Engine::open(
            transport,
            "mock",
            false,
            &cache,
            DiscoveryTimeouts {
                per_frame: Duration::from_millis(20),
                collect_window: Duration::from_millis(20),
            },
        )
        .unwrap();
        assert_eq!(engine.source(), ParameterSource::Fallback);
        assert_eq!(engine.table().len(), fallback_table::EMBEDDED_PARAMETER_COUNT);
    }

    #[test]
    fn open_prefers_a_valid_cache_over_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let cache = make_cache(&dir);
        let params = vec![Parameter {
            index: 1,
            ext_id: "61E1E1FC660023".to_string(),
            min: 0,
            max: 5,
            format: "int".to_string(),
            read: 0,
            name: "ACCESS_LEVEL".to_string(),
        }];
        cache.save(&params, None, None);

        let transport = MockTransport::new();
        let engine = Engine::open(
            transport,
            "mock",
            false,
            &cache,
            DiscoveryTimeouts {
                per_frame: Duration::from_millis(20),
                collect_window: Duration::from_millis(20),
            },
        )
        .unwrap();
        assert_eq!(engine.source(), ParameterSource::Cache);
        assert_eq!(engine.table().len(), 1);
    }

    fn engine_with_fallback_table(transport: MockTransport) -> Engine<MockTransport> {
        let dir = tempfile::tempdir().unwrap();
        let cache = ParameterCache::new(dir.path().join("missing.json"));
        Engine::open(
            transport,
            "mock",
            false,
            &cache,
            DiscoveryTimeouts {
                per_frame: Duration::from_millis(20),
                collect_window: Duration::from_millis(20),
            },
        )
        .unwrap()
    }

    #[test]
    fn read_decodes_matching_rtr_response() {
        let mut transport = MockTransport::new();
        // ACCESS_LEVEL is index 1 -> write_id 0x0C007FE0, per the embedded table.
        transport.push_inbound(&line_bytes(0x0C007FE0, 1, &[0x02]));
        let mut engine = engine_with_fallback_table(transport);
        let outcome = engine
            .read("ACCESS_LEVEL", Duration::from_millis(200), false)
            .unwrap();
        assert_eq!(outcome.idx, 1);
        assert_eq!(outcome.source, ReadSource::Rtr);
        assert_eq!(outcome.decoded, DecodedValue::Int(2));
    }

    #[test]
    fn read_accepts_a_numeric_index_in_place_of_a_name() {
        let mut transport = MockTransport::new();
        transport.push_inbound(&line_bytes(0x0C007FE0, 1, &[0x02]));
        let mut engine = engine_with_fallback_table(transport);
        let outcome = engine.read("1", Duration::from_millis(200), false).unwrap();
        assert_eq!(outcome.name, "ACCESS_LEVEL");
        assert_eq!(outcome.decoded, DecodedValue::Int(2));
    }

    #[test]
    fn read_ignores_frames_with_mismatched_id_before_the_real_reply() {
        let mut transport = MockTransport::new();
        transport.push_inbound(&line_bytes(0xDEADBEEF & 0x1FFFFFFF, 1, &[0xFF]));
        transport.push_inbound(&line_bytes(0x0C007FE0, 1, &[0x02]));
        let mut engine = engine_with_fallback_table(transport);
        let outcome = engine
            .read("ACCESS_LEVEL", Duration::from_millis(200), false)
            .unwrap();
        assert_eq!(outcome.decoded, DecodedValue::Int(2));
    }

    #[test]
    fn read_heals_degenerate_response_via_broadcast_fallback() {
        // RTR read of a tem parameter (OUTDOOR_TEMP, index 4) returns a
        // degenerate 1-byte reply; a broadcast on a different circuit
        // base but the same recovered idx carries the real value.
        let mut transport = MockTransport::new();
        transport.push_inbound(&line_bytes(0x0C003FE0 | (4 << 14), 1, &[0x05]));
        transport.push_inbound(&line_bytes(0x0060 | (4 << 14), 2, &[0x00, 0x69]));
        let mut engine = engine_with_fallback_table(transport);
        let outcome = engine
            .read("OUTDOOR_TEMP", Duration::from_millis(200), false)
            .unwrap();
        assert_eq!(outcome.source, ReadSource::Broadcast);
        match outcome.decoded {
            DecodedValue::Scaled { value, .. } => assert!((value - 10.5).abs() < 1e-9),
            other => panic!("expected scaled value, got {:?}", other),
        }
    }

    #[test]
    fn read_with_no_fallback_returns_degenerate_value_as_is() {
        let mut transport = MockTransport::new();
        transport.push_inbound(&line_bytes(0x0C003FE0 | (4 << 14), 1, &[0x05]));
        let mut engine = engine_with_fallback_table(transport);
        let outcome = engine
            .read("OUTDOOR_TEMP", Duration::from_millis(200), true)
            .unwrap();
        assert_eq!(outcome.source, ReadSource::Rtr);
        assert_eq!(outcome.raw, vec![0x05]);
    }

    #[test]
    fn write_rejects_read_only_parameter() {
        let transport = MockTransport::new();
        let mut engine = engine_with_fallback_table(transport);
        let err = engine
            .write("COMPRESSOR_RUNNING", EncodeInput::Number(1))
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
    }

    #[test]
    fn write_rejects_inconsistent_range_parameter() {
        let transport = MockTransport::new();
        let mut engine = engine_with_fallback_table(transport);
        let err = engine
            .write("RESERVED_INCONSISTENT_RANGE", EncodeInput::Number(1))
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentRange(_)));
    }

    #[test]
    fn write_sends_on_the_read_id_base() {
        let transport = MockTransport::new();
        let mut engine = engine_with_fallback_table(transport);
        engine.write("ACCESS_LEVEL", EncodeInput::Number(3)).unwrap();
        let sent = String::from_utf8(engine.link.transport_mut().sent.clone()).unwrap();
        assert!(sent.starts_with("T0400"), "expected read-id base, got {sent}");
    }
}
