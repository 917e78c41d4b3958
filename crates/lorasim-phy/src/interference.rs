//! Per-receiver interference ledger.
//!
//! Every signal a radio hears is recorded here, whether or not the radio
//! ends up demodulating it. Entries outlive their reception so that later
//! signals can still be checked against them.

use lorasim_common::{CollisionWindow, PacketTag, SimTime};

/// Entries are kept at least this long after they end.
pub const EVICTION_HORIZON: SimTime = SimTime::from_millis(2_000);

/// Ledger size above which `add` triggers an eviction pass.
pub const DEFAULT_WATERMARK: usize = 1100;

/// Identifier of a signal within one ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalId(pub u64);

/// One transmission as seen by one receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalEvent {
    /// Ledger-local identifier.
    pub id: SignalId,
    /// First instant the energy arrives.
    pub start: SimTime,
    /// `start + duration`.
    pub end: SimTime,
    /// Spreading factor of the transmission.
    pub spreading_factor: u8,
    /// Power at this receiver.
    pub rx_power_dbm: f64,
    /// Carrier frequency.
    pub frequency_hz: u32,
    /// On-air tag of the transmission.
    pub tag: PacketTag,
}

impl SignalEvent {
    /// Time on air.
    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }

    /// End of the preamble according to the tag.
    pub fn preamble_end(&self) -> SimTime {
        self.start + SimTime::from_secs(self.tag.preamble_s)
    }

    /// Received power in watts.
    pub fn power_w(&self) -> f64 {
        dbm_to_watts(self.rx_power_dbm)
    }

    /// Energy in joules delivered during `seconds` of this signal.
    pub fn energy_j(&self, seconds: f64) -> f64 {
        seconds * self.power_w()
    }
}

/// `10^(dBm/10) / 1000`.
pub fn dbm_to_watts(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0) / 1000.0
}

/// Length of the intersection of two signals. Zero when they are disjoint
/// or only touch.
pub fn overlap(a: &SignalEvent, b: &SignalEvent) -> SimTime {
    overlap_window(a, b).map_or(SimTime::ZERO, |w| w.end - w.start)
}

/// Intersection interval of two signals, if it has positive length.
pub fn overlap_window(a: &SignalEvent, b: &SignalEvent) -> Option<CollisionWindow> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    (start < end).then_some(CollisionWindow { start, end })
}

/// Signals heard by one radio.
#[derive(Debug, Clone)]
pub struct InterferenceLedger {
    events: Vec<SignalEvent>,
    next_id: u64,
    watermark: usize,
}

impl InterferenceLedger {
    /// Create an empty ledger with the default watermark.
    pub fn new() -> Self {
        Self::with_watermark(DEFAULT_WATERMARK)
    }

    /// Create an empty ledger that evicts once it holds more than `watermark` entries.
    pub fn with_watermark(watermark: usize) -> Self {
        InterferenceLedger {
            events: Vec::new(),
            next_id: 0,
            watermark,
        }
    }

    /// Record a signal starting at `now`.
    pub fn add(
        &mut self,
        now: SimTime,
        duration: SimTime,
        rx_power_dbm: f64,
        spreading_factor: u8,
        tag: PacketTag,
        frequency_hz: u32,
    ) -> SignalEvent {
        assert!(duration > SimTime::ZERO, "signal with zero duration");
        let event = SignalEvent {
            id: SignalId(self.next_id),
            start: now,
            end: now + duration,
            spreading_factor,
            rx_power_dbm,
            frequency_hz,
            tag,
        };
        self.next_id += 1;
        self.events.push(event);
        if self.events.len() > self.watermark {
            self.evict(now);
        }
        event
    }

    /// Drop every signal with `end + 2 s < now`.
    pub fn evict(&mut self, now: SimTime) {
        self.events.retain(|e| e.end + EVICTION_HORIZON >= now);
    }

    /// Other signals on the same frequency as `focal`.
    pub fn same_channel<'a>(&'a self, focal: &'a SignalEvent) -> impl Iterator<Item = &'a SignalEvent> + 'a {
        self.events
            .iter()
            .filter(move |e| e.id != focal.id && e.frequency_hz == focal.frequency_hz)
    }

    /// Look up a signal.
    pub fn get(&self, id: SignalId) -> Option<&SignalEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Whether a signal is still recorded.
    pub fn contains(&self, id: SignalId) -> bool {
        self.get(id).is_some()
    }

    /// All recorded signals in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &SignalEvent> {
        self.events.iter()
    }

    /// Number of recorded signals.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for InterferenceLedger {
    fn default() -> Self {
        Self::new()
    }
}
