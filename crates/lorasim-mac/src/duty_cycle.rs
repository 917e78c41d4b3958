//! EU868 sub-band duty cycle.

use lorasim_common::SimTime;

/// A regulatory sub-band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubBand {
    /// Lowest frequency, inclusive.
    pub low_hz: u32,
    /// Highest frequency, inclusive.
    pub high_hz: u32,
    /// Allowed fraction of airtime.
    pub duty_cycle: f64,
}

impl SubBand {
    /// Whether `frequency_hz` lies in this sub-band.
    pub fn contains(&self, frequency_hz: u32) -> bool {
        (self.low_hz..=self.high_hz).contains(&frequency_hz)
    }
}

/// Sub-bands of the EU863-870 plan used by the default channels and RX2.
pub const EU868_SUB_BANDS: [SubBand; 3] = [
    SubBand {
        low_hz: 868_000_000,
        high_hz: 868_600_000,
        duty_cycle: 0.01,
    },
    SubBand {
        low_hz: 868_700_000,
        high_hz: 869_200_000,
        duty_cycle: 0.001,
    },
    SubBand {
        low_hz: 869_400_000,
        high_hz: 869_650_000,
        duty_cycle: 0.1,
    },
];

/// Per sub-band off-time after each transmission.
#[derive(Debug, Clone)]
pub struct DutyCycleTracker {
    bands: Vec<(SubBand, SimTime)>,
    enabled: bool,
}

impl DutyCycleTracker {
    /// EU868 tracker. A disabled tracker never blocks.
    pub fn eu868(enabled: bool) -> Self {
        DutyCycleTracker {
            bands: EU868_SUB_BANDS.iter().map(|&b| (b, SimTime::ZERO)).collect(),
            enabled,
        }
    }

    /// Whether the tracker enforces anything.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Earliest time a transmission may start on `frequency_hz`.
    /// Frequencies outside every sub-band are never blocked.
    pub fn available_at(&self, frequency_hz: u32) -> SimTime {
        if !self.enabled {
            return SimTime::ZERO;
        }
        self.bands
            .iter()
            .find(|(band, _)| band.contains(frequency_hz))
            .map_or(SimTime::ZERO, |&(_, until)| until)
    }

    /// Earliest availability over `channels`, with the channel it applies to.
    pub fn earliest(&self, channels: &[u32]) -> Option<(u32, SimTime)> {
        channels
            .iter()
            .map(|&f| (f, self.available_at(f)))
            .min_by_key(|&(_, at)| at)
    }

    /// Record a transmission of `airtime` starting at `start`.
    pub fn record(&mut self, frequency_hz: u32, start: SimTime, airtime: SimTime) {
        if !self.enabled {
            return;
        }
        if let Some((band, until)) = self.bands.iter_mut().find(|(band, _)| band.contains(frequency_hz)) {
            let off = SimTime::from_secs(airtime.as_secs_f64() / band.duty_cycle);
            *until = (*until).max(start + off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_percent_band_blocks_for_hundred_airtimes() {
        let mut dc = DutyCycleTracker::eu868(true);
        dc.record(868_100_000, SimTime::from_secs(10.0), SimTime::from_millis(50));
        assert_eq!(dc.available_at(868_300_000), SimTime::from_secs(15.0));
        // Other sub-bands are unaffected.
        assert_eq!(dc.available_at(869_525_000), SimTime::ZERO);
    }

    #[test]
    fn test_earliest_picks_least_blocked_channel() {
        let mut dc = DutyCycleTracker::eu868(true);
        dc.record(868_100_000, SimTime::ZERO, SimTime::from_millis(100));
        dc.record(869_525_000, SimTime::ZERO, SimTime::from_millis(100));
        assert_eq!(
            dc.earliest(&[868_100_000, 869_525_000]),
            Some((869_525_000, SimTime::from_secs(1.0)))
        );
        assert_eq!(dc.earliest(&[]), None);
    }

    #[test]
    fn test_disabled_tracker_never_blocks() {
        let mut dc = DutyCycleTracker::eu868(false);
        dc.record(868_100_000, SimTime::ZERO, SimTime::from_secs(1.0));
        assert_eq!(dc.available_at(868_100_000), SimTime::ZERO);
    }
}
