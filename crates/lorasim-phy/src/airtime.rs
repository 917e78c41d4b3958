//! LoRa modem timing and sensitivity tables.
//!
//! Timing follows the SX1272 datasheet model. All arithmetic is plain `f64`;
//! conversion to [`SimTime`] rounds to the nearest nanosecond.

use lorasim_common::SimTime;
use serde::{Deserialize, Serialize};

/// Lowest supported spreading factor.
pub const MIN_SF: u8 = 7;
/// Highest supported spreading factor.
pub const MAX_SF: u8 = 12;

/// End-device sensitivity in dBm for SF7..SF12.
pub const END_DEVICE_SENSITIVITY_DBM: [f64; 6] = [-124.0, -127.0, -130.0, -133.0, -135.0, -137.0];

/// Gateway sensitivity in dBm for SF7..SF12.
pub const GATEWAY_SENSITIVITY_DBM: [f64; 6] = [-130.0, -132.5, -135.0, -137.5, -140.0, -142.5];

/// Index into per-SF tables. Panics outside 7..=12.
pub fn sf_index(spreading_factor: u8) -> usize {
    assert!(
        (MIN_SF..=MAX_SF).contains(&spreading_factor),
        "spreading factor {} outside {}..={}",
        spreading_factor,
        MIN_SF,
        MAX_SF
    );
    (spreading_factor - MIN_SF) as usize
}

/// Transmission parameters of a LoRa frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraTxParams {
    /// Spreading factor (7..=12).
    pub spreading_factor: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Coding rate 1..=4, meaning 4/5..4/8.
    pub coding_rate: u8,
    /// Programmed preamble symbols.
    pub preamble_symbols: u32,
    /// Implicit header mode.
    pub header_disabled: bool,
    /// Payload CRC present.
    pub crc_enabled: bool,
    /// Low data rate optimization. `None` enables it when a symbol lasts
    /// longer than 16 ms.
    pub low_data_rate_optimize: Option<bool>,
}

impl Default for LoraTxParams {
    fn default() -> Self {
        LoraTxParams {
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coding_rate: 1,
            preamble_symbols: 8,
            header_disabled: false,
            crc_enabled: true,
            low_data_rate_optimize: None,
        }
    }
}

impl LoraTxParams {
    /// Default parameters at the given spreading factor.
    pub fn with_sf(spreading_factor: u8) -> Self {
        LoraTxParams {
            spreading_factor,
            ..Default::default()
        }
    }

    /// Whether low data rate optimization is in effect.
    pub fn ldro_enabled(&self) -> bool {
        self.low_data_rate_optimize
            .unwrap_or_else(|| self.symbol_duration_s() > 0.016)
    }

    /// `2^SF / BW` in seconds.
    pub fn symbol_duration_s(&self) -> f64 {
        2f64.powi(self.spreading_factor as i32) / self.bandwidth_hz as f64
    }

    /// `(N + 4.25)` symbols in seconds.
    pub fn preamble_duration_s(&self) -> f64 {
        (self.preamble_symbols as f64 + 4.25) * self.symbol_duration_s()
    }

    /// Number of payload symbols for `payload_bytes` bytes of PHY payload.
    pub fn payload_symbol_count(&self, payload_bytes: usize) -> f64 {
        let pl = payload_bytes as f64;
        let sf = self.spreading_factor as f64;
        let h = if self.header_disabled { 1.0 } else { 0.0 };
        let c = if self.crc_enabled { 1.0 } else { 0.0 };
        let de = if self.ldro_enabled() { 1.0 } else { 0.0 };
        let cr = self.coding_rate as f64;

        let numerator = 8.0 * pl - 4.0 * sf + 28.0 + 16.0 * c - 20.0 * h;
        let denominator = 4.0 * (sf - 2.0 * de);
        8.0 + ((numerator / denominator).ceil() * (cr + 4.0)).max(0.0)
    }

    /// Time on air in seconds.
    pub fn on_air_time_s(&self, payload_bytes: usize) -> f64 {
        self.preamble_duration_s() + self.payload_symbol_count(payload_bytes) * self.symbol_duration_s()
    }

    /// Time on air.
    pub fn on_air_time(&self, payload_bytes: usize) -> SimTime {
        SimTime::from_secs(self.on_air_time_s(payload_bytes))
    }
}

/// Duration of a receive window in seconds.
///
/// Window 1 listens for a preamble (12 symbols up to SF10, 8 for SF11/12);
/// window 2 is a channel activity detection, `(2^SF + 32) / BW`.
pub fn receive_window_duration_s(spreading_factor: u8, bandwidth_hz: u32, window: u8) -> f64 {
    let params = LoraTxParams {
        spreading_factor,
        bandwidth_hz,
        ..Default::default()
    };
    match window {
        1 => {
            let symbols = if spreading_factor <= 10 { 12.0 } else { 8.0 };
            symbols * params.symbol_duration_s()
        }
        2 => (2f64.powi(spreading_factor as i32) + 32.0) / bandwidth_hz as f64,
        other => panic!("receive window {} does not exist", other),
    }
}

/// [`receive_window_duration_s`] as [`SimTime`].
pub fn receive_window_duration(spreading_factor: u8, bandwidth_hz: u32, window: u8) -> SimTime {
    SimTime::from_secs(receive_window_duration_s(spreading_factor, bandwidth_hz, window))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_and_preamble_durations() {
        let p = LoraTxParams::with_sf(7);
        assert_eq!(p.symbol_duration_s(), 128.0 / 125_000.0);
        assert_eq!(p.preamble_duration_s(), 12.25 * (128.0 / 125_000.0));
        assert!((p.preamble_duration_s() - 0.012544).abs() < 1e-15);
    }

    #[test]
    fn test_payload_symbols_known_values() {
        assert_eq!(LoraTxParams::with_sf(7).payload_symbol_count(41), 73.0);
        assert_eq!(LoraTxParams::with_sf(9).payload_symbol_count(23), 38.0);
        // SF12 at 125 kHz turns low data rate optimization on.
        assert!(LoraTxParams::with_sf(12).ldro_enabled());
        assert!(!LoraTxParams::with_sf(10).ldro_enabled());
        assert_eq!(LoraTxParams::with_sf(12).payload_symbol_count(41), 53.0);
        // Empty payload hits the floor of 8 + one block.
        assert_eq!(LoraTxParams::with_sf(7).payload_symbol_count(0), 13.0);
    }

    #[test]
    fn test_on_air_time() {
        let toa = LoraTxParams::with_sf(7).on_air_time_s(41);
        assert!((toa - 0.087296).abs() < 1e-12);
        assert_eq!(LoraTxParams::with_sf(7).on_air_time(41), SimTime::from_micros(87_296));

        let toa12 = LoraTxParams::with_sf(12).on_air_time_s(41);
        assert!((toa12 - 2.138112).abs() < 1e-12);
    }

    #[test]
    fn test_payload_symbols_never_below_eight() {
        let p = LoraTxParams {
            header_disabled: true,
            crc_enabled: false,
            ..LoraTxParams::with_sf(12)
        };
        assert_eq!(p.payload_symbol_count(0), 8.0);
    }

    #[test]
    fn test_receive_window_durations() {
        let w1_sf7 = receive_window_duration_s(7, 125_000, 1);
        assert_eq!(w1_sf7, 12.0 * (128.0 / 125_000.0));
        let w1_sf12 = receive_window_duration_s(12, 125_000, 1);
        assert_eq!(w1_sf12, 8.0 * (4096.0 / 125_000.0));
        let cad = receive_window_duration_s(7, 125_000, 2);
        assert_eq!(cad, 160.0 / 125_000.0);
    }

    #[test]
    #[should_panic]
    fn test_sf_index_rejects_out_of_range() {
        sf_index(6);
    }
}
