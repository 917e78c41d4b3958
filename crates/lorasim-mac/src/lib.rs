//! # lorasim-mac
//!
//! LoRaWAN MAC layers for lorasim.
//!
//! This crate provides the simulation entities that own a radio:
//!
//! - [`EndDevice`] - class A end device with periodic or Poisson traffic,
//!   duty cycle, receive windows and confirmed-uplink retransmission
//! - [`Gateway`] - forwards uplinks to the network server and transmits
//!   downlinks on request
//! - [`Jammer`] - jamming attacker with fixed, random-SF, all-SF and
//!   reactive profiles
//! - [`LoraNode`] - the closed set of node kinds, as registered with the
//!   simulation

pub mod duty_cycle;
pub mod end_device;
pub mod gateway;
pub mod jammer;
pub mod node;

pub use duty_cycle::{DutyCycleTracker, SubBand, EU868_SUB_BANDS};
pub use end_device::{EndDevice, EndDeviceConfig, TrafficModel, UplinkRecord};
pub use gateway::{Gateway, GatewayConfig};
pub use jammer::{Jammer, JammerConfig, JammerProfile};
pub use node::LoraNode;

use lorasim_common::SimTime;
use lorasim_phy::airtime::sf_index;

/// Default uplink channels.
pub const EU868_DEFAULT_CHANNELS: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];

/// RX2 frequency.
pub const RX2_FREQUENCY_HZ: u32 = 869_525_000;

/// RX2 spreading factor.
pub const RX2_SPREADING_FACTOR: u8 = 12;

/// Delay from the end of an uplink to the opening of RX1.
pub const RECEIVE_DELAY_1: SimTime = SimTime::from_millis(1_000);

/// Delay from the end of an uplink to the opening of RX2.
pub const RECEIVE_DELAY_2: SimTime = SimTime::from_millis(2_000);

/// LoRaWAN header, MIC and FPort overhead added to the application payload.
pub const MAC_OVERHEAD_BYTES: usize = 13;

/// Size of an ACK frame on air.
pub const ACK_FRAME_BYTES: usize = MAC_OVERHEAD_BYTES;

/// Largest application payload per SF7..SF12.
pub const MAX_APP_PAYLOAD_BYTES: [usize; 6] = [230, 230, 123, 59, 59, 59];

/// Largest application payload at `spreading_factor`.
pub fn max_app_payload(spreading_factor: u8) -> usize {
    MAX_APP_PAYLOAD_BYTES[sf_index(spreading_factor)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_payload_by_sf() {
        assert_eq!(max_app_payload(7), 230);
        assert_eq!(max_app_payload(9), 123);
        assert_eq!(max_app_payload(12), 59);
    }
}
