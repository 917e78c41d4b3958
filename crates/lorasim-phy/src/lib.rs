//! # lorasim-phy
//!
//! LoRa physical layer for lorasim.
//!
//! This crate provides:
//! - Modem timing and sensitivity tables ([`airtime`])
//! - The per-receiver interference ledger ([`interference`])
//! - Collision resolution policies ([`resolver`])
//! - Battery bookkeeping ([`energy`])
//! - Radio state machines for end devices, gateways and jammers
//! - The propagation channel entity ([`channel::LoraChannel`])
//!
//! Radios are not entities on their own: the node entities in `lorasim-mac`
//! own a radio and forward the radio's events and timers to it.

pub mod airtime;
pub mod channel;
pub mod end_device;
pub mod energy;
pub mod gateway;
pub mod interference;
pub mod jammer;
pub mod resolver;

pub use airtime::{receive_window_duration, LoraTxParams, END_DEVICE_SENSITIVITY_DBM, GATEWAY_SENSITIVITY_DBM};
pub use channel::{LinkOverrides, LoraChannel, PathLossModel};
pub use end_device::{EndDevicePhy, EndDevicePhyConfig};
pub use energy::{EnergyAccount, EnergyRates};
pub use gateway::{GatewayPhy, GatewayPhyConfig, ReceptionPath};
pub use interference::{overlap, overlap_window, InterferenceLedger, SignalEvent, SignalId};
pub use jammer::{JamTrigger, JammerPhy, ReactiveWatch};
pub use resolver::{InterferenceModel, InterferenceResolver, ResolutionOutcome, COLLISION_SNIR_DB};

use lorasim_common::{LoraFrame, PacketTag, SimTime};

// ============================================================================
// Timers
// ============================================================================

/// Radio returns from TX to standby.
pub const TIMER_TX_DONE: u64 = 1;

/// Transmission finished, for the MAC. Fires [`TX_FINISHED_DELAY`] after
/// [`TIMER_TX_DONE`] so that the radio is already in standby.
pub const TIMER_TX_FINISHED: u64 = 2;

/// MAC layers allocate their timer ids from here up to [`TIMER_RX_END_BASE`].
pub const TIMER_MAC_BASE: u64 = 0x100;

/// End of a reception; the ledger signal id is added to this.
pub const TIMER_RX_END_BASE: u64 = 0x1000;

/// Gap between the radio going idle and the MAC being told.
pub const TX_FINISHED_DELAY: SimTime = SimTime::from_nanos(10);

/// Radio-owned timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyTimer {
    /// [`TIMER_TX_DONE`].
    TxDone,
    /// End of reception of a signal.
    RxEnd(SignalId),
}

impl PhyTimer {
    /// Timer id for this timer.
    pub fn id(&self) -> u64 {
        match self {
            PhyTimer::TxDone => TIMER_TX_DONE,
            PhyTimer::RxEnd(signal) => TIMER_RX_END_BASE + signal.0,
        }
    }

    /// Decode a timer id, `None` for timers the radio does not own.
    pub fn decode(timer_id: u64) -> Option<PhyTimer> {
        if timer_id == TIMER_TX_DONE {
            Some(PhyTimer::TxDone)
        } else if timer_id >= TIMER_RX_END_BASE {
            Some(PhyTimer::RxEnd(SignalId(timer_id - TIMER_RX_END_BASE)))
        } else {
            None
        }
    }
}

/// A frame that survived reception, handed from radio to MAC.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// The frame.
    pub frame: LoraFrame,
    /// On-air tag.
    pub tag: PacketTag,
    /// Power at the receiver.
    pub rx_power_dbm: f64,
    /// SINR diagnostic.
    pub sinr_db: f64,
    /// When the frame ended on air.
    pub end: SimTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phy_timer_round_trip() {
        for timer in [PhyTimer::TxDone, PhyTimer::RxEnd(SignalId(0)), PhyTimer::RxEnd(SignalId(77))] {
            assert_eq!(PhyTimer::decode(timer.id()), Some(timer));
        }
        assert_eq!(PhyTimer::decode(TIMER_TX_FINISHED), None);
        assert_eq!(PhyTimer::decode(TIMER_MAC_BASE + 3), None);
    }
}
