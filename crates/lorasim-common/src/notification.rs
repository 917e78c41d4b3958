//! Typed notifications emitted by PHY, MAC and network-server entities.
//!
//! Entities push notifications into [`SimContext::notify`](crate::SimContext::notify);
//! the event loop drains them into statistics, traces and logs. Nothing in the
//! radio code knows how they are rendered.

use crate::{CollisionWindow, EnergyConsumption, EntityId, NodeRole, PhyState, SimTime};
use serde::Serialize;

/// Why a PHY or MAC refused to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRefusal {
    /// The device battery is exhausted.
    Dead,
    /// The radio is busy transmitting or receiving.
    Busy {
        /// State at the time of the request.
        state: PhyState,
    },
    /// Application payload exceeds the data-rate limit.
    PayloadTooLarge {
        /// Requested size in bytes.
        size: usize,
        /// Maximum for the data rate.
        max: usize,
    },
    /// A class A receive window is still pending.
    ReceiveWindowPending,
}

impl SendRefusal {
    /// Short label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SendRefusal::Dead => "dead",
            SendRefusal::Busy { .. } => "busy",
            SendRefusal::PayloadTooLarge { .. } => "payload_too_large",
            SendRefusal::ReceiveWindowPending => "receive_window_pending",
        }
    }
}

/// Why a confirmed uplink was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkFailure {
    /// All transmissions were spent without an acknowledgment.
    Exhausted,
    /// A newer application packet replaced it.
    Superseded,
}

impl UplinkFailure {
    /// Short label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            UplinkFailure::Exhausted => "exhausted",
            UplinkFailure::Superseded => "superseded",
        }
    }
}

/// A notification with the simulated time at which it was emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRecord {
    /// Emission time.
    pub time: SimTime,
    /// The notification.
    #[serde(flatten)]
    pub notification: Notification,
}

/// Everything observable that happens in a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    // =========== PHY: transmit side ===========
    /// A radio started a transmission.
    StartSending {
        node: EntityId,
        role: NodeRole,
        packet_id: u64,
        spreading_factor: u8,
        frequency_hz: u32,
        tx_power_dbm: f64,
        duration: SimTime,
        tx_attempt: u8,
    },
    /// A transmission request was refused.
    CannotSend {
        node: EntityId,
        packet_id: u64,
        reason: SendRefusal,
    },

    // =========== PHY: receive side ===========
    /// A gateway demodulator locked onto a signal.
    ReceptionStarted {
        receiver: EntityId,
        sender: EntityId,
        packet_id: u64,
        spreading_factor: u8,
        frequency_hz: u32,
        duration: SimTime,
    },
    /// A frame was demodulated correctly.
    ReceivedPacket {
        receiver: EntityId,
        role: NodeRole,
        sender: EntityId,
        packet_id: u64,
        spreading_factor: u8,
        frequency_hz: u32,
        rx_power_dbm: f64,
        sinr_db: f64,
    },
    /// A locked frame was destroyed by interference.
    LostBecauseInterference {
        receiver: EntityId,
        role: NodeRole,
        sender: EntityId,
        packet_id: u64,
        spreading_factor: u8,
        colliding_sf: Option<u8>,
        frequency_hz: u32,
        collision: Option<CollisionWindow>,
        on_preamble: bool,
    },
    /// Every gateway demodulator on the frequency was busy.
    LostBecauseNoMoreReceivers {
        gateway: EntityId,
        sender: EntityId,
        packet_id: u64,
        spreading_factor: u8,
        frequency_hz: u32,
    },
    /// Received power below the per-SF sensitivity.
    LostBecauseUnderSensitivity {
        receiver: EntityId,
        role: NodeRole,
        sender: EntityId,
        packet_id: u64,
        spreading_factor: u8,
        rx_power_dbm: f64,
        sensitivity_dbm: f64,
    },
    /// Signal on a frequency the receiver is not tuned to.
    LostBecauseWrongFrequency {
        receiver: EntityId,
        sender: EntityId,
        packet_id: u64,
        expected_hz: u32,
        actual_hz: u32,
    },
    /// Signal with a spreading factor the receiver is not listening for.
    LostBecauseWrongSpreadingFactor {
        receiver: EntityId,
        sender: EntityId,
        packet_id: u64,
        expected_sf: u8,
        actual_sf: u8,
    },
    /// The receiver was not in standby.
    LostBecauseState {
        receiver: EntityId,
        sender: EntityId,
        packet_id: u64,
        state: PhyState,
    },
    /// The gateway was transmitting a downlink.
    LostBecauseTransmitting {
        gateway: EntityId,
        sender: EntityId,
        packet_id: u64,
    },
    /// A destroyed verdict was reversed by the capture effect.
    CaptureEffect {
        receiver: EntityId,
        sender: EntityId,
        packet_id: u64,
        spreading_factor: u8,
    },
    /// Battery exhausted. Emitted once per device.
    DeadDevice {
        node: EntityId,
        consumption: EnergyConsumption,
    },

    // =========== MAC ===========
    /// A confirmed uplink was acknowledged.
    UplinkAcked {
        node: EntityId,
        packet_id: u64,
        attempts: u8,
    },
    /// A confirmed uplink was abandoned.
    UplinkFailed {
        node: EntityId,
        packet_id: u64,
        attempts: u8,
        reason: UplinkFailure,
    },
    /// A confirmed uplink is being transmitted again.
    Retransmission {
        node: EntityId,
        packet_id: u64,
        attempt: u8,
    },
    /// A jammer sensed a legitimate signal and scheduled a burst.
    JammerTriggered {
        jammer: EntityId,
        target: EntityId,
        packet_id: u64,
        spreading_factor: u8,
        frequency_hz: u32,
    },

    // =========== Network server ===========
    /// First reception of a packet id from a device.
    UplinkReceived {
        device: EntityId,
        packet_id: u64,
        tx_attempt: u8,
        gateway: EntityId,
    },
    /// Another gateway or a retransmission delivered an already known packet.
    DuplicateUplink {
        device: EntityId,
        packet_id: u64,
        tx_attempt: u8,
        gateway: EntityId,
        retransmission: bool,
    },
    /// An ACK was handed to a gateway.
    DownlinkScheduled {
        gateway: EntityId,
        device: EntityId,
        packet_id: u64,
        window: u8,
        send_at: SimTime,
    },
    /// No gateway could serve either receive window.
    DownlinkDropped {
        device: EntityId,
        packet_id: u64,
    },
    /// Inter-arrival time outside the EWMA band.
    InterArrivalAnomaly {
        device: EntityId,
        interval_s: f64,
        expected_s: f64,
        deviation_s: f64,
    },
}

impl Notification {
    /// Short name, matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::StartSending { .. } => "start_sending",
            Notification::CannotSend { .. } => "cannot_send",
            Notification::ReceptionStarted { .. } => "reception_started",
            Notification::ReceivedPacket { .. } => "received_packet",
            Notification::LostBecauseInterference { .. } => "lost_because_interference",
            Notification::LostBecauseNoMoreReceivers { .. } => "lost_because_no_more_receivers",
            Notification::LostBecauseUnderSensitivity { .. } => "lost_because_under_sensitivity",
            Notification::LostBecauseWrongFrequency { .. } => "lost_because_wrong_frequency",
            Notification::LostBecauseWrongSpreadingFactor { .. } => "lost_because_wrong_spreading_factor",
            Notification::LostBecauseState { .. } => "lost_because_state",
            Notification::LostBecauseTransmitting { .. } => "lost_because_transmitting",
            Notification::CaptureEffect { .. } => "capture_effect",
            Notification::DeadDevice { .. } => "dead_device",
            Notification::UplinkAcked { .. } => "uplink_acked",
            Notification::UplinkFailed { .. } => "uplink_failed",
            Notification::Retransmission { .. } => "retransmission",
            Notification::JammerTriggered { .. } => "jammer_triggered",
            Notification::UplinkReceived { .. } => "uplink_received",
            Notification::DuplicateUplink { .. } => "duplicate_uplink",
            Notification::DownlinkScheduled { .. } => "downlink_scheduled",
            Notification::DownlinkDropped { .. } => "downlink_dropped",
            Notification::InterArrivalAnomaly { .. } => "inter_arrival_anomaly",
        }
    }

    /// The node the notification is about.
    pub fn subject(&self) -> EntityId {
        match *self {
            Notification::StartSending { node, .. }
            | Notification::CannotSend { node, .. }
            | Notification::DeadDevice { node, .. }
            | Notification::UplinkAcked { node, .. }
            | Notification::UplinkFailed { node, .. }
            | Notification::Retransmission { node, .. } => node,
            Notification::ReceptionStarted { receiver, .. }
            | Notification::ReceivedPacket { receiver, .. }
            | Notification::LostBecauseInterference { receiver, .. }
            | Notification::LostBecauseUnderSensitivity { receiver, .. }
            | Notification::LostBecauseWrongFrequency { receiver, .. }
            | Notification::LostBecauseWrongSpreadingFactor { receiver, .. }
            | Notification::LostBecauseState { receiver, .. }
            | Notification::CaptureEffect { receiver, .. } => receiver,
            Notification::LostBecauseNoMoreReceivers { gateway, .. }
            | Notification::LostBecauseTransmitting { gateway, .. }
            | Notification::DownlinkScheduled { gateway, .. } => gateway,
            Notification::JammerTriggered { jammer, .. } => jammer,
            Notification::UplinkReceived { device, .. }
            | Notification::DuplicateUplink { device, .. }
            | Notification::DownlinkDropped { device, .. }
            | Notification::InterArrivalAnomaly { device, .. } => device,
        }
    }

    /// Reason label when the notification reports a lost frame.
    pub fn loss_reason(&self) -> Option<&'static str> {
        match self {
            Notification::LostBecauseInterference { .. } => Some("interference"),
            Notification::LostBecauseNoMoreReceivers { .. } => Some("no_more_receivers"),
            Notification::LostBecauseUnderSensitivity { .. } => Some("under_sensitivity"),
            Notification::LostBecauseWrongFrequency { .. } => Some("wrong_frequency"),
            Notification::LostBecauseWrongSpreadingFactor { .. } => Some("wrong_spreading_factor"),
            Notification::LostBecauseState { .. } => Some("state"),
            Notification::LostBecauseTransmitting { .. } => Some("transmitting"),
            _ => None,
        }
    }
}
