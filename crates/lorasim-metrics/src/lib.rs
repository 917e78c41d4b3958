//! # lorasim-metrics
//!
//! Metric names, kinds and per-node labels shared by every lorasim crate.
//!
//! Emitters use the re-exported [`metrics`] facade:
//!
//! ```ignore
//! use lorasim_metrics::{metric_defs, metrics, MetricLabels};
//! let labels = MetricLabels::new("ed-0", "end_device").to_labels();
//! metrics::counter!(metric_defs::PHY_TX_PACKETS.name, &labels).increment(1);
//! ```

pub use metrics;

use std::fmt;

/// Kind of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Value that can go up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Unit of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Plain count.
    Count,
    /// Microseconds of simulated time.
    Microseconds,
    /// Seconds of simulated time.
    Seconds,
    /// Bytes.
    Bytes,
    /// Power in dBm.
    Dbm,
    /// Ratio in dB.
    Db,
    /// Energy in joules.
    Joules,
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Dotted metric name.
    pub name: &'static str,
    /// Counter, gauge or histogram.
    pub kind: MetricKind,
    /// Unit of recorded values.
    pub unit: MetricUnit,
    /// Human-readable description.
    pub description: &'static str,
    /// Labels added on top of `node` and `node_type`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit suffix for display, empty for plain counts.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::Count => "",
            MetricUnit::Microseconds => "us",
            MetricUnit::Seconds => "s",
            MetricUnit::Bytes => "bytes",
            MetricUnit::Dbm => "dBm",
            MetricUnit::Db => "dB",
            MetricUnit::Joules => "J",
        }
    }
}

/// Labels attached to every metric emitted by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node name from the scenario.
    pub node: String,
    /// Node type (`end_device`, `gateway`, `jammer`, `network_server`).
    pub node_type: String,
}

impl MetricLabels {
    /// Create labels for a node.
    pub fn new(node: impl Into<String>, node_type: &str) -> Self {
        MetricLabels {
            node: node.into(),
            node_type: node_type.to_string(),
        }
    }

    /// Convert to the label list taken by the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone()), ("node_type", self.node_type.clone())]
    }
}

/// Register units and descriptions of every metric with the installed
/// recorder.
pub fn describe_metrics() {
    use metrics::Unit;
    for def in metric_defs::ALL {
        let unit = match def.unit {
            MetricUnit::Count => Some(Unit::Count),
            MetricUnit::Microseconds => Some(Unit::Microseconds),
            MetricUnit::Seconds => Some(Unit::Seconds),
            MetricUnit::Bytes => Some(Unit::Bytes),
            MetricUnit::Dbm | MetricUnit::Db | MetricUnit::Joules => None,
        };
        match (def.kind, unit) {
            (MetricKind::Counter, Some(unit)) => metrics::describe_counter!(def.name, unit, def.description),
            (MetricKind::Counter, None) => metrics::describe_counter!(def.name, def.description),
            (MetricKind::Gauge, Some(unit)) => metrics::describe_gauge!(def.name, unit, def.description),
            (MetricKind::Gauge, None) => metrics::describe_gauge!(def.name, def.description),
            (MetricKind::Histogram, Some(unit)) => metrics::describe_histogram!(def.name, unit, def.description),
            (MetricKind::Histogram, None) => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

/// All metric definitions.
pub mod metric_defs {
    use super::{MetricDef, MetricKind, MetricUnit};

    // ========== PHY ==========

    pub const PHY_TX_PACKETS: MetricDef = MetricDef {
        name: "lorasim.phy.tx_packets",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Transmissions started",
        labels: &["sf"],
    };

    pub const PHY_TX_AIRTIME: MetricDef = MetricDef {
        name: "lorasim.phy.tx_airtime",
        kind: MetricKind::Counter,
        unit: MetricUnit::Microseconds,
        description: "Cumulative time on air",
        labels: &["sf"],
    };

    pub const PHY_TX_PACKET_SIZE: MetricDef = MetricDef {
        name: "lorasim.phy.tx_packet_size",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Bytes,
        description: "PHY payload size of transmitted frames",
        labels: &[],
    };

    pub const PHY_CANNOT_SEND: MetricDef = MetricDef {
        name: "lorasim.phy.cannot_send",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Transmission requests refused by the radio",
        labels: &["reason"],
    };

    pub const PHY_RX_PACKETS: MetricDef = MetricDef {
        name: "lorasim.phy.rx_packets",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Frames demodulated correctly",
        labels: &["sf"],
    };

    pub const PHY_RX_INTERFERED: MetricDef = MetricDef {
        name: "lorasim.phy.rx_interfered",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Locked frames destroyed by interference",
        labels: &["sf"],
    };

    pub const PHY_RX_UNDER_SENSITIVITY: MetricDef = MetricDef {
        name: "lorasim.phy.rx_under_sensitivity",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Signals below the per-SF sensitivity",
        labels: &[],
    };

    pub const PHY_RX_WRONG_FREQUENCY: MetricDef = MetricDef {
        name: "lorasim.phy.rx_wrong_frequency",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Signals on a frequency the receiver was not tuned to",
        labels: &[],
    };

    pub const PHY_RX_WRONG_SF: MetricDef = MetricDef {
        name: "lorasim.phy.rx_wrong_sf",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Signals with a spreading factor the receiver was not listening for",
        labels: &[],
    };

    pub const PHY_RX_WRONG_STATE: MetricDef = MetricDef {
        name: "lorasim.phy.rx_wrong_state",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Signals missed because the radio was not in standby",
        labels: &["state"],
    };

    pub const PHY_RX_SINR: MetricDef = MetricDef {
        name: "lorasim.phy.rx_sinr",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Db,
        description: "SINR of correctly received frames",
        labels: &[],
    };

    pub const PHY_RX_RSSI: MetricDef = MetricDef {
        name: "lorasim.phy.rx_rssi",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Dbm,
        description: "Received power of correctly received frames",
        labels: &[],
    };

    pub const PHY_CAPTURE_EFFECT: MetricDef = MetricDef {
        name: "lorasim.phy.capture_effect",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Destroyed verdicts reversed by the capture effect",
        labels: &[],
    };

    // ========== Gateway ==========

    pub const GATEWAY_NO_MORE_RECEIVERS: MetricDef = MetricDef {
        name: "lorasim.gateway.no_more_receivers",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Signals dropped because every demodulator was busy",
        labels: &[],
    };

    pub const GATEWAY_LOST_TRANSMITTING: MetricDef = MetricDef {
        name: "lorasim.gateway.lost_transmitting",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Uplinks missed while the gateway was transmitting",
        labels: &[],
    };

    pub const GATEWAY_ACTIVE_RECEPTIONS: MetricDef = MetricDef {
        name: "lorasim.gateway.active_receptions",
        kind: MetricKind::Gauge,
        unit: MetricUnit::Count,
        description: "Demodulators currently locked",
        labels: &[],
    };

    pub const GATEWAY_FORWARDED: MetricDef = MetricDef {
        name: "lorasim.gateway.forwarded",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Uplinks forwarded to the network server",
        labels: &[],
    };

    // ========== Energy ==========

    pub const ENERGY_CONSUMED: MetricDef = MetricDef {
        name: "lorasim.energy.consumed",
        kind: MetricKind::Gauge,
        unit: MetricUnit::Joules,
        description: "Cumulative energy consumed per radio state",
        labels: &["state"],
    };

    pub const ENERGY_DEAD_DEVICES: MetricDef = MetricDef {
        name: "lorasim.energy.dead_devices",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Devices whose battery was exhausted",
        labels: &[],
    };

    pub const ENERGY_REMAINING: MetricDef = MetricDef {
        name: "lorasim.energy.remaining",
        kind: MetricKind::Gauge,
        unit: MetricUnit::Joules,
        description: "Remaining battery energy",
        labels: &[],
    };

    // ========== MAC ==========

    pub const MAC_UPLINKS_GENERATED: MetricDef = MetricDef {
        name: "lorasim.mac.uplinks_generated",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Application packets generated",
        labels: &[],
    };

    pub const MAC_RETRANSMISSIONS: MetricDef = MetricDef {
        name: "lorasim.mac.retransmissions",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Confirmed uplinks sent again after an ACK timeout",
        labels: &[],
    };

    pub const MAC_UPLINKS_ACKED: MetricDef = MetricDef {
        name: "lorasim.mac.uplinks_acked",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Confirmed uplinks acknowledged",
        labels: &[],
    };

    pub const MAC_UPLINKS_FAILED: MetricDef = MetricDef {
        name: "lorasim.mac.uplinks_failed",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Confirmed uplinks abandoned",
        labels: &["reason"],
    };

    pub const MAC_DUTY_CYCLE_DELAY: MetricDef = MetricDef {
        name: "lorasim.mac.duty_cycle_delay",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Seconds,
        description: "Time a transmission was postponed by the duty cycle",
        labels: &[],
    };

    pub const MAC_ACK_ATTEMPTS: MetricDef = MetricDef {
        name: "lorasim.mac.ack_attempts",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Count,
        description: "Transmissions needed until an uplink was acknowledged",
        labels: &[],
    };

    // ========== Jammer ==========

    pub const JAMMER_BURSTS: MetricDef = MetricDef {
        name: "lorasim.jammer.bursts",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Jamming bursts transmitted",
        labels: &["profile"],
    };

    // ========== Network server ==========

    pub const SERVER_UPLINKS: MetricDef = MetricDef {
        name: "lorasim.server.uplinks",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Distinct uplink packets received",
        labels: &[],
    };

    pub const SERVER_DUPLICATES: MetricDef = MetricDef {
        name: "lorasim.server.duplicates",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Receptions of an already known packet",
        labels: &["cause"],
    };

    pub const SERVER_DOWNLINKS_SCHEDULED: MetricDef = MetricDef {
        name: "lorasim.server.downlinks_scheduled",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "ACKs handed to a gateway",
        labels: &["window"],
    };

    pub const SERVER_DOWNLINKS_DROPPED: MetricDef = MetricDef {
        name: "lorasim.server.downlinks_dropped",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "ACKs no gateway could serve",
        labels: &[],
    };

    pub const SERVER_ANOMALIES: MetricDef = MetricDef {
        name: "lorasim.server.anomalies",
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        description: "Inter-arrival times outside the EWMA band",
        labels: &[],
    };

    pub const SERVER_INTER_ARRIVAL: MetricDef = MetricDef {
        name: "lorasim.server.inter_arrival",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Seconds,
        description: "Time between distinct uplinks of a device",
        labels: &[],
    };

    // ========== Timing ==========

    pub const SIMULATION_STEP_TIME: MetricDef = MetricDef {
        name: "lorasim.timing.step_time",
        kind: MetricKind::Histogram,
        unit: MetricUnit::Microseconds,
        description: "Wall-clock time spent dispatching one event",
        labels: &[],
    };

    /// Every definition, in listing order.
    pub const ALL: &[MetricDef] = &[
        PHY_TX_PACKETS,
        PHY_TX_AIRTIME,
        PHY_TX_PACKET_SIZE,
        PHY_CANNOT_SEND,
        PHY_RX_PACKETS,
        PHY_RX_INTERFERED,
        PHY_RX_UNDER_SENSITIVITY,
        PHY_RX_WRONG_FREQUENCY,
        PHY_RX_WRONG_SF,
        PHY_RX_WRONG_STATE,
        PHY_RX_SINR,
        PHY_RX_RSSI,
        PHY_CAPTURE_EFFECT,
        GATEWAY_NO_MORE_RECEIVERS,
        GATEWAY_LOST_TRANSMITTING,
        GATEWAY_ACTIVE_RECEPTIONS,
        GATEWAY_FORWARDED,
        ENERGY_CONSUMED,
        ENERGY_DEAD_DEVICES,
        ENERGY_REMAINING,
        MAC_UPLINKS_GENERATED,
        MAC_RETRANSMISSIONS,
        MAC_UPLINKS_ACKED,
        MAC_UPLINKS_FAILED,
        MAC_DUTY_CYCLE_DELAY,
        MAC_ACK_ATTEMPTS,
        JAMMER_BURSTS,
        SERVER_UPLINKS,
        SERVER_DUPLICATES,
        SERVER_DOWNLINKS_SCHEDULED,
        SERVER_DOWNLINKS_DROPPED,
        SERVER_ANOMALIES,
        SERVER_INTER_ARRIVAL,
        SIMULATION_STEP_TIME,
    ];

    /// Look up a definition by name.
    pub fn find(name: &str) -> Option<&'static MetricDef> {
        ALL.iter().find(|d| d.name == name)
    }
}
