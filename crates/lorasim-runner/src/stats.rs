//! Run statistics, aggregated from the notification stream.

use lorasim_common::{EnergyConsumption, EntityId, NodeRole, Notification, NotificationRecord};
use lorasim_model::NodeInfo;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Per-node statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    /// Node role label.
    pub role: String,
    /// Transmissions started.
    pub tx: u64,
    /// Transmission requests refused.
    pub cannot_send: u64,
    /// Frames received correctly.
    pub rx: u64,
    /// Frames lost at this receiver, by reason.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub lost: BTreeMap<String, u64>,
    /// Frames saved by the capture effect.
    pub captures: u64,
    /// Confirmed uplinks sent again.
    pub retransmissions: u64,
    /// Confirmed uplinks acknowledged.
    pub uplinks_acked: u64,
    /// Confirmed uplinks abandoned.
    pub uplinks_failed: u64,
    /// Reactive bursts triggered.
    pub jammer_triggers: u64,
    /// Time the battery ran out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub died_at_s: Option<f64>,
    /// Energy spent, end devices only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<EnergyConsumption>,
}

/// Statistics of a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Events dispatched.
    pub total_events: u64,
    /// Transmissions started by any radio.
    pub packets_transmitted: u64,
    /// Distinct uplink packets sent by end devices.
    pub uplinks_sent: u64,
    /// Frames received by gateways.
    pub packets_received: u64,
    /// Frames destroyed by interference at any receiver.
    pub packets_interfered: u64,
    /// Frames lost at any receiver for any reason.
    pub packets_lost: u64,
    /// Distinct uplinks seen by the network server.
    pub uplinks_received: u64,
    /// Copies of an uplink delivered by more than one gateway.
    pub gateway_duplicates: u64,
    /// Confirmed uplinks sent again.
    pub retransmissions: u64,
    /// Confirmed uplinks acknowledged.
    pub uplinks_acked: u64,
    /// Confirmed uplinks abandoned.
    pub uplinks_failed: u64,
    /// ACKs handed to a gateway.
    pub downlinks_scheduled: u64,
    /// ACKs no gateway could send.
    pub downlinks_dropped: u64,
    /// Inter-arrival anomalies.
    pub anomalies: u64,
    /// Devices whose battery ran out.
    pub dead_devices: u64,
    /// `uplinks_received / uplinks_sent`.
    pub delivery_ratio: f64,
    /// Final simulation time.
    pub simulation_time_us: u64,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
    /// Per-node breakdown, by node name.
    pub nodes: BTreeMap<String, NodeStats>,
}

/// Aggregates notifications into [`SimulationStats`].
#[derive(Debug, Default)]
pub struct SimulationMetrics {
    names: BTreeMap<EntityId, String>,
    stats: SimulationStats,
    sent: BTreeSet<(EntityId, u64)>,
}

impl SimulationMetrics {
    /// Create an aggregator with one entry per node.
    pub fn new(node_infos: &[NodeInfo]) -> Self {
        let mut metrics = SimulationMetrics::default();
        for info in node_infos {
            metrics.names.insert(info.entity_id, info.name.clone());
            metrics.stats.nodes.insert(
                info.name.clone(),
                NodeStats {
                    role: info.role.as_label().to_string(),
                    ..NodeStats::default()
                },
            );
        }
        metrics
    }

    /// Name of a node.
    pub fn node_name(&self, id: EntityId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Count one dispatched event.
    pub fn count_event(&mut self) {
        self.stats.total_events += 1;
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Mutable per-node entry.
    pub fn node_mut(&mut self, id: EntityId) -> Option<&mut NodeStats> {
        let name = self.names.get(&id)?;
        self.stats.nodes.get_mut(name)
    }

    /// Fold one notification into the totals.
    pub fn observe(&mut self, record: &NotificationRecord) {
        let n = &record.notification;
        if let Some(reason) = n.loss_reason() {
            self.stats.packets_lost += 1;
            if matches!(n, Notification::LostBecauseInterference { .. }) {
                self.stats.packets_interfered += 1;
            }
            if let Some(node) = self.node_mut(n.subject()) {
                *node.lost.entry(reason.to_string()).or_insert(0) += 1;
            }
            return;
        }

        match *n {
            Notification::StartSending {
                node, role, packet_id, ..
            } => {
                self.stats.packets_transmitted += 1;
                if role == NodeRole::EndDevice && self.sent.insert((node, packet_id)) {
                    self.stats.uplinks_sent += 1;
                }
                if let Some(s) = self.node_mut(node) {
                    s.tx += 1;
                }
            }
            Notification::CannotSend { node, .. } => {
                if let Some(s) = self.node_mut(node) {
                    s.cannot_send += 1;
                }
            }
            Notification::ReceivedPacket { receiver, role, .. } => {
                if role == NodeRole::Gateway {
                    self.stats.packets_received += 1;
                }
                if let Some(s) = self.node_mut(receiver) {
                    s.rx += 1;
                }
            }
            Notification::CaptureEffect { receiver, .. } => {
                if let Some(s) = self.node_mut(receiver) {
                    s.captures += 1;
                }
            }
            Notification::DeadDevice { node, .. } => {
                self.stats.dead_devices += 1;
                let at = record.time.as_secs_f64();
                if let Some(s) = self.node_mut(node) {
                    s.died_at_s = Some(at);
                }
            }
            Notification::UplinkAcked { node, .. } => {
                self.stats.uplinks_acked += 1;
                if let Some(s) = self.node_mut(node) {
                    s.uplinks_acked += 1;
                }
            }
            Notification::UplinkFailed { node, .. } => {
                self.stats.uplinks_failed += 1;
                if let Some(s) = self.node_mut(node) {
                    s.uplinks_failed += 1;
                }
            }
            Notification::Retransmission { node, .. } => {
                self.stats.retransmissions += 1;
                if let Some(s) = self.node_mut(node) {
                    s.retransmissions += 1;
                }
            }
            Notification::JammerTriggered { jammer, .. } => {
                if let Some(s) = self.node_mut(jammer) {
                    s.jammer_triggers += 1;
                }
            }
            Notification::UplinkReceived { .. } => self.stats.uplinks_received += 1,
            Notification::DuplicateUplink { retransmission, .. } => {
                if !retransmission {
                    self.stats.gateway_duplicates += 1;
                }
            }
            Notification::DownlinkScheduled { .. } => self.stats.downlinks_scheduled += 1,
            Notification::DownlinkDropped { .. } => self.stats.downlinks_dropped += 1,
            Notification::InterArrivalAnomaly { .. } => self.stats.anomalies += 1,
            _ => {}
        }
    }

    /// Close the run and return the final statistics.
    pub fn finish(&mut self, simulation_time_us: u64, wall_time_ms: u64) -> SimulationStats {
        self.stats.simulation_time_us = simulation_time_us;
        self.stats.wall_time_ms = wall_time_ms;
        self.stats.delivery_ratio = if self.stats.uplinks_sent == 0 {
            0.0
        } else {
            self.stats.uplinks_received as f64 / self.stats.uplinks_sent as f64
        };
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::{Position, SimTime};

    fn infos() -> Vec<NodeInfo> {
        vec![
            NodeInfo {
                name: "gw".to_string(),
                role: NodeRole::Gateway,
                entity_id: EntityId(2),
                position: Position::default(),
            },
            NodeInfo {
                name: "ed".to_string(),
                role: NodeRole::EndDevice,
                entity_id: EntityId(3),
                position: Position::default(),
            },
        ]
    }

    fn record(notification: Notification) -> NotificationRecord {
        NotificationRecord {
            time: SimTime::from_secs(5.0),
            notification,
        }
    }

    fn start_sending(packet_id: u64, tx_attempt: u8) -> Notification {
        Notification::StartSending {
            node: EntityId(3),
            role: NodeRole::EndDevice,
            packet_id,
            spreading_factor: 7,
            frequency_hz: 868_100_000,
            tx_power_dbm: 14.0,
            duration: SimTime::from_millis(50),
            tx_attempt,
        }
    }

    #[test]
    fn test_retransmissions_count_one_uplink() {
        let mut metrics = SimulationMetrics::new(&infos());
        metrics.observe(&record(start_sending(1, 1)));
        metrics.observe(&record(start_sending(1, 2)));
        metrics.observe(&record(start_sending(2, 1)));
        metrics.observe(&record(Notification::UplinkReceived {
            device: EntityId(3),
            packet_id: 1,
            tx_attempt: 2,
            gateway: EntityId(2),
        }));

        let stats = metrics.finish(10_000_000, 1);
        assert_eq!(stats.packets_transmitted, 3);
        assert_eq!(stats.uplinks_sent, 2);
        assert_eq!(stats.uplinks_received, 1);
        assert_eq!(stats.delivery_ratio, 0.5);
        assert_eq!(stats.nodes["ed"].tx, 3);
    }

    #[test]
    fn test_losses_by_reason() {
        let mut metrics = SimulationMetrics::new(&infos());
        metrics.observe(&record(Notification::LostBecauseInterference {
            receiver: EntityId(2),
            role: NodeRole::Gateway,
            sender: EntityId(3),
            packet_id: 1,
            spreading_factor: 7,
            colliding_sf: Some(7),
            frequency_hz: 868_100_000,
            collision: None,
            on_preamble: false,
        }));
        metrics.observe(&record(Notification::LostBecauseNoMoreReceivers {
            gateway: EntityId(2),
            sender: EntityId(3),
            packet_id: 2,
            spreading_factor: 7,
            frequency_hz: 868_100_000,
        }));

        let stats = metrics.stats();
        assert_eq!(stats.packets_lost, 2);
        assert_eq!(stats.packets_interfered, 1);
        assert_eq!(stats.nodes["gw"].lost["interference"], 1);
        assert_eq!(stats.nodes["gw"].lost["no_more_receivers"], 1);
    }

    #[test]
    fn test_dead_device_time() {
        let mut metrics = SimulationMetrics::new(&infos());
        metrics.observe(&record(Notification::DeadDevice {
            node: EntityId(3),
            consumption: EnergyConsumption::default(),
        }));
        assert_eq!(metrics.stats().dead_devices, 1);
        assert_eq!(metrics.stats().nodes["ed"].died_at_s, Some(5.0));
    }

    #[test]
    fn test_unknown_entity_ignored_per_node() {
        let mut metrics = SimulationMetrics::new(&infos());
        metrics.observe(&record(Notification::DownlinkDropped {
            device: EntityId(99),
            packet_id: 1,
        }));
        assert_eq!(metrics.stats().downlinks_dropped, 1);
        assert_eq!(metrics.node_name(EntityId(99)), None);
    }
}
