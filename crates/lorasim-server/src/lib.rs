//! # lorasim-server
//!
//! A simplified LoRaWAN network server.
//!
//! The server receives uplinks forwarded by every gateway that decoded them,
//! removes duplicates, answers confirmed uplinks with an ACK through the best
//! gateway in RX1 or RX2, and watches per-device inter-arrival times for
//! anomalies.

pub mod ewma;

pub use ewma::{Anomaly, EwmaConfig, EwmaTracker};

use lorasim_common::{
    DownlinkRequestEvent, Entity, EntityId, Event, EventPayload, FrameKind, LoraFrame, Notification, SimContext,
    SimError, SimTime, UplinkForwardedEvent,
};
use lorasim_mac::{ACK_FRAME_BYTES, RECEIVE_DELAY_1, RECEIVE_DELAY_2, RX2_FREQUENCY_HZ, RX2_SPREADING_FACTOR};
use lorasim_metrics::{metric_defs, metrics, MetricLabels};
use lorasim_phy::LoraTxParams;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace};

// ============================================================================
// Configuration
// ============================================================================

/// Network server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkServerConfig {
    /// How long before RX1 the ACK gateway is chosen, seconds.
    pub ack_decision_advance_s: f64,
    /// Downlink transmit power in dBm.
    pub downlink_tx_power_dbm: f64,
    /// Inter-arrival tracking.
    pub ewma: EwmaConfig,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        NetworkServerConfig {
            ack_decision_advance_s: 0.1,
            downlink_tx_power_dbm: 14.0,
            ewma: EwmaConfig::default(),
        }
    }
}

/// Counters kept by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    /// Distinct packets.
    pub uplinks: u64,
    /// Same transmission through another gateway.
    pub gateway_duplicates: u64,
    /// Later transmissions of a known packet.
    pub retransmissions: u64,
    /// ACKs scheduled in RX1.
    pub acks_rx1: u64,
    /// ACKs scheduled in RX2.
    pub acks_rx2: u64,
    /// ACKs no gateway could carry.
    pub acks_dropped: u64,
    /// Inter-arrival anomalies.
    pub anomalies: u64,
}

/// One gateway's copy of an uplink transmission.
#[derive(Debug, Clone, Copy)]
struct Reception {
    gateway: EntityId,
    rx_power_dbm: f64,
}

/// A confirmed transmission waiting for its ACK decision.
#[derive(Debug, Clone)]
struct PendingAck {
    device: EntityId,
    packet_id: u64,
    frequency_hz: u32,
    spreading_factor: u8,
    uplink_end: SimTime,
    receptions: Vec<Reception>,
}

impl PendingAck {
    /// Strongest reception, lowest gateway id on ties.
    fn best_gateway(&self) -> Option<EntityId> {
        self.receptions
            .iter()
            .max_by(|a, b| {
                a.rx_power_dbm
                    .total_cmp(&b.rx_power_dbm)
                    .then_with(|| b.gateway.cmp(&a.gateway))
            })
            .map(|r| r.gateway)
    }
}

// ============================================================================
// Network Server Entity
// ============================================================================

/// Network server entity.
pub struct NetworkServer {
    id: EntityId,
    config: NetworkServerConfig,
    /// Attempts seen per `(device, packet_id)`.
    seen: BTreeMap<(EntityId, u64), BTreeSet<u8>>,
    /// ACK decisions by timer id.
    pending_acks: BTreeMap<u64, PendingAck>,
    /// Timer id of the pending decision per `(device, packet_id, attempt)`.
    decision_index: BTreeMap<(EntityId, u64, u8), u64>,
    next_decision: u64,
    next_downlink_id: u64,
    /// Downlink airtime already booked per gateway.
    gateway_busy: BTreeMap<EntityId, Vec<(SimTime, SimTime)>>,
    trackers: BTreeMap<EntityId, EwmaTracker>,
    stats: ServerStats,
    metric_labels: MetricLabels,
}

impl NetworkServer {
    /// Create a network server.
    pub fn new(id: EntityId, config: NetworkServerConfig) -> Self {
        NetworkServer {
            id,
            config,
            seen: BTreeMap::new(),
            pending_acks: BTreeMap::new(),
            decision_index: BTreeMap::new(),
            next_decision: 0,
            next_downlink_id: 1,
            gateway_busy: BTreeMap::new(),
            trackers: BTreeMap::new(),
            stats: ServerStats::default(),
            metric_labels: MetricLabels::new(id.to_string(), "network_server"),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Inter-arrival tracker of `device`.
    pub fn tracker(&self, device: EntityId) -> Option<&EwmaTracker> {
        self.trackers.get(&device)
    }

    // ========================================================================
    // Uplinks
    // ========================================================================

    fn on_uplink(&mut self, up: &UplinkForwardedEvent, ctx: &mut SimContext) {
        if up.frame.kind != FrameKind::Uplink {
            return;
        }
        let device = up.frame.source;
        let packet_id = up.frame.packet_id;
        let attempt = up.frame.tx_attempt;
        let labels = self.metric_labels.to_labels();
        let attempts = self.seen.entry((device, packet_id)).or_default();

        if attempts.contains(&attempt) {
            trace!(%device, packet_id, attempt, gateway = %up.gateway, "same transmission via another gateway");
            self.stats.gateway_duplicates += 1;
            ctx.notify(Notification::DuplicateUplink {
                device,
                packet_id,
                tx_attempt: attempt,
                gateway: up.gateway,
                retransmission: false,
            });
            let mut l = labels;
            l.push(("cause", "gateway".to_string()));
            metrics::counter!(metric_defs::SERVER_DUPLICATES.name, &l).increment(1);
            if let Some(decision) = self.decision_index.get(&(device, packet_id, attempt)) {
                if let Some(pending) = self.pending_acks.get_mut(decision) {
                    pending.receptions.push(Reception {
                        gateway: up.gateway,
                        rx_power_dbm: up.rx_power_dbm,
                    });
                }
            }
            return;
        }

        let known = !attempts.is_empty();
        attempts.insert(attempt);
        if known {
            debug!(%device, packet_id, attempt, "retransmission of a known packet");
            self.stats.retransmissions += 1;
            ctx.notify(Notification::DuplicateUplink {
                device,
                packet_id,
                tx_attempt: attempt,
                gateway: up.gateway,
                retransmission: true,
            });
            let mut l = labels;
            l.push(("cause", "retransmission".to_string()));
            metrics::counter!(metric_defs::SERVER_DUPLICATES.name, &l).increment(1);
        } else {
            self.stats.uplinks += 1;
            ctx.notify(Notification::UplinkReceived {
                device,
                packet_id,
                tx_attempt: attempt,
                gateway: up.gateway,
            });
            metrics::counter!(metric_defs::SERVER_UPLINKS.name, &labels).increment(1);
            self.track_arrival(device, ctx);
        }

        if up.frame.needs_ack {
            self.plan_ack(up, ctx);
        }
    }

    fn track_arrival(&mut self, device: EntityId, ctx: &mut SimContext) {
        let config = self.config.ewma;
        let tracker = self.trackers.entry(device).or_insert_with(|| EwmaTracker::new(config));
        let (interval, anomaly) = tracker.observe(ctx.time());
        let labels = self.metric_labels.to_labels();
        if let Some(interval) = interval {
            metrics::histogram!(metric_defs::SERVER_INTER_ARRIVAL.name, &labels).record(interval);
        }
        if let Some(anomaly) = anomaly {
            info!(
                %device,
                interval_s = anomaly.interval_s,
                expected_s = anomaly.expected_s,
                "inter-arrival anomaly"
            );
            self.stats.anomalies += 1;
            ctx.notify(Notification::InterArrivalAnomaly {
                device,
                interval_s: anomaly.interval_s,
                expected_s: anomaly.expected_s,
                deviation_s: anomaly.deviation_s,
            });
            metrics::counter!(metric_defs::SERVER_ANOMALIES.name, &labels).increment(1);
        }
    }

    // ========================================================================
    // ACK scheduling
    // ========================================================================

    fn plan_ack(&mut self, up: &UplinkForwardedEvent, ctx: &mut SimContext) {
        let decision = self.next_decision;
        self.next_decision += 1;
        let device = up.frame.source;
        self.decision_index
            .insert((device, up.frame.packet_id, up.frame.tx_attempt), decision);
        self.pending_acks.insert(
            decision,
            PendingAck {
                device,
                packet_id: up.frame.packet_id,
                frequency_hz: up.tag.frequency_hz,
                spreading_factor: up.tag.spreading_factor,
                uplink_end: up.end_time,
                receptions: vec![Reception {
                    gateway: up.gateway,
                    rx_power_dbm: up.rx_power_dbm,
                }],
            },
        );
        let advance = SimTime::from_secs(self.config.ack_decision_advance_s);
        let decide_at = (up.end_time + RECEIVE_DELAY_1).checked_sub(advance).unwrap_or(SimTime::ZERO);
        ctx.post_at(decide_at, vec![self.id], EventPayload::Timer { timer_id: decision });
    }

    fn gateway_free(&self, gateway: EntityId, start: SimTime, end: SimTime) -> bool {
        self.gateway_busy
            .get(&gateway)
            .map_or(true, |booked| booked.iter().all(|&(s, e)| end <= s || e <= start))
    }

    /// Forget bookings that are over by `now`.
    fn release_past_downlinks(&mut self, now: SimTime) {
        for booked in self.gateway_busy.values_mut() {
            booked.retain(|&(_, end)| end > now);
        }
        self.gateway_busy.retain(|_, booked| !booked.is_empty());
    }

    fn decide_ack(&mut self, decision: u64, ctx: &mut SimContext) {
        let Some(pending) = self.pending_acks.remove(&decision) else {
            return;
        };
        self.decision_index.retain(|_, d| *d != decision);
        self.release_past_downlinks(ctx.time());
        let Some(gateway) = pending.best_gateway() else {
            return;
        };

        let windows = [
            (
                1u8,
                pending.uplink_end + RECEIVE_DELAY_1,
                pending.frequency_hz,
                pending.spreading_factor,
            ),
            (2u8, pending.uplink_end + RECEIVE_DELAY_2, RX2_FREQUENCY_HZ, RX2_SPREADING_FACTOR),
        ];
        for (window, send_at, frequency_hz, spreading_factor) in windows {
            let airtime = LoraTxParams::with_sf(spreading_factor).on_air_time(ACK_FRAME_BYTES);
            if !self.gateway_free(gateway, send_at, send_at + airtime) {
                trace!(%gateway, window, "gateway busy for this window");
                continue;
            }
            self.gateway_busy
                .entry(gateway)
                .or_default()
                .push((send_at, send_at + airtime));
            self.schedule_downlink(&pending, gateway, window, send_at, frequency_hz, spreading_factor, ctx);
            return;
        }

        debug!(device = %pending.device, packet_id = pending.packet_id, "no window left for the ACK");
        self.stats.acks_dropped += 1;
        ctx.notify(Notification::DownlinkDropped {
            device: pending.device,
            packet_id: pending.packet_id,
        });
        metrics::counter!(metric_defs::SERVER_DOWNLINKS_DROPPED.name, &self.metric_labels.to_labels()).increment(1);
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_downlink(
        &mut self,
        pending: &PendingAck,
        gateway: EntityId,
        window: u8,
        send_at: SimTime,
        frequency_hz: u32,
        spreading_factor: u8,
        ctx: &mut SimContext,
    ) {
        let frame = LoraFrame {
            packet_id: self.next_downlink_id,
            kind: FrameKind::Ack,
            source: gateway,
            destination: Some(pending.device),
            size_bytes: ACK_FRAME_BYTES,
            needs_ack: false,
            tx_attempt: 1,
            ack_for: Some(pending.packet_id),
        };
        self.next_downlink_id += 1;
        match window {
            1 => self.stats.acks_rx1 += 1,
            _ => self.stats.acks_rx2 += 1,
        }
        debug!(%gateway, device = %pending.device, packet_id = pending.packet_id, window, "ACK scheduled");
        ctx.notify(Notification::DownlinkScheduled {
            gateway,
            device: pending.device,
            packet_id: pending.packet_id,
            window,
            send_at,
        });
        let mut labels = self.metric_labels.to_labels();
        labels.push(("window", window.to_string()));
        metrics::counter!(metric_defs::SERVER_DOWNLINKS_SCHEDULED.name, &labels).increment(1);

        ctx.post_immediate(
            vec![gateway],
            EventPayload::DownlinkRequest(DownlinkRequestEvent {
                device: pending.device,
                frame,
                send_at,
                frequency_hz,
                spreading_factor,
                tx_power_dbm: self.config.downlink_tx_power_dbm,
                window,
            }),
        );
    }
}

impl Entity for NetworkServer {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::UplinkForwarded(up) => self.on_uplink(up, ctx),
            EventPayload::Timer { timer_id } => self.decide_ack(*timer_id, ctx),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::{EventId, NodeRole, NotificationRecord, PacketTag};

    const SERVER: EntityId = EntityId(2);
    const DEVICE: EntityId = EntityId(10);
    const F1: u32 = 868_300_000;

    fn uplink(gateway: u64, packet_id: u64, attempt: u8, rx_power_dbm: f64, needs_ack: bool) -> Event {
        let end_time = SimTime::from_secs(5.0);
        Event {
            id: EventId(0),
            time: end_time,
            source: EntityId(gateway),
            targets: vec![SERVER],
            payload: EventPayload::UplinkForwarded(UplinkForwardedEvent {
                gateway: EntityId(gateway),
                frame: LoraFrame {
                    packet_id,
                    kind: FrameKind::Uplink,
                    source: DEVICE,
                    destination: None,
                    size_bytes: 33,
                    needs_ack,
                    tx_attempt: attempt,
                    ack_for: None,
                },
                tag: PacketTag {
                    spreading_factor: 9,
                    frequency_hz: F1,
                    preamble_s: 0.05,
                    sender: DEVICE,
                    sender_role: NodeRole::EndDevice,
                    tx_power_dbm: 14.0,
                    packet_id,
                },
                rx_power_dbm,
                sinr_db: 10.0,
                end_time,
            }),
        }
    }

    fn kinds(records: &[NotificationRecord]) -> Vec<&'static str> {
        records.iter().map(|r| r.notification.kind()).collect()
    }

    /// Fire the pending decision timer and return the downlink request.
    fn decide(server: &mut NetworkServer, ctx: &mut SimContext) -> Option<(EntityId, DownlinkRequestEvent)> {
        let timer = ctx
            .take_pending_events()
            .into_iter()
            .find(|e| matches!(e.payload, EventPayload::Timer { .. }))?;
        ctx.set_time(timer.time);
        server.handle_event(&timer, ctx).unwrap();
        ctx.take_pending_events().into_iter().find_map(|e| match e.payload {
            EventPayload::DownlinkRequest(req) => Some((e.targets[0], req)),
            _ => None,
        })
    }

    #[test]
    fn test_duplicates_from_several_gateways() {
        let mut server = NetworkServer::new(SERVER, NetworkServerConfig::default());
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_secs(5.0));
        for gw in [20, 21, 22] {
            server.handle_event(&uplink(gw, 1, 1, -100.0, false), &mut ctx).unwrap();
        }
        server.handle_event(&uplink(20, 1, 2, -100.0, false), &mut ctx).unwrap();

        let records = ctx.take_notifications();
        assert_eq!(
            kinds(&records),
            vec!["uplink_received", "duplicate_uplink", "duplicate_uplink", "duplicate_uplink"]
        );
        assert!(matches!(
            records[3].notification,
            Notification::DuplicateUplink { retransmission: true, tx_attempt: 2, .. }
        ));
        assert_eq!(server.stats().uplinks, 1);
        assert_eq!(server.stats().gateway_duplicates, 2);
        assert_eq!(server.stats().retransmissions, 1);
    }

    #[test]
    fn test_ack_goes_through_strongest_gateway_in_rx1() {
        let mut server = NetworkServer::new(SERVER, NetworkServerConfig::default());
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_secs(5.0));
        server.handle_event(&uplink(20, 1, 1, -110.0, true), &mut ctx).unwrap();
        server.handle_event(&uplink(21, 1, 1, -95.0, true), &mut ctx).unwrap();
        server.handle_event(&uplink(22, 1, 1, -105.0, true), &mut ctx).unwrap();

        let (target, request) = decide(&mut server, &mut ctx).unwrap();
        assert_eq!(ctx.time(), SimTime::from_secs(5.9));
        assert_eq!(target, EntityId(21));
        assert_eq!(request.window, 1);
        assert_eq!(request.send_at, SimTime::from_secs(6.0));
        assert_eq!(request.frequency_hz, F1);
        assert_eq!(request.spreading_factor, 9);
        assert_eq!(request.frame.destination, Some(DEVICE));
        assert_eq!(request.frame.ack_for, Some(1));
    }

    #[test]
    fn test_busy_gateway_falls_back_to_rx2_then_drops() {
        let mut server = NetworkServer::new(SERVER, NetworkServerConfig::default());
        let mut ctx = SimContext::new(1);
        ctx.set_time(SimTime::from_secs(5.0));
        // Three devices whose uplinks end at the same time, heard by one gateway.
        let mut requests = Vec::new();
        for device in [10, 11, 12] {
            let mut event = uplink(20, 1, 1, -100.0, true);
            if let EventPayload::UplinkForwarded(up) = &mut event.payload {
                up.frame.source = EntityId(device);
            }
            server.handle_event(&event, &mut ctx).unwrap();
        }
        let timers: Vec<Event> = ctx.take_pending_events();
        for timer in timers {
            ctx.set_time(timer.time);
            server.handle_event(&timer, &mut ctx).unwrap();
            for e in ctx.take_pending_events() {
                if let EventPayload::DownlinkRequest(req) = e.payload {
                    requests.push(req.window);
                }
            }
        }
        assert_eq!(requests, vec![1, 2]);
        assert_eq!(server.stats().acks_dropped, 1);
        assert!(ctx
            .take_notifications()
            .iter()
            .any(|r| matches!(r.notification, Notification::DownlinkDropped { device: EntityId(12), .. })));
    }

    #[test]
    fn test_past_downlink_bookings_are_released() {
        let mut server = NetworkServer::new(SERVER, NetworkServerConfig::default());
        let mut ctx = SimContext::new(1);
        for packet_id in 1..=100u64 {
            let end_time = SimTime::from_secs(10.0 * packet_id as f64);
            let mut event = uplink(20, packet_id, 1, -100.0, true);
            if let EventPayload::UplinkForwarded(up) = &mut event.payload {
                up.end_time = end_time;
            }
            ctx.set_time(end_time);
            server.handle_event(&event, &mut ctx).unwrap();
            let (target, request) = decide(&mut server, &mut ctx).unwrap();
            assert_eq!(target, EntityId(20));
            assert_eq!(request.window, 1);
        }
        assert_eq!(server.stats().acks_rx1, 100);
        assert_eq!(server.gateway_busy[&EntityId(20)].len(), 1);
    }

    #[test]
    fn test_unconfirmed_uplinks_get_no_ack() {
        let mut server = NetworkServer::new(SERVER, NetworkServerConfig::default());
        let mut ctx = SimContext::new(1);
        server.handle_event(&uplink(20, 1, 1, -100.0, false), &mut ctx).unwrap();
        assert!(decide(&mut server, &mut ctx).is_none());
    }

    #[test]
    fn test_inter_arrival_anomaly_reported() {
        let mut server = NetworkServer::new(SERVER, NetworkServerConfig::default());
        let mut ctx = SimContext::new(1);
        for i in 0..10u64 {
            ctx.set_time(SimTime::from_secs(i as f64 * 60.0));
            server.handle_event(&uplink(20, i + 1, 1, -100.0, false), &mut ctx).unwrap();
        }
        ctx.set_time(SimTime::from_secs(9.0 * 60.0 + 2.0));
        server.handle_event(&uplink(20, 11, 1, -100.0, false), &mut ctx).unwrap();
        let anomalies: Vec<_> = ctx
            .take_notifications()
            .into_iter()
            .filter(|r| r.notification.kind() == "inter_arrival_anomaly")
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(server.stats().anomalies, 1);
        assert_eq!(server.tracker(DEVICE).unwrap().samples(), 10);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: NetworkServerConfig = serde_yaml::from_str("ewma:\n  k: 3.0\n").unwrap();
        assert_eq!(config.ewma.k, 3.0);
        assert_eq!(config.ewma.alpha, 0.125);
        assert_eq!(config.ack_decision_advance_s, 0.1);
    }
}
